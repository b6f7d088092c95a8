//! Package identity and the flexible reference syntax accepted in engine
//! configuration (spec §6): `{id, version}`, `id#version`, `id@version`, or
//! bare `id` (meaning "latest installed").

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A concrete, resolved `(package id, version)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageId {
    pub id: String,
    pub version: String,
}

impl PackageId {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.id, self.version)
    }
}

/// A package reference as it may appear in configuration, before the
/// "latest" case has been resolved against an installed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageRef {
    Exact(PackageId),
    Latest(String),
}

impl FromStr for PackageRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidPackageRef(s.to_string()));
        }
        for sep in ['#', '@'] {
            if let Some((id, version)) = s.split_once(sep) {
                if id.is_empty() || version.is_empty() {
                    return Err(Error::InvalidPackageRef(s.to_string()));
                }
                return Ok(PackageRef::Exact(PackageId::new(id, version)));
            }
        }
        Ok(PackageRef::Latest(s.to_string()))
    }
}
