//! Canonical FHIR version resolution (spec §6) and the base-library package
//! picker (spec §4.10).

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::explorer::PackageExplorer;
use crate::package_id::PackageId;

/// A canonical short-form FHIR version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalVersion {
    Stu3,
    R4,
    R4B,
    R5,
}

impl CanonicalVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalVersion::Stu3 => "STU3",
            CanonicalVersion::R4 => "R4",
            CanonicalVersion::R4B => "R4B",
            CanonicalVersion::R5 => "R5",
        }
    }

    /// The base-library package this canonical version resolves to.
    pub fn base_library(self) -> PackageId {
        match self {
            CanonicalVersion::Stu3 => PackageId::new("hl7.fhir.r3.core", "3.0.2"),
            CanonicalVersion::R4 => PackageId::new("hl7.fhir.r4.core", "4.0.1"),
            CanonicalVersion::R4B => PackageId::new("hl7.fhir.r4b.core", "4.3.0"),
            CanonicalVersion::R5 => PackageId::new("hl7.fhir.r5.core", "5.0.0"),
        }
    }
}

/// Resolve a version identifier from the accepted set (spec §6). An unknown
/// input is a fatal config error (`version-unknown`).
pub fn canonical_version(input: &str) -> Result<CanonicalVersion> {
    match input {
        "3.0.2" | "3.0" | "R3" | "STU3" => Ok(CanonicalVersion::Stu3),
        "4.0.1" | "4.0" | "R4" => Ok(CanonicalVersion::R4),
        "4.3.0" | "4.3" | "R4B" => Ok(CanonicalVersion::R4B),
        "5.0.0" | "5.0" | "R5" => Ok(CanonicalVersion::R5),
        other => Err(Error::VersionUnknown(other.to_string())),
    }
}

fn base_library_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z0-9]+\.[a-z0-9]+\.r\d+\.core$").expect("valid base-library regex")
    })
}

/// True if `package_id` matches the fixed base-library naming pattern
/// (`<vendor>.<framework>.r<digits>.core`).
pub fn is_base_library_id(package_id: &str) -> bool {
    base_library_pattern().is_match(package_id)
}

/// Normalise the historical `hl7.fhir.r4.core@4.0.0` misnumbering to `4.0.1`,
/// regardless of ecosystem-specific naming (spec §4.10).
pub fn normalize_base_library_version(pkg: &PackageId) -> PackageId {
    if pkg.id == "hl7.fhir.r4.core" && pkg.version == "4.0.0" {
        PackageId::new(pkg.id.clone(), "4.0.1")
    } else {
        pkg.clone()
    }
}

/// Translate a `compatibleVersions` manifest entry to its canonical
/// base-library package (spec §4.10 step 3), via the fixed table in §6.
pub fn compatible_version_to_base_library(entry: &str) -> Option<PackageId> {
    canonical_version(entry).ok().map(|v| v.base_library())
}

/// Pick the base-library package to use for type lookups when generating a
/// snapshot for a profile belonging to `profile_pkg` (spec §4.10).
pub async fn resolve_base_library(
    explorer: &dyn PackageExplorer,
    profile_pkg: &PackageId,
    default_version: CanonicalVersion,
) -> Result<PackageId> {
    // Step 1: the profile's own package is itself a base library.
    if is_base_library_id(&profile_pkg.id) {
        return Ok(normalize_base_library_version(profile_pkg));
    }

    // Step 2: direct dependency set filtered to base-library ids.
    let deps = explorer.direct_dependencies(profile_pkg).await?;
    let mut base_deps: Vec<PackageId> = deps
        .into_iter()
        .filter(|d| is_base_library_id(&d.id))
        .collect();
    base_deps.dedup();

    if base_deps.len() == 1 {
        return Ok(normalize_base_library_version(&base_deps[0]));
    }
    if base_deps.len() > 1 {
        tracing::warn!(
            %profile_pkg,
            default = default_version.as_str(),
            "multiple base-library candidates; falling back to configured default"
        );
        return Ok(default_version.base_library());
    }

    // Step 3: manifest's declared compatibleVersions.
    let manifest = explorer.package_manifest(profile_pkg).await?;
    for entry in &manifest.compatible_versions {
        if let Some(base) = compatible_version_to_base_library(entry) {
            return Ok(base);
        }
    }

    // Step 4: configured default.
    Ok(default_version.base_library())
}
