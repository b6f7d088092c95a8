//! Engine configuration (spec §6). Parses nothing from argv or the
//! environment itself — that is `apps/cli`'s job.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fsg_context::{PackageId, PackageRef};

use crate::cache::CacheMode;
use crate::error::{Error, Result};
use crate::logger::{SnapshotLogger, TracingLogger};

/// Engine creation parameters.
pub struct EngineConfig {
    pub context: Vec<PackageRef>,
    pub cache_path: PathBuf,
    pub fhir_version: String,
    pub cache_mode: CacheMode,
    pub logger: Arc<dyn SnapshotLogger>,
}

impl EngineConfig {
    pub fn new(context: Vec<PackageRef>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            context,
            cache_path: cache_path.into(),
            fhir_version: "4.0.1".to_string(),
            cache_mode: CacheMode::Lazy,
            logger: Arc::new(TracingLogger),
        }
    }

    pub fn with_fhir_version(mut self, version: impl Into<String>) -> Self {
        self.fhir_version = version.into();
        self
    }

    pub fn with_cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn SnapshotLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn canonical_version(&self) -> Result<fsg_context::CanonicalVersion> {
        Ok(fsg_context::canonical_version(&self.fhir_version)?)
    }
}

/// Parse a `cacheMode` config value (spec §6 default `lazy`); an unknown
/// value is a fatal config error.
pub fn parse_cache_mode(input: &str) -> Result<CacheMode> {
    input.parse()
}

/// Resolves every `PackageRef` in `context` against the packages installed
/// under `cache_path` (spec §6 on-disk layout: `<name>#<version>/package/`).
pub fn resolve_context(context: &[PackageRef], cache_path: &Path) -> Result<Vec<PackageId>> {
    context.iter().map(|reference| resolve_package_ref(reference, cache_path)).collect()
}

/// Resolves a single `PackageRef`, picking the lexicographically greatest
/// installed version for a bare (`PackageRef::Latest`) reference.
pub fn resolve_package_ref(reference: &PackageRef, cache_path: &Path) -> Result<PackageId> {
    match reference {
        PackageRef::Exact(id) => Ok(id.clone()),
        PackageRef::Latest(name) => latest_installed_version(name, cache_path),
    }
}

fn latest_installed_version(name: &str, cache_path: &Path) -> Result<PackageId> {
    let prefix = format!("{name}#");
    let mut versions: Vec<String> = fs::read_dir(cache_path)
        .map_err(Error::CacheIo)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter_map(|dir_name| dir_name.strip_prefix(&prefix).map(str::to_string))
        .collect();

    versions.sort();
    let version = versions
        .pop()
        .ok_or_else(|| Error::Config(format!("no installed version of package '{name}' found under {cache_path:?}")))?;
    Ok(PackageId::new(name, version))
}
