//! The "package explorer" external collaborator (spec §1): supplies raw
//! differentials, base snapshots, metadata listing, and cache-path
//! discovery. The snapshot engine consumes only this trait; it never touches
//! a registry, a tarball, or the network directly.

use async_trait::async_trait;
use fsg_models::StructureDefinition;
use fsg_package::PackageManifest;
use std::path::Path;

use crate::error::Result;
use crate::package_id::PackageId;

/// How a `StructureDefinition` is being looked up within a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaSelector {
    Id(String),
    Url(String),
    Name(String),
    Filename(String),
}

impl std::fmt::Display for MetaSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetaSelector::Id(v) => write!(f, "id={v}"),
            MetaSelector::Url(v) => write!(f, "url={v}"),
            MetaSelector::Name(v) => write!(f, "name={v}"),
            MetaSelector::Filename(v) => write!(f, "filename={v}"),
        }
    }
}

/// A listing query used by `lookup_meta`: the selector may only partially
/// constrain the search (e.g. "by name" across every package in context).
#[derive(Debug, Clone)]
pub struct MetaFilter {
    pub kind: String,
    pub selector: MetaSelector,
    pub package: Option<PackageId>,
}

#[async_trait]
pub trait PackageExplorer: Send + Sync {
    /// Resolve a resource by its exact filename within a specific package.
    async fn resolve_by_filename(
        &self,
        package: &PackageId,
        filename: &str,
    ) -> Result<StructureDefinition>;

    /// Resolve metadata (a full `StructureDefinition`, differential and/or
    /// stored snapshot included) for `kind` by `selector`, preferring
    /// `package_filter` when given. Returns the package the match was found
    /// in alongside the resource — with `package_filter` omitted this may be
    /// any package in context, and callers must not assume it's the default.
    async fn resolve_meta(
        &self,
        kind: &str,
        selector: MetaSelector,
        package_filter: Option<&PackageId>,
    ) -> Result<(PackageId, StructureDefinition)>;

    /// List every resource matching `filter`.
    async fn lookup_meta(&self, filter: MetaFilter) -> Result<Vec<StructureDefinition>>;

    /// Every `StructureDefinition` with `derivation = constraint` in `package`,
    /// used by batch pre-caching (spec §4.8 `ensure`/`rebuild`) to enumerate
    /// the profiles a package contributes to the context.
    async fn list_profiles(&self, package: &PackageId) -> Result<Vec<StructureDefinition>>;

    /// Every package loaded into this context, in configuration order.
    fn context_packages(&self) -> &[PackageId];

    /// Direct (non-transitive) dependency packages of `pkg`.
    async fn direct_dependencies(&self, pkg: &PackageId) -> Result<Vec<PackageId>>;

    /// The manifest (`package.json`) of `pkg`.
    async fn package_manifest(&self, pkg: &PackageId) -> Result<PackageManifest>;

    /// Root of the shared package + snapshot cache.
    fn cache_path(&self) -> &Path;
}
