//! Orchestrator (spec §4.9): identifier resolution fan-out, derivation
//! dispatch, cache-gated generation, and the `__core_package` result
//! annotation.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use fsg_context::{resolve_base_library, CanonicalVersion, FsPackageExplorer, MetaSelector, PackageExplorer, PackageId};
use fsg_models::{ElementDefinition, StructureDefinition, TypeDerivationRule};

use crate::applier;
use crate::cache::SnapshotCache;
use crate::config::{self, EngineConfig};
use crate::error::{Error, Result};
use crate::fetcher::{DefinitionFetcher, SnapshotSource};
use crate::logger::{prethrow, SnapshotLogger};

pub struct Orchestrator {
    explorer: Arc<dyn PackageExplorer>,
    cache: SnapshotCache,
    default_version: CanonicalVersion,
    base_namespace: String,
    logger: Arc<dyn SnapshotLogger>,
}

impl Orchestrator {
    pub fn new(
        explorer: Arc<dyn PackageExplorer>,
        cache: SnapshotCache,
        default_version: CanonicalVersion,
        base_namespace: impl Into<String>,
        logger: Arc<dyn SnapshotLogger>,
    ) -> Self {
        Self {
            explorer,
            cache,
            default_version,
            base_namespace: base_namespace.into(),
            logger,
        }
    }

    /// Assembles an orchestrator from a caller-supplied `EngineConfig`
    /// (spec §6) — the one path through which outside-world configuration
    /// becomes a running engine (`apps/cli` is the only caller today).
    pub fn from_config(cfg: EngineConfig) -> Result<Self> {
        let context = config::resolve_context(&cfg.context, &cfg.cache_path)?;
        let explorer: Arc<dyn PackageExplorer> = Arc::new(FsPackageExplorer::new(cfg.cache_path.clone(), context));
        let cache = SnapshotCache::new(cfg.cache_path.clone(), cfg.cache_mode);
        let canonical = cfg.canonical_version()?;
        Ok(Self::new(explorer, cache, canonical, "http://hl7.org/fhir", cfg.logger))
    }

    /// Packages loaded into this orchestrator's context, in configuration
    /// order.
    pub fn context_packages(&self) -> &[PackageId] {
        self.explorer.context_packages()
    }

    /// Pre-generates and caches every constraint-derivation profile
    /// contributed by `packages` (spec §4.8 `ensure`/`rebuild` batch
    /// walking).
    pub async fn precache(&self, packages: &[PackageId]) -> Vec<(String, Error)> {
        let reentrant = self.reentrant_handle();
        self.cache
            .precache_context(
                &*self.explorer,
                packages,
                move |package, url| {
                    let orchestrator = reentrant.clone();
                    async move { orchestrator.get_snapshot(&url, Some(&package)).await }
                },
                &*self.logger,
            )
            .await
    }

    /// `get_snapshot(identifier, package_filter?)`: resolves `identifier`
    /// by fan-out, dispatches on derivation, and annotates the result with
    /// `__core_package`.
    pub async fn get_snapshot(&self, identifier: &str, package_filter: Option<&PackageId>) -> Result<Value> {
        if let Some(base_type) = identifier.strip_prefix('#') {
            return self.get_sub_tree(base_type, package_filter).await;
        }

        let (sd, package) = self.resolve_identifier(identifier, package_filter).await?;

        match sd.derivation {
            None | Some(TypeDerivationRule::Specialization) => {
                let snapshot = sd.snapshot.as_ref().ok_or_else(|| {
                    prethrow(
                        &*self.logger,
                        Error::NoSnapshot {
                            identifier: identifier.to_string(),
                            package: package.to_string(),
                        },
                    )
                })?;
                self.annotate(&sd, &snapshot.element, &package).await
            }
            Some(TypeDerivationRule::Constraint) => self.generate_cached(&sd, &package).await,
        }
    }

    async fn get_sub_tree(&self, base_type: &str, package_filter: Option<&PackageId>) -> Result<Value> {
        let package = match package_filter {
            Some(pkg) => pkg.clone(),
            None => self
                .explorer
                .resolve_meta("StructureDefinition", MetaSelector::Id(base_type.to_string()), None)
                .await
                .map(|(package, _)| package)
                .unwrap_or_else(|_| self.default_version.base_library()),
        };
        let base_lib = resolve_base_library(&*self.explorer, &package, self.default_version).await?;
        let fetcher = self.fetcher_for(&package, &base_lib);
        let elements = fetcher.get_base_type(base_type).await?;
        self.annotate_elements(&elements, &base_lib).await
    }

    /// Identifier fan-out (spec §4.9 step 1-3): canonical URL first if the
    /// identifier looks like one, else id then name; accumulate failures
    /// and surface a single `not-found`.
    async fn resolve_identifier(&self, identifier: &str, package_filter: Option<&PackageId>) -> Result<(StructureDefinition, PackageId)> {
        let mut selectors = if identifier.contains(':') {
            vec![MetaSelector::Url(identifier.to_string()), MetaSelector::Id(identifier.to_string())]
        } else {
            vec![MetaSelector::Id(identifier.to_string()), MetaSelector::Name(identifier.to_string())]
        };
        selectors.dedup();

        let mut last_err = None;
        for selector in selectors {
            match self.explorer.resolve_meta("StructureDefinition", selector, package_filter).await {
                Ok((package, sd)) => {
                    return Ok((sd, package));
                }
                Err(e) => {
                    self.logger.warn(&format!("identifier resolution attempt failed for '{identifier}': {e}"));
                    last_err = Some(e);
                }
            }
        }

        Err(prethrow(
            &*self.logger,
            Error::NotFound {
                identifier: identifier.to_string(),
                package: last_err.map(|e| e.to_string()).unwrap_or_default(),
            },
        ))
    }

    fn fetcher_for(&self, source_package: &PackageId, base_lib: &PackageId) -> DefinitionFetcher {
        DefinitionFetcher::new(
            self.explorer.clone(),
            Arc::new(OrchestratorSnapshotSource { inner: self.reentrant_handle() }),
            source_package.clone(),
            base_lib.clone(),
            self.base_namespace.clone(),
        )
    }

    fn reentrant_handle(&self) -> Arc<Self> {
        // Cloning the collaborators (not `self`) keeps re-entry cheap and
        // avoids requiring `Orchestrator` itself to be constructed behind an
        // `Arc` by callers that only want a single `get_snapshot` call.
        Arc::new(Orchestrator {
            explorer: self.explorer.clone(),
            cache: self.cache.clone(),
            default_version: self.default_version,
            base_namespace: self.base_namespace.clone(),
            logger: self.logger.clone(),
        })
    }

    /// Cache-gated generation for a `constraint`-derivation profile, with
    /// the stored-snapshot fallback on generation failure (spec §4.9).
    async fn generate_cached(&self, sd: &StructureDefinition, package: &PackageId) -> Result<Value> {
        let filename = format!("StructureDefinition-{}.json", sd.id.clone().unwrap_or_else(|| sd.name.clone()));
        let sd_owned = sd.clone();
        let package_owned = package.clone();

        let result = self
            .cache
            .get_or_generate(package, &filename, || async move { self.generate_value(&sd_owned, &package_owned).await })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                self.logger.warn(&format!("generation failed for {} ({e}); falling back to stored snapshot if present", sd.url));
                if let Some(snapshot) = &sd.snapshot {
                    self.annotate(sd, &snapshot.element, package).await
                } else {
                    Err(prethrow(&*self.logger, e))
                }
            }
        }
    }

    async fn generate_value(&self, sd: &StructureDefinition, package: &PackageId) -> Result<Value> {
        let elements = self.generate_elements(sd, package).await?;
        self.annotate(sd, &elements, package).await
    }

    async fn generate_elements(&self, sd: &StructureDefinition, package: &PackageId) -> Result<Vec<ElementDefinition>> {
        let base_lib = resolve_base_library(&*self.explorer, package, self.default_version).await?;
        let fetcher = self.fetcher_for(package, &base_lib);

        let differential = sd.differential.as_ref().ok_or_else(|| Error::NoDifferential {
            identifier: sd.url.clone(),
            package: package.to_string(),
        })?;
        let base_definition = sd.base_definition.as_ref().ok_or_else(|| Error::NoBaseDefinition {
            identifier: sd.url.clone(),
            package: package.to_string(),
        })?;

        let base_elements = fetcher.get_by_url(base_definition).await?;
        applier::apply(base_elements, &differential.element, &fetcher, &*self.logger, &package.to_string()).await
    }

    async fn annotate(&self, sd: &StructureDefinition, elements: &[ElementDefinition], package: &PackageId) -> Result<Value> {
        let _ = sd;
        self.annotate_elements(elements, package).await
    }

    async fn annotate_elements(&self, elements: &[ElementDefinition], package: &PackageId) -> Result<Value> {
        let mut value = serde_json::json!({ "snapshot": { "element": elements } });
        value["__core_package"] = serde_json::json!({ "id": package.id, "version": package.version });
        Ok(value)
    }
}

/// Adapts the orchestrator to re-enter itself for a cross-profile fetch
/// (spec §3: "re-entry is bounded by differential acyclicity").
struct OrchestratorSnapshotSource {
    inner: Arc<Orchestrator>,
}

#[async_trait]
impl SnapshotSource for OrchestratorSnapshotSource {
    async fn fetch_snapshot(&self, url: &str) -> Result<Vec<ElementDefinition>> {
        let (sd, package) = self.inner.resolve_identifier(url, None).await?;
        match sd.derivation {
            None | Some(TypeDerivationRule::Specialization) => {
                let snapshot = sd.snapshot.as_ref().ok_or_else(|| Error::NoSnapshot {
                    identifier: url.to_string(),
                    package: package.to_string(),
                })?;
                Ok(snapshot.element.clone())
            }
            Some(TypeDerivationRule::Constraint) => self.inner.generate_elements(&sd, &package).await,
        }
    }
}
