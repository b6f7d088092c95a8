//! Definition fetcher (spec §4.4): memoised per generation, with three
//! immutable keys: the source package, the core-library package, and an
//! injected snapshot source able to resolve any canonical URL to fully
//! expanded elements (possibly by re-entering the orchestrator).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use fsg_context::{MetaSelector, PackageExplorer, PackageId};
use fsg_models::{ElementDefinition, TypeDerivationRule};

use crate::error::{Error, Result};
use crate::migrator;

/// Resolves a canonical URL to fully-expanded snapshot elements, possibly by
/// re-entering the orchestrator for a cross-profile dependency.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, url: &str) -> Result<Vec<ElementDefinition>>;
}

pub struct DefinitionFetcher {
    explorer: Arc<dyn PackageExplorer>,
    snapshot_source: Arc<dyn SnapshotSource>,
    source_package: PackageId,
    core_library_package: PackageId,
    base_namespace: String,
    memo: Mutex<HashMap<String, Vec<ElementDefinition>>>,
}

impl DefinitionFetcher {
    pub fn new(
        explorer: Arc<dyn PackageExplorer>,
        snapshot_source: Arc<dyn SnapshotSource>,
        source_package: PackageId,
        core_library_package: PackageId,
        base_namespace: String,
    ) -> Self {
        Self {
            explorer,
            snapshot_source,
            source_package,
            core_library_package,
            base_namespace,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// `get_base_type(type_name)`: resolves the type in the core library
    /// package. `Element` and `Resource` accept any derivation; every other
    /// type requires `derivation == specialization`.
    pub async fn get_base_type(&self, type_name: &str) -> Result<Vec<ElementDefinition>> {
        if let Some(cached) = self.memo.lock().await.get(type_name) {
            return Ok(cached.clone());
        }

        let (_, sd) = self
            .explorer
            .resolve_meta(
                "StructureDefinition",
                MetaSelector::Id(type_name.to_string()),
                Some(&self.core_library_package),
            )
            .await
            .map_err(|_| Error::NoSnapshot {
                identifier: type_name.to_string(),
                package: self.core_library_package.to_string(),
            })?;

        let derivation_ok = matches!(type_name, "Element" | "Resource")
            || sd.derivation == Some(TypeDerivationRule::Specialization);
        if !derivation_ok {
            return Err(Error::NoSnapshot {
                identifier: type_name.to_string(),
                package: self.core_library_package.to_string(),
            });
        }

        let snapshot = sd.snapshot.as_ref().ok_or_else(|| Error::NoSnapshot {
            identifier: type_name.to_string(),
            package: self.core_library_package.to_string(),
        })?;

        let elements = migrator::migrate(&snapshot.element, &sd.url, &self.base_namespace);
        self.memo.lock().await.insert(type_name.to_string(), elements.clone());
        Ok(elements)
    }

    /// `get_content_reference(ref)`: `ref` must start with `#`.
    pub async fn get_content_reference(&self, reference: &str) -> Result<Vec<ElementDefinition>> {
        let memo_key = reference.to_string();
        if let Some(cached) = self.memo.lock().await.get(&memo_key) {
            return Ok(cached.clone());
        }

        let eid = reference.strip_prefix('#').ok_or_else(|| Error::CannotExpand {
            node_id: reference.to_string(),
            package: self.source_package.to_string(),
        })?;
        let first_segment = eid.split('.').next().unwrap_or(eid);

        let base = self.get_base_type(first_segment).await?;
        let elements: Vec<ElementDefinition> = base
            .into_iter()
            .filter(|e| {
                let id = e.id.as_deref().unwrap_or(&e.path);
                id == eid || id.starts_with(&format!("{eid}."))
            })
            .collect();

        self.memo.lock().await.insert(memo_key, elements.clone());
        Ok(elements)
    }

    /// `get_by_url(url)`: resolves metadata via the package explorer,
    /// preferring `source_package`. Specialisations return their stored
    /// snapshot; constraints re-enter the injected snapshot source.
    pub async fn get_by_url(&self, url: &str) -> Result<Vec<ElementDefinition>> {
        if let Some(cached) = self.memo.lock().await.get(url) {
            return Ok(cached.clone());
        }

        let (_, sd) = self
            .explorer
            .resolve_meta("StructureDefinition", MetaSelector::Url(url.to_string()), Some(&self.source_package))
            .await
            .map_err(|_| Error::NotFound {
                identifier: url.to_string(),
                package: self.source_package.to_string(),
            })?;

        let elements = match sd.derivation {
            Some(TypeDerivationRule::Specialization) | None => {
                let snapshot = sd.snapshot.as_ref().ok_or_else(|| Error::NoSnapshot {
                    identifier: url.to_string(),
                    package: self.source_package.to_string(),
                })?;
                migrator::migrate(&snapshot.element, &sd.url, &self.base_namespace)
            }
            Some(TypeDerivationRule::Constraint) => {
                let fetched = self.snapshot_source.fetch_snapshot(url).await?;
                migrator::migrate(&fetched, &sd.url, &self.base_namespace)
            }
        };

        self.memo.lock().await.insert(url.to_string(), elements.clone());
        Ok(elements)
    }
}
