//! Default, filesystem-backed `PackageExplorer`.
//!
//! Reads packages already unpacked under `cache_root/<id>#<version>/package/`
//! (the standard FHIR NPM package layout, spec §6). Loading packages from a
//! registry tarball is an external collaborator's job (spec §1 names the
//! package loader and canonical-URL resolver as out of scope for the core);
//! this implementation only ever reads from disk.

use async_trait::async_trait;
use fsg_models::StructureDefinition;
use fsg_package::{FhirPackage, PackageManifest};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::explorer::{MetaFilter, MetaSelector, PackageExplorer};
use crate::package_id::PackageId;

pub struct FsPackageExplorer {
    cache_root: PathBuf,
    context: Vec<PackageId>,
    packages: RwLock<HashMap<PackageId, FhirPackage>>,
}

impl FsPackageExplorer {
    pub fn new(cache_root: impl Into<PathBuf>, context: Vec<PackageId>) -> Self {
        Self {
            cache_root: cache_root.into(),
            context,
            packages: RwLock::new(HashMap::new()),
        }
    }

    fn package_dir(&self, pkg: &PackageId) -> PathBuf {
        self.cache_root
            .join(format!("{}#{}", pkg.id, pkg.version))
            .join("package")
    }

    async fn load(&self, pkg: &PackageId) -> Result<()> {
        if self.packages.read().await.contains_key(pkg) {
            return Ok(());
        }
        let dir = self.package_dir(pkg);
        let loaded = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || FhirPackage::from_directory(&dir))
                .await
                .expect("blocking package load panicked")
        };
        let fhir_package = loaded.map_err(|_| Error::PackageNotFound(pkg.to_string()))?;
        self.packages
            .write()
            .await
            .insert(pkg.clone(), fhir_package);
        Ok(())
    }

    fn matches(resource: &StructureDefinition, selector: &MetaSelector) -> bool {
        match selector {
            MetaSelector::Id(id) => resource.id.as_deref() == Some(id.as_str()),
            MetaSelector::Url(url) => &resource.url == url,
            MetaSelector::Name(name) => &resource.name == name,
            MetaSelector::Filename(_) => false,
        }
    }
}

#[async_trait]
impl PackageExplorer for FsPackageExplorer {
    async fn resolve_by_filename(
        &self,
        package: &PackageId,
        filename: &str,
    ) -> Result<StructureDefinition> {
        self.load(package).await?;
        let packages = self.packages.read().await;
        let fhir_package = packages
            .get(package)
            .ok_or_else(|| Error::PackageNotFound(package.to_string()))?;
        fhir_package
            .resources
            .iter()
            .find(|r| {
                r.get("resourceType").and_then(|v| v.as_str()) == Some("StructureDefinition")
                    && fhir_package
                        .index
                        .as_ref()
                        .and_then(|idx| idx.files.iter().find(|f| f.filename == filename))
                        .map(|f| f.id.as_deref() == r.get("id").and_then(|v| v.as_str()))
                        .unwrap_or(false)
            })
            .or_else(|| {
                // Fall back to the conventional `StructureDefinition-<id>.json` naming
                // when the package carries no (or an incomplete) `.index.json`.
                fhir_package.resources.iter().find(|r| {
                    r.get("resourceType").and_then(|v| v.as_str()) == Some("StructureDefinition")
                        && r.get("id").and_then(|v| v.as_str()).is_some_and(|id| {
                            filename == format!("StructureDefinition-{id}.json")
                        })
                })
            })
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "StructureDefinition".to_string(),
                selector: format!("filename={filename}"),
            })
            .and_then(|v| StructureDefinition::from_value(v).map_err(Error::from))
    }

    async fn resolve_meta(
        &self,
        kind: &str,
        selector: MetaSelector,
        package_filter: Option<&PackageId>,
    ) -> Result<(PackageId, StructureDefinition)> {
        let candidates: Vec<PackageId> = match package_filter {
            Some(pkg) => vec![pkg.clone()],
            None => self.context.clone(),
        };
        for pkg in &candidates {
            self.load(pkg).await?;
            let packages = self.packages.read().await;
            let Some(fhir_package) = packages.get(pkg) else {
                continue;
            };
            if let Some(found) = fhir_package
                .resources
                .iter()
                .filter(|r| r.get("resourceType").and_then(|v| v.as_str()) == Some(kind))
                .find_map(|r| {
                    let sd = StructureDefinition::from_value(r).ok()?;
                    Self::matches(&sd, &selector).then_some(sd)
                })
            {
                return Ok((pkg.clone(), found));
            }
        }
        Err(Error::ResourceNotFound {
            kind: kind.to_string(),
            selector: selector.to_string(),
        })
    }

    async fn lookup_meta(&self, filter: MetaFilter) -> Result<Vec<StructureDefinition>> {
        let candidates: Vec<PackageId> = match &filter.package {
            Some(pkg) => vec![pkg.clone()],
            None => self.context.clone(),
        };
        let mut out = Vec::new();
        for pkg in &candidates {
            self.load(pkg).await?;
            let packages = self.packages.read().await;
            let Some(fhir_package) = packages.get(pkg) else {
                continue;
            };
            out.extend(
                fhir_package
                    .resources
                    .iter()
                    .filter(|r| {
                        r.get("resourceType").and_then(|v| v.as_str()) == Some(filter.kind.as_str())
                    })
                    .filter_map(|r| StructureDefinition::from_value(r).ok())
                    .filter(|sd| Self::matches(sd, &filter.selector)),
            );
        }
        Ok(out)
    }

    async fn list_profiles(&self, package: &PackageId) -> Result<Vec<StructureDefinition>> {
        self.load(package).await?;
        let packages = self.packages.read().await;
        let fhir_package = packages
            .get(package)
            .ok_or_else(|| Error::PackageNotFound(package.to_string()))?;
        Ok(fhir_package
            .resources
            .iter()
            .filter(|r| r.get("resourceType").and_then(|v| v.as_str()) == Some("StructureDefinition"))
            .filter_map(|r| StructureDefinition::from_value(r).ok())
            .filter(|sd| sd.is_profile())
            .collect())
    }

    fn context_packages(&self) -> &[PackageId] {
        &self.context
    }

    async fn direct_dependencies(&self, pkg: &PackageId) -> Result<Vec<PackageId>> {
        let manifest = self.package_manifest(pkg).await?;
        Ok(manifest
            .dependencies
            .iter()
            .map(|(id, version)| PackageId::new(id.clone(), version.clone()))
            .collect())
    }

    async fn package_manifest(&self, pkg: &PackageId) -> Result<PackageManifest> {
        self.load(pkg).await?;
        let packages = self.packages.read().await;
        packages
            .get(pkg)
            .map(|p| p.manifest.clone())
            .ok_or_else(|| Error::PackageNotFound(pkg.to_string()))
    }

    fn cache_path(&self) -> &Path {
        &self.cache_root
    }
}
