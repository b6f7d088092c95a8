//! End-to-end scenarios from the testable-properties list: cache lazy
//! write, corrupt recovery, none-mode isolation, rebuild coverage, the
//! polymorphic shortcut, and non-sliceable alias tolerance — each driven
//! through the public `applier`/`cache`/`orchestrator` surface rather than
//! an internal helper.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use fsg_context::{CanonicalVersion, Error as CtxError, MetaFilter, MetaSelector, PackageExplorer, PackageId, Result as CtxResult};
use fsg_models::{ElementDefinition, ElementDefinitionBase, ElementDefinitionType, StructureDefinition, StructureDefinitionKind, TypeDerivationRule};
use fsg_snapshot::cache::CacheMode;
use fsg_snapshot::logger::TracingLogger;
use fsg_snapshot::{applier, Orchestrator, SnapshotCache};

fn elem(id: &str, path: &str) -> ElementDefinition {
    serde_json::from_value(json!({ "id": id, "path": path })).unwrap()
}

fn poly_elem(id: &str, path: &str, types: &[&str]) -> ElementDefinition {
    let mut e = elem(id, path);
    e.base = Some(ElementDefinitionBase { path: path.to_string(), min: 0, max: "1".to_string() });
    e.types = Some(
        types
            .iter()
            .map(|code| ElementDefinitionType {
                code: code.to_string(),
                profile: None,
                target_profile: None,
                aggregation: None,
                versioning: None,
            })
            .collect(),
    );
    e
}

// --- Scenario 5: polymorphic shortcut --------------------------------

#[tokio::test]
async fn polymorphic_shortcut_resolves_to_value_x_with_no_spurious_element() {
    let base = vec![
        elem("Observation", "Observation"),
        poly_elem("Observation.value[x]", "Observation.value[x]", &["Quantity", "CodeableConcept", "string"]),
    ];
    let mut diff_entry = elem("Observation.valueQuantity", "Observation.valueQuantity");
    diff_entry.min = Some(1);
    let differential = vec![diff_entry];

    let fetcher = never_called_fetcher();
    let result = applier::apply(base, &differential, &fetcher, &TracingLogger, "example.profiles@1.0.0")
        .await
        .unwrap();

    assert!(result.iter().all(|e| e.id.as_deref() != Some("Observation.valueQuantity")));
    let value = result.iter().find(|e| e.id.as_deref() == Some("Observation.value[x]")).unwrap();
    assert_eq!(value.min, Some(1));
    let types = value.types.as_ref().unwrap();
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].code, "Quantity");
}

// --- Scenario 6: non-sliceable alias tolerance ------------------------

#[tokio::test]
async fn slice_on_a_scalar_element_merges_into_the_plain_element() {
    let base = vec![elem("Composition", "Composition"), elem("Composition.date", "Composition.date")];
    let mut diff_entry = elem("Composition.date:IssueDate", "Composition.date");
    diff_entry.short = Some("Issue date".to_string());
    let differential = vec![diff_entry];

    let fetcher = never_called_fetcher();
    let result = applier::apply(base, &differential, &fetcher, &TracingLogger, "example.profiles@1.0.0")
        .await
        .unwrap();

    assert_eq!(result.len(), 2);
    let date = result.iter().find(|e| e.id.as_deref() == Some("Composition.date")).unwrap();
    assert_eq!(date.short.as_deref(), Some("Issue date"));
    assert_eq!(date.slice_name, None);
    assert!(result.iter().all(|e| e.id.as_deref() != Some("Composition.date:IssueDate")));
}

fn never_called_fetcher() -> fsg_snapshot::DefinitionFetcher {
    struct UnusedSnapshotSource;
    #[async_trait]
    impl fsg_snapshot::SnapshotSource for UnusedSnapshotSource {
        async fn fetch_snapshot(&self, _url: &str) -> fsg_snapshot::Result<Vec<ElementDefinition>> {
            unimplemented!("scenario does not need further type resolution")
        }
    }
    struct UnusedExplorer;
    #[async_trait]
    impl PackageExplorer for UnusedExplorer {
        async fn resolve_by_filename(&self, _package: &PackageId, _filename: &str) -> CtxResult<StructureDefinition> {
            unimplemented!()
        }
        async fn resolve_meta(
            &self,
            _kind: &str,
            _selector: MetaSelector,
            _package_filter: Option<&PackageId>,
        ) -> CtxResult<(PackageId, StructureDefinition)> {
            unimplemented!()
        }
        async fn lookup_meta(&self, _filter: MetaFilter) -> CtxResult<Vec<StructureDefinition>> {
            unimplemented!()
        }
        async fn list_profiles(&self, _package: &PackageId) -> CtxResult<Vec<StructureDefinition>> {
            unimplemented!()
        }
        fn context_packages(&self) -> &[PackageId] {
            &[]
        }
        async fn direct_dependencies(&self, _pkg: &PackageId) -> CtxResult<Vec<PackageId>> {
            unimplemented!()
        }
        async fn package_manifest(&self, _pkg: &PackageId) -> CtxResult<fsg_package::PackageManifest> {
            unimplemented!()
        }
        fn cache_path(&self) -> &Path {
            Path::new("/unused")
        }
    }

    fsg_snapshot::DefinitionFetcher::new(
        Arc::new(UnusedExplorer),
        Arc::new(UnusedSnapshotSource),
        PackageId::new("example.profiles", "1.0.0"),
        PackageId::new("hl7.fhir.r4.core", "4.0.1"),
        "http://hl7.org/fhir".to_string(),
    )
}

// --- Scenarios 1-4: orchestrator + cache over a fake package explorer --

struct FakeExplorer {
    by_selector: Mutex<HashMap<String, StructureDefinition>>,
    profiles: Vec<StructureDefinition>,
}

#[async_trait]
impl PackageExplorer for FakeExplorer {
    async fn resolve_by_filename(&self, _package: &PackageId, _filename: &str) -> CtxResult<StructureDefinition> {
        unimplemented!()
    }

    async fn resolve_meta(
        &self,
        _kind: &str,
        selector: MetaSelector,
        _package_filter: Option<&PackageId>,
    ) -> CtxResult<(PackageId, StructureDefinition)> {
        let key = match selector {
            MetaSelector::Id(v) => v,
            MetaSelector::Url(v) => v,
            MetaSelector::Name(v) => v,
            MetaSelector::Filename(v) => v,
        };
        self.by_selector
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .map(|sd| (package(), sd))
            .ok_or_else(|| CtxError::ResourceNotFound { kind: "StructureDefinition".to_string(), selector: key })
    }

    async fn lookup_meta(&self, _filter: MetaFilter) -> CtxResult<Vec<StructureDefinition>> {
        unimplemented!()
    }

    async fn list_profiles(&self, _package: &PackageId) -> CtxResult<Vec<StructureDefinition>> {
        Ok(self.profiles.clone())
    }

    fn context_packages(&self) -> &[PackageId] {
        &[]
    }

    async fn direct_dependencies(&self, _pkg: &PackageId) -> CtxResult<Vec<PackageId>> {
        Ok(Vec::new())
    }

    async fn package_manifest(&self, _pkg: &PackageId) -> CtxResult<fsg_package::PackageManifest> {
        Ok(fsg_package::PackageManifest {
            name: "example.profiles".to_string(),
            version: "1.0.0".to_string(),
            canonical: None,
            url: None,
            homepage: None,
            title: None,
            description: String::new(),
            fhir_versions: Vec::new(),
            dependencies: HashMap::new(),
            keywords: Vec::new(),
            author: "tests".to_string(),
            maintainers: Vec::new(),
            package_type: None,
            jurisdiction: None,
            license: None,
            compatible_versions: Vec::new(),
            extra: serde_json::Map::new(),
        })
    }

    fn cache_path(&self) -> &Path {
        Path::new("/unused")
    }
}

fn package() -> PackageId {
    PackageId::new("example.profiles", "1.0.0")
}

fn specialization_sd(id: &str) -> StructureDefinition {
    let mut sd: StructureDefinition = serde_json::from_value(json!({
        "resourceType": "StructureDefinition",
        "id": id,
        "url": format!("http://hl7.org/fhir/StructureDefinition/{id}"),
        "name": id,
        "status": "active",
        "kind": "resource",
        "abstract": false,
        "type": id,
        "snapshot": { "element": [{ "id": id, "path": id }] }
    }))
    .unwrap();
    sd.kind = StructureDefinitionKind::Resource;
    sd.derivation = Some(TypeDerivationRule::Specialization);
    sd
}

fn constraint_profile(id: &str, base_id: &str) -> StructureDefinition {
    let mut sd: StructureDefinition = serde_json::from_value(json!({
        "resourceType": "StructureDefinition",
        "id": id,
        "url": format!("http://example.org/fhir/StructureDefinition/{id}"),
        "name": id,
        "status": "active",
        "kind": "resource",
        "abstract": false,
        "type": base_id,
        "baseDefinition": format!("http://hl7.org/fhir/StructureDefinition/{base_id}"),
        "differential": { "element": [{ "id": base_id, "path": base_id, "short": "narrowed" }] }
    }))
    .unwrap();
    sd.kind = StructureDefinitionKind::Resource;
    sd.derivation = Some(TypeDerivationRule::Constraint);
    sd
}

fn orchestrator_over(sds: Vec<(&str, StructureDefinition)>, profiles: Vec<StructureDefinition>, cache: SnapshotCache) -> Orchestrator {
    let mut by_selector = HashMap::new();
    for (key, sd) in sds {
        by_selector.insert(key.to_string(), sd.clone());
        by_selector.insert(sd.url.clone(), sd);
    }
    let explorer = Arc::new(FakeExplorer { by_selector: Mutex::new(by_selector), profiles });
    Orchestrator::new(explorer, cache, CanonicalVersion::R4, "http://hl7.org/fhir", Arc::new(TracingLogger))
}

/// Scenario 1: empty cache directory, first `get_snapshot` writes the
/// cache file, second call is served from disk without regenerating.
#[tokio::test]
async fn cache_lazy_write_then_hit() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SnapshotCache::new(dir.path().to_path_buf(), CacheMode::Lazy);
    let base = specialization_sd("ext-hearing-loss");
    let profile = constraint_profile("ext-hearing-loss-profile", "ext-hearing-loss");
    let orchestrator = orchestrator_over(vec![("ext-hearing-loss", base), ("ext-hearing-loss-profile", profile)], Vec::new(), cache.clone());

    let first = orchestrator.get_snapshot("ext-hearing-loss-profile", Some(&package())).await.unwrap();
    assert_eq!(first["snapshot"]["element"][0]["short"], "narrowed");

    let path = cache.snapshot_path(&package(), "StructureDefinition-ext-hearing-loss-profile.json");
    assert!(path.exists());
    let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&on_disk).is_ok());

    let second = orchestrator.get_snapshot("ext-hearing-loss-profile", Some(&package())).await.unwrap();
    assert_eq!(second, first);
}

/// Scenario 2: a truncated cache file is treated as a miss, regenerated,
/// and the file on disk ends up well-formed.
#[tokio::test]
async fn corrupt_cache_file_is_recovered_through_the_orchestrator() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SnapshotCache::new(dir.path().to_path_buf(), CacheMode::Lazy);
    let path = cache.snapshot_path(&package(), "StructureDefinition-ext-hearing-loss-profile.json");
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&path, br#"{"resourceType":"StructureDefinition""#).await.unwrap();

    let base = specialization_sd("ext-hearing-loss");
    let profile = constraint_profile("ext-hearing-loss-profile", "ext-hearing-loss");
    let orchestrator = orchestrator_over(vec![("ext-hearing-loss", base), ("ext-hearing-loss-profile", profile)], Vec::new(), cache);

    let result = orchestrator.get_snapshot("ext-hearing-loss-profile", Some(&package())).await.unwrap();
    assert_eq!(result["resourceType"], serde_json::Value::Null);
    assert_eq!(result["snapshot"]["element"][0]["short"], "narrowed");

    let repaired = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&repaired).is_ok());
}

/// Scenario 3: `none` mode never reads or writes the cache subtree, even
/// if a file happens to already exist at the would-be path.
#[tokio::test]
async fn none_mode_ignores_a_pre_existing_cache_file() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SnapshotCache::new(dir.path().to_path_buf(), CacheMode::None);
    let path = cache.snapshot_path(&package(), "StructureDefinition-ext-hearing-loss-profile.json");
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    tokio::fs::write(&path, br#"{"resourceType":"dummy"}"#).await.unwrap();

    let base = specialization_sd("ext-hearing-loss");
    let profile = constraint_profile("ext-hearing-loss-profile", "ext-hearing-loss");
    let orchestrator = orchestrator_over(vec![("ext-hearing-loss", base), ("ext-hearing-loss-profile", profile)], Vec::new(), cache);

    let result = orchestrator.get_snapshot("ext-hearing-loss-profile", Some(&package())).await.unwrap();
    assert_eq!(result["snapshot"]["element"][0]["short"], "narrowed");

    let untouched = tokio::fs::read_to_string(&path).await.unwrap();
    assert_eq!(untouched, r#"{"resourceType":"dummy"}"#);
}

/// Scenario 4: `rebuild` pre-caching covers every profile the package
/// contributes; the resulting filename set matches exactly.
#[tokio::test]
async fn rebuild_precache_covers_every_profile_in_the_package() {
    let dir = tempfile::tempdir().unwrap();
    let cache = SnapshotCache::new(dir.path().to_path_buf(), CacheMode::Rebuild);
    let base = specialization_sd("ext-hearing-loss");
    let profile_ids = ["profile-a", "profile-b", "profile-c"];
    let profiles: Vec<StructureDefinition> = profile_ids.iter().map(|id| constraint_profile(id, "ext-hearing-loss")).collect();

    let mut sds = vec![("ext-hearing-loss", base)];
    for (id, sd) in profile_ids.iter().zip(profiles.iter()) {
        sds.push((id, sd.clone()));
    }
    let explorer_sds = sds.clone();
    let orchestrator = Arc::new(orchestrator_over(explorer_sds, profiles.clone(), cache.clone()));

    let generate_calls = Arc::new(AtomicU32::new(0));
    let explorer_for_precache = FakeExplorer {
        by_selector: Mutex::new({
            let mut m = HashMap::new();
            for (key, sd) in sds {
                m.insert(key.to_string(), sd.clone());
                m.insert(sd.url.clone(), sd);
            }
            m
        }),
        profiles: profiles.clone(),
    };

    let generate_calls_clone = generate_calls.clone();
    let orchestrator_clone = orchestrator.clone();
    let errors = cache
        .precache_context(
            &explorer_for_precache,
            &[package()],
            move |pkg, url| {
                generate_calls_clone.fetch_add(1, Ordering::SeqCst);
                let orchestrator = orchestrator_clone.clone();
                async move { orchestrator.get_snapshot(&url, Some(&pkg)).await }
            },
            &TracingLogger,
        )
        .await;

    assert!(errors.is_empty(), "precache failed: {errors:?}");
    assert_eq!(generate_calls.load(Ordering::SeqCst), 3);

    let mut on_disk: Vec<String> = std::fs::read_dir(cache.snapshot_path(&package(), "dummy.json").parent().unwrap())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    on_disk.sort();
    let mut expected: Vec<String> = profile_ids.iter().map(|id| format!("StructureDefinition-{id}.json")).collect();
    expected.sort();
    assert_eq!(on_disk, expected);
}
