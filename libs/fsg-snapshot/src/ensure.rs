//! `EnsureChild`, `ExpandNode`, and `EnsureBranch` (spec §4.6) — the
//! on-demand tree materialisation core of the diff applier.

use fsg_models::{ElementDefinition, ElementDefinitionType};

use crate::error::{Error, Result};
use crate::fetcher::DefinitionFetcher;
use crate::logger::SnapshotLogger;
use crate::merge;
use crate::monopoly;
use crate::tree::{self, NodeKind, TreeNode};

/// The canonical `{id, path}` an alias key resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTarget {
    pub id: String,
    pub path: String,
}

/// Append-only map from a shortcut/alias key to its canonical target,
/// shared across a single diff application (spec §4.6, §4.7).
#[derive(Debug, Default)]
pub struct AliasMap(Vec<(String, AliasTarget)>);

impl AliasMap {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, key: String, target: AliasTarget) {
        self.0.push((key, target));
    }

    /// Rewrite `id` through exact-key lookups, transitively, until no
    /// further mapping applies (used by `EnsureBranch`'s cursor rewrite).
    pub fn rewrite_exact_transitive(&self, id: &str) -> String {
        let mut current = id.to_string();
        for _ in 0..=self.0.len() {
            match self.0.iter().find(|(key, _)| key == &current) {
                Some((_, target)) => current = target.id.clone(),
                None => break,
            }
        }
        current
    }

    /// Rewrite `value` by prefix: the first inserted key that equals
    /// `value` or is a dotted prefix of it wins (spec §4.7b).
    pub fn rewrite_prefix(&self, value: &str, pick: impl Fn(&AliasTarget) -> &str) -> String {
        for (key, target) in &self.0 {
            if value == key {
                return pick(target).to_string();
            }
            if let Some(rest) = value.strip_prefix(&format!("{key}.")) {
                return format!("{}.{}", pick(target), rest);
            }
        }
        value.to_string()
    }
}

fn slab_range(elements: &[ElementDefinition], parent_id: &str) -> Option<(usize, usize)> {
    let start = elements
        .iter()
        .position(|e| e.id.as_deref() == Some(parent_id))?;
    let prefix = format!("{parent_id}.");
    let mut end = start + 1;
    while end < elements.len() {
        let id = elements[end].id.as_deref().unwrap_or("");
        if id.starts_with(&prefix) {
            end += 1;
        } else {
            break;
        }
    }
    Some((start, end))
}

fn splice_back(elements: &mut Vec<ElementDefinition>, start: usize, end: usize, slab_tree: &TreeNode) -> Result<()> {
    let flattened = tree::from_tree(slab_tree)?;
    elements.splice(start..end, flattened);
    Ok(())
}

/// Expands a single node's children on demand by fetching the relevant
/// type/content-reference/profile snapshot (spec §4.6).
pub async fn expand_node(node: &mut TreeNode, fetcher: &DefinitionFetcher) -> Result<()> {
    assert!(
        !node.kind.is_sliceable(),
        "ExpandNode refuses a sliceable node; the caller must pick a head-slice or slice"
    );

    if !node.children.is_empty() {
        return Ok(());
    }

    let def = node
        .definition
        .clone()
        .ok_or_else(|| Error::CannotExpand {
            node_id: node.id.clone(),
            package: String::new(),
        })?;

    let fetched = if let Some(content_ref) = &def.content_reference {
        let elements = fetcher.get_content_reference(content_ref).await?;
        if let Some(definition) = &mut node.definition {
            definition.content_reference = None;
        }
        elements
    } else if let Some(types) = &def.types {
        match types.as_slice() {
            [] => {
                return Err(Error::CannotExpand {
                    node_id: node.id.clone(),
                    package: String::new(),
                });
            }
            [single] => match single.profile.as_ref().and_then(|p| p.first()) {
                Some(profile) => fetcher.get_by_url(profile).await?,
                None => fetcher.get_base_type(&single.code).await?,
            },
            _ => fetcher.get_base_type("Element").await?,
        }
    } else {
        return Err(Error::CannotExpand {
            node_id: node.id.clone(),
            package: String::new(),
        });
    };

    if fetched.is_empty() {
        return Err(Error::CannotExpand {
            node_id: node.id.clone(),
            package: String::new(),
        });
    }

    let old_prefix = fetched[0].id.clone().unwrap_or_else(|| fetched[0].path.clone());
    let rewritten = tree::rewrite_elements(&fetched, &old_prefix, &node.id);
    let sub_tree = tree::to_tree(&rewritten)?;
    node.children = sub_tree.children;
    Ok(())
}

/// Materialises one child segment under `parent_id`, synthesising slices
/// from head-slice templates and recording shortcut aliases as needed
/// (spec §4.6).
pub async fn ensure_child(
    elements: &mut Vec<ElementDefinition>,
    parent_id: &str,
    child_segment: &str,
    fetcher: &DefinitionFetcher,
    logger: &dyn SnapshotLogger,
    alias_map: &mut AliasMap,
    package: &str,
) -> Result<()> {
    let (start, end) = slab_range(elements, parent_id).ok_or_else(|| Error::ParentNotFound {
        id: parent_id.to_string(),
        package: package.to_string(),
    })?;
    let slab: Vec<ElementDefinition> = elements[start..end].to_vec();
    let mut slab_tree = tree::to_tree(&slab)?;

    let effective_root: &mut TreeNode = if slab_tree.kind.is_sliceable() {
        slab_tree
            .head_slice_mut()
            .expect("a sliceable node always has a head-slice")
    } else {
        &mut slab_tree
    };

    if effective_root.children.is_empty() {
        expand_node(effective_root, fetcher).await?;
    }

    let (name, slice) = match child_segment.split_once(':') {
        Some((n, s)) => (n, Some(s)),
        None => (child_segment, None),
    };

    let suffix = format!(".{name}");
    let child_index = effective_root.children.iter().position(|c| c.id.ends_with(&suffix));

    let child_index = match child_index {
        Some(idx) => idx,
        None => {
            let Some(found) = monopoly::resolve(effective_root, name) else {
                return Err(Error::IllegalChild {
                    parent_id: effective_root.id.clone(),
                    segment: name.to_string(),
                    package: package.to_string(),
                });
            };
            let poly_id = format!("{}.{}", effective_root.id, found.rewritten_segment);
            let poly_idx = effective_root
                .children
                .iter()
                .position(|c| c.id == poly_id)
                .expect("monopoly resolver only matches an existing child");
            {
                let poly_node = &mut effective_root.children[poly_idx];
                let head = poly_node
                    .head_slice_mut()
                    .expect("a poly node always has a head-slice");
                let base_def = head
                    .definition
                    .clone()
                    .expect("a head-slice always carries a definition");
                let mut synthetic = base_def.clone();
                synthetic.types = Some(vec![ElementDefinitionType {
                    code: found.type_code.clone(),
                    profile: None,
                    target_profile: None,
                    aggregation: None,
                    versioning: None,
                }]);
                head.definition = Some(merge::merge(&base_def, &synthetic, package)?);
            }
            let poly_node = &effective_root.children[poly_idx];
            alias_map.insert(
                format!("{parent_id}.{name}"),
                AliasTarget {
                    id: poly_node.id.clone(),
                    path: poly_node.path.clone(),
                },
            );
            return splice_back(elements, start, end, &slab_tree);
        }
    };

    let Some(slice) = slice else {
        return splice_back(elements, start, end, &slab_tree);
    };

    let child = &effective_root.children[child_index];

    if !child.kind.is_sliceable() {
        logger.warn(&format!(
            "slice '{slice}' requested under non-sliceable element '{}'; recording as an alias",
            child.id
        ));
        alias_map.insert(
            format!("{}:{slice}", child.id),
            AliasTarget {
                id: child.id.clone(),
                path: child.path.clone(),
            },
        );
        return splice_back(elements, start, end, &slab_tree);
    }

    if child.children.iter().any(|c| c.slice_name.as_deref() == Some(slice)) {
        return splice_back(elements, start, end, &slab_tree);
    }

    if name.ends_with("[x]") {
        if let Some(head) = child.head_slice() {
            if let Some(types) = head.definition.as_ref().and_then(|d| d.types.as_ref()) {
                if let [single] = types.as_slice() {
                    if single.code.to_lowercase() == slice.to_lowercase() {
                        alias_map.insert(
                            format!("{}:{slice}", child.id),
                            AliasTarget {
                                id: child.id.clone(),
                                path: child.path.clone(),
                            },
                        );
                        return splice_back(elements, start, end, &slab_tree);
                    }
                }
            }
        }
    }

    let child_id = child.id.clone();
    let head = child
        .head_slice()
        .expect("sliceable child has a head-slice")
        .clone();
    let head_elements = tree::from_tree(&head)?;
    let new_prefix = format!("{child_id}:{slice}");
    let rewritten: Vec<ElementDefinition> = head_elements
        .into_iter()
        .map(|mut e| {
            if let Some(id) = &e.id {
                e.id = Some(tree::rewrite_id(id, &child_id, &new_prefix));
            }
            e
        })
        .collect();
    let mut slice_root = tree::to_tree(&rewritten)?;
    slice_root.kind = NodeKind::Slice;
    slice_root.slice_name = Some(slice.to_string());
    if let Some(def) = &mut slice_root.definition {
        def.slicing = None;
        def.must_support = None;
        def.slice_name = Some(slice.to_string());
    }

    effective_root.children[child_index].children.push(slice_root);

    splice_back(elements, start, end, &slab_tree)
}

/// Walks `target_id`'s segments left-to-right from the root, calling
/// `EnsureChild` per segment (spec §4.6).
pub async fn ensure_branch(
    elements: &mut Vec<ElementDefinition>,
    target_id: &str,
    fetcher: &DefinitionFetcher,
    logger: &dyn SnapshotLogger,
    alias_map: &mut AliasMap,
    package: &str,
) -> Result<()> {
    let segments: Vec<&str> = target_id.split('.').collect();
    let root_id = elements.first().and_then(|e| e.id.as_deref()).unwrap_or("");
    if segments.first() != Some(&root_id) {
        return Err(Error::RootMismatch {
            id: target_id.to_string(),
            package: package.to_string(),
        });
    }

    let mut canonical_parent = segments[0].to_string();
    for segment in &segments[1..] {
        let rewritten_parent = alias_map.rewrite_exact_transitive(&canonical_parent);
        ensure_child(elements, &rewritten_parent, segment, fetcher, logger, alias_map, package).await?;
        canonical_parent = format!("{canonical_parent}.{segment}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::TracingLogger;
    use async_trait::async_trait;
    use fsg_context::{MetaSelector, PackageExplorer, PackageId};
    use fsg_models::{ElementDefinitionBase, StructureDefinition};
    use serde_json::json;
    use std::sync::Arc;

    struct UnusedExplorer;

    #[async_trait]
    impl PackageExplorer for UnusedExplorer {
        async fn resolve_by_filename(&self, _package: &PackageId, _filename: &str) -> fsg_context::Result<StructureDefinition> {
            unimplemented!("not exercised by these tests")
        }
        async fn resolve_meta(
            &self,
            _kind: &str,
            _selector: MetaSelector,
            _package_filter: Option<&PackageId>,
        ) -> fsg_context::Result<(PackageId, StructureDefinition)> {
            unimplemented!("not exercised by these tests")
        }
        async fn lookup_meta(&self, _filter: fsg_context::MetaFilter) -> fsg_context::Result<Vec<StructureDefinition>> {
            unimplemented!("not exercised by these tests")
        }
        async fn list_profiles(&self, _package: &PackageId) -> fsg_context::Result<Vec<StructureDefinition>> {
            unimplemented!("not exercised by these tests")
        }
        fn context_packages(&self) -> &[PackageId] {
            &[]
        }
        async fn direct_dependencies(&self, _pkg: &PackageId) -> fsg_context::Result<Vec<PackageId>> {
            unimplemented!("not exercised by these tests")
        }
        async fn package_manifest(&self, _pkg: &PackageId) -> fsg_context::Result<fsg_package::PackageManifest> {
            unimplemented!("not exercised by these tests")
        }
        fn cache_path(&self) -> &std::path::Path {
            std::path::Path::new("/unused")
        }
    }

    struct UnusedSnapshotSource;

    #[async_trait]
    impl crate::fetcher::SnapshotSource for UnusedSnapshotSource {
        async fn fetch_snapshot(&self, _url: &str) -> Result<Vec<ElementDefinition>> {
            unimplemented!("not exercised by these tests")
        }
    }

    fn never_called_fetcher() -> DefinitionFetcher {
        DefinitionFetcher::new(
            Arc::new(UnusedExplorer),
            Arc::new(UnusedSnapshotSource),
            PackageId {
                id: "example.profiles".to_string(),
                version: "1.0.0".to_string(),
            },
            PackageId {
                id: "hl7.fhir.r4.core".to_string(),
                version: "4.0.1".to_string(),
            },
            "http://hl7.org/fhir".to_string(),
        )
    }

    fn elem(id: &str, path: &str) -> ElementDefinition {
        serde_json::from_value(json!({ "id": id, "path": path })).unwrap()
    }

    fn array_elem(id: &str, path: &str) -> ElementDefinition {
        let mut e = elem(id, path);
        e.base = Some(ElementDefinitionBase {
            path: path.to_string(),
            min: 0,
            max: "*".to_string(),
        });
        e
    }

    #[tokio::test]
    async fn slice_request_under_scalar_child_is_recorded_as_alias() {
        let mut elements = vec![elem("Patient", "Patient"), elem("Patient.birthDate", "Patient.birthDate")];
        let fetcher = never_called_fetcher();
        let logger = TracingLogger;
        let mut alias_map = AliasMap::new();

        ensure_child(&mut elements, "Patient", "birthDate:IssueDate", &fetcher, &logger, &mut alias_map, "pkg@1")
            .await
            .unwrap();

        let rewritten = alias_map.rewrite_prefix("Patient.birthDate:IssueDate", |t| &t.id);
        assert_eq!(rewritten, "Patient.birthDate");
    }

    #[tokio::test]
    async fn already_materialised_slice_is_a_no_op() {
        let mrn = {
            let mut e = elem("Patient.identifier:mrn", "Patient.identifier");
            e.slice_name = Some("mrn".to_string());
            e
        };
        let mut elements = vec![
            elem("Patient", "Patient"),
            array_elem("Patient.identifier", "Patient.identifier"),
            mrn,
        ];
        let fetcher = never_called_fetcher();
        let logger = TracingLogger;
        let mut alias_map = AliasMap::new();

        ensure_child(&mut elements, "Patient", "identifier:mrn", &fetcher, &logger, &mut alias_map, "pkg@1")
            .await
            .unwrap();

        let ids: Vec<_> = elements.iter().map(|e| e.id.clone().unwrap()).collect();
        assert_eq!(ids, vec!["Patient", "Patient.identifier", "Patient.identifier:mrn"]);
    }

    #[tokio::test]
    async fn synthesises_a_slice_from_the_head_slice_template() {
        let mut elements = vec![
            elem("Patient", "Patient"),
            array_elem("Patient.identifier", "Patient.identifier"),
            elem("Patient.identifier.system", "Patient.identifier.system"),
        ];
        let fetcher = never_called_fetcher();
        let logger = TracingLogger;
        let mut alias_map = AliasMap::new();

        ensure_child(&mut elements, "Patient", "identifier:mrn", &fetcher, &logger, &mut alias_map, "pkg@1")
            .await
            .unwrap();

        let ids: Vec<_> = elements.iter().map(|e| e.id.clone().unwrap()).collect();
        assert_eq!(
            ids,
            vec![
                "Patient".to_string(),
                "Patient.identifier".to_string(),
                "Patient.identifier.system".to_string(),
                "Patient.identifier:mrn".to_string(),
                "Patient.identifier:mrn.system".to_string(),
            ]
        );
        let slice = elements.iter().find(|e| e.id.as_deref() == Some("Patient.identifier:mrn")).unwrap();
        assert_eq!(slice.slice_name.as_deref(), Some("mrn"));
    }

    #[tokio::test]
    async fn ensure_branch_rejects_mismatched_root() {
        let mut elements = vec![elem("Patient", "Patient")];
        let fetcher = never_called_fetcher();
        let logger = TracingLogger;
        let mut alias_map = AliasMap::new();

        let err = ensure_branch(&mut elements, "Observation.status", &fetcher, &logger, &mut alias_map, "pkg@1")
            .await
            .unwrap_err();
        assert_eq!(err.as_code(), "root-mismatch");
    }
}
