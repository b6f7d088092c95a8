//! Monopoly-shortcut resolver (spec §4.5): resolves a polymorphic element
//! addressed by a type-specific alias, e.g. `Observation.valueQuantity` for
//! `Observation.value[x]`.

use crate::tree::{NodeKind, TreeNode};

/// The outcome of a successful monopoly-shortcut match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonopolyMatch {
    /// The poly node's own segment, e.g. `value[x]`.
    pub rewritten_segment: String,
    /// The type code the alias picked out, e.g. `Quantity`.
    pub type_code: String,
}

fn init_cap(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Scan `parent`'s children for a poly node whose id is
/// `<parent_id>.<base>[x]` where `<base>` is a prefix of `missing`, and
/// whose head-slice declares a type whose `InitCap`'d code completes
/// `missing`.
pub fn resolve(parent: &TreeNode, missing: &str) -> Option<MonopolyMatch> {
    for child in &parent.children {
        if child.kind != NodeKind::Poly {
            continue;
        }
        let own_segment = child.id.rsplit('.').next().unwrap_or(&child.id);
        let Some(base) = own_segment.strip_suffix("[x]") else {
            continue;
        };
        if !missing.starts_with(base) {
            continue;
        }
        let Some(head) = child.head_slice() else {
            continue;
        };
        let Some(def) = &head.definition else {
            continue;
        };
        let Some(types) = &def.types else {
            continue;
        };
        for t in types {
            let candidate = format!("{base}{}", init_cap(&t.code));
            if candidate == missing {
                return Some(MonopolyMatch {
                    rewritten_segment: own_segment.to_string(),
                    type_code: t.code.clone(),
                });
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::to_tree;
    use fsg_models::{ElementDefinition, ElementDefinitionBase, ElementDefinitionType};
    use serde_json::json;

    fn poly_elem(id: &str, path: &str, types: &[&str]) -> ElementDefinition {
        let mut e: ElementDefinition = serde_json::from_value(json!({ "id": id, "path": path })).unwrap();
        e.base = Some(ElementDefinitionBase {
            path: path.to_string(),
            min: 0,
            max: "1".to_string(),
        });
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

    #[test]
    fn resolves_value_quantity_to_value_x() {
        let elements = vec![
            serde_json::from_value::<ElementDefinition>(json!({ "id": "Observation", "path": "Observation" })).unwrap(),
            poly_elem("Observation.value[x]", "Observation.value[x]", &["Quantity", "CodeableConcept", "string"]),
        ];
        let tree = to_tree(&elements).unwrap();
        let result = resolve(&tree, "valueQuantity").unwrap();
        assert_eq!(result.rewritten_segment, "value[x]");
        assert_eq!(result.type_code, "Quantity");
    }

    #[test]
    fn no_match_for_unrelated_segment() {
        let elements = vec![
            serde_json::from_value::<ElementDefinition>(json!({ "id": "Observation", "path": "Observation" })).unwrap(),
            poly_elem("Observation.value[x]", "Observation.value[x]", &["Quantity"]),
        ];
        let tree = to_tree(&elements).unwrap();
        assert!(resolve(&tree, "status").is_none());
    }
}
