//! Single-element merge (spec §4.3).

use serde_json::Value;

use fsg_models::ElementDefinition;

use crate::error::{Error, Result};

/// Merge `diff` onto `base`, per spec §4.3. Precondition: `diff.id ==
/// base.id` (or both `None`, in which case the path acts as the id).
pub fn merge(base: &ElementDefinition, diff: &ElementDefinition, package: &str) -> Result<ElementDefinition> {
    if diff.id != base.id {
        return Err(Error::IdMismatch {
            diff_id: diff.id.clone().unwrap_or_default(),
            base_id: base.id.clone().unwrap_or_default(),
            package: package.to_string(),
        });
    }

    let mut merged = base.clone();

    merged.id = base.id.clone();
    merged.path = base.path.clone();

    macro_rules! overwrite {
        ($field:ident) => {
            if diff.$field.is_some() {
                merged.$field = diff.$field.clone();
            }
        };
    }

    overwrite!(representation);
    overwrite!(slice_name);
    overwrite!(slice_is_constraining);
    overwrite!(short);
    overwrite!(definition);
    overwrite!(comment);
    overwrite!(requirements);
    overwrite!(alias);
    overwrite!(min);
    overwrite!(max);
    overwrite!(base);
    overwrite!(content_reference);
    overwrite!(types);
    overwrite!(default_value);
    overwrite!(meaning_when_missing);
    overwrite!(order_meaning);
    overwrite!(fixed);
    overwrite!(pattern);
    overwrite!(example);
    overwrite!(min_value);
    overwrite!(max_value);
    overwrite!(max_length);
    overwrite!(is_modifier);
    overwrite!(is_modifier_reason);
    overwrite!(is_summary);
    overwrite!(binding);
    overwrite!(slicing);
    overwrite!(must_support);

    for (key, value) in &diff.extensions {
        merged.extensions.insert(key.clone(), value.clone());
    }

    merged.constraint = match (&base.constraint, &diff.constraint) {
        (Some(b), Some(d)) => Some(b.iter().cloned().chain(d.iter().cloned()).collect()),
        (Some(b), None) => Some(b.clone()),
        (None, Some(d)) => Some(d.clone()),
        (None, None) => None,
    };

    merged.condition = match (&base.condition, &diff.condition) {
        (Some(b), Some(d)) => {
            let mut out = b.clone();
            for c in d {
                if !out.contains(c) {
                    out.push(c.clone());
                }
            }
            Some(out)
        }
        (Some(b), None) => Some(b.clone()),
        (None, Some(d)) => Some(d.clone()),
        (None, None) => None,
    };

    merged.mapping = match (&base.mapping, &diff.mapping) {
        (Some(b), Some(d)) => {
            let mut out = b.clone();
            for m in d {
                let m_value = serde_json::to_value(m).unwrap_or(Value::Null);
                let already_present = out
                    .iter()
                    .any(|existing| serde_json::to_value(existing).unwrap_or(Value::Null) == m_value);
                if !already_present {
                    out.push(m.clone());
                }
            }
            Some(out)
        }
        (Some(b), None) => Some(b.clone()),
        (None, Some(d)) => Some(d.clone()),
        (None, None) => None,
    };

    // Post-condition fixup: a sliceName left over from a polymorphic
    // shortcut merge is cleared unless it is still the suffix of the id.
    if let Some(slice_name) = &merged.slice_name {
        let id_suffix = merged
            .id
            .as_ref()
            .and_then(|id| id.rsplit(':').next())
            .map(String::from);
        if id_suffix.as_deref() != Some(slice_name.as_str()) {
            merged.slice_name = None;
        }
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsg_models::{ConstraintSeverity, ElementDefinitionConstraint};
    use serde_json::json;

    fn elem(id: &str, path: &str) -> ElementDefinition {
        serde_json::from_value(json!({ "id": id, "path": path })).unwrap()
    }

    fn constraint(key: &str) -> ElementDefinitionConstraint {
        ElementDefinitionConstraint {
            key: key.to_string(),
            requirements: None,
            severity: ConstraintSeverity::Error,
            human: key.to_string(),
            expression: None,
            xpath: None,
            source: None,
        }
    }

    #[test]
    fn id_mismatch_fails() {
        let base = elem("Patient.name", "Patient.name");
        let diff = elem("Patient.other", "Patient.other");
        let err = merge(&base, &diff, "pkg@1").unwrap_err();
        assert_eq!(err.as_code(), "id-mismatch");
    }

    #[test]
    fn id_and_path_retained_from_base_even_if_diff_differs() {
        let mut base = elem("Patient.name", "Patient.name");
        base.short = Some("base short".to_string());
        let diff = elem("Patient.name", "Patient.name");
        let merged = merge(&base, &diff, "pkg@1").unwrap();
        assert_eq!(merged.id, base.id);
        assert_eq!(merged.path, base.path);
    }

    #[test]
    fn diff_overwrites_scalar_fields() {
        let mut base = elem("Patient.name", "Patient.name");
        base.short = Some("base".to_string());
        let mut diff = elem("Patient.name", "Patient.name");
        diff.short = Some("overridden".to_string());
        let merged = merge(&base, &diff, "pkg@1").unwrap();
        assert_eq!(merged.short.as_deref(), Some("overridden"));
    }

    #[test]
    fn constraint_concatenates() {
        let mut base = elem("Patient.name", "Patient.name");
        base.constraint = Some(vec![constraint("ele-1")]);
        let mut diff = elem("Patient.name", "Patient.name");
        diff.constraint = Some(vec![constraint("ext-1")]);
        let merged = merge(&base, &diff, "pkg@1").unwrap();
        let keys: Vec<_> = merged.constraint.unwrap().into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["ele-1".to_string(), "ext-1".to_string()]);
    }

    #[test]
    fn condition_is_an_ordered_set_union() {
        let mut base = elem("Patient.name", "Patient.name");
        base.condition = Some(vec!["ele-1".to_string(), "ext-1".to_string()]);
        let mut diff = elem("Patient.name", "Patient.name");
        diff.condition = Some(vec!["ext-1".to_string(), "ele-2".to_string()]);
        let merged = merge(&base, &diff, "pkg@1").unwrap();
        assert_eq!(
            merged.condition.unwrap(),
            vec!["ele-1".to_string(), "ext-1".to_string(), "ele-2".to_string()]
        );
    }

    #[test]
    fn identity_merge_is_idempotent_except_for_accumulators() {
        let mut e = elem("Patient.name", "Patient.name");
        e.constraint = Some(vec![constraint("ele-1")]);
        let merged = merge(&e, &e, "pkg@1").unwrap();
        assert_eq!(merged.constraint.as_ref().unwrap().len(), 2 * e.constraint.as_ref().unwrap().len());
        assert_eq!(merged.id, e.id);
        assert_eq!(merged.path, e.path);
    }

    #[test]
    fn stale_slice_name_not_matching_id_suffix_is_cleared() {
        let base = elem("Observation.value[x]", "Observation.value[x]");
        let mut diff = elem("Observation.value[x]", "Observation.value[x]");
        diff.slice_name = Some("stale".to_string());
        let merged = merge(&base, &diff, "pkg@1").unwrap();
        assert_eq!(merged.slice_name, None);
    }
}
