//! Element migrator (spec §4.2): applied once to a base snapshot at the
//! moment it is consumed as the parent of a derivation.

use std::sync::OnceLock;

use fsg_models::ElementDefinition;
use regex::Regex;
use serde_json::Value;

/// Extensions on the root element removed by the migrator (spec §6), all
/// under the base-library namespace.
const BLOCKED_ROOT_EXTENSIONS: &[&str] = &[
    "structuredefinition-fmm",
    "structuredefinition-fmm-no-warnings",
    "structuredefinition-hierarchy",
    "structuredefinition-interface",
    "structuredefinition-normative-version",
    "structuredefinition-applicable-version",
    "structuredefinition-category",
    "structuredefinition-codegen-super",
    "structuredefinition-security-category",
    "structuredefinition-standards-status",
    "structuredefinition-summary",
    "structuredefinition-wg",
    "replaces",
    "resource-approvalDate",
    "resource-effectivePeriod",
    "resource-lastReviewDate",
];

fn markdown_link_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[([^\]]*)\]\(([^)]+)\)").unwrap())
}

fn scheme_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*:").unwrap())
}

/// Migrate a base element sequence before it is used as the parent of a
/// derivation. `source_url` is the canonical URL the elements were fetched
/// from; `base_namespace` is the configured base-library namespace (e.g.
/// `http://hl7.org/fhir`).
pub fn migrate(elements: &[ElementDefinition], source_url: &str, base_namespace: &str) -> Vec<ElementDefinition> {
    let mut elements: Vec<ElementDefinition> = elements.to_vec();

    if let Some(root) = elements.first_mut() {
        filter_root_extensions(root, base_namespace);
    }

    let rewrite_links = source_url.starts_with(base_namespace);
    for element in &mut elements {
        if rewrite_links {
            rewrite_relative_links(element, base_namespace);
        }
        stamp_constraint_sources(element, source_url);
    }

    elements
}

fn filter_root_extensions(root: &mut ElementDefinition, base_namespace: &str) {
    let Some(Value::Array(entries)) = root.extensions.get_mut("extension") else {
        return;
    };
    entries.retain(|entry| {
        let url = entry.get("url").and_then(Value::as_str).unwrap_or("");
        !(url.starts_with(base_namespace)
            && BLOCKED_ROOT_EXTENSIONS.iter().any(|blocked| url.ends_with(blocked)))
    });
    if entries.is_empty() {
        root.extensions.remove("extension");
    }
}

fn rewrite_relative_links(element: &mut ElementDefinition, base_namespace: &str) {
    for field in [
        &mut element.definition,
        &mut element.comment,
        &mut element.requirements,
        &mut element.meaning_when_missing,
    ] {
        if let Some(text) = field {
            *field = Some(rewrite_markdown(text, base_namespace));
        }
    }
}

fn rewrite_markdown(text: &str, base_namespace: &str) -> String {
    markdown_link_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            let label = &caps[1];
            let target = &caps[2];
            if scheme_pattern().is_match(target) {
                caps[0].to_string()
            } else {
                format!("[{label}]({base_namespace}/{target})")
            }
        })
        .into_owned()
}

fn stamp_constraint_sources(element: &mut ElementDefinition, source_url: &str) {
    let Some(constraints) = &mut element.constraint else {
        return;
    };
    for constraint in constraints {
        if constraint.source.is_none() {
            constraint.source = Some(source_url.to_string());
        }
    }
}
