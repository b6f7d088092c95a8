//! Diff applier (spec §4.7): consumes migrated base elements and a
//! differential, in source order, producing a new element sequence.

use fsg_models::ElementDefinition;

use crate::ensure::{self, AliasMap};
use crate::error::Result;
use crate::fetcher::DefinitionFetcher;
use crate::logger::SnapshotLogger;
use crate::merge;

/// Apply `differential` onto `base_elements` (already migrated), returning
/// the derived element sequence.
pub async fn apply(
    base_elements: Vec<ElementDefinition>,
    differential: &[ElementDefinition],
    fetcher: &DefinitionFetcher,
    logger: &dyn SnapshotLogger,
    package: &str,
) -> Result<Vec<ElementDefinition>> {
    let mut elements = base_elements;
    if let Some(root) = elements.first_mut() {
        root.extensions.remove("extension");
    }

    let mut alias_map = AliasMap::new();

    for entry in differential {
        let entry_id = entry.id.clone().unwrap_or_else(|| entry.path.clone());

        let present = elements.iter().any(|e| e.id.as_deref() == Some(entry_id.as_str()));
        if !present {
            ensure::ensure_branch(&mut elements, &entry_id, fetcher, logger, &mut alias_map, package).await?;
        }

        let rewritten_id = alias_map.rewrite_prefix(&entry_id, |t| &t.id);
        let rewritten_path = alias_map.rewrite_prefix(&entry.path, |t| &t.path);

        let mut rewritten_entry = entry.clone();
        rewritten_entry.id = Some(rewritten_id.clone());
        rewritten_entry.path = rewritten_path;

        let target_index = elements
            .iter()
            .position(|e| e.id.as_deref() == Some(rewritten_id.as_str()))
            .ok_or_else(|| crate::error::Error::IllegalChild {
                parent_id: rewritten_id.clone(),
                segment: String::new(),
                package: package.to_string(),
            })?;

        let merged = merge::merge(&elements[target_index], &rewritten_entry, package)?;
        elements[target_index] = merged;
    }

    Ok(elements)
}
