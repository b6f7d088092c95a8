//! Element classifier, path rewriting, and the element↔tree transform
//! (spec §3, §4.1).

use fsg_models::ElementDefinition;

use crate::error::{Error, Result};

/// A node's kind, classified per spec §3 in semantic (not syntactic) order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Element,
    Array,
    Poly,
    Slice,
    Resliced,
    HeadSlice,
}

impl NodeKind {
    /// `array`, `poly`, and `resliced` are containers: they carry no
    /// definition of their own and must have a head-slice first child.
    pub fn is_sliceable(self) -> bool {
        matches!(self, NodeKind::Array | NodeKind::Poly | NodeKind::Resliced)
    }

    pub fn carries_definition(self) -> bool {
        matches!(self, NodeKind::Element | NodeKind::Slice | NodeKind::HeadSlice)
    }
}

fn element_id(e: &ElementDefinition) -> &str {
    e.id.as_deref().unwrap_or(&e.path)
}

fn last_segment(id: &str) -> &str {
    id.rsplit('.').next().unwrap_or(id)
}

fn max_is_array(max: &str) -> bool {
    max == "*" || max.parse::<u32>().map(|n| n > 1).unwrap_or(false)
}

/// `to_node_type`: classify one element. Order is semantic, per spec §3.
pub fn classify(e: &ElementDefinition) -> NodeKind {
    let id = element_id(e);
    if id.ends_with("[x]") {
        return NodeKind::Poly;
    }
    if e.slice_name.is_some() && e.slicing.is_some() {
        return NodeKind::Resliced;
    }
    if e.slice_name.is_some() {
        return NodeKind::Slice;
    }
    if let Some(base) = &e.base {
        if max_is_array(&base.max) {
            return NodeKind::Array;
        }
    }
    NodeKind::Element
}

/// Strip `:slicename` suffixes from every dot-segment of `id_or_path`,
/// matching the id→path slice-stripping rule used by both the classifier's
/// parent lookup and path rewriting (spec §3, §4.1).
pub fn strip_slice_names(id_or_path: &str) -> String {
    id_or_path
        .split('.')
        .map(|seg| seg.split(':').next().unwrap_or(seg))
        .collect::<Vec<_>>()
        .join(".")
}

/// The parent id for a given child id, and whether the child's own last
/// segment carries a slice name (in which case it attaches directly to a
/// sliceable container rather than to that container's head-slice).
///
/// Per spec §3: "if seg ends with `:slicename`, the parent id is the prefix
/// with the final segment stripped of its `:slicename`... otherwise the
/// ordinary parent of the last dotted segment."
pub fn parent_id_of(id: &str) -> Option<(String, bool)> {
    let last_dot = id.rfind('.')?;
    let prefix = &id[..last_dot];
    let seg = &id[last_dot + 1..];
    if let Some(colon) = seg.find(':') {
        let base_seg = &seg[..colon];
        Some((format!("{prefix}.{base_seg}"), true))
    } else {
        Some((prefix.to_string(), false))
    }
}

/// Rewrite one id: `old_prefix` → `new_prefix`, `old_prefix + "."` → `new_prefix + "."`.
pub fn rewrite_id(id: &str, old_prefix: &str, new_prefix: &str) -> String {
    if id == old_prefix {
        new_prefix.to_string()
    } else if let Some(rest) = id.strip_prefix(&format!("{old_prefix}.")) {
        format!("{new_prefix}.{rest}")
    } else {
        id.to_string()
    }
}

/// Rewrite one path: the same prefix swap, but slice-names are stripped
/// from both prefixes before comparison (paths never carry slice names).
pub fn rewrite_path(path: &str, old_prefix: &str, new_prefix: &str) -> String {
    let old_prefix = strip_slice_names(old_prefix);
    let new_prefix = strip_slice_names(new_prefix);
    rewrite_id(path, &old_prefix, &new_prefix)
}

/// `rewrite_prefix`: apply id/path rewriting to a whole element sequence.
pub fn rewrite_elements(
    elements: &[ElementDefinition],
    old_prefix: &str,
    new_prefix: &str,
) -> Vec<ElementDefinition> {
    elements
        .iter()
        .map(|e| {
            let mut e = e.clone();
            if let Some(id) = &e.id {
                e.id = Some(rewrite_id(id, old_prefix, new_prefix));
            }
            e.path = rewrite_path(&e.path, old_prefix, new_prefix);
            e
        })
        .collect()
}

/// A node in the working tree. `children` is owned directly (a `Vec` of
/// nodes, not an arena) since trees are transient per generation/operation
/// (spec §3 "Lifecycles").
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub id: String,
    pub path: String,
    pub id_segments: Vec<String>,
    pub path_segments: Vec<String>,
    pub kind: NodeKind,
    pub definition: Option<ElementDefinition>,
    pub slice_name: Option<String>,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn new(id: String, path: String, kind: NodeKind, definition: Option<ElementDefinition>) -> Self {
        let slice_name = definition.as_ref().and_then(|d| d.slice_name.clone());
        let slice_name = if kind == NodeKind::Slice || kind == NodeKind::Resliced {
            slice_name
        } else {
            None
        };
        Self {
            id_segments: id.split('.').map(String::from).collect(),
            path_segments: path.split('.').map(String::from).collect(),
            id,
            path,
            kind,
            definition,
            slice_name,
            children: Vec::new(),
        }
    }

    /// Build a leaf/simple node or a sliceable-container + synthetic
    /// head-slice composite, per the element's classified kind.
    fn from_element(e: &ElementDefinition, kind: NodeKind) -> Self {
        let id = element_id(e).to_string();
        if kind.is_sliceable() {
            let mut container = TreeNode::new(id.clone(), e.path.clone(), kind, None);
            // A resliced container still records its own slice name even
            // though its definition lives on the head-slice (spec §3
            // invariant: "slice_name mirrors definition.sliceName for
            // slice/resliced").
            if kind == NodeKind::Resliced {
                container.slice_name = e.slice_name.clone();
            }
            let headslice = TreeNode::new(id, e.path.clone(), NodeKind::HeadSlice, Some(e.clone()));
            container.children.push(headslice);
            container
        } else {
            TreeNode::new(id, e.path.clone(), kind, Some(e.clone()))
        }
    }

    pub fn find(&self, id: &str) -> Option<&TreeNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut TreeNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(id))
    }

    /// The head-slice child of a sliceable node (always the first child).
    pub fn head_slice_mut(&mut self) -> Option<&mut TreeNode> {
        if !self.kind.is_sliceable() {
            return None;
        }
        self.children.first_mut()
    }

    pub fn head_slice(&self) -> Option<&TreeNode> {
        if !self.kind.is_sliceable() {
            return None;
        }
        self.children.first()
    }

    /// Rewrite this node's id/path (and every descendant's) through a
    /// prefix swap, keeping id/path segments in lock-step (spec §3).
    pub fn rewrite_prefix(&mut self, old_prefix: &str, new_prefix: &str) {
        self.id = rewrite_id(&self.id, old_prefix, new_prefix);
        self.path = rewrite_path(&self.path, old_prefix, new_prefix);
        self.id_segments = self.id.split('.').map(String::from).collect();
        self.path_segments = self.path.split('.').map(String::from).collect();
        if let Some(def) = &mut self.definition {
            if let Some(id) = &def.id {
                def.id = Some(rewrite_id(id, old_prefix, new_prefix));
            }
            def.path = rewrite_path(&def.path, old_prefix, new_prefix);
        }
        for child in &mut self.children {
            child.rewrite_prefix(old_prefix, new_prefix);
        }
    }
}

/// Attach `node` under `parent`, per the attachment rule in spec §4.1: a
/// slice-named child attaches directly to its (already sliceable) parent;
/// otherwise it attaches to the parent's head-slice if the parent is
/// sliceable, or to the parent itself.
fn attach(parent: &mut TreeNode, attach_as_slice: bool, node: TreeNode) {
    if attach_as_slice || !parent.kind.is_sliceable() {
        parent.children.push(node);
    } else if let Some(head) = parent.head_slice_mut() {
        head.children.push(node);
    } else {
        parent.children.push(node);
    }
}

/// `to_tree(elements)`: the first element is the root (forced kind
/// `element`); every subsequent element is attached per spec §4.1.
pub fn to_tree(elements: &[ElementDefinition]) -> Result<TreeNode> {
    assert!(
        !elements.is_empty(),
        "to_tree requires a non-empty element sequence"
    );

    let root_elem = &elements[0];
    let mut root = TreeNode::from_element(root_elem, NodeKind::Element);

    for e in &elements[1..] {
        let id = element_id(e).to_string();
        let (parent_id, attach_as_slice) =
            parent_id_of(&id).expect("non-root element id always has a dotted parent segment");
        let kind = classify(e);
        let node = TreeNode::from_element(e, kind);
        let parent = root.find_mut(&parent_id).ok_or_else(|| Error::ParentNotFound {
            id: id.clone(),
            package: String::new(),
        })?;
        attach(parent, attach_as_slice, node);
    }

    Ok(root)
}

/// `from_tree(root)`: pre-order flatten, emitting only `element`/`slice`/
/// `headslice` definitions.
pub fn from_tree(root: &TreeNode) -> Result<Vec<ElementDefinition>> {
    let mut out = Vec::new();
    flatten_into(root, &mut out)?;
    Ok(out)
}

fn flatten_into(node: &TreeNode, out: &mut Vec<ElementDefinition>) -> Result<()> {
    if node.kind.carries_definition() {
        let def = node
            .definition
            .clone()
            .ok_or_else(|| Error::MissingDefinition(node.id.clone()))?;
        out.push(def);
    }
    for child in &node.children {
        flatten_into(child, out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsg_models::ElementDefinitionBase;
    use serde_json::json;

    fn elem(id: &str, path: &str) -> ElementDefinition {
        let mut v: ElementDefinition = serde_json::from_value(json!({
            "id": id,
            "path": path,
        }))
        .unwrap();
        v.path = path.to_string();
        v
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

    fn slice_elem(id: &str, path: &str, slice_name: &str) -> ElementDefinition {
        let mut e = elem(id, path);
        e.slice_name = Some(slice_name.to_string());
        e
    }

    #[test]
    fn classifies_poly_array_slice_and_plain() {
        assert_eq!(classify(&elem("Observation.value[x]", "Observation.value[x]")), NodeKind::Poly);
        assert_eq!(
            classify(&array_elem("Patient.identifier", "Patient.identifier")),
            NodeKind::Array
        );
        assert_eq!(
            classify(&slice_elem("Patient.identifier:mrn", "Patient.identifier", "mrn")),
            NodeKind::Slice
        );
        assert_eq!(classify(&elem("Patient.name", "Patient.name")), NodeKind::Element);
    }

    #[test]
    fn round_trip_simple_array_with_slices() {
        let elements = vec![
            elem("Patient", "Patient"),
            array_elem("Patient.identifier", "Patient.identifier"),
            slice_elem("Patient.identifier:mrn", "Patient.identifier", "mrn"),
            elem("Patient.identifier:mrn.system", "Patient.identifier.system"),
        ];
        let tree = to_tree(&elements).unwrap();
        assert_eq!(tree.kind, NodeKind::Element);

        let array_node = tree.find("Patient.identifier").unwrap();
        assert_eq!(array_node.kind, NodeKind::Array);
        assert_eq!(array_node.children.len(), 2); // headslice + mrn slice
        assert_eq!(array_node.children[0].kind, NodeKind::HeadSlice);
        assert_eq!(array_node.children[0].id, "Patient.identifier");
        assert_eq!(array_node.children[1].kind, NodeKind::Slice);
        assert_eq!(array_node.children[1].id, "Patient.identifier:mrn");
        assert_eq!(array_node.children[1].children.len(), 1);

        let flattened = from_tree(&tree).unwrap();
        let ids: Vec<_> = flattened.iter().map(|e| e.id.clone().unwrap()).collect();
        assert_eq!(
            ids,
            vec![
                "Patient".to_string(),
                "Patient.identifier".to_string(),
                "Patient.identifier:mrn".to_string(),
                "Patient.identifier:mrn.system".to_string(),
            ]
        );
    }

    #[test]
    fn missing_parent_is_an_error() {
        let elements = vec![elem("Patient", "Patient"), elem("Patient.name.given", "Patient.name.given")];
        let err = to_tree(&elements).unwrap_err();
        assert_eq!(err.as_code(), "parent-not-found");
    }

    #[test]
    fn rewrite_prefix_updates_id_and_path_in_lockstep() {
        let elements = vec![
            elem("Extension", "Extension"),
            array_elem("Extension.extension", "Extension.extension"),
            slice_elem("Extension.extension:foo", "Extension.extension", "foo"),
        ];
        let mut tree = to_tree(&elements).unwrap();
        tree.rewrite_prefix("Extension", "MyExtension");
        assert_eq!(tree.id, "MyExtension");
        let array_node = tree.find("MyExtension.extension").unwrap();
        assert_eq!(array_node.path, "MyExtension.extension");
        let slice_node = tree.find("MyExtension.extension:foo").unwrap();
        // id keeps the slice name, path does not.
        assert_eq!(slice_node.id, "MyExtension.extension:foo");
        assert_eq!(slice_node.path, "MyExtension.extension");
    }

    #[test]
    fn path_rewrite_commutativity() {
        let a = "Patient";
        let b = "MyPatient";
        let c = "YourPatient";
        assert_eq!(rewrite_id(&rewrite_id("Patient.name", a, b), b, c), rewrite_id("Patient.name", a, c));
    }
}
