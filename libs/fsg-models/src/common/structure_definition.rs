//! FHIR StructureDefinition model
//!
//! Version-agnostic model for StructureDefinitions that works across R4, R4B, and R5.

use super::complex::*;
use super::element_definition::{Differential, ElementDefinition, Snapshot};
use super::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// FHIR StructureDefinition resource
///
/// Defines the structure, constraints, and terminology bindings for FHIR resources and data types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StructureDefinition {
    #[serde(default = "default_resource_type")]
    pub resource_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Canonical identifier for this structure definition (unique globally)
    pub url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(
        rename = "versionAlgorithmString",
        skip_serializing_if = "Option::is_none"
    )]
    pub version_algorithm_string: Option<String>,

    #[serde(
        rename = "versionAlgorithmCoding",
        skip_serializing_if = "Option::is_none"
    )]
    pub version_algorithm_coding: Option<Coding>,

    #[serde(default)]
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    pub status: PublicationStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<ContactDetail>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_context: Option<Vec<UsageContext>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub jurisdiction: Option<Vec<Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub copyright: Option<String>,

    /// FHIR Version this StructureDefinition targets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fhir_version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Vec<StructureDefinitionMapping>>,

    /// Kind of structure (primitive-type | complex-type | resource | logical)
    pub kind: StructureDefinitionKind,

    #[serde(rename = "abstract")]
    pub is_abstract: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<StructureDefinitionContext>>,

    /// Type defined or constrained by this structure
    #[serde(rename = "type")]
    pub type_: String,

    /// Definition that this type is constrained/specialized from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_definition: Option<String>,

    /// Derivation type (specialization | constraint)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation: Option<TypeDerivationRule>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub differential: Option<Differential>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<Vec<Coding>>,

    /// Additional content beyond core fields, including the `__core_package`
    /// annotation the engine attaches to generated snapshots (spec §6).
    #[serde(flatten)]
    pub extensions: HashMap<String, Value>,
}

fn default_resource_type() -> String {
    "StructureDefinition".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StructureDefinitionKind {
    PrimitiveType,
    ComplexType,
    Resource,
    Logical,
}

/// How the type relates to its baseDefinition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeDerivationRule {
    Specialization,
    Constraint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureDefinitionMapping {
    pub identity: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureDefinitionContext {
    #[serde(rename = "type")]
    pub context_type: String,

    pub expression: String,
}

/// Top-level annotation the engine attaches to every returned snapshot,
/// identifying the base-library package used for type resolution (spec §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorePackageRef {
    pub id: String,
    pub version: String,
}

const CORE_PACKAGE_KEY: &str = "__core_package";

impl StructureDefinition {
    pub fn new(
        url: impl Into<String>,
        name: impl Into<String>,
        kind: StructureDefinitionKind,
        type_: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: "StructureDefinition".to_string(),
            id: None,
            url: url.into(),
            version: None,
            version_algorithm_string: None,
            version_algorithm_coding: None,
            name: name.into(),
            title: None,
            status: PublicationStatus::Draft,
            experimental: None,
            date: None,
            publisher: None,
            contact: None,
            description: None,
            use_context: None,
            jurisdiction: None,
            purpose: None,
            copyright: None,
            fhir_version: None,
            mapping: None,
            kind,
            is_abstract: false,
            context: None,
            type_: type_.into(),
            base_definition: None,
            derivation: None,
            snapshot: None,
            differential: None,
            keyword: None,
            extensions: HashMap::new(),
        }
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(Error::from)
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(Error::from)
    }

    pub fn get_root_element(&self) -> Option<&ElementDefinition> {
        self.snapshot.as_ref().and_then(|s| s.element.first())
    }

    pub fn get_element_by_path(&self, path: &str) -> Option<&ElementDefinition> {
        self.snapshot
            .as_ref()
            .and_then(|s| s.element.iter().find(|e| e.path == path))
    }

    pub fn get_elements(&self) -> Option<&[ElementDefinition]> {
        self.snapshot.as_ref().map(|s| s.element.as_slice())
    }

    pub fn is_resource(&self) -> bool {
        self.kind == StructureDefinitionKind::Resource
    }

    pub fn is_extension(&self) -> bool {
        self.type_ == "Extension"
    }

    /// Check if this is a profile (constraint on another definition)
    pub fn is_profile(&self) -> bool {
        self.derivation == Some(TypeDerivationRule::Constraint)
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn has_differential(&self) -> bool {
        self.differential.is_some()
    }

    pub fn get_versioned_url(&self) -> String {
        match &self.version {
            Some(v) => format!("{}|{}", self.url, v),
            None => self.url.clone(),
        }
    }

    pub fn get_base_type_name(&self) -> Option<String> {
        self.base_definition
            .as_ref()
            .and_then(|url| url.rsplit('/').next().map(|s| s.to_string()))
    }

    /// Attach the `__core_package` annotation the orchestrator stamps on every
    /// returned snapshot (spec §6, §4.9).
    pub fn set_core_package(&mut self, id: impl Into<String>, version: impl Into<String>) {
        let value = serde_json::to_value(CorePackageRef {
            id: id.into(),
            version: version.into(),
        })
        .expect("CorePackageRef always serializes");
        self.extensions.insert(CORE_PACKAGE_KEY.to_string(), value);
    }

    pub fn core_package(&self) -> Option<CorePackageRef> {
        self.extensions
            .get(CORE_PACKAGE_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}
