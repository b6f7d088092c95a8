//! Error taxonomy for the snapshot derivation engine.
//!
//! Every caller-visible error carries a message stating the identifier, the
//! originating package `id@version`, and a stable string identifier
//! (`as_code`) so callers can match on failure kind without parsing text
//! (spec §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {identifier} ({package})")]
    NotFound { identifier: String, package: String },

    #[error("no base definition: {identifier} ({package})")]
    NoBaseDefinition { identifier: String, package: String },

    #[error("no snapshot: {identifier} ({package})")]
    NoSnapshot { identifier: String, package: String },

    #[error("no differential: {identifier} ({package})")]
    NoDifferential { identifier: String, package: String },

    #[error("cannot expand {node_id}: no type information and no content reference ({package})")]
    CannotExpand { node_id: String, package: String },

    #[error("parent not found for id {id} ({package})")]
    ParentNotFound { id: String, package: String },

    #[error("illegal child '{segment}' under '{parent_id}' ({package})")]
    IllegalChild {
        parent_id: String,
        segment: String,
        package: String,
    },

    #[error("id mismatch: diff id {diff_id} != base id {base_id} ({package})")]
    IdMismatch {
        diff_id: String,
        base_id: String,
        package: String,
    },

    #[error("root mismatch: differential id {id} does not share the profile's root ({package})")]
    RootMismatch { id: String, package: String },

    #[error("unsupported derivation '{derivation}' for {url} ({package})")]
    UnsupportedDerivation {
        url: String,
        derivation: String,
        package: String,
    },

    #[error("unaccepted FHIR version: {0}")]
    VersionUnknown(String),

    #[error("tree: missing definition on node {0}")]
    MissingDefinition(String),

    #[error("context error: {0}")]
    Context(#[from] fsg_context::Error),

    #[error("model error: {0}")]
    Model(#[from] fsg_models::Error),

    #[error("cache IO error: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("cache JSON error: {0}")]
    CacheJson(#[from] serde_json::Error),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("snapshot generation failed: {0}")]
    Generation(String),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// The stable string identifier for this error kind (spec §7).
    pub fn as_code(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not-found",
            Error::NoBaseDefinition { .. } => "no-base-definition",
            Error::NoSnapshot { .. } => "no-snapshot",
            Error::NoDifferential { .. } => "no-differential",
            Error::CannotExpand { .. } => "cannot-expand",
            Error::ParentNotFound { .. } => "parent-not-found",
            Error::IllegalChild { .. } => "illegal-child",
            Error::IdMismatch { .. } => "id-mismatch",
            Error::RootMismatch { .. } => "root-mismatch",
            Error::UnsupportedDerivation { .. } => "unsupported-derivation",
            Error::VersionUnknown(_) => "version-unknown",
            Error::MissingDefinition(_) => "missing-definition",
            Error::Context(_) => "context-error",
            Error::Model(_) => "model-error",
            Error::CacheIo(_) => "cache-io",
            Error::CacheJson(_) => "cache-json",
            Error::Lock(_) => "lock-error",
            Error::Generation(_) => "generation-error",
            Error::Config(_) => "config-error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
