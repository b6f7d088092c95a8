//! Error types for the package-explorer layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("package not found in context: {0}")]
    PackageNotFound(String),

    #[error("resource not found: kind={kind} selector={selector}")]
    ResourceNotFound { kind: String, selector: String },

    #[error("package manifest error: {0}")]
    Manifest(#[from] fsg_package::PackageError),

    #[error("invalid package reference: {0}")]
    InvalidPackageRef(String),

    #[error("unaccepted FHIR version: {0}")]
    VersionUnknown(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model error: {0}")]
    Model(#[from] fsg_models::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
