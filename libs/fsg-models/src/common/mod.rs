//! Version-agnostic FHIR models
//!
//! Types that work across FHIR R4, R4B, and R5

pub mod complex;
pub mod element_definition;
pub mod error;
pub mod structure_definition;

// Re-export commonly used types
pub use complex::*;
pub use element_definition::*;
pub use error::{Error, Result};
pub use structure_definition::*;
