//! StructureDefinition snapshot derivation engine.
//!
//! Given a differential and a base snapshot, this crate builds the base as
//! a typed tree, ensures every element id referenced by a differential
//! entry exists (expanding on demand from referenced type definitions and
//! synthesising slices as needed), merges each differential entry into its
//! target, and flattens the tree back to an ordered element sequence.
//!
//! The pipeline, leaf modules first:
//! [`tree`] (classification, build, flatten) → [`migrator`] (inherited
//! element preparation) → [`merge`] (per-field merge rules) → [`fetcher`]
//! (memoised type/profile/content-reference resolution) → [`monopoly`]
//! (polymorphic aliasing) → [`ensure`] (on-demand materialisation) →
//! [`applier`] (differential iteration) → [`cache`] (mode logic, atomic IO,
//! locks) → [`orchestrator`] (identifier fan-out, derivation dispatch).

pub mod applier;
pub mod cache;
pub mod config;
pub mod ensure;
pub mod error;
pub mod fetcher;
pub mod logger;
pub mod merge;
pub mod migrator;
pub mod monopoly;
pub mod orchestrator;
pub mod tree;

pub use cache::{CacheMode, SnapshotCache};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use fetcher::{DefinitionFetcher, SnapshotSource};
pub use logger::{SnapshotLogger, TracingLogger};
pub use orchestrator::Orchestrator;
pub use tree::{NodeKind, TreeNode};
