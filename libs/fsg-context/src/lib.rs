//! Package explorer: the external collaborator the snapshot engine consumes
//! for raw differentials, base snapshots, metadata listing, and cache-path
//! discovery (spec §1). This crate owns the interface, a filesystem-backed
//! default implementation, and the base-library version resolver (spec
//! §4.10, §6). It performs no network access and no snapshot derivation.

pub mod error;
pub mod explorer;
pub mod fs_explorer;
pub mod package_id;
pub mod version;

pub use error::{Error, Result};
pub use explorer::{MetaFilter, MetaSelector, PackageExplorer};
pub use fs_explorer::FsPackageExplorer;
pub use package_id::{PackageId, PackageRef};
pub use version::{
    canonical_version, compatible_version_to_base_library, is_base_library_id,
    normalize_base_library_version, resolve_base_library, CanonicalVersion,
};
