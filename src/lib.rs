//! POSIX-like file system semantics over a flat `gs://` object store.
//!
//! The store knows only `{bucket, object}` pairs; directories are
//! synthesized from object-name prefixes, materialized as zero-byte
//! placeholder objects, and inferred when absent. [`fs::GcsFileSystem`] is
//! the public surface; beneath it sit a typed store client with retries and
//! write preconditions ([`storage`]), a directory list cache that masks
//! eventually-consistent listings ([`cache`]), and a background updater for
//! parent-directory modification times ([`timestamps`]).

pub mod cache;
pub mod error;
pub mod fs;
pub mod info;
pub mod options;
pub mod paths;
pub mod resource_id;
pub mod storage;
pub mod timestamps;

pub use error::GcsFsError;
pub use fs::{CreateFileOptions, GcsFileSystem};
pub use info::{FileInfo, ItemInfo};
pub use options::GcsFsOptions;
pub use resource_id::ResourceId;
