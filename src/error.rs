//! Error surface of the file-system facade.

use thiserror::Error;

use crate::resource_id::InvalidResourceId;
use crate::storage::StorageError;

/// Failures surfaced by [`crate::fs::GcsFileSystem`] operations.
///
/// Lookup routines never raise `NotFound`; they return not-found-marked
/// infos. `NotFound` comes only from operations whose contract requires the
/// path to exist.
#[derive(Debug, Error)]
pub enum GcsFsError {
    #[error(transparent)]
    InvalidPath(#[from] InvalidResourceId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("item not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Store-level failure, including precondition failures that survived
    /// retries.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl GcsFsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
