//! Typed identifiers for entities in the flat object store.
//!
//! A `gs://` URI resolves to one of three kinds of resource: the global root
//! (`gs:/`), a bucket (`gs://bucket`), or an object within a bucket
//! (`gs://bucket/path/to/object`). The store itself only knows buckets and
//! objects; everything path-shaped is layered on top by this crate.

use std::fmt;

use thiserror::Error;

/// The only URI scheme the file system understands.
pub const SCHEME: &str = "gs";

/// Rendered form of the global root.
pub const ROOT_URI: &str = "gs:/";

/// Why a URI or name could not be turned into a [`ResourceId`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidResourceId {
    #[error("path supports only the '{SCHEME}' scheme, got '{0}'")]
    UnsupportedScheme(String),

    #[error("bucket name cannot be empty")]
    EmptyBucketName,

    #[error("bucket name must not contain '/', got '{0}'")]
    DelimiterInBucketName(String),

    #[error("path must include a non-empty object name, got '{0}'")]
    MissingObjectName(String),

    #[error("object name must not contain consecutive '/' characters, got '{0}'")]
    ConsecutiveDelimiters(String),
}

/// Identifies the global root, a bucket, or a single object.
///
/// Invariants held by construction: bucket names are non-empty and free of
/// `/`; object names are free of `//` and never start with `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Root,
    Bucket(String),
    Object { bucket: String, object: String },
}

impl ResourceId {
    /// Build a bucket id, validating the name. A single trailing `/` is
    /// tolerated and stripped, since callers often hold the directory form.
    pub fn bucket(name: &str) -> Result<Self, InvalidResourceId> {
        Ok(Self::Bucket(validate_bucket_name(name)?))
    }

    /// Build an object id, validating both parts.
    pub fn object(bucket: &str, object: &str) -> Result<Self, InvalidResourceId> {
        let bucket = validate_bucket_name(bucket)?;
        let object = validate_object_name(object, false)?;
        Ok(Self::Object { bucket, object })
    }

    /// Parse a `gs://bucket/object` URI.
    ///
    /// `allow_empty_object` controls whether a bare bucket (or the root) is
    /// acceptable; existence checks want it, `create`/`open` do not.
    pub fn parse(uri: &str, allow_empty_object: bool) -> Result<Self, InvalidResourceId> {
        if uri == ROOT_URI {
            return Ok(Self::Root);
        }

        let Some(rest) = uri.strip_prefix("gs://") else {
            let scheme = uri.split(':').next().unwrap_or(uri);
            return Err(InvalidResourceId::UnsupportedScheme(scheme.to_owned()));
        };

        let (bucket, object) = match rest.split_once('/') {
            Some((bucket, object)) => (bucket, object),
            None => (rest, ""),
        };

        let bucket = validate_bucket_name(bucket)?;
        let object = validate_object_name(object, allow_empty_object)?;

        if object.is_empty() {
            Ok(Self::Bucket(bucket))
        } else {
            Ok(Self::Object { bucket, object })
        }
    }

    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }

    pub fn is_bucket(&self) -> bool {
        matches!(self, Self::Bucket(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object { .. })
    }

    /// The bucket this resource lives in, if any.
    pub fn bucket_name(&self) -> Option<&str> {
        match self {
            Self::Root => None,
            Self::Bucket(name) => Some(name),
            Self::Object { bucket, .. } => Some(bucket),
        }
    }

    /// The object name, if this id names an object.
    pub fn object_name(&self) -> Option<&str> {
        match self {
            Self::Object { object, .. } => Some(object),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root => f.write_str(ROOT_URI),
            Self::Bucket(name) => write!(f, "gs://{name}"),
            Self::Object { bucket, object } => write!(f, "gs://{bucket}/{object}"),
        }
    }
}

/// Check a bucket name for file-system use. Not a replica of server-side
/// bucket naming rules; only what path layering requires.
fn validate_bucket_name(name: &str) -> Result<String, InvalidResourceId> {
    let name = name.strip_suffix('/').unwrap_or(name);
    if name.is_empty() {
        return Err(InvalidResourceId::EmptyBucketName);
    }
    if name.contains('/') {
        return Err(InvalidResourceId::DelimiterInBucketName(name.to_owned()));
    }
    Ok(name.to_owned())
}

/// Check an object name for file-system use: no `//`, leading `/` stripped.
fn validate_object_name(
    object: &str,
    allow_empty_object: bool,
) -> Result<String, InvalidResourceId> {
    if object.contains("//") {
        return Err(InvalidResourceId::ConsecutiveDelimiters(object.to_owned()));
    }

    let object = object.strip_prefix('/').unwrap_or(object);

    if object.is_empty() && !allow_empty_object {
        return Err(InvalidResourceId::MissingObjectName(object.to_owned()));
    }

    Ok(object.to_owned())
}
