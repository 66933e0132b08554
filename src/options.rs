//! Configurable options for the file-system facade.

use std::path::PathBuf;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::CacheConfig;
use crate::storage::retry::RetryOptions;

/// Smallest accepted write chunk; smaller configured values round up.
pub const MIN_WRITE_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Which directory list cache backend to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheType {
    #[default]
    InMemory,
    FilesystemBacked,
}

/// Metadata cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MetadataCacheOptions {
    pub enabled: bool,
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    /// Shared mount for the filesystem-backed cache; required when that
    /// backend is selected.
    pub base_path: Option<PathBuf>,
    #[serde(flatten)]
    pub config: CacheConfig,
}

impl Default for MetadataCacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_type: CacheType::InMemory,
            base_path: None,
            config: CacheConfig::default(),
        }
    }
}

/// Background parent-timestamp update configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TimestampUpdateOptions {
    pub enabled: bool,
    /// Substrings a parent path must contain to be updated. Empty means
    /// everything is included.
    pub includes: Vec<String>,
    /// Substrings that exclude a parent path; excludes win over includes.
    pub excludes: Vec<String>,
}

impl Default for TimestampUpdateOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }
}

impl TimestampUpdateOptions {
    /// Whether the given rendered parent path participates in updates.
    pub fn should_update(&self, path: &str) -> bool {
        if self.excludes.iter().any(|e| path.contains(e.as_str())) {
            return false;
        }
        self.includes.is_empty() || self.includes.iter().any(|i| path.contains(i.as_str()))
    }
}

/// Options recognized by the facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GcsFsOptions {
    pub metadata_cache: MetadataCacheOptions,
    /// Treat directories implied by child objects as existing.
    pub infer_implicit_directories: bool,
    /// Materialize a zero-byte placeholder before returning a writer, so
    /// create conflicts fail fast instead of at close.
    pub create_marker_files: bool,
    pub timestamp_updates: TimestampUpdateOptions,
    /// Advisory POSIX permission bits reported for all items.
    pub reported_permissions: u32,
    pub write_chunk_size: ByteSize,
    pub retry: RetryOptions,
}

impl Default for GcsFsOptions {
    fn default() -> Self {
        Self {
            metadata_cache: MetadataCacheOptions::default(),
            infer_implicit_directories: true,
            create_marker_files: false,
            timestamp_updates: TimestampUpdateOptions::default(),
            reported_permissions: 0o700,
            write_chunk_size: ByteSize(64 * 1024 * 1024),
            retry: RetryOptions::default(),
        }
    }
}

impl GcsFsOptions {
    /// Write chunk size after clamping and alignment. Values below the floor
    /// round up; non-multiples are accepted with a warning.
    pub fn effective_write_chunk_size(&self) -> usize {
        let configured = self.write_chunk_size.as_u64();
        if configured < MIN_WRITE_CHUNK_SIZE {
            warn!(
                configured,
                floor = MIN_WRITE_CHUNK_SIZE,
                "write chunk size below the floor, rounding up"
            );
            return MIN_WRITE_CHUNK_SIZE as usize;
        }
        if configured % MIN_WRITE_CHUNK_SIZE != 0 {
            warn!(
                configured,
                granule = MIN_WRITE_CHUNK_SIZE,
                "write chunk size is not a multiple of the upload granule"
            );
        }
        configured as usize
    }

    /// Startup validation of cross-field constraints.
    pub fn validate(&self) -> Result<(), String> {
        if self.metadata_cache.enabled
            && self.metadata_cache.cache_type == CacheType::FilesystemBacked
            && self.metadata_cache.base_path.is_none()
        {
            return Err(
                "metadata-cache.base-path is required for the filesystem-backed cache".to_owned(),
            );
        }
        Ok(())
    }
}
