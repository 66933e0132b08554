//! Shared-filesystem cache backend.
//!
//! Mirrors the {bucket, object} hierarchy as empty files under an
//! externally-mounted base directory so a cluster of processes can agree on
//! which just-written objects must appear in listings. A bucket is a
//! directory, a file-form object is an empty file, a directory-form object
//! is a directory; the file's last-modified time doubles as the entry
//! creation time. Item infos are never mirrored — cross-process sharing is
//! existence-only, and info staleness degrades to "always refetch".

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::{debug, trace};

use crate::cache::{
    CacheConfig, CacheEntry, CacheError, Clock, DirectoryListCache, SystemClock,
};
use crate::info::ItemInfo;
use crate::paths;
use crate::resource_id::ResourceId;

/// Filesystem-mirrored [`DirectoryListCache`].
pub struct FileSystemBackedDirectoryListCache {
    base_path: PathBuf,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl FileSystemBackedDirectoryListCache {
    pub fn new(base_path: PathBuf, config: CacheConfig) -> Self {
        Self::with_clock(base_path, config, Arc::new(SystemClock))
    }

    pub fn with_clock(base_path: PathBuf, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            base_path,
            config,
            clock,
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Mirror path for a resource. Rejects names that would escape the base
    /// directory or collide with path syntax.
    fn mirror_path(&self, id: &ResourceId) -> Result<PathBuf, CacheError> {
        let mut path = self.base_path.clone();
        match id {
            ResourceId::Root => {}
            ResourceId::Bucket(name) => {
                validate_component(name)?;
                path.push(name);
            }
            ResourceId::Object { bucket, object } => {
                validate_component(bucket)?;
                path.push(bucket);
                for component in object.split('/').filter(|c| !c.is_empty()) {
                    validate_component(component)?;
                    path.push(component);
                }
            }
        }
        Ok(path)
    }

    fn entry_from_mtime(&self, id: ResourceId, path: &Path) -> Result<Option<CacheEntry>, CacheError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mtime_millis = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64);

        let entry = CacheEntry::new(id, mtime_millis);
        if self.config.entry_expired(&entry, self.clock.now_millis()) {
            trace!(path = %path.display(), "mirrored entry hard-expired on lookup");
            self.remove_mirror(path);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Remove a mirror path, tolerating concurrent removals and non-empty
    /// directories (children imply the directory still exists).
    fn remove_mirror(&self, path: &Path) {
        let result = if path.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        if let Err(err) = result
            && err.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %path.display(), %err, "could not remove cache mirror entry");
        }
    }

    /// Recursively collect object entries under `dir`, relative to the
    /// bucket mirror root. Directories contribute their own directory-form
    /// entry and recurse.
    fn collect_objects(
        &self,
        bucket: &str,
        dir: &Path,
        relative: &str,
        out: &mut Vec<CacheEntry>,
    ) -> Result<(), CacheError> {
        for dir_entry in fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let file_type = dir_entry.file_type()?;
            let object_name = if file_type.is_dir() {
                format!("{relative}{name}/")
            } else {
                format!("{relative}{name}")
            };
            let id = ResourceId::Object {
                bucket: bucket.to_owned(),
                object: object_name.clone(),
            };
            if let Some(entry) = self.entry_from_mtime(id, &dir_entry.path())? {
                out.push(entry);
                if file_type.is_dir() {
                    self.collect_objects(bucket, &dir_entry.path(), &object_name, out)?;
                }
            }
        }
        Ok(())
    }

    /// Depth-first expiry pass over one directory. Returns true when the
    /// directory itself ended up (or already was) empty and expired.
    fn sweep_dir(&self, dir: &Path, now_millis: i64) -> Result<bool, CacheError> {
        let mut any_left = false;
        for dir_entry in fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if dir_entry.file_type()?.is_dir() {
                let empty = self.sweep_dir(&path, now_millis)?;
                if empty && self.mirror_expired(&path, now_millis)? {
                    self.remove_mirror(&path);
                } else {
                    any_left = true;
                }
            } else if self.mirror_expired(&path, now_millis)? {
                self.remove_mirror(&path);
            } else {
                any_left = true;
            }
        }
        Ok(!any_left)
    }

    fn mirror_expired(&self, path: &Path, now_millis: i64) -> Result<bool, CacheError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(err) => return Err(err.into()),
        };
        let mtime_millis = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64);
        Ok(now_millis - mtime_millis > self.config.max_entry_age_ms)
    }
}

fn validate_component(component: &str) -> Result<(), CacheError> {
    if component.is_empty() || component == "." || component == ".." {
        return Err(CacheError::UnmirrorableName(component.to_owned()));
    }
    Ok(())
}

impl DirectoryListCache for FileSystemBackedDirectoryListCache {
    fn put_resource(&self, id: &ResourceId) -> Result<(), CacheError> {
        let path = self.mirror_path(id)?;
        let is_dir = match id {
            ResourceId::Root => return Ok(()),
            ResourceId::Bucket(_) => true,
            ResourceId::Object { object, .. } => paths::object_has_directory_path(object),
        };
        if is_dir {
            fs::create_dir_all(&path)?;
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            // Touch; an existing mirror file keeps its original creation
            // time, matching the put-preserves-existing-entry contract.
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                // A file/directory mismatch means a racing writer mirrored a
                // different shape; existence is all this backend promises.
                Err(err) if path.exists() => {
                    trace!(path = %path.display(), %err, "mirror shape mismatch tolerated");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn put_resource_info(&self, info: &ItemInfo) -> Result<(), CacheError> {
        // Infos are not mirrored; only existence crosses process boundaries.
        self.put_resource(info.id())
    }

    fn get_entry(&self, id: &ResourceId) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.mirror_path(id)?;
        self.entry_from_mtime(id.clone(), &path)
    }

    fn remove_resource(&self, id: &ResourceId) -> Result<(), CacheError> {
        let path = self.mirror_path(id)?;
        if id.is_bucket() {
            // A bucket mirror goes with everything under it.
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        } else {
            self.remove_mirror(&path);
        }
        Ok(())
    }

    fn bucket_list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = Vec::new();
        let read = match fs::read_dir(&self.base_path) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };
        for dir_entry in read {
            let dir_entry = dir_entry?;
            let Some(name) = dir_entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Some(entry) =
                self.entry_from_mtime(ResourceId::Bucket(name), &dir_entry.path())?
            {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn object_list(&self, bucket: &str) -> Result<Vec<CacheEntry>, CacheError> {
        validate_component(bucket)?;
        let root = self.base_path.join(bucket);
        let mut entries = Vec::new();
        if !root.is_dir() {
            return Ok(entries);
        }
        self.collect_objects(bucket, &root, "", &mut entries)?;
        Ok(entries)
    }

    fn sweep(&self) -> Result<(), CacheError> {
        let now = self.clock.now_millis();
        let read = match fs::read_dir(&self.base_path) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for dir_entry in read {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let empty = self.sweep_dir(&path, now)?;
            // An expired bucket is removed with all of its (already swept)
            // object entries.
            if empty && self.mirror_expired(&path, now)? {
                self.remove_mirror(&path);
            }
        }
        Ok(())
    }

    fn config(&self) -> &CacheConfig {
        &self.config
    }
}
