//! Directory and file path conventions over resource identifiers.
//!
//! A directory is represented in the store by a zero-byte object whose name
//! ends in the path delimiter; the root and buckets are directories by
//! definition. The helpers here convert between the two spellings, extract
//! parents and leaf names, and define the ordering used by multi-object
//! operations.

use std::cmp::Ordering;

use crate::resource_id::ResourceId;

/// Separator between path segments inside object names.
pub const PATH_DELIMITER: &str = "/";

/// True if the object name is spelled in directory form.
pub fn object_has_directory_path(object_name: &str) -> bool {
    object_name.ends_with(PATH_DELIMITER)
}

/// True if the id denotes a directory path (root, bucket, or `.../`).
pub fn is_directory_path(id: &ResourceId) -> bool {
    match id {
        ResourceId::Root | ResourceId::Bucket(_) => true,
        ResourceId::Object { object, .. } => object_has_directory_path(object),
    }
}

/// Directory form of an id: appends the delimiter to an object name that
/// lacks it. Identity on root and buckets.
pub fn to_directory_path(id: &ResourceId) -> ResourceId {
    match id {
        ResourceId::Object { bucket, object } if !object_has_directory_path(object) => {
            ResourceId::Object {
                bucket: bucket.clone(),
                object: format!("{object}{PATH_DELIMITER}"),
            }
        }
        other => other.clone(),
    }
}

/// File form of an id: strips a single trailing delimiter from the object
/// name. Identity on root, buckets, and file-form objects.
pub fn to_file_path(id: &ResourceId) -> ResourceId {
    match id {
        ResourceId::Object { bucket, object } if object_has_directory_path(object) => {
            ResourceId::Object {
                bucket: bucket.clone(),
                object: object[..object.len() - 1].to_owned(),
            }
        }
        other => other.clone(),
    }
}

/// The longest proper directory prefix of the id.
///
/// The root's parent is itself, following the POSIX `/..` convention; a
/// bucket's parent is the root; a top-level object's parent is its bucket.
pub fn parent(id: &ResourceId) -> ResourceId {
    match id {
        ResourceId::Root | ResourceId::Bucket(_) => ResourceId::Root,
        ResourceId::Object { bucket, object } => {
            let trimmed = object.strip_suffix(PATH_DELIMITER).unwrap_or(object);
            match trimmed.rfind('/') {
                Some(idx) => ResourceId::Object {
                    bucket: bucket.clone(),
                    object: trimmed[..=idx].to_owned(),
                },
                None => ResourceId::Bucket(bucket.clone()),
            }
        }
    }
}

/// The last non-empty path segment, accounting for a trailing delimiter.
/// `None` for the root, which has no leaf.
pub fn leaf_name(id: &ResourceId) -> Option<String> {
    match id {
        ResourceId::Root => None,
        ResourceId::Bucket(name) => Some(name.clone()),
        ResourceId::Object { object, .. } => {
            let trimmed = object.strip_suffix(PATH_DELIMITER).unwrap_or(object);
            let leaf = match trimmed.rfind('/') {
                Some(idx) => &trimmed[idx + 1..],
                None => trimmed,
            };
            Some(leaf.to_owned())
        }
    }
}

/// Intermediate directory prefixes of an object name, shortest first.
///
/// `foo/bar/zoo` yields `["foo/", "foo/bar/"]`; a name already in directory
/// form includes its own prefix form, so `foo/bar/` yields `["foo/"]` and the
/// caller appends the full directory path itself where needed.
pub fn sub_dirs(object_name: &str) -> Vec<String> {
    let mut subdirs = Vec::new();
    let mut current = 0;
    while current < object_name.len() {
        match object_name[current..].find('/') {
            Some(offset) => {
                let end = current + offset + 1;
                if end < object_name.len() {
                    subdirs.push(object_name[..end].to_owned());
                }
                current = end;
            }
            None => break,
        }
    }
    subdirs
}

/// Ordering for multi-object operations: length first, lexicographic within
/// equal lengths. Ascending order puts ancestors before descendants;
/// descending order reverses that, which is the only topological property
/// the bulk operations rely on.
pub fn cmp_uris(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(object: &str) -> ResourceId {
        ResourceId::Object {
            bucket: "b".into(),
            object: object.into(),
        }
    }

    #[test]
    fn directory_and_file_forms_convert() {
        assert_eq!(to_directory_path(&obj("a/f")), obj("a/f/"));
        assert_eq!(to_directory_path(&obj("a/f/")), obj("a/f/"));
        assert_eq!(to_file_path(&obj("a/f/")), obj("a/f"));
        assert_eq!(
            to_directory_path(&ResourceId::Bucket("b".into())),
            ResourceId::Bucket("b".into())
        );
    }

    #[test]
    fn parent_walks_up_the_hierarchy() {
        assert_eq!(parent(&ResourceId::Root), ResourceId::Root);
        assert_eq!(parent(&ResourceId::Bucket("b".into())), ResourceId::Root);
        assert_eq!(parent(&obj("f")), ResourceId::Bucket("b".into()));
        assert_eq!(parent(&obj("a/b/f")), obj("a/b/"));
        assert_eq!(parent(&obj("a/b/")), obj("a/"));
    }

    #[test]
    fn leaf_name_handles_trailing_delimiter() {
        assert_eq!(leaf_name(&ResourceId::Root), None);
        assert_eq!(leaf_name(&ResourceId::Bucket("b".into())), Some("b".into()));
        assert_eq!(leaf_name(&obj("a/b/f.txt")), Some("f.txt".into()));
        assert_eq!(leaf_name(&obj("a/b/")), Some("b".into()));
    }

    #[test]
    fn parent_plus_leaf_reconstructs_path() {
        for object in ["a/b/c.txt", "a/b/c/", "top", "top/"] {
            let id = obj(object);
            let parent_id = parent(&id);
            let leaf = leaf_name(&id).unwrap();
            let dir_form = object_has_directory_path(object);
            let rebuilt = match &parent_id {
                ResourceId::Bucket(_) => {
                    obj(&if dir_form { format!("{leaf}/") } else { leaf })
                }
                ResourceId::Object { object: prefix, .. } => obj(&if dir_form {
                    format!("{prefix}{leaf}/")
                } else {
                    format!("{prefix}{leaf}")
                }),
                ResourceId::Root => unreachable!(),
            };
            assert_eq!(rebuilt, id);
        }
    }

    #[test]
    fn sub_dirs_enumerates_prefixes() {
        assert_eq!(sub_dirs("foo/bar/zoo"), vec!["foo/", "foo/bar/"]);
        assert_eq!(sub_dirs("foo/bar/zoo/"), vec!["foo/", "foo/bar/"]);
        assert_eq!(sub_dirs("foo"), Vec::<String>::new());
        assert_eq!(sub_dirs(""), Vec::<String>::new());
    }

    #[test]
    fn ordering_is_length_first() {
        let mut uris = vec!["gs://b/a/b/c", "gs://b/a/", "gs://b/z", "gs://b/a/b/"];
        uris.sort_by(|a, b| cmp_uris(a, b));
        assert_eq!(uris, vec!["gs://b/z", "gs://b/a/", "gs://b/a/b/", "gs://b/a/b/c"]);
    }
}
