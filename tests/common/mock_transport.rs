//! In-memory store transport for tests.
//!
//! Behaves like a strongly-consistent flat object store with generation
//! preconditions, plus knobs that make it misbehave on purpose: scripted
//! status failures per operation, short read streams, and objects hidden
//! from listings to imitate eventual consistency.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use http::StatusCode;

use gcsfs::storage::transport::{
    BucketResource, ObjectListing, ObjectResource, Precondition, ReadStream, StoreTransport,
    TransportError,
};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub metadata: HashMap<String, Vec<u8>>,
    pub generation: i64,
    pub meta_generation: i64,
    pub creation_time_millis: i64,
}

#[derive(Default)]
struct State {
    buckets: HashMap<String, BucketResource>,
    objects: BTreeMap<(String, String), StoredObject>,
    hidden_from_listings: HashSet<(String, String)>,
    faults: HashMap<String, VecDeque<u16>>,
    calls: HashMap<String, usize>,
    next_generation: i64,
    fake_time_millis: i64,
    short_read_once: Option<usize>,
}

/// Shared-state mock transport; clones all observe the same store.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
    pub read_chunk_size: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_generation: 1,
                fake_time_millis: 1_000,
                ..State::default()
            })),
            read_chunk_size: 64 * 1024,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    // ── Seeding and inspection ──────────────────────────────────────────

    pub fn seed_bucket(&self, name: &str) {
        let mut state = self.lock();
        state.fake_time_millis += 1;
        let resource = BucketResource {
            name: name.to_owned(),
            creation_time_millis: state.fake_time_millis,
            location: Some("US".to_owned()),
            storage_class: Some("STANDARD".to_owned()),
        };
        state.buckets.insert(name.to_owned(), resource);
    }

    pub fn seed_object(&self, bucket: &str, name: &str, data: &[u8]) {
        let mut state = self.lock();
        state.fake_time_millis += 1;
        state.next_generation += 1;
        let object = StoredObject {
            data: Bytes::copy_from_slice(data),
            content_type: None,
            content_encoding: None,
            metadata: HashMap::new(),
            generation: state.next_generation,
            meta_generation: 1,
            creation_time_millis: state.fake_time_millis,
        };
        state
            .objects
            .insert((bucket.to_owned(), name.to_owned()), object);
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.lock().buckets.contains_key(name)
    }

    pub fn has_object(&self, bucket: &str, name: &str) -> bool {
        self.lock()
            .objects
            .contains_key(&(bucket.to_owned(), name.to_owned()))
    }

    pub fn object(&self, bucket: &str, name: &str) -> Option<StoredObject> {
        self.lock()
            .objects
            .get(&(bucket.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn object_names(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, n)| n.clone())
            .collect()
    }

    // ── Misbehavior knobs ───────────────────────────────────────────────

    /// Script the next `times` calls of `op` to fail with `status`.
    pub fn fail_next(&self, op: &str, times: usize, status: u16) {
        let mut state = self.lock();
        let queue = state.faults.entry(op.to_owned()).or_default();
        for _ in 0..times {
            queue.push_back(status);
        }
    }

    /// Make the next opened read stream end cleanly after `bytes`, below the
    /// expected length.
    pub fn short_read_once(&self, bytes: usize) {
        self.lock().short_read_once = Some(bytes);
    }

    /// Keep an existing object out of listings while lookups still find it,
    /// the way an eventually-consistent listing would.
    pub fn hide_from_listings(&self, bucket: &str, name: &str) {
        self.lock()
            .hidden_from_listings
            .insert((bucket.to_owned(), name.to_owned()));
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn enter(&self, op: &str) -> Result<MutexGuard<'_, State>, TransportError> {
        let mut state = self.lock();
        *state.calls.entry(op.to_owned()).or_default() += 1;
        if let Some(queue) = state.faults.get_mut(op)
            && let Some(status) = queue.pop_front()
        {
            return Err(status_error(status));
        }
        Ok(state)
    }
}

fn status_error(status: u16) -> TransportError {
    TransportError::Status {
        status: StatusCode::from_u16(status).unwrap(),
        message: format!("scripted failure {status}"),
    }
}

fn check_object_precondition(
    existing: Option<&StoredObject>,
    precondition: Precondition,
) -> Result<(), TransportError> {
    if let Some(want) = precondition.if_generation_match {
        let live = existing.map_or(0, |o| o.generation);
        if live != want {
            return Err(status_error(412));
        }
    }
    if let Some(want) = precondition.if_meta_generation_match {
        let live = existing.map_or(0, |o| o.meta_generation);
        if live != want {
            return Err(status_error(412));
        }
    }
    Ok(())
}

fn object_resource(bucket: &str, name: &str, stored: &StoredObject) -> ObjectResource {
    ObjectResource {
        bucket: bucket.to_owned(),
        name: name.to_owned(),
        size: stored.data.len() as i64,
        creation_time_millis: stored.creation_time_millis,
        content_type: stored.content_type.clone(),
        content_encoding: stored.content_encoding.clone(),
        metadata: stored.metadata.clone(),
        generation: stored.generation,
        meta_generation: stored.meta_generation,
    }
}

pub struct MockReadStream {
    chunks: VecDeque<Bytes>,
}

impl ReadStream for MockReadStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        Ok(self.chunks.pop_front())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.chunks.clear();
        Ok(())
    }
}

impl StoreTransport for MockTransport {
    type Stream = MockReadStream;

    async fn get_bucket(&self, name: &str) -> Result<Option<BucketResource>, TransportError> {
        let state = self.enter("get_bucket")?;
        Ok(state.buckets.get(name).cloned())
    }

    async fn list_buckets(&self) -> Result<Vec<BucketResource>, TransportError> {
        let state = self.enter("list_buckets")?;
        let mut buckets: Vec<BucketResource> = state.buckets.values().cloned().collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    async fn insert_bucket(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.enter("insert_bucket")?;
        if state.buckets.contains_key(name) {
            return Err(status_error(409));
        }
        state.fake_time_millis += 1;
        let resource = BucketResource {
            name: name.to_owned(),
            creation_time_millis: state.fake_time_millis,
            location: Some("US".to_owned()),
            storage_class: Some("STANDARD".to_owned()),
        };
        state.buckets.insert(name.to_owned(), resource);
        Ok(())
    }

    async fn delete_bucket(&self, name: &str) -> Result<(), TransportError> {
        let mut state = self.enter("delete_bucket")?;
        if !state.buckets.contains_key(name) {
            return Err(status_error(404));
        }
        if state.objects.keys().any(|(b, _)| b == name) {
            return Err(status_error(409));
        }
        state.buckets.remove(name);
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: &str,
        name: &str,
    ) -> Result<Option<ObjectResource>, TransportError> {
        let state = self.enter("get_object")?;
        Ok(state
            .objects
            .get(&(bucket.to_owned(), name.to_owned()))
            .map(|stored| object_resource(bucket, name, stored)))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<ObjectListing, TransportError> {
        let state = self.enter("list_objects")?;
        let mut listing = ObjectListing::default();
        let mut prefixes: HashSet<String> = HashSet::new();

        for ((b, name), stored) in &state.objects {
            if b != bucket || !name.starts_with(prefix) {
                continue;
            }
            if state
                .hidden_from_listings
                .contains(&(b.clone(), name.clone()))
            {
                continue;
            }
            let relative = &name[prefix.len()..];
            match delimiter {
                Some(delimiter) => match relative.find(delimiter) {
                    Some(index) if index + delimiter.len() < relative.len() => {
                        prefixes.insert(format!("{prefix}{}", &relative[..index + delimiter.len()]));
                    }
                    _ => listing.objects.push(object_resource(bucket, name, stored)),
                },
                None => listing.objects.push(object_resource(bucket, name, stored)),
            }
        }

        listing.prefixes = prefixes.into_iter().collect();
        listing.prefixes.sort();
        if let Some(max) = max_results {
            listing.objects.truncate(max);
            let room = max.saturating_sub(listing.objects.len());
            listing.prefixes.truncate(room);
        }
        Ok(listing)
    }

    async fn insert_object(
        &self,
        bucket: &str,
        name: &str,
        data: Bytes,
        content_type: Option<&str>,
        metadata: &HashMap<String, Vec<u8>>,
        precondition: Precondition,
        _direct_upload: bool,
    ) -> Result<ObjectResource, TransportError> {
        let mut state = self.enter("insert_object")?;
        if !state.buckets.contains_key(bucket) {
            return Err(status_error(404));
        }
        let key = (bucket.to_owned(), name.to_owned());
        check_object_precondition(state.objects.get(&key), precondition)?;
        state.fake_time_millis += 1;
        state.next_generation += 1;
        let stored = StoredObject {
            data,
            content_type: content_type.map(str::to_owned),
            content_encoding: None,
            metadata: metadata.clone(),
            generation: state.next_generation,
            meta_generation: 1,
            creation_time_millis: state.fake_time_millis,
        };
        let resource = object_resource(bucket, name, &stored);
        state.objects.insert(key, stored);
        Ok(resource)
    }

    async fn delete_object(
        &self,
        bucket: &str,
        name: &str,
        precondition: Precondition,
    ) -> Result<(), TransportError> {
        let mut state = self.enter("delete_object")?;
        let key = (bucket.to_owned(), name.to_owned());
        let Some(existing) = state.objects.get(&key) else {
            return Err(status_error(404));
        };
        check_object_precondition(Some(existing), precondition)?;
        state.objects.remove(&key);
        state.hidden_from_listings.remove(&key);
        Ok(())
    }

    async fn copy_object(
        &self,
        src_bucket: &str,
        src_name: &str,
        dst_bucket: &str,
        dst_name: &str,
        precondition: Precondition,
    ) -> Result<ObjectResource, TransportError> {
        let mut state = self.enter("copy_object")?;
        let src_key = (src_bucket.to_owned(), src_name.to_owned());
        let Some(source) = state.objects.get(&src_key).cloned() else {
            return Err(status_error(404));
        };
        let dst_key = (dst_bucket.to_owned(), dst_name.to_owned());
        check_object_precondition(state.objects.get(&dst_key), precondition)?;
        state.fake_time_millis += 1;
        state.next_generation += 1;
        let stored = StoredObject {
            generation: state.next_generation,
            meta_generation: 1,
            creation_time_millis: state.fake_time_millis,
            ..source
        };
        let resource = object_resource(dst_bucket, dst_name, &stored);
        state.objects.insert(dst_key, stored);
        Ok(resource)
    }

    async fn compose_object(
        &self,
        bucket: &str,
        sources: &[String],
        destination: &str,
        content_type: Option<&str>,
    ) -> Result<ObjectResource, TransportError> {
        let mut state = self.enter("compose_object")?;
        let mut data = Vec::new();
        for source in sources {
            let key = (bucket.to_owned(), source.clone());
            let Some(stored) = state.objects.get(&key) else {
                return Err(status_error(404));
            };
            data.extend_from_slice(&stored.data);
        }
        state.fake_time_millis += 1;
        state.next_generation += 1;
        let stored = StoredObject {
            data: Bytes::from(data),
            content_type: content_type.map(str::to_owned),
            content_encoding: None,
            metadata: HashMap::new(),
            generation: state.next_generation,
            meta_generation: 1,
            creation_time_millis: state.fake_time_millis,
        };
        let resource = object_resource(bucket, destination, &stored);
        state
            .objects
            .insert((bucket.to_owned(), destination.to_owned()), stored);
        Ok(resource)
    }

    async fn patch_object_metadata(
        &self,
        bucket: &str,
        name: &str,
        attributes: &HashMap<String, Option<Vec<u8>>>,
        precondition: Precondition,
    ) -> Result<ObjectResource, TransportError> {
        let mut state = self.enter("patch_object_metadata")?;
        let key = (bucket.to_owned(), name.to_owned());
        let Some(existing) = state.objects.get(&key) else {
            return Err(status_error(404));
        };
        check_object_precondition(Some(existing), precondition)?;
        let stored = state.objects.get_mut(&key).unwrap();
        for (attr, value) in attributes {
            match value {
                Some(value) => {
                    stored.metadata.insert(attr.clone(), value.clone());
                }
                None => {
                    stored.metadata.remove(attr);
                }
            }
        }
        stored.meta_generation += 1;
        let resource = object_resource(bucket, name, stored);
        Ok(resource)
    }

    async fn open_read(
        &self,
        bucket: &str,
        name: &str,
        offset: u64,
    ) -> Result<MockReadStream, TransportError> {
        let mut state = self.enter("open_read")?;
        let key = (bucket.to_owned(), name.to_owned());
        let Some(stored) = state.objects.get(&key) else {
            return Err(status_error(404));
        };
        let mut data = stored.data.slice((offset as usize).min(stored.data.len())..);
        if let Some(short) = state.short_read_once.take() {
            data = data.slice(..short.min(data.len()));
        }
        let mut chunks = VecDeque::new();
        let chunk_size = self.read_chunk_size.max(1);
        while !data.is_empty() {
            let n = data.len().min(chunk_size);
            chunks.push_back(data.split_to(n));
        }
        Ok(MockReadStream { chunks })
    }
}
