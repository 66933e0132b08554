//! Buffered write channel.
//!
//! Writes accumulate locally and the object is committed with one guarded
//! upload at close time. When `overwrite_existing` is off the upload carries
//! the if-not-exists guard, so a racing writer loses at close with a
//! precondition failure rather than silently clobbering.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::resource_id::ResourceId;
use crate::storage::retry::{self, RetryOptions};
use crate::storage::transport::{Precondition, StoreTransport};
use crate::storage::{CreateObjectOptions, StorageError, WriteChannel};

/// Tuning knobs for write channels.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    /// Buffer growth granularity in bytes.
    pub chunk_size: usize,
    /// Prefer a single non-resumable upload where the transport supports it.
    pub direct_upload: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024 * 1024,
            direct_upload: false,
        }
    }
}

enum WriterState {
    Buffering(BytesMut),
    Closed,
}

/// Write channel over one object, committed on close.
pub struct ObjectWriter<T: StoreTransport> {
    transport: Arc<T>,
    id: ResourceId,
    options: CreateObjectOptions,
    writer_options: WriterOptions,
    retry: RetryOptions,
    state: WriterState,
}

impl<T: StoreTransport> ObjectWriter<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        id: ResourceId,
        options: CreateObjectOptions,
        writer_options: WriterOptions,
        retry: RetryOptions,
    ) -> Self {
        Self {
            transport,
            id,
            options,
            writer_options,
            retry,
            state: WriterState::Buffering(BytesMut::new()),
        }
    }
}

#[async_trait]
impl<T: StoreTransport> WriteChannel for ObjectWriter<T> {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        match &mut self.state {
            WriterState::Buffering(buf) => {
                if buf.capacity() - buf.len() < data.len() {
                    buf.reserve(self.writer_options.chunk_size.max(data.len()));
                }
                buf.extend_from_slice(data);
                Ok(())
            }
            WriterState::Closed => Err(StorageError::ChannelClosed(self.id.clone())),
        }
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        let buf = match std::mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::Buffering(buf) => buf,
            // Second close is a no-op.
            WriterState::Closed => return Ok(()),
        };
        let data: Bytes = buf.freeze();

        let precondition = if self.options.overwrite_existing {
            Precondition::none()
        } else {
            Precondition::if_not_exists()
        };

        let bucket = self.id.bucket_name().unwrap_or_default().to_owned();
        let name = self.id.object_name().unwrap_or_default().to_owned();
        trace!(id = %self.id, bytes = data.len(), "committing object");

        retry::with_backoff(&self.retry, "insert_object", || {
            self.transport.insert_object(
                &bucket,
                &name,
                data.clone(),
                self.options.content_type.as_deref(),
                &self.options.attributes,
                precondition,
                self.writer_options.direct_upload,
            )
        })
        .await
        .map_err(|e| StorageError::from_transport(&self.id, e))?;
        Ok(())
    }
}
