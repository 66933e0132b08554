//! Seekable read channel with transparent resume.
//!
//! Premature end-of-stream is a recoverable event in the channel's state
//! machine (`Open → Broken → Reopening → Open`), not an error that tears the
//! channel down: the inner stream is closed explicitly (close failures are
//! discarded) and a ranged request reopens at the last delivered offset.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use tracing::{debug, trace, warn};

use crate::resource_id::ResourceId;
use crate::storage::retry::RetryOptions;
use crate::storage::transport::{ReadStream, StoreTransport, TransportError};
use crate::storage::{ReadChannel, StorageError};

/// Tuning knobs for read channels.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderOptions {
    /// Forward seeks of at most this many bytes are satisfied by draining
    /// the open stream instead of issuing a new ranged request.
    pub skip_window_bytes: u64,
    /// Allow resuming gzip-encoded objects by re-seeking in the decoded byte
    /// stream. Best-effort: delivered bytes may disagree with the stored
    /// size.
    pub support_gzip_encoding: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            skip_window_bytes: 8 * 1024 * 1024,
            support_gzip_encoding: false,
        }
    }
}

enum StreamState<S> {
    /// No stream; the next read opens one at the current position.
    NotOpen,
    Open(S),
    Closed,
}

/// Seekable reader over one object, backed by ranged transport streams.
pub struct ObjectReader<T: StoreTransport> {
    transport: Arc<T>,
    id: ResourceId,
    bucket: String,
    name: String,
    size: i64,
    gzip_encoded: bool,
    position: u64,
    /// Bytes fetched but not yet delivered; starts exactly at `position`.
    pending: Bytes,
    state: StreamState<T::Stream>,
    retry: RetryOptions,
    options: ReaderOptions,
}

impl<T: StoreTransport> ObjectReader<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        id: ResourceId,
        size: i64,
        gzip_encoded: bool,
        retry: RetryOptions,
        options: ReaderOptions,
    ) -> Self {
        let bucket = id.bucket_name().unwrap_or_default().to_owned();
        let name = id.object_name().unwrap_or_default().to_owned();
        Self {
            transport,
            id,
            bucket,
            name,
            size,
            gzip_encoded,
            position: 0,
            pending: Bytes::new(),
            state: StreamState::NotOpen,
            retry,
            options,
        }
    }

    /// Abandon the inner stream, discarding close failures.
    async fn break_stream(&mut self) {
        if let StreamState::Open(mut stream) =
            std::mem::replace(&mut self.state, StreamState::NotOpen)
            && let Err(err) = stream.close().await
        {
            trace!(id = %self.id, %err, "discarding close failure of broken stream");
        }
        self.pending = Bytes::new();
    }

    /// Ensure an open stream positioned at `self.position`.
    async fn ensure_open(&mut self) -> Result<(), StorageError> {
        if matches!(self.state, StreamState::Open(_)) {
            return Ok(());
        }
        if self.gzip_encoded && self.position > 0 && !self.options.support_gzip_encoding {
            return Err(StorageError::Fatal(TransportError::Malformed(format!(
                "cannot reopen gzip-encoded object '{}' mid-stream",
                self.id
            ))));
        }
        let stream = crate::storage::retry::with_backoff(&self.retry, "open_read", || {
            self.transport.open_read(&self.bucket, &self.name, self.position)
        })
        .await
        .map_err(|e| StorageError::from_transport(&self.id, e))?;
        self.state = StreamState::Open(stream);
        Ok(())
    }

    /// Fetch the next chunk into `pending`. `Ok(false)` at clean end of
    /// object; transient failures and short streams resume internally.
    async fn fill_pending(&mut self) -> Result<bool, StorageError> {
        let mut failed_attempts: u32 = 0;
        loop {
            self.ensure_open().await?;
            let StreamState::Open(stream) = &mut self.state else {
                unreachable!("ensure_open leaves the stream open");
            };
            match stream.next_chunk().await {
                Ok(Some(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.pending = chunk;
                    return Ok(true);
                }
                Ok(None) => {
                    // A clean end below the known size is a premature EOF,
                    // unless the content was gzip-encoded, in which case the
                    // stored size counts compressed bytes and proves nothing.
                    if self.gzip_encoded || self.position >= self.size as u64 {
                        return Ok(false);
                    }
                    let err = TransportError::PrematureEof {
                        delivered: self.position,
                    };
                    failed_attempts += 1;
                    if failed_attempts >= self.retry.max_attempts {
                        warn!(id = %self.id, delivered = self.position, "resume budget exhausted");
                        return Err(StorageError::Transient(err));
                    }
                    debug!(id = %self.id, delivered = self.position, "premature end of stream, reopening");
                    self.break_stream().await;
                    tokio::time::sleep(self.retry.delay_for(failed_attempts - 1)).await;
                }
                Err(err) if err.is_transient() => {
                    failed_attempts += 1;
                    if failed_attempts >= self.retry.max_attempts {
                        return Err(StorageError::Transient(err));
                    }
                    debug!(id = %self.id, %err, "read stream failed, reopening");
                    self.break_stream().await;
                    tokio::time::sleep(self.retry.delay_for(failed_attempts - 1)).await;
                }
                Err(err) => return Err(StorageError::from_transport(&self.id, err)),
            }
        }
    }
}

#[async_trait]
impl<T: StoreTransport> ReadChannel for ObjectReader<T> {
    fn size(&self) -> i64 {
        self.size
    }

    fn position(&self) -> u64 {
        self.position
    }

    async fn seek(&mut self, position: u64) -> Result<(), StorageError> {
        if matches!(self.state, StreamState::Closed) {
            return Err(StorageError::ChannelClosed(self.id.clone()));
        }
        if position == self.position {
            return Ok(());
        }

        let in_window = position > self.position
            && position - self.position <= self.options.skip_window_bytes;
        if in_window && matches!(self.state, StreamState::Open(_)) {
            // Drain forward through the open stream rather than paying for a
            // new ranged request.
            while self.position < position {
                let wanted = position - self.position;
                if !self.pending.is_empty() {
                    let n = (self.pending.len() as u64).min(wanted) as usize;
                    self.pending.advance(n);
                    self.position += n as u64;
                    continue;
                }
                if !self.fill_pending().await? {
                    break;
                }
            }
            if self.position == position {
                trace!(id = %self.id, position, "seek satisfied within skip window");
                return Ok(());
            }
        }

        self.break_stream().await;
        self.position = position;
        Ok(())
    }

    async fn read(&mut self, max_bytes: usize) -> Result<Option<Bytes>, StorageError> {
        if matches!(self.state, StreamState::Closed) {
            return Err(StorageError::ChannelClosed(self.id.clone()));
        }
        if max_bytes == 0 {
            return Ok(Some(Bytes::new()));
        }
        if !self.gzip_encoded && self.position >= self.size as u64 {
            return Ok(None);
        }

        if self.pending.is_empty() && !self.fill_pending().await? {
            return Ok(None);
        }

        let n = self.pending.len().min(max_bytes);
        let chunk = self.pending.split_to(n);
        self.position += n as u64;
        Ok(Some(chunk))
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        match std::mem::replace(&mut self.state, StreamState::Closed) {
            StreamState::Open(mut stream) => {
                self.pending = Bytes::new();
                stream
                    .close()
                    .await
                    .map_err(|e| StorageError::from_transport(&self.id, e))
            }
            // Second close is a no-op.
            StreamState::NotOpen | StreamState::Closed => Ok(()),
        }
    }
}
