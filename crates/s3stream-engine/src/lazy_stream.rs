//! A stream handle that binds to a real stream on first use

use crate::stream::{FetchResult, S3Stream, StreamContext};
use s3stream_common::{Epoch, Error, RecordBatch, Result, StreamId};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

enum LazyState {
    Unresolved,
    Resolved(Arc<S3Stream>),
}

/// Handle registered under a name. Carries [`StreamId::NOOP`] until the
/// first operation creates (or finds) and opens the stream.
pub struct LazyStream {
    name: String,
    ctx: Arc<StreamContext>,
    stream_id: AtomicU64,
    state: Mutex<LazyState>,
}

impl std::fmt::Debug for LazyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyStream")
            .field("name", &self.name)
            .field("stream_id", &self.stream_id())
            .finish_non_exhaustive()
    }
}

impl LazyStream {
    pub(crate) fn new(name: impl Into<String>, ctx: Arc<StreamContext>) -> Self {
        Self {
            name: name.into(),
            ctx,
            stream_id: AtomicU64::new(StreamId::NOOP.as_u64()),
            state: Mutex::new(LazyState::Unresolved),
        }
    }

    pub(crate) fn resolved(name: impl Into<String>, ctx: Arc<StreamContext>, stream: Arc<S3Stream>) -> Self {
        Self {
            name: name.into(),
            ctx,
            stream_id: AtomicU64::new(stream.stream_id().as_u64()),
            state: Mutex::new(LazyState::Resolved(stream)),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound stream id, [`StreamId::NOOP`] while unresolved
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(self.stream_id.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !self.stream_id().is_noop()
    }

    /// The underlying stream, created and opened on the first call.
    /// A failed resolution leaves the handle unresolved and is returned
    /// to the caller.
    pub async fn resolve(&self) -> Result<Arc<S3Stream>> {
        let mut state = self.state.lock().await;
        if let LazyState::Resolved(stream) = &*state {
            return Ok(stream.clone());
        }

        let stream = match open_named(&self.ctx, &self.name).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to create stream {:?}: {}", self.name, e);
                return Err(e);
            }
        };
        self.stream_id
            .store(stream.stream_id().as_u64(), Ordering::Release);
        *state = LazyState::Resolved(stream.clone());
        debug!("Lazy stream {:?} bound to {}", self.name, stream.stream_id());
        Ok(stream)
    }

    /// Epoch of the opened stream
    pub async fn epoch(&self) -> Result<Epoch> {
        Ok(self.resolve().await?.epoch())
    }

    pub async fn start_offset(&self) -> Result<u64> {
        Ok(self.resolve().await?.start_offset())
    }

    pub async fn next_offset(&self) -> Result<u64> {
        Ok(self.resolve().await?.next_offset())
    }

    pub async fn append(&self, batch: RecordBatch) -> Result<u64> {
        self.resolve().await?.append(batch).await
    }

    pub async fn fetch(&self, start_offset: u64, end_offset: u64, max_bytes: usize) -> Result<FetchResult> {
        self.resolve().await?.fetch(start_offset, end_offset, max_bytes).await
    }

    pub async fn trim(&self, new_start: u64) -> Result<()> {
        self.resolve().await?.trim(new_start).await
    }

    /// Close the stream if it was ever opened
    pub async fn close(&self) -> Result<()> {
        let stream = {
            let state = self.state.lock().await;
            match &*state {
                LazyState::Resolved(stream) => stream.clone(),
                LazyState::Unresolved => return Ok(()),
            }
        };
        stream.close().await
    }
}

/// Create the stream bound to `name` (or find it) and open it
pub(crate) async fn open_named(ctx: &Arc<StreamContext>, name: &str) -> Result<Arc<S3Stream>> {
    let meta = ctx.catalog.create_stream(name)?;
    open_stream(ctx, meta.stream_id).await
}

/// Open an existing stream for this broker, continuing after every offset
/// already handed out
pub(crate) async fn open_stream(ctx: &Arc<StreamContext>, stream_id: StreamId) -> Result<Arc<S3Stream>> {
    let meta = ctx
        .catalog
        .stream_metadata(stream_id)
        .ok_or(Error::StreamNotFound(stream_id))?;

    let next_offset = [
        Some(meta.start_offset),
        Some(meta.sealed_offset),
        meta.open_range().map(|r| r.start_offset),
        ctx.objects.sealed_end(stream_id),
        ctx.wal_cache.end_offset(stream_id),
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(0);

    let meta = ctx.catalog.open_stream(stream_id, next_offset)?;
    ctx.wal.fence(stream_id, meta.epoch).await?;
    ctx.objects.register_stream(stream_id, meta.sealed_offset);
    Ok(Arc::new(S3Stream::from_metadata(ctx.clone(), &meta, next_offset)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::tests::{batch, harness};

    #[tokio::test]
    async fn test_resolves_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let lazy = LazyStream::new("orders", h.ctx.clone());

        assert!(lazy.stream_id().is_noop());
        assert!(!lazy.is_resolved());
        assert_eq!(lazy.append(batch(3, 8)).await.unwrap(), 0);
        assert!(lazy.is_resolved());
        assert_eq!(lazy.epoch().await.unwrap(), 1);
        assert_eq!(lazy.next_offset().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_creation_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());
        let id = h.ctx.catalog.create_stream("orders").unwrap().stream_id;
        // Somebody else already owns the stream at a later epoch
        h.ctx.wal.fence(id, 100).await.unwrap();

        let lazy = LazyStream::new("orders", h.ctx.clone());
        let err = lazy.append(batch(1, 8)).await.unwrap_err();
        assert!(err.is_fenced());
        assert!(!lazy.is_resolved());
        assert!(lazy.fetch(0, 1, 10).await.is_err());
        // Nothing was ever opened, so there is nothing to close
        lazy.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_continues_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(dir.path());

        let first = open_named(&h.ctx, "orders").await.unwrap();
        first.append(batch(4, 8)).await.unwrap();
        h.ctx.uploader.upload().await.unwrap();
        first.append(batch(2, 8)).await.unwrap();

        let second = open_named(&h.ctx, "orders").await.unwrap();
        assert_eq!(second.epoch(), 2);
        assert_eq!(second.next_offset(), 6);
        assert!(first.append(batch(1, 8)).await.unwrap_err().is_fenced());
        assert_eq!(second.append(batch(1, 8)).await.unwrap(), 6);
    }
}
