//! Registry of named stream handles

use crate::lazy_stream::{LazyStream, open_stream};
use crate::stream::StreamContext;
use dashmap::DashMap;
use s3stream_common::{Result, StreamId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns one [`LazyStream`] per name
pub struct StreamManager {
    ctx: Arc<StreamContext>,
    streams: DashMap<String, Arc<LazyStream>>,
}

impl StreamManager {
    #[must_use]
    pub fn new(ctx: Arc<StreamContext>) -> Self {
        Self {
            ctx,
            streams: DashMap::new(),
        }
    }

    /// Registry pre-populated with already assigned streams, each opened
    /// for this broker
    pub async fn with_streams(
        ctx: Arc<StreamContext>,
        assignments: impl IntoIterator<Item = (String, StreamId)>,
    ) -> Result<Self> {
        let manager = Self::new(ctx);
        for (name, stream_id) in assignments {
            let stream = open_stream(&manager.ctx, stream_id).await?;
            manager.streams.insert(
                name.clone(),
                Arc::new(LazyStream::resolved(name, manager.ctx.clone(), stream)),
            );
        }
        info!("Stream manager started with {} streams", manager.streams.len());
        Ok(manager)
    }

    /// The handle registered under `name`, registering an unresolved one
    /// if there is none. Exactly one handle exists per name.
    pub fn get_or_create_stream(&self, name: &str) -> Arc<LazyStream> {
        if let Some(existing) = self.streams.get(name) {
            return existing.clone();
        }
        self.streams
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(LazyStream::new(name, self.ctx.clone())))
            .clone()
    }

    #[must_use]
    pub fn get_stream(&self, name: &str) -> Option<Arc<LazyStream>> {
        self.streams.get(name).map(|entry| entry.clone())
    }

    /// Read-only view of every registered handle
    #[must_use]
    pub fn streams(&self) -> BTreeMap<String, Arc<LazyStream>> {
        self.streams
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Close the stream registered under `name` and drop its handle.
    ///
    /// The handle stays registered until the close completes, so a
    /// concurrent lookup never opens the stream at a new epoch while the
    /// old owner is still sealing it.
    pub async fn close_stream(&self, name: &str) -> Result<()> {
        let Some(stream) = self.get_stream(name) else {
            return Ok(());
        };
        stream.close().await?;
        self.streams
            .remove_if(name, |_, registered| Arc::ptr_eq(registered, &stream));
        Ok(())
    }

    /// Close every registered stream. Keeps going past failures and
    /// returns the first one.
    pub async fn close_all(&self) -> Result<()> {
        let names: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        let mut first_error = None;
        for name in names {
            if let Err(e) = self.close_stream(&name).await {
                warn!("Failed to close stream {:?}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
