//! s3stream Engine
//!
//! Streams of record batches stored in a write-ahead log and tiered into
//! immutable objects.
//!
//! # Architecture
//!
//! ```text
//!            append                         fetch
//!              │                              │
//! ┌────────────▼──────────────────────────────▼───────────┐
//! │                       S3Stream                        │
//! └──────┬──────────────────────┬──────────────┬──────────┘
//!        │                      │              │
//! ┌──────▼──────┐      ┌────────▼────┐  ┌──────▼────────┐
//! │     WAL     │─────▶│  WAL cache  │  │ ObjectManager │
//! └─────────────┘      └────────┬────┘  └──────┬────────┘
//!                               │ upload       │
//!                      ┌────────▼────┐  ┌──────▼────────┐
//!                      │  Uploader   │  │  BlockCache   │
//!                      └────────┬────┘  └──────┬────────┘
//!                               │              │
//!                      ┌────────▼──────────────▼────────┐
//!                      │          Object store          │
//!                      └────────────────────────────────┘
//! ```
//!
//! Uploaded objects are recorded in the broker's metadata image through
//! the [`MetadataPublisher`](s3stream_metadata::MetadataPublisher); stream
//! metadata lives in the [`StreamCatalog`].

pub mod catalog;
pub mod engine;
pub mod lazy_stream;
pub mod stream;
pub mod stream_manager;
pub mod uploader;
pub mod wal_cache;

pub use catalog::StreamCatalog;
pub use engine::Engine;
pub use lazy_stream::LazyStream;
pub use stream::{FetchResult, S3Stream, StreamContext};
pub use stream_manager::StreamManager;
pub use uploader::{UploadStats, Uploader};
pub use wal_cache::{PendingUpload, WalCache};
