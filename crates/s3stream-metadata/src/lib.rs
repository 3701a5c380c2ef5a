//! s3stream Metadata - stream ownership and WAL object bookkeeping
//!
//! This crate holds the cluster-visible metadata of the engine:
//!
//! - **Stream metadata**: id, epoch, start offset and owner ranges per stream
//! - **WAL object image**: immutable snapshot of the objects a broker's WAL
//!   has produced, advanced by replaying metadata records into a delta
//! - **Meta store**: redb persistence for both, so a restarted broker sees
//!   the same state it published before going down
//!
//! # Image / Delta
//!
//! ```text
//!   records ──replay──▶ Delta(base = Image N) ──apply──▶ Image N+1
//!                                                         │
//!   readers ◀──────────── Arc<Image> (never mutated) ◀────┘
//! ```

pub mod delta;
pub mod image;
pub mod publisher;
pub mod record;
pub mod store;
pub mod stream;
mod tables;
pub mod wal_object;

// Re-exports
pub use delta::BrokerS3WalMetadataDelta;
pub use image::BrokerS3WalMetadataImage;
pub use publisher::MetadataPublisher;
pub use record::{
    BrokerWalMetadataRecord, MetadataRecord, RemoveWalObjectRecord, WalObjectRecord,
};
pub use store::{MetaStore, MetaStoreError, MetaStoreResult};
pub use stream::{RangeMetadata, StreamMetadata, StreamState};
pub use wal_object::S3WalObject;
