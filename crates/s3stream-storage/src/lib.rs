//! s3stream Storage - durable buffering and object-tiered reads
//!
//! This crate implements the storage layers underneath a stream:
//! - Write-ahead log (durable append path)
//! - Object store contract with in-memory and filesystem implementations
//! - WAL object layout (per-stream data blocks, index, footer)
//! - Object manager (object lifecycle and stream range resolution)
//! - Block cache (LRU by bytes, coalesced fetches with retry)

pub mod cache;
pub mod object_format;
pub mod object_manager;
pub mod object_store;
pub mod wal;

// Re-exports
pub use cache::{BlockCache, CacheKey, CacheStats, ReadDataBlock};
pub use object_format::{IndexEntry, ObjectIndex, ObjectWriter};
pub use object_manager::{ObjectManager, ObjectState};
pub use object_store::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use wal::{FileWal, MemoryWal, RecordType, Wal, WalEntry, WalRecord};
