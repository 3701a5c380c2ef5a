//! Redb table definitions for persistent metadata storage.

use redb::TableDefinition;

// Streams
/// stream id → bincode(StreamMetadata)
pub const STREAMS: TableDefinition<u64, &[u8]> = TableDefinition::new("streams");
/// stream name → stream id
pub const STREAM_NAMES: TableDefinition<&str, u64> = TableDefinition::new("stream_names");

// Id allocation
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
pub const NEXT_STREAM_ID: &str = "next_stream_id";
pub const NEXT_OBJECT_ID: &str = "next_object_id";

// WAL objects
/// Single key "image" → bincode(BrokerS3WalMetadataImage)
pub const WAL_IMAGE: TableDefinition<&str, &[u8]> = TableDefinition::new("wal_image");
pub const IMAGE_KEY: &str = "image";
