//! Kinesis Shard Consumer - a fault-tolerant consumer for sharded streams
//!
//! One checkpointed poller runs per shard. Records are decoded, handed to a
//! [`RecordSink`] in sequence order, and checkpointed only after the sink
//! confirms them, so a restarted poller resumes right after the last durable
//! checkpoint. Throttling and timeouts back off exponentially with jitter;
//! failed pollers are restarted by the [`Coordinator`] after a cooldown.

pub mod client;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod monitoring;
pub mod poller;
pub mod publisher;
pub mod record;
pub mod retry;
pub mod sink;
pub mod store;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

#[cfg(test)]
mod tests;

pub use client::{ShardPosition, StreamClient, StreamClientError};
pub use codec::{BytesDecoder, JsonDecoder, RecordDecoder, Utf8Decoder};
pub use config::{ConsumerConfig, InitialPosition};
pub use coordinator::{ConsumerHandle, Coordinator};
pub use error::{CheckpointError, ConsumerError, DecodeError, PublishError, Result, SinkError};
pub use poller::{ShardState, ShardStatus};
pub use publisher::StreamPublisher;
pub use record::{CheckpointRecord, DecodedRecord, RawRecord, RecordBatch, SequenceNumber};
pub use retry::{Backoff, ExponentialBackoff, RetryConfig};
pub use sink::RecordSink;

// Re-export main traits
pub use crate::store::CheckpointStore;

// Re-export implementations
pub use crate::store::file::FileCheckpointStore;
pub use crate::store::memory::InMemoryCheckpointStore;

#[cfg(feature = "dynamodb-store")]
pub use crate::store::dynamodb::DynamoDbCheckpointStore;
