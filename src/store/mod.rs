//! Checkpoint storage implementations
//!
//! A store maps a shard id to the last sequence number whose batch the sink
//! confirmed. `save_checkpoint` must be durable when it returns, must be
//! serialized per shard, and must never move a shard's checkpoint backwards.

use crate::error::CheckpointError;
use crate::record::{CheckpointRecord, SequenceNumber};
use async_trait::async_trait;
use std::sync::Arc;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod file;
pub mod memory;

/// Trait for checkpoint storage implementations
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Retrieve the checkpoint for a given shard; `None` for an unknown shard
    async fn get_checkpoint(
        &self,
        shard_id: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError>;

    /// Durably record `sequence_number` as the shard's position.
    ///
    /// Saving the current value again succeeds; saving a smaller value fails
    /// with [`CheckpointError::Stale`].
    async fn save_checkpoint(
        &self,
        shard_id: &str,
        sequence_number: &SequenceNumber,
    ) -> Result<CheckpointRecord, CheckpointError>;
}

#[async_trait]
impl<S: CheckpointStore + ?Sized> CheckpointStore for Arc<S> {
    async fn get_checkpoint(
        &self,
        shard_id: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        (**self).get_checkpoint(shard_id).await
    }

    async fn save_checkpoint(
        &self,
        shard_id: &str,
        sequence_number: &SequenceNumber,
    ) -> Result<CheckpointRecord, CheckpointError> {
        (**self).save_checkpoint(shard_id, sequence_number).await
    }
}

/// Compare-and-set guard shared by the store implementations
pub(crate) fn ensure_advances(
    shard_id: &str,
    current: Option<&CheckpointRecord>,
    attempted: &SequenceNumber,
) -> Result<(), CheckpointError> {
    match current {
        Some(current) if attempted < &current.sequence_number => Err(CheckpointError::Stale {
            shard_id: shard_id.to_string(),
            current: current.sequence_number.clone(),
            attempted: attempted.clone(),
        }),
        _ => Ok(()),
    }
}

#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbCheckpointStore;
pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;
