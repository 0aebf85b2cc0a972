use crate::error::CheckpointError;
use crate::record::{CheckpointRecord, SequenceNumber};
use crate::store::{ensure_advances, CheckpointStore};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, trace};

type Slot = Arc<Mutex<Option<CheckpointRecord>>>;

/// In-memory implementation of checkpoint storage.
///
/// Each shard has its own slot lock so writes to one shard never wait on
/// another. Nothing survives the process; use it for tests and for consumers
/// that always start from the configured initial position.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCheckpointStore {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        debug!("Initializing in-memory checkpoint store");
        Self::default()
    }

    async fn slot(&self, shard_id: &str) -> Slot {
        if let Some(slot) = self.slots.read().await.get(shard_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().await;
        Arc::clone(slots.entry(shard_id.to_string()).or_default())
    }

    /// Snapshot of every stored checkpoint
    pub async fn get_all_checkpoints(&self) -> HashMap<String, SequenceNumber> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut checkpoints = HashMap::new();
        for (shard_id, slot) in slots {
            if let Some(record) = slot.lock().await.as_ref() {
                checkpoints.insert(shard_id, record.sequence_number.clone());
            }
        }
        checkpoints
    }

    /// Clear all checkpoints
    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    #[instrument(skip(self))]
    async fn get_checkpoint(
        &self,
        shard_id: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        trace!(shard_id = %shard_id, "Getting checkpoint from memory");

        let slot = match self.slots.read().await.get(shard_id) {
            Some(slot) => Arc::clone(slot),
            None => return Ok(None),
        };
        let checkpoint = slot.lock().await.clone();

        debug!(
            shard_id = %shard_id,
            checkpoint = ?checkpoint.as_ref().map(|cp| cp.sequence_number.as_str()),
            "Retrieved checkpoint from memory"
        );

        Ok(checkpoint)
    }

    #[instrument(skip(self))]
    async fn save_checkpoint(
        &self,
        shard_id: &str,
        sequence_number: &SequenceNumber,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let slot = self.slot(shard_id).await;
        let mut current = slot.lock().await;

        ensure_advances(shard_id, current.as_ref(), sequence_number)?;

        let record = CheckpointRecord::new(shard_id, sequence_number.clone());
        *current = Some(record.clone());

        trace!(
            shard_id = %shard_id,
            sequence_number = %sequence_number,
            "Checkpoint saved to memory"
        );

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_utils::verify_checkpoint;

    #[tokio::test]
    async fn test_unknown_shard_has_no_checkpoint() -> anyhow::Result<()> {
        let store = InMemoryCheckpointStore::new();
        verify_checkpoint(&store, "shard-0", None).await
    }

    #[tokio::test]
    async fn test_checkpoint_advances() -> anyhow::Result<()> {
        let store = InMemoryCheckpointStore::new();
        store.save_checkpoint("shard-0", &"100".into()).await?;
        store.save_checkpoint("shard-0", &"102".into()).await?;
        verify_checkpoint(&store, "shard-0", Some("102")).await?;

        let err = store
            .save_checkpoint("shard-0", &"101".into())
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Stale { .. }));
        verify_checkpoint(&store, "shard-0", Some("102")).await
    }

    #[tokio::test]
    async fn test_shards_are_independent() -> anyhow::Result<()> {
        let store = InMemoryCheckpointStore::new();
        store.save_checkpoint("shard-0", &"500".into()).await?;
        store.save_checkpoint("shard-1", &"7".into()).await?;

        let all = store.get_all_checkpoints().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all["shard-1"], SequenceNumber::from("7"));

        store.clear().await;
        verify_checkpoint(&store, "shard-0", None).await
    }

    #[tokio::test]
    async fn test_concurrent_writes_keep_the_maximum() -> anyhow::Result<()> {
        let store = InMemoryCheckpointStore::new();
        let mut handles = Vec::new();
        for i in 1..=50u32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                // losers of the race are rejected as stale, which is fine here
                let _ = store.save_checkpoint("shard-0", &i.to_string().into()).await;
            }));
        }
        for handle in handles {
            handle.await?;
        }
        verify_checkpoint(&store, "shard-0", Some("50")).await
    }
}
