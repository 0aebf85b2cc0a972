//! The business-logic boundary of the consumer

use crate::error::SinkError;
use crate::record::DecodedRecord;
use async_trait::async_trait;
use std::sync::Arc;

/// Receives decoded records, one ordered batch per poll cycle.
///
/// Delivery is at-least-once: after a crash or a failed checkpoint the same
/// records are delivered again, so implementations must be idempotent per
/// sequence number.
///
/// # Examples
///
/// ```rust
/// use kinesis_shard_consumer::error::SinkError;
/// use kinesis_shard_consumer::record::DecodedRecord;
/// use kinesis_shard_consumer::sink::RecordSink;
///
/// struct PrintSink;
///
/// #[async_trait::async_trait]
/// impl RecordSink<String> for PrintSink {
///     async fn handle(
///         &self,
///         shard_id: &str,
///         batch: &[DecodedRecord<String>],
///     ) -> Result<(), SinkError> {
///         for record in batch {
///             println!("{} {} {}", shard_id, record.sequence_number, record.data);
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait RecordSink<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Handle a batch in sequence order.
    ///
    /// * `Ok(())` confirms the whole batch; the poller then checkpoints it
    /// * `Err(SinkError::SoftFailure)` is retried with backoff
    /// * `Err(SinkError::HardFailure)` fails the poller
    async fn handle(&self, shard_id: &str, batch: &[DecodedRecord<T>]) -> Result<(), SinkError>;
}

#[async_trait]
impl<T, K> RecordSink<T> for Arc<K>
where
    T: Send + Sync + 'static,
    K: RecordSink<T> + ?Sized,
{
    async fn handle(&self, shard_id: &str, batch: &[DecodedRecord<T>]) -> Result<(), SinkError> {
        (**self).handle(shard_id, batch).await
    }
}
