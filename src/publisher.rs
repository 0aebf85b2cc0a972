//! Producer side of the stream
//!
//! Records are JSON encoded. Batches are split into requests of at most
//! [`MAX_BATCH_ENTRIES`] entries; entries the service rejects with throttling
//! are resent with backoff, and every input record ends with a result in
//! input order.

use crate::client::{PutRecordEntry, PutRecordOutcome, PutRecordResult, StreamClient, StreamClientError};
use crate::error::{ConsumerError, PublishError};
use crate::retry::{Backoff, RetryConfig, RetryError, RetryHandle};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Upper bound on entries in a single `PutRecords` request
pub const MAX_BATCH_ENTRIES: usize = 500;

/// Per-record results of [`StreamPublisher::publish_batch`], in input order
#[derive(Debug, Clone, Default)]
pub struct BatchPublishResult {
    pub outcomes: Vec<PutRecordOutcome>,
}

impl BatchPublishResult {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn is_complete(&self) -> bool {
        self.failed() == 0
    }
}

fn is_retryable(err: &StreamClientError) -> bool {
    ConsumerError::from(err.clone()).is_transient()
}

fn flatten(err: RetryError<StreamClientError>) -> PublishError {
    match err {
        RetryError::Rejected(e) => PublishError::Stream(e),
        RetryError::MaxRetriesExceeded {
            attempts,
            last_error,
        } => PublishError::RetriesExhausted {
            attempts,
            last_error,
        },
        RetryError::Interrupted => PublishError::Stream(StreamClientError::Other(
            "publish interrupted".to_string(),
        )),
    }
}

/// Publishes JSON records to one stream
pub struct StreamPublisher<C> {
    client: Arc<C>,
    stream_name: String,
    retry_config: RetryConfig,
}

impl<C: StreamClient> StreamPublisher<C> {
    pub fn new(client: C, stream_name: impl Into<String>) -> Self {
        Self::from_shared(Arc::new(client), stream_name)
    }

    pub fn from_shared(client: Arc<C>, stream_name: impl Into<String>) -> Self {
        Self {
            client,
            stream_name: stream_name.into(),
            retry_config: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Encode `item` as JSON and publish it under `partition_key`
    pub async fn publish<T: Serialize>(
        &self,
        item: &T,
        partition_key: &str,
    ) -> Result<PutRecordResult, PublishError> {
        let payload = serde_json::to_vec(item)?;
        self.publish_raw(Bytes::from(payload), partition_key).await
    }

    /// Publish an already encoded payload
    #[instrument(skip(self, payload), fields(stream = %self.stream_name, bytes = payload.len()))]
    pub async fn publish_raw(
        &self,
        payload: Bytes,
        partition_key: &str,
    ) -> Result<PutRecordResult, PublishError> {
        let entry = Self::entry(partition_key, payload)?;
        let client = &self.client;
        let stream_name = self.stream_name.as_str();
        let entry = &entry;
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let result = RetryHandle::new(self.retry_config.clone(), self.retry_config.backoff())
            .retry_if(
                move || async move { client.put_record(stream_name, entry.clone()).await },
                is_retryable,
                &mut shutdown_rx,
            )
            .await
            .map_err(flatten)?;

        debug!(
            shard_id = %result.shard_id,
            sequence_number = %result.sequence_number,
            "Published record"
        );
        Ok(result)
    }

    /// Publish `(item, partition_key)` pairs as JSON.
    ///
    /// Encoding errors fail the whole call before anything is sent. Entries
    /// still throttled once the retry budget is spent come back as `Err`
    /// outcomes rather than failing the call.
    pub async fn publish_batch<T: Serialize>(
        &self,
        items: &[(T, String)],
    ) -> Result<BatchPublishResult, PublishError> {
        let entries = items
            .iter()
            .map(|(item, key)| Self::entry(key, Bytes::from(serde_json::to_vec(item)?)))
            .collect::<Result<Vec<_>, PublishError>>()?;
        self.publish_entries(entries).await
    }

    #[instrument(skip(self, entries), fields(stream = %self.stream_name, count = entries.len()))]
    pub async fn publish_entries(
        &self,
        entries: Vec<PutRecordEntry>,
    ) -> Result<BatchPublishResult, PublishError> {
        let mut outcomes = Vec::with_capacity(entries.len());
        for chunk in entries.chunks(MAX_BATCH_ENTRIES) {
            outcomes.extend(self.publish_chunk(chunk.to_vec()).await?);
        }

        let result = BatchPublishResult { outcomes };
        info!(
            succeeded = result.succeeded(),
            failed = result.failed(),
            "Published batch"
        );
        Ok(result)
    }

    async fn publish_chunk(
        &self,
        entries: Vec<PutRecordEntry>,
    ) -> Result<Vec<PutRecordOutcome>, PublishError> {
        let mut results: Vec<Option<PutRecordOutcome>> = vec![None; entries.len()];
        let mut pending: Vec<(usize, PutRecordEntry)> = entries.into_iter().enumerate().collect();
        let mut backoff = self.retry_config.backoff();
        let mut retries = 0u32;

        loop {
            let request: Vec<PutRecordEntry> = pending.iter().map(|(_, e)| e.clone()).collect();
            let response = self.put_records(request).await?;
            if response.len() != pending.len() {
                return Err(PublishError::InvalidResponse {
                    expected: pending.len(),
                    actual: response.len(),
                });
            }

            let mut throttled = Vec::new();
            for ((index, entry), outcome) in pending.into_iter().zip(response) {
                if let Err(failure) = &outcome {
                    if failure.is_throttled() {
                        throttled.push((index, entry));
                    }
                }
                results[index] = Some(outcome);
            }

            if throttled.is_empty() {
                break;
            }
            if self.retry_config.exhausted(retries) {
                warn!(
                    remaining = throttled.len(),
                    retries, "Giving up on throttled entries"
                );
                break;
            }

            let delay = backoff.next_delay(retries);
            retries += 1;
            warn!(
                throttled = throttled.len(),
                retry = retries,
                delay_ms = ?delay.as_millis(),
                "Entries throttled, resending after delay"
            );
            tokio::time::sleep(delay).await;
            pending = throttled;
        }

        Ok(results.into_iter().flatten().collect())
    }

    async fn put_records(
        &self,
        entries: Vec<PutRecordEntry>,
    ) -> Result<Vec<PutRecordOutcome>, PublishError> {
        let client = &self.client;
        let stream_name = self.stream_name.as_str();
        let entries = &entries;
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        RetryHandle::new(self.retry_config.clone(), self.retry_config.backoff())
            .retry_if(
                move || async move { client.put_records(stream_name, entries.clone()).await },
                is_retryable,
                &mut shutdown_rx,
            )
            .await
            .map_err(flatten)
    }

    fn entry(partition_key: &str, payload: Bytes) -> Result<PutRecordEntry, PublishError> {
        if partition_key.is_empty() {
            return Err(PublishError::EmptyPartitionKey);
        }
        Ok(PutRecordEntry::new(partition_key, payload))
    }
}
