use crate::error::CheckpointError;
use crate::record::{CheckpointRecord, SequenceNumber};
use crate::retry::{ExponentialBackoff, RetryConfig, RetryError, RetryHandle};
use crate::store::CheckpointStore;
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::{DisplayErrorContext, SdkError},
    types::AttributeValue,
    Client as DynamoClient,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, trace};

const KEY_ATTR: &str = "shard_id";
const SEQUENCE_ATTR: &str = "sequence_number";
const ORDERING_ATTR: &str = "ordering_key";
const UPDATED_ATTR: &str = "updated_at";

/// Checkpoint store backed by a DynamoDB table keyed by `shard_id`.
///
/// Writes are conditional on the stored ordering key not being ahead of the
/// new one, which gives compare-and-set semantics per shard without a global
/// lock. DynamoDB acknowledges a `PutItem` only once it is durable.
#[derive(Debug, Clone)]
pub struct DynamoDbCheckpointStore {
    client: DynamoClient,
    table_name: String,
    key_prefix: String,
    retry_config: RetryConfig,
    backoff: ExponentialBackoff,
}

enum PutOutcome {
    Written,
    Conflict,
}

impl DynamoDbCheckpointStore {
    pub fn builder() -> DynamoDbCheckpointStoreBuilder {
        DynamoDbCheckpointStoreBuilder::new()
    }

    fn prefixed_key(&self, shard_id: &str) -> String {
        format!("{}{}", self.key_prefix, shard_id)
    }

    fn retry_handle(&self) -> RetryHandle<ExponentialBackoff> {
        RetryHandle::new(self.retry_config.clone(), self.backoff.clone())
    }

    async fn read_item(&self, key: &str) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY_ATTR, AttributeValue::S(key.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| CheckpointError::StoreUnavailable(DisplayErrorContext(&e).to_string()))?;

        response
            .item()
            .map(|item| record_from_item(key, item))
            .transpose()
    }
}

fn record_from_item(
    key: &str,
    item: &HashMap<String, AttributeValue>,
) -> Result<CheckpointRecord, CheckpointError> {
    let sequence = item
        .get(SEQUENCE_ATTR)
        .and_then(|attr| attr.as_s().ok())
        .ok_or_else(|| {
            CheckpointError::InvalidData(format!("item {} has no {}", key, SEQUENCE_ATTR))
        })?;

    let timestamp = item
        .get(UPDATED_ATTR)
        .and_then(|attr| attr.as_s().ok())
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Ok(CheckpointRecord {
        shard_id: key.to_string(),
        sequence_number: SequenceNumber::from(sequence.as_str()),
        timestamp,
    })
}

fn flatten(err: RetryError<CheckpointError>) -> CheckpointError {
    match err {
        RetryError::MaxRetriesExceeded { attempts, last_error } => {
            CheckpointError::StoreUnavailable(format!("after {} attempts: {}", attempts, last_error))
        }
        RetryError::Rejected(e) => e,
        RetryError::Interrupted => {
            CheckpointError::StoreUnavailable("interrupted by shutdown".to_string())
        }
    }
}

#[async_trait]
impl CheckpointStore for DynamoDbCheckpointStore {
    #[instrument(skip(self), fields(table = %self.table_name, prefix = %self.key_prefix))]
    async fn get_checkpoint(
        &self,
        shard_id: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let key = self.prefixed_key(shard_id);
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        trace!(shard_id = %shard_id, key = %key, "Getting checkpoint from DynamoDB");

        let checkpoint = self
            .retry_handle()
            .retry_if(
                || self.read_item(&key),
                CheckpointError::is_retryable,
                &mut shutdown_rx,
            )
            .await
            .map_err(flatten)?
            .map(|mut record| {
                record.shard_id = shard_id.to_string();
                record
            });

        debug!(
            shard_id = %shard_id,
            key = %key,
            checkpoint = ?checkpoint.as_ref().map(|cp| cp.sequence_number.as_str()),
            "Retrieved checkpoint from DynamoDB"
        );

        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(table = %self.table_name, prefix = %self.key_prefix))]
    async fn save_checkpoint(
        &self,
        shard_id: &str,
        sequence_number: &SequenceNumber,
    ) -> Result<CheckpointRecord, CheckpointError> {
        let key = self.prefixed_key(shard_id);
        let record = CheckpointRecord::new(shard_id, sequence_number.clone());
        let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        debug!(
            shard_id = %shard_id,
            key = %key,
            sequence_number = %sequence_number,
            "Saving checkpoint to DynamoDB"
        );

        let ordering = sequence_number.ordering_key();
        let updated_at = record.timestamp.to_rfc3339();
        let (client, table, item_key) = (&self.client, self.table_name.as_str(), key.as_str());
        let (ordering, updated_at) = (ordering.as_str(), updated_at.as_str());

        let outcome = self
            .retry_handle()
            .retry_if(
                move || async move {
                    let result = client
                        .put_item()
                        .table_name(table)
                        .item(KEY_ATTR, AttributeValue::S(item_key.to_string()))
                        .item(SEQUENCE_ATTR, AttributeValue::S(sequence_number.to_string()))
                        .item(ORDERING_ATTR, AttributeValue::S(ordering.to_string()))
                        .item(UPDATED_ATTR, AttributeValue::S(updated_at.to_string()))
                        .condition_expression(
                            "attribute_not_exists(#key) OR #ordering <= :ordering",
                        )
                        .expression_attribute_names("#key", KEY_ATTR)
                        .expression_attribute_names("#ordering", ORDERING_ATTR)
                        .expression_attribute_values(
                            ":ordering",
                            AttributeValue::S(ordering.to_string()),
                        )
                        .send()
                        .await;

                    match result {
                        Ok(_) => Ok(PutOutcome::Written),
                        Err(SdkError::ServiceError(e))
                            if e.err().is_conditional_check_failed_exception() =>
                        {
                            Ok(PutOutcome::Conflict)
                        }
                        Err(e) => Err(CheckpointError::StoreUnavailable(
                            DisplayErrorContext(&e).to_string(),
                        )),
                    }
                },
                CheckpointError::is_retryable,
                &mut shutdown_rx,
            )
            .await
            .map_err(flatten)?;

        if let PutOutcome::Conflict = outcome {
            let current = self.read_item(&key).await?;
            return Err(CheckpointError::Stale {
                shard_id: shard_id.to_string(),
                current: current
                    .map(|cp| cp.sequence_number)
                    .unwrap_or_else(|| SequenceNumber::from("unknown")),
                attempted: sequence_number.clone(),
            });
        }

        debug!(
            shard_id = %shard_id,
            key = %key,
            sequence_number = %sequence_number,
            "Successfully saved checkpoint to DynamoDB"
        );

        Ok(record)
    }
}

#[derive(Debug)]
pub struct DynamoDbCheckpointStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    key_prefix: Option<String>,
    retry_config: RetryConfig,
}

impl Default for DynamoDbCheckpointStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamoDbCheckpointStoreBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            table_name: None,
            key_prefix: None,
            retry_config: RetryConfig {
                max_retries: Some(5),
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(30),
                jitter_factor: 0.1,
            },
        }
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    /// Prefix keys, e.g. with `"{stream}:{application}:"`, to share a table
    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(key_prefix.into());
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn build(self) -> Result<DynamoDbCheckpointStore, CheckpointError> {
        let backoff = self.retry_config.backoff();
        Ok(DynamoDbCheckpointStore {
            client: self.client.ok_or_else(|| {
                CheckpointError::InvalidData("DynamoDB client is required".to_string())
            })?,
            table_name: self
                .table_name
                .ok_or_else(|| CheckpointError::InvalidData("Table name is required".to_string()))?,
            key_prefix: self.key_prefix.unwrap_or_default(),
            retry_config: self.retry_config,
            backoff,
        })
    }
}
