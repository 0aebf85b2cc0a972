//! The stream service boundary.
//!
//! [`StreamClient`] is the only way the consumer talks to the stream service,
//! so tests can swap in the mocks from [`crate::test`] and production code
//! passes an explicitly constructed `aws_sdk_kinesis::Client`.

use crate::record::{RawRecord, RecordBatch, SequenceNumber};
use async_trait::async_trait;
use aws_sdk_kinesis::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::Blob,
    types::{PutRecordsRequestEntry, Record, Shard, ShardIteratorType},
    Client,
};
use aws_smithy_types_convert::date_time::DateTimeExt;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Errors surfaced by the stream service, classified by how the consumer
/// reacts to them
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StreamClientError {
    #[error("Iterator expired")]
    ExpiredIterator,

    #[error("Provisioned throughput exceeded: {0}")]
    ThroughputExceeded(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("KMS error: {0}")]
    KmsError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("{0}")]
    Other(String),
}

impl StreamClientError {
    pub fn is_throttling(&self) -> bool {
        matches!(self, StreamClientError::ThroughputExceeded(_))
    }

    /// Map a service error code onto the taxonomy
    pub fn from_code(code: Option<&str>, message: String) -> Self {
        match code {
            Some("ProvisionedThroughputExceededException")
            | Some("LimitExceededException")
            | Some("ThrottlingException")
            | Some("KMSThrottlingException")
            | Some("RequestLimitExceeded") => StreamClientError::ThroughputExceeded(message),
            Some("ExpiredIteratorException") => StreamClientError::ExpiredIterator,
            Some("AccessDeniedException") => StreamClientError::AccessDenied(message),
            Some("InvalidArgumentException") | Some("ValidationException") => {
                StreamClientError::InvalidArgument(message)
            }
            Some("ResourceNotFoundException") => StreamClientError::ResourceNotFound(message),
            Some(code) if code.starts_with("KMS") => StreamClientError::KmsError(message),
            _ => StreamClientError::Other(message),
        }
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> StreamClientError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) => StreamClientError::Timeout(message),
        SdkError::DispatchFailure(_) => StreamClientError::ConnectionError(message),
        _ => {
            let code = err.as_service_error().and_then(|e| e.code());
            StreamClientError::from_code(code, message)
        }
    }
}

/// Summary of a shard returned by `ListShards`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescription {
    pub shard_id: String,
    pub parent_shard_id: Option<String>,
    pub adjacent_parent_shard_id: Option<String>,
    /// Set once the shard has been closed by a reshard
    pub ending_sequence_number: Option<SequenceNumber>,
}

impl ShardDescription {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            parent_shard_id: None,
            adjacent_parent_shard_id: None,
            ending_sequence_number: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.ending_sequence_number.is_some()
    }

    fn from_sdk(shard: &Shard) -> Self {
        Self {
            shard_id: shard.shard_id().to_string(),
            parent_shard_id: shard.parent_shard_id().map(String::from),
            adjacent_parent_shard_id: shard.adjacent_parent_shard_id().map(String::from),
            ending_sequence_number: shard
                .sequence_number_range()
                .and_then(|range| range.ending_sequence_number())
                .map(SequenceNumber::from),
        }
    }
}

/// Where a shard iterator should point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardPosition {
    TrimHorizon,
    Latest,
    AtSequenceNumber(SequenceNumber),
    AfterSequenceNumber(SequenceNumber),
    AtTimestamp(DateTime<Utc>),
}

impl ShardPosition {
    fn iterator_type(&self) -> ShardIteratorType {
        match self {
            ShardPosition::TrimHorizon => ShardIteratorType::TrimHorizon,
            ShardPosition::Latest => ShardIteratorType::Latest,
            ShardPosition::AtSequenceNumber(_) => ShardIteratorType::AtSequenceNumber,
            ShardPosition::AfterSequenceNumber(_) => ShardIteratorType::AfterSequenceNumber,
            ShardPosition::AtTimestamp(_) => ShardIteratorType::AtTimestamp,
        }
    }
}

/// A record to publish
#[derive(Debug, Clone, PartialEq)]
pub struct PutRecordEntry {
    pub partition_key: String,
    pub payload: Bytes,
}

impl PutRecordEntry {
    pub fn new(partition_key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            partition_key: partition_key.into(),
            payload: payload.into(),
        }
    }
}

/// Where the service placed a published record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecordResult {
    pub shard_id: String,
    pub sequence_number: SequenceNumber,
}

/// Per-entry failure inside a `PutRecords` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecordFailure {
    pub error_code: String,
    pub error_message: String,
}

impl PutRecordFailure {
    pub fn is_throttled(&self) -> bool {
        self.error_code == "ProvisionedThroughputExceededException"
            || self.error_code == "InternalFailure"
    }
}

/// One entry of a `PutRecords` response, in request order
pub type PutRecordOutcome = std::result::Result<PutRecordResult, PutRecordFailure>;

#[async_trait]
pub trait StreamClient: Send + Sync {
    /// List every shard of the stream, following pagination
    async fn describe_shards(
        &self,
        stream_name: &str,
    ) -> Result<Vec<ShardDescription>, StreamClientError>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &ShardPosition,
    ) -> Result<String, StreamClientError>;

    async fn get_records(&self, iterator: &str, limit: i32)
        -> Result<RecordBatch, StreamClientError>;

    async fn put_record(
        &self,
        stream_name: &str,
        entry: PutRecordEntry,
    ) -> Result<PutRecordResult, StreamClientError>;

    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<PutRecordEntry>,
    ) -> Result<Vec<PutRecordOutcome>, StreamClientError>;
}

/// Build a Kinesis client from the default provider chain (environment,
/// profile, instance metadata)
pub async fn kinesis_client_from_env() -> Client {
    let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    Client::new(&config)
}

fn raw_record_from_sdk(record: &Record) -> RawRecord {
    let approximate_arrival = record
        .approximate_arrival_timestamp()
        .and_then(|ts| match ts.to_chrono_utc() {
            Ok(ts) => Some(ts),
            Err(e) => {
                warn!(error = %e, "Ignoring unrepresentable arrival timestamp");
                None
            }
        });

    RawRecord {
        sequence_number: SequenceNumber::from(record.sequence_number()),
        partition_key: record.partition_key().to_string(),
        payload: Bytes::copy_from_slice(record.data().as_ref()),
        approximate_arrival,
    }
}

#[async_trait]
impl StreamClient for Client {
    async fn describe_shards(
        &self,
        stream_name: &str,
    ) -> Result<Vec<ShardDescription>, StreamClientError> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // ListShards rejects StreamName together with NextToken
            let request = match &next_token {
                Some(token) => self.list_shards().next_token(token),
                None => self.list_shards().stream_name(stream_name),
            };
            let response = request.send().await.map_err(classify)?;

            shards.extend(response.shards().iter().map(ShardDescription::from_sdk));

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(stream = %stream_name, shard_count = shards.len(), "Listed shards");
        Ok(shards)
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &ShardPosition,
    ) -> Result<String, StreamClientError> {
        let mut req = self
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(shard_id)
            .shard_iterator_type(position.iterator_type());

        match position {
            ShardPosition::AtSequenceNumber(seq) | ShardPosition::AfterSequenceNumber(seq) => {
                req = req.starting_sequence_number(seq.as_str());
            }
            ShardPosition::AtTimestamp(ts) => {
                let system_time: SystemTime = (*ts).into();
                req = req.timestamp(aws_smithy_types::DateTime::from(system_time));
            }
            ShardPosition::TrimHorizon | ShardPosition::Latest => {}
        }

        let response = req.send().await.map_err(classify)?;
        response
            .shard_iterator()
            .map(String::from)
            .ok_or_else(|| StreamClientError::Other("No shard iterator returned".to_string()))
    }

    async fn get_records(
        &self,
        iterator: &str,
        limit: i32,
    ) -> Result<RecordBatch, StreamClientError> {
        let response = self
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(classify)?;

        let records: Vec<RawRecord> = response.records().iter().map(raw_record_from_sdk).collect();
        trace!(count = records.len(), "Fetched records");

        Ok(RecordBatch {
            records,
            next_iterator: response.next_shard_iterator().map(String::from),
            millis_behind_latest: response.millis_behind_latest(),
        })
    }

    async fn put_record(
        &self,
        stream_name: &str,
        entry: PutRecordEntry,
    ) -> Result<PutRecordResult, StreamClientError> {
        let response = self
            .put_record()
            .stream_name(stream_name)
            .partition_key(entry.partition_key)
            .data(Blob::new(entry.payload.to_vec()))
            .send()
            .await
            .map_err(classify)?;

        Ok(PutRecordResult {
            shard_id: response.shard_id().to_string(),
            sequence_number: SequenceNumber::from(response.sequence_number()),
        })
    }

    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<PutRecordEntry>,
    ) -> Result<Vec<PutRecordOutcome>, StreamClientError> {
        let request_entries = entries
            .into_iter()
            .map(|entry| {
                PutRecordsRequestEntry::builder()
                    .partition_key(entry.partition_key)
                    .data(Blob::new(entry.payload.to_vec()))
                    .build()
                    .map_err(|e| StreamClientError::InvalidArgument(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let response = self
            .put_records()
            .stream_name(stream_name)
            .set_records(Some(request_entries))
            .send()
            .await
            .map_err(classify)?;

        Ok(response
            .records()
            .iter()
            .map(|entry| match (entry.shard_id(), entry.sequence_number()) {
                (Some(shard_id), Some(sequence)) => Ok(PutRecordResult {
                    shard_id: shard_id.to_string(),
                    sequence_number: SequenceNumber::from(sequence),
                }),
                _ => Err(PutRecordFailure {
                    error_code: entry.error_code().unwrap_or("Unknown").to_string(),
                    error_message: entry.error_message().unwrap_or_default().to_string(),
                }),
            })
            .collect())
    }
}
