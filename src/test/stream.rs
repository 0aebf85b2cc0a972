//! A small in-process stand-in for the stream service.
//!
//! Shards are plain vectors of records and iterator tokens are
//! `"{shard_id}#{index}"`, so tests can drive full poller and coordinator
//! runs, including restarts, without scripting every response.

use crate::client::{
    PutRecordEntry, PutRecordFailure, PutRecordOutcome, PutRecordResult, ShardDescription,
    ShardPosition, StreamClient, StreamClientError,
};
use crate::record::{RawRecord, RecordBatch, SequenceNumber};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Debug, Default)]
struct ShardData {
    records: Vec<RawRecord>,
    closed: bool,
}

#[derive(Debug, Default)]
struct StreamState {
    stream_name: String,
    shards: BTreeMap<String, ShardData>,
    next_sequence: u64,
    throttled_reads: u32,
    expired_reads: u32,
    throttled_puts: u32,
    get_records_calls: usize,
    iterator_requests: Vec<(String, ShardPosition)>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStream {
    state: Arc<Mutex<StreamState>>,
}

impl InMemoryStream {
    pub fn new(stream_name: &str, shard_ids: &[&str]) -> Self {
        let shards = shard_ids
            .iter()
            .map(|id| (id.to_string(), ShardData::default()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(StreamState {
                stream_name: stream_name.to_string(),
                shards,
                next_sequence: 1,
                ..StreamState::default()
            })),
        }
    }

    /// Append a record with an explicit sequence number
    pub fn append(&self, shard_id: &str, sequence: &str, payload: impl Into<Bytes>) {
        let mut state = self.state.lock();
        let shard = state.shards.entry(shard_id.to_string()).or_default();
        let mut record = RawRecord::new(sequence, format!("{}-key", shard_id), payload);
        record.approximate_arrival = Some(Utc::now());
        shard.records.push(record);
    }

    /// Mark a shard closed; readers finish once they reach its end
    pub fn close_shard(&self, shard_id: &str) {
        if let Some(shard) = self.state.lock().shards.get_mut(shard_id) {
            shard.closed = true;
        }
    }

    /// Fail the next `times` GetRecords calls with throttling
    pub fn throttle_reads(&self, times: u32) {
        self.state.lock().throttled_reads += times;
    }

    /// Fail the next `times` GetRecords calls with an expired iterator
    pub fn expire_reads(&self, times: u32) {
        self.state.lock().expired_reads += times;
    }

    /// Reject the next `times` PutRecords entries with throttling
    pub fn throttle_puts(&self, times: u32) {
        self.state.lock().throttled_puts += times;
    }

    pub fn records(&self, shard_id: &str) -> Vec<RawRecord> {
        self.state
            .lock()
            .shards
            .get(shard_id)
            .map(|shard| shard.records.clone())
            .unwrap_or_default()
    }

    pub fn iterator_requests(&self) -> Vec<(String, ShardPosition)> {
        self.state.lock().iterator_requests.clone()
    }

    pub fn get_records_calls(&self) -> usize {
        self.state.lock().get_records_calls
    }

    fn parse_token(token: &str) -> Result<(&str, usize), StreamClientError> {
        token
            .rsplit_once('#')
            .and_then(|(shard, idx)| idx.parse().ok().map(|idx| (shard, idx)))
            .ok_or_else(|| StreamClientError::InvalidArgument(format!("bad iterator {}", token)))
    }

    fn check_stream(state: &StreamState, stream_name: &str) -> Result<(), StreamClientError> {
        if state.stream_name == stream_name {
            Ok(())
        } else {
            Err(StreamClientError::ResourceNotFound(format!(
                "Stream {} not found",
                stream_name
            )))
        }
    }

    fn put_locked(
        state: &mut StreamState,
        entry: PutRecordEntry,
    ) -> Result<PutRecordResult, StreamClientError> {
        let open: Vec<String> = state
            .shards
            .iter()
            .filter(|(_, shard)| !shard.closed)
            .map(|(id, _)| id.clone())
            .collect();
        if open.is_empty() {
            return Err(StreamClientError::InvalidArgument(
                "No open shards".to_string(),
            ));
        }

        let mut hasher = DefaultHasher::new();
        entry.partition_key.hash(&mut hasher);
        let shard_id = open[(hasher.finish() % open.len() as u64) as usize].clone();

        let sequence = SequenceNumber::from(state.next_sequence.to_string());
        state.next_sequence += 1;

        let mut record = RawRecord::new(sequence.clone(), entry.partition_key, entry.payload);
        record.approximate_arrival = Some(Utc::now());
        state
            .shards
            .entry(shard_id.clone())
            .or_default()
            .records
            .push(record);

        Ok(PutRecordResult {
            shard_id,
            sequence_number: sequence,
        })
    }
}

#[async_trait]
impl StreamClient for InMemoryStream {
    async fn describe_shards(
        &self,
        stream_name: &str,
    ) -> Result<Vec<ShardDescription>, StreamClientError> {
        let state = self.state.lock();
        Self::check_stream(&state, stream_name)?;
        Ok(state
            .shards
            .iter()
            .map(|(id, shard)| ShardDescription {
                ending_sequence_number: if shard.closed {
                    shard.records.last().map(|r| r.sequence_number.clone())
                } else {
                    None
                },
                ..ShardDescription::new(id.clone())
            })
            .collect())
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        position: &ShardPosition,
    ) -> Result<String, StreamClientError> {
        let mut state = self.state.lock();
        Self::check_stream(&state, stream_name)?;
        state
            .iterator_requests
            .push((shard_id.to_string(), position.clone()));

        let shard = state.shards.get(shard_id).ok_or_else(|| {
            StreamClientError::ResourceNotFound(format!("Shard {} not found", shard_id))
        })?;
        let records = &shard.records;

        let index = match position {
            ShardPosition::TrimHorizon => 0,
            ShardPosition::Latest => records.len(),
            ShardPosition::AtSequenceNumber(seq) => records
                .iter()
                .position(|r| &r.sequence_number >= seq)
                .unwrap_or(records.len()),
            ShardPosition::AfterSequenceNumber(seq) => records
                .iter()
                .position(|r| &r.sequence_number > seq)
                .unwrap_or(records.len()),
            ShardPosition::AtTimestamp(ts) => records
                .iter()
                .position(|r| r.approximate_arrival.is_some_and(|arrival| arrival >= *ts))
                .unwrap_or(records.len()),
        };

        Ok(format!("{}#{}", shard_id, index))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, StreamClientError> {
        let mut state = self.state.lock();
        state.get_records_calls += 1;

        if state.throttled_reads > 0 {
            state.throttled_reads -= 1;
            return Err(StreamClientError::ThroughputExceeded(
                "Rate exceeded for shard".to_string(),
            ));
        }
        if state.expired_reads > 0 {
            state.expired_reads -= 1;
            return Err(StreamClientError::ExpiredIterator);
        }

        let (shard_id, start) = Self::parse_token(iterator)?;
        let shard = state.shards.get(shard_id).ok_or_else(|| {
            StreamClientError::ResourceNotFound(format!("Shard {} not found", shard_id))
        })?;

        let start = start.min(shard.records.len());
        let end = (start + limit.max(1) as usize).min(shard.records.len());
        let records = shard.records[start..end].to_vec();

        let next_iterator = if shard.closed && end == shard.records.len() {
            None
        } else {
            Some(format!("{}#{}", shard_id, end))
        };

        Ok(RecordBatch {
            records,
            next_iterator,
            millis_behind_latest: Some(0),
        })
    }

    async fn put_record(
        &self,
        stream_name: &str,
        entry: PutRecordEntry,
    ) -> Result<PutRecordResult, StreamClientError> {
        let mut state = self.state.lock();
        Self::check_stream(&state, stream_name)?;
        Self::put_locked(&mut state, entry)
    }

    async fn put_records(
        &self,
        stream_name: &str,
        entries: Vec<PutRecordEntry>,
    ) -> Result<Vec<PutRecordOutcome>, StreamClientError> {
        let mut state = self.state.lock();
        Self::check_stream(&state, stream_name)?;

        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            if state.throttled_puts > 0 {
                state.throttled_puts -= 1;
                outcomes.push(Err(PutRecordFailure {
                    error_code: "ProvisionedThroughputExceededException".to_string(),
                    error_message: "Rate exceeded for shard".to_string(),
                }));
                continue;
            }
            outcomes.push(Ok(Self::put_locked(&mut state, entry)?));
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_follow_iterators() -> anyhow::Result<()> {
        let stream = InMemoryStream::new("orders", &["shard-0"]);
        for seq in ["100", "101", "102"] {
            stream.append("shard-0", seq, seq.to_string());
        }

        let it = stream
            .get_shard_iterator("orders", "shard-0", &ShardPosition::TrimHorizon)
            .await?;
        let batch = stream.get_records(&it, 2).await?;
        assert_eq!(batch.records.len(), 2);

        let next = batch.next_iterator.expect("open shard");
        let batch = stream.get_records(&next, 10).await?;
        assert_eq!(batch.records[0].sequence_number.as_str(), "102");
        assert!(!batch.is_end_of_shard());

        stream.close_shard("shard-0");
        let after = stream
            .get_shard_iterator(
                "orders",
                "shard-0",
                &ShardPosition::AfterSequenceNumber("101".into()),
            )
            .await?;
        let batch = stream.get_records(&after, 10).await?;
        assert_eq!(batch.records.len(), 1);
        assert!(batch.is_end_of_shard());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_stream_is_not_found() {
        let stream = InMemoryStream::new("orders", &["shard-0"]);
        assert!(matches!(
            stream.describe_shards("missing").await,
            Err(StreamClientError::ResourceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_records_throttles_entries() -> anyhow::Result<()> {
        let stream = InMemoryStream::new("orders", &["shard-0", "shard-1"]);
        stream.throttle_puts(1);

        let outcomes = stream
            .put_records(
                "orders",
                vec![
                    PutRecordEntry::new("a", "1"),
                    PutRecordEntry::new("b", "2"),
                ],
            )
            .await?;
        assert!(outcomes[0].is_err());
        assert!(outcomes[1].is_ok());
        Ok(())
    }
}
