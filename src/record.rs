//! Record, batch and checkpoint types shared by the poller, the sink and the
//! checkpoint stores.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A sequence number assigned by the stream service.
///
/// Sequence numbers are decimal strings that can be far wider than a `u128`,
/// so they are kept as text and ordered numerically: a longer digit string is
/// larger, equal lengths compare lexicographically. Leading zeros only break
/// ties, so `"007" < "7"` and ordering agrees with equality. Values that are
/// not purely decimal sort after every decimal one, by plain string order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(String);

impl SequenceNumber {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    fn digits(&self) -> Option<&str> {
        if !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit()) {
            let trimmed = self.0.trim_start_matches('0');
            Some(if trimmed.is_empty() { "0" } else { trimmed })
        } else {
            None
        }
    }

    /// Zero-padded form used by stores that can only compare strings.
    pub fn ordering_key(&self) -> String {
        match self.digits() {
            Some(digits) => format!("{:0>128}", digits),
            None => self.0.clone(),
        }
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.digits(), other.digits()) {
            (Some(a), Some(b)) => a
                .len()
                .cmp(&b.len())
                .then_with(|| a.cmp(b))
                .then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SequenceNumber {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SequenceNumber {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for SequenceNumber {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A record as returned by the stream service, before decoding
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub payload: Bytes,
    pub approximate_arrival: Option<DateTime<Utc>>,
}

impl RawRecord {
    pub fn new(
        sequence_number: impl Into<SequenceNumber>,
        partition_key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            partition_key: partition_key.into(),
            payload: payload.into(),
            approximate_arrival: None,
        }
    }
}

/// One `GetRecords` response.
///
/// `next_iterator == None` means the shard is closed and fully read.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<RawRecord>,
    pub next_iterator: Option<String>,
    pub millis_behind_latest: Option<i64>,
}

impl RecordBatch {
    pub fn new(records: Vec<RawRecord>, next_iterator: Option<String>) -> Self {
        Self {
            records,
            next_iterator,
            millis_behind_latest: None,
        }
    }

    pub fn is_end_of_shard(&self) -> bool {
        self.next_iterator.is_none()
    }
}

/// A record whose payload was decoded successfully
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord<T> {
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    pub approximate_arrival: Option<DateTime<Utc>>,
    pub data: T,
}

/// The durable position of a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub shard_id: String,
    pub sequence_number: SequenceNumber,
    pub timestamp: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(shard_id: impl Into<String>, sequence_number: SequenceNumber) -> Self {
        Self {
            shard_id: shard_id.into(),
            sequence_number,
            timestamp: Utc::now(),
        }
    }
}
