//! Payload decoding
//!
//! A [`RecordDecoder`] turns the bytes of a [`RawRecord`] into the item type
//! the sink consumes. Decoding failures are per record: the poller skips the
//! record and counts it towards the corrupt-record tolerance.

use crate::error::DecodeError;
use crate::record::{DecodedRecord, RawRecord};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::marker::PhantomData;

pub trait RecordDecoder: Send + Sync + 'static {
    type Item: Send + Sync + Clone + Debug + 'static;

    fn decode(&self, record: &RawRecord) -> Result<Self::Item, DecodeError>;

    /// Decode and keep the record metadata next to the item
    fn decode_record(&self, record: &RawRecord) -> Result<DecodedRecord<Self::Item>, DecodeError> {
        Ok(DecodedRecord {
            sequence_number: record.sequence_number.clone(),
            partition_key: record.partition_key.clone(),
            approximate_arrival: record.approximate_arrival,
            data: self.decode(record)?,
        })
    }
}

/// Decodes each payload as one JSON document
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonDecoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Debug for JsonDecoder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonDecoder")
            .field("item", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T> RecordDecoder for JsonDecoder<T>
where
    T: DeserializeOwned + Send + Sync + Clone + Debug + 'static,
{
    type Item = T;

    fn decode(&self, record: &RawRecord) -> Result<T, DecodeError> {
        if record.payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(&record.payload)?)
    }
}

/// Decodes each payload as UTF-8 text
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Decoder;

impl RecordDecoder for Utf8Decoder {
    type Item = String;

    fn decode(&self, record: &RawRecord) -> Result<String, DecodeError> {
        Ok(std::str::from_utf8(&record.payload)?.to_string())
    }
}

/// Passes payloads through untouched; never fails
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesDecoder;

impl RecordDecoder for BytesDecoder {
    type Item = Bytes;

    fn decode(&self, record: &RawRecord) -> Result<Bytes, DecodeError> {
        Ok(record.payload.clone())
    }
}
