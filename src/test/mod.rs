//! Test utilities and mock implementations for exercising pollers,
//! the coordinator and the publisher without a real stream

pub mod stream;

pub use stream::InMemoryStream;

use crate::config::ConsumerConfig;
use crate::record::{RawRecord, RecordBatch};
use crate::retry::RetryConfig;
use std::sync::Once;
use std::time::Duration;

static INIT: Once = Once::new();

/// Install a test subscriber once per process; honours `RUST_LOG`
pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "kinesis_shard_consumer=debug".into()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    pub fn record(sequence_number: &str, data: &str) -> RawRecord {
        RawRecord::new(sequence_number, "test-partition-key", data.to_string())
    }

    /// Batch of `(sequence, payload)` records
    pub fn batch(records: &[(&str, &str)], next_iterator: Option<&str>) -> RecordBatch {
        RecordBatch::new(
            records
                .iter()
                .map(|(seq, data)| Self::record(seq, data))
                .collect(),
            next_iterator.map(String::from),
        )
    }

    /// Short backoffs with the given retry budget
    pub fn retry_config(max_retries: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_secs(1),
            jitter_factor: 0.1,
        }
    }

    /// Consumer configuration with every wait scaled down for tests
    pub fn fast_config() -> ConsumerConfig {
        ConsumerConfig::new("test-stream")
            .with_poll_timeout(Duration::from_secs(1))
            .with_idle_interval(Duration::from_millis(10))
            .with_poll_retry(Self::retry_config(Some(5)))
            .with_sink_retry(Self::retry_config(Some(3)))
            .with_checkpoint_retry(Self::retry_config(Some(3)))
            .with_restart_cooldown(Duration::from_millis(50))
    }

    /// Poll `check` until it holds or `timeout` passes
    pub async fn wait_for<F, Fut>(mut check: F, timeout: Duration) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while !check().await {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("Condition not met within {:?}", timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_helper() {
        let batch = TestUtils::batch(&[("1", "a"), ("2", "b")], Some("next"));
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.records[1].sequence_number.as_str(), "2");
        assert_eq!(batch.records[0].payload.as_ref(), b"a");
        assert_eq!(batch.next_iterator.as_deref(), Some("next"));
    }

    #[test]
    fn test_fast_config_is_valid() {
        assert!(TestUtils::fast_config().validate().is_ok());
    }
}
