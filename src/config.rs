//! Consumer configuration

use crate::client::ShardPosition;
use crate::error::{ConsumerError, Result};
use crate::monitoring::MonitoringConfig;
use crate::retry::RetryConfig;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Largest `Limit` accepted by `GetRecords`
pub const MAX_BATCH_SIZE: i32 = 10_000;

/// Where a shard without a checkpoint starts reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialPosition {
    /// Start from the oldest available record
    TrimHorizon,
    /// Start from the newest record
    Latest,
    /// Start from a specific timestamp
    AtTimestamp(DateTime<Utc>),
}

impl From<&InitialPosition> for ShardPosition {
    fn from(position: &InitialPosition) -> Self {
        match position {
            InitialPosition::TrimHorizon => ShardPosition::TrimHorizon,
            InitialPosition::Latest => ShardPosition::Latest,
            InitialPosition::AtTimestamp(ts) => ShardPosition::AtTimestamp(*ts),
        }
    }
}

/// Configuration for the shard pollers and their coordinator
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name of the stream to consume
    pub stream_name: String,
    /// Maximum number of records to request per GetRecords call
    pub batch_size: i32,
    /// Starting point for shards that have no checkpoint
    pub initial_position: InitialPosition,
    /// Deadline for each GetRecords and GetShardIterator call
    pub poll_timeout: Duration,
    /// Pause after a poll that returned no records
    pub idle_interval: Duration,
    /// Backoff and budget for throttling, timeouts and connection errors
    pub poll_retry: RetryConfig,
    /// Backoff and budget for soft sink failures
    pub sink_retry: RetryConfig,
    /// Backoff and budget for checkpoint store failures
    pub checkpoint_retry: RetryConfig,
    /// Consecutive undecodable records tolerated before the poller fails
    pub corrupt_record_tolerance: u32,
    /// Wait before a failed poller is restarted
    pub restart_cooldown: Duration,
    pub monitoring: MonitoringConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            batch_size: 100,
            initial_position: InitialPosition::TrimHorizon,
            poll_timeout: Duration::from_secs(10),
            idle_interval: Duration::from_secs(1),
            poll_retry: RetryConfig {
                max_retries: Some(5),
                ..RetryConfig::default()
            },
            sink_retry: RetryConfig::default(),
            checkpoint_retry: RetryConfig::default(),
            corrupt_record_tolerance: 10,
            restart_cooldown: Duration::from_secs(5),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Self::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_initial_position(mut self, position: InitialPosition) -> Self {
        self.initial_position = position;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_poll_retry(mut self, retry: RetryConfig) -> Self {
        self.poll_retry = retry;
        self
    }

    pub fn with_sink_retry(mut self, retry: RetryConfig) -> Self {
        self.sink_retry = retry;
        self
    }

    pub fn with_checkpoint_retry(mut self, retry: RetryConfig) -> Self {
        self.checkpoint_retry = retry;
        self
    }

    pub fn with_corrupt_record_tolerance(mut self, tolerance: u32) -> Self {
        self.corrupt_record_tolerance = tolerance;
        self
    }

    pub fn with_restart_cooldown(mut self, cooldown: Duration) -> Self {
        self.restart_cooldown = cooldown;
        self
    }

    pub fn with_monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.monitoring = monitoring;
        self
    }

    /// Check the configuration before any task is spawned
    pub fn validate(&self) -> Result<()> {
        if self.stream_name.trim().is_empty() {
            return Err(ConsumerError::Config("stream_name must not be empty".into()));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConsumerError::Config(format!(
                "batch_size must be between 1 and {}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConsumerError::Config("poll_timeout must be positive".into()));
        }
        for (name, retry) in [
            ("poll_retry", &self.poll_retry),
            ("sink_retry", &self.sink_retry),
            ("checkpoint_retry", &self.checkpoint_retry),
        ] {
            if retry.initial_backoff > retry.max_backoff {
                return Err(ConsumerError::Config(format!(
                    "{}: initial_backoff {:?} exceeds max_backoff {:?}",
                    name, retry.initial_backoff, retry.max_backoff
                )));
            }
            if name != "poll_retry" && retry.max_retries.is_none() {
                return Err(ConsumerError::Config(format!(
                    "{}: max_retries must be set so a stopping poller can finish its batch",
                    name
                )));
            }
            if !(0.0..=1.0).contains(&retry.jitter_factor) {
                return Err(ConsumerError::Config(format!(
                    "{}: jitter_factor must be within 0.0..=1.0",
                    name
                )));
            }
        }
        self.validate_poll_retry()?;
        if self.monitoring.enabled && self.monitoring.channel_size == 0 {
            return Err(ConsumerError::Config(
                "monitoring.channel_size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Poll backoff must be bounded and keep growing until the last retry
    fn validate_poll_retry(&self) -> Result<()> {
        let retry = &self.poll_retry;
        let retries = retry.max_retries.ok_or_else(|| {
            ConsumerError::Config("poll_retry.max_retries must be set".into())
        })?;
        if retries < 2 {
            return Ok(());
        }
        if retry.initial_backoff.is_zero() {
            return Err(ConsumerError::Config(
                "poll_retry: initial_backoff must be positive".into(),
            ));
        }
        if retry.backoff().base_delay(retries - 2) >= retry.max_backoff {
            return Err(ConsumerError::Config(format!(
                "poll_retry: max_backoff {:?} is reached before the last of {} retries",
                retry.max_backoff, retries
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = ConsumerConfig::new("orders");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.idle_interval, Duration::from_secs(1));
        assert_eq!(config.initial_position, InitialPosition::TrimHorizon);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(matches!(
            ConsumerConfig::default().validate(),
            Err(ConsumerError::Config(_))
        ));
        assert!(ConsumerConfig::new("orders")
            .with_batch_size(0)
            .validate()
            .is_err());
        assert!(ConsumerConfig::new("orders")
            .with_batch_size(MAX_BATCH_SIZE + 1)
            .validate()
            .is_err());
        assert!(ConsumerConfig::new("orders")
            .with_poll_timeout(Duration::ZERO)
            .validate()
            .is_err());

        let inverted = RetryConfig {
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(1),
            ..RetryConfig::default()
        };
        assert!(ConsumerConfig::new("orders")
            .with_sink_retry(inverted)
            .validate()
            .is_err());
    }

    #[test]
    fn test_poll_backoff_must_grow_until_last_retry() {
        let poll_retry = |retries, initial_ms, max_ms| RetryConfig {
            max_retries: retries,
            initial_backoff: Duration::from_millis(initial_ms),
            max_backoff: Duration::from_millis(max_ms),
            jitter_factor: 0.5,
        };
        let check = |retry: RetryConfig| ConsumerConfig::new("orders").with_poll_retry(retry).validate();

        // bases 100, 200, 200: the last two waits would be equal
        assert!(matches!(
            check(poll_retry(Some(3), 100, 200)),
            Err(ConsumerError::Config(msg)) if msg.contains("max_backoff")
        ));
        // bases 100, 200, 300 with only the last one capped
        assert_ok!(check(poll_retry(Some(3), 100, 300)));
        assert_ok!(check(poll_retry(Some(1), 100, 100)));
        assert_err!(check(poll_retry(None, 100, 30_000)));
        assert_err!(check(poll_retry(Some(4), 0, 1_000)));
    }

    #[test]
    fn test_batch_retries_must_be_bounded() {
        let unbounded = RetryConfig {
            max_retries: None,
            ..RetryConfig::default()
        };
        assert_err!(ConsumerConfig::new("orders")
            .with_checkpoint_retry(unbounded.clone())
            .validate());
        assert_err!(ConsumerConfig::new("orders")
            .with_sink_retry(unbounded)
            .validate());
    }

    #[test]
    fn test_initial_position_maps_to_shard_position() {
        let ts = Utc::now();
        assert_eq!(
            ShardPosition::from(&InitialPosition::AtTimestamp(ts)),
            ShardPosition::AtTimestamp(ts)
        );
        assert_eq!(
            ShardPosition::from(&InitialPosition::Latest),
            ShardPosition::Latest
        );
    }
}
