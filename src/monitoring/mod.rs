//! Monitoring for shard pollers
//!
//! Pollers emit [`ProcessingEvent`]s on an optional bounded channel when
//! [`MonitoringConfig::enabled`] is set. [`MetricsAggregator`] folds them into
//! per-shard counters and logs them on an interval.

mod metrics;
mod types;

pub use metrics::{MetricsAggregator, ShardMetrics};
#[cfg(any(test, feature = "test-utils"))]
pub use types::TestMonitoringHarness;
pub use types::{
    IteratorEventType, MonitoringConfig, ProcessingEvent, ProcessingEventType, ShardEventType,
};

use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Sending half of the monitoring channel, a no-op when monitoring is off
#[derive(Debug, Clone, Default)]
pub struct MonitoringSender {
    tx: Option<mpsc::Sender<ProcessingEvent>>,
}

impl MonitoringSender {
    /// Create the channel described by `config`
    pub fn channel(config: &MonitoringConfig) -> (Self, Option<mpsc::Receiver<ProcessingEvent>>) {
        if config.enabled {
            let (tx, rx) = mpsc::channel(config.channel_size.max(1));
            (Self { tx: Some(tx) }, Some(rx))
        } else {
            (Self::default(), None)
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Never blocks the caller; events are dropped when the buffer is full
    pub fn send(&self, event: ProcessingEvent) {
        if let Some(tx) = &self.tx {
            match tx.try_send(event) {
                Ok(()) => trace!("Sent monitoring event successfully"),
                Err(mpsc::error::TrySendError::Full(event)) => {
                    warn!(shard_id = %event.shard_id, "Monitoring channel full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!("Monitoring receiver dropped");
                }
            }
        }
    }
}
