use std::time::{Duration, SystemTime};

#[cfg(any(test, feature = "test-utils"))]
use std::collections::HashSet;
#[cfg(any(test, feature = "test-utils"))]
use tokio::sync::mpsc;
#[cfg(any(test, feature = "test-utils"))]
use tracing::debug;

/// Configuration for the monitoring system
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often the aggregator logs per-shard metrics
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl MonitoringConfig {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }
}

/// A monitoring event emitted by a shard poller or its supervisor
#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// ID of the shard this event relates to
    pub shard_id: String,
    /// The type of event and its details
    pub event_type: ProcessingEventType,
}

#[derive(Debug, Clone)]
pub enum ProcessingEventType {
    /// One poll cycle that returned records
    BatchComplete {
        fetched: usize,
        delivered: usize,
        corrupt: usize,
        duration: Duration,
    },
    /// A retryable failure put the poller to sleep before the next attempt
    Backoff {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    Checkpoint {
        sequence_number: String,
        success: bool,
        error: Option<String>,
    },
    /// A record that could not be decoded and was skipped
    CorruptRecord {
        sequence_number: String,
        error: String,
    },
    ShardEvent {
        event_type: ShardEventType,
        details: Option<String>,
    },
    Iterator {
        event_type: IteratorEventType,
        error: Option<String>,
    },
}

/// Types of shard-level events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardEventType {
    /// A poller started on the shard
    Started,
    /// The shard was closed and fully consumed
    Finished,
    /// The poller gave up on the shard
    Failed,
    /// The poller exited on shutdown
    Stopped,
    /// The supervisor started a fresh poller after a failure
    Restarted,
}

/// Types of iterator events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorEventType {
    /// First iterator for this poller
    Initial,
    /// Iterator re-resolved after expiry
    Renewed,
    /// Iterator expired
    Expired,
    /// Failed to get iterator
    Failed,
}

impl ProcessingEvent {
    fn now(shard_id: String, event_type: ProcessingEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            shard_id,
            event_type,
        }
    }

    pub fn batch_complete(
        shard_id: String,
        fetched: usize,
        delivered: usize,
        corrupt: usize,
        duration: Duration,
    ) -> Self {
        Self::now(
            shard_id,
            ProcessingEventType::BatchComplete {
                fetched,
                delivered,
                corrupt,
                duration,
            },
        )
    }

    pub fn backoff(shard_id: String, attempt: u32, delay: Duration, reason: String) -> Self {
        Self::now(
            shard_id,
            ProcessingEventType::Backoff {
                attempt,
                delay,
                reason,
            },
        )
    }

    pub fn checkpoint(
        shard_id: String,
        sequence_number: String,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self::now(
            shard_id,
            ProcessingEventType::Checkpoint {
                sequence_number,
                success,
                error,
            },
        )
    }

    pub fn corrupt_record(shard_id: String, sequence_number: String, error: String) -> Self {
        Self::now(
            shard_id,
            ProcessingEventType::CorruptRecord {
                sequence_number,
                error,
            },
        )
    }

    pub fn shard_event(
        shard_id: String,
        event_type: ShardEventType,
        details: Option<String>,
    ) -> Self {
        Self::now(
            shard_id,
            ProcessingEventType::ShardEvent {
                event_type,
                details,
            },
        )
    }

    pub fn iterator(
        shard_id: String,
        event_type: IteratorEventType,
        error: Option<String>,
    ) -> Self {
        Self::now(
            shard_id,
            ProcessingEventType::Iterator { event_type, error },
        )
    }

    /// Short, stable name for the event, e.g. `checkpoint_102_success`
    pub fn key(&self) -> String {
        match &self.event_type {
            ProcessingEventType::BatchComplete {
                delivered, corrupt, ..
            } => format!("batch_complete_{}_{}", delivered, corrupt),
            ProcessingEventType::Backoff { attempt, .. } => format!("backoff_{}", attempt),
            ProcessingEventType::Checkpoint {
                sequence_number,
                success,
                ..
            } => {
                let status = if *success { "success" } else { "failure" };
                format!("checkpoint_{}_{}", sequence_number, status)
            }
            ProcessingEventType::CorruptRecord {
                sequence_number, ..
            } => format!("corrupt_record_{}", sequence_number),
            ProcessingEventType::ShardEvent { event_type, .. } => match event_type {
                ShardEventType::Started => "shard_started".to_string(),
                ShardEventType::Finished => "shard_finished".to_string(),
                ShardEventType::Failed => "shard_failed".to_string(),
                ShardEventType::Stopped => "shard_stopped".to_string(),
                ShardEventType::Restarted => "shard_restarted".to_string(),
            },
            ProcessingEventType::Iterator { event_type, .. } => match event_type {
                IteratorEventType::Initial => "iterator_initial".to_string(),
                IteratorEventType::Renewed => "iterator_renewed".to_string(),
                IteratorEventType::Expired => "iterator_expired".to_string(),
                IteratorEventType::Failed => "iterator_failed".to_string(),
            },
        }
    }
}

/// Collects monitoring events so tests can wait on them by key
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct TestMonitoringHarness {
    pub monitoring_rx: mpsc::Receiver<ProcessingEvent>,
    events_seen: HashSet<String>,
    event_history: Vec<ProcessingEvent>,
}

#[cfg(any(test, feature = "test-utils"))]
impl TestMonitoringHarness {
    pub fn new(monitoring_rx: mpsc::Receiver<ProcessingEvent>) -> Self {
        Self {
            monitoring_rx,
            events_seen: HashSet::new(),
            event_history: Vec::new(),
        }
    }

    /// Wait until every key in `expected_events` has been seen
    pub async fn wait_for_events(&mut self, expected_events: &[&str]) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

        while !expected_events.iter().all(|e| self.events_seen.contains(*e)) {
            match tokio::time::timeout_at(deadline, self.monitoring_rx.recv()).await {
                Ok(Some(event)) => self.record(event),
                Ok(None) => {
                    return Err(anyhow::anyhow!(
                        "Channel closed before seeing all events. Expected: {:?}, Seen: {:?}",
                        expected_events,
                        self.events_seen
                    ))
                }
                Err(_) => {
                    return Err(anyhow::anyhow!(
                        "Timeout waiting for events. Expected: {:?}, Seen: {:?}",
                        expected_events,
                        self.events_seen
                    ))
                }
            }
        }

        debug!("All expected events seen: {:?}", expected_events);
        Ok(())
    }

    /// Drain whatever is already buffered without waiting
    pub fn drain(&mut self) {
        while let Ok(event) = self.monitoring_rx.try_recv() {
            self.record(event);
        }
    }

    fn record(&mut self, event: ProcessingEvent) {
        self.events_seen.insert(event.key());
        self.event_history.push(event);
    }

    pub fn has_seen_event(&self, event: &str) -> bool {
        self.events_seen.contains(event)
    }

    pub fn get_event_history(&self) -> &[ProcessingEvent] {
        &self.event_history
    }

    /// Delays of every backoff event seen so far, in order
    pub fn backoff_delays(&self) -> Vec<Duration> {
        self.event_history
            .iter()
            .filter_map(|event| match event.event_type {
                ProcessingEventType::Backoff { delay, .. } => Some(delay),
                _ => None,
            })
            .collect()
    }

    pub fn dump_history(&self) {
        debug!("=== Event History ===");
        for (i, event) in self.event_history.iter().enumerate() {
            debug!("[{}] {:?}", i, event);
        }
        debug!("=== End History ===");
    }
}
