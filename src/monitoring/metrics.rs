use super::types::{IteratorEventType, ProcessingEvent, ProcessingEventType, ShardEventType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Holds aggregated metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    // Record metrics
    pub batches: u64,
    pub records_fetched: u64,
    pub records_delivered: u64,
    pub records_corrupt: u64,
    pub processing_time: Duration,

    // Checkpoint metrics
    pub checkpoints_succeeded: u64,
    pub checkpoints_failed: u64,

    // Iterator metrics
    pub iterator_renewals: u64,
    pub iterator_failures: u64,

    // Lifecycle
    pub backoffs: u64,
    pub failures: u64,
    pub restarts: u64,

    // Performance metrics
    pub avg_batch_time: Duration,
    pub max_batch_time: Duration,

    pub window_start: Instant,
    pub last_updated: Instant,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            batches: 0,
            records_fetched: 0,
            records_delivered: 0,
            records_corrupt: 0,
            processing_time: Duration::default(),
            checkpoints_succeeded: 0,
            checkpoints_failed: 0,
            iterator_renewals: 0,
            iterator_failures: 0,
            backoffs: 0,
            failures: 0,
            restarts: 0,
            avg_batch_time: Duration::default(),
            max_batch_time: Duration::default(),
            window_start: now,
            last_updated: now,
        }
    }
}

/// Aggregates monitoring events into metrics
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, ShardMetrics>>>,
    window_duration: Duration,
    monitoring_rx: mpsc::Receiver<ProcessingEvent>,
}

impl MetricsAggregator {
    pub fn new(window_duration: Duration, monitoring_rx: mpsc::Receiver<ProcessingEvent>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// Shared handle to the live metrics, usable after `run` takes `self`
    pub fn metrics_handle(&self) -> Arc<RwLock<HashMap<String, ShardMetrics>>> {
        Arc::clone(&self.metrics)
    }

    /// Process events and log metrics until every sender is dropped
    pub async fn run(mut self) {
        let mut interval = interval(self.window_duration);

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => {
                        self.emit_metrics().await;
                        debug!("Monitoring channel closed, metrics aggregator exiting");
                        return;
                    }
                },
                _ = interval.tick() => {
                    self.emit_metrics().await;
                }
            }
        }
    }

    pub async fn process_event(&self, event: ProcessingEvent) {
        let mut metrics = self.metrics.write().await;
        let shard_metrics = metrics.entry(event.shard_id.clone()).or_default();

        match event.event_type {
            ProcessingEventType::BatchComplete {
                fetched,
                delivered,
                corrupt,
                duration,
            } => {
                shard_metrics.batches += 1;
                shard_metrics.records_fetched += fetched as u64;
                shard_metrics.records_delivered += delivered as u64;
                shard_metrics.records_corrupt += corrupt as u64;
                shard_metrics.processing_time += duration;
                shard_metrics.avg_batch_time = shard_metrics
                    .processing_time
                    .div_f64(shard_metrics.batches as f64);
                if duration > shard_metrics.max_batch_time {
                    shard_metrics.max_batch_time = duration;
                }
                trace!(
                    shard_id = %event.shard_id,
                    fetched,
                    delivered,
                    corrupt,
                    duration_ms = ?duration.as_millis(),
                    "Batch completed"
                );
            }
            ProcessingEventType::Backoff {
                attempt,
                delay,
                reason,
            } => {
                shard_metrics.backoffs += 1;
                debug!(
                    shard_id = %event.shard_id,
                    attempt,
                    delay_ms = ?delay.as_millis(),
                    reason = %reason,
                    "Backing off"
                );
            }
            ProcessingEventType::Checkpoint {
                sequence_number,
                success,
                error,
            } => {
                if success {
                    shard_metrics.checkpoints_succeeded += 1;
                    trace!(
                        shard_id = %event.shard_id,
                        sequence = %sequence_number,
                        "Checkpoint successful"
                    );
                } else {
                    shard_metrics.checkpoints_failed += 1;
                    warn!(
                        shard_id = %event.shard_id,
                        sequence = %sequence_number,
                        error = ?error,
                        "Checkpoint failed"
                    );
                }
            }
            ProcessingEventType::CorruptRecord {
                sequence_number,
                error,
            } => {
                warn!(
                    shard_id = %event.shard_id,
                    sequence = %sequence_number,
                    error = %error,
                    "Corrupt record skipped"
                );
            }
            ProcessingEventType::Iterator { event_type, error } => match event_type {
                IteratorEventType::Initial => {
                    trace!(shard_id = %event.shard_id, "Initial iterator acquired");
                }
                IteratorEventType::Renewed => {
                    shard_metrics.iterator_renewals += 1;
                    trace!(shard_id = %event.shard_id, "Iterator renewed");
                }
                IteratorEventType::Expired => {
                    debug!(shard_id = %event.shard_id, "Iterator expired");
                }
                IteratorEventType::Failed => {
                    shard_metrics.iterator_failures += 1;
                    warn!(shard_id = %event.shard_id, error = ?error, "Iterator operation failed");
                }
            },
            ProcessingEventType::ShardEvent {
                event_type,
                details,
            } => match event_type {
                ShardEventType::Started => {
                    debug!(shard_id = %event.shard_id, "Shard processing started");
                }
                ShardEventType::Finished => {
                    info!(shard_id = %event.shard_id, "Shard processing finished");
                }
                ShardEventType::Failed => {
                    shard_metrics.failures += 1;
                    warn!(shard_id = %event.shard_id, details = ?details, "Shard processing failed");
                }
                ShardEventType::Stopped => {
                    debug!(shard_id = %event.shard_id, "Shard processing stopped");
                }
                ShardEventType::Restarted => {
                    shard_metrics.restarts += 1;
                    info!(shard_id = %event.shard_id, details = ?details, "Shard poller restarted");
                }
            },
        }

        shard_metrics.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let mut metrics = self.metrics.write().await;

        for (shard_id, metrics) in metrics.iter() {
            if metrics.last_updated.elapsed() > self.window_duration * 2 {
                continue;
            }

            info!(
                shard_id = %shard_id,
                batches = metrics.batches,
                records_fetched = metrics.records_fetched,
                records_delivered = metrics.records_delivered,
                records_corrupt = metrics.records_corrupt,
                avg_batch_time_ms = %metrics.avg_batch_time.as_millis(),
                max_batch_time_ms = %metrics.max_batch_time.as_millis(),
                checkpoints_succeeded = metrics.checkpoints_succeeded,
                checkpoints_failed = metrics.checkpoints_failed,
                iterator_renewals = metrics.iterator_renewals,
                backoffs = metrics.backoffs,
                restarts = metrics.restarts,
                "Metrics for window"
            );

            if metrics.records_corrupt > 0 {
                warn!(
                    shard_id = %shard_id,
                    corrupt = metrics.records_corrupt,
                    "Corrupt records skipped"
                );
            }

            if metrics.checkpoints_failed > 0 {
                warn!(
                    shard_id = %shard_id,
                    failures = metrics.checkpoints_failed,
                    "Checkpoint failures detected"
                );
            }
        }

        let window = self.window_duration * 2;
        metrics.retain(|_, m| m.last_updated.elapsed() <= window);
    }

    /// Get current metrics for all shards
    pub async fn get_metrics(&self) -> HashMap<String, ShardMetrics> {
        self.metrics.read().await.clone()
    }

    /// Get metrics for a specific shard
    pub async fn get_shard_metrics(&self, shard_id: &str) -> Option<ShardMetrics> {
        self.metrics.read().await.get(shard_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_aggregates_batches_and_checkpoints() {
        let (_tx, rx) = mpsc::channel(10);
        let aggregator = MetricsAggregator::new(Duration::from_secs(60), rx);

        aggregator
            .process_event(ProcessingEvent::batch_complete(
                "shard-0".into(),
                3,
                2,
                1,
                Duration::from_millis(30),
            ))
            .await;
        aggregator
            .process_event(ProcessingEvent::batch_complete(
                "shard-0".into(),
                1,
                1,
                0,
                Duration::from_millis(10),
            ))
            .await;
        aggregator
            .process_event(ProcessingEvent::checkpoint(
                "shard-0".into(),
                "103".into(),
                true,
                None,
            ))
            .await;
        aggregator
            .process_event(ProcessingEvent::shard_event(
                "shard-0".into(),
                ShardEventType::Restarted,
                None,
            ))
            .await;

        let metrics = aggregator
            .get_shard_metrics("shard-0")
            .await
            .expect("shard-0 metrics");
        assert_eq!(metrics.batches, 2);
        assert_eq!(metrics.records_fetched, 4);
        assert_eq!(metrics.records_delivered, 3);
        assert_eq!(metrics.records_corrupt, 1);
        assert_eq!(metrics.avg_batch_time, Duration::from_millis(20));
        assert_eq!(metrics.max_batch_time, Duration::from_millis(30));
        assert_eq!(metrics.checkpoints_succeeded, 1);
        assert_eq!(metrics.restarts, 1);
    }

    #[tokio::test]
    async fn test_run_exits_when_senders_drop() -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel(10);
        let aggregator = MetricsAggregator::new(Duration::from_secs(60), rx);
        let metrics = aggregator.metrics_handle();
        let handle = tokio::spawn(aggregator.run());

        tx.send(ProcessingEvent::backoff(
            "shard-1".into(),
            0,
            Duration::from_millis(100),
            "throttled".into(),
        ))
        .await?;
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle).await??;
        assert_eq!(metrics.read().await["shard-1"].backoffs, 1);
        Ok(())
    }
}
