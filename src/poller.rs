//! Per-shard polling state machine
//!
//! A [`ShardPoller`] owns one shard for as long as it runs:
//!
//! ```text
//! Starting -> Polling -> { Polling, Backoff } -> Finished | Failed
//! ```
//!
//! plus a clean `Stopped` exit when shutdown is signalled. Each poll cycle
//! fetches a batch, decodes it, hands it to the sink and checkpoints the last
//! delivered sequence number only after the sink confirmed the batch.

use crate::client::{ShardPosition, StreamClient, StreamClientError};
use crate::codec::RecordDecoder;
use crate::config::ConsumerConfig;
use crate::error::{CheckpointError, ConsumerError, Result, SinkError};
use crate::monitoring::{IteratorEventType, MonitoringSender, ProcessingEvent, ShardEventType};
use crate::record::{CheckpointRecord, DecodedRecord, RawRecord, RecordBatch, SequenceNumber};
use crate::retry::{
    sleep_unless_shutdown, Backoff, ExponentialBackoff, RetryConfig, RetryError, RetryHandle,
};
use crate::sink::RecordSink;
use crate::store::CheckpointStore;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Lifecycle status of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardStatus {
    Starting,
    Polling,
    Backoff,
    Failed,
    Finished,
    /// The poller exited on shutdown
    Stopped,
}

impl ShardStatus {
    /// Whether no poller will run on the shard again
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShardStatus::Finished)
    }
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardStatus::Starting => "starting",
            ShardStatus::Polling => "polling",
            ShardStatus::Backoff => "backoff",
            ShardStatus::Failed => "failed",
            ShardStatus::Finished => "finished",
            ShardStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Observable state of one shard, published on a `watch` channel
#[derive(Debug, Clone, PartialEq)]
pub struct ShardState {
    pub shard_id: String,
    pub iterator_token: Option<String>,
    pub last_checkpointed_sequence: Option<SequenceNumber>,
    pub status: ShardStatus,
    /// Pollers started on this shard after the first one
    pub restarts: u32,
    pub consecutive_corrupt: u32,
    pub last_error: Option<String>,
}

impl ShardState {
    pub fn new(shard_id: impl Into<String>) -> Self {
        Self {
            shard_id: shard_id.into(),
            iterator_token: None,
            last_checkpointed_sequence: None,
            status: ShardStatus::Starting,
            restarts: 0,
            consecutive_corrupt: 0,
            last_error: None,
        }
    }
}

/// How a poller ended
#[derive(Debug)]
pub enum PollerOutcome {
    /// The shard is closed and every record was delivered
    Finished,
    Failed(ConsumerError),
    /// Shutdown was signalled
    Stopped,
}

/// Dependencies shared by every poller of a consumer
pub struct ConsumerContext<C, S, D, K>
where
    D: RecordDecoder,
{
    pub(crate) client: Arc<C>,
    pub(crate) store: Arc<S>,
    pub(crate) decoder: Arc<D>,
    pub(crate) sink: Arc<K>,
    pub(crate) config: Arc<ConsumerConfig>,
    pub(crate) monitoring: MonitoringSender,
}

impl<C, S, D, K> Clone for ConsumerContext<C, S, D, K>
where
    D: RecordDecoder,
{
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            store: Arc::clone(&self.store),
            decoder: Arc::clone(&self.decoder),
            sink: Arc::clone(&self.sink),
            config: Arc::clone(&self.config),
            monitoring: self.monitoring.clone(),
        }
    }
}

impl<C, S, D, K> ConsumerContext<C, S, D, K>
where
    C: StreamClient + 'static,
    S: CheckpointStore + 'static,
    D: RecordDecoder,
    K: RecordSink<D::Item> + 'static,
{
    pub fn new(
        client: Arc<C>,
        store: Arc<S>,
        decoder: Arc<D>,
        sink: Arc<K>,
        config: ConsumerConfig,
        monitoring: MonitoringSender,
    ) -> Self {
        Self {
            client,
            store,
            decoder,
            sink,
            config: Arc::new(config),
            monitoring,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }
}

fn flatten_retry<E, F>(err: RetryError<E>, wrap: F) -> ConsumerError
where
    E: fmt::Display + fmt::Debug,
    F: FnOnce(E) -> ConsumerError,
{
    match err {
        RetryError::Interrupted => ConsumerError::Shutdown,
        RetryError::Rejected(e) => wrap(e),
        RetryError::MaxRetriesExceeded { last_error, .. } => wrap(last_error),
    }
}

fn retry_handle(config: &RetryConfig) -> RetryHandle<ExponentialBackoff> {
    RetryHandle::new(config.clone(), config.backoff())
}

/// Shutdown receiver that never fires. A batch handed to the sink runs its
/// deliver and checkpoint retries to the end of their budget.
fn batch_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}

/// Runs one shard until it finishes, fails or is stopped
pub struct ShardPoller<C, S, D, K>
where
    D: RecordDecoder,
{
    ctx: ConsumerContext<C, S, D, K>,
    state: ShardState,
    state_tx: Arc<watch::Sender<ShardState>>,
    shutdown: watch::Receiver<bool>,
    poll_backoff: ExponentialBackoff,
    poll_retries: u32,
}

impl<C, S, D, K> ShardPoller<C, S, D, K>
where
    C: StreamClient + 'static,
    S: CheckpointStore + 'static,
    D: RecordDecoder,
    K: RecordSink<D::Item> + 'static,
{
    pub fn new(
        ctx: ConsumerContext<C, S, D, K>,
        state: ShardState,
        state_tx: Arc<watch::Sender<ShardState>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let poll_backoff = ctx.config.poll_retry.backoff();
        Self {
            ctx,
            state,
            state_tx,
            shutdown,
            poll_backoff,
            poll_retries: 0,
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.state.shard_id
    }

    /// Drive the shard to completion. Never panics on service errors; every
    /// failure is reported as [`PollerOutcome::Failed`].
    #[instrument(skip(self), fields(shard_id = %self.state.shard_id, restarts = self.state.restarts))]
    pub async fn run(mut self) -> PollerOutcome {
        self.emit(ProcessingEvent::shard_event(
            self.shard_id().to_string(),
            ShardEventType::Started,
            None,
        ));

        let outcome = match self.poll_loop().await {
            Ok(never) => match never {},
            Err(ConsumerError::ShardClosed(_)) => PollerOutcome::Finished,
            Err(ConsumerError::Shutdown) => PollerOutcome::Stopped,
            Err(e) => PollerOutcome::Failed(e),
        };

        match &outcome {
            PollerOutcome::Finished => {
                info!(shard_id = %self.shard_id(), "Shard closed and fully consumed");
                self.set_status(ShardStatus::Finished);
                self.emit(ProcessingEvent::shard_event(
                    self.shard_id().to_string(),
                    ShardEventType::Finished,
                    None,
                ));
            }
            PollerOutcome::Failed(e) => {
                error!(shard_id = %self.shard_id(), error = %e, "Shard poller failed");
                self.state.last_error = Some(e.to_string());
                self.set_status(ShardStatus::Failed);
                self.emit(ProcessingEvent::shard_event(
                    self.shard_id().to_string(),
                    ShardEventType::Failed,
                    Some(e.to_string()),
                ));
            }
            PollerOutcome::Stopped => {
                info!(shard_id = %self.shard_id(), "Shard poller stopped");
                self.set_status(ShardStatus::Stopped);
                self.emit(ProcessingEvent::shard_event(
                    self.shard_id().to_string(),
                    ShardEventType::Stopped,
                    None,
                ));
            }
        }

        outcome
    }

    /// Only returns with an error; `ShardClosed` and `Shutdown` are the
    /// clean exits
    async fn poll_loop(&mut self) -> Result<Infallible> {
        self.set_status(ShardStatus::Starting);
        self.load_checkpoint().await?;
        let mut iterator = self.resolve_iterator(IteratorEventType::Initial).await?;
        self.set_status(ShardStatus::Polling);

        loop {
            if *self.shutdown.borrow() {
                return Err(ConsumerError::Shutdown);
            }

            let batch = match self.fetch(&iterator).await {
                Ok(batch) => batch,
                Err(ConsumerError::IteratorExpired(_)) => {
                    warn!(shard_id = %self.shard_id(), "Iterator expired, re-resolving");
                    self.emit(ProcessingEvent::iterator(
                        self.shard_id().to_string(),
                        IteratorEventType::Expired,
                        None,
                    ));
                    iterator = self.resolve_iterator(IteratorEventType::Renewed).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let RecordBatch {
                records,
                next_iterator,
                millis_behind_latest,
            } = batch;
            let was_empty = records.is_empty();

            trace!(
                shard_id = %self.shard_id(),
                count = records.len(),
                millis_behind_latest = ?millis_behind_latest,
                "Fetched batch"
            );

            if !was_empty {
                self.process_batch(records).await?;
            }

            match next_iterator {
                Some(next) => {
                    self.state.iterator_token = Some(next.clone());
                    self.publish();
                    iterator = next;
                }
                None => return Err(ConsumerError::ShardClosed(self.shard_id().to_string())),
            }

            if was_empty && !sleep_unless_shutdown(self.ctx.config.idle_interval, &mut self.shutdown).await
            {
                return Err(ConsumerError::Shutdown);
            }
        }
    }

    async fn load_checkpoint(&mut self) -> Result<()> {
        let store = Arc::clone(&self.ctx.store);
        let shard_id = self.shard_id().to_string();

        let checkpoint: Option<CheckpointRecord> = retry_handle(&self.ctx.config.checkpoint_retry)
            .retry_if(
                || store.get_checkpoint(&shard_id),
                CheckpointError::is_retryable,
                &mut self.shutdown,
            )
            .await
            .map_err(|e| flatten_retry(e, ConsumerError::CheckpointFailed))?;

        debug!(
            shard_id = %shard_id,
            checkpoint = ?checkpoint.as_ref().map(|cp| cp.sequence_number.as_str()),
            "Loaded checkpoint"
        );
        self.state.last_checkpointed_sequence = checkpoint.map(|cp| cp.sequence_number);
        self.publish();
        Ok(())
    }

    /// Iterator position for the current checkpoint, or the configured
    /// initial position when the shard has none
    fn start_position(&self) -> ShardPosition {
        match &self.state.last_checkpointed_sequence {
            Some(sequence) => ShardPosition::AfterSequenceNumber(sequence.clone()),
            None => ShardPosition::from(&self.ctx.config.initial_position),
        }
    }

    async fn resolve_iterator(&mut self, kind: IteratorEventType) -> Result<String> {
        let position = self.start_position();
        let client = Arc::clone(&self.ctx.client);
        let stream_name = self.ctx.config.stream_name.clone();
        let shard_id = self.shard_id().to_string();

        debug!(shard_id = %shard_id, position = ?position, "Resolving shard iterator");

        let result = self
            .call_with_backoff("GetShardIterator", || {
                client.get_shard_iterator(&stream_name, &shard_id, &position)
            })
            .await;

        match result {
            Ok(iterator) => {
                self.emit(ProcessingEvent::iterator(shard_id, kind, None));
                self.state.iterator_token = Some(iterator.clone());
                self.publish();
                Ok(iterator)
            }
            Err(e) => {
                if !matches!(e, ConsumerError::Shutdown) {
                    self.emit(ProcessingEvent::iterator(
                        shard_id,
                        IteratorEventType::Failed,
                        Some(e.to_string()),
                    ));
                }
                Err(e)
            }
        }
    }

    async fn fetch(&mut self, iterator: &str) -> Result<RecordBatch> {
        let client = Arc::clone(&self.ctx.client);
        let limit = self.ctx.config.batch_size;
        self.call_with_backoff("GetRecords", || client.get_records(iterator, limit))
            .await
    }

    /// Run a stream service call under the poll deadline, backing off on
    /// transient failures until the poll retry budget is spent
    async fn call_with_backoff<T, F, Fut>(&mut self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StreamClientError>>,
    {
        let timeout = self.ctx.config.poll_timeout;

        loop {
            let error = match tokio::time::timeout(timeout, call()).await {
                Ok(Ok(value)) => {
                    if self.poll_retries > 0 {
                        debug!(
                            shard_id = %self.shard_id(),
                            operation,
                            retries = self.poll_retries,
                            "Recovered after backoff"
                        );
                        self.poll_retries = 0;
                        self.poll_backoff.reset();
                        self.set_status(ShardStatus::Polling);
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => ConsumerError::for_shard(e, self.shard_id()),
                Err(_) => ConsumerError::Timeout(timeout),
            };

            if !error.is_transient() {
                return Err(error);
            }

            if self.ctx.config.poll_retry.exhausted(self.poll_retries) {
                warn!(
                    shard_id = %self.shard_id(),
                    operation,
                    attempts = self.poll_retries + 1,
                    error = %error,
                    "Retry budget exhausted"
                );
                return Err(ConsumerError::RetriesExhausted {
                    attempts: self.poll_retries + 1,
                    last_error: error.to_string(),
                });
            }

            let delay = self.poll_backoff.next_delay(self.poll_retries);
            self.poll_retries += 1;
            self.set_status(ShardStatus::Backoff);

            warn!(
                shard_id = %self.shard_id(),
                operation,
                attempt = self.poll_retries,
                delay_ms = ?delay.as_millis(),
                error = %error,
                "Backing off"
            );
            self.emit(ProcessingEvent::backoff(
                self.shard_id().to_string(),
                self.poll_retries,
                delay,
                error.to_string(),
            ));

            if !sleep_unless_shutdown(delay, &mut self.shutdown).await {
                return Err(ConsumerError::Shutdown);
            }
        }
    }

    async fn process_batch(&mut self, mut records: Vec<RawRecord>) -> Result<()> {
        let started = Instant::now();
        let fetched = records.len();
        records.sort_by(|a, b| a.sequence_number.cmp(&b.sequence_number));

        let tolerance = self.ctx.config.corrupt_record_tolerance;
        let mut decoded: Vec<DecodedRecord<D::Item>> = Vec::with_capacity(fetched);
        let mut corrupt = 0usize;

        for record in &records {
            if let Some(last) = &self.state.last_checkpointed_sequence {
                if record.sequence_number <= *last {
                    trace!(
                        shard_id = %self.shard_id(),
                        sequence = %record.sequence_number,
                        "Skipping record at or below checkpoint"
                    );
                    continue;
                }
            }

            match self.ctx.decoder.decode_record(record) {
                Ok(item) => {
                    self.state.consecutive_corrupt = 0;
                    decoded.push(item);
                }
                Err(e) => {
                    corrupt += 1;
                    self.state.consecutive_corrupt += 1;
                    warn!(
                        shard_id = %self.shard_id(),
                        sequence = %record.sequence_number,
                        consecutive = self.state.consecutive_corrupt,
                        error = %e,
                        "Skipping undecodable record"
                    );
                    self.emit(ProcessingEvent::corrupt_record(
                        self.shard_id().to_string(),
                        record.sequence_number.to_string(),
                        e.to_string(),
                    ));

                    if self.state.consecutive_corrupt > tolerance {
                        return Err(ConsumerError::CorruptRecords {
                            shard_id: self.shard_id().to_string(),
                            count: self.state.consecutive_corrupt,
                        });
                    }
                }
            }
        }

        let last_delivered = decoded.last().map(|record| record.sequence_number.clone());
        if let Some(last) = last_delivered {
            self.deliver(&decoded).await?;
            self.checkpoint(&last).await?;
        }

        self.emit(ProcessingEvent::batch_complete(
            self.shard_id().to_string(),
            fetched,
            decoded.len(),
            corrupt,
            started.elapsed(),
        ));
        Ok(())
    }

    async fn deliver(&mut self, batch: &[DecodedRecord<D::Item>]) -> Result<()> {
        let sink = Arc::clone(&self.ctx.sink);
        let shard_id = self.shard_id().to_string();

        retry_handle(&self.ctx.config.sink_retry)
            .retry_if(
                || sink.handle(&shard_id, batch),
                |e| matches!(e, SinkError::SoftFailure(_)),
                &mut batch_shutdown(),
            )
            .await
            .map_err(|e| flatten_retry(e, |e| ConsumerError::SinkFailed(e.to_string())))?;

        trace!(shard_id = %shard_id, count = batch.len(), "Sink confirmed batch");
        Ok(())
    }

    async fn checkpoint(&mut self, sequence: &SequenceNumber) -> Result<()> {
        let store = Arc::clone(&self.ctx.store);
        let shard_id = self.shard_id().to_string();

        let result = retry_handle(&self.ctx.config.checkpoint_retry)
            .retry_if(
                || store.save_checkpoint(&shard_id, sequence),
                CheckpointError::is_retryable,
                &mut batch_shutdown(),
            )
            .await;

        match result {
            Ok(_) => {
                debug!(shard_id = %shard_id, sequence = %sequence, "Checkpointed");
                self.state.last_checkpointed_sequence = Some(sequence.clone());
                self.publish();
                self.emit(ProcessingEvent::checkpoint(
                    shard_id,
                    sequence.to_string(),
                    true,
                    None,
                ));
                Ok(())
            }
            Err(e) => {
                let err = flatten_retry(e, ConsumerError::CheckpointFailed);
                self.emit(ProcessingEvent::checkpoint(
                    shard_id,
                    sequence.to_string(),
                    false,
                    Some(err.to_string()),
                ));
                Err(err)
            }
        }
    }

    fn set_status(&mut self, status: ShardStatus) {
        if self.state.status != status {
            trace!(shard_id = %self.shard_id(), from = %self.state.status, to = %status, "Status change");
            self.state.status = status;
        }
        self.publish();
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn emit(&self, event: ProcessingEvent) {
        self.ctx.monitoring.send(event);
    }
}
