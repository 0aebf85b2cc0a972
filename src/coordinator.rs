//! Fan-out over the shards of a stream
//!
//! The [`Coordinator`] lists the shards once, then runs one supervisor task
//! per shard. A supervisor holds the shard's lease and runs pollers one after
//! another: a failed poller is replaced after `restart_cooldown`, resuming
//! from the durable checkpoint, until the shard finishes, a fatal error is
//! hit or shutdown is signalled.

use crate::client::{StreamClient, StreamClientError};
use crate::codec::RecordDecoder;
use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, Result};
use crate::monitoring::{MonitoringSender, ProcessingEvent, ShardEventType};
use crate::poller::{ConsumerContext, PollerOutcome, ShardPoller, ShardState, ShardStatus};
use crate::retry::{sleep_unless_shutdown, RetryError, RetryHandle};
use crate::sink::RecordSink;
use crate::store::CheckpointStore;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Shards with a live supervisor, and the last published state of every
/// shard this coordinator has run
#[derive(Debug, Default)]
struct ShardRegistry {
    leases: parking_lot::Mutex<HashSet<String>>,
    states: parking_lot::RwLock<HashMap<String, watch::Receiver<ShardState>>>,
}

impl ShardRegistry {
    fn acquire(self: &Arc<Self>, shard_id: &str) -> Option<ShardLease> {
        if self.leases.lock().insert(shard_id.to_string()) {
            Some(ShardLease {
                shard_id: shard_id.to_string(),
                registry: Arc::clone(self),
            })
        } else {
            None
        }
    }

    fn is_active(&self, shard_id: &str) -> bool {
        self.leases.lock().contains(shard_id)
    }

    fn status(&self) -> HashMap<String, ShardStatus> {
        self.states
            .read()
            .iter()
            .map(|(id, rx)| (id.clone(), rx.borrow().status))
            .collect()
    }

    fn states(&self) -> HashMap<String, ShardState> {
        self.states
            .read()
            .iter()
            .map(|(id, rx)| (id.clone(), rx.borrow().clone()))
            .collect()
    }
}

/// Exclusive right to run pollers for one shard; released on drop
#[derive(Debug)]
struct ShardLease {
    shard_id: String,
    registry: Arc<ShardRegistry>,
}

impl Drop for ShardLease {
    fn drop(&mut self) {
        self.registry.leases.lock().remove(&self.shard_id);
    }
}

/// Handle to a running consumer returned by [`Coordinator::start`]
#[derive(Debug)]
pub struct ConsumerHandle {
    stream_name: String,
    shutdown_tx: watch::Sender<bool>,
    supervisors: Vec<(String, JoinHandle<Result<()>>)>,
    registry: Arc<ShardRegistry>,
}

impl ConsumerHandle {
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Shard ids this handle supervises
    pub fn shard_ids(&self) -> Vec<String> {
        self.supervisors.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn status(&self) -> HashMap<String, ShardStatus> {
        self.registry.status()
    }

    pub fn shard_states(&self) -> HashMap<String, ShardState> {
        self.registry.states()
    }

    /// Whether any shard still has a running supervisor
    pub fn is_running(&self) -> bool {
        self.supervisors.iter().any(|(_, handle)| !handle.is_finished())
    }

    /// Signal shutdown and wait for every supervisor to exit.
    ///
    /// Returns the first fatal error any shard hit.
    pub async fn stop(self) -> Result<()> {
        info!(stream = %self.stream_name, "Stopping consumer");
        // Err only means every supervisor is already gone
        let _ = self.shutdown_tx.send(true);
        self.join().await
    }

    /// Wait for every shard to finish or fail fatally without signalling
    /// shutdown
    pub async fn join(self) -> Result<()> {
        let (shard_ids, handles): (Vec<_>, Vec<_>) = self.supervisors.into_iter().unzip();
        let results = join_all(handles).await;
        let mut first_error = None;

        for (shard_id, result) in shard_ids.into_iter().zip(results) {
            let result = match result {
                Ok(result) => result,
                Err(e) => Err(ConsumerError::from(e)),
            };
            if let Err(e) = result {
                error!(shard_id = %shard_id, error = %e, "Shard supervisor ended with error");
                first_error.get_or_insert(e);
            }
        }

        info!(stream = %self.stream_name, "Consumer stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Runs one supervised poller per shard of a stream
///
/// # Examples
///
/// ```rust,no_run
/// use kinesis_shard_consumer::codec::JsonDecoder;
/// use kinesis_shard_consumer::config::ConsumerConfig;
/// use kinesis_shard_consumer::coordinator::Coordinator;
/// use kinesis_shard_consumer::error::SinkError;
/// use kinesis_shard_consumer::record::DecodedRecord;
/// use kinesis_shard_consumer::sink::RecordSink;
/// use kinesis_shard_consumer::store::FileCheckpointStore;
///
/// struct LogSink;
///
/// #[async_trait::async_trait]
/// impl RecordSink<serde_json::Value> for LogSink {
///     async fn handle(
///         &self,
///         shard_id: &str,
///         batch: &[DecodedRecord<serde_json::Value>],
///     ) -> Result<(), SinkError> {
///         println!("{}: {} records", shard_id, batch.len());
///         Ok(())
///     }
/// }
///
/// # async fn run() -> anyhow::Result<()> {
/// let client = kinesis_shard_consumer::client::kinesis_client_from_env().await;
/// let store = FileCheckpointStore::open("/var/lib/consumer/checkpoints")?;
/// let (coordinator, _monitoring_rx) = Coordinator::new(
///     client,
///     store,
///     JsonDecoder::<serde_json::Value>::new(),
///     LogSink,
///     ConsumerConfig::default(),
/// );
///
/// let handle = coordinator.start("orders").await?;
/// tokio::signal::ctrl_c().await?;
/// coordinator.stop(handle).await?;
/// # Ok(())
/// # }
/// ```
pub struct Coordinator<C, S, D, K>
where
    D: RecordDecoder,
{
    ctx: ConsumerContext<C, S, D, K>,
    registry: Arc<ShardRegistry>,
}

impl<C, S, D, K> Coordinator<C, S, D, K>
where
    C: StreamClient + 'static,
    S: CheckpointStore + 'static,
    D: RecordDecoder,
    K: RecordSink<D::Item> + 'static,
{
    /// Creates a coordinator and, when monitoring is enabled, the receiving
    /// end of its event channel
    pub fn new(
        client: C,
        store: S,
        decoder: D,
        sink: K,
        config: ConsumerConfig,
    ) -> (Self, Option<mpsc::Receiver<ProcessingEvent>>) {
        Self::from_shared(
            Arc::new(client),
            Arc::new(store),
            Arc::new(decoder),
            Arc::new(sink),
            config,
        )
    }

    /// Like [`Coordinator::new`] for dependencies the caller keeps a handle to
    pub fn from_shared(
        client: Arc<C>,
        store: Arc<S>,
        decoder: Arc<D>,
        sink: Arc<K>,
        config: ConsumerConfig,
    ) -> (Self, Option<mpsc::Receiver<ProcessingEvent>>) {
        let (monitoring, monitoring_rx) = MonitoringSender::channel(&config.monitoring);
        let ctx = ConsumerContext::new(client, store, decoder, sink, config, monitoring);
        (
            Self {
                ctx,
                registry: Arc::new(ShardRegistry::default()),
            },
            monitoring_rx,
        )
    }

    /// Discover the shards of `stream_name` and start one supervised poller
    /// per shard.
    ///
    /// An unknown stream or missing permissions fail here with
    /// [`ConsumerError::FatalConfig`]; nothing is spawned in that case.
    #[instrument(skip(self))]
    pub async fn start(&self, stream_name: &str) -> Result<ConsumerHandle> {
        let mut config = self.ctx.config().clone();
        config.stream_name = stream_name.to_string();
        config.validate()?;
        let ctx = ConsumerContext {
            config: Arc::new(config),
            ..self.ctx.clone()
        };

        let shards = Self::discover(&ctx).await?;
        info!(stream = %stream_name, shard_count = shards.len(), "Starting consumer");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut supervisors = Vec::with_capacity(shards.len());

        for shard_id in shards {
            let Some(lease) = self.registry.acquire(&shard_id) else {
                warn!(shard_id = %shard_id, "Shard already has an active poller, skipping");
                continue;
            };

            let (state_tx, state_rx) = watch::channel(ShardState::new(&shard_id));
            self.registry.states.write().insert(shard_id.clone(), state_rx);

            let handle = tokio::spawn(supervise(
                ctx.clone(),
                lease,
                Arc::new(state_tx),
                shutdown_rx.clone(),
            ));
            supervisors.push((shard_id, handle));
        }

        Ok(ConsumerHandle {
            stream_name: stream_name.to_string(),
            shutdown_tx,
            supervisors,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Signal shutdown to every poller of `handle` and wait for them
    pub async fn stop(&self, handle: ConsumerHandle) -> Result<()> {
        handle.stop().await
    }

    /// Start, then run until `shutdown` flips to true or every shard is done
    pub async fn run(
        &self,
        stream_name: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let handle = self.start(stream_name).await?;

        loop {
            if *shutdown.borrow() || !handle.is_running() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // sender dropped; keep running until the shards are done
                        return handle.join().await;
                    }
                }
                _ = tokio::time::sleep(self.ctx.config().idle_interval) => {}
            }
        }

        handle.stop().await
    }

    /// Status of every shard this coordinator has started
    pub fn status(&self) -> HashMap<String, ShardStatus> {
        self.registry.status()
    }

    /// Full state of every shard this coordinator has started
    pub fn shard_states(&self) -> HashMap<String, ShardState> {
        self.registry.states()
    }

    /// Whether a supervisor currently holds the shard
    pub fn is_active(&self, shard_id: &str) -> bool {
        self.registry.is_active(shard_id)
    }

    async fn discover(ctx: &ConsumerContext<C, S, D, K>) -> Result<Vec<String>> {
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let client = Arc::clone(&ctx.client);
        let stream_name = ctx.config.stream_name.as_str();

        let shards = RetryHandle::new(ctx.config.poll_retry.clone(), ctx.config.poll_retry.backoff())
            .retry_if(
                || client.describe_shards(stream_name),
                |e: &StreamClientError| ConsumerError::from(e.clone()).is_transient(),
                &mut shutdown_rx,
            )
            .await
            .map_err(|e| match e {
                RetryError::Rejected(e) => ConsumerError::from(e),
                RetryError::MaxRetriesExceeded {
                    attempts,
                    last_error,
                } => ConsumerError::RetriesExhausted {
                    attempts,
                    last_error: last_error.to_string(),
                },
                RetryError::Interrupted => ConsumerError::Shutdown,
            })?;

        for shard in &shards {
            debug!(
                shard_id = %shard.shard_id,
                parent = ?shard.parent_shard_id,
                closed = shard.is_closed(),
                "Discovered shard"
            );
        }

        Ok(shards.into_iter().map(|shard| shard.shard_id).collect())
    }
}

/// Run pollers for one shard until it finishes, fails fatally or shutdown
#[instrument(skip_all, fields(shard_id = %lease.shard_id))]
async fn supervise<C, S, D, K>(
    ctx: ConsumerContext<C, S, D, K>,
    lease: ShardLease,
    state_tx: Arc<watch::Sender<ShardState>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    C: StreamClient + 'static,
    S: CheckpointStore + 'static,
    D: RecordDecoder,
    K: RecordSink<D::Item> + 'static,
{
    let shard_id = lease.shard_id.clone();
    let mut restarts = 0u32;

    loop {
        let mut state = state_tx.borrow().clone();
        state.status = ShardStatus::Starting;
        state.iterator_token = None;
        state.consecutive_corrupt = 0;
        state.restarts = restarts;

        let poller = ShardPoller::new(ctx.clone(), state, Arc::clone(&state_tx), shutdown.clone());

        let outcome = match tokio::spawn(poller.run()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(shard_id = %shard_id, error = %e, "Shard poller task aborted");
                state_tx.send_modify(|state| {
                    state.status = ShardStatus::Failed;
                    state.last_error = Some(e.to_string());
                });
                PollerOutcome::Failed(ConsumerError::from(e))
            }
        };

        match outcome {
            PollerOutcome::Finished => {
                info!(shard_id = %shard_id, "Shard finished, releasing lease");
                return Ok(());
            }
            PollerOutcome::Stopped => return Ok(()),
            PollerOutcome::Failed(e) if e.is_fatal() => {
                error!(shard_id = %shard_id, error = %e, "Fatal error, shard will not be restarted");
                return Err(e);
            }
            PollerOutcome::Failed(e) => {
                let cooldown = ctx.config.restart_cooldown;
                warn!(
                    shard_id = %shard_id,
                    error = %e,
                    cooldown_ms = ?cooldown.as_millis(),
                    restarts,
                    "Restarting shard poller after cooldown"
                );

                if !sleep_unless_shutdown(cooldown, &mut shutdown).await {
                    debug!(shard_id = %shard_id, "Shutdown during restart cooldown");
                    return Ok(());
                }

                restarts += 1;
                ctx.monitoring.send(ProcessingEvent::shard_event(
                    shard_id.clone(),
                    ShardEventType::Restarted,
                    Some(e.to_string()),
                ));
            }
        }
    }
}
