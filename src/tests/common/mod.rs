// src/tests/common/mod.rs
use crate::codec::Utf8Decoder;
use crate::config::ConsumerConfig;
use crate::coordinator::{ConsumerHandle, Coordinator};
use crate::monitoring::{MonitoringConfig, TestMonitoringHarness};
use crate::poller::ShardStatus;
use crate::store::CheckpointStore;
use crate::test::mocks::{MockCheckpointStore, MockRecordSink};
use crate::test::{init_logging, InMemoryStream, TestUtils};
use std::time::Duration;

pub const WAIT: Duration = Duration::from_secs(5);

pub type TestCoordinator<S> = Coordinator<InMemoryStream, S, Utf8Decoder, MockRecordSink<String>>;

/// A fake stream, a store and a recording sink wired to one coordinator
pub struct TestContext<S = MockCheckpointStore> {
    pub stream: InMemoryStream,
    pub store: S,
    pub sink: MockRecordSink<String>,
    pub config: ConsumerConfig,
}

impl TestContext<MockCheckpointStore> {
    pub fn new(shards: &[&str]) -> Self {
        init_logging();
        Self {
            stream: InMemoryStream::new("test-stream", shards),
            store: MockCheckpointStore::new(),
            sink: MockRecordSink::new(),
            config: TestUtils::fast_config(),
        }
    }
}

impl<S> TestContext<S>
where
    S: CheckpointStore + Clone + 'static,
{
    pub fn with_store<T: CheckpointStore + Clone + 'static>(self, store: T) -> TestContext<T> {
        TestContext {
            stream: self.stream,
            store,
            sink: self.sink,
            config: self.config,
        }
    }

    /// Append records whose payload is `payload-{seq}`
    pub fn fill(&self, shard_id: &str, sequences: &[&str]) {
        for seq in sequences {
            self.stream.append(shard_id, seq, format!("payload-{}", seq));
        }
    }

    pub fn coordinator(&self) -> TestCoordinator<S> {
        let (coordinator, _rx) = Coordinator::new(
            self.stream.clone(),
            self.store.clone(),
            Utf8Decoder,
            self.sink.clone(),
            self.config.clone(),
        );
        coordinator
    }

    pub fn monitored_coordinator(&self) -> (TestCoordinator<S>, TestMonitoringHarness) {
        let config = self.config.clone().with_monitoring(MonitoringConfig::enabled());
        let (coordinator, rx) = Coordinator::new(
            self.stream.clone(),
            self.store.clone(),
            Utf8Decoder,
            self.sink.clone(),
            config,
        );
        let rx = rx.expect("monitoring enabled");
        (coordinator, TestMonitoringHarness::new(rx))
    }
}

pub async fn wait_for_checkpoint<S: CheckpointStore>(
    store: &S,
    shard_id: &str,
    expected: &str,
) -> anyhow::Result<()> {
    TestUtils::wait_for(
        move || async move {
            matches!(
                store.get_checkpoint(shard_id).await,
                Ok(Some(cp)) if cp.sequence_number.as_str() == expected
            )
        },
        WAIT,
    )
    .await
}

pub async fn wait_for_status(
    handle: &ConsumerHandle,
    shard_id: &str,
    status: ShardStatus,
) -> anyhow::Result<()> {
    TestUtils::wait_for(
        move || async move { handle.status().get(shard_id) == Some(&status) },
        WAIT,
    )
    .await
}
