// tests/common/mod.rs
#![allow(dead_code)]

use anyhow::Result;
use kinesis_shard_consumer::test::mocks::{MockCheckpointStore, MockRecordSink};
use kinesis_shard_consumer::test::{InMemoryStream, TestUtils};
use kinesis_shard_consumer::{CheckpointStore, ConsumerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const STREAM: &str = "orders";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderEvent {
    pub order_id: u32,
    pub customer: String,
    pub amount_cents: u64,
}

impl OrderEvent {
    pub fn new(order_id: u32) -> Self {
        Self {
            order_id,
            customer: format!("customer-{}", order_id % 4),
            amount_cents: u64::from(order_id) * 125,
        }
    }

    pub fn partition_key(&self) -> String {
        self.customer.clone()
    }
}

pub fn create_test_config() -> ConsumerConfig {
    TestUtils::fast_config()
}

pub struct TestContext {
    pub config: ConsumerConfig,
    pub stream: InMemoryStream,
    pub sink: MockRecordSink<OrderEvent>,
    pub store: MockCheckpointStore,
}

impl TestContext {
    pub fn new(shards: &[&str]) -> Self {
        kinesis_shard_consumer::test::init_logging();
        Self {
            config: create_test_config(),
            stream: InMemoryStream::new(STREAM, shards),
            sink: MockRecordSink::new(),
            store: MockCheckpointStore::new(),
        }
    }
}

pub async fn wait_for_delivered(
    sink: &MockRecordSink<OrderEvent>,
    shards: &[&str],
    expected: usize,
    timeout: Duration,
) -> Result<()> {
    TestUtils::wait_for(
        move || async move {
            let mut delivered = 0;
            for shard in shards {
                delivered += sink.delivered_items(shard).await.len();
            }
            delivered >= expected
        },
        timeout,
    )
    .await
}

pub async fn checkpoint_of<S: CheckpointStore>(store: &S, shard_id: &str) -> Option<String> {
    store
        .get_checkpoint(shard_id)
        .await
        .ok()
        .flatten()
        .map(|cp| cp.sequence_number.into_inner())
}
