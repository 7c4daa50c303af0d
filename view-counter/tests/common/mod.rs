#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common_circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use common_kafka::{KafkaProduceError, OffsetErr, ReceivedMessage, RecvErr, TopicWriter};
use common_metrics::MetricsSink;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio_util::sync::CancellationToken;
use view_counter::source::{MessageSource, OffsetCommitter};
use view_counter::store::{CounterStore, StoreError};

pub const EVENT_TYPE: &str = "reel.viewed";

pub fn view_message(entity_id: &str, partition: i32, offset: i64) -> ReceivedMessage {
    raw_message(
        Some(EVENT_TYPE),
        &format!(r#"{{"entity_id":"{entity_id}","viewer":"someone"}}"#),
        partition,
        offset,
    )
}

pub fn raw_message(key: Option<&str>, payload: &str, partition: i32, offset: i64) -> ReceivedMessage {
    ReceivedMessage {
        key: key.map(|k| k.as_bytes().to_vec()),
        payload: Some(payload.as_bytes().to_vec()),
        partition,
        offset,
    }
}

pub fn breaker(metrics: Arc<dyn MetricsSink>) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        "storage",
        CircuitBreakerConfig::default(),
        metrics,
    ))
}

/// Counter store keeping every successful write in memory.
#[derive(Default)]
pub struct MemoryStore {
    writes: Mutex<Vec<HashMap<String, i64>>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    down: AtomicBool,
    stalled: AtomicBool,
}

impl MemoryStore {
    pub fn failing(times: usize) -> Self {
        let store = Self::default();
        store.failures_left.store(times, Ordering::SeqCst);
        store
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Writes started while stalled never complete.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<HashMap<String, i64>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn totals(&self) -> HashMap<String, i64> {
        let mut totals = HashMap::new();
        for write in self.writes() {
            for (id, delta) in write {
                *totals.entry(id).or_insert(0) += delta;
            }
        }
        totals
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, deltas: &HashMap<String, i64>) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolClosed));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.writes.lock().unwrap().push(deltas.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCommitter {
    commits: Mutex<Vec<BTreeMap<i32, i64>>>,
    fail: AtomicBool,
}

impl MemoryCommitter {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn commits(&self) -> Vec<BTreeMap<i32, i64>> {
        self.commits.lock().unwrap().clone()
    }
}

impl OffsetCommitter for MemoryCommitter {
    fn commit(&self, offsets: &BTreeMap<i32, i64>) -> Result<(), OffsetErr> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(OffsetErr::Kafka(KafkaError::ConsumerCommit(
                RDKafkaErrorCode::RequestTimedOut,
            )));
        }
        self.commits.lock().unwrap().push(offsets.clone());
        Ok(())
    }
}

pub enum Step {
    Message(ReceivedMessage),
    FetchError,
}

/// Replays a fixed script of fetch results. Once the script runs out it
/// cancels `done`, if set, and then never yields again.
pub struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    done: Option<CancellationToken>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(steps: Vec<Step>, done: Option<CancellationToken>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            done,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for ScriptedSource {
    async fn recv(&self) -> Result<ReceivedMessage, RecvErr> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(Step::Message(message)) => Ok(message),
            Some(Step::FetchError) => Err(RecvErr::Kafka(KafkaError::MessageConsumption(
                RDKafkaErrorCode::BrokerTransportFailure,
            ))),
            None => {
                if let Some(done) = &self.done {
                    done.cancel();
                }
                std::future::pending().await
            }
        }
    }
}

/// Topic writer that loops messages back as consumable records.
#[derive(Default)]
pub struct MemoryTopic {
    messages: Mutex<Vec<ReceivedMessage>>,
}

impl MemoryTopic {
    pub fn messages(&self) -> Vec<ReceivedMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl TopicWriter for MemoryTopic {
    async fn write(&self, key: &str, payload: Vec<u8>) -> Result<(), KafkaProduceError> {
        let mut messages = self.messages.lock().unwrap();
        let offset = messages.len() as i64;
        messages.push(ReceivedMessage {
            key: Some(key.as_bytes().to_vec()),
            payload: Some(payload),
            partition: 0,
            offset,
        });
        Ok(())
    }
}
