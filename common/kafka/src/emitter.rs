use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use common_metrics::MetricsSink;
use rdkafka::producer::FutureProducer;
use rdkafka::ClientContext;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::kafka_producer::{send_keyed, KafkaProduceError};

pub const EMITTER_PUBLISHED: &str = "event_emitter_published_total";
pub const EMITTER_WRITTEN: &str = "event_emitter_written_total";
pub const EMITTER_DROPPED: &str = "event_emitter_dropped_total";

/// Where the emitter's background task sends each message.
#[async_trait]
pub trait TopicWriter: Send + Sync + 'static {
    async fn write(&self, key: &str, payload: Vec<u8>) -> Result<(), KafkaProduceError>;
}

pub struct KafkaTopicWriter<C: ClientContext + 'static> {
    producer: FutureProducer<C>,
    topic: String,
}

impl<C: ClientContext + 'static> KafkaTopicWriter<C> {
    pub fn new(producer: FutureProducer<C>, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
        }
    }
}

#[async_trait]
impl<C: ClientContext + 'static> TopicWriter for KafkaTopicWriter<C> {
    async fn write(&self, key: &str, payload: Vec<u8>) -> Result<(), KafkaProduceError> {
        send_keyed(&self.producer, &self.topic, key, &payload).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EmitterConfig {
    /// Messages buffered between `publish` and the writer. Publishing into a
    /// full queue drops the message.
    pub capacity: usize,
    /// Topic writes allowed in flight at once.
    pub max_in_flight: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_in_flight: 64,
        }
    }
}

struct Envelope {
    key: String,
    payload: Vec<u8>,
}

/// Fire-and-forget publisher. `publish` never blocks and never fails; every
/// message that can't be queued or written is dropped and counted.
pub struct EventEmitter {
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<dyn MetricsSink>,
}

impl EventEmitter {
    /// Spawns the draining task, so this must be called inside a tokio runtime.
    pub fn new(
        writer: Arc<dyn TopicWriter>,
        config: EmitterConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let worker = tokio::spawn(drain(
            receiver,
            writer,
            config.max_in_flight.max(1),
            metrics.clone(),
        ));

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            metrics,
        }
    }

    pub fn publish<T: Serialize + ?Sized>(&self, event_type: &str, payload: &T) {
        let payload = match serde_json::to_vec(payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_type, "failed to serialize event: {}", e);
                self.dropped(event_type, "serialization");
                return;
            }
        };

        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            self.dropped(event_type, "closed");
            return;
        };

        let envelope = Envelope {
            key: event_type.to_owned(),
            payload,
        };
        match sender.try_send(envelope) {
            Ok(()) => self.metrics.inc(
                EMITTER_PUBLISHED,
                &[("event_type".to_string(), event_type.to_string())],
                1,
            ),
            Err(TrySendError::Full(_)) => {
                debug!(event_type, "emitter queue full, dropping event");
                self.dropped(event_type, "queue_full");
            }
            Err(TrySendError::Closed(_)) => self.dropped(event_type, "closed"),
        }
    }

    /// Stop accepting events and wait for everything already queued to be
    /// written or dropped.
    pub async fn shutdown(&self) {
        lock(&self.sender).take();
        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("emitter worker exited abnormally: {}", e);
            }
        }
    }

    fn dropped(&self, event_type: &str, reason: &'static str) {
        self.metrics.inc(
            EMITTER_DROPPED,
            &[
                ("event_type".to_string(), event_type.to_string()),
                ("reason".to_string(), reason.to_string()),
            ],
            1,
        );
    }
}

impl Drop for EventEmitter {
    fn drop(&mut self) {
        lock(&self.sender).take();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn drain(
    mut receiver: mpsc::Receiver<Envelope>,
    writer: Arc<dyn TopicWriter>,
    max_in_flight: usize,
    metrics: Arc<dyn MetricsSink>,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight));

    while let Some(envelope) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let writer = writer.clone();
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let labels = [("event_type".to_string(), envelope.key.clone())];
            match writer.write(&envelope.key, envelope.payload).await {
                Ok(()) => metrics.inc(EMITTER_WRITTEN, &labels, 1),
                Err(e) => {
                    warn!(event_type = %envelope.key, "failed to write event: {}", e);
                    metrics.inc(
                        EMITTER_DROPPED,
                        &[
                            labels[0].clone(),
                            ("reason".to_string(), "write_failed".to_string()),
                        ],
                        1,
                    );
                }
            }
            drop(permit);
        });
    }

    // Every permit back means every spawned write has finished
    let limit = u32::try_from(max_in_flight).unwrap_or(u32::MAX);
    match permits.acquire_many(limit).await {
        Ok(all) => drop(all),
        Err(e) => warn!("emitter could not wait for in-flight writes: {}", e),
    }
    info!("event emitter drained");
}
