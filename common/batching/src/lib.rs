//! Size- and time-triggered batching of items ahead of a bulk write.
//!
//! An `Accumulator` owns a buffer, hands it by value to a `Flusher` once
//! `batch_size` items arrived since the last flush or every `flush_interval`,
//! whichever comes first, and swaps in a fresh buffer so producers keep adding
//! while the flush runs. A batch the flusher hands back waits for the next
//! flush, it does not make the buffer count as full.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common_metrics::{MetricsSink, TimingGuard};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const ACCUMULATOR_FLUSHES: &str = "accumulator_flushes_total";
pub const ACCUMULATOR_RETAINED: &str = "accumulator_retained_batches_total";
pub const ACCUMULATOR_BATCH_SIZE: &str = "accumulator_batch_size";
pub const ACCUMULATOR_FLUSH_TIME: &str = "accumulator_flush_duration_ms";
pub const ACCUMULATOR_BUFFERED: &str = "accumulator_buffered_items";

/// Storage for items between two flushes.
pub trait Buffer: Default + Send + 'static {
    type Item: Send;

    fn push(&mut self, item: Self::Item);

    /// Number of items held, retained ones included.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold `other` into `self`. Used to put a batch whose flush failed back
    /// in front of the items that arrived in the meantime.
    fn merge(&mut self, other: Self);
}

impl<T: Send + 'static> Buffer for Vec<T> {
    type Item = T;

    fn push(&mut self, item: T) {
        Vec::push(self, item)
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn merge(&mut self, other: Self) {
        self.extend(other)
    }
}

/// What the flusher did with a batch.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOutcome<B> {
    /// The batch was durably processed.
    Done,
    /// Processing failed, the batch must be attempted again on the next flush.
    Retry(B),
}

#[async_trait]
pub trait Flusher<B>: Send + Sync + 'static {
    async fn flush(&self, batch: B) -> FlushOutcome<B>;
}

#[derive(Debug, Clone, Copy)]
pub struct AccumulatorConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccumulatorError {
    #[error("accumulator is stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy)]
enum FlushTrigger {
    Size,
    Timer,
    Manual,
    Shutdown,
}

impl FlushTrigger {
    fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

struct State<B> {
    buffer: B,
    // Items added since the last flush took the buffer, compared against
    // `batch_size`
    fresh: usize,
    stopped: bool,
}

struct Inner<B: Buffer> {
    name: String,
    batch_size: usize,
    state: Mutex<State<B>>,
    // Held for the whole flush, so batches reach the flusher one at a time
    flush_lock: tokio::sync::Mutex<()>,
    flusher: Arc<dyn Flusher<B>>,
    metrics: Arc<dyn MetricsSink>,
}

impl<B: Buffer> Inner<B> {
    fn lock_state(&self) -> MutexGuard<'_, State<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn labels(&self, trigger: FlushTrigger) -> [(String, String); 2] {
        [
            ("accumulator".to_string(), self.name.clone()),
            ("trigger".to_string(), trigger.as_str().to_string()),
        ]
    }

    async fn flush(&self, trigger: FlushTrigger) {
        let _flushing = self.flush_lock.lock().await;

        // Whoever gets here first takes the whole buffer, a racing flush sees
        // an empty one and returns.
        let batch = {
            let mut state = self.lock_state();
            if state.buffer.is_empty() {
                return;
            }
            state.fresh = 0;
            std::mem::take(&mut state.buffer)
        };

        let size = batch.len();
        let labels = self.labels(trigger);
        self.metrics.inc(ACCUMULATOR_FLUSHES, &labels, 1);
        self.metrics
            .histogram(ACCUMULATOR_BATCH_SIZE, &labels, size as f64);
        debug!(accumulator = %self.name, trigger = trigger.as_str(), size, "flushing batch");

        let timing = TimingGuard::new(self.metrics.as_ref(), ACCUMULATOR_FLUSH_TIME)
            .label("accumulator", &self.name);
        let outcome = self.flusher.flush(batch).await;
        timing.fin();

        let buffered = {
            let mut state = self.lock_state();
            if let FlushOutcome::Retry(mut retained) = outcome {
                warn!(
                    accumulator = %self.name,
                    size = retained.len(),
                    "flush failed, retaining batch for the next attempt"
                );
                self.metrics.inc(ACCUMULATOR_RETAINED, &labels, 1);
                retained.merge(std::mem::take(&mut state.buffer));
                state.buffer = retained;
            }
            state.buffer.len()
        };
        self.metrics.gauge(
            ACCUMULATOR_BUFFERED,
            &[("accumulator".to_string(), self.name.clone())],
            buffered as f64,
        );
    }
}

/// Buffers items and hands them to a `Flusher` in batches.
///
/// Must be created inside a tokio runtime, the flush timer runs as a spawned task.
pub struct Accumulator<B: Buffer> {
    inner: Arc<Inner<B>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl<B: Buffer> Accumulator<B> {
    pub fn new(
        name: &str,
        config: AccumulatorConfig,
        flusher: Arc<dyn Flusher<B>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let inner = Arc::new(Inner {
            name: name.to_owned(),
            batch_size: config.batch_size.max(1),
            state: Mutex::new(State {
                buffer: B::default(),
                fresh: 0,
                stopped: false,
            }),
            flush_lock: tokio::sync::Mutex::new(()),
            flusher,
            metrics,
        });

        let shutdown = CancellationToken::new();
        let interval = config.flush_interval.max(Duration::from_millis(1));
        let timer = tokio::spawn(flush_on_interval(inner.clone(), interval, shutdown.clone()));

        Self {
            inner,
            timer: Mutex::new(Some(timer)),
            shutdown,
        }
    }

    /// Buffer an item. When this completes a batch of `batch_size` new items,
    /// the buffer is flushed before returning, so a slow flusher slows down the
    /// callers.
    pub async fn add(&self, item: B::Item) -> Result<(), AccumulatorError> {
        let full = {
            let mut state = self.inner.lock_state();
            if state.stopped {
                return Err(AccumulatorError::Stopped);
            }
            state.buffer.push(item);
            state.fresh += 1;
            state.fresh >= self.inner.batch_size
        };

        if full {
            self.inner.flush(FlushTrigger::Size).await;
        }
        Ok(())
    }

    /// Flush whatever is buffered now, a no-op on an empty buffer.
    pub async fn flush(&self) {
        self.inner.flush(FlushTrigger::Manual).await
    }

    /// Number of items currently buffered, including retained ones.
    pub fn len(&self) -> usize {
        self.inner.lock_state().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the timer, wait for it to exit, and flush what is left.
    /// Later calls to `add` fail with `AccumulatorError::Stopped`.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.lock_state();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }

        self.shutdown.cancel();
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                error!(accumulator = %self.inner.name, "flush timer task failed: {e}");
            }
        }

        self.inner.flush(FlushTrigger::Shutdown).await;

        let leftover = self.len();
        if leftover > 0 {
            error!(
                accumulator = %self.inner.name,
                leftover, "final flush failed, dropping buffered items"
            );
        } else {
            info!(accumulator = %self.inner.name, "accumulator drained");
        }
    }
}

impl<B: Buffer> Drop for Accumulator<B> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn flush_on_interval<B: Buffer>(
    inner: Arc<Inner<B>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => inner.flush(FlushTrigger::Timer).await,
        }
    }
    debug!(accumulator = %inner.name, "flush timer exited");
}
