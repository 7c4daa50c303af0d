use std::sync::Arc;

use async_trait::async_trait;
use common_batching::{FlushOutcome, Flusher};
use common_circuit_breaker::{BreakerError, CircuitBreaker};
use common_metrics::{MetricsSink, TimingGuard};
use tracing::{error, info, warn};

use crate::metrics_consts::{
    BATCHES_DROPPED, BATCH_WRITES, BATCH_WRITE_FAILURES, BATCH_WRITE_TIME, ENTITIES_WRITTEN,
    OFFSET_COMMITS, OFFSET_COMMIT_FAILURES, VIEWS_WRITTEN,
};
use crate::source::OffsetCommitter;
use crate::store::CounterStore;
use crate::types::ViewBatch;

/// Writes each batch with a single increment and commits its offsets only
/// after the write succeeded. Failed batches go back to the accumulator,
/// unless they grew past `max_retained_entities`.
pub struct FlushCoordinator {
    store: Arc<dyn CounterStore>,
    committer: Arc<dyn OffsetCommitter>,
    breaker: Arc<CircuitBreaker>,
    max_retained_entities: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl FlushCoordinator {
    pub fn new(
        store: Arc<dyn CounterStore>,
        committer: Arc<dyn OffsetCommitter>,
        breaker: Arc<CircuitBreaker>,
        max_retained_entities: usize,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            store,
            committer,
            breaker,
            max_retained_entities,
            metrics,
        }
    }

    fn commit(&self, batch: &ViewBatch) {
        match self.committer.commit(batch.offsets()) {
            Ok(()) => {
                self.metrics.inc(OFFSET_COMMITS, &[], 1);
            }
            Err(e) => {
                // The next stored batch commits a watermark at least as high
                warn!(
                    partitions = batch.offsets().len(),
                    "failed to commit offsets after a successful write: {}", e
                );
                self.metrics.inc(OFFSET_COMMIT_FAILURES, &[], 1);
            }
        }
    }
}

#[async_trait]
impl Flusher<ViewBatch> for FlushCoordinator {
    async fn flush(&self, batch: ViewBatch) -> FlushOutcome<ViewBatch> {
        let timing = TimingGuard::new(self.metrics.as_ref(), BATCH_WRITE_TIME);
        let result = self
            .breaker
            .call(|| self.store.increment(batch.deltas()))
            .await;

        let cause = match result {
            Ok(()) => {
                timing.label("outcome", "success").fin();
                self.metrics.inc(BATCH_WRITES, &[], 1);
                self.metrics
                    .inc(ENTITIES_WRITTEN, &[], batch.entities() as u64);
                self.metrics.inc(VIEWS_WRITTEN, &[], batch.events() as u64);
                self.commit(&batch);
                return FlushOutcome::Done;
            }
            Err(e) => {
                timing.label("outcome", "failure").fin();
                let reason = if e.is_rejected() { "breaker" } else { "store" };
                self.metrics.inc(
                    BATCH_WRITE_FAILURES,
                    &[("reason".to_string(), reason.to_string())],
                    1,
                );
                e
            }
        };

        if batch.entities() > self.max_retained_entities {
            error!(
                batch_size = batch.events(),
                entities = batch.entities(),
                limit = self.max_retained_entities,
                "failed to store views and batch is too large to retain, dropping it: {}",
                cause
            );
            self.metrics.inc(BATCHES_DROPPED, &[], 1);
            return FlushOutcome::Done;
        }

        match cause {
            BreakerError::Open(_) | BreakerError::TooManyRequests(_) => info!(
                batch_size = batch.events(),
                entities = batch.entities(),
                "storage circuit open, retaining batch: {}",
                cause
            ),
            _ => error!(
                batch_size = batch.events(),
                entities = batch.entities(),
                "failed to store views, retaining batch: {}",
                cause
            ),
        }
        FlushOutcome::Retry(batch)
    }
}
