use std::sync::Arc;
use std::time::Duration;

use common_batching::Accumulator;
use common_metrics::MetricsSink;
use health::HealthHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decode::ViewDecoder;
use crate::metrics_consts::{EVENTS_MALFORMED, EVENTS_RECEIVED, FETCH_ERRORS};
use crate::source::MessageSource;
use crate::types::ViewBatch;

// Liveness is reported at least this often while waiting on an idle topic,
// unless the last fetch failed
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Pulls messages from the topic, decodes them and feeds the accumulator.
/// Offsets are never touched here, they move only when a batch is stored.
pub struct ConsumerLoop {
    source: Arc<dyn MessageSource>,
    decoder: ViewDecoder,
    accumulator: Arc<Accumulator<ViewBatch>>,
    fetch_backoff: Duration,
    liveness: HealthHandle,
    metrics: Arc<dyn MetricsSink>,
}

impl ConsumerLoop {
    pub fn new(
        source: Arc<dyn MessageSource>,
        decoder: ViewDecoder,
        accumulator: Arc<Accumulator<ViewBatch>>,
        fetch_backoff: Duration,
        liveness: HealthHandle,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            source,
            decoder,
            accumulator,
            fetch_backoff,
            liveness,
            metrics,
        }
    }

    /// Runs until `shutdown` is cancelled or the accumulator stops taking items.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut fetch_failing = false;

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    if !fetch_failing {
                        self.liveness.report_healthy();
                    }
                    continue;
                }
                received = self.source.recv() => received,
            };

            let message = match received {
                Ok(message) => {
                    fetch_failing = false;
                    self.liveness.report_healthy();
                    message
                }
                Err(e) => {
                    fetch_failing = true;
                    warn!(
                        backoff_ms = self.fetch_backoff.as_millis() as u64,
                        "failed to fetch message: {}", e
                    );
                    self.metrics.inc(FETCH_ERRORS, &[], 1);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.fetch_backoff) => continue,
                    }
                }
            };

            self.metrics.inc(EVENTS_RECEIVED, &[], 1);
            let view = match self.decoder.decode(&message) {
                Ok(view) => view,
                Err(e) => {
                    debug!(
                        partition = message.partition,
                        offset = message.offset,
                        "discarding message: {}", e
                    );
                    self.metrics.inc(
                        EVENTS_MALFORMED,
                        &[("reason".to_string(), e.reason().to_string())],
                        1,
                    );
                    continue;
                }
            };

            if let Err(e) = self.accumulator.add(view).await {
                warn!("consumer loop stopping: {}", e);
                break;
            }
        }

        info!("consumer loop exited");
    }
}
