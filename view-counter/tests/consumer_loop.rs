mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    breaker, raw_message, view_message, MemoryCommitter, MemoryStore, ScriptedSource, Step,
    EVENT_TYPE,
};
use common_batching::{Accumulator, AccumulatorConfig};
use common_metrics::{NoopSink, RecordingSink};
use health::HealthRegistry;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use view_counter::consumer::ConsumerLoop;
use view_counter::coordinator::FlushCoordinator;
use view_counter::decode::ViewDecoder;
use view_counter::metrics_consts::{EVENTS_MALFORMED, EVENTS_RECEIVED, FETCH_ERRORS};
use view_counter::types::ViewBatch;

const BACKOFF: Duration = Duration::from_secs(1);

struct Harness {
    source: Arc<ScriptedSource>,
    accumulator: Arc<Accumulator<ViewBatch>>,
    committer: Arc<MemoryCommitter>,
    registry: HealthRegistry,
    sink: Arc<RecordingSink>,
    consumer: ConsumerLoop,
}

fn harness(steps: Vec<Step>, done: Option<CancellationToken>) -> Harness {
    let source = Arc::new(ScriptedSource::new(steps, done));
    let committer = Arc::new(MemoryCommitter::default());
    let coordinator = Arc::new(FlushCoordinator::new(
        Arc::new(MemoryStore::default()),
        committer.clone(),
        breaker(Arc::new(NoopSink)),
        1000,
        Arc::new(NoopSink),
    ));
    let accumulator = Arc::new(Accumulator::<ViewBatch>::new(
        "test",
        AccumulatorConfig {
            batch_size: 100,
            flush_interval: Duration::from_secs(3600),
        },
        coordinator,
        Arc::new(NoopSink),
    ));
    let registry = HealthRegistry::new("liveness");
    let sink = Arc::new(RecordingSink::new());
    let consumer = ConsumerLoop::new(
        source.clone(),
        ViewDecoder::new(EVENT_TYPE, "entity_id", "occurred_at"),
        accumulator.clone(),
        BACKOFF,
        registry.register("consumer".to_string(), time::Duration::seconds(30)),
        sink.clone(),
    );

    Harness {
        source,
        accumulator,
        committer,
        registry,
        sink,
        consumer,
    }
}

#[tokio::test(start_paused = true)]
async fn fetch_errors_back_off_and_retry() {
    let shutdown = CancellationToken::new();
    let h = harness(
        vec![
            Step::FetchError,
            Step::FetchError,
            Step::Message(view_message("a", 0, 0)),
        ],
        Some(shutdown.clone()),
    );

    let start = Instant::now();
    h.consumer.run(shutdown).await;

    assert!(start.elapsed() >= BACKOFF * 2);
    assert_eq!(h.sink.counter(FETCH_ERRORS), 2);
    assert_eq!(h.accumulator.len(), 1);
    assert!(h.registry.get_status().healthy);
}

#[tokio::test(start_paused = true)]
async fn failing_fetches_do_not_report_liveness() {
    let shutdown = CancellationToken::new();
    let h = harness(
        (0..12).map(|_| Step::FetchError).collect(),
        Some(shutdown.clone()),
    );

    let start = Instant::now();
    h.consumer.run(shutdown).await;

    // Heartbeats came due while fetches kept failing
    assert!(start.elapsed() >= BACKOFF * 12);
    assert_eq!(h.sink.counter(FETCH_ERRORS), 12);
    assert!(!h.registry.get_status().healthy);
}

#[tokio::test]
async fn malformed_messages_are_skipped_without_committing() {
    let shutdown = CancellationToken::new();
    let h = harness(
        vec![
            Step::Message(raw_message(Some("reel.liked"), r#"{"entity_id":"a"}"#, 0, 0)),
            Step::Message(raw_message(Some(EVENT_TYPE), "{oops", 0, 1)),
            Step::Message(raw_message(None, r#"{"entity_id":"a"}"#, 0, 2)),
            Step::Message(view_message("a", 0, 3)),
        ],
        Some(shutdown.clone()),
    );

    h.consumer.run(shutdown).await;

    assert_eq!(h.sink.counter(EVENTS_RECEIVED), 4);
    assert_eq!(h.sink.counter(EVENTS_MALFORMED), 3);
    assert_eq!(h.accumulator.len(), 1);
    assert!(h.committer.commits().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_the_backoff() {
    let shutdown = CancellationToken::new();
    let h = Arc::new(harness(vec![Step::FetchError], None));

    let start = Instant::now();
    let running = tokio::spawn({
        let h = h.clone();
        let shutdown = shutdown.clone();
        async move { h.consumer.run(shutdown).await }
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    shutdown.cancel();
    running.await.unwrap();

    assert!(start.elapsed() < BACKOFF);
    assert_eq!(h.source.calls(), 1);
}

#[tokio::test]
async fn stops_when_the_accumulator_is_stopped() {
    let h = harness(
        vec![
            Step::Message(view_message("a", 0, 0)),
            Step::Message(view_message("b", 0, 1)),
        ],
        None,
    );
    h.accumulator.stop().await;

    h.consumer.run(CancellationToken::new()).await;

    assert_eq!(h.source.calls(), 1);
    assert!(h.accumulator.is_empty());
}
