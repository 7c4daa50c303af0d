pub const EVENTS_RECEIVED: &str = "view_counter_events_received";
pub const EVENTS_MALFORMED: &str = "view_counter_events_malformed";
pub const FETCH_ERRORS: &str = "view_counter_fetch_errors";
pub const BATCH_WRITES: &str = "view_counter_batch_writes";
pub const BATCH_WRITE_FAILURES: &str = "view_counter_batch_write_failures";
pub const BATCH_WRITE_TIME: &str = "view_counter_batch_write_ms";
pub const BATCHES_DROPPED: &str = "view_counter_batches_dropped";
pub const ENTITIES_WRITTEN: &str = "view_counter_entities_written";
pub const VIEWS_WRITTEN: &str = "view_counter_views_written";
pub const OFFSET_COMMITS: &str = "view_counter_offset_commits";
pub const OFFSET_COMMIT_FAILURES: &str = "view_counter_offset_commit_failures";
