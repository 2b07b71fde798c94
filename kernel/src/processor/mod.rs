// Notification Processing Loop
//
// Fetches notifications after the checkpoint, builds cache events,
// applies them under per-table locks, and advances the checkpoint once
// per notification.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::SyncConfig;
use crate::decode::PayloadDecoder;
use crate::event::{CacheEvent, EventId, RawEvent, TableName};
use crate::factory::{BuildErrorKind, EventFactory};
use crate::mutator::{ApplyOutcome, CacheMutator, TransientFailure};
use crate::observability::event_span;
use crate::source::{NotificationSource, SourceError};

mod locks;

pub use locks::{TableLockGuard, TableLocks};

/// Errors that abort a batch. Per-event failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("notification source error: {0}")]
    Source(#[from] SourceError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("out-of-order notification: expected id after {after:?}, got {actual}")]
    OutOfOrder {
        after: Option<EventId>,
        actual: EventId,
    },
}

/// Cooperative cancellation shared with the processing loop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counters for one or more processed batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Notifications whose handling is complete (applied or skipped).
    pub events_processed: u64,
    pub cache_events_applied: u64,
    pub cache_events_noop: u64,
    /// Notifications that produced no cache events.
    pub events_ignored: u64,
    pub retries: u64,
    pub skipped_decode: u64,
    pub skipped_unsupported: u64,
    pub skipped_retries_exhausted: u64,
    pub checkpoint: Option<EventId>,
    pub cancelled: bool,
}

impl SyncReport {
    pub fn skipped(&self) -> u64 {
        self.skipped_decode + self.skipped_unsupported + self.skipped_retries_exhausted
    }

    fn merge(&mut self, other: SyncReport) {
        self.events_processed += other.events_processed;
        self.cache_events_applied += other.cache_events_applied;
        self.cache_events_noop += other.cache_events_noop;
        self.events_ignored += other.events_ignored;
        self.retries += other.retries;
        self.skipped_decode += other.skipped_decode;
        self.skipped_unsupported += other.skipped_unsupported;
        self.skipped_retries_exhausted += other.skipped_retries_exhausted;
        if other.checkpoint.is_some() {
            self.checkpoint = other.checkpoint;
        }
        self.cancelled |= other.cancelled;
    }
}

enum EventOutcome {
    /// Every derived cache event was applied.
    Applied,
    /// Permanently skipped; the checkpoint may move past it.
    Skipped,
    /// Interrupted; the checkpoint must stay put.
    Cancelled,
}

/// Drives notifications from a source into a metadata cache.
pub struct EventProcessor<S, D, M, C> {
    source: S,
    factory: EventFactory<D>,
    mutator: Arc<M>,
    checkpoint: C,
    locks: Arc<TableLocks>,
    config: SyncConfig,
    cancel: CancellationToken,
}

impl<S, D, M, C> EventProcessor<S, D, M, C>
where
    S: NotificationSource,
    D: PayloadDecoder,
    M: CacheMutator,
    C: CheckpointStore,
{
    pub fn new(
        source: S,
        factory: EventFactory<D>,
        mutator: Arc<M>,
        checkpoint: C,
        config: SyncConfig,
    ) -> Self {
        Self {
            source,
            factory,
            mutator,
            checkpoint,
            locks: Arc::new(TableLocks::new()),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Share table locks with other writers of the same cache.
    pub fn with_locks(mut self, locks: Arc<TableLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn checkpoint(&self) -> Result<Option<EventId>, CheckpointError> {
        self.checkpoint.load()
    }

    /// Process batches until the source has nothing new or the loop is
    /// cancelled.
    pub fn run_until_caught_up(&mut self) -> Result<SyncReport, ProcessorError> {
        let mut total = SyncReport {
            checkpoint: self.checkpoint.load()?,
            ..Default::default()
        };

        loop {
            let report = self.process_batch()?;
            let done = report.events_processed == 0 || report.cancelled;
            total.merge(report);
            if done {
                return Ok(total);
            }
        }
    }

    /// Fetch and process one batch of notifications after the checkpoint.
    pub fn process_batch(&mut self) -> Result<SyncReport, ProcessorError> {
        let last = self.checkpoint.load()?;
        let mut report = SyncReport {
            checkpoint: last,
            ..Default::default()
        };

        let batch = self.source.fetch_after(last, self.config.batch_size)?;
        if batch.is_empty() {
            debug!(checkpoint = ?last, "no new metastore notifications");
            return Ok(report);
        }
        validate_batch(last, &batch)?;

        info!(
            first = batch[0].id,
            count = batch.len(),
            "processing metastore notifications"
        );

        for raw in &batch {
            if self.cancel.is_cancelled() {
                info!(next_event = raw.id, "processing cancelled");
                report.cancelled = true;
                break;
            }

            let span = event_span(raw);
            let _enter = span.enter();

            match self.process_event(raw, &mut report) {
                EventOutcome::Applied | EventOutcome::Skipped => {
                    self.checkpoint.commit(raw.id)?;
                    report.checkpoint = Some(raw.id);
                    report.events_processed += 1;
                }
                EventOutcome::Cancelled => {
                    info!("processing cancelled mid-event, checkpoint unchanged");
                    report.cancelled = true;
                    break;
                }
            }
        }

        Ok(report)
    }

    fn process_event(&self, raw: &RawEvent, report: &mut SyncReport) -> EventOutcome {
        let events = match self.factory.build(raw) {
            Ok(events) => events,
            Err(err) => {
                match err.kind() {
                    BuildErrorKind::Decode => report.skipped_decode += 1,
                    BuildErrorKind::UnsupportedEventType => report.skipped_unsupported += 1,
                }
                warn!(error = %err, "skipping metastore notification");
                return EventOutcome::Skipped;
            }
        };

        if events.is_empty() {
            debug!("notification has no cache effect");
            report.events_ignored += 1;
            return EventOutcome::Applied;
        }

        let tables: BTreeSet<&TableName> = events.iter().map(CacheEvent::table).collect();
        let mut attempt = 0;

        loop {
            let result = {
                let _guard = self.locks.acquire(tables.iter().copied());
                apply_all(&events, self.mutator.as_ref())
            };

            match result {
                Ok((applied, noop)) => {
                    debug!(applied, noop, "applied cache events");
                    report.cache_events_applied += applied;
                    report.cache_events_noop += noop;
                    return EventOutcome::Applied;
                }
                Err(failure) => {
                    if !self.config.retry.should_retry(attempt) {
                        error!(
                            error = %failure,
                            attempts = attempt + 1,
                            "giving up on metastore notification"
                        );
                        report.skipped_retries_exhausted += 1;
                        return EventOutcome::Skipped;
                    }

                    let delay = self.config.retry.delay_for_attempt(attempt);
                    warn!(
                        error = %failure,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient cache failure, retrying notification"
                    );
                    attempt += 1;
                    report.retries += 1;

                    if self.cancel.is_cancelled() {
                        return EventOutcome::Cancelled;
                    }
                    thread::sleep(delay);
                    if self.cancel.is_cancelled() {
                        return EventOutcome::Cancelled;
                    }
                }
            }
        }
    }
}

/// Apply events in order, stopping at the first transient failure.
fn apply_all(
    events: &[CacheEvent],
    mutator: &dyn CacheMutator,
) -> Result<(u64, u64), TransientFailure> {
    let (mut applied, mut noop) = (0, 0);
    for event in events {
        match event.apply(mutator)? {
            ApplyOutcome::Applied => applied += 1,
            ApplyOutcome::NoOp => noop += 1,
        }
    }
    Ok((applied, noop))
}

/// A batch must start after the checkpoint and be strictly contiguous.
fn validate_batch(after: Option<EventId>, batch: &[RawEvent]) -> Result<(), ProcessorError> {
    let mut previous = after;
    for (index, event) in batch.iter().enumerate() {
        let in_order = match previous {
            None => true,
            Some(prev) if index == 0 => event.id > prev,
            Some(prev) => prev.checked_add(1) == Some(event.id),
        };
        if !in_order {
            return Err(ProcessorError::OutOfOrder {
                after: previous,
                actual: event.id,
            });
        }
        previous = Some(event.id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::config::RetryPolicy;
    use crate::decode::JsonPayloadDecoder;
    use crate::event::{CacheKey, PartitionKey, PartitionMetadata, TableSchema};
    use crate::mutator::{InMemoryMetadataCache, MutationResult};
    use crate::source::NotificationLog;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;

    type Processor<M> =
        EventProcessor<NotificationLog, JsonPayloadDecoder, M, InMemoryCheckpointStore>;

    fn raw(id: EventId, type_tag: &str, payload: Value) -> RawEvent {
        RawEvent {
            id,
            type_tag: type_tag.into(),
            db_name: "d".into(),
            tbl_name: "t".into(),
            payload,
        }
    }

    fn create_table(id: EventId) -> RawEvent {
        raw(
            id,
            "CREATE_TABLE",
            json!({ "tableObj": { "partitionKeys": [{ "name": "dt" }] } }),
        )
    }

    fn add_partitions(id: EventId, values: &[&str]) -> RawEvent {
        let partitions: Vec<Value> = values.iter().map(|v| json!({ "values": [v] })).collect();
        raw(
            id,
            "ADD_PARTITION",
            json!({
                "tableObj": { "partitionKeys": [{ "name": "dt" }] },
                "partitions": partitions
            }),
        )
    }

    fn log_of(events: Vec<RawEvent>) -> NotificationLog {
        let mut log = NotificationLog::new();
        for event in events {
            log.append(event).unwrap();
        }
        log
    }

    fn config(max_retries: u32) -> SyncConfig {
        SyncConfig {
            batch_size: 100,
            retry: RetryPolicy::immediate(max_retries),
        }
    }

    fn processor<M: CacheMutator>(
        events: Vec<RawEvent>,
        mutator: Arc<M>,
        max_retries: u32,
    ) -> Processor<M> {
        EventProcessor::new(
            log_of(events),
            EventFactory::json(),
            mutator,
            InMemoryCheckpointStore::default(),
            config(max_retries),
        )
    }

    /// Fails the first `failures` add_partition calls, then delegates.
    struct Flaky {
        inner: InMemoryMetadataCache,
        failures: AtomicU32,
        add_calls: Mutex<Vec<String>>,
        cancel_on_failure: Option<CancellationToken>,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryMetadataCache::new(),
                failures: AtomicU32::new(failures),
                add_calls: Mutex::new(Vec::new()),
                cancel_on_failure: None,
            }
        }

        fn cancelling(failures: u32, cancel: CancellationToken) -> Self {
            Self {
                cancel_on_failure: Some(cancel),
                ..Self::new(failures)
            }
        }
    }

    impl CacheMutator for Flaky {
        fn register_table(&self, table: &TableName, schema: &TableSchema) -> MutationResult {
            self.inner.register_table(table, schema)
        }

        fn refresh_table_schema(&self, table: &TableName, schema: &TableSchema) -> MutationResult {
            self.inner.refresh_table_schema(table, schema)
        }

        fn invalidate_table(&self, table: &TableName) -> MutationResult {
            self.inner.invalidate_table(table)
        }

        fn add_partition(&self, key: &PartitionKey) -> MutationResult {
            self.add_calls.lock().push(key.to_string());
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                if let Some(cancel) = &self.cancel_on_failure {
                    cancel.cancel();
                }
                return Err(TransientFailure::new(
                    CacheKey::from(key.clone()),
                    "concurrent refresh",
                ));
            }
            self.inner.add_partition(key)
        }

        fn invalidate_partition(&self, key: &PartitionKey) -> MutationResult {
            self.inner.invalidate_partition(key)
        }

        fn refresh_partition(
            &self,
            key: &PartitionKey,
            metadata: &PartitionMetadata,
        ) -> MutationResult {
            self.inner.refresh_partition(key, metadata)
        }

        fn invalidate_files(&self, key: &CacheKey) -> MutationResult {
            self.inner.invalidate_files(key)
        }
    }

    #[test]
    fn applies_batch_and_advances_checkpoint() {
        let cache = Arc::new(InMemoryMetadataCache::new());
        let mut processor = processor(
            vec![create_table(1), add_partitions(2, &["2024-01-01", "2024-01-02"])],
            Arc::clone(&cache),
            0,
        );

        let report = processor.process_batch().unwrap();

        assert_eq!(report.events_processed, 2);
        assert_eq!(report.cache_events_applied, 3);
        assert_eq!(report.checkpoint, Some(2));
        assert_eq!(processor.checkpoint().unwrap(), Some(2));
        assert_eq!(
            cache.table(&TableName::new("d", "t")).unwrap().partitions.len(),
            2
        );
    }

    #[test]
    fn permanent_failures_are_skipped() {
        let cache = Arc::new(InMemoryMetadataCache::new());
        let mut processor = processor(
            vec![
                create_table(1),
                raw(2, "ADD_PARTITION", json!({ "partitions": [] })),
                raw(3, "CREATE_STORED_PROCEDURE", json!({})),
                add_partitions(4, &["2024-01-01"]),
            ],
            Arc::clone(&cache),
            0,
        );

        let report = processor.process_batch().unwrap();

        assert_eq!(report.skipped_decode, 1);
        assert_eq!(report.skipped_unsupported, 1);
        assert_eq!(report.events_processed, 4);
        assert_eq!(report.checkpoint, Some(4));
        assert_eq!(
            cache.table(&TableName::new("d", "t")).unwrap().partitions.len(),
            1
        );
    }

    #[test]
    fn transient_failure_retries_whole_batch() {
        let cache = Arc::new(Flaky::new(1));
        let mut processor = processor(
            vec![create_table(1), add_partitions(2, &["a", "b"])],
            Arc::clone(&cache),
            3,
        );

        let report = processor.process_batch().unwrap();

        assert_eq!(report.retries, 1);
        assert_eq!(report.skipped(), 0);
        assert_eq!(report.checkpoint, Some(2));
        // First pass failed on `a`; the retry re-applied the whole batch.
        assert_eq!(*cache.add_calls.lock(), vec!["d.t/dt=a", "d.t/dt=a", "d.t/dt=b"]);
        assert_eq!(
            cache.inner.table(&TableName::new("d", "t")).unwrap().partitions.len(),
            2
        );
    }

    #[test]
    fn exhausted_retries_become_a_skip() {
        let cache = Arc::new(Flaky::new(10));
        let mut processor = processor(
            vec![create_table(1), add_partitions(2, &["a"])],
            Arc::clone(&cache),
            2,
        );

        let report = processor.process_batch().unwrap();

        assert_eq!(report.retries, 2);
        assert_eq!(report.skipped_retries_exhausted, 1);
        assert_eq!(report.checkpoint, Some(2));
        assert_eq!(cache.add_calls.lock().len(), 3);
    }

    #[test]
    fn resumes_after_checkpoint() {
        let cache = Arc::new(InMemoryMetadataCache::new());
        let mut processor = EventProcessor::new(
            log_of(vec![
                create_table(1),
                raw(2, "DROP_TABLE", json!({})),
                create_table(3),
            ]),
            EventFactory::json(),
            Arc::clone(&cache),
            InMemoryCheckpointStore::new(Some(2)),
            config(0),
        );

        let report = processor.run_until_caught_up().unwrap();

        assert_eq!(report.events_processed, 1);
        assert_eq!(report.checkpoint, Some(3));
        assert!(cache.contains_table(&TableName::new("d", "t")));
    }

    #[test]
    fn run_until_caught_up_drains_in_batches() {
        let cache = Arc::new(InMemoryMetadataCache::new());
        let mut events = vec![create_table(1)];
        for id in 2..=7 {
            let value = format!("p{id}");
            events.push(add_partitions(id, &[value.as_str()]));
        }
        let mut processor = EventProcessor::new(
            log_of(events),
            EventFactory::json(),
            Arc::clone(&cache),
            InMemoryCheckpointStore::default(),
            SyncConfig {
                batch_size: 3,
                retry: RetryPolicy::immediate(0),
            },
        );

        let report = processor.run_until_caught_up().unwrap();

        assert_eq!(report.events_processed, 7);
        assert_eq!(report.checkpoint, Some(7));
        assert_eq!(
            cache.table(&TableName::new("d", "t")).unwrap().partitions.len(),
            6
        );
    }

    #[test]
    fn cancellation_leaves_checkpoint_in_place() {
        let cache = Arc::new(InMemoryMetadataCache::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut processor = processor(vec![create_table(1)], Arc::clone(&cache), 0)
            .with_cancellation(cancel);

        let report = processor.process_batch().unwrap();

        assert!(report.cancelled);
        assert_eq!(report.events_processed, 0);
        assert_eq!(processor.checkpoint().unwrap(), None);
        assert!(!cache.contains_table(&TableName::new("d", "t")));
    }

    #[test]
    fn cancellation_between_retries_keeps_applied_prefix() {
        let cancel = CancellationToken::new();
        let cache = Arc::new(Flaky::cancelling(1, cancel.clone()));
        let mut processor = processor(
            vec![create_table(1), add_partitions(2, &["a"]), create_table(3)],
            Arc::clone(&cache),
            3,
        )
        .with_cancellation(cancel);

        let report = processor.process_batch().unwrap();

        assert!(report.cancelled);
        assert_eq!(report.retries, 1);
        assert_eq!(report.events_processed, 1);
        assert_eq!(report.checkpoint, Some(1));
        assert_eq!(processor.checkpoint().unwrap(), Some(1));
        // The failed notification was not retried after the cancel.
        assert_eq!(*cache.add_calls.lock(), vec!["d.t/dt=a"]);

        let entry = cache.inner.table(&TableName::new("d", "t")).unwrap();
        assert!(entry.partitions.is_empty());
    }

    struct Unordered(Vec<RawEvent>);

    impl NotificationSource for Unordered {
        fn fetch_after(
            &self,
            _after: Option<EventId>,
            _max: usize,
        ) -> Result<Vec<RawEvent>, SourceError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn out_of_order_batch_is_rejected() {
        let mut processor = EventProcessor::new(
            Unordered(vec![create_table(5), create_table(7)]),
            EventFactory::json(),
            Arc::new(InMemoryMetadataCache::new()),
            InMemoryCheckpointStore::new(Some(4)),
            config(0),
        );

        let err = processor.process_batch().unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::OutOfOrder {
                after: Some(5),
                actual: 7
            }
        ));
        assert_eq!(processor.checkpoint().unwrap(), Some(4));
    }

    #[test]
    fn batch_behind_checkpoint_is_rejected() {
        assert!(validate_batch(Some(10), &[create_table(10)]).is_err());
        assert!(validate_batch(Some(10), &[create_table(12), create_table(13)]).is_ok());
        assert!(validate_batch(None, &[create_table(3), create_table(4)]).is_ok());
    }

    #[test]
    fn batch_past_the_largest_id_is_rejected() {
        let batch = [create_table(EventId::MAX), create_table(EventId::MAX)];

        let err = validate_batch(None, &batch).unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::OutOfOrder {
                after: Some(EventId::MAX),
                actual: EventId::MAX
            }
        ));
        assert!(validate_batch(Some(EventId::MAX - 1), &batch[..1]).is_ok());
    }

    #[test]
    fn held_table_lock_blocks_apply() {
        let cache = Arc::new(InMemoryMetadataCache::new());
        let locks = Arc::new(TableLocks::new());
        let table = TableName::new("d", "t");

        let mut processor = processor(vec![create_table(1)], Arc::clone(&cache), 0)
            .with_locks(Arc::clone(&locks));

        let guard = locks.acquire([&table]);
        let handle = std::thread::spawn(move || processor.process_batch().unwrap());

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!cache.contains_table(&table));

        drop(guard);
        let report = handle.join().unwrap();
        assert_eq!(report.checkpoint, Some(1));
        assert!(cache.contains_table(&table));
    }
}
