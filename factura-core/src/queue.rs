//! Retry/offline queue with bounded exponential backoff.
//!
//! Entries move `pending → syncing → synced`, falling back to `pending` on a failed
//! attempt until the retry ceiling is reached, after which they park in `failed` until
//! an operator resets them. A failure the handler reports as non-retryable parks the
//! entry in `failed` straight away. The `syncing` state doubles as the per-entry lock: only the
//! attempt that moved an entry into it may move it out.
pub mod store;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use store::{
    EntryState, InMemoryQueueStore, QueueEntry, QueueOperation, QueuePriority, QueueStore,
};

use crate::{clock::Clock, config::QueueConfig, ErrorKind};

/// Backoff exponent ceiling; delays stop growing at 16 minutes.
const MAX_BACKOFF_EXPONENT: u32 = 4;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue entry {0} not found")]
    NotFound(u64),
    #[error("Queue entry {0} exceeded the retry limit; reset it first")]
    RetriesExhausted(u64),
    #[error("Queue entry {0} is already synced")]
    AlreadySynced(u64),
    #[error("Queue entry {0} is currently syncing")]
    AlreadySyncing(u64),
    #[error("Queue entry {0} is not failed")]
    NotFailed(u64),
    #[error("Queue storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Storage(_) => ErrorKind::Storage,
            _ => ErrorKind::Caller,
        }
    }
}

/// `last_attempt + 2^min(retry_count, 4)` minutes.
pub fn next_retry_at(last_attempt: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
    last_attempt + chrono::Duration::minutes(1_i64 << retry_count.min(MAX_BACKOFF_EXPONENT))
}

/// Work the queue drives on behalf of an entry.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    /// Connectivity precondition checked before every attempt.
    async fn is_online(&self) -> bool;

    /// Resume the entry's operation.
    ///
    /// Errors count as a failed attempt. Errors that are not
    /// [retryable](crate::Error::is_retryable) stop automatic retries for the entry.
    async fn sync(&self, entry: &QueueEntry) -> Result<(), crate::Error>;

    /// Re-poll up to `limit` documents awaiting a verdict. Returns how many were polled.
    async fn poll_submitted(&self, _limit: usize) -> Result<usize, crate::Error> {
        Ok(0)
    }
}

/// What a single attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Synced,
    Failed {
        retry_count: u32,
        exhausted: bool,
        /// False when the handler reported a terminal error.
        retryable: bool,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Selected entries another worker claimed first.
    pub skipped: usize,
    pub polled: usize,
    pub purged: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub syncing: usize,
    pub synced: usize,
    pub failed: usize,
    /// Entries not yet synced.
    pub total: usize,
    pub oldest_pending_age: Option<chrono::Duration>,
}

/// Enqueue request for a failed lifecycle step.
#[derive(Debug, Clone)]
pub struct Enqueue {
    pub document_id: u64,
    pub operation: QueueOperation,
    pub priority: QueuePriority,
    pub signed_body: Option<String>,
    pub error: Option<String>,
}

pub struct OfflineQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue a document, or refresh its live entry if it already has one.
    pub async fn enqueue(&self, request: Enqueue) -> Result<QueueEntry, QueueError> {
        if let Some(mut live) = self.store.find_live(request.document_id).await? {
            live.operation = request.operation;
            live.priority = live.priority.max(request.priority);
            if request.signed_body.is_some() {
                live.signed_body = request.signed_body;
            }
            if request.error.is_some() {
                live.last_error = request.error;
            }
            self.store.update(&live).await?;
            debug!(entry = live.id, document = live.document_id, "refreshed live queue entry");
            return Ok(live);
        }

        let mut entry = QueueEntry::new(
            request.document_id,
            request.operation,
            request.priority,
            self.clock.now(),
        );
        entry.signed_body = request.signed_body;
        entry.last_error = request.error;
        let entry = self.store.insert(entry).await?;
        info!(
            entry = entry.id,
            document = entry.document_id,
            operation = ?entry.operation,
            "queued document for retry"
        );
        Ok(entry)
    }

    pub async fn get(&self, id: u64) -> Result<QueueEntry, QueueError> {
        self.store.get(id).await?.ok_or(QueueError::NotFound(id))
    }

    /// Run one attempt for an entry.
    ///
    /// Synced, syncing and exhausted entries are refused before the handler is called.
    /// An entry parked in `failed` by a terminal error may still be attempted by hand.
    pub async fn attempt(
        &self,
        id: u64,
        handler: &dyn SyncHandler,
    ) -> Result<AttemptOutcome, QueueError> {
        let current = self.get(id).await?;
        match current.state {
            EntryState::Synced => return Err(QueueError::AlreadySynced(id)),
            EntryState::Syncing => return Err(QueueError::AlreadySyncing(id)),
            EntryState::Failed if current.retry_count >= self.config.max_retries => {
                return Err(QueueError::RetriesExhausted(id))
            }
            EntryState::Pending | EntryState::Failed => {}
        }
        let mut entry = self
            .store
            .begin_sync(id, current.state)
            .await?
            .ok_or(QueueError::AlreadySyncing(id))?;

        let now = self.clock.now();
        entry.last_attempt = Some(now);
        let result = if handler.is_online().await {
            handler
                .sync(&entry)
                .await
                .map_err(|e| (e.to_string(), e.is_retryable()))
        } else {
            Err(("Hacienda API is not accessible".to_string(), true))
        };

        match result {
            Ok(()) => {
                entry.state = EntryState::Synced;
                entry.synced_at = Some(now);
                entry.next_retry = None;
                entry.last_error = None;
                self.store.update(&entry).await?;
                info!(entry = id, document = entry.document_id, "queue entry synced");
                Ok(AttemptOutcome::Synced)
            }
            Err((message, retryable)) => {
                entry.retry_count += 1;
                entry.last_error = Some(message.clone());
                let exhausted = entry.retry_count >= self.config.max_retries;
                if exhausted || !retryable {
                    entry.state = EntryState::Failed;
                    entry.next_retry = None;
                } else {
                    entry.state = EntryState::Pending;
                    entry.next_retry = Some(next_retry_at(now, entry.retry_count));
                }
                self.store.update(&entry).await?;
                warn!(
                    entry = id,
                    document = entry.document_id,
                    retry_count = entry.retry_count,
                    exhausted,
                    retryable,
                    error = %message,
                    "queue entry attempt failed"
                );
                Ok(AttemptOutcome::Failed {
                    retry_count: entry.retry_count,
                    exhausted,
                    retryable,
                    message,
                })
            }
        }
    }

    /// Attempt up to a batch of due entries, highest priority first, then oldest.
    pub async fn sweep(&self, handler: &dyn SyncHandler) -> Result<SweepReport, QueueError> {
        let now = self.clock.now();
        let mut due: Vec<QueueEntry> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|entry| entry.is_due(now))
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        due.truncate(self.config.batch_size);

        let mut report = SweepReport::default();
        for entry in due {
            match self.attempt(entry.id, handler).await {
                Ok(AttemptOutcome::Synced) => {
                    report.attempted += 1;
                    report.synced += 1;
                }
                Ok(AttemptOutcome::Failed { .. }) => {
                    report.attempted += 1;
                    report.failed += 1;
                }
                Err(
                    QueueError::AlreadySyncing(_)
                    | QueueError::AlreadySynced(_)
                    | QueueError::NotFound(_),
                ) => report.skipped += 1,
                Err(e) => return Err(e),
            }
        }
        if report.attempted > 0 || report.skipped > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                skipped = report.skipped,
                "queue sweep finished"
            );
        } else {
            debug!("no queue entries due");
        }
        Ok(report)
    }

    /// Return a failed entry to `pending` with a clean retry counter.
    pub async fn reset(&self, id: u64) -> Result<QueueEntry, QueueError> {
        let mut entry = self.get(id).await?;
        if entry.state != EntryState::Failed {
            return Err(QueueError::NotFailed(id));
        }
        entry.state = EntryState::Pending;
        entry.retry_count = 0;
        entry.last_error = None;
        entry.last_attempt = None;
        entry.next_retry = None;
        self.store.update(&entry).await?;
        info!(entry = id, "queue entry reset");
        Ok(entry)
    }

    /// Manual resolution, e.g. after confirming delivery out of band.
    pub async fn mark_synced(&self, id: u64) -> Result<QueueEntry, QueueError> {
        let mut entry = self.get(id).await?;
        if entry.state == EntryState::Syncing {
            return Err(QueueError::AlreadySyncing(id));
        }
        entry.state = EntryState::Synced;
        entry.synced_at = Some(self.clock.now());
        entry.next_retry = None;
        self.store.update(&entry).await?;
        Ok(entry)
    }

    pub async fn delete(&self, id: u64) -> Result<QueueEntry, QueueError> {
        let removed = self.store.remove(id).await?;
        info!(entry = id, "queue entry deleted");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = self.clock.now();
        let mut stats = QueueStats::default();
        let mut oldest: Option<DateTime<Utc>> = None;
        for entry in self.store.list().await? {
            match entry.state {
                EntryState::Pending => {
                    stats.pending += 1;
                    oldest = Some(oldest.map_or(entry.created_at, |o| o.min(entry.created_at)));
                }
                EntryState::Syncing => stats.syncing += 1,
                EntryState::Synced => stats.synced += 1,
                EntryState::Failed => stats.failed += 1,
            }
        }
        stats.total = stats.pending + stats.syncing + stats.failed;
        stats.oldest_pending_age = oldest.map(|created| now - created);
        Ok(stats)
    }

    /// Delete synced entries older than the retention window.
    pub async fn purge_synced(&self) -> Result<usize, QueueError> {
        let cutoff = self.clock.now() - self.config.retention();
        let mut purged = 0;
        for entry in self.store.list().await? {
            let synced_at = entry.synced_at.unwrap_or(entry.created_at);
            if entry.state == EntryState::Synced && synced_at < cutoff {
                self.store.remove(entry.id).await?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(purged, "purged synced queue entries");
        }
        Ok(purged)
    }
}

/// Periodic driver for [`OfflineQueue::sweep`].
pub struct Sweeper {
    queue: Arc<OfflineQueue>,
    handler: Arc<dyn SyncHandler>,
    interval: Duration,
    cancel: CancellationToken,
}

impl Sweeper {
    pub fn new(
        queue: Arc<OfflineQueue>,
        handler: Arc<dyn SyncHandler>,
        cancel: CancellationToken,
    ) -> Self {
        let interval = queue.config().sweep_interval();
        Self {
            queue,
            handler,
            interval,
            cancel,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One sweep, one status poll round and one purge. Failures are logged.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = match self.queue.sweep(self.handler.as_ref()).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "queue sweep failed");
                SweepReport::default()
            }
        };
        match self
            .handler
            .poll_submitted(self.queue.config().batch_size)
            .await
        {
            Ok(polled) => report.polled = polled,
            Err(e) => warn!(error = %e, "status poll failed"),
        }
        match self.queue.purge_synced().await {
            Ok(purged) => report.purged = purged,
            Err(e) => warn!(error = %e, "queue purge failed"),
        }
        report
    }

    /// Sweep every interval until cancelled.
    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "queue sweeper started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("queue sweeper stopping");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.run_once().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::HaciendaError, clock::ManualClock};
    use chrono::TimeZone;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    struct ScriptedHandler {
        online: AtomicBool,
        fail: AtomicBool,
        terminal: AtomicBool,
        calls: AtomicUsize,
        seen: Mutex<Vec<u64>>,
    }

    impl ScriptedHandler {
        fn new(online: bool, fail: bool) -> Self {
            Self {
                online: AtomicBool::new(online),
                fail: AtomicBool::new(fail),
                terminal: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SyncHandler for ScriptedHandler {
        async fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        async fn sync(&self, entry: &QueueEntry) -> Result<(), crate::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(entry.id);
            if self.terminal.load(Ordering::SeqCst) {
                Err(HaciendaError::Http {
                    status: 400,
                    message: "clave duplicada".into(),
                }
                .into())
            } else if self.fail.load(Ordering::SeqCst) {
                Err(HaciendaError::Timeout("simulated".into()).into())
            } else {
                Ok(())
            }
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 1, 9, 0, 0).unwrap()
    }

    fn queue(clock: Arc<ManualClock>) -> OfflineQueue {
        OfflineQueue::new(
            Arc::new(InMemoryQueueStore::new()),
            QueueConfig::default(),
            clock,
        )
    }

    fn request(document_id: u64, priority: QueuePriority) -> Enqueue {
        Enqueue {
            document_id,
            operation: QueueOperation::Submit,
            priority,
            signed_body: Some("<signed/>".into()),
            error: Some("timeout".into()),
        }
    }

    #[test]
    fn backoff_ladder_caps_at_sixteen_minutes() {
        let last = start();
        let minutes: Vec<i64> = (0..7)
            .map(|n| (next_retry_at(last, n) - last).num_minutes())
            .collect();
        assert_eq!(minutes, vec![1, 2, 4, 8, 16, 16, 16]);
    }

    #[tokio::test]
    async fn enqueue_refreshes_live_entry() {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = queue(clock);
        let first = queue.enqueue(request(7, QueuePriority::Low)).await.expect("enqueue");
        let mut again = request(7, QueuePriority::High);
        again.operation = QueueOperation::CheckStatus;
        let second = queue.enqueue(again).await.expect("enqueue");
        assert_eq!(first.id, second.id);
        assert_eq!(second.priority, QueuePriority::High);
        assert_eq!(second.operation, QueueOperation::CheckStatus);
        assert_eq!(queue.stats().await.expect("stats").pending, 1);
    }

    #[tokio::test]
    async fn five_failures_exhaust_and_sixth_is_refused() {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = queue(clock.clone());
        let handler = ScriptedHandler::new(true, true);
        let id = queue.enqueue(request(1, QueuePriority::Normal)).await.expect("enqueue").id;

        for n in 1..=5u32 {
            let outcome = queue.attempt(id, &handler).await.expect("attempt");
            assert_eq!(
                outcome,
                AttemptOutcome::Failed {
                    retry_count: n,
                    exhausted: n == 5,
                    retryable: true,
                    message: "Request timed out: simulated".into(),
                }
            );
            clock.advance(chrono::Duration::minutes(20));
        }
        let entry = queue.get(id).await.expect("get");
        assert_eq!(entry.state, EntryState::Failed);
        assert_eq!(entry.retry_count, 5);

        let err = queue.attempt(id, &handler).await.expect_err("exhausted");
        assert!(matches!(err, QueueError::RetriesExhausted(found) if found == id));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);

        let reset = queue.reset(id).await.expect("reset");
        assert_eq!(reset.state, EntryState::Pending);
        assert_eq!(reset.retry_count, 0);
        assert!(reset.last_error.is_none());
    }

    #[tokio::test]
    async fn failed_attempt_schedules_backoff_from_attempt_time() {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = queue(clock);
        let handler = ScriptedHandler::new(true, true);
        let id = queue.enqueue(request(1, QueuePriority::Normal)).await.expect("enqueue").id;
        queue.attempt(id, &handler).await.expect("attempt");
        let entry = queue.get(id).await.expect("get");
        assert_eq!(entry.last_attempt, Some(start()));
        assert_eq!(entry.next_retry, Some(start() + chrono::Duration::minutes(2)));
        assert!(!entry.is_due(start()));
    }

    #[tokio::test]
    async fn terminal_error_parks_entry_until_reset() {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = queue(clock.clone());
        let handler = ScriptedHandler::new(true, true);
        let id = queue.enqueue(request(1, QueuePriority::Normal)).await.expect("enqueue").id;

        let outcome = queue.attempt(id, &handler).await.expect("transport failure");
        assert!(matches!(outcome, AttemptOutcome::Failed { retryable: true, .. }));

        handler.terminal.store(true, Ordering::SeqCst);
        clock.advance(chrono::Duration::hours(1));
        let outcome = queue.attempt(id, &handler).await.expect("rejection");
        assert!(matches!(
            outcome,
            AttemptOutcome::Failed { retry_count: 2, exhausted: false, retryable: false, .. }
        ));
        let entry = queue.get(id).await.expect("get");
        assert_eq!(entry.state, EntryState::Failed);
        assert_eq!(entry.next_retry, None);
        assert_eq!(
            entry.last_error.as_deref(),
            Some("Hacienda returned HTTP 400: clave duplicada")
        );

        for _ in 0..4 {
            clock.advance(chrono::Duration::hours(1));
            let report = queue.sweep(&handler).await.expect("sweep");
            assert_eq!(report.attempted, 0);
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

        let reset = queue.reset(id).await.expect("reset");
        assert!(reset.is_due(clock.now()));
    }

    #[tokio::test]
    async fn offline_attempt_fails_without_calling_handler() {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = queue(clock);
        let handler = ScriptedHandler::new(false, false);
        let id = queue.enqueue(request(1, QueuePriority::Normal)).await.expect("enqueue").id;
        let outcome = queue.attempt(id, &handler).await.expect("attempt");
        assert!(matches!(
            outcome,
            AttemptOutcome::Failed { retry_count: 1, exhausted: false, retryable: true, ref message }
                if message == "Hacienda API is not accessible"
        ));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn synced_entries_refuse_further_attempts() {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = queue(clock);
        let handler = ScriptedHandler::new(true, false);
        let id = queue.enqueue(request(1, QueuePriority::Normal)).await.expect("enqueue").id;
        assert_eq!(queue.attempt(id, &handler).await.expect("attempt"), AttemptOutcome::Synced);
        assert!(matches!(
            queue.attempt(id, &handler).await,
            Err(QueueError::AlreadySynced(_))
        ));
    }

    #[tokio::test]
    async fn sweep_orders_by_priority_then_age() {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = queue(clock.clone());
        let handler = ScriptedHandler::new(true, false);
        let low = queue.enqueue(request(1, QueuePriority::Low)).await.expect("enqueue").id;
        clock.advance(chrono::Duration::seconds(1));
        let normal_old = queue.enqueue(request(2, QueuePriority::Normal)).await.expect("enqueue").id;
        clock.advance(chrono::Duration::seconds(1));
        let high = queue.enqueue(request(3, QueuePriority::High)).await.expect("enqueue").id;
        clock.advance(chrono::Duration::seconds(1));
        let normal_new = queue.enqueue(request(4, QueuePriority::Normal)).await.expect("enqueue").id;

        let report = queue.sweep(&handler).await.expect("sweep");
        assert_eq!(report.synced, 4);
        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec![high, normal_old, normal_new, low]
        );
    }

    #[tokio::test]
    async fn sweep_respects_batch_size_and_backoff() {
        let clock = Arc::new(ManualClock::new(start()));
        let config = QueueConfig {
            batch_size: 2,
            ..QueueConfig::default()
        };
        let queue = OfflineQueue::new(Arc::new(InMemoryQueueStore::new()), config, clock.clone());
        let failing = ScriptedHandler::new(true, true);
        for document in 1..=3 {
            queue.enqueue(request(document, QueuePriority::Normal)).await.expect("enqueue");
        }
        let report = queue.sweep(&failing).await.expect("sweep");
        assert_eq!((report.attempted, report.failed), (2, 2));

        // The two failed entries are backing off; only the third is due.
        let report = queue.sweep(&failing).await.expect("sweep");
        assert_eq!(report.attempted, 1);

        clock.advance(chrono::Duration::minutes(2));
        let report = queue.sweep(&failing).await.expect("sweep");
        assert_eq!(report.attempted, 2);
    }

    #[tokio::test]
    async fn delete_refuses_syncing_entries() {
        let clock = Arc::new(ManualClock::new(start()));
        let store = Arc::new(InMemoryQueueStore::new());
        let queue = OfflineQueue::new(store.clone(), QueueConfig::default(), clock);
        let id = queue.enqueue(request(1, QueuePriority::Normal)).await.expect("enqueue").id;
        store.begin_sync(id, EntryState::Pending).await.expect("cas");
        assert!(matches!(queue.delete(id).await, Err(QueueError::AlreadySyncing(_))));
        assert!(matches!(queue.mark_synced(id).await, Err(QueueError::AlreadySyncing(_))));
        let handler = ScriptedHandler::new(true, false);
        assert!(matches!(
            queue.attempt(id, &handler).await,
            Err(QueueError::AlreadySyncing(_))
        ));
    }

    #[tokio::test]
    async fn reset_requires_failed_state() {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = queue(clock);
        let id = queue.enqueue(request(1, QueuePriority::Normal)).await.expect("enqueue").id;
        assert!(matches!(queue.reset(id).await, Err(QueueError::NotFailed(_))));
    }

    #[tokio::test]
    async fn stats_and_purge_follow_retention() {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = queue(clock.clone());
        let synced = queue.enqueue(request(1, QueuePriority::Normal)).await.expect("enqueue").id;
        queue.mark_synced(synced).await.expect("mark");
        queue.enqueue(request(2, QueuePriority::Normal)).await.expect("enqueue");

        clock.advance(chrono::Duration::days(10));
        let stats = queue.stats().await.expect("stats");
        assert_eq!((stats.pending, stats.synced, stats.total), (1, 1, 1));
        assert_eq!(stats.oldest_pending_age, Some(chrono::Duration::days(10)));
        assert_eq!(queue.purge_synced().await.expect("purge"), 0);

        clock.advance(chrono::Duration::days(21));
        assert_eq!(queue.purge_synced().await.expect("purge"), 1);
        assert!(matches!(queue.get(synced).await, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn storage_errors_surface_from_attempt() {
        let mut store = store::MockQueueStore::new();
        store
            .expect_get()
            .returning(|_| Err(QueueError::Storage("db offline".into())));
        let queue = OfflineQueue::new(
            Arc::new(store),
            QueueConfig::default(),
            Arc::new(ManualClock::new(start())),
        );
        let handler = ScriptedHandler::new(true, false);
        let err = queue.attempt(1, &handler).await.expect_err("storage");
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_on_cancel() {
        let clock = Arc::new(ManualClock::new(start()));
        let queue = Arc::new(queue(clock));
        queue.enqueue(request(1, QueuePriority::Normal)).await.expect("enqueue");
        let handler = Arc::new(ScriptedHandler::new(true, false));
        let cancel = CancellationToken::new();
        let sweeper = Sweeper::new(queue.clone(), handler.clone(), cancel.clone())
            .with_interval(Duration::from_secs(60));
        let task = tokio::spawn(sweeper.run());

        tokio::time::sleep(Duration::from_secs(61)).await;
        cancel.cancel();
        task.await.expect("join");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.stats().await.expect("stats").synced, 1);
    }
}
