//! Message lifecycle manager - the synchronization engine.
//!
//! One cycle reconciles "what the events API says now" with "what we posted
//! last time":
//!
//! ```text
//! Idle ─► Fetching ─► Normalizing ─► Reconciling ─► Committed
//!            │                            │
//!            └──────────► Aborted ◄───────┘  (fetch failure / timeout)
//! ```
//!
//! Reconciling runs every registered destination concurrently. For each one:
//! resolve it, delete every handle recorded for it, then post every
//! displayable event with a pause between posts. Per-message failures are
//! logged and skipped. Only after all destinations finish is the new
//! destination -> handles mapping saved, replacing the old one wholesale.
//! Nothing is persisted if the cycle aborts or is cancelled.
//!
//! At most one cycle runs at a time. Scheduled cycles queue behind a running
//! one; manual cycles are rejected with [`CycleError::Busy`].

use crate::metrics::SyncMetrics;
use crate::normalize::{Normalized, Normalizer};
use crate::registry::DestinationRegistry;
use crate::render::{NotificationPayload, Renderer};
use crate::sink::{DestinationSink, MessageHandle};
use crate::source::{EventSource, FetchError};
use crate::store::{HandleList, KeyValueStore, PostedMessages, StoreError};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Default pause between two posts to the same destination
pub const DEFAULT_POST_DELAY: Duration = Duration::from_secs(1);

/// Default pause between two deletes at the same destination
pub const DEFAULT_DELETE_DELAY: Duration = Duration::from_millis(500);

/// Default upper bound on one cycle
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Source of "now" for days-remaining labels.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Where the synchronizer is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Idle,
    Fetching,
    Normalizing,
    Reconciling,
    Committed,
    Aborted,
}

impl CycleState {
    fn is_terminal(self) -> bool {
        matches!(self, CycleState::Committed | CycleState::Aborted)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::Fetching => "fetching",
            CycleState::Normalizing => "normalizing",
            CycleState::Reconciling => "reconciling",
            CycleState::Committed => "committed",
            CycleState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled => f.write_str("scheduled"),
            Trigger::Manual => f.write_str("manual"),
        }
    }
}

/// Cycle-level failures. Per-message problems never surface here.
#[derive(Debug, Error)]
pub enum CycleError {
    /// Another cycle is already running
    #[error("a synchronization cycle is already in progress")]
    Busy,

    /// The events API could not be read; nothing was changed
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The cycle exceeded its time bound; nothing was committed
    #[error("cycle exceeded {}s time limit", .0.as_secs())]
    TimedOut(Duration),

    /// The new message record could not be saved
    #[error("could not persist posted messages: {0}")]
    Persist(#[source] StoreError),
}

/// Pacing and bounds for a cycle.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub post_delay: Duration,
    pub delete_delay: Duration,
    /// `None` disables the bound
    pub cycle_timeout: Option<Duration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            post_delay: DEFAULT_POST_DELAY,
            delete_delay: DEFAULT_DELETE_DELAY,
            cycle_timeout: Some(DEFAULT_CYCLE_TIMEOUT),
        }
    }
}

/// How one destination fared in a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DestinationOutcome {
    Synced {
        deleted: usize,
        delete_failures: usize,
        posted: usize,
        post_failures: usize,
    },
    /// Gone or inaccessible; its record was dropped
    Unresolvable,
    /// Could not be checked; its record was carried over untouched
    ResolveFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationReport {
    pub destination: String,
    #[serde(flatten)]
    pub outcome: DestinationOutcome,
}

/// Summary of a committed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub fetched: usize,
    pub displayable: usize,
    pub rejected: usize,
    pub destinations: Vec<DestinationReport>,
}

impl CycleReport {
    pub fn posted(&self) -> usize {
        self.destinations
            .iter()
            .map(|d| match d.outcome {
                DestinationOutcome::Synced { posted, .. } => posted,
                _ => 0,
            })
            .sum()
    }
}

/// Result of fetching and filtering without posting anything.
#[derive(Debug)]
pub struct Preview {
    pub fetched: usize,
    pub normalized: Normalized,
}

/// Marks the cycle aborted if it is dropped before reaching a terminal state.
struct AbortOnDrop<'a>(&'a watch::Sender<CycleState>);

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = CycleState::Aborted;
                true
            }
        });
    }
}

/// The synchronization engine.
pub struct Synchronizer {
    source: Arc<dyn EventSource>,
    sink: Arc<dyn DestinationSink>,
    registry: Arc<DestinationRegistry>,
    messages: Arc<dyn KeyValueStore<HandleList>>,
    normalizer: Normalizer,
    renderer: Renderer,
    settings: SyncSettings,
    clock: Clock,
    metrics: Arc<SyncMetrics>,
    cycle_lock: Mutex<()>,
    state: watch::Sender<CycleState>,
}

impl Synchronizer {
    pub fn new(
        source: Arc<dyn EventSource>,
        sink: Arc<dyn DestinationSink>,
        registry: Arc<DestinationRegistry>,
        messages: Arc<dyn KeyValueStore<HandleList>>,
    ) -> Self {
        let (state, _) = watch::channel(CycleState::Idle);
        Self {
            source,
            sink,
            registry,
            messages,
            normalizer: Normalizer::default(),
            renderer: Renderer::default(),
            settings: SyncSettings::default(),
            clock: Arc::new(Utc::now),
            metrics: Arc::new(SyncMetrics::new()),
            cycle_lock: Mutex::new(()),
            state,
        }
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn registry(&self) -> &Arc<DestinationRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Current state of the cycle state machine.
    pub fn state(&self) -> CycleState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<CycleState> {
        self.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.cycle_lock.try_lock().is_err()
    }

    /// Run a cycle, waiting for any in-progress cycle to finish first.
    pub async fn run_cycle(&self, trigger: Trigger) -> Result<CycleReport, CycleError> {
        let _guard = self.cycle_lock.lock().await;
        self.execute(trigger).await
    }

    /// Run a cycle unless one is already in progress.
    pub async fn try_run_cycle(&self, trigger: Trigger) -> Result<CycleReport, CycleError> {
        let _guard = self.cycle_lock.try_lock().map_err(|_| CycleError::Busy)?;
        self.execute(trigger).await
    }

    /// Entry point for manual triggers: never waits behind a running cycle.
    pub async fn trigger_manual(&self) -> Result<CycleReport, CycleError> {
        self.try_run_cycle(Trigger::Manual).await
    }

    /// Fetch and filter without touching any destination.
    pub async fn preview(&self) -> Result<Preview, FetchError> {
        let raws = self.source.fetch().await?;
        Ok(Preview {
            fetched: raws.len(),
            normalized: self.normalizer.normalize_all(&raws),
        })
    }

    fn set_state(&self, state: CycleState) {
        debug!(state = %state, "Cycle state");
        self.state.send_replace(state);
    }

    /// Caller must hold `cycle_lock`.
    async fn execute(&self, trigger: Trigger) -> Result<CycleReport, CycleError> {
        let _abort_on_drop = AbortOnDrop(&self.state);
        info!(trigger = %trigger, "Starting synchronization cycle");

        let outcome = match self.settings.cycle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.reconcile(trigger))
                .await
                .unwrap_or_else(|_| Err(CycleError::TimedOut(limit))),
            None => self.reconcile(trigger).await,
        };

        let result = match outcome {
            Ok((report, next)) => self.commit(&next).await.map(|()| report),
            Err(e) => Err(e),
        };

        match &result {
            Ok(report) => {
                self.set_state(CycleState::Committed);
                self.metrics.cycle_committed();
                info!(
                    trigger = %trigger,
                    fetched = report.fetched,
                    displayable = report.displayable,
                    destinations = report.destinations.len(),
                    posted = report.posted(),
                    "Synchronization cycle committed"
                );
            }
            Err(e) => {
                self.set_state(CycleState::Aborted);
                self.metrics.cycle_aborted();
                error!(trigger = %trigger, error = %e, "Synchronization cycle aborted");
            }
        }

        result
    }

    /// Fetch, normalize and reconcile every destination. Returns the mapping
    /// to commit.
    async fn reconcile(
        &self,
        trigger: Trigger,
    ) -> Result<(CycleReport, PostedMessages), CycleError> {
        let started_at = (self.clock)();

        self.set_state(CycleState::Fetching);
        let raws = self.source.fetch().await?;

        self.set_state(CycleState::Normalizing);
        let normalized = self.normalizer.normalize_all(&raws);
        let now = (self.clock)();
        let payloads: Vec<NotificationPayload> = normalized
            .events
            .iter()
            .map(|event| self.renderer.render(event, now))
            .collect();
        if !normalized.rejected.is_empty() {
            let skipped: Vec<&str> = normalized.rejected.iter().map(|(t, _)| t.as_str()).collect();
            info!(count = skipped.len(), skipped = ?skipped, "Skipped events");
        }

        self.set_state(CycleState::Reconciling);
        let destinations = self.registry.list().await;
        let mut previous = self.messages.load().await;

        for stale in previous.keys().filter(|id| !destinations.contains(*id)) {
            info!(destination = %stale, "Dropping record for untracked destination");
        }

        let tasks = destinations.iter().map(|destination| {
            let prior = previous.remove(destination).unwrap_or_default();
            self.sync_destination(destination, prior.0, &payloads)
        });
        let results = join_all(tasks).await;

        let mut next = PostedMessages::new();
        let mut reports = Vec::with_capacity(results.len());
        for (report, handles) in results {
            if let Some(handles) = handles {
                next.insert(report.destination.clone(), handles);
            }
            reports.push(report);
        }

        let report = CycleReport {
            trigger,
            started_at,
            fetched: raws.len(),
            displayable: payloads.len(),
            rejected: normalized.rejected.len(),
            destinations: reports,
        };
        Ok((report, next))
    }

    /// Delete-then-post for one destination.
    ///
    /// Returns the handle list to record, or `None` to drop the
    /// destination's record.
    async fn sync_destination(
        &self,
        destination: &str,
        prior: Vec<MessageHandle>,
        payloads: &[NotificationPayload],
    ) -> (DestinationReport, Option<HandleList>) {
        let report = |outcome| DestinationReport {
            destination: destination.to_string(),
            outcome,
        };

        match self.sink.resolve(destination).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(destination = %destination, "Destination not found, skipping");
                return (report(DestinationOutcome::Unresolvable), None);
            }
            Err(e) => {
                warn!(
                    destination = %destination,
                    error = %e,
                    kept = prior.len(),
                    "Could not resolve destination, keeping its record for next cycle"
                );
                return (report(DestinationOutcome::ResolveFailed), Some(HandleList(prior)));
            }
        }

        let mut deleted = 0;
        let mut delete_failures = 0;
        for (i, handle) in prior.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.delete_delay).await;
            }
            match self.sink.delete(destination, handle).await {
                Ok(()) => {
                    deleted += 1;
                    self.metrics.deleted();
                    debug!(destination = %destination, handle = %handle, "Deleted message");
                }
                Err(e) => {
                    delete_failures += 1;
                    self.metrics.delete_failed();
                    warn!(
                        destination = %destination,
                        handle = %handle,
                        error = %e,
                        "Could not delete message, treating as already gone"
                    );
                }
            }
        }

        let mut handles = Vec::with_capacity(payloads.len());
        let mut post_failures = 0;
        for (i, payload) in payloads.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.post_delay).await;
            }
            match self.sink.post(destination, payload).await {
                Ok(handle) => {
                    self.metrics.posted();
                    debug!(destination = %destination, handle = %handle, title = %payload.title, "Posted event");
                    handles.push(handle);
                }
                Err(e) => {
                    post_failures += 1;
                    self.metrics.post_failed();
                    warn!(
                        destination = %destination,
                        title = %payload.title,
                        error = %e,
                        "Failed to post event"
                    );
                }
            }
        }

        info!(
            destination = %destination,
            deleted,
            delete_failures,
            posted = handles.len(),
            post_failures,
            "Destination synchronized"
        );

        let outcome = DestinationOutcome::Synced {
            deleted,
            delete_failures,
            posted: handles.len(),
            post_failures,
        };
        (report(outcome), Some(HandleList(handles)))
    }

    async fn commit(&self, next: &PostedMessages) -> Result<(), CycleError> {
        self.messages.save(next).await.map_err(|e| {
            error!(error = %e, "Failed to persist posted messages");
            CycleError::Persist(e)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event::RawEvent;
    use crate::sink::SinkError;
    use crate::store::{Mapping, MemoryStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    /// Event source returning a swappable list, or failing on demand.
    #[derive(Default)]
    pub(crate) struct FakeSource {
        pub(crate) events: StdMutex<Vec<RawEvent>>,
        pub(crate) fail: StdMutex<bool>,
        pub(crate) gate: Option<Arc<Notify>>,
        pub(crate) hang: bool,
    }

    impl FakeSource {
        pub(crate) fn with_events(events: Vec<RawEvent>) -> Self {
            Self {
                events: StdMutex::new(events),
                ..Default::default()
            }
        }

        pub(crate) fn set_events(&self, events: Vec<RawEvent>) {
            *self.events.lock().unwrap() = events;
        }

        pub(crate) fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl EventSource for FakeSource {
        async fn fetch(&self) -> Result<Vec<RawEvent>, FetchError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.hang {
                std::future::pending::<()>().await;
            }
            if *self.fail.lock().unwrap() {
                return Err(FetchError::Status(503));
            }
            Ok(self.events.lock().unwrap().clone())
        }
    }

    /// Sink that keeps "live" messages per destination in memory.
    #[derive(Default)]
    pub(crate) struct FakeSink {
        pub(crate) next_id: StdMutex<u32>,
        pub(crate) live: StdMutex<HashMap<String, Vec<(MessageHandle, String)>>>,
        pub(crate) calls: StdMutex<Vec<String>>,
        pub(crate) absent: HashSet<String>,
        pub(crate) resolve_errors: HashSet<String>,
        pub(crate) failing_posts: HashSet<(String, String)>,
        pub(crate) failing_deletes: HashSet<String>,
    }

    impl FakeSink {
        pub(crate) fn live_titles(&self, destination: &str) -> Vec<String> {
            self.live
                .lock()
                .unwrap()
                .get(destination)
                .map(|msgs| msgs.iter().map(|(_, t)| t.clone()).collect())
                .unwrap_or_default()
        }

        fn calls_for(&self, destination: &str) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.contains(&format!(" {}", destination)))
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl DestinationSink for FakeSink {
        fn name(&self) -> &str {
            "fake"
        }

        async fn resolve(&self, destination: &str) -> Result<bool, SinkError> {
            self.calls.lock().unwrap().push(format!("resolve {}", destination));
            if self.resolve_errors.contains(destination) {
                return Err(SinkError::Failed("gateway timeout".into()));
            }
            Ok(!self.absent.contains(destination))
        }

        async fn post(
            &self,
            destination: &str,
            payload: &NotificationPayload,
        ) -> Result<MessageHandle, SinkError> {
            self.calls.lock().unwrap().push(format!("post {}", destination));
            if self
                .failing_posts
                .contains(&(destination.to_string(), payload.title.clone()))
            {
                return Err(SinkError::Status {
                    status: 400,
                    body: "bad embed".into(),
                });
            }
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let handle = MessageHandle::new(format!("h{}", *next));
            self.live
                .lock()
                .unwrap()
                .entry(destination.to_string())
                .or_default()
                .push((handle.clone(), payload.title.clone()));
            Ok(handle)
        }

        async fn delete(&self, destination: &str, handle: &MessageHandle) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(format!("delete {}", destination));
            if self.failing_deletes.contains(handle.as_str()) {
                return Err(SinkError::Failed("missing permissions".into()));
            }
            if let Some(msgs) = self.live.lock().unwrap().get_mut(destination) {
                msgs.retain(|(h, _)| h != handle);
            }
            Ok(())
        }
    }

    /// Store whose saves always fail.
    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore<HandleList> for BrokenStore {
        async fn load(&self) -> Mapping<HandleList> {
            Mapping::new()
        }

        async fn save(&self, _mapping: &Mapping<HandleList>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
    }

    pub(crate) fn siege() -> RawEvent {
        RawEvent::new("Siege")
            .with_created_at("2025-12-01T03:00:00.000Z")
            .with_end_at("2026-01-10T00:00:00.000Z")
            .with_region("asia")
            .with_link("https://example.com/siege")
            .with_img("https://example.com/siege.png")
    }

    pub(crate) fn event(title: &str) -> RawEvent {
        RawEvent::new(title).with_end_at("2026-03-01T00:00:00.000Z")
    }

    fn handles(ids: &[&str]) -> HandleList {
        HandleList(ids.iter().map(|id| MessageHandle::new(*id)).collect())
    }

    pub(crate) fn no_delays() -> SyncSettings {
        SyncSettings {
            post_delay: Duration::ZERO,
            delete_delay: Duration::ZERO,
            cycle_timeout: None,
        }
    }

    pub(crate) struct Harness {
        pub(crate) source: Arc<FakeSource>,
        pub(crate) sink: Arc<FakeSink>,
        pub(crate) registry: Arc<DestinationRegistry>,
        pub(crate) messages: Arc<MemoryStore<HandleList>>,
        pub(crate) sync: Arc<Synchronizer>,
    }

    pub(crate) async fn harness_with(
        source: FakeSource,
        sink: FakeSink,
        destinations: &[&str],
        settings: SyncSettings,
    ) -> Harness {
        let source = Arc::new(source);
        let sink = Arc::new(sink);
        let registry = Arc::new(DestinationRegistry::new(Arc::new(
            MemoryStore::<bool>::new(),
        )));
        for d in destinations {
            registry.add(d).await.unwrap();
        }
        let messages = Arc::new(MemoryStore::<HandleList>::new());
        let clock: Clock = Arc::new(|| Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());

        let sync = Synchronizer::new(
            source.clone(),
            sink.clone(),
            registry.clone(),
            messages.clone(),
        )
        .with_settings(settings)
        .with_clock(clock);

        Harness {
            source,
            sink,
            registry,
            messages,
            sync: Arc::new(sync),
        }
    }

    pub(crate) async fn harness(events: Vec<RawEvent>, destinations: &[&str]) -> Harness {
        harness_with(
            FakeSource::with_events(events),
            FakeSink::default(),
            destinations,
            no_delays(),
        )
        .await
    }

    #[tokio::test]
    async fn test_first_cycle_posts_and_records() {
        let h = harness(vec![siege()], &["chan"]).await;

        let report = h.sync.run_cycle(Trigger::Scheduled).await.unwrap();

        assert_eq!(report.started_at, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(report.fetched, 1);
        assert_eq!(report.displayable, 1);
        assert_eq!(report.posted(), 1);
        assert_eq!(h.sink.live_titles("chan"), vec!["Siege"]);
        assert_eq!(h.messages.load().await["chan"], handles(&["h1"]));
        assert_eq!(h.sync.state(), CycleState::Committed);
    }

    #[tokio::test]
    async fn test_empty_source_clears_destination() {
        let h = harness(vec![siege()], &["chan"]).await;
        h.sync.run_cycle(Trigger::Scheduled).await.unwrap();

        h.source.set_events(vec![]);
        let report = h.sync.run_cycle(Trigger::Scheduled).await.unwrap();

        assert_eq!(
            report.destinations[0].outcome,
            DestinationOutcome::Synced {
                deleted: 1,
                delete_failures: 0,
                posted: 0,
                post_failures: 0
            }
        );
        assert!(h.sink.live_titles("chan").is_empty());
        assert_eq!(h.messages.load().await["chan"], HandleList::default());
    }

    #[tokio::test]
    async fn test_repeated_cycles_are_idempotent() {
        let h = harness(vec![event("A"), event("B")], &["chan"]).await;

        h.sync.run_cycle(Trigger::Scheduled).await.unwrap();
        let first = h.messages.load().await["chan"].clone();
        let live_after_first = h.sink.live_titles("chan");

        h.sync.run_cycle(Trigger::Scheduled).await.unwrap();

        assert_eq!(h.sink.live_titles("chan"), live_after_first);
        let live_handles: Vec<MessageHandle> = h.sink.live.lock().unwrap()["chan"]
            .iter()
            .map(|(handle, _)| handle.clone())
            .collect();
        assert!(first.0.iter().all(|old| !live_handles.contains(old)));
        assert_eq!(h.messages.load().await["chan"].0, live_handles);
        assert_eq!(h.sink.calls_for("chan").iter().filter(|c| c.starts_with("delete")).count(), 2);
    }

    #[tokio::test]
    async fn test_partial_post_failure_is_skipped() {
        let sink = FakeSink {
            failing_posts: HashSet::from([("second".to_string(), "B".to_string())]),
            ..Default::default()
        };
        let h = harness_with(
            FakeSource::with_events(vec![event("A"), event("B"), event("C")]),
            sink,
            &["first", "second"],
            no_delays(),
        )
        .await;

        h.sync.run_cycle(Trigger::Scheduled).await.unwrap();

        let record = h.messages.load().await;
        assert_eq!(record["first"].0.len(), 3);
        assert_eq!(record["second"].0.len(), 2);
        assert_eq!(h.sink.live_titles("second"), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_changes_nothing() {
        let h = harness(vec![siege()], &["chan"]).await;
        h.sync.run_cycle(Trigger::Scheduled).await.unwrap();
        let record_before = h.messages.load().await;
        let calls_before = h.sink.calls.lock().unwrap().len();

        h.source.set_failing(true);
        let err = h.sync.run_cycle(Trigger::Scheduled).await.unwrap_err();

        assert!(matches!(err, CycleError::Fetch(FetchError::Status(503))));
        assert_eq!(h.messages.load().await, record_before);
        assert_eq!(h.sink.calls.lock().unwrap().len(), calls_before);
        assert_eq!(h.sink.live_titles("chan"), vec!["Siege"]);
        assert_eq!(h.sync.state(), CycleState::Aborted);
        assert_eq!(h.sync.metrics().snapshot().cycles_aborted, 1);
    }

    #[tokio::test]
    async fn test_untracked_destination_record_is_dropped() {
        let h = harness(vec![siege()], &["keep", "gone"]).await;
        h.sync.run_cycle(Trigger::Scheduled).await.unwrap();
        h.registry.remove("gone").await.unwrap();
        let calls_before = h.sink.calls_for("gone").len();

        h.sync.run_cycle(Trigger::Scheduled).await.unwrap();

        let record = h.messages.load().await;
        assert!(record.contains_key("keep"));
        assert!(!record.contains_key("gone"));
        assert_eq!(h.sink.calls_for("gone").len(), calls_before);
    }

    #[tokio::test]
    async fn test_unresolvable_destination_is_skipped() {
        let sink = FakeSink {
            absent: HashSet::from(["deleted".to_string()]),
            ..Default::default()
        };
        let h = harness_with(
            FakeSource::with_events(vec![siege()]),
            sink,
            &["deleted", "ok"],
            no_delays(),
        )
        .await;
        let mut prior = Mapping::new();
        prior.insert("deleted".to_string(), handles(&["old"]));
        h.messages.save(&prior).await.unwrap();

        let report = h.sync.run_cycle(Trigger::Scheduled).await.unwrap();

        let deleted = report
            .destinations
            .iter()
            .find(|d| d.destination == "deleted")
            .unwrap();
        assert_eq!(deleted.outcome, DestinationOutcome::Unresolvable);
        assert_eq!(h.sink.calls_for("deleted"), vec!["resolve deleted"]);
        assert!(!h.messages.load().await.contains_key("deleted"));
        assert_eq!(h.sink.live_titles("ok"), vec!["Siege"]);
    }

    #[tokio::test]
    async fn test_resolve_error_carries_record_forward() {
        let sink = FakeSink {
            resolve_errors: HashSet::from(["flaky".to_string()]),
            ..Default::default()
        };
        let h = harness_with(
            FakeSource::with_events(vec![siege()]),
            sink,
            &["flaky"],
            no_delays(),
        )
        .await;
        let mut prior = Mapping::new();
        prior.insert("flaky".to_string(), handles(&["h7", "h8"]));
        h.messages.save(&prior).await.unwrap();

        let report = h.sync.run_cycle(Trigger::Scheduled).await.unwrap();

        assert_eq!(report.destinations[0].outcome, DestinationOutcome::ResolveFailed);
        assert_eq!(h.messages.load().await, prior);
    }

    #[tokio::test]
    async fn test_delete_failure_does_not_abort() {
        let sink = FakeSink {
            failing_deletes: HashSet::from(["stuck".to_string()]),
            ..Default::default()
        };
        let h = harness_with(
            FakeSource::with_events(vec![event("A")]),
            sink,
            &["chan"],
            no_delays(),
        )
        .await;
        let mut prior = Mapping::new();
        prior.insert("chan".to_string(), handles(&["stuck", "fine"]));
        h.messages.save(&prior).await.unwrap();

        let report = h.sync.run_cycle(Trigger::Scheduled).await.unwrap();

        assert_eq!(
            report.destinations[0].outcome,
            DestinationOutcome::Synced {
                deleted: 1,
                delete_failures: 1,
                posted: 1,
                post_failures: 0
            }
        );
        assert_eq!(h.messages.load().await["chan"], handles(&["h1"]));
    }

    #[tokio::test]
    async fn test_excluded_and_invalid_events_are_never_posted() {
        let h = harness(
            vec![
                event("Keep"),
                RawEvent::new("No end"),
                RawEvent::new("Null end").with_end_at("null"),
                RawEvent::new("Forever").with_end_at("2025-12-30T20:00:00.000Z"),
            ],
            &["chan"],
        )
        .await;
        let sync = Synchronizer::new(
            h.source.clone(),
            h.sink.clone(),
            h.registry.clone(),
            h.messages.clone(),
        )
        .with_settings(no_delays())
        .with_normalizer(Normalizer::new(crate::normalize::NormalizePolicy {
            excluded_date: Some("2025-12-30".parse().unwrap()),
            ..Default::default()
        }));

        let report = sync.run_cycle(Trigger::Scheduled).await.unwrap();

        assert_eq!(report.fetched, 4);
        assert_eq!(report.displayable, 1);
        assert_eq!(report.rejected, 3);
        assert_eq!(h.sink.live_titles("chan"), vec!["Keep"]);
    }

    #[tokio::test]
    async fn test_persist_failure_is_a_cycle_error() {
        let source = Arc::new(FakeSource::with_events(vec![siege()]));
        let registry = Arc::new(DestinationRegistry::new(Arc::new(
            MemoryStore::<bool>::new(),
        )));
        registry.add("chan").await.unwrap();
        let sync = Synchronizer::new(
            source,
            Arc::new(FakeSink::default()),
            registry,
            Arc::new(BrokenStore),
        )
        .with_settings(no_delays());

        let err = sync.run_cycle(Trigger::Scheduled).await.unwrap_err();
        assert!(matches!(err, CycleError::Persist(_)));
        assert_eq!(sync.state(), CycleState::Aborted);
    }

    #[tokio::test]
    async fn test_manual_trigger_rejected_while_running() {
        let gate = Arc::new(Notify::new());
        let source = FakeSource {
            events: StdMutex::new(vec![siege()]),
            gate: Some(gate.clone()),
            ..Default::default()
        };
        let h = harness_with(source, FakeSink::default(), &["chan"], no_delays()).await;

        let mut state = h.sync.subscribe_state();
        let running = {
            let sync = h.sync.clone();
            tokio::spawn(async move { sync.run_cycle(Trigger::Scheduled).await })
        };
        state
            .wait_for(|s| *s == CycleState::Fetching)
            .await
            .unwrap();

        assert!(h.sync.is_running());
        assert!(matches!(h.sync.trigger_manual().await, Err(CycleError::Busy)));

        gate.notify_one();
        running.await.unwrap().unwrap();
        assert!(!h.sync.is_running());
        assert_eq!(h.sink.live_titles("chan"), vec!["Siege"]);
    }

    #[tokio::test]
    async fn test_scheduled_cycles_queue_behind_running_one() {
        let h = harness(vec![event("A")], &["chan"]).await;

        let a = {
            let sync = h.sync.clone();
            tokio::spawn(async move { sync.run_cycle(Trigger::Scheduled).await })
        };
        let b = {
            let sync = h.sync.clone();
            tokio::spawn(async move { sync.run_cycle(Trigger::Scheduled).await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // Second cycle deleted the first one's post: exactly one live message.
        assert_eq!(h.sink.live_titles("chan"), vec!["A"]);
        assert_eq!(h.messages.load().await["chan"].0.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts_without_commit() {
        let source = FakeSource {
            hang: true,
            ..Default::default()
        };
        let settings = SyncSettings {
            cycle_timeout: Some(Duration::from_secs(30)),
            ..no_delays()
        };
        let h = harness_with(source, FakeSink::default(), &["chan"], settings).await;
        let mut prior = Mapping::new();
        prior.insert("chan".to_string(), handles(&["h1"]));
        h.messages.save(&prior).await.unwrap();

        let err = h.sync.run_cycle(Trigger::Scheduled).await.unwrap_err();

        assert!(matches!(err, CycleError::TimedOut(d) if d == Duration::from_secs(30)));
        assert_eq!(h.messages.load().await, prior);
        assert_eq!(h.sync.state(), CycleState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_cycle_marks_aborted() {
        let source = FakeSource {
            hang: true,
            ..Default::default()
        };
        let h = harness_with(source, FakeSink::default(), &["chan"], no_delays()).await;

        let cycle = h.sync.run_cycle(Trigger::Scheduled);
        let cancelled = tokio::time::timeout(Duration::from_secs(1), cycle).await;

        assert!(cancelled.is_err());
        assert_eq!(h.sync.state(), CycleState::Aborted);
        assert!(h.messages.load().await.is_empty());
        assert!(!h.sync.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_posts_are_paced() {
        let settings = SyncSettings {
            post_delay: Duration::from_secs(1),
            ..no_delays()
        };
        let h = harness_with(
            FakeSource::with_events(vec![event("A"), event("B"), event("C")]),
            FakeSink::default(),
            &["chan"],
            settings,
        )
        .await;

        let started = tokio::time::Instant::now();
        h.sync.run_cycle(Trigger::Scheduled).await.unwrap();

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
        assert_eq!(h.sink.live_titles("chan"), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_preview_does_not_post() {
        let h = harness(vec![siege(), RawEvent::new("No end")], &["chan"]).await;

        let preview = h.sync.preview().await.unwrap();

        assert_eq!(preview.fetched, 2);
        assert_eq!(preview.normalized.events.len(), 1);
        assert!(h.sink.calls.lock().unwrap().is_empty());
        assert_eq!(h.sync.state(), CycleState::Idle);
    }
}
