//! Polling-and-deduplication engine: fetch scheduler, update pipeline, and
//! the per-(region, bracket) `Monitor` composition root.
//!
//! The long-latency work (the injected fetch) runs as spawned tasks bounded
//! by a semaphore; everything that mutates the history window or the
//! unique-update counter happens on a single consumer task fed over an mpsc
//! channel, so check-then-admit stays atomic per candidate without locks.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use alw_core::{
    normalize_at, HistoryWindow, LadderSnapshot, Observation, RawLadder, DEFAULT_TOP_N,
    DEFAULT_WINDOW_CAPACITY,
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "alw-monitor";

/// Default polling cadence. Tuned so that a full deployment (regions x
/// brackets on one API key) stays well under the remote quota; one request
/// per five seconds per instance is 0.2 rps.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Default ceiling on simultaneously in-flight fetches per instance.
pub const DEFAULT_CONCURRENCY_CEILING: usize = 5;

/// Per-instance identity and credentials for the remote ranking service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSettings {
    pub credential: String,
    pub region: String,
    pub bracket: String,
    pub locale: String,
}

impl InstanceSettings {
    /// Stable label used in logs, analytics events, and the status surface.
    pub fn label(&self) -> String {
        format!("{}/{}", self.region, self.bracket)
    }
}

/// Everything a `Monitor` needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub settings: InstanceSettings,
    pub tick_interval: Duration,
    pub concurrency_ceiling: usize,
    pub history_capacity: usize,
    pub top_n: Option<usize>,
}

impl MonitorConfig {
    pub fn new(settings: InstanceSettings) -> Self {
        Self {
            settings,
            tick_interval: DEFAULT_TICK_INTERVAL,
            concurrency_ceiling: DEFAULT_CONCURRENCY_CEILING,
            history_capacity: DEFAULT_WINDOW_CAPACITY,
            top_n: Some(DEFAULT_TOP_N),
        }
    }
}

/// Opaque identifier handed back by [`SnapshotStore::save`] and forwarded
/// verbatim to the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote service returned status {0}")]
    Status(u16),
    #[error("undecodable ladder payload: {0}")]
    Decode(String),
}

/// The injected fetch operation. Implementations must resolve exactly once
/// per call (impose their own timeout); a fetch that never completes would
/// permanently occupy one concurrency slot.
#[async_trait]
pub trait LadderFetcher: Send + Sync {
    async fn fetch(&self, settings: &InstanceSettings) -> Result<RawLadder, FetchError>;
}

/// Durable snapshot storage. `load_latest` is called once at startup to
/// seed the dedup baseline; `save` once per unique update.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn load_latest(&self) -> anyhow::Result<Option<LadderSnapshot>>;
    async fn save(&self, snapshot: &LadderSnapshot) -> anyhow::Result<SnapshotId>;
}

/// Fire-and-forget analytics sink; nothing in the core consumes a return
/// value from it.
pub trait Analytics: Send + Sync {
    fn record(&self, instance: &str, event: AnalyticsEvent);
}

/// Outbound change notification, called once per unique update with the id
/// returned by storage.
#[async_trait]
pub trait UpdateNotifier: Send + Sync {
    async fn publish(&self, id: &SnapshotId) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalyticsEvent {
    RequestIssued,
    TickSkipped { in_flight: usize },
    FetchSucceeded { elapsed: Duration },
    FetchFailed { elapsed: Duration, error: String },
    EntriesFetched { count: usize },
    RequestRate { per_second: f64 },
    UniqueUpdate { rank_count: usize },
    UniqueUpdateRate { per_second: f64 },
    MalformedPayload { error: String },
    PersistFailed { error: String },
}

/// Process-lifetime counters for one (region, bracket) instance. Owned by
/// the Monitor, shared read-only with the status surface; never shared
/// across instances.
#[derive(Debug)]
pub struct RunState {
    started_at: Instant,
    started_at_utc: DateTime<Utc>,
    concurrency_ceiling: usize,
    requests_issued: AtomicU64,
    requests_served: AtomicU64,
    unique_updates: AtomicU64,
    ticks_skipped: AtomicU64,
    in_flight: AtomicUsize,
}

impl RunState {
    pub fn new(concurrency_ceiling: usize) -> Self {
        Self {
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            concurrency_ceiling,
            requests_issued: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            unique_updates: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
        }
    }

    fn record_request_issued(&self) {
        self.requests_issued.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completion(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    fn record_unique_update(&self) {
        self.unique_updates.fetch_add(1, Ordering::Relaxed);
    }

    fn record_tick_skipped(&self) {
        self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_issued(&self) -> u64 {
        self.requests_issued.load(Ordering::Relaxed)
    }

    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    pub fn unique_updates(&self) -> u64 {
        self.unique_updates.load(Ordering::Relaxed)
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.ticks_skipped.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Served requests per second of wall time since the monitor started.
    pub fn requests_per_second(&self) -> f64 {
        per_second(self.requests_served(), self.started_at.elapsed())
    }

    pub fn unique_updates_per_second(&self) -> f64 {
        per_second(self.unique_updates(), self.started_at.elapsed())
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            started_at: self.started_at_utc,
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            concurrency_ceiling: self.concurrency_ceiling,
            requests_issued: self.requests_issued(),
            requests_served: self.requests_served(),
            unique_updates: self.unique_updates(),
            ticks_skipped: self.ticks_skipped(),
            in_flight: self.in_flight(),
            requests_per_second: self.requests_per_second(),
            unique_updates_per_second: self.unique_updates_per_second(),
        }
    }
}

fn per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= f64::EPSILON {
        return 0.0;
    }
    count as f64 / secs
}

/// Serializable view of [`RunState`] for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: f64,
    pub concurrency_ceiling: usize,
    pub requests_issued: u64,
    pub requests_served: u64,
    pub unique_updates: u64,
    pub ticks_skipped: u64,
    pub in_flight: usize,
    pub requests_per_second: f64,
    pub unique_updates_per_second: f64,
}

/// What one successful fetch turned into, mostly for tests and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// First observation into an empty window; seeded, not reported.
    Baseline,
    Duplicate,
    /// Persisted and published under the returned id.
    Unique(SnapshotId),
    /// Payload failed normalization; recorded and dropped.
    DiscardedMalformed,
    /// Novel roster whose `save` failed; no notification was published.
    LostPersistFailure,
}

/// Single-consumer orchestration of normalize -> dedup -> persist -> notify.
/// Exclusively owns the history window.
pub struct UpdatePipeline {
    label: String,
    window: HistoryWindow,
    top_n: Option<usize>,
    store: Arc<dyn SnapshotStore>,
    analytics: Arc<dyn Analytics>,
    notifier: Arc<dyn UpdateNotifier>,
    state: Arc<RunState>,
}

impl UpdatePipeline {
    pub fn new(
        config: &MonitorConfig,
        store: Arc<dyn SnapshotStore>,
        analytics: Arc<dyn Analytics>,
        notifier: Arc<dyn UpdateNotifier>,
        state: Arc<RunState>,
    ) -> Self {
        Self {
            label: config.settings.label(),
            window: HistoryWindow::new(config.history_capacity),
            top_n: config.top_n,
            store,
            analytics,
            notifier,
            state,
        }
    }

    /// Seed the dedup baseline from the last persisted snapshot, if any.
    pub async fn seed_from_store(&mut self) -> anyhow::Result<()> {
        let latest = self
            .store
            .load_latest()
            .await
            .context("loading latest persisted snapshot")?;
        if let Some(snapshot) = latest {
            info!(
                instance = %self.label,
                rank_count = snapshot.rank_count,
                "seeded dedup baseline from persisted snapshot"
            );
            self.window.seed(snapshot);
        }
        Ok(())
    }

    pub async fn on_fetch_success(&mut self, raw: RawLadder) -> PipelineOutcome {
        self.analytics.record(
            &self.label,
            AnalyticsEvent::EntriesFetched {
                count: raw.rows.len(),
            },
        );

        let snapshot = match normalize_at(raw, self.top_n, Utc::now()) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(instance = %self.label, error = %err, "dropping malformed ladder payload");
                self.analytics.record(
                    &self.label,
                    AnalyticsEvent::MalformedPayload {
                        error: err.to_string(),
                    },
                );
                return PipelineOutcome::DiscardedMalformed;
            }
        };

        match self.window.observe(&snapshot) {
            Observation::Baseline => {
                info!(
                    instance = %self.label,
                    rank_count = snapshot.rank_count,
                    "first observation; established dedup baseline"
                );
                PipelineOutcome::Baseline
            }
            Observation::Duplicate => {
                debug!(instance = %self.label, "duplicate snapshot; no update");
                PipelineOutcome::Duplicate
            }
            Observation::Novel => self.handle_novel(snapshot).await,
        }
    }

    async fn handle_novel(&mut self, snapshot: LadderSnapshot) -> PipelineOutcome {
        self.state.record_unique_update();
        self.analytics.record(
            &self.label,
            AnalyticsEvent::UniqueUpdate {
                rank_count: snapshot.rank_count,
            },
        );
        self.analytics.record(
            &self.label,
            AnalyticsEvent::UniqueUpdateRate {
                per_second: self.state.unique_updates_per_second(),
            },
        );

        match self.store.save(&snapshot).await {
            Ok(id) => {
                info!(
                    instance = %self.label,
                    snapshot_id = %id,
                    rank_count = snapshot.rank_count,
                    "unique ladder update persisted"
                );
                if let Err(err) = self.notifier.publish(&id).await {
                    warn!(instance = %self.label, snapshot_id = %id, error = %err, "notify failed");
                }
                PipelineOutcome::Unique(id)
            }
            Err(err) => {
                // Without a persisted id there is nothing to publish; the
                // update is lost for this cycle.
                warn!(instance = %self.label, error = %err, "persisting unique update failed");
                self.analytics.record(
                    &self.label,
                    AnalyticsEvent::PersistFailed {
                        error: err.to_string(),
                    },
                );
                PipelineOutcome::LostPersistFailure
            }
        }
    }
}

/// Fixed-cadence tick handler with a hard in-flight ceiling. Ticks are
/// never queued: at the ceiling a tick is skipped outright, so a degraded
/// remote cannot build a backlog.
pub struct FetchScheduler {
    settings: InstanceSettings,
    label: String,
    fetcher: Arc<dyn LadderFetcher>,
    analytics: Arc<dyn Analytics>,
    state: Arc<RunState>,
    permits: Arc<Semaphore>,
    completed: mpsc::Sender<RawLadder>,
}

impl FetchScheduler {
    pub fn new(
        config: &MonitorConfig,
        fetcher: Arc<dyn LadderFetcher>,
        analytics: Arc<dyn Analytics>,
        state: Arc<RunState>,
        completed: mpsc::Sender<RawLadder>,
    ) -> Self {
        Self {
            settings: config.settings.clone(),
            label: config.settings.label(),
            fetcher,
            analytics,
            state,
            permits: Arc::new(Semaphore::new(config.concurrency_ceiling.max(1))),
            completed,
        }
    }

    /// One timer tick: report the running request rate, then either admit a
    /// fetch (under the ceiling) or skip.
    pub fn on_tick(&self) {
        self.analytics.record(
            &self.label,
            AnalyticsEvent::RequestRate {
                per_second: self.state.requests_per_second(),
            },
        );

        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.state.record_tick_skipped();
                let in_flight = self.state.in_flight();
                debug!(instance = %self.label, in_flight, "at concurrency ceiling; tick skipped");
                self.analytics
                    .record(&self.label, AnalyticsEvent::TickSkipped { in_flight });
                return;
            }
        };

        self.state.record_request_issued();
        self.analytics.record(&self.label, AnalyticsEvent::RequestIssued);

        let settings = self.settings.clone();
        let label = self.label.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let analytics = Arc::clone(&self.analytics);
        let state = Arc::clone(&self.state);
        let completed = self.completed.clone();

        tokio::spawn(async move {
            let issued_at = Instant::now();
            let result = fetcher.fetch(&settings).await;
            let elapsed = issued_at.elapsed();
            state.record_completion();
            drop(permit);

            match result {
                Ok(raw) => {
                    state.record_request_served();
                    analytics.record(&label, AnalyticsEvent::FetchSucceeded { elapsed });
                    if completed.send(raw).await.is_err() {
                        debug!(instance = %label, "pipeline closed; fetched ladder dropped");
                    }
                }
                Err(err) => {
                    // Not escalated: the next tick issues a fresh request.
                    warn!(instance = %label, error = %err, ?elapsed, "ladder fetch failed");
                    analytics.record(
                        &label,
                        AnalyticsEvent::FetchFailed {
                            elapsed,
                            error: err.to_string(),
                        },
                    );
                }
            }
        });
    }
}

/// Composition root for one (region, bracket) instance.
pub struct Monitor {
    config: MonitorConfig,
    fetcher: Arc<dyn LadderFetcher>,
    store: Arc<dyn SnapshotStore>,
    analytics: Arc<dyn Analytics>,
    notifier: Arc<dyn UpdateNotifier>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        fetcher: Arc<dyn LadderFetcher>,
        store: Arc<dyn SnapshotStore>,
        analytics: Arc<dyn Analytics>,
        notifier: Arc<dyn UpdateNotifier>,
    ) -> Self {
        Self {
            config,
            fetcher,
            store,
            analytics,
            notifier,
        }
    }

    /// Seed the baseline, then spawn the pipeline consumer and the tick
    /// loop. Runs until [`MonitorHandle::stop`] is called.
    pub async fn start(self) -> anyhow::Result<MonitorHandle> {
        let label = self.config.settings.label();
        let state = Arc::new(RunState::new(self.config.concurrency_ceiling));

        let mut pipeline = UpdatePipeline::new(
            &self.config,
            Arc::clone(&self.store),
            Arc::clone(&self.analytics),
            Arc::clone(&self.notifier),
            Arc::clone(&state),
        );
        pipeline
            .seed_from_store()
            .await
            .with_context(|| format!("seeding dedup baseline for {label}"))?;

        let (completed_tx, mut completed_rx) =
            mpsc::channel::<RawLadder>(self.config.concurrency_ceiling.max(1) * 2);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let pipeline_task = tokio::spawn(async move {
            while let Some(raw) = completed_rx.recv().await {
                pipeline.on_fetch_success(raw).await;
            }
        });

        let scheduler = FetchScheduler::new(
            &self.config,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.analytics),
            Arc::clone(&state),
            completed_tx,
        );
        let tick_interval = self.config.tick_interval;
        let scheduler_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            // Ticks are never buffered; a stalled loop drops them.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => scheduler.on_tick(),
                }
            }
            // Dropping the scheduler here releases its channel sender; the
            // pipeline drains outstanding completions and exits.
        });

        info!(
            instance = %label,
            tick_interval_ms = tick_interval.as_millis() as u64,
            ceiling = self.config.concurrency_ceiling,
            "monitor started"
        );

        Ok(MonitorHandle {
            label,
            state,
            shutdown: shutdown_tx,
            scheduler_task,
            pipeline_task,
        })
    }
}

/// Running monitor instance: exposes its counters and an orderly shutdown.
pub struct MonitorHandle {
    label: String,
    state: Arc<RunState>,
    shutdown: watch::Sender<bool>,
    scheduler_task: JoinHandle<()>,
    pipeline_task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> Arc<RunState> {
        Arc::clone(&self.state)
    }

    pub async fn stop(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        self.scheduler_task
            .await
            .context("joining scheduler task")?;
        self.pipeline_task.await.context("joining pipeline task")?;
        info!(instance = %self.label, "monitor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alw_core::RawLadderRow;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn settings() -> InstanceSettings {
        InstanceSettings {
            credential: "test-key".into(),
            region: "eu".into(),
            bracket: "3v3".into(),
            locale: "en_GB".into(),
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig::new(settings())
    }

    fn raw_of(players: &[(&str, i32)]) -> RawLadder {
        RawLadder {
            rows: players
                .iter()
                .map(|(name, rating)| RawLadderRow {
                    name: name.to_string(),
                    realm: "realm".into(),
                    rating: *rating,
                    season_wins: 1,
                    season_losses: 1,
                    weekly_wins: 0,
                    weekly_losses: 0,
                    ranking: None,
                })
                .collect(),
        }
    }

    fn snapshot_of(players: &[(&str, i32)]) -> LadderSnapshot {
        normalize_at(raw_of(players), None, Utc::now()).unwrap()
    }

    struct NeverCompletingFetcher;

    #[async_trait]
    impl LadderFetcher for NeverCompletingFetcher {
        async fn fetch(&self, _settings: &InstanceSettings) -> Result<RawLadder, FetchError> {
            std::future::pending::<()>().await;
            unreachable!("pending future never resolves")
        }
    }

    struct ScriptedFetcher {
        responses: Mutex<VecDeque<Result<RawLadder, FetchError>>>,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<RawLadder, FetchError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
            }
        }
    }

    #[async_trait]
    impl LadderFetcher for ScriptedFetcher {
        async fn fetch(&self, _settings: &InstanceSettings) -> Result<RawLadder, FetchError> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::Transport("script exhausted".into())))
        }
    }

    #[derive(Default)]
    struct RecordingStore {
        latest: Option<LadderSnapshot>,
        fail_save: bool,
        saves: Mutex<Vec<LadderSnapshot>>,
    }

    impl RecordingStore {
        fn with_latest(latest: LadderSnapshot) -> Self {
            Self {
                latest: Some(latest),
                ..Self::default()
            }
        }

        fn save_count(&self) -> usize {
            self.saves.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SnapshotStore for RecordingStore {
        async fn load_latest(&self) -> anyhow::Result<Option<LadderSnapshot>> {
            Ok(self.latest.clone())
        }

        async fn save(&self, snapshot: &LadderSnapshot) -> anyhow::Result<SnapshotId> {
            if self.fail_save {
                anyhow::bail!("simulated storage outage");
            }
            let mut saves = self.saves.lock().unwrap();
            saves.push(snapshot.clone());
            Ok(SnapshotId(format!("snap-{}", saves.len())))
        }
    }

    #[derive(Default)]
    struct RecordingAnalytics {
        events: Mutex<Vec<AnalyticsEvent>>,
    }

    impl RecordingAnalytics {
        fn count_of(&self, matcher: impl Fn(&AnalyticsEvent) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| matcher(e)).count()
        }
    }

    impl Analytics for RecordingAnalytics {
        fn record(&self, _instance: &str, event: AnalyticsEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        published: Mutex<Vec<SnapshotId>>,
    }

    #[async_trait]
    impl UpdateNotifier for RecordingNotifier {
        async fn publish(&self, id: &SnapshotId) -> anyhow::Result<()> {
            self.published.lock().unwrap().push(id.clone());
            Ok(())
        }
    }

    fn pipeline_with(
        store: Arc<RecordingStore>,
        analytics: Arc<RecordingAnalytics>,
        notifier: Arc<RecordingNotifier>,
    ) -> UpdatePipeline {
        let state = Arc::new(RunState::new(DEFAULT_CONCURRENCY_CEILING));
        UpdatePipeline::new(&config(), store, analytics, notifier, state)
    }

    #[tokio::test]
    async fn ceiling_of_two_skips_the_third_tick() {
        let mut cfg = config();
        cfg.concurrency_ceiling = 2;
        let state = Arc::new(RunState::new(cfg.concurrency_ceiling));
        let analytics = Arc::new(RecordingAnalytics::default());
        let (tx, _rx) = mpsc::channel(8);
        let scheduler = FetchScheduler::new(
            &cfg,
            Arc::new(NeverCompletingFetcher),
            Arc::clone(&analytics) as Arc<dyn Analytics>,
            Arc::clone(&state),
            tx,
        );

        scheduler.on_tick();
        scheduler.on_tick();
        scheduler.on_tick();

        assert_eq!(state.requests_issued(), 2);
        assert_eq!(state.ticks_skipped(), 1);
        assert_eq!(state.in_flight(), 2);
        assert_eq!(
            analytics.count_of(|e| matches!(e, AnalyticsEvent::TickSkipped { .. })),
            1
        );
        assert_eq!(
            analytics.count_of(|e| matches!(e, AnalyticsEvent::RequestIssued)),
            2
        );
    }

    #[tokio::test]
    async fn seeded_baseline_dedups_first_fetch_then_accepts_a_real_change() {
        let s0 = snapshot_of(&[("alpha", 2400), ("beta", 2300)]);
        let store = Arc::new(RecordingStore::with_latest(s0));
        let analytics = Arc::new(RecordingAnalytics::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut pipeline = pipeline_with(
            Arc::clone(&store),
            Arc::clone(&analytics),
            Arc::clone(&notifier),
        );
        pipeline.seed_from_store().await.unwrap();

        // Remote returns the same standings it returned before restart.
        let outcome = pipeline
            .on_fetch_success(raw_of(&[("alpha", 2400), ("beta", 2300)]))
            .await;
        assert_eq!(outcome, PipelineOutcome::Duplicate);
        assert_eq!(store.save_count(), 0);
        assert_eq!(
            analytics.count_of(|e| matches!(e, AnalyticsEvent::UniqueUpdate { .. })),
            0
        );

        // One identity-order change: exactly one save and one publish of
        // storage's id.
        let outcome = pipeline
            .on_fetch_success(raw_of(&[("beta", 2450), ("alpha", 2400)]))
            .await;
        let id = match outcome {
            PipelineOutcome::Unique(id) => id,
            other => panic!("expected unique outcome, got {other:?}"),
        };
        assert_eq!(store.save_count(), 1);
        assert_eq!(*notifier.published.lock().unwrap(), vec![id]);
        assert_eq!(
            analytics.count_of(|e| matches!(e, AnalyticsEvent::UniqueUpdate { .. })),
            1
        );
    }

    #[tokio::test]
    async fn empty_store_makes_first_fetch_the_baseline_without_persisting() {
        let store = Arc::new(RecordingStore::default());
        let analytics = Arc::new(RecordingAnalytics::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut pipeline = pipeline_with(
            Arc::clone(&store),
            Arc::clone(&analytics),
            Arc::clone(&notifier),
        );
        pipeline.seed_from_store().await.unwrap();

        let outcome = pipeline.on_fetch_success(raw_of(&[("alpha", 2400)])).await;
        assert_eq!(outcome, PipelineOutcome::Baseline);
        assert_eq!(store.save_count(), 0);
        assert!(notifier.published.lock().unwrap().is_empty());

        // The baseline now dedups repeats.
        let outcome = pipeline.on_fetch_success(raw_of(&[("alpha", 2410)])).await;
        assert_eq!(outcome, PipelineOutcome::Duplicate);
    }

    #[tokio::test]
    async fn malformed_payload_is_recorded_and_dropped() {
        let store = Arc::new(RecordingStore::default());
        let analytics = Arc::new(RecordingAnalytics::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut pipeline = pipeline_with(
            Arc::clone(&store),
            Arc::clone(&analytics),
            Arc::clone(&notifier),
        );

        let outcome = pipeline.on_fetch_success(raw_of(&[])).await;
        assert_eq!(outcome, PipelineOutcome::DiscardedMalformed);
        assert_eq!(store.save_count(), 0);
        assert_eq!(
            analytics.count_of(|e| matches!(e, AnalyticsEvent::MalformedPayload { .. })),
            1
        );

        // Nothing was admitted: the next good payload is still the baseline.
        let outcome = pipeline.on_fetch_success(raw_of(&[("alpha", 2400)])).await;
        assert_eq!(outcome, PipelineOutcome::Baseline);
    }

    #[tokio::test]
    async fn save_failure_suppresses_notification() {
        let store = Arc::new(RecordingStore {
            fail_save: true,
            ..RecordingStore::default()
        });
        let analytics = Arc::new(RecordingAnalytics::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut pipeline = pipeline_with(
            Arc::clone(&store),
            Arc::clone(&analytics),
            Arc::clone(&notifier),
        );

        pipeline.on_fetch_success(raw_of(&[("alpha", 2400)])).await;
        let outcome = pipeline
            .on_fetch_success(raw_of(&[("beta", 2500), ("alpha", 2400)]))
            .await;

        assert_eq!(outcome, PipelineOutcome::LostPersistFailure);
        assert!(notifier.published.lock().unwrap().is_empty());
        assert_eq!(
            analytics.count_of(|e| matches!(e, AnalyticsEvent::PersistFailed { .. })),
            1
        );
    }

    #[tokio::test]
    async fn fetch_failures_are_reported_and_not_forwarded() {
        let mut cfg = config();
        cfg.concurrency_ceiling = 1;
        let state = Arc::new(RunState::new(cfg.concurrency_ceiling));
        let analytics = Arc::new(RecordingAnalytics::default());
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = FetchScheduler::new(
            &cfg,
            Arc::new(ScriptedFetcher::new(vec![Err(FetchError::Status(503))])),
            Arc::clone(&analytics) as Arc<dyn Analytics>,
            Arc::clone(&state),
            tx,
        );

        scheduler.on_tick();
        drop(scheduler);
        assert!(rx.recv().await.is_none());

        assert_eq!(state.requests_issued(), 1);
        assert_eq!(state.requests_served(), 0);
        assert_eq!(state.in_flight(), 0);
        assert_eq!(
            analytics.count_of(|e| matches!(e, AnalyticsEvent::FetchFailed { .. })),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_end_to_end_persists_only_novel_snapshots() {
        let responses = vec![
            Ok(raw_of(&[("alpha", 2400), ("beta", 2300)])),
            Ok(raw_of(&[("alpha", 2410), ("beta", 2310)])), // same order: duplicate
            Ok(raw_of(&[("beta", 2500), ("alpha", 2400)])), // swap: unique
        ];
        let mut cfg = config();
        cfg.tick_interval = Duration::from_millis(100);
        let store = Arc::new(RecordingStore::default());
        let analytics = Arc::new(RecordingAnalytics::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let handle = Monitor::new(
            cfg,
            Arc::new(ScriptedFetcher::new(responses)),
            Arc::clone(&store) as Arc<dyn SnapshotStore>,
            Arc::clone(&analytics) as Arc<dyn Analytics>,
            Arc::clone(&notifier) as Arc<dyn UpdateNotifier>,
        )
        .start()
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        let state = handle.state();
        handle.stop().await.unwrap();

        assert!(state.requests_issued() >= 3);
        assert_eq!(state.unique_updates(), 1);
        assert_eq!(store.save_count(), 1);
        assert_eq!(notifier.published.lock().unwrap().len(), 1);
    }
}
