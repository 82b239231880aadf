// Telemetry orchestrator - per-view poll, fetch, validate, retry, merge, publish
use crate::application::polling_clock::{FirstTick, PollHandle, PollingClock};
use crate::application::retry_scheduler::{
    RequestKey, RequestSequencer, RequestTicket, RetryPolicy, run_with_retry,
};
use crate::application::telemetry_provider::{FetchRequest, TelemetryProvider};
use crate::domain::date_window::{DateWindow, RangeSelector, compute_window};
use crate::domain::error::TelemetryError;
use crate::domain::export::ColumnMapping;
use crate::domain::merger::{UnitScales, merge_scaled};
use crate::domain::telemetry::{MergedRecord, SeriesType, ViewIdentity};
use crate::domain::validation::{ValidationPolicy, assess};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct ViewSettings {
    pub name: String,
    pub series_type: SeriesType,
    pub expected_series: Vec<String>,
    pub selector: RangeSelector,
    pub poll_interval: Duration,
    pub first_tick: FirstTick,
    pub retry: RetryPolicy,
    pub validation: ValidationPolicy,
    pub scales: UnitScales,
    /// Columns for CSV export; empty exports every series by name.
    pub export_columns: Vec<ColumnMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewStatus {
    Idle,
    Loading,
    Valid,
    Empty,
    Error,
}

/// What the rendering layer sees for one view.
#[derive(Debug, Clone, Serialize)]
pub struct ViewSnapshot {
    pub view: String,
    pub status: ViewStatus,
    pub records: Vec<MergedRecord>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub window: Option<DateWindow>,
    pub error: Option<String>,
    /// Sequence number of the request that produced this state.
    pub sequence: u64,
}

impl ViewSnapshot {
    fn idle(view: &str) -> Self {
        Self {
            view: view.to_string(),
            status: ViewStatus::Idle,
            records: Vec::new(),
            last_updated_at: None,
            window: None,
            error: None,
            sequence: 0,
        }
    }
}

struct Inner {
    settings: ViewSettings,
    provider: Arc<dyn TelemetryProvider>,
    sequencer: RequestSequencer,
    identity: Mutex<Option<ViewIdentity>>,
    clock: Mutex<Option<PollHandle>>,
    state: watch::Sender<ViewSnapshot>,
    /// Bumped on every identity change, under the `identity` lock.
    generation: AtomicU64,
    /// Refresh slot held by a tick or a manual retry: `generation + 1` of the
    /// holder, 0 when free.
    claim: AtomicU64,
}

/// Owns one view's poll cycle and publishes its state through a watch
/// channel. Cloning shares the same view.
#[derive(Clone)]
pub struct TelemetryOrchestrator {
    inner: Arc<Inner>,
}

impl TelemetryOrchestrator {
    pub fn new(settings: ViewSettings, provider: Arc<dyn TelemetryProvider>) -> Self {
        let (state, _) = watch::channel(ViewSnapshot::idle(&settings.name));
        Self {
            inner: Arc::new(Inner {
                settings,
                provider,
                sequencer: RequestSequencer::new(),
                identity: Mutex::new(None),
                clock: Mutex::new(None),
                state,
                generation: AtomicU64::new(0),
                claim: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn settings(&self) -> &ViewSettings {
        &self.inner.settings
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|clock| !clock.is_stopped())
    }

    /// Begin polling as `identity`, tearing down any previous cycle.
    pub fn start(&self, identity: ViewIdentity) {
        tracing::info!(
            view = %self.name(),
            entity = %identity.entity_id,
            "starting poll cycle"
        );
        self.inner.replace_identity(identity);
        self.restart_cycle();
    }

    /// Switch entity or token. Returns `false` when nothing changed.
    ///
    /// Any chain still in flight for the old identity is discarded when it
    /// resolves.
    pub fn set_identity(&self, identity: ViewIdentity) -> bool {
        {
            let mut current = self
                .inner
                .identity
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.as_ref() == Some(&identity) {
                return false;
            }
            tracing::info!(
                view = %self.name(),
                entity = %identity.entity_id,
                "identity changed, restarting poll cycle"
            );
            *current = Some(identity);
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            self.inner.sequencer.invalidate_all();
        }
        self.restart_cycle();
        true
    }

    /// Manual retry affordance. Ignored while a refresh is already running.
    /// The clock stays paused until the retry resolves.
    pub fn retry(&self) -> bool {
        let Some(claim) = self.inner.try_claim() else {
            tracing::debug!(view = %self.name(), "retry ignored, refresh in flight");
            return false;
        };
        let control = self
            .inner
            .clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(PollHandle::control);
        if let Some(control) = &control {
            control.pause();
        }

        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.refresh().await;
            inner.release(claim);
            if let Some(control) = control {
                control.resume();
            }
        });
        true
    }

    /// Run one fetch/validate/merge cycle. Returns the committed status, or
    /// `None` when the result was superseded and dropped.
    pub async fn refresh(&self) -> Option<ViewStatus> {
        self.inner.refresh().await
    }

    /// Idempotent. Results of refreshes still in flight are discarded.
    pub fn stop(&self) {
        let clock = self
            .inner
            .clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.inner.sequencer.invalidate_all();
        if let Some(clock) = clock {
            clock.stop();
            tracing::info!(view = %self.name(), "poll cycle stopped");
        }
    }

    fn restart_cycle(&self) {
        self.stop();
        let view = self.inner.settings.name.clone();
        self.inner.state.send_replace(ViewSnapshot::idle(&view));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let clock = PollingClock::start(
            self.inner.settings.poll_interval,
            self.inner.settings.first_tick,
            move |control| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let Some(claim) = inner.try_claim() else {
                    tracing::debug!(view = %inner.settings.name, "tick skipped, refresh in flight");
                    return;
                };
                control.pause();
                let control = control.clone();
                tokio::spawn(async move {
                    inner.refresh().await;
                    inner.release(claim);
                    control.resume();
                });
            },
        );
        *self
            .inner
            .clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(clock);
    }
}

impl Inner {
    fn replace_identity(&self, identity: ViewIdentity) {
        let mut current = self
            .identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Some(identity);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.sequencer.invalidate_all();
    }

    /// Identity and ticket are taken under the same lock an identity change
    /// holds, so a ticket always belongs to the identity it was issued for.
    fn begin_request(&self) -> Option<(ViewIdentity, RequestTicket, u64)> {
        let current = self
            .identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let identity = current.as_ref()?.clone();
        let generation = self.generation.load(Ordering::SeqCst);
        let ticket = self.sequencer.begin(RequestKey {
            entity_id: identity.entity_id.clone(),
            range: self.settings.selector.label(),
            series_type: self.settings.series_type,
        });
        Some((identity, ticket, generation))
    }

    fn is_current(&self, ticket: &RequestTicket, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation && self.sequencer.is_current(ticket)
    }

    /// Take the refresh slot for the current identity. A slot still held by
    /// a chain from an earlier identity is taken over.
    fn try_claim(&self) -> Option<u64> {
        let token = self.generation.load(Ordering::SeqCst) + 1;
        let mut held = self.claim.load(Ordering::SeqCst);
        loop {
            if held == token {
                return None;
            }
            match self
                .claim
                .compare_exchange(held, token, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Some(token),
                Err(actual) => held = actual,
            }
        }
    }

    fn release(&self, token: u64) {
        let _ = self
            .claim
            .compare_exchange(token, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    async fn refresh(&self) -> Option<ViewStatus> {
        let Some((identity, ticket, generation)) = self.begin_request() else {
            tracing::debug!(view = %self.settings.name, "no identity yet, skipping refresh");
            return None;
        };
        self.refresh_as(identity, ticket, generation).await
    }

    async fn refresh_as(
        &self,
        identity: ViewIdentity,
        ticket: RequestTicket,
        generation: u64,
    ) -> Option<ViewStatus> {
        let settings = &self.settings;
        let is_current = || self.is_current(&ticket, generation);

        let window = match compute_window(settings.selector, Utc::now()) {
            Ok(window) => window,
            Err(e) => {
                tracing::error!(view = %settings.name, error = %e, "cannot compute window");
                return self.commit(ticket.sequence, is_current, |s| {
                    s.status = ViewStatus::Error;
                    s.error = Some(e.to_string());
                });
            }
        };

        self.commit(ticket.sequence, is_current, |s| {
            s.status = ViewStatus::Loading;
            s.window = Some(window);
        });

        let request = FetchRequest::new(identity, settings.series_type, &window);
        let result = run_with_retry(
            |_| self.provider.fetch_telemetry(&request),
            |payload| {
                let assessment = assess(payload, &settings.expected_series);
                if assessment.all_zero {
                    tracing::debug!(view = %settings.name, "all present series are zero");
                }
                if !assessment.missing.is_empty() {
                    tracing::debug!(
                        view = %settings.name,
                        missing = ?assessment.missing,
                        "expected series missing from payload"
                    );
                }
                assessment.is_usable(settings.validation)
            },
            &settings.retry,
        )
        .await;

        match result {
            Ok(outcome) if !outcome.exhausted => {
                let records = merge_scaled(&outcome.data.unwrap_or_default(), &settings.scales);
                self.commit(ticket.sequence, is_current, |s| {
                    tracing::info!(
                        view = %s.view,
                        records = records.len(),
                        attempts = outcome.attempts,
                        "telemetry refreshed"
                    );
                    s.status = ViewStatus::Valid;
                    s.records = records;
                    s.last_updated_at = Some(Utc::now());
                    s.error = None;
                })
            }
            Ok(outcome) => {
                tracing::warn!(
                    view = %settings.name,
                    attempts = outcome.attempts,
                    "no usable telemetry after retries"
                );
                self.commit(ticket.sequence, is_current, |s| {
                    s.status = ViewStatus::Empty;
                    s.records.clear();
                    s.error = None;
                })
            }
            Err(e) => {
                tracing::error!(view = %settings.name, error = %e, "telemetry fetch failed");
                self.commit(ticket.sequence, is_current, |s| {
                    s.status = ViewStatus::Error;
                    s.error = Some(e.to_string());
                })
            }
        }
    }

    /// Apply `update` unless the request was superseded. The currency check
    /// runs under the channel's write lock so it cannot interleave with an
    /// identity reset.
    fn commit<C, U>(&self, sequence: u64, is_current: C, update: U) -> Option<ViewStatus>
    where
        C: Fn() -> bool,
        U: FnOnce(&mut ViewSnapshot),
    {
        let mut committed = None;
        let mut update = Some(update);
        self.state.send_if_modified(|snapshot| {
            if !is_current() {
                return false;
            }
            if let Some(update) = update.take() {
                update(snapshot);
            }
            snapshot.sequence = sequence;
            committed = Some(snapshot.status);
            true
        });

        if committed.is_none() {
            tracing::info!(
                view = %self.settings.name,
                sequence,
                "discarding result of superseded request"
            );
        }
        committed
    }
}

/// All configured views, by name.
#[derive(Clone, Default)]
pub struct OrchestratorRegistry {
    views: BTreeMap<String, TelemetryOrchestrator>,
}

impl OrchestratorRegistry {
    pub fn new(views: Vec<TelemetryOrchestrator>) -> Self {
        Self {
            views: views
                .into_iter()
                .map(|view| (view.name().to_string(), view))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&TelemetryOrchestrator, TelemetryError> {
        self.views
            .get(name)
            .ok_or_else(|| TelemetryError::UnknownView(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TelemetryOrchestrator> {
        self.views.values()
    }

    pub fn start_all(&self, identity: &ViewIdentity) {
        for view in self.iter() {
            view.start(identity.clone());
        }
    }

    /// Returns the number of views whose identity actually changed.
    pub fn set_identity_all(&self, identity: &ViewIdentity) -> usize {
        self.iter()
            .filter(|view| view.set_identity(identity.clone()))
            .count()
    }

    pub fn stop_all(&self) {
        for view in self.iter() {
            view.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::merger::KILO;
    use crate::domain::telemetry::{SeriesSet, TimePoint};
    use crate::domain::validation::is_usable;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use tokio::time::sleep;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn set(series: &[(&str, &[(i64, f64)])]) -> SeriesSet {
        series
            .iter()
            .map(|(name, points)| {
                (
                    name.to_string(),
                    points.iter().map(|(s, v)| TimePoint::new(t(*s), *v)).collect(),
                )
            })
            .collect()
    }

    fn settings(name: &str) -> ViewSettings {
        ViewSettings {
            name: name.to_string(),
            series_type: SeriesType::EnergyHistory,
            expected_series: vec!["consumption".into(), "solarProduction".into()],
            selector: RangeSelector::Today,
            poll_interval: Duration::from_secs(3600),
            first_tick: FirstTick::Immediate,
            retry: RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(50)),
            validation: ValidationPolicy::AllExpected,
            scales: UnitScales::new(),
            export_columns: Vec::new(),
        }
    }

    #[derive(Default)]
    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<SeriesSet, TelemetryError>>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<SeriesSet, TelemetryError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn push(&self, response: Result<SeriesSet, TelemetryError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TelemetryProvider for ScriptedProvider {
        async fn fetch_telemetry(&self, _request: &FetchRequest) -> Result<SeriesSet, TelemetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(SeriesSet::new()))
        }
    }

    /// Answers slowly for the "old" token or the "old-plant" entity and
    /// immediately otherwise.
    struct TokenProvider;

    #[async_trait]
    impl TelemetryProvider for TokenProvider {
        async fn fetch_telemetry(&self, request: &FetchRequest) -> Result<SeriesSet, TelemetryError> {
            if request.token() == "old" || request.entity_id() == "old-plant" {
                sleep(Duration::from_secs(10)).await;
                Ok(set(&[("consumption", &[(0, 1.0)]), ("solarProduction", &[(0, 1.0)])]))
            } else {
                Ok(set(&[("consumption", &[(0, 9.0)]), ("solarProduction", &[(0, 8.0)])]))
            }
        }
    }

    /// Takes 40s per fetch and records how many fetches overlap.
    #[derive(Default)]
    struct SlowProvider {
        calls: AtomicU32,
        active: AtomicU32,
        max_active: AtomicU32,
    }

    #[async_trait]
    impl TelemetryProvider for SlowProvider {
        async fn fetch_telemetry(&self, _request: &FetchRequest) -> Result<SeriesSet, TelemetryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            sleep(Duration::from_secs(40)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(set(&[("consumption", &[(0, 1.0)]), ("solarProduction", &[(0, 2.0)])]))
        }
    }

    fn orchestrator(provider: Arc<dyn TelemetryProvider>) -> TelemetryOrchestrator {
        let view = TelemetryOrchestrator::new(settings("energy"), provider);
        *view.inner.identity.lock().unwrap() = Some(ViewIdentity::new("plant-1", "token"));
        view
    }

    #[tokio::test(start_paused = true)]
    async fn test_day_scenario_retries_until_all_series_present() {
        let incomplete = set(&[("consumption", &[(0, 5.0), (900, 7.0)]), ("solarProduction", &[])]);
        let complete = set(&[("consumption", &[(0, 5.0), (900, 7.0)]), ("solarProduction", &[(0, 3.0)])]);
        let expected = ["consumption", "solarProduction"];
        let usable: Vec<bool> = [&incomplete, &incomplete, &complete]
            .iter()
            .map(|payload| is_usable(payload, &expected, ValidationPolicy::AllExpected))
            .collect();
        assert_eq!(usable, vec![false, false, true]);

        let provider = ScriptedProvider::new(vec![
            Ok(incomplete.clone()),
            Ok(incomplete),
            Ok(complete),
        ]);
        let view = orchestrator(provider.clone());

        assert_eq!(view.refresh().await, Some(ViewStatus::Valid));
        assert_eq!(provider.calls(), 3);

        let snapshot = view.snapshot();
        assert_eq!(snapshot.records.len(), 2);
        assert_eq!(snapshot.records[0].timestamp, t(0));
        assert_eq!(snapshot.records[0].value("consumption"), Some(5.0));
        assert_eq!(snapshot.records[0].value("solarProduction"), Some(3.0));
        assert_eq!(snapshot.records[1].timestamp, t(900));
        assert_eq!(snapshot.records[1].value("consumption"), Some(7.0));
        assert_eq!(snapshot.records[1].values.get("solarProduction"), Some(&None));
        assert!(snapshot.last_updated_at.is_some());
        assert!(snapshot.window.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_publishes_empty_not_error() {
        let provider = ScriptedProvider::new(vec![]);
        let view = orchestrator(provider.clone());

        assert_eq!(view.refresh().await, Some(ViewStatus::Empty));
        assert_eq!(provider.calls(), 3);
        let snapshot = view.snapshot();
        assert!(snapshot.records.is_empty());
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.last_updated_at, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_night_time_zero_values_are_not_retried() {
        let provider = ScriptedProvider::new(vec![Ok(set(&[
            ("consumption", &[(0, 400.0)]),
            ("solarProduction", &[(0, 0.0)]),
        ]))]);
        let mut view_settings = settings("energy");
        view_settings.scales.insert("consumption".into(), KILO);
        let view = TelemetryOrchestrator::new(view_settings, provider.clone());
        *view.inner.identity.lock().unwrap() = Some(ViewIdentity::new("plant-1", "token"));

        assert_eq!(view.refresh().await, Some(ViewStatus::Valid));
        assert_eq!(provider.calls(), 1);
        let records = view.snapshot().records;
        assert_eq!(records[0].value("consumption"), Some(0.4));
        assert_eq!(records[0].value("solarProduction"), Some(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_error_keeps_records_and_manual_retry_recovers() {
        let good = set(&[("consumption", &[(0, 1.0)]), ("solarProduction", &[(0, 2.0)])]);
        let provider = ScriptedProvider::new(vec![
            Ok(good.clone()),
            Err(TelemetryError::Auth { status: 401 }),
        ]);
        let view = orchestrator(provider.clone());

        assert_eq!(view.refresh().await, Some(ViewStatus::Valid));
        assert_eq!(view.refresh().await, Some(ViewStatus::Error));
        assert_eq!(provider.calls(), 2);

        let snapshot = view.snapshot();
        assert_eq!(snapshot.records.len(), 1);
        assert!(snapshot.error.unwrap().contains("401"));

        provider.push(Ok(good));
        let mut updates = view.subscribe();
        assert!(view.retry());
        updates
            .wait_for(|s| s.status == ViewStatus::Valid)
            .await
            .unwrap();
        assert_eq!(view.snapshot().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_range_fails_without_fetching() {
        let provider = ScriptedProvider::new(vec![]);
        let mut view_settings = settings("custom");
        view_settings.selector = RangeSelector::Custom { start: t(100), end: t(0) };
        let view = TelemetryOrchestrator::new(view_settings, provider.clone());
        *view.inner.identity.lock().unwrap() = Some(ViewIdentity::new("plant-1", "token"));

        assert_eq!(view.refresh().await, Some(ViewStatus::Error));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_change_discards_stale_chain() {
        let view = TelemetryOrchestrator::new(settings("energy"), Arc::new(TokenProvider));
        *view.inner.identity.lock().unwrap() = Some(ViewIdentity::new("plant-1", "old"));

        let stale_view = view.clone();
        let stale = tokio::spawn(async move { stale_view.refresh().await });
        sleep(Duration::from_secs(1)).await;
        assert_eq!(view.snapshot().status, ViewStatus::Loading);

        assert!(view.set_identity(ViewIdentity::new("plant-1", "new")));
        assert!(!view.set_identity(ViewIdentity::new("plant-1", "new")));

        assert_eq!(stale.await.unwrap(), None);
        let snapshot = view.snapshot();
        assert_eq!(snapshot.status, ViewStatus::Valid);
        assert_eq!(snapshot.records[0].value("consumption"), Some(9.0));
        assert_eq!(snapshot.records[0].value("solarProduction"), Some(8.0));
        view.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_entity_change_discards_stale_chain() {
        let view = TelemetryOrchestrator::new(settings("energy"), Arc::new(TokenProvider));
        *view.inner.identity.lock().unwrap() = Some(ViewIdentity::new("old-plant", "token"));

        let stale_view = view.clone();
        let stale = tokio::spawn(async move { stale_view.refresh().await });
        sleep(Duration::from_secs(1)).await;
        assert_eq!(view.snapshot().status, ViewStatus::Loading);

        assert!(view.set_identity(ViewIdentity::new("new-plant", "token")));

        assert_eq!(stale.await.unwrap(), None);
        let snapshot = view.snapshot();
        assert_eq!(snapshot.status, ViewStatus::Valid);
        assert_eq!(snapshot.records[0].value("consumption"), Some(9.0));
        view.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticket_issued_before_identity_change_cannot_commit() {
        let view = orchestrator(ScriptedProvider::new(vec![]));
        let (identity, ticket, generation) = view.inner.begin_request().unwrap();
        assert_eq!(identity.entity_id, "plant-1");
        assert!(view.inner.is_current(&ticket, generation));

        assert!(view.set_identity(ViewIdentity::new("plant-2", "token")));
        assert!(!view.inner.is_current(&ticket, generation));
        let committed = view.inner.commit(
            ticket.sequence,
            || view.inner.is_current(&ticket, generation),
            |s| s.status = ViewStatus::Valid,
        );
        assert_eq!(committed, None);
        view.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_refresh() {
        let view = TelemetryOrchestrator::new(settings("energy"), Arc::new(TokenProvider));
        *view.inner.identity.lock().unwrap() = Some(ViewIdentity::new("plant-1", "old"));

        let in_flight_view = view.clone();
        let in_flight = tokio::spawn(async move { in_flight_view.refresh().await });
        sleep(Duration::from_secs(1)).await;
        view.stop();

        assert_eq!(in_flight.await.unwrap(), None);
        let snapshot = view.snapshot();
        assert_ne!(snapshot.status, ViewStatus::Valid);
        assert!(snapshot.records.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_retry_holds_the_clock_until_done() {
        let provider = Arc::new(SlowProvider::default());
        let mut view_settings = settings("flow");
        view_settings.poll_interval = Duration::from_secs(30);
        view_settings.first_tick = FirstTick::AfterInterval;
        view_settings.retry = RetryPolicy::new(1, Duration::ZERO, Duration::ZERO);
        let view = TelemetryOrchestrator::new(view_settings, provider.clone());
        view.start(ViewIdentity::new("plant-1", "token"));

        sleep(Duration::from_secs(1)).await;
        assert!(view.retry());
        assert!(!view.retry());

        // The tick at 30s falls inside the retry and is dropped.
        sleep(Duration::from_secs(35)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.max_active.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(view.snapshot().status, ViewStatus::Valid);

        // Resumed after the retry, so the 60s tick fetches again.
        sleep(Duration::from_secs(20)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.max_active.load(Ordering::SeqCst), 1);
        view.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_drives_refresh_until_stopped() {
        let provider = ScriptedProvider::new(vec![Ok(set(&[
            ("consumption", &[(0, 1.0)]),
            ("solarProduction", &[(0, 2.0)]),
        ]))]);
        let mut view_settings = settings("flow");
        view_settings.poll_interval = Duration::from_secs(30);
        view_settings.retry = RetryPolicy::new(1, Duration::ZERO, Duration::ZERO);
        let view = TelemetryOrchestrator::new(view_settings, provider.clone());

        view.start(ViewIdentity::new("plant-1", "token"));
        assert!(view.is_running());
        sleep(Duration::from_secs(5)).await;
        assert_eq!(provider.calls(), 1);
        assert_eq!(view.snapshot().status, ViewStatus::Valid);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(provider.calls(), 2);
        assert_eq!(view.snapshot().status, ViewStatus::Empty);

        view.stop();
        view.stop();
        assert!(!view.is_running());
        sleep(Duration::from_secs(120)).await;
        assert_eq!(provider.calls(), 2);
    }

    #[test]
    fn test_registry_rejects_unknown_view() {
        let registry = OrchestratorRegistry::new(vec![TelemetryOrchestrator::new(
            settings("energy"),
            ScriptedProvider::new(vec![]),
        )]);
        assert!(registry.get("energy").is_ok());
        assert!(matches!(
            registry.get("missing"),
            Err(TelemetryError::UnknownView(_))
        ));
    }
}
