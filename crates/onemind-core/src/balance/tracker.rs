//! Balance tracker client
//!
//! Keeps a time-bounded copy of the backend's balance rows and mediates
//! reads/writes. Every public method is best effort: failures are logged,
//! handed to the optional observer and absorbed.
//!
//! The synchronous methods never wait on the network. They return cached,
//! optimistic or empty values and schedule the real request on the
//! [`Spawner`]. In-flight requests are not ordered against each other: a slow
//! list that started before a later update can land after it and overwrite
//! the cache with older rows until the next refresh.

use super::backend::{
    BalanceBackend, DeductRequest, ImportRequest, ResetRequest, UpdateBalanceRequest,
};
use super::clock::{Clock, SystemClock};
use super::model::{default_balances, now_iso8601, BalanceRecord, BalanceSummary};
use super::spawn::{Spawner, TokioSpawner};
use crate::config::TrackerConfig;
use crate::error::{BalanceError, BalanceResult};
use futures::FutureExt;
use rust_decimal::Decimal;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceOperation {
    Load,
    SetBalance,
    Deduct,
    Reset,
    Import,
    Export,
}

impl BalanceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalanceOperation::Load => "load",
            BalanceOperation::SetBalance => "set",
            BalanceOperation::Deduct => "deduct",
            BalanceOperation::Reset => "reset",
            BalanceOperation::Import => "import",
            BalanceOperation::Export => "export",
        }
    }
}

impl fmt::Display for BalanceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An absorbed failure, as seen by the observer hook.
#[derive(Debug)]
pub struct BalanceFailure {
    pub operation: BalanceOperation,
    pub error: BalanceError,
}

pub type FailureHook = Arc<dyn Fn(&BalanceFailure) + Send + Sync>;

#[derive(Debug, Default)]
struct CacheState {
    records: Vec<BalanceRecord>,
    /// `None` until the first successful fetch, which counts as stale.
    refreshed_at: Option<Instant>,
}

struct TrackerInner {
    backend: Arc<dyn BalanceBackend>,
    clock: Arc<dyn Clock>,
    spawner: Arc<dyn Spawner>,
    cache: RwLock<CacheState>,
    refresh_scheduled: AtomicBool,
    staleness: Duration,
    currency: String,
    export_dir: PathBuf,
    on_failure: Option<FailureHook>,
}

/// Cheap to clone; clones share one cache.
#[derive(Clone)]
pub struct BalanceTracker {
    inner: Arc<TrackerInner>,
}

pub struct BalanceTrackerBuilder {
    backend: Arc<dyn BalanceBackend>,
    config: TrackerConfig,
    clock: Option<Arc<dyn Clock>>,
    spawner: Option<Arc<dyn Spawner>>,
    on_failure: Option<FailureHook>,
}

impl BalanceTrackerBuilder {
    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn on_failure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&BalanceFailure) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    /// Without an explicit spawner this must run inside a tokio runtime.
    pub fn build(self) -> BalanceResult<BalanceTracker> {
        let spawner: Arc<dyn Spawner> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(TokioSpawner::current().ok_or_else(|| {
                BalanceError::Config("no tokio runtime available for background tasks".into())
            })?),
        };

        Ok(BalanceTracker {
            inner: Arc::new(TrackerInner {
                backend: self.backend,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                spawner,
                cache: RwLock::new(CacheState::default()),
                refresh_scheduled: AtomicBool::new(false),
                staleness: self.config.staleness(),
                currency: self.config.currency.clone(),
                export_dir: self.config.resolved_export_dir(),
                on_failure: self.on_failure,
            }),
        })
    }
}

impl BalanceTracker {
    pub fn builder(backend: Arc<dyn BalanceBackend>) -> BalanceTrackerBuilder {
        BalanceTrackerBuilder {
            backend,
            config: TrackerConfig::default(),
            clock: None,
            spawner: None,
            on_failure: None,
        }
    }

    /// Tracker over the HTTP backend described by `config`.
    pub fn from_config(config: TrackerConfig) -> BalanceResult<Self> {
        let backend = super::http::HttpBalanceBackend::new(&config)?;
        Self::builder(Arc::new(backend)).config(config).build()
    }

    /// Schedule the first refresh. Never blocks.
    pub fn init(&self) {
        log::info!("[BalanceTracker] Initializing, scheduling first refresh");
        self.schedule_refresh();
    }

    // ----- read path -----

    /// Fetch every row. On failure fall back to the cache, or the stub rows.
    pub async fn load_balances_async(&self) -> Vec<BalanceRecord> {
        match self.inner.backend.list().await {
            Ok(records) => {
                log::debug!("[BalanceTracker] Loaded {} balance rows", records.len());
                self.replace_cache(records.clone());
                records
            }
            Err(error) => {
                self.report(BalanceOperation::Load, error);
                self.cached_or_defaults()
            }
        }
    }

    /// Cached rows right now; schedules a refresh when the cache is stale.
    pub fn load_balances(&self) -> Vec<BalanceRecord> {
        let snapshot = self.cached_or_defaults();
        if self.is_stale() {
            self.schedule_refresh();
        }
        snapshot
    }

    /// Rows as last fetched, without defaults or refresh side effects.
    pub fn cached_balances(&self) -> Vec<BalanceRecord> {
        self.read_cache(|cache| cache.records.clone())
    }

    pub fn last_refreshed(&self) -> Option<Instant> {
        self.read_cache(|cache| cache.refreshed_at)
    }

    pub fn is_stale(&self) -> bool {
        match self.last_refreshed() {
            Some(at) => self.inner.clock.now().saturating_duration_since(at) > self.inner.staleness,
            None => true,
        }
    }

    pub fn get_all_balances_summary(&self) -> Vec<BalanceSummary> {
        self.load_balances()
            .iter()
            .map(BalanceSummary::from)
            .collect()
    }

    // ----- write path -----

    pub async fn set_balance_async(
        &self,
        provider: &str,
        new_balance: Decimal,
        engine: Option<&str>,
        notes: Option<&str>,
    ) -> Option<BalanceRecord> {
        let request = UpdateBalanceRequest {
            current_balance: new_balance,
            engine: engine.map(str::to_string),
            notes: notes.map(str::to_string),
        };
        match self.inner.backend.update(provider, &request).await {
            Ok(record) => {
                log::info!(
                    "[BalanceTracker] Set {provider}/{} to {new_balance}",
                    record.engine
                );
                self.load_balances_async().await;
                Some(record)
            }
            Err(error) => {
                self.report(BalanceOperation::SetBalance, error);
                None
            }
        }
    }

    /// Schedules the update and returns what the row should look like.
    ///
    /// The projection is built locally: spend and token counters are zero
    /// whatever the stored row holds.
    pub fn set_balance(
        &self,
        provider: &str,
        new_balance: Decimal,
        engine: Option<&str>,
        notes: Option<&str>,
    ) -> BalanceRecord {
        let tracker = self.clone();
        let (owned_provider, owned_engine, owned_notes) = (
            provider.to_string(),
            engine.map(str::to_string),
            notes.map(str::to_string),
        );
        self.inner.spawner.spawn(
            async move {
                tracker
                    .set_balance_async(
                        &owned_provider,
                        new_balance,
                        owned_engine.as_deref(),
                        owned_notes.as_deref(),
                    )
                    .await;
            }
            .boxed(),
        );

        BalanceRecord {
            provider: provider.to_string(),
            engine: engine.unwrap_or("default").to_string(),
            initial_balance: new_balance,
            current_balance: new_balance,
            total_spent: Decimal::ZERO,
            tokens_in: 0,
            tokens_out: 0,
            last_updated: now_iso8601(),
            currency: self.inner.currency.clone(),
            notes: notes.unwrap_or_default().to_string(),
        }
    }

    pub async fn deduct_from_balance_async(
        &self,
        provider: &str,
        cost: Decimal,
        engine: Option<&str>,
        tokens_in: Option<u64>,
        tokens_out: Option<u64>,
    ) -> Option<BalanceRecord> {
        let request = DeductRequest {
            provider: provider.to_string(),
            engine: engine.map(str::to_string),
            cost,
            tokens_in,
            tokens_out,
        };
        match self.inner.backend.deduct(&request).await {
            Ok(record) => {
                log::debug!(
                    "[BalanceTracker] Deducted {cost} from {provider}, {} left",
                    record.current_balance
                );
                self.load_balances_async().await;
                Some(record)
            }
            Err(error) => {
                self.report(BalanceOperation::Deduct, error);
                None
            }
        }
    }

    /// Schedules the deduction. Always `None`; no projection is attempted.
    pub fn deduct_from_balance(
        &self,
        provider: &str,
        cost: Decimal,
        engine: Option<&str>,
        tokens_in: Option<u64>,
        tokens_out: Option<u64>,
    ) -> Option<BalanceRecord> {
        let tracker = self.clone();
        let provider = provider.to_string();
        let engine = engine.map(str::to_string);
        self.inner.spawner.spawn(
            async move {
                tracker
                    .deduct_from_balance_async(&provider, cost, engine.as_deref(), tokens_in, tokens_out)
                    .await;
            }
            .boxed(),
        );
        None
    }

    /// Reset to the initial balance, then refresh the cache whether or not
    /// the reset went through. Returns whether the reset request succeeded.
    pub async fn reset_balance_async(&self, provider: &str, engine: Option<&str>) -> bool {
        let request = ResetRequest {
            engine: engine.map(str::to_string),
        };
        let reset = match self.inner.backend.reset(provider, &request).await {
            Ok(()) => {
                log::info!("[BalanceTracker] Reset {provider}");
                true
            }
            Err(error) => {
                self.report(BalanceOperation::Reset, error);
                false
            }
        };
        self.load_balances_async().await;
        reset
    }

    pub fn reset_balance(&self, provider: &str, engine: Option<&str>) {
        let tracker = self.clone();
        let provider = provider.to_string();
        let engine = engine.map(str::to_string);
        self.inner.spawner.spawn(
            async move {
                tracker.reset_balance_async(&provider, engine.as_deref()).await;
            }
            .boxed(),
        );
    }

    /// Hand raw CSV to the backend; on success its parsed rows replace the cache.
    pub async fn import_from_csv_async(&self, csv_content: &str) -> Vec<BalanceRecord> {
        let request = ImportRequest {
            csv_content: csv_content.to_string(),
        };
        match self.inner.backend.import_csv(&request).await {
            Ok(records) => {
                log::info!("[BalanceTracker] Imported {} balance rows", records.len());
                self.replace_cache(records.clone());
                records
            }
            Err(error) => {
                self.report(BalanceOperation::Import, error);
                Vec::new()
            }
        }
    }

    /// Schedules the import. Always empty.
    pub fn import_from_csv(&self, csv_content: &str) -> Vec<BalanceRecord> {
        let tracker = self.clone();
        let csv_content = csv_content.to_string();
        self.inner.spawner.spawn(
            async move {
                tracker.import_from_csv_async(&csv_content).await;
            }
            .boxed(),
        );
        Vec::new()
    }

    /// Download the backend's CSV export into the export directory.
    pub async fn export_to_csv_async(&self) -> Option<PathBuf> {
        match self.inner.backend.export_csv(&self.inner.export_dir).await {
            Ok(path) => Some(path),
            Err(error) => {
                self.report(BalanceOperation::Export, error);
                None
            }
        }
    }

    /// Schedules the download and returns an empty string; the file is the result.
    pub fn export_to_csv(&self) -> String {
        log::info!(
            "[BalanceTracker] Exporting from {}",
            self.inner.backend.export_url()
        );
        let tracker = self.clone();
        self.inner.spawner.spawn(
            async move {
                tracker.export_to_csv_async().await;
            }
            .boxed(),
        );
        String::new()
    }

    pub fn export_url(&self) -> String {
        self.inner.backend.export_url()
    }

    // ----- internals -----

    /// At most one scheduled refresh is outstanding at a time.
    fn schedule_refresh(&self) {
        if self.inner.refresh_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let guard = ScheduledRefresh {
            tracker: self.clone(),
        };
        self.inner.spawner.spawn(
            async move {
                let refresh = guard;
                refresh.tracker.load_balances_async().await;
            }
            .boxed(),
        );
    }

    fn cached_or_defaults(&self) -> Vec<BalanceRecord> {
        let records = self.cached_balances();
        if records.is_empty() {
            default_balances()
        } else {
            records
        }
    }

    fn replace_cache(&self, records: Vec<BalanceRecord>) {
        let now = self.inner.clock.now();
        let mut cache = self
            .inner
            .cache
            .write()
            .unwrap_or_else(|e| e.into_inner());
        cache.records = records;
        cache.refreshed_at = Some(now);
    }

    fn read_cache<T>(&self, f: impl FnOnce(&CacheState) -> T) -> T {
        let cache = self.inner.cache.read().unwrap_or_else(|e| e.into_inner());
        f(&cache)
    }

    fn report(&self, operation: BalanceOperation, error: BalanceError) {
        log::warn!("[BalanceTracker] {operation} failed: {error}");
        if let Some(hook) = &self.inner.on_failure {
            hook(&BalanceFailure { operation, error });
        }
    }
}

/// Owned by the scheduled refresh task. Clears the pending flag however the
/// task ends, including when it is dropped unfinished or unwinds.
struct ScheduledRefresh {
    tracker: BalanceTracker,
}

impl Drop for ScheduledRefresh {
    fn drop(&mut self) {
        self.tracker
            .inner
            .refresh_scheduled
            .store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::clock::ManualClock;
    use crate::balance::model::BalanceStatus;
    use crate::balance::spawn::ManualSpawner;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn dec(value: &str) -> Decimal {
        value.parse().unwrap()
    }

    fn record(provider: &str, engine: &str, initial: &str, current: &str) -> BalanceRecord {
        let mut record = BalanceRecord::zeroed(provider, engine, "USD", "");
        record.initial_balance = dec(initial);
        record.current_balance = dec(current);
        record
    }

    #[derive(Default)]
    struct FakeBackend {
        rows: Mutex<Vec<BalanceRecord>>,
        fail_list: AtomicBool,
        fail_writes: AtomicBool,
        fail_reset: AtomicBool,
        list_calls: AtomicUsize,
        reset_calls: AtomicUsize,
        deducts: Mutex<Vec<DeductRequest>>,
        updates: Mutex<Vec<(String, UpdateBalanceRequest)>>,
    }

    impl FakeBackend {
        fn with_rows(rows: Vec<BalanceRecord>) -> Arc<Self> {
            let backend = Self::default();
            *backend.rows.lock().unwrap() = rows;
            Arc::new(backend)
        }

        fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }

        fn check_writes(&self) -> BalanceResult<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                Err(BalanceError::Api("balances.csv is locked".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl BalanceBackend for FakeBackend {
        async fn list(&self) -> BalanceResult<Vec<BalanceRecord>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(BalanceError::Network("connection refused".into()));
            }
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn update(
            &self,
            provider: &str,
            request: &UpdateBalanceRequest,
        ) -> BalanceResult<BalanceRecord> {
            self.check_writes()?;
            self.updates
                .lock()
                .unwrap()
                .push((provider.to_string(), request.clone()));
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .iter_mut()
                .find(|r| r.provider == provider)
                .ok_or_else(|| BalanceError::Api(format!("unknown provider {provider}")))?;
            row.current_balance = request.current_balance;
            Ok(row.clone())
        }

        async fn deduct(&self, request: &DeductRequest) -> BalanceResult<BalanceRecord> {
            self.check_writes()?;
            self.deducts.lock().unwrap().push(request.clone());
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .iter_mut()
                .find(|r| r.provider == request.provider)
                .ok_or_else(|| BalanceError::Api("unknown provider".into()))?;
            row.current_balance -= request.cost;
            row.total_spent += request.cost;
            row.tokens_in += request.tokens_in.unwrap_or(0);
            row.tokens_out += request.tokens_out.unwrap_or(0);
            Ok(row.clone())
        }

        async fn reset(&self, provider: &str, _request: &ResetRequest) -> BalanceResult<()> {
            self.reset_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_reset.load(Ordering::SeqCst) {
                return Err(BalanceError::Http {
                    status: 500,
                    body: "reset exploded".into(),
                });
            }
            for row in self.rows.lock().unwrap().iter_mut() {
                if row.provider == provider {
                    row.current_balance = row.initial_balance;
                    row.total_spent = Decimal::ZERO;
                }
            }
            Ok(())
        }

        async fn import_csv(&self, request: &ImportRequest) -> BalanceResult<Vec<BalanceRecord>> {
            self.check_writes()?;
            let parsed: Vec<BalanceRecord> = request
                .csv_content
                .lines()
                .skip(1)
                .filter(|line| !line.trim().is_empty())
                .map(|line| {
                    let cols: Vec<&str> = line.split(',').collect();
                    record(cols[0], cols[1], cols[2], cols[3])
                })
                .collect();
            *self.rows.lock().unwrap() = parsed.clone();
            Ok(parsed)
        }

        async fn export_csv(&self, dir: &Path) -> BalanceResult<PathBuf> {
            let path = dir.join("export.csv");
            std::fs::write(&path, "provider,engine\nopenai,gpt-4o\n")?;
            Ok(path)
        }

        fn export_url(&self) -> String {
            "http://fake/balances/export".into()
        }
    }

    struct Harness {
        tracker: BalanceTracker,
        backend: Arc<FakeBackend>,
        clock: Arc<ManualClock>,
        spawner: Arc<ManualSpawner>,
        failures: Arc<Mutex<Vec<BalanceOperation>>>,
    }

    fn harness(backend: Arc<FakeBackend>) -> Harness {
        harness_with_config(backend, TrackerConfig::default())
    }

    fn harness_with_config(backend: Arc<FakeBackend>, config: TrackerConfig) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let spawner = Arc::new(ManualSpawner::new());
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let tracker = BalanceTracker::builder(backend.clone())
            .config(config)
            .clock(clock.clone())
            .spawner(spawner.clone())
            .on_failure(move |failure| sink.lock().unwrap().push(failure.operation))
            .build()
            .unwrap();
        Harness {
            tracker,
            backend,
            clock,
            spawner,
            failures,
        }
    }

    fn sample_rows() -> Vec<BalanceRecord> {
        vec![
            record("openai", "gpt-4o", "100", "80"),
            record("anthropic", "claude-3-5-sonnet", "50", "5"),
        ]
    }

    #[tokio::test]
    async fn failed_list_with_empty_cache_returns_defaults() {
        let h = harness(FakeBackend::with_rows(vec![]));
        h.backend.fail_list.store(true, Ordering::SeqCst);

        let rows = h.tracker.load_balances_async().await;
        let keys = |rows: &[BalanceRecord]| {
            rows.iter()
                .map(|r| (r.provider.clone(), r.engine.clone(), r.notes.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(&rows), keys(&default_balances()));
        assert_eq!(rows.len(), 9);
        assert!(rows.iter().all(|r| r.current_balance.is_zero()
            && r.initial_balance.is_zero()
            && r.total_spent.is_zero()));
        assert!(h.tracker.cached_balances().is_empty());
        assert_eq!(*h.failures.lock().unwrap(), vec![BalanceOperation::Load]);
    }

    #[tokio::test]
    async fn failed_list_keeps_existing_cache() {
        let h = harness(FakeBackend::with_rows(sample_rows()));
        let fetched = h.tracker.load_balances_async().await;

        h.backend.fail_list.store(true, Ordering::SeqCst);
        let rows = h.tracker.load_balances_async().await;
        assert_eq!(rows, fetched);
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn first_sync_load_returns_defaults_and_schedules_refresh() {
        let h = harness(FakeBackend::with_rows(sample_rows()));

        let rows = h.tracker.load_balances();
        assert_eq!(rows.len(), 9);
        assert_eq!(h.backend.list_calls(), 0);
        assert_eq!(h.spawner.pending(), 1);

        h.spawner.run_pending().await;
        assert_eq!(h.backend.list_calls(), 1);
        assert_eq!(h.tracker.load_balances().len(), 2);
    }

    #[tokio::test]
    async fn fresh_cache_is_not_refetched_within_window() {
        let h = harness(FakeBackend::with_rows(sample_rows()));
        h.tracker.load_balances_async().await;
        assert_eq!(h.backend.list_calls(), 1);

        h.clock.advance(Duration::from_millis(4000));
        h.tracker.load_balances();
        h.clock.advance(Duration::from_millis(1000));
        h.tracker.load_balances();

        assert_eq!(h.spawner.pending(), 0);
        h.spawner.run_pending().await;
        assert_eq!(h.backend.list_calls(), 1);
    }

    #[tokio::test]
    async fn stale_cache_returns_old_rows_and_refreshes_once() {
        let h = harness(FakeBackend::with_rows(sample_rows()));
        h.tracker.load_balances_async().await;
        let before = h.tracker.cached_balances();

        h.backend.rows.lock().unwrap()[0].current_balance = dec("10");
        h.clock.advance(Duration::from_millis(5001));

        assert_eq!(h.tracker.load_balances(), before);
        assert_eq!(h.tracker.load_balances(), before);
        assert_eq!(h.spawner.pending(), 1);

        h.spawner.run_pending().await;
        assert_eq!(h.backend.list_calls(), 2);
        assert_eq!(h.tracker.load_balances()[0].current_balance, dec("10"));
        assert!(!h.tracker.is_stale());
    }

    #[tokio::test]
    async fn failed_background_refresh_allows_a_later_retry() {
        let h = harness(FakeBackend::with_rows(sample_rows()));
        h.backend.fail_list.store(true, Ordering::SeqCst);

        h.tracker.load_balances();
        h.spawner.run_pending().await;
        assert!(h.tracker.is_stale());

        h.backend.fail_list.store(false, Ordering::SeqCst);
        h.tracker.load_balances();
        assert_eq!(h.spawner.pending(), 1);
        h.spawner.run_pending().await;
        assert_eq!(h.tracker.cached_balances().len(), 2);
    }

    #[tokio::test]
    async fn dropped_refresh_task_frees_the_pending_slot() {
        let h = harness(FakeBackend::with_rows(sample_rows()));

        h.tracker.load_balances();
        assert_eq!(h.spawner.discard_pending(), 1);
        assert_eq!(h.backend.list_calls(), 0);

        h.tracker.load_balances();
        assert_eq!(h.spawner.pending(), 1);
        h.spawner.run_pending().await;
        assert_eq!(h.tracker.cached_balances().len(), 2);
    }

    #[tokio::test]
    async fn panicking_observer_does_not_block_later_refreshes() {
        let backend = FakeBackend::with_rows(sample_rows());
        backend.fail_list.store(true, Ordering::SeqCst);
        let spawner = Arc::new(ManualSpawner::new());
        let tracker = BalanceTracker::builder(backend.clone())
            .clock(Arc::new(ManualClock::new()))
            .spawner(spawner.clone())
            .on_failure(|failure| panic!("observer blew up on {}", failure.operation))
            .build()
            .unwrap();

        tracker.load_balances();
        let outcome = std::panic::AssertUnwindSafe(spawner.run_pending())
            .catch_unwind()
            .await;
        assert!(outcome.is_err());

        backend.fail_list.store(false, Ordering::SeqCst);
        tracker.load_balances();
        assert_eq!(spawner.pending(), 1);
        spawner.run_pending().await;
        assert_eq!(backend.list_calls(), 2);
        assert_eq!(tracker.cached_balances().len(), 2);
    }

    #[tokio::test]
    async fn set_balance_projects_zero_spend_immediately() {
        let mut rows = sample_rows();
        rows[0].total_spent = dec("7.5");
        rows[0].tokens_in = 900;
        let h = harness(FakeBackend::with_rows(rows));
        h.tracker.load_balances_async().await;

        let projected = h.tracker.set_balance("openai", dec("42"), None, None);
        assert_eq!(projected.current_balance, dec("42"));
        assert_eq!(projected.initial_balance, dec("42"));
        assert!(projected.total_spent.is_zero());
        assert_eq!(projected.tokens_in, 0);
        assert_eq!(projected.engine, "default");
        assert_eq!(projected.currency, "USD");
        assert!(h.backend.updates.lock().unwrap().is_empty());

        h.spawner.run_pending().await;
        let updates = h.backend.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "openai");
        assert_eq!(updates[0].1.current_balance, dec("42"));
    }

    #[tokio::test]
    async fn set_balance_async_refreshes_cache() {
        let h = harness(FakeBackend::with_rows(sample_rows()));

        let updated = h
            .tracker
            .set_balance_async("anthropic", dec("25"), Some("claude-3-5-sonnet"), Some("topped up"))
            .await
            .expect("update succeeds");
        assert_eq!(updated.current_balance, dec("25"));
        assert_eq!(h.backend.list_calls(), 1);
        assert_eq!(h.tracker.cached_balances()[1].current_balance, dec("25"));

        let sent = &h.backend.updates.lock().unwrap()[0].1;
        assert_eq!(sent.engine.as_deref(), Some("claude-3-5-sonnet"));
        assert_eq!(sent.notes.as_deref(), Some("topped up"));
    }

    #[tokio::test]
    async fn set_balance_returns_projection_when_update_fails() {
        let h = harness(FakeBackend::with_rows(sample_rows()));
        h.backend.fail_writes.store(true, Ordering::SeqCst);

        let projected = h.tracker.set_balance("openai", dec("42"), None, None);
        assert_eq!(projected.current_balance, dec("42"));
        assert!(projected.total_spent.is_zero());

        h.spawner.run_pending().await;
        assert_eq!(*h.failures.lock().unwrap(), vec![BalanceOperation::SetBalance]);
    }

    #[tokio::test]
    async fn set_balance_async_failure_is_absorbed() {
        let h = harness(FakeBackend::with_rows(sample_rows()));
        h.backend.fail_writes.store(true, Ordering::SeqCst);

        let result = h.tracker.set_balance_async("openai", dec("1"), None, None).await;
        assert!(result.is_none());
        assert_eq!(h.backend.list_calls(), 0);
        assert_eq!(*h.failures.lock().unwrap(), vec![BalanceOperation::SetBalance]);
    }

    #[tokio::test]
    async fn deduct_sync_always_returns_none() {
        let h = harness(FakeBackend::with_rows(sample_rows()));

        assert!(h
            .tracker
            .deduct_from_balance("openai", dec("0.5"), None, Some(120), Some(30))
            .is_none());
        h.spawner.run_pending().await;
        assert_eq!(h.backend.deducts.lock().unwrap().len(), 1);

        h.backend.fail_writes.store(true, Ordering::SeqCst);
        assert!(h
            .tracker
            .deduct_from_balance("openai", dec("0.5"), None, None, None)
            .is_none());
        h.spawner.run_pending().await;
        assert_eq!(*h.failures.lock().unwrap(), vec![BalanceOperation::Deduct]);
    }

    #[tokio::test]
    async fn deduct_async_returns_updated_row_and_refreshes() {
        let h = harness(FakeBackend::with_rows(sample_rows()));

        let row = h
            .tracker
            .deduct_from_balance_async("openai", dec("30"), Some("gpt-4o"), Some(1000), Some(250))
            .await
            .unwrap();
        assert_eq!(row.current_balance, dec("50"));
        assert_eq!(row.total_spent, dec("30"));
        assert_eq!(row.tokens_out, 250);
        assert_eq!(h.tracker.cached_balances()[0], row);
    }

    #[tokio::test]
    async fn reset_refreshes_cache_even_when_request_fails() {
        let h = harness(FakeBackend::with_rows(sample_rows()));
        h.backend.fail_reset.store(true, Ordering::SeqCst);

        assert!(!h.tracker.reset_balance_async("openai", None).await);
        assert_eq!(h.backend.reset_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.list_calls(), 1);
        assert_eq!(h.tracker.cached_balances().len(), 2);
        assert_eq!(*h.failures.lock().unwrap(), vec![BalanceOperation::Reset]);
    }

    #[tokio::test]
    async fn reset_restores_initial_balance() {
        let h = harness(FakeBackend::with_rows(sample_rows()));

        h.tracker.reset_balance("anthropic", Some("claude-3-5-sonnet"));
        assert_eq!(h.backend.reset_calls.load(Ordering::SeqCst), 0);
        h.spawner.run_pending().await;

        let anthropic = &h.tracker.cached_balances()[1];
        assert_eq!(anthropic.current_balance, dec("50"));
    }

    #[tokio::test]
    async fn import_replaces_cache_in_backend_order() {
        let h = harness(FakeBackend::with_rows(sample_rows()));
        h.tracker.load_balances_async().await;

        let csv = "provider,engine,initial,current\n\
                   groq,llama-3.1-70b-versatile,0,0\n\
                   xai,grok-2,25,2\n\
                   deepseek,deepseek-chat,10,9\n";
        let imported = h.tracker.import_from_csv_async(csv).await;

        let providers: Vec<_> = imported.iter().map(|r| r.provider.as_str()).collect();
        assert_eq!(providers, ["groq", "xai", "deepseek"]);
        assert_eq!(h.tracker.cached_balances(), imported);
    }

    #[tokio::test]
    async fn failed_import_returns_empty_and_keeps_cache() {
        let h = harness(FakeBackend::with_rows(sample_rows()));
        h.tracker.load_balances_async().await;
        let before = h.tracker.cached_balances();
        h.backend.fail_writes.store(true, Ordering::SeqCst);

        assert!(h.tracker.import_from_csv_async("provider\nopenai\n").await.is_empty());
        assert_eq!(h.tracker.cached_balances(), before);
    }

    #[tokio::test]
    async fn import_sync_returns_empty_and_applies_later() {
        let h = harness(FakeBackend::with_rows(vec![]));

        let csv = "provider,engine,initial,current\nmistral,mistral-large-latest,40,39\n";
        assert!(h.tracker.import_from_csv(csv).is_empty());
        assert!(h.tracker.cached_balances().is_empty());

        h.spawner.run_pending().await;
        assert_eq!(h.tracker.cached_balances()[0].provider, "mistral");
    }

    #[tokio::test]
    async fn summary_classifies_cached_rows() {
        let h = harness(FakeBackend::with_rows(vec![
            record("gemini", "gemini-1.5-pro", "0", "0"),
            record("openai", "gpt-4o", "100", "0"),
            record("anthropic", "claude-3-5-sonnet", "50", "5"),
            record("deepseek", "deepseek-chat", "10", "9"),
        ]));
        h.tracker.load_balances_async().await;

        let statuses: Vec<_> = h
            .tracker
            .get_all_balances_summary()
            .into_iter()
            .map(|s| (s.provider, s.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("gemini".to_string(), BalanceStatus::Free),
                ("openai".to_string(), BalanceStatus::Empty),
                ("anthropic".to_string(), BalanceStatus::Low),
                ("deepseek".to_string(), BalanceStatus::Good),
            ]
        );
    }

    #[tokio::test]
    async fn export_returns_empty_string_and_writes_later() {
        let dir = TempDir::new().unwrap();
        let config = TrackerConfig {
            export_dir: Some(dir.path().to_path_buf()),
            ..TrackerConfig::default()
        };
        let h = harness_with_config(FakeBackend::with_rows(vec![]), config);

        assert_eq!(h.tracker.export_to_csv(), "");
        assert!(!dir.path().join("export.csv").exists());

        h.spawner.run_pending().await;
        assert!(dir.path().join("export.csv").exists());
        assert_eq!(h.tracker.export_url(), "http://fake/balances/export");
    }

    #[tokio::test]
    async fn init_and_load_share_one_pending_refresh() {
        let h = harness(FakeBackend::with_rows(sample_rows()));

        h.tracker.init();
        h.tracker.load_balances();
        assert_eq!(h.spawner.pending(), 1);

        h.spawner.run_pending().await;
        assert_eq!(h.backend.list_calls(), 1);
        assert!(h.failures.lock().unwrap().is_empty());
    }

    #[test]
    fn build_without_runtime_or_spawner_fails() {
        let result = BalanceTracker::builder(FakeBackend::with_rows(vec![])).build();
        assert!(matches!(result, Err(BalanceError::Config(_))));
    }
}
