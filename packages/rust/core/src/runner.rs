//! Resumable sequential job runner.
//!
//! One unit is in flight at a time. Each iteration dispatches a unit to the
//! [`RemoteExecutor`], appends the returned records to that unit's group,
//! writes the group through to the [`PersistentStore`], reports progress,
//! advances the checkpoint and waits the pacing interval. A stop request is
//! observed only between units.
//!
//! ```text
//! Idle ──start──▶ Running ──stop──▶ Paused ──resume──▶ Running
//!                    │
//!                    └──last unit──▶ Completed
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use crawlbatch_executor::RemoteExecutor;
use crawlbatch_shared::{
    CheckpointMode, CrawlBatchError, JobDocument, JobId, JobState, JobStatus, ResultRecord,
    Result, RunnerConfig, WorkUnit,
};

use crate::normalize::normalize_rows;
use crate::persistence::{self, PersistentStore};
use crate::progress::{Pacer, ProgressObserver, percent};

// ---------------------------------------------------------------------------
// Stop signal
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct StopInner {
    requested: AtomicBool,
    notify: Notify,
}

/// Cooperative stop flag shared between the runner and its controllers.
///
/// Setting it never interrupts an in-flight remote call; the runner checks
/// it before each unit. A pending pacing delay is cut short.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the runner to pause at the next unit boundary. Non-blocking.
    pub fn request_stop(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
    }

    /// Resolves once a stop has been requested.
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_stop_requested() {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Job context & report
// ---------------------------------------------------------------------------

/// Everything the runner needs to know about one job, passed in and
/// handed back by each runner operation.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub file_name: String,
    pub state: JobState,
    /// Group currently being dispatched, if any.
    pub current_group: Option<String>,
}

impl JobContext {
    /// Fresh context for the given units.
    pub fn new(job_id: JobId, file_name: impl Into<String>, units: Vec<WorkUnit>) -> Self {
        Self {
            job_id,
            file_name: file_name.into(),
            state: JobState::new(units),
            current_group: None,
        }
    }

    /// Build a fresh context from an imported job's raw rows.
    pub fn from_document(doc: &JobDocument) -> Result<Self> {
        let job_id: JobId = doc
            .id
            .parse()
            .map_err(|e| CrawlBatchError::validation(format!("invalid job id '{}': {e}", doc.id)))?;
        Ok(Self::new(job_id, doc.file_name.clone(), normalize_rows(&doc.rows)))
    }

    /// Replace accumulated results and checkpoint with what the store holds.
    ///
    /// Used when the process restarted and the in-memory state is gone.
    pub async fn restore(
        mut self,
        store: &dyn PersistentStore,
        mode: CheckpointMode,
    ) -> Result<Self> {
        let loaded = persistence::load(store, &self.job_id, &self.state.units, mode).await?;
        let total = self.state.units.len();
        self.state.accumulated = loaded.accumulated;
        self.state.checkpoint = loaded.checkpoint;
        self.state.status = if total > 0 && loaded.checkpoint >= total {
            JobStatus::Completed
        } else if loaded.checkpoint > 0 {
            JobStatus::Paused
        } else {
            JobStatus::Idle
        };
        self.current_group = None;
        Ok(self)
    }

    pub fn total(&self) -> usize {
        self.state.units.len()
    }

    /// Progress implied by the checkpoint.
    pub fn percent(&self) -> f64 {
        percent(self.state.checkpoint, self.total())
    }

    fn validate(&self) -> Result<()> {
        let total = self.total();
        if self.state.checkpoint > total {
            return Err(CrawlBatchError::validation(format!(
                "checkpoint {} exceeds {total} units",
                self.state.checkpoint
            )));
        }

        let mut seen = HashSet::with_capacity(total);
        for (i, unit) in self.state.units.iter().enumerate() {
            if unit.position != i {
                return Err(CrawlBatchError::validation(format!(
                    "unit '{}' has position {} at index {i}",
                    unit.group_key, unit.position
                )));
            }
            if !seen.insert(unit.group_key.as_str()) {
                return Err(CrawlBatchError::validation(format!(
                    "group '{}' appears more than once",
                    unit.group_key
                )));
            }
        }
        Ok(())
    }
}

/// Outcome counters for one `start`/`resume` call.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Units handed to the executor in this call.
    pub dispatched: usize,
    pub succeeded: usize,
    /// Failed units as `(group key, error message)`.
    pub failed: Vec<(String, String)>,
    /// Result or marker writes that did not land.
    pub persist_failures: usize,
    pub records_added: usize,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// JobRunner
// ---------------------------------------------------------------------------

/// Drives a [`JobContext`] through its units.
pub struct JobRunner {
    executor: Arc<dyn RemoteExecutor>,
    store: Arc<dyn PersistentStore>,
    progress: Arc<dyn ProgressObserver>,
    config: RunnerConfig,
    pacer: Pacer,
    stop: StopSignal,
}

impl JobRunner {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        store: Arc<dyn PersistentStore>,
        progress: Arc<dyn ProgressObserver>,
        config: RunnerConfig,
    ) -> Self {
        let pacer = Pacer::new(config.pacing);
        Self {
            executor,
            store,
            progress,
            config,
            pacer,
            stop: StopSignal::new(),
        }
    }

    /// Handle for requesting a stop from another task.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Ask the running loop to pause before its next unit.
    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// Run the job from its checkpoint, or from zero when `from_scratch`.
    ///
    /// Returns once the job is `Completed` or `Paused`. A structurally
    /// invalid context is rejected before anything is dispatched.
    #[instrument(skip_all, fields(job_id = %ctx.job_id, from_scratch = from_scratch))]
    pub async fn start(
        &self,
        mut ctx: JobContext,
        from_scratch: bool,
    ) -> Result<(JobContext, RunReport)> {
        if from_scratch {
            ctx.state.accumulated.clear();
            ctx.state.checkpoint = 0;
        }
        ctx.validate()?;

        ctx.state.status = JobStatus::Running;
        self.stop.clear();

        let started = Instant::now();
        let mut report = RunReport::default();

        info!(
            total = ctx.total(),
            checkpoint = ctx.state.checkpoint,
            pacing_ms = self.config.pacing.as_millis() as u64,
            "starting job"
        );

        self.run_loop(&mut ctx, &mut report).await;
        report.elapsed = started.elapsed();

        info!(
            status = %ctx.state.status,
            checkpoint = ctx.state.checkpoint,
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            persist_failures = report.persist_failures,
            records_added = report.records_added,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "job run finished"
        );

        Ok((ctx, report))
    }

    /// Continue a paused job from its checkpoint.
    pub async fn resume(&self, ctx: JobContext) -> Result<(JobContext, RunReport)> {
        self.start(ctx, false).await
    }

    async fn run_loop(&self, ctx: &mut JobContext, report: &mut RunReport) {
        let total = ctx.total();

        for i in ctx.state.checkpoint..total {
            if self.stop.is_stop_requested() {
                ctx.state.checkpoint = i;
                ctx.state.status = JobStatus::Paused;
                ctx.current_group = None;
                self.progress.on_progress("", percent(i, total));
                info!(checkpoint = i, total, "stop requested, job paused");
                return;
            }

            let unit = ctx.state.units[i].clone();
            ctx.current_group = Some(unit.group_key.clone());
            self.progress.on_progress(&unit.group_key, percent(i, total));

            report.dispatched += 1;
            match self.dispatch(&unit).await {
                Ok(records) => {
                    report.succeeded += 1;
                    let added = records.len();
                    debug!(group = %unit.group_key, records = added, "unit succeeded");

                    if added > 0 {
                        report.records_added += added;
                        let list = ctx
                            .state
                            .accumulated
                            .entry(unit.group_key.clone())
                            .or_default();
                        list.extend(tag_records(records, &unit));

                        if let Err(e) =
                            persistence::merge(self.store.as_ref(), &ctx.job_id, &unit.group_key, list)
                                .await
                        {
                            warn!(group = %unit.group_key, error = %e, "failed to persist group results");
                            report.persist_failures += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(group = %unit.group_key, error = %e, "unit failed, continuing with next");
                    report.failed.push((unit.group_key.clone(), e.to_string()));
                }
            }

            self.progress.on_progress(&unit.group_key, percent(i + 1, total));

            if self.config.checkpoint_mode == CheckpointMode::AttemptedMarker {
                if let Err(e) = self.store.mark_attempted(&ctx.job_id, &unit.group_key).await {
                    warn!(group = %unit.group_key, error = %e, "failed to persist attempted marker");
                    report.persist_failures += 1;
                }
            }

            ctx.state.checkpoint = i + 1;

            if i + 1 < total {
                self.pacer.wait(&self.stop).await;
            }
        }

        ctx.state.checkpoint = total;
        ctx.state.status = JobStatus::Completed;
        ctx.current_group = None;
        self.progress.on_progress("", 100.0);
    }

    /// Call the executor, retrying up to `max_retries` times.
    ///
    /// A stop request cuts the backoff short and suppresses further attempts.
    async fn dispatch(&self, unit: &WorkUnit) -> Result<Vec<ResultRecord>> {
        let mut attempt = 0u32;
        loop {
            match self.executor.execute(unit).await {
                Ok(records) => return Ok(records),
                Err(e) if attempt < self.config.max_retries && !self.stop.is_stop_requested() => {
                    attempt += 1;
                    warn!(
                        group = %unit.group_key,
                        attempt,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "unit failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.retry_backoff) => {}
                        _ = self.stop.stopped() => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Stamp records with the unit that produced them.
fn tag_records(records: Vec<ResultRecord>, unit: &WorkUnit) -> Vec<ResultRecord> {
    let sole_member = match unit.member_ids.as_slice() {
        [only] => Some(only),
        _ => None,
    };
    records
        .into_iter()
        .map(|mut r| {
            r.group_key = unit.group_key.clone();
            r.member_ids = unit.member_ids.clone();
            if r.member_id.is_none() {
                r.member_id = sole_member.cloned();
            }
            r
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::persistence::MemoryStore;
    use crate::progress::SilentProgress;

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    /// Executor with canned per-group outcomes: `Some(n)` returns n records,
    /// `None` fails.
    #[derive(Default)]
    struct ScriptedExecutor {
        outcomes: HashMap<String, Option<usize>>,
        /// Fail this many calls for a group before applying its outcome.
        flaky: Mutex<HashMap<String, u32>>,
        calls: Mutex<Vec<String>>,
        stop_during: Option<(String, StopSignal)>,
    }

    impl ScriptedExecutor {
        fn new(outcomes: &[(&str, Option<usize>)]) -> Self {
            Self {
                outcomes: outcomes
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
                ..Self::default()
            }
        }

        fn stopping_during(mut self, group: &str, stop: StopSignal) -> Self {
            self.stop_during = Some((group.to_string(), stop));
            self
        }

        fn flaky(self, group: &str, failures: u32) -> Self {
            self.flaky.lock().unwrap().insert(group.to_string(), failures);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedExecutor {
        async fn execute(&self, unit: &WorkUnit) -> Result<Vec<ResultRecord>> {
            self.calls.lock().unwrap().push(unit.group_key.clone());
            if let Some((group, stop)) = &self.stop_during {
                if *group == unit.group_key {
                    stop.request_stop();
                }
            }
            {
                let mut flaky = self.flaky.lock().unwrap();
                if let Some(left) = flaky.get_mut(&unit.group_key) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(CrawlBatchError::Remote(format!(
                            "{}: HTTP 503",
                            unit.group_key
                        )));
                    }
                }
            }
            match self.outcomes.get(&unit.group_key).copied().flatten() {
                Some(n) => Ok((0..n)
                    .map(|i| ResultRecord {
                        title: format!("{}-r{}", unit.group_key, i + 1),
                        position: (i + 1).to_string(),
                        ..ResultRecord::default()
                    })
                    .collect()),
                None => Err(CrawlBatchError::Remote(format!(
                    "{}: HTTP 500",
                    unit.group_key
                ))),
            }
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<(String, f64)>>,
    }

    impl RecordingProgress {
        fn events(&self) -> Vec<(String, f64)> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProgressObserver for RecordingProgress {
        fn on_progress(&self, current_group: &str, percent: f64) {
            self.events
                .lock()
                .unwrap()
                .push((current_group.to_string(), percent));
        }
    }

    /// Store whose result writes fail for one group.
    struct FlakyStore {
        inner: MemoryStore,
        failing_group: String,
    }

    #[async_trait]
    impl PersistentStore for FlakyStore {
        async fn set_group_results(
            &self,
            job_id: &JobId,
            group_key: &str,
            records: &[ResultRecord],
        ) -> Result<()> {
            if group_key == self.failing_group {
                return Err(CrawlBatchError::Storage("disk full".into()));
            }
            self.inner.set_group_results(job_id, group_key, records).await
        }

        async fn mark_attempted(&self, job_id: &JobId, group_key: &str) -> Result<()> {
            self.inner.mark_attempted(job_id, group_key).await
        }

        async fn load_results(
            &self,
            job_id: &JobId,
        ) -> Result<BTreeMap<String, Vec<ResultRecord>>> {
            self.inner.load_results(job_id).await
        }

        async fn load_attempted(&self, job_id: &JobId) -> Result<BTreeSet<String>> {
            self.inner.load_attempted(job_id).await
        }

        async fn clear_progress(&self, job_id: &JobId) -> Result<()> {
            self.inner.clear_progress(job_id).await
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn fast_config() -> RunnerConfig {
        RunnerConfig {
            pacing: Duration::ZERO,
            checkpoint_mode: CheckpointMode::KeyCount,
            max_retries: 0,
            retry_backoff: Duration::ZERO,
        }
    }

    fn example_rows() -> Vec<Vec<String>> {
        [["h1", "h2"], ["kw1", "id1"], ["kw1", "id2"], ["kw2", "id3"]]
            .iter()
            .map(|r| r.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    fn context_for(keys: &[&str]) -> JobContext {
        let units = keys
            .iter()
            .enumerate()
            .map(|(i, k)| WorkUnit {
                group_key: k.to_string(),
                member_ids: vec![format!("{k}-m1")],
                position: i,
            })
            .collect();
        JobContext::new(JobId::new(), "test.csv", units)
    }

    fn runner(
        executor: Arc<dyn RemoteExecutor>,
        store: Arc<dyn PersistentStore>,
        progress: Arc<dyn ProgressObserver>,
        config: RunnerConfig,
    ) -> JobRunner {
        JobRunner::new(executor, store, progress, config)
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failed_group_is_skipped_and_job_completes() {
        let doc = JobDocument {
            id: JobId::new().to_string(),
            file_name: "keywords.xlsx".into(),
            created_at: Utc::now(),
            rows: example_rows(),
        };
        let ctx = JobContext::from_document(&doc).unwrap();
        let executor = Arc::new(ScriptedExecutor::new(&[("kw1", Some(2)), ("kw2", None)]));
        let store = Arc::new(MemoryStore::new());
        let runner = runner(executor.clone(), store.clone(), Arc::new(SilentProgress), fast_config());

        let (ctx, report) = runner.start(ctx, false).await.unwrap();

        assert_eq!(ctx.state.status, JobStatus::Completed);
        assert_eq!(ctx.state.checkpoint, 2);
        assert_eq!(ctx.state.accumulated.len(), 1);
        assert_eq!(ctx.state.accumulated["kw1"].len(), 2);
        assert!(ctx.current_group.is_none());
        assert_eq!(executor.calls(), vec!["kw1", "kw2"]);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "kw2");

        let stored = store.load_results(&ctx.job_id).await.unwrap();
        assert_eq!(stored, ctx.state.accumulated);
    }

    /// Runner whose stop signal is also handed to the executor, so a stop
    /// can be requested while a given unit is in flight.
    fn stopping_runner(
        outcomes: &[(&str, Option<usize>)],
        stop_during: &str,
        store: Arc<dyn PersistentStore>,
        progress: Arc<dyn ProgressObserver>,
        config: RunnerConfig,
    ) -> (JobRunner, Arc<ScriptedExecutor>) {
        let stop = StopSignal::new();
        let executor =
            Arc::new(ScriptedExecutor::new(outcomes).stopping_during(stop_during, stop.clone()));
        let runner = JobRunner {
            stop,
            ..runner(executor.clone(), store, progress, config)
        };
        (runner, executor)
    }

    #[tokio::test]
    async fn stop_pauses_before_next_unit_and_resume_finishes() {
        let ctx = JobContext::from_document(&JobDocument {
            id: JobId::new().to_string(),
            file_name: "k.csv".into(),
            created_at: Utc::now(),
            rows: example_rows(),
        })
        .unwrap();
        let outcomes = [("kw1", Some(2)), ("kw2", Some(1))];
        let store = Arc::new(MemoryStore::new());

        // The stop lands while kw1 is in flight: kw1 finishes, kw2 is not dispatched.
        let (first_runner, first) = stopping_runner(
            &outcomes,
            "kw1",
            store.clone(),
            Arc::new(SilentProgress),
            fast_config(),
        );
        let (paused, report) = first_runner.start(ctx, false).await.unwrap();

        assert_eq!(paused.state.status, JobStatus::Paused);
        assert_eq!(paused.state.checkpoint, 1);
        assert_eq!(first.calls(), vec!["kw1"]);
        assert_eq!(report.dispatched, 1);
        assert_eq!(paused.state.accumulated["kw1"].len(), 2);

        let second = Arc::new(ScriptedExecutor::new(&outcomes));
        let second_runner = runner(second.clone(), store, Arc::new(SilentProgress), fast_config());
        let (done, _) = second_runner.resume(paused).await.unwrap();

        assert_eq!(second.calls(), vec!["kw2"]);
        assert_eq!(done.state.status, JobStatus::Completed);
        assert_eq!(done.state.checkpoint, 2);
        assert_eq!(done.state.accumulated["kw1"].len(), 2);
        assert_eq!(done.state.accumulated["kw2"].len(), 1);
    }

    #[tokio::test]
    async fn interrupted_run_matches_uninterrupted_run() {
        let keys = ["a", "b", "c", "d", "e"];
        let outcomes = [
            ("a", Some(1)),
            ("b", Some(3)),
            ("c", None),
            ("d", Some(0)),
            ("e", Some(2)),
        ];

        let straight = runner(
            Arc::new(ScriptedExecutor::new(&outcomes)),
            Arc::new(MemoryStore::new()),
            Arc::new(SilentProgress),
            fast_config(),
        );
        let (expected, _) = straight.start(context_for(&keys), false).await.unwrap();

        // Pause after every unit, then resume with a fresh runner.
        let mut ctx = context_for(&keys);
        let mut dispatched = Vec::new();
        loop {
            let next_group = ctx.state.units[ctx.state.checkpoint].group_key.clone();
            let (step, executor) = stopping_runner(
                &outcomes,
                &next_group,
                Arc::new(MemoryStore::new()),
                Arc::new(SilentProgress),
                fast_config(),
            );
            let (next, _) = step.resume(ctx).await.unwrap();
            dispatched.extend(executor.calls());
            ctx = next;
            if ctx.state.status == JobStatus::Completed {
                break;
            }
            assert_eq!(ctx.state.status, JobStatus::Paused);
        }

        assert_eq!(dispatched, keys.to_vec());
        assert_eq!(ctx.state.accumulated, expected.state.accumulated);
        assert_eq!(ctx.state.checkpoint, expected.state.checkpoint);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_ends_at_100() {
        let progress = Arc::new(RecordingProgress::default());
        let runner = runner(
            Arc::new(ScriptedExecutor::new(&[("a", Some(1)), ("b", None), ("c", Some(2)), ("d", Some(1))])),
            Arc::new(MemoryStore::new()),
            progress.clone(),
            fast_config(),
        );

        let (ctx, _) = runner.start(context_for(&["a", "b", "c", "d"]), false).await.unwrap();
        assert_eq!(ctx.state.status, JobStatus::Completed);

        let events = progress.events();
        assert_eq!(events.first().unwrap(), &("a".to_string(), 0.0));
        assert_eq!(events.last().unwrap(), &(String::new(), 100.0));
        for pair in events.windows(2) {
            assert!(pair[0].1 <= pair[1].1, "progress went backwards: {pair:?}");
        }
        // before/after for each unit, plus the completion notice
        assert_eq!(events.len(), 4 * 2 + 1);
        assert!(events.contains(&("b".to_string(), 25.0)));
        assert!(events.contains(&("b".to_string(), 50.0)));
    }

    #[tokio::test]
    async fn paused_run_never_reports_100() {
        let progress = Arc::new(RecordingProgress::default());
        let (runner, _) = stopping_runner(
            &[("a", Some(1)), ("b", Some(1)), ("c", Some(1))],
            "b",
            Arc::new(MemoryStore::new()),
            progress.clone(),
            fast_config(),
        );

        let (ctx, _) = runner.start(context_for(&["a", "b", "c"]), false).await.unwrap();

        assert_eq!(ctx.state.status, JobStatus::Paused);
        assert_eq!(ctx.state.checkpoint, 2);
        let events = progress.events();
        assert!(events.iter().all(|(_, p)| *p < 100.0));
        assert_eq!(events.last().unwrap().0, "");
    }

    #[tokio::test]
    async fn failure_does_not_touch_earlier_groups() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(ScriptedExecutor::new(&[
            ("a", Some(2)),
            ("b", None),
            ("c", Some(1)),
        ]));
        let runner = runner(executor.clone(), store.clone(), Arc::new(SilentProgress), fast_config());

        let (ctx, report) = runner.start(context_for(&["a", "b", "c"]), false).await.unwrap();

        assert_eq!(executor.calls(), vec!["a", "b", "c"]);
        assert_eq!(ctx.state.accumulated["a"].len(), 2);
        assert!(!ctx.state.accumulated.contains_key("b"));
        assert_eq!(ctx.state.accumulated["c"].len(), 1);
        assert_eq!(report.failed, vec![("b".to_string(), "remote error: b: HTTP 500".to_string())]);
    }

    #[tokio::test]
    async fn empty_job_completes_immediately() {
        let progress = Arc::new(RecordingProgress::default());
        let executor = Arc::new(ScriptedExecutor::default());
        let runner = runner(executor.clone(), Arc::new(MemoryStore::new()), progress.clone(), fast_config());

        let (ctx, report) = runner
            .start(JobContext::new(JobId::new(), "empty.csv", vec![]), false)
            .await
            .unwrap();

        assert_eq!(ctx.state.status, JobStatus::Completed);
        assert_eq!(ctx.state.checkpoint, 0);
        assert_eq!(report.dispatched, 0);
        assert!(executor.calls().is_empty());
        assert_eq!(progress.events(), vec![(String::new(), 100.0)]);
    }

    #[tokio::test]
    async fn invalid_context_is_rejected_before_dispatch() {
        let executor = Arc::new(ScriptedExecutor::new(&[("a", Some(1))]));
        let runner = runner(executor.clone(), Arc::new(MemoryStore::new()), Arc::new(SilentProgress), fast_config());

        let mut ctx = context_for(&["a"]);
        ctx.state.checkpoint = 5;
        let err = runner.start(ctx, false).await.unwrap_err();
        assert!(matches!(err, CrawlBatchError::Validation { .. }));

        let mut ctx = context_for(&["a", "b"]);
        ctx.state.units[1].group_key = "a".into();
        let err = runner.start(ctx, false).await.unwrap_err();
        assert!(err.to_string().contains("more than once"));

        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn from_scratch_resets_state_and_resume_keeps_it() {
        let executor = Arc::new(ScriptedExecutor::new(&[("a", Some(1)), ("b", Some(1))]));
        let runner = runner(executor.clone(), Arc::new(MemoryStore::new()), Arc::new(SilentProgress), fast_config());

        let mut ctx = context_for(&["a", "b"]);
        ctx.state.checkpoint = 1;
        ctx.state
            .accumulated
            .insert("a".into(), vec![ResultRecord::default(); 4]);

        let (resumed, _) = runner.start(ctx.clone(), false).await.unwrap();
        assert_eq!(executor.calls(), vec!["b"]);
        assert_eq!(resumed.state.accumulated["a"].len(), 4);

        let (fresh, _) = runner.start(ctx, true).await.unwrap();
        assert_eq!(executor.calls(), vec!["b", "a", "b"]);
        assert_eq!(fresh.state.accumulated["a"].len(), 1);
    }

    #[tokio::test]
    async fn replayed_group_appends_to_existing_list() {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(ScriptedExecutor::new(&[("a", Some(2))]));
        let runner = runner(executor, store.clone(), Arc::new(SilentProgress), fast_config());

        let mut ctx = context_for(&["a"]);
        ctx.state.accumulated.insert(
            "a".into(),
            vec![ResultRecord {
                title: "earlier".into(),
                group_key: "a".into(),
                ..ResultRecord::default()
            }],
        );

        let (ctx, _) = runner.start(ctx, false).await.unwrap();
        let titles: Vec<&str> = ctx.state.accumulated["a"]
            .iter()
            .map(|r| r.title.as_str())
            .collect();
        assert_eq!(titles, vec!["earlier", "a-r1", "a-r2"]);
        assert_eq!(store.load_results(&ctx.job_id).await.unwrap()["a"].len(), 3);
    }

    #[tokio::test]
    async fn stop_requested_before_start_is_cleared() {
        let executor = Arc::new(ScriptedExecutor::new(&[("a", Some(1)), ("b", Some(1))]));
        let runner = runner(executor.clone(), Arc::new(MemoryStore::new()), Arc::new(SilentProgress), fast_config());
        runner.request_stop();

        let (ctx, _) = runner.start(context_for(&["a", "b"]), false).await.unwrap();
        assert_eq!(ctx.state.status, JobStatus::Completed);
        assert_eq!(executor.calls(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn retries_only_when_configured() {
        let no_retry = runner(
            Arc::new(ScriptedExecutor::new(&[("a", Some(1))]).flaky("a", 1)),
            Arc::new(MemoryStore::new()),
            Arc::new(SilentProgress),
            fast_config(),
        );
        let (ctx, report) = no_retry.start(context_for(&["a"]), false).await.unwrap();
        assert!(ctx.state.accumulated.is_empty());
        assert_eq!(report.failed.len(), 1);

        let executor = Arc::new(ScriptedExecutor::new(&[("a", Some(1))]).flaky("a", 1));
        let with_retry = runner(
            executor.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(SilentProgress),
            RunnerConfig {
                max_retries: 1,
                ..fast_config()
            },
        );
        let (ctx, report) = with_retry.start(context_for(&["a"]), false).await.unwrap();
        assert_eq!(ctx.state.accumulated["a"].len(), 1);
        assert!(report.failed.is_empty());
        assert_eq!(executor.calls(), vec!["a", "a"]);
    }

    #[tokio::test]
    async fn persist_failure_is_logged_and_run_continues() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failing_group: "a".into(),
        });
        let runner = runner(
            Arc::new(ScriptedExecutor::new(&[("a", Some(1)), ("b", Some(1))])),
            store.clone(),
            Arc::new(SilentProgress),
            fast_config(),
        );

        let (ctx, report) = runner.start(context_for(&["a", "b"]), false).await.unwrap();

        assert_eq!(ctx.state.status, JobStatus::Completed);
        assert_eq!(ctx.state.checkpoint, 2);
        assert_eq!(report.persist_failures, 1);
        assert_eq!(ctx.state.accumulated.len(), 2);
        let stored = store.load_results(&ctx.job_id).await.unwrap();
        assert!(!stored.contains_key("a"));
        assert!(stored.contains_key("b"));
    }

    #[tokio::test]
    async fn records_are_tagged_with_their_unit() {
        let store = Arc::new(MemoryStore::new());
        let runner = runner(
            Arc::new(ScriptedExecutor::new(&[("solo", Some(1)), ("pair", Some(1))])),
            store,
            Arc::new(SilentProgress),
            fast_config(),
        );
        let units = vec![
            WorkUnit {
                group_key: "solo".into(),
                member_ids: vec!["id1".into()],
                position: 0,
            },
            WorkUnit {
                group_key: "pair".into(),
                member_ids: vec!["id2".into(), "id3".into()],
                position: 1,
            },
        ];
        let (ctx, _) = runner
            .start(JobContext::new(JobId::new(), "t.csv", units), false)
            .await
            .unwrap();

        let solo = &ctx.state.accumulated["solo"][0];
        assert_eq!(solo.group_key, "solo");
        assert_eq!(solo.member_id.as_deref(), Some("id1"));
        let pair = &ctx.state.accumulated["pair"][0];
        assert_eq!(pair.group_key, "pair");
        assert!(pair.member_id.is_none());
        assert_eq!(pair.member_ids, vec!["id2", "id3"]);
        assert_eq!(solo.member_ids, vec!["id1"]);
    }

    async fn restart_after_reset_resumes_new_run(mode: CheckpointMode) {
        let store = Arc::new(MemoryStore::new());
        let config = RunnerConfig {
            checkpoint_mode: mode,
            ..fast_config()
        };
        let outcomes = [("a", Some(1)), ("b", Some(1)), ("c", Some(1))];
        let ctx = context_for(&["a", "b", "c"]);
        let job_id = ctx.job_id.clone();
        let units = ctx.state.units.clone();

        let full = runner(
            Arc::new(ScriptedExecutor::new(&outcomes)),
            store.clone(),
            Arc::new(SilentProgress),
            config.clone(),
        );
        let (done, _) = full.start(ctx, false).await.unwrap();
        assert_eq!(done.state.status, JobStatus::Completed);

        // Start over, then get interrupted after the first unit.
        persistence::reset(&*store, &job_id).await.unwrap();
        let (again, _) = stopping_runner(
            &outcomes,
            "a",
            store.clone(),
            Arc::new(SilentProgress),
            config,
        );
        let (paused, _) = again.start(done, true).await.unwrap();
        assert_eq!(paused.state.checkpoint, 1);

        let restored = JobContext::new(job_id, "test.csv", units)
            .restore(&*store, mode)
            .await
            .unwrap();
        assert_eq!(restored.state.checkpoint, 1);
        assert_eq!(restored.state.status, JobStatus::Paused);
        assert_eq!(restored.state.accumulated["a"].len(), 1);
    }

    #[tokio::test]
    async fn from_scratch_restart_resumes_new_run_by_key_count() {
        restart_after_reset_resumes_new_run(CheckpointMode::KeyCount).await;
    }

    #[tokio::test]
    async fn from_scratch_restart_resumes_new_run_by_markers() {
        restart_after_reset_resumes_new_run(CheckpointMode::AttemptedMarker).await;
    }

    #[tokio::test]
    async fn stop_cuts_retry_backoff_short() {
        let executor = Arc::new(ScriptedExecutor::new(&[("a", Some(1))]).flaky("a", 10));
        let runner = runner(
            executor.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(SilentProgress),
            RunnerConfig {
                max_retries: 10,
                retry_backoff: Duration::from_secs(30),
                ..fast_config()
            },
        );
        let stop = runner.stop_signal();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.request_stop();
        });

        let started = Instant::now();
        let (ctx, report) = runner.start(context_for(&["a"]), false).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(executor.calls(), vec!["a", "a"]);
        assert_eq!(report.failed.len(), 1);
        assert!(ctx.state.accumulated.is_empty());
    }

    #[tokio::test]
    async fn markers_let_a_restarted_process_resume_past_empty_groups() {
        let store = Arc::new(MemoryStore::new());
        let config = RunnerConfig {
            checkpoint_mode: CheckpointMode::AttemptedMarker,
            ..fast_config()
        };
        let (runner1, _) = stopping_runner(
            &[("a", Some(0)), ("b", None), ("c", Some(1)), ("d", Some(1))],
            "c",
            store.clone(),
            Arc::new(SilentProgress),
            config.clone(),
        );
        let ctx = context_for(&["a", "b", "c", "d"]);
        let job_id = ctx.job_id.clone();
        let units = ctx.state.units.clone();
        let (paused, _) = runner1.start(ctx, false).await.unwrap();
        assert_eq!(paused.state.checkpoint, 3);

        // Simulate a restart: only the store survives.
        let fresh = JobContext::new(job_id, "test.csv", units);
        let restored = fresh
            .restore(&*store, CheckpointMode::AttemptedMarker)
            .await
            .unwrap();
        assert_eq!(restored.state.checkpoint, 3);
        assert_eq!(restored.state.status, JobStatus::Paused);
        assert_eq!(restored.state.accumulated.len(), 1);

        let executor = Arc::new(ScriptedExecutor::new(&[("d", Some(1))]));
        let runner2 = runner(executor.clone(), store, Arc::new(SilentProgress), config);
        let (done, _) = runner2.resume(restored).await.unwrap();
        assert_eq!(executor.calls(), vec!["d"]);
        assert_eq!(done.state.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn pacing_applies_between_units_only() {
        let runner = runner(
            Arc::new(ScriptedExecutor::new(&[("a", Some(1)), ("b", None), ("c", Some(1))])),
            Arc::new(MemoryStore::new()),
            Arc::new(SilentProgress),
            RunnerConfig {
                pacing: Duration::from_millis(40),
                ..fast_config()
            },
        );
        let (_, report) = runner.start(context_for(&["a", "b", "c"]), false).await.unwrap();
        assert!(report.elapsed >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn resumes_from_libsql_store_after_restart() {
        use crawlbatch_storage::Storage;

        let path = std::env::temp_dir().join(format!("crawlbatch_runner_{}.db", uuid::Uuid::now_v7()));
        let doc = JobDocument {
            id: JobId::new().to_string(),
            file_name: "keywords.csv".into(),
            created_at: Utc::now(),
            rows: example_rows(),
        };

        {
            let storage = Arc::new(Storage::open(&path).await.unwrap());
            storage.insert_job(&doc).await.unwrap();
            let (runner, _) = stopping_runner(
                &[("kw1", Some(2)), ("kw2", Some(1))],
                "kw1",
                storage.clone(),
                Arc::new(SilentProgress),
                fast_config(),
            );
            let ctx = JobContext::from_document(&doc).unwrap();
            let (paused, _) = runner.start(ctx, false).await.unwrap();
            assert_eq!(paused.state.checkpoint, 1);
        }

        let storage = Arc::new(Storage::open(&path).await.unwrap());
        let stored = storage.get_job(&doc.id).await.unwrap().unwrap();
        let ctx = JobContext::from_document(&stored)
            .unwrap()
            .restore(&*storage, CheckpointMode::KeyCount)
            .await
            .unwrap();
        assert_eq!(ctx.state.checkpoint, 1);
        assert_eq!(ctx.state.status, JobStatus::Paused);
        assert_eq!(ctx.state.accumulated["kw1"].len(), 2);

        let executor = Arc::new(ScriptedExecutor::new(&[("kw2", Some(1))]));
        let runner = runner(executor.clone(), storage.clone(), Arc::new(SilentProgress), fast_config());
        let (done, _) = runner.resume(ctx).await.unwrap();

        assert_eq!(executor.calls(), vec!["kw2"]);
        assert_eq!(done.state.status, JobStatus::Completed);
        let results = storage.get_results(&doc.id).await.unwrap();
        assert_eq!(results["kw1"][0].member_id, None);
        assert_eq!(results["kw2"][0].member_id.as_deref(), Some("id3"));
        assert_eq!(results["kw2"][0].group_key, "kw2");

        drop(storage);
        let _ = std::fs::remove_file(&path);
    }
}
