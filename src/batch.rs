/// Fan-out of one recipe across many inputs.
///
/// Each input gets its own workflow run on a bounded worker pool. A failing
/// input is retried with backoff and, once out of retries, recorded without
/// affecting its siblings. Progress counters only ever grow and can be read
/// at any time without waiting on running work.
///
/// A run that parks at a checkpoint frees its worker slot; the job stays
/// `Running` until every parked item is resumed or the job is cancelled.
use crate::config::BatchConfig;
use crate::error::{WeaveError, WeaveResult};
use crate::recipe::Recipe;
use crate::retry::{RetryPolicy, retry};
use crate::types::Namespace;
use crate::workflow::{Decision, RunInput, RunOutcome, RunReport, RunStatus, WorkflowEngine};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    AwaitingCheckpoint,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Succeeded | ItemStatus::Failed | ItemStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemResult {
    pub status: ItemStatus,
    pub retries: usize,
    pub run_id: Option<String>,
    pub error: Option<String>,
    pub report: Option<RunReport>,
}

impl ItemResult {
    fn queued() -> Self {
        Self {
            status: ItemStatus::Queued,
            retries: 0,
            run_id: None,
            error: None,
            report: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: String,
    pub recipe_ref: String,
    pub namespace: Namespace,
    pub input_set: Vec<String>,
    pub status: JobStatus,
    pub max_workers: usize,
    pub per_input_results: BTreeMap<String, ItemResult>,
    pub retry_counts: BTreeMap<String, usize>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchJob {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.per_input_results
            .values()
            .filter(|r| r.status == status)
            .count()
    }
}

/// `(completed, total, failed)` for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub failed: usize,
}

/// Export summary of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub job_id: String,
    pub recipe: String,
    pub namespace: Namespace,
    pub status: JobStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub items: BTreeMap<String, ItemResult>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

struct JobState {
    job: Mutex<BatchJob>,
    recipe: Arc<Recipe>,
    namespace: Namespace,
    policy: RetryPolicy,
    total: usize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    cancel: Arc<AtomicBool>,
    finished: AtomicBool,
    done: Notify,
}

impl JobState {
    fn snapshot(&self) -> WeaveResult<BatchJob> {
        self.job
            .lock()
            .map(|job| job.clone())
            .map_err(|_| WeaveError::Storage("batch job lock poisoned".into()))
    }

    fn update(&self, f: impl FnOnce(&mut BatchJob)) {
        match self.job.lock() {
            Ok(mut job) => f(&mut job),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn progress(&self) -> Progress {
        Progress {
            completed: self.completed.load(Ordering::Acquire),
            total: self.total,
            failed: self.failed.load(Ordering::Acquire),
        }
    }

    /// Record the result of a run (or its last attempt) for one item.
    fn record(&self, item: &str, outcome: Result<RunReport, (WeaveError, Option<RunReport>)>, retries: usize) {
        let (status, run_id, error, report) = match outcome {
            Ok(report) => {
                let status = match report.status {
                    RunStatus::AwaitingCheckpoint { .. } => ItemStatus::AwaitingCheckpoint,
                    _ => ItemStatus::Succeeded,
                };
                (status, Some(report.run_id.clone()), None, Some(report))
            }
            Err((e, report)) => {
                let status = match e {
                    WeaveError::Cancelled { .. } => ItemStatus::Cancelled,
                    _ => ItemStatus::Failed,
                };
                let run_id = report.as_ref().map(|r| r.run_id.clone());
                (status, run_id, Some(e.to_string()), report)
            }
        };

        if status.is_terminal() {
            if status == ItemStatus::Failed {
                self.failed.fetch_add(1, Ordering::AcqRel);
            }
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
        self.update(|job| {
            job.retry_counts.insert(item.to_string(), retries);
            if let Some(result) = job.per_input_results.get_mut(item) {
                result.status = status;
                result.retries = retries;
                result.run_id = run_id;
                result.error = error;
                result.report = report;
            }
        });
    }

    fn set_item(&self, item: &str, status: ItemStatus) {
        if status.is_terminal() {
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
        self.update(|job| {
            if let Some(result) = job.per_input_results.get_mut(item) {
                result.status = status;
            }
        });
    }

    /// Settle the job once every item is terminal.
    fn maybe_finish(&self) {
        let mut settled = None;
        self.update(|job| {
            if job.status.is_terminal()
                || !job.per_input_results.values().all(|r| r.status.is_terminal())
            {
                return;
            }
            let succeeded = job.count(ItemStatus::Succeeded);
            let failed = job.count(ItemStatus::Failed);
            let cancelled = job.count(ItemStatus::Cancelled);
            job.status = if cancelled > 0 && self.cancel.load(Ordering::Relaxed) {
                JobStatus::Cancelled
            } else if failed == 0 {
                JobStatus::Succeeded
            } else if succeeded == 0 {
                JobStatus::Failed
            } else {
                JobStatus::PartiallyFailed
            };
            job.finished_at = Some(Utc::now());
            settled = Some((job.id.clone(), job.status, succeeded, failed));
        });

        if let Some((id, status, succeeded, failed)) = settled {
            self.finished.store(true, Ordering::Release);
            self.done.notify_waiters();
            info!(job = %id, status = ?status, succeeded, failed, "batch finished");
        }
    }
}

pub struct BatchCoordinator {
    engine: Arc<WorkflowEngine>,
    config: BatchConfig,
    jobs: DashMap<String, Arc<JobState>>,
}

impl BatchCoordinator {
    pub fn new(engine: Arc<WorkflowEngine>, config: BatchConfig) -> Self {
        Self {
            engine,
            config,
            jobs: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Queue a job running `recipe` once per input.
    ///
    /// The recipe is validated up front; an invalid recipe never creates a
    /// job. `max_workers` defaults to the configured pool size.
    pub async fn submit(
        &self,
        recipe: Arc<Recipe>,
        namespace: &Namespace,
        inputs: Vec<RunInput>,
        max_workers: Option<usize>,
    ) -> WeaveResult<BatchJob> {
        self.engine.validate(&recipe, namespace)?;

        let mut ids = BTreeSet::new();
        for input in &inputs {
            if !ids.insert(input.id.as_str()) {
                return Err(WeaveError::Config(format!("duplicate batch input '{}'", input.id)));
            }
        }

        let workers = max_workers.unwrap_or(self.config.max_workers).max(1);
        let job = BatchJob {
            id: uuid::Uuid::new_v4().to_string(),
            recipe_ref: recipe.reference(),
            namespace: namespace.clone(),
            input_set: inputs.iter().map(|i| i.id.clone()).collect(),
            status: JobStatus::Queued,
            max_workers: workers,
            per_input_results: inputs
                .iter()
                .map(|i| (i.id.clone(), ItemResult::queued()))
                .collect(),
            retry_counts: BTreeMap::new(),
            created_at: Utc::now(),
            finished_at: None,
        };
        let state = Arc::new(JobState {
            job: Mutex::new(job.clone()),
            recipe,
            namespace: namespace.clone(),
            policy: self.config.retry.clone(),
            total: inputs.len(),
            completed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            cancel: Arc::new(AtomicBool::new(false)),
            finished: AtomicBool::new(false),
            done: Notify::new(),
        });
        self.jobs.insert(job.id.clone(), Arc::clone(&state));
        info!(job = %job.id, recipe = %job.recipe_ref, inputs = inputs.len(), workers, "batch submitted");

        let engine = Arc::clone(&self.engine);
        tokio::spawn(dispatch(engine, state, inputs, workers));
        Ok(job)
    }

    /// Non-blocking progress read.
    pub fn progress(&self, job_id: &str) -> Option<Progress> {
        self.jobs.get(job_id).map(|s| s.progress())
    }

    pub fn job(&self, job_id: &str) -> Option<BatchJob> {
        self.jobs.get(job_id).and_then(|s| s.snapshot().ok())
    }

    pub fn list(&self) -> Vec<BatchJob> {
        let mut jobs: Vec<BatchJob> = self
            .jobs
            .iter()
            .filter_map(|s| s.value().snapshot().ok())
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    /// Wait until a job is terminal. Jobs with parked items only finish once
    /// those are resumed or the job is cancelled.
    pub async fn wait(&self, job_id: &str) -> WeaveResult<BatchJob> {
        let state = self.state(job_id)?;
        loop {
            let notified = state.done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if state.finished.load(Ordering::Acquire) {
                return state.snapshot();
            }
            notified.await;
        }
    }

    /// Decide a parked item's checkpoint.
    pub async fn resume(&self, job_id: &str, item: &str, decision: Decision) -> WeaveResult<ItemResult> {
        let state = self.state(job_id)?;
        let (status, run_id, retries) = {
            let job = state.snapshot()?;
            let result = job
                .per_input_results
                .get(item)
                .ok_or_else(|| WeaveError::Storage(format!("job {} has no input '{}'", job_id, item)))?;
            (result.status, result.run_id.clone(), result.retries)
        };
        let (ItemStatus::AwaitingCheckpoint, Some(run_id)) = (status, run_id) else {
            return Err(WeaveError::Storage(format!("input '{}' is not awaiting a checkpoint", item)));
        };

        let RunOutcome { report, error } = self.engine.resume(&run_id, decision).await?;
        let outcome = match error {
            Some(e) => Err((e, Some(report))),
            None => Ok(report),
        };
        state.record(item, outcome, retries);
        state.maybe_finish();

        let job = state.snapshot()?;
        job.per_input_results
            .get(item)
            .cloned()
            .ok_or_else(|| WeaveError::Storage(format!("job {} has no input '{}'", job_id, item)))
    }

    /// Stop dispatching new items. Running items stop at their next step
    /// boundary and parked items are cancelled.
    pub fn cancel(&self, job_id: &str) -> WeaveResult<()> {
        let state = self.state(job_id)?;
        state.cancel.store(true, Ordering::Release);

        let parked: Vec<(String, String)> = state
            .snapshot()?
            .per_input_results
            .iter()
            .filter(|(_, r)| r.status == ItemStatus::AwaitingCheckpoint)
            .filter_map(|(id, r)| r.run_id.clone().map(|run| (id.clone(), run)))
            .collect();
        for (item, run_id) in parked {
            if let Some(RunOutcome { report, error }) = self.engine.cancel_parked(&run_id) {
                let error = error.unwrap_or(WeaveError::Cancelled { step: String::new() });
                state.record(&item, Err((error, Some(report))), 0);
            }
        }
        info!(job = %job_id, "batch cancellation requested");
        state.maybe_finish();
        Ok(())
    }

    /// Summary for export. Only available once the job is terminal, so the
    /// data handed over is complete.
    pub fn report(&self, job_id: &str) -> WeaveResult<BatchReport> {
        let job = self.state(job_id)?.snapshot()?;
        if !job.status.is_terminal() {
            return Err(WeaveError::Storage(format!("job {} is still {:?}", job_id, job.status)));
        }
        Ok(BatchReport {
            job_id: job.id.clone(),
            recipe: job.recipe_ref.clone(),
            namespace: job.namespace.clone(),
            status: job.status,
            total: job.input_set.len(),
            succeeded: job.count(ItemStatus::Succeeded),
            failed: job.count(ItemStatus::Failed),
            cancelled: job.count(ItemStatus::Cancelled),
            items: job.per_input_results,
            created_at: job.created_at,
            finished_at: job.finished_at,
        })
    }

    /// Hand off a finished job's report and forget the job.
    pub fn archive(&self, job_id: &str) -> WeaveResult<BatchReport> {
        let report = self.report(job_id)?;
        self.jobs.remove(job_id);
        debug!(job = %job_id, "batch archived");
        Ok(report)
    }

    fn state(&self, job_id: &str) -> WeaveResult<Arc<JobState>> {
        self.jobs
            .get(job_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| WeaveError::Storage(format!("unknown batch job '{}'", job_id)))
    }
}

async fn dispatch(engine: Arc<WorkflowEngine>, state: Arc<JobState>, inputs: Vec<RunInput>, workers: usize) {
    state.update(|job| job.status = JobStatus::Running);
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut handles = Vec::with_capacity(inputs.len());

    for input in inputs {
        if state.cancel.load(Ordering::Acquire) {
            state.set_item(&input.id, ItemStatus::Cancelled);
            continue;
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if state.cancel.load(Ordering::Acquire) {
            state.set_item(&input.id, ItemStatus::Cancelled);
            continue;
        }

        let engine = Arc::clone(&engine);
        let state = Arc::clone(&state);
        handles.push(tokio::spawn(async move {
            run_item(&engine, &state, input).await;
            drop(permit);
        }));
    }

    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            warn!(error = %e, "batch worker panicked");
        }
    }
    state.maybe_finish();
}

async fn run_item(engine: &WorkflowEngine, state: &JobState, input: RunInput) {
    state.set_item(&input.id, ItemStatus::Running);
    let attempts = AtomicUsize::new(0);
    let last_report: Mutex<Option<RunReport>> = Mutex::new(None);
    let operation = format!("batch item '{}'", input.id);

    let result = retry(&operation, &state.policy, || {
        let attempts = &attempts;
        let last_report = &last_report;
        let input = input.clone();
        async move {
            attempts.fetch_add(1, Ordering::Relaxed);
            let RunOutcome { report, error } = engine
                .execute(
                    Arc::clone(&state.recipe),
                    &state.namespace,
                    input,
                    Some(Arc::clone(&state.cancel)),
                )
                .await;
            if let Ok(mut slot) = last_report.lock() {
                *slot = Some(report.clone());
            }
            match error {
                Some(e) => Err(e),
                None => Ok(report),
            }
        }
    })
    .await;

    let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
    let outcome = match result {
        Ok((report, _)) => Ok(report),
        Err(e) => {
            let report = last_report.lock().ok().and_then(|mut slot| slot.take());
            warn!(item = %input.id, retries, error = %e, "batch item failed");
            Err((e, report))
        }
    };
    let parked_run = match &outcome {
        Ok(report) if matches!(report.status, RunStatus::AwaitingCheckpoint { .. }) => Some(report.run_id.clone()),
        _ => None,
    };
    state.record(&input.id, outcome, retries);

    // A cancel that landed while this run was parking did not see it.
    if let Some(run_id) = parked_run {
        if state.cancel.load(Ordering::Acquire) {
            if let Some(RunOutcome { report, error }) = engine.cancel_parked(&run_id) {
                let error = error.unwrap_or(WeaveError::Cancelled { step: String::new() });
                state.record(&input.id, Err((error, Some(report))), retries);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLayer;
    use crate::compression::CompressionEngine;
    use crate::config::RetentionConfig;
    use crate::schema::SchemaRegistry;
    use crate::storage::TieredStore;
    use crate::tool::{FnTool, ToolOutput, ToolRegistry};
    use serde_json::json;

    fn ns() -> Namespace {
        "acme/research/interviews".parse().unwrap()
    }

    fn coordinator(workers: usize) -> BatchCoordinator {
        let store = Arc::new(TieredStore::new(
            Arc::new(CompressionEngine::default()),
            Arc::new(SchemaRegistry::new()),
            RetentionConfig::default(),
        ));
        let cache = Arc::new(CacheLayer::new(store, 1 << 20));
        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(FnTool::new("summarize", "1", |inv| {
            let item = inv.item.clone().unwrap_or_default();
            if let Some(ms) = inv.payload["delay_ms"].as_u64() {
                std::thread::sleep(std::time::Duration::from_millis(ms));
            }
            if inv.payload["fail"].as_bool() == Some(true) {
                return Err(WeaveError::ToolFailed {
                    step: inv.step,
                    tool: "summarize".into(),
                    reason: "model unavailable".into(),
                });
            }
            Ok(ToolOutput::new(json!({})).with_write(format!("summary/{}", item), json!({"item": item})))
        })));
        let engine = Arc::new(WorkflowEngine::new(cache, tools));
        BatchCoordinator::new(
            engine,
            BatchConfig {
                max_workers: workers,
                retry: RetryPolicy::immediate(2),
            },
        )
    }

    fn recipe(checkpoint: bool) -> Arc<Recipe> {
        let mut doc = String::from(
            "name = \"summaries\"\nversion = \"1\"\n\n[[steps]]\nname = \"summarize\"\ntype = \"tool\"\ntool = \"summarize\"\nmemory = { write = [\"summary/{item}\"] }\n",
        );
        if checkpoint {
            doc.push_str("user_checkpoint = true\n");
        }
        Arc::new(Recipe::from_toml_str(&doc).unwrap())
    }

    fn inputs(n: usize, failing: &[usize]) -> Vec<RunInput> {
        (0..n)
            .map(|i| RunInput::new(format!("p{}", i), json!({"fail": failing.contains(&i)})))
            .collect()
    }

    #[tokio::test]
    async fn test_all_items_succeed() {
        let coordinator = coordinator(3);
        let job = coordinator
            .submit(recipe(false), &ns(), inputs(5, &[]), None)
            .await
            .unwrap();
        assert_eq!(job.max_workers, 3);
        let done = coordinator.wait(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(
            coordinator.progress(&job.id).unwrap(),
            Progress {
                completed: 5,
                total: 5,
                failed: 0
            }
        );
        assert_eq!(coordinator.engine().stats().runs_succeeded, 5);
    }

    #[tokio::test]
    async fn test_partial_failure_isolated_and_retried() {
        let coordinator = coordinator(4);
        let job = coordinator
            .submit(recipe(false), &ns(), inputs(6, &[1, 4]), Some(2))
            .await
            .unwrap();
        let done = coordinator.wait(&job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::PartiallyFailed);
        assert_eq!(done.count(ItemStatus::Succeeded), 4);
        assert_eq!(done.count(ItemStatus::Failed), 2);
        assert_eq!(done.retry_counts["p1"], 2);
        assert_eq!(done.retry_counts["p0"], 0);
        assert!(
            done.per_input_results["p4"]
                .error
                .as_deref()
                .unwrap()
                .contains("3 attempts")
        );
        let report = coordinator.report(&job.id).unwrap();
        assert_eq!(report.failed, 2);
    }

    #[tokio::test]
    async fn test_invalid_recipe_creates_no_job() {
        let coordinator = coordinator(1);
        let doc = "name = \"bad\"\nversion = \"1\"\n[[steps]]\nname = \"x\"\ntype = \"tool\"\ntool = \"missing\"\n";
        let recipe = Arc::new(Recipe::from_toml_str(doc).unwrap());
        let err = coordinator
            .submit(recipe, &ns(), inputs(2, &[]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WeaveError::InvalidRecipe { .. }));
        assert!(coordinator.list().is_empty());
    }

    #[tokio::test]
    async fn test_parked_items_resume_then_finish() {
        let coordinator = coordinator(2);
        let job = coordinator
            .submit(recipe(true), &ns(), inputs(2, &[]), None)
            .await
            .unwrap();

        // Both items park; wait for the dispatcher to get them there.
        for _ in 0..200 {
            let snapshot = coordinator.job(&job.id).unwrap();
            if snapshot.count(ItemStatus::AwaitingCheckpoint) == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(coordinator.report(&job.id).is_err());
        assert_eq!(coordinator.engine().stats().parked, 2);

        let approved = coordinator.resume(&job.id, "p0", Decision::Approve).await.unwrap();
        assert_eq!(approved.status, ItemStatus::Succeeded);
        let aborted = coordinator.resume(&job.id, "p1", Decision::Abort).await.unwrap();
        assert_eq!(aborted.status, ItemStatus::Failed);

        let done = coordinator.wait(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::PartiallyFailed);
        let report = coordinator.archive(&job.id).unwrap();
        assert_eq!(report.succeeded, 1);
        assert!(coordinator.job(&job.id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_parked_job() {
        let coordinator = coordinator(1);
        let job = coordinator
            .submit(recipe(true), &ns(), inputs(1, &[]), None)
            .await
            .unwrap();
        for _ in 0..200 {
            if coordinator.job(&job.id).unwrap().count(ItemStatus::AwaitingCheckpoint) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        coordinator.cancel(&job.id).unwrap();
        let done = coordinator.wait(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(coordinator.progress(&job.id).unwrap().completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_during_step_before_checkpoint_terminates() {
        let coordinator = coordinator(1);
        let input = vec![RunInput::new("p0", json!({"delay_ms": 300}))];
        let job = coordinator.submit(recipe(true), &ns(), input, None).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        coordinator.cancel(&job.id).unwrap();

        let done = tokio::time::timeout(std::time::Duration::from_secs(3), coordinator.wait(&job.id))
            .await
            .expect("cancelled job never settled")
            .unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(done.per_input_results["p0"].status, ItemStatus::Cancelled);
        assert_eq!(coordinator.engine().stats().parked, 0);
        assert_eq!(coordinator.progress(&job.id).unwrap().completed, 1);
    }
}
