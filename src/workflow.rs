/// Recipe execution against a namespace.
///
/// Each step moves `Pending -> Running -> {Succeeded, Failed, AwaitingCheckpoint}`
/// (or `Skipped` when its condition does not hold). Steps whose dependencies
/// are done run as one wave; members of a branch group land in the same wave
/// and run concurrently.
///
/// A run that reaches a checkpoint is parked inside the engine and the call
/// returns, freeing the caller. [`WorkflowEngine::resume`] continues it with
/// an approve, revise or abort decision.
///
/// All memory access goes through the [`CacheLayer`], so writes from
/// concurrent runs to the same key are serialized there.
use crate::cache::CacheLayer;
use crate::error::{WeaveError, WeaveResult};
use crate::integrity::Rebuilder;
use crate::recipe::{Recipe, RecipePlan, Step, StepType};
use crate::tool::{ToolInvocation, ToolOutput, ToolRegistry};
use crate::types::{MemoryValue, Namespace, RecordKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

/// Metadata keys stamped on every value a step writes.
pub const META_RECIPE: &str = "recipe";
pub const META_STEP: &str = "step";
pub const META_RUN: &str = "run";
pub const META_ITEM: &str = "item";

/// One unit of work for a run: an id (used for `{item}` keys) and a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInput {
    pub id: String,
    pub payload: JsonValue,
}

impl RunInput {
    pub fn new(id: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    AwaitingCheckpoint,
    Skipped,
}

impl StepState {
    fn is_done(self) -> bool {
        matches!(self, StepState::Succeeded | StepState::Skipped)
    }
}

/// A key written by a step and the revision it got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrittenKey {
    pub record: RecordKey,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub state: StepState,
    /// Body executions, counting loop iterations and revisions
    pub executions: u32,
    pub written: Vec<WrittenKey>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    AwaitingCheckpoint { step: String },
    Succeeded,
    Failed,
    Aborted,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::AwaitingCheckpoint { .. })
    }
}

/// Summary of a run, suitable for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub recipe: String,
    pub namespace: Namespace,
    pub item: String,
    pub status: RunStatus,
    pub steps: Vec<StepReport>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunReport {
    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Every key written during the run, in step order.
    pub fn written(&self) -> impl Iterator<Item = &WrittenKey> {
        self.steps.iter().flat_map(|s| s.written.iter())
    }
}

/// A run's report plus the error that ended it, if any.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub error: Option<WeaveError>,
}

impl RunOutcome {
    pub fn into_result(self) -> WeaveResult<RunReport> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.report),
        }
    }
}

/// External decision for a parked checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    /// Re-run the checkpointed work with feedback, then wait again
    Revise { feedback: String },
    Abort,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowStats {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub steps_executed: u64,
    pub checkpoints: u64,
    pub parked: usize,
}

struct RunState {
    id: String,
    recipe: Arc<Recipe>,
    plan: Arc<RecipePlan>,
    namespace: Namespace,
    input: RunInput,
    steps: Vec<StepReport>,
    results: Vec<Option<JsonValue>>,
    cancel: Option<Arc<AtomicBool>>,
    started_at: DateTime<Utc>,
}

impl RunState {
    fn report(&self, status: RunStatus, error: Option<String>) -> RunReport {
        let finished_at = status.is_terminal().then(Utc::now);
        RunReport {
            run_id: self.id.clone(),
            recipe: self.recipe.reference(),
            namespace: self.namespace.clone(),
            item: self.input.id.clone(),
            status,
            steps: self.steps.clone(),
            error,
            started_at: self.started_at,
            finished_at,
        }
    }

    fn awaiting(&self) -> Option<usize> {
        self.plan
            .order
            .iter()
            .copied()
            .find(|&i| self.steps[i].state == StepState::AwaitingCheckpoint)
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

struct StepDone {
    result: JsonValue,
    written: Vec<WrittenKey>,
    executions: u32,
}

/// Which step of which run last produced a key.
#[derive(Clone)]
struct Provenance {
    recipe: Arc<Recipe>,
    step: usize,
    namespace: Namespace,
    input: RunInput,
}

pub struct WorkflowEngine {
    cache: Arc<CacheLayer>,
    tools: Arc<ToolRegistry>,
    parked: DashMap<String, RunState>,
    provenance: DashMap<RecordKey, Provenance>,
    runs_started: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    steps_executed: AtomicU64,
    checkpoints: AtomicU64,
}

impl WorkflowEngine {
    pub fn new(cache: Arc<CacheLayer>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            cache,
            tools,
            parked: DashMap::new(),
            provenance: DashMap::new(),
            runs_started: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            steps_executed: AtomicU64::new(0),
            checkpoints: AtomicU64::new(0),
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Validate a recipe for use against `namespace`: structure, declared
    /// memory use, and that every tool is registered.
    pub fn validate(&self, recipe: &Recipe, namespace: &Namespace) -> WeaveResult<RecipePlan> {
        let plan = recipe.plan()?;
        if !recipe.memory_interactions.allows_namespace(namespace) {
            return Err(WeaveError::invalid_recipe(
                &recipe.reference(),
                format!("namespace {} is outside memory_interactions", namespace),
            ));
        }
        for step in &recipe.steps {
            if let Some(tool) = &step.tool {
                if !self.tools.contains(tool, step.tool_version.as_deref()) {
                    return Err(WeaveError::invalid_recipe(
                        &recipe.reference(),
                        format!("step '{}' uses unregistered tool '{}'", step.name, tool),
                    ));
                }
            }
        }
        Ok(plan)
    }

    /// Run a recipe to completion, failure or its first checkpoint.
    pub async fn run(&self, recipe: Arc<Recipe>, namespace: &Namespace, input: RunInput) -> WeaveResult<RunReport> {
        self.execute(recipe, namespace, input, None).await.into_result()
    }

    /// Like [`WorkflowEngine::run`], keeping the partial report on failure.
    /// `cancel` is checked at every step boundary.
    pub async fn execute(
        &self,
        recipe: Arc<Recipe>,
        namespace: &Namespace,
        input: RunInput,
        cancel: Option<Arc<AtomicBool>>,
    ) -> RunOutcome {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
        let steps = recipe
            .steps
            .iter()
            .map(|s| StepReport {
                name: s.name.clone(),
                state: StepState::Pending,
                executions: 0,
                written: Vec::new(),
                result: None,
                error: None,
            })
            .collect::<Vec<_>>();
        let step_count = steps.len();
        let mut state = RunState {
            id: uuid::Uuid::new_v4().to_string(),
            plan: Arc::new(RecipePlan {
                order: Vec::new(),
                deps: Vec::new(),
                external_reads: Vec::new(),
            }),
            recipe,
            namespace: namespace.clone(),
            input,
            steps,
            results: vec![None; step_count],
            cancel,
            started_at: Utc::now(),
        };

        let plan = match self.validate(&state.recipe, namespace) {
            Ok(plan) => plan,
            Err(e) => return self.finish(state, RunStatus::Failed, Some(e)),
        };
        state.plan = Arc::new(plan);

        // Reads nothing in the recipe produces must already exist.
        for (idx, key_ref) in state.plan.external_reads.clone() {
            let key = key_ref.resolve(Some(&state.input.id));
            if let Err(e) = self.cache.get(namespace, key_ref.tier, &key) {
                let step = state.recipe.steps[idx].name.clone();
                let e = as_missing(e, &step, namespace, &key);
                state.steps[idx].state = StepState::Failed;
                state.steps[idx].error = Some(e.to_string());
                return self.finish(state, RunStatus::Failed, Some(e));
            }
        }

        debug!(run = %state.id, recipe = %state.recipe.reference(), item = %state.input.id, "run started");
        self.drive(state).await
    }

    /// Continue a parked run.
    pub async fn resume(&self, run_id: &str, decision: Decision) -> WeaveResult<RunOutcome> {
        let Some((_, mut state)) = self.parked.remove(run_id) else {
            return Err(WeaveError::Storage(format!("no run '{}' is awaiting a checkpoint", run_id)));
        };
        let Some(idx) = state.awaiting() else {
            return Ok(self.drive(state).await);
        };
        let step_name = state.recipe.steps[idx].name.clone();
        info!(run = %run_id, step = %step_name, decision = ?decision, "checkpoint decided");

        match decision {
            Decision::Approve => {
                state.steps[idx].state = StepState::Succeeded;
                Ok(self.drive(state).await)
            }
            Decision::Abort => {
                state.steps[idx].state = StepState::Failed;
                state.steps[idx].error = Some("aborted at checkpoint".into());
                Ok(self.finish(
                    state,
                    RunStatus::Aborted,
                    Some(WeaveError::CheckpointRejected { step: step_name }),
                ))
            }
            Decision::Revise { feedback } => {
                let step = &state.recipe.steps[idx];
                let targets: Vec<usize> = if step.step_type == StepType::Tool {
                    vec![idx]
                } else {
                    state.plan.deps[idx]
                        .iter()
                        .copied()
                        .filter(|&d| state.recipe.steps[d].step_type == StepType::Tool)
                        .collect()
                };
                if targets.is_empty() {
                    warn!(run = %run_id, step = %step_name, "nothing to revise, waiting again");
                }
                for target in targets {
                    state.steps[target].state = StepState::Running;
                    match self.execute_step(&state, target, Some(&feedback)).await {
                        Ok(done) => self.apply_done(&mut state, target, done, false),
                        Err(e) => {
                            state.steps[target].state = StepState::Failed;
                            state.steps[target].error = Some(e.to_string());
                            return Ok(self.finish(state, RunStatus::Failed, Some(e)));
                        }
                    }
                }
                state.steps[idx].state = StepState::AwaitingCheckpoint;
                Ok(self.drive(state).await)
            }
        }
    }

    /// Drop provenance for records that no longer exist in the store.
    /// Quarantined namespaces keep theirs for a later rebuild.
    pub fn prune_provenance(&self) -> usize {
        let store = self.cache.store();
        let before = self.provenance.len();
        self.provenance.retain(|record, _| {
            store.is_quarantined(&record.namespace) || store.key_history(record).is_some()
        });
        let pruned = before.saturating_sub(self.provenance.len());
        if pruned > 0 {
            debug!(pruned, "provenance pruned");
        }
        pruned
    }

    /// Cancel a parked run.
    pub fn cancel_parked(&self, run_id: &str) -> Option<RunOutcome> {
        let (_, state) = self.parked.remove(run_id)?;
        let step = state
            .awaiting()
            .map(|i| state.recipe.steps[i].name.clone())
            .unwrap_or_default();
        Some(self.finish(state, RunStatus::Cancelled, Some(WeaveError::Cancelled { step })))
    }

    /// Report for a parked run.
    pub fn parked_report(&self, run_id: &str) -> Option<RunReport> {
        let state = self.parked.get(run_id)?;
        let step = state.awaiting().map(|i| state.recipe.steps[i].name.clone())?;
        Some(state.report(RunStatus::AwaitingCheckpoint { step }, None))
    }

    pub fn parked_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.parked.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> WorkflowStats {
        WorkflowStats {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            parked: self.parked.len(),
        }
    }

    async fn drive(&self, mut state: RunState) -> RunOutcome {
        loop {
            if let Some(idx) = state.awaiting() {
                if state.cancelled() {
                    let step = state.recipe.steps[idx].name.clone();
                    state.steps[idx].state = StepState::Failed;
                    state.steps[idx].error = Some("cancelled before checkpoint".into());
                    return self.finish(state, RunStatus::Cancelled, Some(WeaveError::Cancelled { step }));
                }
                return self.park(state, idx);
            }

            let ready: Vec<usize> = state
                .plan
                .order
                .iter()
                .copied()
                .filter(|&i| {
                    state.steps[i].state == StepState::Pending
                        && state.plan.deps[i].iter().all(|&d| state.steps[d].state.is_done())
                })
                .collect();
            if ready.is_empty() {
                return self.finish(state, RunStatus::Succeeded, None);
            }

            if state.cancelled() {
                let step = state.recipe.steps[ready[0]].name.clone();
                return self.finish(state, RunStatus::Cancelled, Some(WeaveError::Cancelled { step }));
            }

            let mut runnable = Vec::with_capacity(ready.len());
            for idx in ready {
                if self.condition_holds(&state, idx) {
                    state.steps[idx].state = StepState::Running;
                    runnable.push(idx);
                } else {
                    debug!(run = %state.id, step = %state.recipe.steps[idx].name, "condition false, step skipped");
                    state.steps[idx].state = StepState::Skipped;
                }
            }
            if runnable.is_empty() {
                continue;
            }

            let outcomes = join_all(runnable.iter().map(|&idx| self.execute_step(&state, idx, None))).await;

            let mut failure = None;
            for (idx, outcome) in runnable.into_iter().zip(outcomes) {
                match outcome {
                    Ok(done) => self.apply_done(&mut state, idx, done, true),
                    Err(e) => {
                        warn!(run = %state.id, step = %state.recipe.steps[idx].name, error = %e, "step failed");
                        state.steps[idx].state = StepState::Failed;
                        state.steps[idx].error = Some(e.to_string());
                        failure.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = failure {
                return self.finish(state, RunStatus::Failed, Some(e));
            }
        }
    }

    fn condition_holds(&self, state: &RunState, idx: usize) -> bool {
        let Some(condition) = &state.recipe.steps[idx].condition else {
            return true;
        };
        let source = match &condition.step {
            Some(name) => state.recipe.step_index(name),
            None => state.plan.last_dependency(idx),
        };
        let result = source
            .and_then(|s| state.results[s].as_ref())
            .unwrap_or(&JsonValue::Null);
        condition.evaluate(result)
    }

    fn apply_done(&self, state: &mut RunState, idx: usize, done: StepDone, allow_checkpoint: bool) {
        let step = &state.recipe.steps[idx];
        let report = &mut state.steps[idx];
        report.state = if allow_checkpoint && step.is_checkpoint() {
            self.checkpoints.fetch_add(1, Ordering::Relaxed);
            StepState::AwaitingCheckpoint
        } else {
            StepState::Succeeded
        };
        report.executions += done.executions;
        report.written.extend(done.written);
        report.result = Some(done.result.clone());
        report.error = None;
        state.results[idx] = Some(done.result);
    }

    fn park(&self, state: RunState, idx: usize) -> RunOutcome {
        let step = state.recipe.steps[idx].name.clone();
        info!(run = %state.id, step = %step, "run awaiting checkpoint");
        let report = state.report(RunStatus::AwaitingCheckpoint { step }, None);
        self.parked.insert(state.id.clone(), state);
        RunOutcome { report, error: None }
    }

    fn finish(&self, state: RunState, status: RunStatus, error: Option<WeaveError>) -> RunOutcome {
        match status {
            RunStatus::Succeeded => {
                self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
                info!(run = %state.id, recipe = %state.recipe.reference(), item = %state.input.id, "run succeeded");
            }
            _ => {
                self.runs_failed.fetch_add(1, Ordering::Relaxed);
                debug!(run = %state.id, status = ?status, "run ended");
            }
        }
        let message = error.as_ref().map(|e| e.to_string());
        RunOutcome {
            report: state.report(status, message),
            error,
        }
    }

    async fn execute_step(&self, state: &RunState, idx: usize, feedback: Option<&str>) -> WeaveResult<StepDone> {
        let step = &state.recipe.steps[idx];
        let namespace = &state.namespace;
        let item = state.input.id.as_str();
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
        trace!(run = %state.id, step = %step.name, "step running");

        match step.step_type {
            StepType::Checkpoint => {
                let reads = self.resolve_reads(step, namespace, item)?;
                Ok(StepDone {
                    result: JsonValue::Object(
                        reads
                            .into_iter()
                            .filter_map(|(k, v)| v.document().cloned().map(|d| (k, d)))
                            .collect(),
                    ),
                    written: Vec::new(),
                    executions: 0,
                })
            }
            StepType::Archive => {
                let mut written = Vec::new();
                for key_ref in &step.memory.read {
                    let key = key_ref.resolve(Some(item));
                    let Some(target) = key_ref.tier.next() else {
                        continue;
                    };
                    let revision = self
                        .cache
                        .promote(namespace, &key, key_ref.tier, target)
                        .map_err(|e| as_missing(e, &step.name, namespace, &key))?;
                    written.push(WrittenKey {
                        record: RecordKey::new(namespace.clone(), target, key),
                        revision,
                    });
                }
                let archived = written.len();
                Ok(StepDone {
                    result: serde_json::json!({ "archived": archived }),
                    written,
                    executions: 1,
                })
            }
            StepType::Tool => self.run_tool_step(state, idx, feedback).await,
        }
    }

    async fn run_tool_step(&self, state: &RunState, idx: usize, feedback: Option<&str>) -> WeaveResult<StepDone> {
        let step = &state.recipe.steps[idx];
        let namespace = &state.namespace;
        let item = state.input.id.as_str();
        let tool_name = step.tool.as_deref().unwrap_or_default();
        let tool = self
            .tools
            .resolve(&step.name, tool_name, step.tool_version.as_deref())?;

        let reads = self.resolve_reads(step, namespace, item)?;
        let inputs: BTreeMap<String, JsonValue> = step
            .inputs
            .iter()
            .map(|(k, v)| (k.clone(), substitute(v, item)))
            .collect();
        let max = step.iteration.as_ref().map(|it| it.max).unwrap_or(1);

        let mut written = Vec::new();
        let mut result = JsonValue::Null;
        let mut executions = 0;
        for iteration in 0..max {
            let invocation = ToolInvocation {
                recipe: state.recipe.name.clone(),
                step: step.name.clone(),
                namespace: namespace.clone(),
                item: Some(item.to_string()),
                payload: state.input.payload.clone(),
                inputs: inputs.clone(),
                reads: reads.clone(),
                context: self.resolve_context(step, namespace, item)?,
                iteration,
                feedback: feedback.map(str::to_string),
            };
            let output = tool.execute(invocation).await?;
            executions += 1;
            check_output(step, tool.name(), item, &output)?;

            let mut metadata = BTreeMap::new();
            metadata.insert(META_RECIPE.to_string(), state.recipe.reference());
            metadata.insert(META_STEP.to_string(), step.name.clone());
            metadata.insert(META_RUN.to_string(), state.id.clone());
            metadata.insert(META_ITEM.to_string(), item.to_string());

            let mut pending = Vec::new();
            for key_ref in step.memory.write.iter().chain(&step.memory.context) {
                let key = key_ref.resolve(Some(item));
                let Some(value) = output.writes.get(&key) else {
                    continue;
                };
                self.cache.store().check_writable(namespace, &key, value)?;
                pending.push((RecordKey::new(namespace.clone(), key_ref.tier, key), value));
            }

            // Outputs of one execution land together or not at all.
            let mut committed: Vec<WrittenKey> = Vec::with_capacity(pending.len());
            for (record, value) in pending {
                match self
                    .cache
                    .put(namespace, record.tier, &record.key, value, metadata.clone())
                {
                    Ok(revision) => committed.push(WrittenKey { record, revision }),
                    Err(e) => {
                        for done in committed.iter().rev() {
                            if let Err(undo) = self.cache.revert(&done.record, done.revision) {
                                warn!(record = %done.record, error = %undo, "could not revert partial step output");
                            }
                        }
                        return Err(e);
                    }
                }
            }
            for done in &committed {
                self.provenance.insert(
                    done.record.clone(),
                    Provenance {
                        recipe: Arc::clone(&state.recipe),
                        step: idx,
                        namespace: namespace.clone(),
                        input: state.input.clone(),
                    },
                );
            }
            written.extend(committed);

            result = output.result;
            let done = step
                .iteration
                .as_ref()
                .and_then(|it| it.until.as_ref())
                .is_some_and(|until| until.evaluate(&result));
            if done {
                break;
            }
        }

        Ok(StepDone {
            result,
            written,
            executions,
        })
    }

    fn resolve_reads(&self, step: &Step, namespace: &Namespace, item: &str) -> WeaveResult<BTreeMap<String, MemoryValue>> {
        let mut reads = BTreeMap::new();
        for key_ref in &step.memory.read {
            let key = key_ref.resolve(Some(item));
            let record = self
                .cache
                .get(namespace, key_ref.tier, &key)
                .map_err(|e| as_missing(e, &step.name, namespace, &key))?;
            reads.insert(key, record.value);
        }
        Ok(reads)
    }

    fn resolve_context(&self, step: &Step, namespace: &Namespace, item: &str) -> WeaveResult<BTreeMap<String, MemoryValue>> {
        let mut context = BTreeMap::new();
        for key_ref in &step.memory.context {
            let key = key_ref.resolve(Some(item));
            match self.cache.get(namespace, key_ref.tier, &key) {
                Ok(record) => {
                    context.insert(key, record.value);
                }
                Err(WeaveError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(context)
    }
}

#[async_trait]
impl Rebuilder for WorkflowEngine {
    /// Re-run the tool step that last wrote `record`, if its inputs still
    /// resolve.
    async fn rebuild(&self, record: &RecordKey) -> WeaveResult<Option<MemoryValue>> {
        let Some(origin) = self.provenance.get(record).map(|p| p.value().clone()) else {
            return Ok(None);
        };
        let step = &origin.recipe.steps[origin.step];
        if step.step_type != StepType::Tool {
            return Ok(None);
        }
        let item = origin.input.id.as_str();
        let Some(tool) = step
            .tool
            .as_deref()
            .and_then(|name| self.tools.get(name, step.tool_version.as_deref()))
        else {
            return Ok(None);
        };
        let Ok(reads) = self.resolve_reads(step, &origin.namespace, item) else {
            return Ok(None);
        };
        let context = self
            .resolve_context(step, &origin.namespace, item)
            .unwrap_or_default();

        let invocation = ToolInvocation {
            recipe: origin.recipe.name.clone(),
            step: step.name.clone(),
            namespace: origin.namespace.clone(),
            item: Some(item.to_string()),
            payload: origin.input.payload.clone(),
            inputs: step
                .inputs
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, item)))
                .collect(),
            reads,
            context,
            iteration: 0,
            feedback: None,
        };
        let mut output = tool.execute(invocation).await?;
        debug!(record = %record, step = %step.name, "re-ran producing step");
        Ok(output.writes.remove(&record.key))
    }
}

/// Declared result fields and write keys must match what the tool returned.
fn check_output(step: &Step, tool: &str, item: &str, output: &ToolOutput) -> WeaveResult<()> {
    let failed = |reason: String| WeaveError::ToolFailed {
        step: step.name.clone(),
        tool: tool.to_string(),
        reason,
    };
    for field in &step.outputs {
        if output.result.get(field).is_none() {
            return Err(failed(format!("result lacks declared output '{}'", field)));
        }
    }
    for key_ref in &step.memory.write {
        let key = key_ref.resolve(Some(item));
        if !output.writes.contains_key(&key) {
            return Err(failed(format!("no value for declared write '{}'", key)));
        }
    }
    for key in output.writes.keys() {
        let declared = step
            .memory
            .write
            .iter()
            .chain(&step.memory.context)
            .any(|k| &k.resolve(Some(item)) == key);
        if !declared {
            return Err(failed(format!("undeclared write '{}'", key)));
        }
    }
    Ok(())
}

fn as_missing(err: WeaveError, step: &str, namespace: &Namespace, key: &str) -> WeaveError {
    match err {
        WeaveError::NotFound { .. } => WeaveError::MissingInput {
            step: step.to_string(),
            namespace: namespace.to_string(),
            key: key.to_string(),
        },
        other => other,
    }
}

fn substitute(value: &JsonValue, item: &str) -> JsonValue {
    match value {
        JsonValue::String(s) => JsonValue::String(s.replace(crate::recipe::ITEM_PLACEHOLDER, item)),
        JsonValue::Array(values) => JsonValue::Array(values.iter().map(|v| substitute(v, item)).collect()),
        JsonValue::Object(map) => JsonValue::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, item)))
                .collect(),
        ),
        other => other.clone(),
    }
}
