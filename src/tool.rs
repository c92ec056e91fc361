/// External units of work invoked by workflow steps.
///
/// The engine never looks inside a tool: it hands over the resolved inputs
/// and expects a result payload plus the values for the step's declared
/// output keys.
use crate::error::{WeaveError, WeaveResult};
use crate::types::{MemoryValue, Namespace};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Everything a tool receives for one step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub recipe: String,
    pub step: String,
    pub namespace: Namespace,
    /// Batch item id, if the run belongs to a batch
    pub item: Option<String>,
    /// Item payload supplied at submission
    pub payload: JsonValue,
    /// Step `inputs` with `{item}` substituted
    pub inputs: BTreeMap<String, JsonValue>,
    /// Resolved `read` keys
    pub reads: BTreeMap<String, MemoryValue>,
    /// `context` keys that currently resolve
    pub context: BTreeMap<String, MemoryValue>,
    /// 0-based iteration for looping steps
    pub iteration: u32,
    /// Reviewer feedback when a checkpoint asked for a revision
    pub feedback: Option<String>,
}

/// What a tool hands back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Free-form result; declared step `outputs` are fields of this object
    pub result: JsonValue,
    /// Values for the step's `write`/`context` keys, by resolved key
    pub writes: BTreeMap<String, MemoryValue>,
}

impl ToolOutput {
    pub fn new(result: JsonValue) -> Self {
        Self {
            result,
            writes: BTreeMap::new(),
        }
    }

    pub fn with_write(mut self, key: impl Into<String>, value: impl Into<MemoryValue>) -> Self {
        self.writes.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    async fn execute(&self, invocation: ToolInvocation) -> WeaveResult<ToolOutput>;
}

type ToolFn = dyn Fn(ToolInvocation) -> WeaveResult<ToolOutput> + Send + Sync;

/// Adapts a closure into a [`Tool`].
pub struct FnTool {
    name: String,
    version: String,
    func: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F>(name: impl Into<String>, version: impl Into<String>, func: F) -> Self
    where
        F: Fn(ToolInvocation) -> WeaveResult<ToolOutput> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            version: version.into(),
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    async fn execute(&self, invocation: ToolInvocation) -> WeaveResult<ToolOutput> {
        (self.func)(invocation)
    }
}

/// Tools available to workflow runs, by name and version.
#[derive(Default)]
pub struct ToolRegistry {
    /// Registration order per name; the last entry is the latest
    tools: DashMap<String, Vec<Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Re-registering a name and version replaces it and
    /// makes it the latest.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        debug!(tool = tool.name(), version = tool.version(), "registered tool");
        let mut versions = self.tools.entry(tool.name().to_string()).or_default();
        versions.retain(|t| t.version() != tool.version());
        versions.push(tool);
    }

    /// Look up a tool; `None` for the version means the latest registered.
    pub fn get(&self, name: &str, version: Option<&str>) -> Option<Arc<dyn Tool>> {
        let versions = self.tools.get(name)?;
        match version {
            Some(v) => versions.iter().find(|t| t.version() == v).cloned(),
            None => versions.last().cloned(),
        }
    }

    /// Like [`ToolRegistry::get`], naming the step in the error.
    pub fn resolve(&self, step: &str, name: &str, version: Option<&str>) -> WeaveResult<Arc<dyn Tool>> {
        self.get(name, version).ok_or_else(|| WeaveError::ToolFailed {
            step: step.to_string(),
            tool: match version {
                Some(v) => format!("{}@{}", name, v),
                None => name.to_string(),
            },
            reason: "tool not registered".into(),
        })
    }

    pub fn contains(&self, name: &str, version: Option<&str>) -> bool {
        self.get(name, version).is_some()
    }

    /// `(name, version)` pairs in name order.
    pub fn list(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .tools
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .map(|t| (t.name().to_string(), t.version().to_string()))
                    .collect::<Vec<_>>()
            })
            .collect();
        out.sort();
        out
    }
}
