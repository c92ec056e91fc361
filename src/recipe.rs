/// Recipe documents and their static validation.
///
/// A recipe is an ordered list of steps. Steps run one after another unless
/// consecutive steps share a `branch` label, in which case the group runs
/// concurrently and the next step waits for all of it. `after` adds explicit
/// dependency edges on top of that order.
///
/// ```toml
/// name = "interview-synthesis"
/// version = "1.0"
///
/// [[steps]]
/// name = "transcribe"
/// type = "tool"
/// tool = "transcriber"
/// memory = { write = ["working:transcript/{item}"] }
///
/// [[steps]]
/// name = "review"
/// type = "checkpoint"
/// ```
use crate::error::{WeaveError, WeaveResult};
use crate::types::{Namespace, Tier};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Placeholder replaced by the batch item id in keys and string inputs.
pub const ITEM_PLACEHOLDER: &str = "{item}";

/// Upper bound accepted for `iteration.max`.
pub const MAX_ITERATIONS: u32 = 1000;

/// A `tier:key` reference. The tier defaults to working.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyRef {
    pub tier: Tier,
    pub key: String,
}

impl KeyRef {
    pub fn new(tier: Tier, key: impl Into<String>) -> Self {
        Self {
            tier,
            key: key.into(),
        }
    }

    /// The key with `{item}` substituted. Without an item the placeholder is
    /// left as is.
    pub fn resolve(&self, item: Option<&str>) -> String {
        match item {
            Some(item) => self.key.replace(ITEM_PLACEHOLDER, item),
            None => self.key.clone(),
        }
    }

    pub fn is_templated(&self) -> bool {
        self.key.contains(ITEM_PLACEHOLDER)
    }
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tier, self.key)
    }
}

impl FromStr for KeyRef {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tier, key) = match s.split_once(':') {
            Some((prefix, rest)) => match prefix.parse::<Tier>() {
                Ok(tier) => (tier, rest),
                Err(_) => (Tier::Working, s),
            },
            None => (Tier::Working, s),
        };
        if key.is_empty() {
            return Err(WeaveError::Config(format!("empty key in '{}'", s)));
        }
        Ok(Self::new(tier, key))
    }
}

impl TryFrom<String> for KeyRef {
    type Error = WeaveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyRef> for String {
    fn from(key: KeyRef) -> Self {
        key.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Invoke an external tool
    Tool,
    /// Promote the step's read keys to the next tier
    Archive,
    /// Pause for an external decision
    Checkpoint,
}

/// Memory operations declared by a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryOps {
    /// Keys that must resolve before the step runs
    pub read: Vec<KeyRef>,
    /// Keys the step must write
    pub write: Vec<KeyRef>,
    /// Keys read when present and written when the tool returns them
    pub context: Vec<KeyRef>,
}

/// Predicate over a step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    /// Step whose result is inspected; defaults to the last dependency
    #[serde(default)]
    pub step: Option<String>,
    /// Field name, or a JSON pointer when it starts with `/`
    pub output: String,
    #[serde(default)]
    pub equals: Option<JsonValue>,
    #[serde(default)]
    pub not_equals: Option<JsonValue>,
    #[serde(default)]
    pub exists: Option<bool>,
}

impl Condition {
    pub fn evaluate(&self, result: &JsonValue) -> bool {
        let found = if self.output.starts_with('/') {
            result.pointer(&self.output)
        } else {
            result.get(&self.output)
        };
        if let Some(exists) = self.exists {
            if found.is_some() != exists {
                return false;
            }
        }
        if let Some(expected) = &self.equals {
            if found != Some(expected) {
                return false;
            }
        }
        if let Some(rejected) = &self.not_equals {
            if found == Some(rejected) {
                return false;
            }
        }
        true
    }
}

/// Loop bound for a tool step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Iteration {
    pub max: u32,
    /// Stop early once the step's own result satisfies this
    #[serde(default)]
    pub until: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub tool_version: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, JsonValue>,
    /// Fields the tool result must contain
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub memory: MemoryOps,
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub iteration: Option<Iteration>,
    #[serde(default)]
    pub user_checkpoint: bool,
}

impl Step {
    pub fn is_checkpoint(&self) -> bool {
        self.user_checkpoint || self.step_type == StepType::Checkpoint
    }

    /// Keys this step makes available to later steps.
    pub fn produces(&self) -> Vec<KeyRef> {
        match self.step_type {
            StepType::Archive => self
                .memory
                .read
                .iter()
                .filter_map(|k| k.tier.next().map(|t| KeyRef::new(t, k.key.clone())))
                .collect(),
            _ => self
                .memory
                .write
                .iter()
                .chain(&self.memory.context)
                .cloned()
                .collect(),
        }
    }

    fn touched_tiers(&self) -> impl Iterator<Item = Tier> + '_ {
        self.memory
            .read
            .iter()
            .chain(&self.memory.write)
            .chain(&self.memory.context)
            .map(|k| k.tier)
            .chain(self.produces().into_iter().map(|k| k.tier))
    }
}

/// Where a recipe may operate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MemoryInteractions {
    /// Namespace patterns (`*` matches one segment); empty allows any
    pub namespaces: Vec<String>,
    /// Tiers steps may touch; empty allows all
    pub tiers: Vec<Tier>,
}

impl MemoryInteractions {
    pub fn allows_namespace(&self, namespace: &Namespace) -> bool {
        if self.namespaces.is_empty() {
            return true;
        }
        let actual = [namespace.project(), namespace.context_type(), namespace.memory_type()];
        self.namespaces.iter().any(|pattern| {
            let parts: Vec<&str> = pattern.split('/').collect();
            parts.len() == 3
                && parts
                    .iter()
                    .zip(actual.iter())
                    .all(|(p, a)| *p == "*" || p == a)
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationRules {
    /// Every archive step must come after a checkpoint
    pub require_checkpoint_before_archive: bool,
    pub max_steps: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Recipe {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub memory_interactions: MemoryInteractions,
    #[serde(default)]
    pub validation_rules: ValidationRules,
}

/// Execution plan derived from a valid recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipePlan {
    /// Step indices in a valid execution order
    pub order: Vec<usize>,
    /// Direct dependencies of each step
    pub deps: Vec<BTreeSet<usize>>,
    /// Read keys no earlier step produces; they must pre-exist
    pub external_reads: Vec<(usize, KeyRef)>,
}

impl RecipePlan {
    /// Latest-declared direct dependency of a step.
    pub fn last_dependency(&self, step: usize) -> Option<usize> {
        self.deps[step].iter().next_back().copied()
    }
}

impl Recipe {
    pub fn from_toml_str(input: &str) -> WeaveResult<Self> {
        toml::from_str(input).map_err(|e| WeaveError::invalid_recipe("<inline>", e.to_string()))
    }

    pub fn from_json_str(input: &str) -> WeaveResult<Self> {
        serde_json::from_str(input).map_err(|e| WeaveError::invalid_recipe("<inline>", e.to_string()))
    }

    /// Load from a `.json` file, or TOML for any other extension.
    pub fn load(path: &Path) -> WeaveResult<Self> {
        let input = std::fs::read_to_string(path)?;
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let parsed = if is_json {
            serde_json::from_str(&input).map_err(|e| e.to_string())
        } else {
            toml::from_str(&input).map_err(|e| e.to_string())
        };
        parsed.map_err(|reason| WeaveError::invalid_recipe(&path.display().to_string(), reason))
    }

    /// `name@version`
    pub fn reference(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    fn invalid(&self, reason: impl Into<String>) -> WeaveError {
        WeaveError::invalid_recipe(&self.reference(), reason)
    }

    /// Check syntax, dependency order and declared memory use, and derive the
    /// execution plan. Cycles are rejected here, before any step runs.
    pub fn plan(&self) -> WeaveResult<RecipePlan> {
        self.check_fields()?;
        let deps = self.dependencies()?;
        let order = self.topological_order(&deps)?;
        let ancestors = ancestor_sets(&order, &deps);

        let mut external_reads = Vec::new();
        for (idx, step) in self.steps.iter().enumerate() {
            for read in &step.memory.read {
                let from_ancestor = ancestors[idx]
                    .iter()
                    .any(|&a| self.steps[a].produces().contains(read));
                if from_ancestor {
                    continue;
                }
                // A later writer is fine: the read sees the revision that
                // existed before the run. An unordered writer is a race.
                if let Some(producer) = self.steps.iter().enumerate().position(|(p, s)| {
                    p != idx && !ancestors[p].contains(&idx) && s.produces().contains(read)
                }) {
                    return Err(self.invalid(format!(
                        "step '{}' reads {} which is produced by '{}', not an earlier dependency",
                        step.name, read, self.steps[producer].name
                    )));
                }
                external_reads.push((idx, read.clone()));
            }

            if let Some(condition) = &step.condition {
                if let Some(source) = &condition.step {
                    let known = self
                        .step_index(source)
                        .is_some_and(|s| ancestors[idx].contains(&s));
                    if !known {
                        return Err(self.invalid(format!(
                            "condition of step '{}' refers to '{}', which is not an earlier dependency",
                            step.name, source
                        )));
                    }
                } else if deps[idx].is_empty() {
                    return Err(self.invalid(format!(
                        "condition of step '{}' has no prior step to inspect",
                        step.name
                    )));
                }
            }

            if step.step_type == StepType::Archive && self.validation_rules.require_checkpoint_before_archive {
                let guarded = step.is_checkpoint()
                    || ancestors[idx].iter().any(|&a| self.steps[a].is_checkpoint());
                if !guarded {
                    return Err(self.invalid(format!(
                        "archive step '{}' is not preceded by a checkpoint",
                        step.name
                    )));
                }
            }
        }

        Ok(RecipePlan {
            order,
            deps,
            external_reads,
        })
    }

    fn check_fields(&self) -> WeaveResult<()> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("name is empty"));
        }
        if self.version.trim().is_empty() {
            return Err(self.invalid("version is empty"));
        }
        if self.steps.is_empty() {
            return Err(self.invalid("recipe has no steps"));
        }
        if let Some(max) = self.validation_rules.max_steps {
            if self.steps.len() > max {
                return Err(self.invalid(format!("{} steps exceed max_steps {}", self.steps.len(), max)));
            }
        }

        let mut names = BTreeSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(self.invalid("step with empty name"));
            }
            if !names.insert(step.name.as_str()) {
                return Err(self.invalid(format!("duplicate step name '{}'", step.name)));
            }

            match step.step_type {
                StepType::Tool if step.tool.is_none() => {
                    return Err(self.invalid(format!("tool step '{}' names no tool", step.name)));
                }
                StepType::Archive | StepType::Checkpoint if step.tool.is_some() => {
                    return Err(self.invalid(format!("step '{}' is not a tool step but names a tool", step.name)));
                }
                _ => {}
            }

            if step.step_type == StepType::Archive {
                if step.memory.read.is_empty() {
                    return Err(self.invalid(format!("archive step '{}' reads no keys", step.name)));
                }
                if let Some(top) = step.memory.read.iter().find(|k| k.tier.next().is_none()) {
                    return Err(self.invalid(format!(
                        "archive step '{}' cannot promote {} past the last tier",
                        step.name, top
                    )));
                }
            }

            if let Some(iteration) = &step.iteration {
                if step.step_type != StepType::Tool {
                    return Err(self.invalid(format!("only tool steps may iterate ('{}')", step.name)));
                }
                if iteration.max == 0 || iteration.max > MAX_ITERATIONS {
                    return Err(self.invalid(format!(
                        "iteration bound of '{}' must be between 1 and {}",
                        step.name, MAX_ITERATIONS
                    )));
                }
                if iteration.until.as_ref().is_some_and(|c| c.step.is_some()) {
                    return Err(self.invalid(format!(
                        "loop condition of '{}' must inspect the step itself",
                        step.name
                    )));
                }
            }

            if !self.memory_interactions.tiers.is_empty() {
                if let Some(tier) = step
                    .touched_tiers()
                    .find(|t| !self.memory_interactions.tiers.contains(t))
                {
                    return Err(self.invalid(format!(
                        "step '{}' touches tier {} outside memory_interactions",
                        step.name, tier
                    )));
                }
            }
        }
        Ok(())
    }

    /// Sequential edges, branch-group edges and explicit `after` edges.
    fn dependencies(&self) -> WeaveResult<Vec<BTreeSet<usize>>> {
        let mut deps = vec![BTreeSet::new(); self.steps.len()];
        let mut previous: Vec<usize> = Vec::new();
        let mut group: Vec<usize> = Vec::new();
        let mut label: Option<&str> = None;

        for (idx, step) in self.steps.iter().enumerate() {
            let joins_group = step.branch.is_some() && step.branch.as_deref() == label;
            if !joins_group {
                if !group.is_empty() {
                    previous = std::mem::take(&mut group);
                }
                label = step.branch.as_deref();
            }
            deps[idx].extend(previous.iter().copied());
            group.push(idx);

            for name in &step.after {
                let Some(target) = self.step_index(name) else {
                    return Err(self.invalid(format!("step '{}' depends on unknown step '{}'", step.name, name)));
                };
                if target == idx {
                    return Err(self.invalid(format!("step '{}' depends on itself", step.name)));
                }
                deps[idx].insert(target);
            }
        }

        // Members of one branch group must be data-independent.
        let mut groups: BTreeMap<(usize, &str), Vec<usize>> = BTreeMap::new();
        let mut start = 0;
        for (idx, step) in self.steps.iter().enumerate() {
            if idx == 0 || step.branch.is_none() || step.branch != self.steps[idx - 1].branch {
                start = idx;
            }
            if let Some(label) = step.branch.as_deref() {
                groups.entry((start, label)).or_default().push(idx);
            }
        }
        for members in groups.values() {
            for &a in members {
                for &b in members {
                    if a == b {
                        continue;
                    }
                    let produced = self.steps[b].produces();
                    if let Some(shared) = self.steps[a].memory.read.iter().find(|k| produced.contains(k)) {
                        return Err(self.invalid(format!(
                            "branch steps '{}' and '{}' are not independent: {}",
                            self.steps[a].name, self.steps[b].name, shared
                        )));
                    }
                }
            }
        }
        Ok(deps)
    }

    fn topological_order(&self, deps: &[BTreeSet<usize>]) -> WeaveResult<Vec<usize>> {
        let mut remaining: Vec<usize> = deps.iter().map(|d| d.len()).collect();
        let mut dependents = vec![Vec::new(); deps.len()];
        for (idx, d) in deps.iter().enumerate() {
            for &dep in d {
                dependents[dep].push(idx);
            }
        }

        let mut ready: BTreeSet<usize> = (0..deps.len()).filter(|&i| remaining[i] == 0).collect();
        let mut order = Vec::with_capacity(deps.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < deps.len() {
            let cyclic: Vec<&str> = (0..deps.len())
                .filter(|&i| remaining[i] > 0)
                .map(|i| self.steps[i].name.as_str())
                .collect();
            return Err(self.invalid(format!("dependency cycle among steps: {}", cyclic.join(", "))));
        }
        Ok(order)
    }
}

fn ancestor_sets(order: &[usize], deps: &[BTreeSet<usize>]) -> Vec<BTreeSet<usize>> {
    let mut ancestors = vec![BTreeSet::new(); deps.len()];
    for &idx in order {
        let mut set = BTreeSet::new();
        for &dep in &deps[idx] {
            set.insert(dep);
            set.extend(ancestors[dep].iter().copied());
        }
        ancestors[idx] = set;
    }
    ancestors
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNTHESIS: &str = r#"
name = "interview-synthesis"
version = "1.0"
description = "Transcribe, tag and archive interviews"

[[steps]]
name = "transcribe"
type = "tool"
tool = "transcriber"
memory = { write = ["short_term:transcript/{item}"] }

[[steps]]
name = "tag"
type = "tool"
tool = "tagger"
outputs = ["tags"]
memory = { read = ["short_term:transcript/{item}"], write = ["working:tags/{item}"] }

[[steps]]
name = "review"
type = "checkpoint"

[[steps]]
name = "archive"
type = "archive"
memory = { read = ["working:tags/{item}"] }

[validation_rules]
require_checkpoint_before_archive = true
"#;

    fn tool_step(name: &str) -> Step {
        Step {
            name: name.into(),
            step_type: StepType::Tool,
            tool: Some("t".into()),
            tool_version: None,
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            memory: MemoryOps::default(),
            after: Vec::new(),
            branch: None,
            condition: None,
            iteration: None,
            user_checkpoint: false,
        }
    }

    fn recipe(steps: Vec<Step>) -> Recipe {
        Recipe {
            name: "r".into(),
            version: "1".into(),
            description: String::new(),
            steps,
            memory_interactions: MemoryInteractions::default(),
            validation_rules: ValidationRules::default(),
        }
    }

    #[test]
    fn test_key_ref_parse() {
        let k: KeyRef = "long_term:notes/a".parse().unwrap();
        assert_eq!(k, KeyRef::new(Tier::LongTerm, "notes/a"));
        let k: KeyRef = "notes:a".parse().unwrap();
        assert_eq!(k, KeyRef::new(Tier::Working, "notes:a"));
        assert_eq!(KeyRef::new(Tier::Working, "t/{item}").resolve(Some("x")), "t/x");
    }

    #[test]
    fn test_parse_and_plan_toml() {
        let recipe = Recipe::from_toml_str(SYNTHESIS).unwrap();
        let plan = recipe.plan().unwrap();
        assert_eq!(plan.order, vec![0, 1, 2, 3]);
        assert!(plan.external_reads.is_empty());
        assert_eq!(recipe.reference(), "interview-synthesis@1.0");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let doc = SYNTHESIS.replace("description =", "colour = \"red\"\ndescription =");
        let err = Recipe::from_toml_str(&doc).unwrap_err();
        assert!(matches!(err, WeaveError::InvalidRecipe { .. }));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut a = tool_step("a");
        a.after = vec!["c".into()];
        let b = tool_step("b");
        let c = tool_step("c");
        let err = recipe(vec![a, b, c]).plan().unwrap_err();
        match err {
            WeaveError::InvalidRecipe { reason, .. } => assert!(reason.contains("cycle"), "{reason}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_read_then_later_update_is_external() {
        let mut inspect = tool_step("inspect");
        inspect.memory.read = vec!["working:summary".parse().unwrap()];
        let mut update = tool_step("update");
        update.memory.write = vec!["working:summary".parse().unwrap()];
        let plan = recipe(vec![inspect, update]).plan().unwrap();
        assert_eq!(plan.external_reads, vec![(0, KeyRef::new(Tier::Working, "summary"))]);
    }

    #[test]
    fn test_external_reads_reported() {
        let mut a = tool_step("a");
        a.memory.read = vec!["long_term:glossary".parse().unwrap()];
        let plan = recipe(vec![a]).plan().unwrap();
        assert_eq!(plan.external_reads, vec![(0, KeyRef::new(Tier::LongTerm, "glossary"))]);
    }

    #[test]
    fn test_branch_group_runs_after_previous_segment() {
        let first = tool_step("first");
        let mut left = tool_step("left");
        left.branch = Some("fan".into());
        let mut right = tool_step("right");
        right.branch = Some("fan".into());
        let join = tool_step("join");
        let plan = recipe(vec![first, left, right, join]).plan().unwrap();
        assert_eq!(plan.deps[1], BTreeSet::from([0]));
        assert_eq!(plan.deps[2], BTreeSet::from([0]));
        assert_eq!(plan.deps[3], BTreeSet::from([1, 2]));
    }

    #[test]
    fn test_dependent_branch_rejected() {
        let mut left = tool_step("left");
        left.branch = Some("fan".into());
        left.memory.write = vec!["working:x".parse().unwrap()];
        let mut right = tool_step("right");
        right.branch = Some("fan".into());
        right.memory.read = vec!["working:x".parse().unwrap()];
        assert!(recipe(vec![left, right]).plan().is_err());
    }

    #[test]
    fn test_archive_requires_checkpoint_when_ruled() {
        let doc = SYNTHESIS.replace(
            "[[steps]]\nname = \"review\"\ntype = \"checkpoint\"\n",
            "",
        );
        let recipe = Recipe::from_toml_str(&doc).unwrap();
        assert_eq!(recipe.steps.len(), 3);
        assert!(recipe.plan().is_err());
    }

    #[test]
    fn test_iteration_bound_checked() {
        let mut a = tool_step("a");
        a.iteration = Some(Iteration { max: 0, until: None });
        assert!(recipe(vec![a]).plan().is_err());
    }

    #[test]
    fn test_condition_evaluate() {
        let cond = Condition {
            step: None,
            output: "/quality/score".into(),
            equals: None,
            not_equals: Some(serde_json::json!(0)),
            exists: Some(true),
        };
        assert!(cond.evaluate(&serde_json::json!({"quality": {"score": 3}})));
        assert!(!cond.evaluate(&serde_json::json!({"quality": {"score": 0}})));
        assert!(!cond.evaluate(&serde_json::json!({})));
    }

    #[test]
    fn test_namespace_patterns() {
        let interactions = MemoryInteractions {
            namespaces: vec!["acme/*/interviews".into()],
            tiers: Vec::new(),
        };
        assert!(interactions.allows_namespace(&"acme/research/interviews".parse().unwrap()));
        assert!(!interactions.allows_namespace(&"acme/research/notes".parse().unwrap()));
    }
}
