//! Workflow patterns and the arena that holds them.
//!
//! A [`PatternTable`] owns every pattern of a workflow. Nesting
//! (conditional branches, iterative bodies) refers to other entries by
//! [`PatternId`], and [`PatternTable::validate`] rejects dangling ids and
//! cycles before anything runs.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use weft_core::{AgentId, Topic};

use crate::error::{OrchResult, OrchestrationError};
use crate::merge::MergeStrategy;
use crate::predicate::BranchPredicate;
use crate::template::InputMapping;

/// Index of a pattern inside its [`PatternTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternId(usize);

impl PatternId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for PatternId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The six pattern shapes, used as a metrics and log label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Debate,
    ForkJoin,
    Pipeline,
    Parallel,
    Conditional,
    Iterative,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Debate => "debate",
            PatternKind::ForkJoin => "fork_join",
            PatternKind::Pipeline => "pipeline",
            PatternKind::Parallel => "parallel",
            PatternKind::Conditional => "conditional",
            PatternKind::Iterative => "iterative",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Pattern variants
// ============================================================================

/// Structured multi-round debate.
#[derive(Debug, Clone, PartialEq)]
pub struct DebatePattern {
    pub topic: String,
    pub agent_ids: Vec<AgentId>,
    /// Synthesises each round; without one the majority position is used.
    pub moderator_id: Option<AgentId>,
    pub max_rounds: u32,
    /// Share of agreeing positions (`0.0..=1.0`) needed for consensus.
    pub consensus_threshold: f64,
}

/// Same input to every agent, barrier join, then merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ForkJoinPattern {
    pub prompt: String,
    pub agent_ids: Vec<AgentId>,
    pub merge: MergeStrategy,
    /// Agent used by LLM-backed merges; falls back to the orchestrator default.
    pub synthesizer: Option<AgentId>,
    /// Append the previous iteration's result to the prompt when run inside
    /// an iterative pattern.
    pub share_previous: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineStage {
    pub agent_id: AgentId,
    pub input_mapping: InputMapping,
    /// Asked of the same agent after the stage; `{{output}}` is replaced by
    /// the stage output. A negative answer aborts once retries run out.
    pub validation_prompt: Option<String>,
    /// Re-runs of a rejected stage, each told why the last output failed.
    pub validation_retries: u32,
}

/// Strictly sequential stages.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelinePattern {
    pub initial_input: String,
    pub stages: Vec<PipelineStage>,
    /// Append every earlier stage output to templated prompts.
    pub pass_full_history: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParallelTask {
    pub agent_id: AgentId,
    pub input: String,
    pub metadata: BTreeMap<String, String>,
}

/// Independent tasks, run concurrently, failures collected per task.
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelPattern {
    pub tasks: Vec<ParallelTask>,
    pub merge: MergeStrategy,
    pub synthesizer: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalBranch {
    pub predicate: BranchPredicate,
    pub pattern: PatternId,
}

/// Route to the first branch whose predicate accepts the condition output.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalPattern {
    pub condition_agent_id: AgentId,
    pub condition_prompt: String,
    pub branches: Vec<ConditionalBranch>,
    pub default_branch: Option<PatternId>,
}

/// How an iterative pattern reacts to restart signals.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub restart_topic: Topic,
    /// Minimum time between two accepted restarts of the same stage.
    pub cooldown: Duration,
    /// Keep the outputs of stages before the restart target.
    pub preserve_outputs: bool,
    /// Clear the run's workflow-scoped shared memory before restarting.
    pub reset_shared_memory: bool,
    /// Stages (by agent id) that may be restarted; empty allows all.
    pub restartable_stages: Vec<AgentId>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            restart_topic: Topic::new_unchecked(DEFAULT_RESTART_TOPIC),
            cooldown: Duration::ZERO,
            preserve_outputs: true,
            reset_shared_memory: false,
            restartable_stages: Vec::new(),
        }
    }
}

pub const DEFAULT_RESTART_TOPIC: &str = "workflow.restart";

/// Re-run a base pattern while restart signals arrive.
#[derive(Debug, Clone, PartialEq)]
pub struct IterativePattern {
    pub base: PatternId,
    pub max_iterations: u32,
    pub restart: RestartPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowPattern {
    Debate(DebatePattern),
    ForkJoin(ForkJoinPattern),
    Pipeline(PipelinePattern),
    Parallel(ParallelPattern),
    Conditional(ConditionalPattern),
    Iterative(IterativePattern),
}

impl WorkflowPattern {
    pub fn kind(&self) -> PatternKind {
        match self {
            WorkflowPattern::Debate(_) => PatternKind::Debate,
            WorkflowPattern::ForkJoin(_) => PatternKind::ForkJoin,
            WorkflowPattern::Pipeline(_) => PatternKind::Pipeline,
            WorkflowPattern::Parallel(_) => PatternKind::Parallel,
            WorkflowPattern::Conditional(_) => PatternKind::Conditional,
            WorkflowPattern::Iterative(_) => PatternKind::Iterative,
        }
    }

    /// Agents this pattern invokes directly, excluding nested patterns.
    pub fn direct_agents(&self) -> Vec<&AgentId> {
        match self {
            WorkflowPattern::Debate(p) => p.agent_ids.iter().chain(p.moderator_id.iter()).collect(),
            WorkflowPattern::ForkJoin(p) => {
                let mut agents: Vec<&AgentId> = p.agent_ids.iter().collect();
                agents.extend(p.synthesizer.iter());
                agents.extend(p.merge.tie_breaker());
                agents
            }
            WorkflowPattern::Pipeline(p) => p.stages.iter().map(|s| &s.agent_id).collect(),
            WorkflowPattern::Parallel(p) => {
                let mut agents: Vec<&AgentId> = p.tasks.iter().map(|t| &t.agent_id).collect();
                agents.extend(p.synthesizer.iter());
                agents.extend(p.merge.tie_breaker());
                agents
            }
            WorkflowPattern::Conditional(p) => vec![&p.condition_agent_id],
            WorkflowPattern::Iterative(_) => Vec::new(),
        }
    }

    /// Patterns nested directly inside this one.
    pub fn children(&self) -> Vec<PatternId> {
        match self {
            WorkflowPattern::Conditional(p) => p
                .branches
                .iter()
                .map(|b| b.pattern)
                .chain(p.default_branch)
                .collect(),
            WorkflowPattern::Iterative(p) => vec![p.base],
            _ => Vec::new(),
        }
    }

    fn check_shape(&self) -> OrchResult<()> {
        match self {
            WorkflowPattern::Debate(p) => {
                if p.agent_ids.is_empty() {
                    return Err(OrchestrationError::invalid("debate requires at least one agent"));
                }
                if p.max_rounds == 0 {
                    return Err(OrchestrationError::invalid("debate requires at least one round"));
                }
                if !(0.0..=1.0).contains(&p.consensus_threshold) {
                    return Err(OrchestrationError::invalid(format!(
                        "debate consensus threshold must be within 0.0..=1.0, got {}",
                        p.consensus_threshold
                    )));
                }
            }
            WorkflowPattern::ForkJoin(p) => {
                if p.agent_ids.is_empty() {
                    return Err(OrchestrationError::invalid("fork-join requires at least one agent"));
                }
                p.merge.validate()?;
            }
            WorkflowPattern::Pipeline(p) => {
                if p.stages.is_empty() {
                    return Err(OrchestrationError::invalid("pipeline requires at least one stage"));
                }
            }
            WorkflowPattern::Parallel(p) => {
                if p.tasks.is_empty() {
                    return Err(OrchestrationError::invalid("parallel requires at least one task"));
                }
                p.merge.validate()?;
            }
            WorkflowPattern::Conditional(p) => {
                if p.branches.is_empty() && p.default_branch.is_none() {
                    return Err(OrchestrationError::invalid(
                        "conditional requires at least one branch",
                    ));
                }
                for branch in &p.branches {
                    branch.predicate.validate()?;
                }
            }
            WorkflowPattern::Iterative(p) => {
                if p.max_iterations == 0 {
                    return Err(OrchestrationError::invalid(
                        "iterative requires at least one iteration",
                    ));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// PatternTable
// ============================================================================

/// Arena of the patterns making up one workflow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternTable {
    patterns: Vec<WorkflowPattern>,
    root: Option<PatternId>,
}

impl PatternTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table holding one pattern, which is also the root.
    pub fn single(pattern: WorkflowPattern) -> Self {
        let mut table = Self::new();
        let id = table.add(pattern);
        table.set_root(id);
        table
    }

    /// Add a pattern. The first pattern added becomes the root unless
    /// [`set_root`](Self::set_root) says otherwise.
    pub fn add(&mut self, pattern: WorkflowPattern) -> PatternId {
        let id = PatternId(self.patterns.len());
        self.patterns.push(pattern);
        id
    }

    pub fn set_root(&mut self, id: PatternId) {
        self.root = Some(id);
    }

    pub fn root(&self) -> Option<PatternId> {
        self.root.or_else(|| (!self.patterns.is_empty()).then_some(PatternId(0)))
    }

    pub fn get(&self, id: PatternId) -> Option<&WorkflowPattern> {
        self.patterns.get(id.0)
    }

    pub(crate) fn get_or_err(&self, id: PatternId) -> OrchResult<&WorkflowPattern> {
        self.get(id)
            .ok_or_else(|| OrchestrationError::invalid(format!("pattern {id} does not exist")))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Root pattern, resolved.
    pub fn root_pattern(&self) -> OrchResult<(PatternId, &WorkflowPattern)> {
        let root = self
            .root()
            .ok_or_else(|| OrchestrationError::invalid("pattern table is empty"))?;
        Ok((root, self.get_or_err(root)?))
    }

    /// Check shapes, dangling ids and cycles for everything reachable from
    /// the root.
    pub fn validate(&self) -> OrchResult<()> {
        let (root, _) = self.root_pattern()?;

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.patterns.len()];
        // Iterative DFS: (pattern, children already pushed)
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            let pattern = self.get_or_err(id)?;
            if expanded {
                marks[id.0] = Mark::Done;
                continue;
            }
            match marks[id.0] {
                Mark::Done => continue,
                Mark::InProgress => return Err(OrchestrationError::PatternCycle(id.0)),
                Mark::Unvisited => {}
            }
            pattern.check_shape()?;
            marks[id.0] = Mark::InProgress;
            stack.push((id, true));
            for child in pattern.children() {
                self.get_or_err(child)?;
                match marks[child.0] {
                    Mark::InProgress => return Err(OrchestrationError::PatternCycle(child.0)),
                    Mark::Unvisited => stack.push((child, false)),
                    Mark::Done => {}
                }
            }
        }
        Ok(())
    }

    /// Every agent reachable from `id`, including nested patterns.
    pub fn agents_reachable(&self, id: PatternId) -> BTreeSet<AgentId> {
        let mut agents = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(pattern) = self.get(id) {
                agents.extend(pattern.direct_agents().into_iter().cloned());
                stack.extend(pattern.children());
            }
        }
        agents
    }

    /// Every agent reachable from the root.
    pub fn agent_ids(&self) -> BTreeSet<AgentId> {
        self.root()
            .map(|root| self.agents_reachable(root))
            .unwrap_or_default()
    }

    /// Every pattern reachable from the root.
    pub(crate) fn reachable(&self) -> Vec<&WorkflowPattern> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack: Vec<PatternId> = self.root().into_iter().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(pattern) = self.get(id) {
                out.push(pattern);
                stack.extend(pattern.children());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> AgentId {
        AgentId::new_unchecked(id)
    }

    fn fork(agents: &[&str]) -> WorkflowPattern {
        WorkflowPattern::ForkJoin(ForkJoinPattern {
            prompt: "go".to_string(),
            agent_ids: agents.iter().map(|a| agent(a)).collect(),
            merge: MergeStrategy::Concatenate,
            synthesizer: None,
            share_previous: false,
        })
    }

    #[test]
    fn test_nested_agents_are_reachable() {
        let mut table = PatternTable::new();
        let conditional = table.add(WorkflowPattern::Debate(DebatePattern {
            topic: String::new(),
            agent_ids: vec![],
            moderator_id: None,
            max_rounds: 1,
            consensus_threshold: 1.0,
        }));
        let sql = table.add(fork(&["sql"]));
        let py = table.add(fork(&["py"]));
        table.patterns[conditional.0] = WorkflowPattern::Conditional(ConditionalPattern {
            condition_agent_id: agent("router"),
            condition_prompt: "classify".to_string(),
            branches: vec![ConditionalBranch {
                predicate: BranchPredicate::Equals("sql".to_string()),
                pattern: sql,
            }],
            default_branch: Some(py),
        });
        table.set_root(conditional);

        table.validate().unwrap();
        let agents: Vec<String> = table.agent_ids().iter().map(|a| a.to_string()).collect();
        assert_eq!(agents, vec!["py", "router", "sql"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut table = PatternTable::new();
        let a = table.add(fork(&["a"]));
        let b = table.add(fork(&["b"]));
        table.patterns[a.0] = WorkflowPattern::Iterative(IterativePattern {
            base: b,
            max_iterations: 2,
            restart: RestartPolicy::default(),
        });
        table.patterns[b.0] = WorkflowPattern::Iterative(IterativePattern {
            base: a,
            max_iterations: 2,
            restart: RestartPolicy::default(),
        });
        table.set_root(a);

        assert!(matches!(
            table.validate(),
            Err(OrchestrationError::PatternCycle(_))
        ));
    }

    #[test]
    fn test_shared_subpattern_is_not_a_cycle() {
        let mut table = PatternTable::new();
        let leaf = table.add(fork(&["a"]));
        let root = table.add(WorkflowPattern::Conditional(ConditionalPattern {
            condition_agent_id: agent("router"),
            condition_prompt: String::new(),
            branches: vec![ConditionalBranch {
                predicate: BranchPredicate::Contains("x".to_string()),
                pattern: leaf,
            }],
            default_branch: Some(leaf),
        }));
        table.set_root(root);
        table.validate().unwrap();
    }

    #[test]
    fn test_dangling_and_empty_rejected() {
        assert!(PatternTable::new().validate().is_err());

        let mut other = PatternTable::new();
        other.add(fork(&["a"]));
        let foreign = other.add(fork(&["b"]));

        let mut table = PatternTable::single(WorkflowPattern::Iterative(IterativePattern {
            base: foreign,
            max_iterations: 1,
            restart: RestartPolicy::default(),
        }));
        table.set_root(PatternId(0));
        assert!(matches!(
            table.validate(),
            Err(OrchestrationError::InvalidPattern(_))
        ));

        assert!(PatternTable::single(fork(&[])).validate().is_err());
    }
}
