//! Workflow documents.
//!
//! A document is YAML with a fixed envelope:
//!
//! ```yaml
//! apiVersion: weft/v1
//! kind: Workflow
//! metadata:
//!   name: code-review
//!   description: Three reviewers, one verdict
//! spec:
//!   type: fork-join
//!   prompt: Review this change
//!   agent_ids: [security, style, perf]
//!   merge_strategy: summary
//! ```
//!
//! `spec.type` is one of `debate`, `fork-join`, `pipeline`, `parallel`,
//! `conditional`, `iterative` or `swarm`. Conditional branches are full
//! pattern specs keyed by the value the condition agent is expected to
//! answer; a branch may carry a `when` block to match differently. `swarm`
//! is sugar for an iterative pattern over a vote-merging fork-join.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use weft_core::{AgentId, Topic};

use crate::error::{OrchResult, OrchestrationError};
use crate::merge::MergeStrategy;
use crate::pattern::{
    ConditionalBranch, ConditionalPattern, DebatePattern, ForkJoinPattern, IterativePattern,
    ParallelPattern, ParallelTask, PatternId, PatternTable, PipelinePattern, PipelineStage,
    RestartPolicy, WorkflowPattern, DEFAULT_RESTART_TOPIC,
};
use crate::predicate::BranchPredicate;
use crate::template::InputMapping;
use crate::vote::{ballot_instructions, VoteConfig, VoteStrategy};

pub const API_VERSION: &str = "weft/v1";
pub const WORKFLOW_KIND: &str = "Workflow";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A parsed and structurally validated workflow.
///
/// Agent registration is not checked here; that happens when the
/// orchestrator validates the workflow against its registered agents.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDocument {
    pub metadata: WorkflowMetadata,
    /// `spec.type` as written
    pub spec_type: String,
    pub table: PatternTable,
    /// `spec.timeout_seconds`, applied to the whole run
    pub timeout: Option<Duration>,
}

impl WorkflowDocument {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Parse a document from YAML text.
    pub fn from_yaml_str(text: &str) -> OrchResult<Self> {
        let raw: RawDocument =
            serde_yaml::from_str(text).map_err(|e| OrchestrationError::InvalidYaml(e.to_string()))?;

        match raw.api_version.as_deref() {
            Some(API_VERSION) => {}
            Some(other) => {
                return Err(OrchestrationError::InvalidWorkflow(format!(
                    "unsupported apiVersion '{other}', expected '{API_VERSION}'"
                )));
            }
            None => return Err(missing("apiVersion")),
        }
        match raw.kind.as_deref() {
            Some(WORKFLOW_KIND) => {}
            Some(other) => {
                return Err(OrchestrationError::InvalidWorkflow(format!(
                    "kind must be '{WORKFLOW_KIND}', got '{other}'"
                )));
            }
            None => return Err(missing("kind")),
        }
        let metadata = raw.metadata.ok_or_else(|| missing("metadata"))?;
        if metadata.name.trim().is_empty() {
            return Err(missing("metadata.name"));
        }
        let spec = match raw.spec {
            Some(Value::Mapping(spec)) => spec,
            Some(_) => {
                return Err(OrchestrationError::InvalidWorkflow(
                    "spec must be a mapping".to_string(),
                ));
            }
            None => return Err(missing("spec")),
        };

        let spec_type = spec_type(&spec, "spec")?.to_string();
        let timeout = match spec.get("timeout_seconds") {
            Some(value) => {
                let seconds: u64 = parse_value(value, "spec.timeout_seconds")?;
                (seconds > 0).then(|| Duration::from_secs(seconds))
            }
            None => None,
        };

        let mut builder = TableBuilder::default();
        let root = builder.build(&spec, "spec")?;
        builder.table.set_root(root);
        builder
            .table
            .validate()
            .map_err(|e| OrchestrationError::InvalidWorkflow(format!("{}: {e}", metadata.name)))?;

        Ok(Self {
            metadata,
            spec_type,
            table: builder.table,
            timeout,
        })
    }

    /// Read and parse a document file.
    pub async fn from_file(path: impl AsRef<Path>) -> OrchResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => OrchestrationError::FileNotFound(path.display().to_string()),
            _ => OrchestrationError::InvalidWorkflow(format!("{}: {e}", path.display())),
        })?;
        Self::from_yaml_str(&text)
    }
}

fn missing(field: &str) -> OrchestrationError {
    OrchestrationError::InvalidWorkflow(format!("missing required field '{field}'"))
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(rename = "apiVersion")]
    api_version: Option<String>,
    kind: Option<String>,
    metadata: Option<WorkflowMetadata>,
    spec: Option<Value>,
}

// ============================================================================
// Pattern specs
// ============================================================================

#[derive(Debug, Deserialize)]
struct DebateSpec {
    topic: String,
    agent_ids: Vec<AgentId>,
    #[serde(default = "default_rounds")]
    rounds: u32,
    moderator_agent_id: Option<AgentId>,
    #[serde(default = "default_consensus")]
    consensus_threshold: f64,
}

#[derive(Debug, Deserialize)]
struct ForkJoinSpec {
    prompt: String,
    agent_ids: Vec<AgentId>,
    #[serde(default)]
    merge_strategy: MergeStrategy,
    synthesizer_agent_id: Option<AgentId>,
    vote: Option<VoteSpec>,
    #[serde(default)]
    share_previous: bool,
}

#[derive(Debug, Deserialize)]
struct VoteSpec {
    #[serde(default)]
    strategy: VoteStrategy,
    #[serde(default = "default_confidence")]
    confidence_threshold: f64,
    judge_agent_id: Option<AgentId>,
}

impl From<VoteSpec> for VoteConfig {
    fn from(spec: VoteSpec) -> Self {
        VoteConfig {
            strategy: spec.strategy,
            confidence_threshold: spec.confidence_threshold,
            tie_breaker: spec.judge_agent_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StageSpec {
    agent_id: AgentId,
    prompt_template: Option<String>,
    /// JSON field of the previous output to pass on
    input_field: Option<String>,
    validation_prompt: Option<String>,
    #[serde(default)]
    max_validation_retries: u32,
}

#[derive(Debug, Deserialize)]
struct PipelineSpec {
    initial_prompt: String,
    stages: Vec<StageSpec>,
    #[serde(default)]
    pass_full_history: bool,
}

#[derive(Debug, Deserialize)]
struct TaskSpec {
    agent_id: AgentId,
    prompt: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ParallelSpec {
    tasks: Vec<TaskSpec>,
    #[serde(default)]
    merge_strategy: MergeStrategy,
    synthesizer_agent_id: Option<AgentId>,
    vote: Option<VoteSpec>,
}

#[derive(Debug, Deserialize)]
struct ConditionalSpec {
    condition_agent_id: AgentId,
    condition_prompt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum WhenSpec {
    Equals(String),
    Contains(String),
    Regex(String),
    Judge {
        criteria: String,
        #[serde(default = "default_min_score")]
        min_score: f64,
    },
}

#[derive(Debug, Deserialize)]
struct RestartPolicySpec {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    restartable_stages: Vec<AgentId>,
    #[serde(default)]
    cooldown_seconds: u64,
    #[serde(default)]
    reset_shared_memory: bool,
    #[serde(default = "default_true")]
    preserve_outputs: bool,
}

#[derive(Debug, Deserialize)]
struct IterativeSpec {
    #[serde(default = "default_max_iterations")]
    max_iterations: u32,
    restart_policy: Option<RestartPolicySpec>,
    restart_topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SwarmSpec {
    question: String,
    agent_ids: Vec<AgentId>,
    #[serde(default)]
    strategy: VoteStrategy,
    #[serde(default = "default_confidence")]
    confidence_threshold: f64,
    #[serde(default)]
    share_votes: bool,
    judge_agent_id: Option<AgentId>,
}

fn default_rounds() -> u32 {
    1
}

fn default_consensus() -> f64 {
    1.0
}

fn default_confidence() -> f64 {
    0.5
}

fn default_min_score() -> f64 {
    0.5
}

fn default_max_iterations() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Table building
// ============================================================================

fn parse_value<T: DeserializeOwned>(value: &Value, path: &str) -> OrchResult<T> {
    serde_yaml::from_value(value.clone())
        .map_err(|e| OrchestrationError::InvalidWorkflow(format!("{path}: {e}")))
}

fn spec_type<'a>(spec: &'a Mapping, path: &str) -> OrchResult<&'a str> {
    spec.get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| missing(&format!("{path}.type")))
}

fn with_vote(merge: MergeStrategy, vote: Option<VoteSpec>) -> MergeStrategy {
    match (merge, vote) {
        (MergeStrategy::Vote(_), Some(vote)) => MergeStrategy::Vote(vote.into()),
        (merge, _) => merge,
    }
}

#[derive(Default)]
struct TableBuilder {
    table: PatternTable,
}

impl TableBuilder {
    fn build(&mut self, spec: &Mapping, path: &str) -> OrchResult<PatternId> {
        let value = Value::Mapping(spec.clone());
        let pattern = match spec_type(spec, path)? {
            "debate" => {
                let s: DebateSpec = parse_value(&value, path)?;
                WorkflowPattern::Debate(DebatePattern {
                    topic: s.topic,
                    agent_ids: s.agent_ids,
                    moderator_id: s.moderator_agent_id,
                    max_rounds: s.rounds,
                    consensus_threshold: s.consensus_threshold,
                })
            }
            "fork-join" | "fork_join" => {
                let s: ForkJoinSpec = parse_value(&value, path)?;
                WorkflowPattern::ForkJoin(ForkJoinPattern {
                    prompt: s.prompt,
                    agent_ids: s.agent_ids,
                    merge: with_vote(s.merge_strategy, s.vote),
                    synthesizer: s.synthesizer_agent_id,
                    share_previous: s.share_previous,
                })
            }
            "pipeline" => WorkflowPattern::Pipeline(pipeline(parse_value(&value, path)?)),
            "parallel" => {
                let s: ParallelSpec = parse_value(&value, path)?;
                WorkflowPattern::Parallel(ParallelPattern {
                    tasks: s
                        .tasks
                        .into_iter()
                        .map(|t| ParallelTask {
                            agent_id: t.agent_id,
                            input: t.prompt,
                            metadata: t.metadata,
                        })
                        .collect(),
                    merge: with_vote(s.merge_strategy, s.vote),
                    synthesizer: s.synthesizer_agent_id,
                })
            }
            "conditional" => self.conditional(spec, &value, path)?,
            "iterative" => {
                let s: IterativeSpec = parse_value(&value, path)?;
                let base_path = format!("{path}.pipeline");
                let base_spec = spec.get("pipeline").ok_or_else(|| missing(&base_path))?;
                let base = self.table.add(WorkflowPattern::Pipeline(pipeline(parse_value(
                    base_spec, &base_path,
                )?)));
                WorkflowPattern::Iterative(IterativePattern {
                    base,
                    max_iterations: s.max_iterations,
                    restart: restart_policy(s.restart_policy, s.restart_topic, path)?,
                })
            }
            "swarm" => {
                let s: SwarmSpec = parse_value(&value, path)?;
                let base = self.table.add(WorkflowPattern::ForkJoin(ForkJoinPattern {
                    prompt: format!("{}\n\n{}", s.question, ballot_instructions()),
                    agent_ids: s.agent_ids,
                    merge: MergeStrategy::Vote(VoteConfig {
                        strategy: s.strategy,
                        confidence_threshold: s.confidence_threshold,
                        tie_breaker: s.judge_agent_id,
                    }),
                    synthesizer: None,
                    share_previous: s.share_votes,
                }));
                WorkflowPattern::Iterative(IterativePattern {
                    base,
                    max_iterations: 1,
                    restart: RestartPolicy::default(),
                })
            }
            other => return Err(OrchestrationError::UnsupportedPattern(other.to_string())),
        };
        Ok(self.table.add(pattern))
    }

    fn conditional(&mut self, spec: &Mapping, value: &Value, path: &str) -> OrchResult<WorkflowPattern> {
        let s: ConditionalSpec = parse_value(value, path)?;

        let mut branches = Vec::new();
        match spec.get("branches") {
            None | Some(Value::Null) => {}
            Some(Value::Mapping(entries)) => {
                for (key, branch) in entries {
                    let key = key.as_str().ok_or_else(|| {
                        OrchestrationError::InvalidWorkflow(format!("{path}.branches: keys must be strings"))
                    })?;
                    let branch_path = format!("{path}.branches.{key}");
                    let Value::Mapping(branch) = branch else {
                        return Err(OrchestrationError::InvalidWorkflow(format!(
                            "{branch_path} must be a pattern spec"
                        )));
                    };
                    let mut branch = branch.clone();
                    let predicate = match branch.remove("when") {
                        Some(when) => predicate(parse_value(&when, &format!("{branch_path}.when"))?)?,
                        None => BranchPredicate::Equals(key.to_string()),
                    };
                    let pattern = self.build(&branch, &branch_path)?;
                    branches.push(ConditionalBranch { predicate, pattern });
                }
            }
            Some(_) => {
                return Err(OrchestrationError::InvalidWorkflow(format!(
                    "{path}.branches must map branch keys to pattern specs"
                )));
            }
        }

        let default_branch = match spec.get("default_branch") {
            None | Some(Value::Null) => None,
            Some(Value::Mapping(default)) => Some(self.build(default, &format!("{path}.default_branch"))?),
            Some(_) => {
                return Err(OrchestrationError::InvalidWorkflow(format!(
                    "{path}.default_branch must be a pattern spec"
                )));
            }
        };

        Ok(WorkflowPattern::Conditional(ConditionalPattern {
            condition_agent_id: s.condition_agent_id,
            condition_prompt: s.condition_prompt,
            branches,
            default_branch,
        }))
    }
}

fn pipeline(spec: PipelineSpec) -> PipelinePattern {
    PipelinePattern {
        initial_input: spec.initial_prompt,
        stages: spec
            .stages
            .into_iter()
            .map(|stage| PipelineStage {
                agent_id: stage.agent_id,
                input_mapping: match (stage.prompt_template, stage.input_field) {
                    (Some(template), _) => InputMapping::Template(template),
                    (None, Some(field)) => InputMapping::Field(field),
                    (None, None) => InputMapping::Previous,
                },
                validation_prompt: stage.validation_prompt,
                validation_retries: stage.max_validation_retries,
            })
            .collect(),
        pass_full_history: spec.pass_full_history,
    }
}

fn predicate(when: WhenSpec) -> OrchResult<BranchPredicate> {
    Ok(match when {
        WhenSpec::Equals(value) => BranchPredicate::Equals(value),
        WhenSpec::Contains(value) => BranchPredicate::Contains(value),
        WhenSpec::Regex(pattern) => BranchPredicate::regex(&pattern)
            .map_err(|e| OrchestrationError::InvalidWorkflow(e.to_string()))?,
        WhenSpec::Judge {
            criteria,
            min_score,
        } => BranchPredicate::Judge {
            criteria,
            min_score,
        },
    })
}

fn restart_policy(
    spec: Option<RestartPolicySpec>,
    topic: Option<String>,
    path: &str,
) -> OrchResult<RestartPolicy> {
    let restart_topic = Topic::parse(topic.as_deref().unwrap_or(DEFAULT_RESTART_TOPIC))
        .map_err(|e| OrchestrationError::InvalidWorkflow(format!("{path}.restart_topic: {e}")))?;
    let policy = match spec {
        Some(spec) => RestartPolicy {
            enabled: spec.enabled,
            restart_topic,
            cooldown: Duration::from_secs(spec.cooldown_seconds),
            preserve_outputs: spec.preserve_outputs,
            reset_shared_memory: spec.reset_shared_memory,
            restartable_stages: spec.restartable_stages,
        },
        None => RestartPolicy {
            restart_topic,
            ..RestartPolicy::default()
        },
    };
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn doc(spec: &str) -> String {
        format!("apiVersion: weft/v1\nkind: Workflow\nmetadata:\n  name: test\nspec:\n{spec}")
    }

    fn root(document: &WorkflowDocument) -> &WorkflowPattern {
        document.table.root_pattern().unwrap().1
    }

    #[test]
    fn test_fork_join_document() {
        let document = WorkflowDocument::from_yaml_str(&doc(
            "  type: fork-join\n  prompt: Review this change\n  agent_ids: [security, style]\n  merge_strategy: summary\n  synthesizer_agent_id: lead\n  timeout_seconds: 30\n",
        ))
        .unwrap();
        assert_eq!(document.name(), "test");
        assert_eq!(document.spec_type, "fork-join");
        assert_eq!(document.timeout, Some(Duration::from_secs(30)));
        let WorkflowPattern::ForkJoin(fork) = root(&document) else {
            panic!("expected fork-join");
        };
        assert_eq!(fork.merge, MergeStrategy::Summary);
        assert_eq!(fork.synthesizer, Some(AgentId::new_unchecked("lead")));
        assert_eq!(fork.agent_ids.len(), 2);
    }

    #[test]
    fn test_pipeline_stage_mappings() {
        let document = WorkflowDocument::from_yaml_str(&doc(
            r#"  type: pipeline
  initial_prompt: Build a parser
  pass_full_history: true
  stages:
    - agent_id: planner
    - agent_id: coder
      input_field: plan.steps
    - agent_id: reviewer
      prompt_template: "Review: {{previous}}"
      validation_prompt: Is the review complete?
      max_validation_retries: 2
"#,
        ))
        .unwrap();
        let WorkflowPattern::Pipeline(pipeline) = root(&document) else {
            panic!("expected pipeline");
        };
        assert!(pipeline.pass_full_history);
        assert_eq!(pipeline.stages[0].input_mapping, InputMapping::Previous);
        assert_eq!(pipeline.stages[1].input_mapping, InputMapping::Field("plan.steps".into()));
        assert_eq!(
            pipeline.stages[2].input_mapping,
            InputMapping::Template("Review: {{previous}}".into())
        );
        assert!(pipeline.stages[2].validation_prompt.is_some());
        assert_eq!(pipeline.stages[2].validation_retries, 2);
        assert_eq!(pipeline.stages[1].validation_retries, 0);
    }

    #[test]
    fn test_conditional_branches_are_nested_specs() {
        let document = WorkflowDocument::from_yaml_str(&doc(
            r#"  type: conditional
  condition_agent_id: router
  condition_prompt: Answer sql or ui
  branches:
    sql:
      type: pipeline
      initial_prompt: tune the query
      stages:
        - agent_id: db
    ui:
      when:
        contains: frontend
      type: fork-join
      prompt: style it
      agent_ids: [fe1, fe2]
  default_branch:
    type: pipeline
    initial_prompt: help
    stages:
      - agent_id: general
"#,
        ))
        .unwrap();
        let WorkflowPattern::Conditional(conditional) = root(&document) else {
            panic!("expected conditional");
        };
        assert_eq!(conditional.branches[0].predicate, BranchPredicate::Equals("sql".into()));
        assert_eq!(
            conditional.branches[1].predicate,
            BranchPredicate::Contains("frontend".into())
        );
        assert!(matches!(
            document.table.get(conditional.branches[1].pattern),
            Some(WorkflowPattern::ForkJoin(_))
        ));
        assert!(conditional.default_branch.is_some());
        let agents: Vec<String> = document.table.agent_ids().iter().map(|a| a.to_string()).collect();
        assert_eq!(agents, vec!["db", "fe1", "fe2", "general", "router"]);
    }

    #[test]
    fn test_nested_branch_errors_carry_their_path() {
        let err = WorkflowDocument::from_yaml_str(&doc(
            "  type: conditional\n  condition_agent_id: router\n  condition_prompt: x\n  branches:\n    sql:\n      type: pipeline\n      stages: []\n",
        ))
        .unwrap_err();
        assert!(matches!(&err, OrchestrationError::InvalidWorkflow(msg) if msg.contains("spec.branches.sql")));
    }

    #[test]
    fn test_iterative_wraps_pipeline() {
        let document = WorkflowDocument::from_yaml_str(&doc(
            r#"  type: iterative
  max_iterations: 4
  restart_topic: build.restart
  restart_policy:
    enabled: true
    restartable_stages: [coder]
    cooldown_seconds: 5
  pipeline:
    initial_prompt: write code
    stages:
      - agent_id: planner
      - agent_id: coder
"#,
        ))
        .unwrap();
        let WorkflowPattern::Iterative(iterative) = root(&document) else {
            panic!("expected iterative");
        };
        assert_eq!(iterative.max_iterations, 4);
        assert!(iterative.restart.enabled);
        assert!(iterative.restart.preserve_outputs);
        assert_eq!(iterative.restart.cooldown, Duration::from_secs(5));
        assert_eq!(iterative.restart.restart_topic.as_str(), "build.restart");
        assert!(matches!(
            document.table.get(iterative.base),
            Some(WorkflowPattern::Pipeline(p)) if p.stages.len() == 2
        ));
    }

    #[test]
    fn test_swarm_becomes_iterative_vote() {
        let document = WorkflowDocument::from_yaml_str(&doc(
            "  type: swarm\n  question: Which database?\n  agent_ids: [a, b, c]\n  strategy: supermajority\n  judge_agent_id: judge\n",
        ))
        .unwrap();
        let WorkflowPattern::Iterative(iterative) = root(&document) else {
            panic!("expected iterative");
        };
        assert!(!iterative.restart.enabled);
        let Some(WorkflowPattern::ForkJoin(fork)) = document.table.get(iterative.base) else {
            panic!("expected fork-join base");
        };
        assert!(fork.prompt.starts_with("Which database?\n\nRespond in the following format"));
        let MergeStrategy::Vote(vote) = &fork.merge else {
            panic!("expected vote merge");
        };
        assert_eq!(vote.strategy, VoteStrategy::Supermajority);
        assert_eq!(vote.tie_breaker, Some(AgentId::new_unchecked("judge")));
    }

    #[rstest]
    #[case("apiVersion: weft/v1\nkind: Workflow\nmetadata: [", "INVALID_YAML")]
    #[case("kind: Workflow\nmetadata:\n  name: x\nspec:\n  type: pipeline\n", "INVALID_WORKFLOW")]
    #[case("apiVersion: weft/v1\nkind: Agent\nmetadata:\n  name: x\nspec:\n  type: pipeline\n", "INVALID_WORKFLOW")]
    #[case("apiVersion: weft/v1\nkind: Workflow\nmetadata:\n  name: \"\"\nspec:\n  type: pipeline\n", "INVALID_WORKFLOW")]
    #[case("apiVersion: weft/v1\nkind: Workflow\nmetadata:\n  name: x\n", "INVALID_WORKFLOW")]
    #[case("apiVersion: weft/v1\nkind: Workflow\nmetadata:\n  name: x\nspec:\n  type: map-reduce\n", "UNSUPPORTED_PATTERN")]
    #[case("apiVersion: weft/v1\nkind: Workflow\nmetadata:\n  name: x\nspec:\n  type: debate\n  topic: t\n", "INVALID_WORKFLOW")]
    #[case("apiVersion: weft/v1\nkind: Workflow\nmetadata:\n  name: x\nspec:\n  type: iterative\n  max_iterations: two\n  pipeline:\n    initial_prompt: p\n    stages: [{agent_id: a}]\n", "INVALID_WORKFLOW")]
    fn test_rejected_documents(#[case] text: &str, #[case] code: &str) {
        let err = WorkflowDocument::from_yaml_str(text).unwrap_err();
        assert_eq!(err.error_code(), code, "{err}");
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let err = WorkflowDocument::from_file("/nonexistent/weft/workflow.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::FileNotFound(_)));
    }
}
