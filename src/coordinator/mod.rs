//! Recovery controller. Classifies a failure, delegates a repair to the
//! matching agent, and reports one of a fixed set of decisions back to the
//! pipeline. Delegation is internal: by the time `decide` returns, any
//! repair agent has already run, so callers only ever observe terminal
//! decisions.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agents::executor::{AgentExecutor, AgentTask};
use crate::agents::AgentRegistry;
use crate::pipeline::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProblemType {
    BuildFailure,
    TestFailure,
    QualityFailure,
    EnvironmentError,
    PackageScaffolding,
}

impl std::fmt::Display for ProblemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProblemType::BuildFailure => "BUILD_FAILURE",
            ProblemType::TestFailure => "TEST_FAILURE",
            ProblemType::QualityFailure => "QUALITY_FAILURE",
            ProblemType::EnvironmentError => "ENVIRONMENT_ERROR",
            ProblemType::PackageScaffolding => "PACKAGE_SCAFFOLDING",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemContext {
    pub package_name: String,
    pub package_path: PathBuf,
    pub plan_path: PathBuf,
    pub phase: Phase,
    pub attempt_number: u32,
}

/// A failure report. Immutable once sent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    #[serde(rename = "type")]
    pub problem_type: ProblemType,
    pub error: ErrorDetail,
    pub context: ProblemContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Retry,
    /// Never surfaces to a pipeline: delegation completes inside `decide`
    /// and folds into `Retry`.
    Delegate,
    Escalate,
    Fail,
    Resolved,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

/// The coordinator's verdict. A message value: built once, never mutated.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorAction {
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub escalation: Option<Escalation>,
    pub modifications: Vec<PathBuf>,
    pub reasoning: String,
}

impl CoordinatorAction {
    fn escalate(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            decision: Decision::Escalate,
            agent: None,
            task: None,
            escalation: Some(Escalation { reason: reason.clone(), report_path: None }),
            modifications: Vec::new(),
            reasoning: reason,
        }
    }

    /// Whether the pipeline may move forward (re-run the phase or proceed).
    pub fn is_forward_progress(&self) -> bool {
        matches!(self.decision, Decision::Retry | Decision::Resolved)
    }
}

pub struct Coordinator {
    registry: AgentRegistry,
    executor: Arc<dyn AgentExecutor>,
    max_attempts: u32,
}

impl Coordinator {
    pub fn new(registry: AgentRegistry, executor: Arc<dyn AgentExecutor>, max_attempts: u32) -> Self {
        Self { registry, executor, max_attempts }
    }

    /// Apply the decision table. For the same problem and the same agent
    /// behavior the decision is the same; all the nondeterminism lives
    /// inside the agent.
    pub fn decide(&self, problem: &Problem, task: &AgentTask) -> CoordinatorAction {
        let attempt = problem.context.attempt_number;
        if attempt > self.max_attempts {
            warn!(
                "{}: attempt {} exceeds budget of {}",
                problem.context.package_name, attempt, self.max_attempts
            );
            return CoordinatorAction::escalate("exhausted attempts");
        }

        let entry = match self.registry.lookup_for(problem.problem_type) {
            Some(entry) => entry,
            None => {
                warn!("no handler registered for {}", problem.problem_type);
                return CoordinatorAction::escalate("no handler");
            }
        };

        info!(
            "{}: delegating {} (attempt {}/{}) to {}",
            problem.context.package_name, problem.problem_type, attempt, self.max_attempts, entry.name
        );

        let outcome = match self.executor.execute(entry, task) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Framework-level failure (missing binary, broken pipe):
                // nothing an immediate retry could change.
                return CoordinatorAction::escalate(format!("agent {} failed: {}", entry.name, e));
            }
        };

        if outcome.success && problem.problem_type == ProblemType::PackageScaffolding {
            return CoordinatorAction {
                decision: Decision::Resolved,
                agent: Some(entry.name.clone()),
                task: Some(task.instructions.clone()),
                escalation: None,
                modifications: outcome.changes,
                reasoning: format!("agent {} completed scaffolding; no retry needed", entry.name),
            };
        }

        if outcome.success && !outcome.changes.is_empty() {
            return CoordinatorAction {
                decision: Decision::Retry,
                agent: Some(entry.name.clone()),
                task: Some(task.instructions.clone()),
                escalation: None,
                modifications: outcome.changes,
                reasoning: format!("agent {} produced modifications; re-run the failed phase", entry.name),
            };
        }

        CoordinatorAction {
            decision: Decision::Fail,
            agent: Some(entry.name.clone()),
            task: Some(task.instructions.clone()),
            escalation: None,
            modifications: Vec::new(),
            reasoning: format!(
                "agent {} produced no modifications and the error persists",
                entry.name
            ),
        }
    }
}
