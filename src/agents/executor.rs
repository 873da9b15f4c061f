//! Agent execution. An agent is an external program that edits package
//! source in response to a structured task; success means it completed
//! without framework error, never that the resulting code is correct.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::agents::AgentRegistryEntry;
use crate::error::{PackwrightError, Result};
use crate::toolchain::process::run_command_with_input;
use crate::vcs::SourceControl;

/// Task payload handed to an agent on stdin. The identity fields travel
/// verbatim from the pipeline input.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub package_name: String,
    pub package_path: PathBuf,
    pub plan_path: PathBuf,
    pub workspace_root: PathBuf,
    pub category: String,
    /// Human-readable description of what the agent should do.
    pub instructions: String,
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    /// Paths the agent left modified, relative to the package repo.
    pub changes: Vec<PathBuf>,
    pub output: String,
    pub duration: Duration,
}

pub trait AgentExecutor: Send + Sync {
    fn execute(&self, entry: &AgentRegistryEntry, task: &AgentTask) -> Result<AgentOutcome>;
}

/// Runs the agent binary named by its registry entry, feeding the task as
/// JSON on stdin and diffing the working tree to find what it touched.
pub struct ProcessAgentExecutor {
    vcs: Arc<dyn SourceControl>,
    timeout: Duration,
}

impl ProcessAgentExecutor {
    pub fn new(vcs: Arc<dyn SourceControl>, timeout: Duration) -> Self {
        Self { vcs, timeout }
    }
}

impl AgentExecutor for ProcessAgentExecutor {
    fn execute(&self, entry: &AgentRegistryEntry, task: &AgentTask) -> Result<AgentOutcome> {
        let payload = serde_json::to_string(task)?;
        let before: HashSet<PathBuf> = self
            .vcs
            .changed_paths(&task.package_path)
            .unwrap_or_default()
            .into_iter()
            .collect();

        info!("running agent {} for {}", entry.name, task.package_name);
        let started = Instant::now();

        let argv = vec![entry.path.to_string_lossy().to_string()];
        let result = run_command_with_input(
            &argv,
            &task.package_path,
            &HashMap::new(),
            Some(&payload),
            self.timeout,
        )
        .map_err(|e| {
            PackwrightError::AgentError(format!(
                "failed to start agent {} ({}): {}",
                entry.name,
                entry.path.display(),
                e
            ))
        })?;
        let duration = started.elapsed();

        if result.timed_out {
            warn!("agent {} timed out after {:?}", entry.name, self.timeout);
        }

        let after = self.vcs.changed_paths(&task.package_path).unwrap_or_default();
        let changes: Vec<PathBuf> = after
            .into_iter()
            .filter(|p| !before.contains(p))
            .collect();

        let mut output = result.stdout;
        if !result.stderr.is_empty() {
            output.push('\n');
            output.push_str(&result.stderr);
        }

        Ok(AgentOutcome {
            success: result.exit_code == 0 && !result.timed_out,
            changes,
            output,
            duration,
        })
    }
}
