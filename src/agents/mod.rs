//! Repair-agent registry: which agent handles which problem type.
//!
//! The registry file is TOML, loaded once per run and cached by the caller.
//! Lookup returns the highest-priority entry whose `problem_types` contain
//! the requested type; ties break by priority, then name ascending.

pub mod executor;

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;

use crate::coordinator::ProblemType;
use crate::error::{PackwrightError, Result};

#[derive(Debug, Deserialize, Clone)]
pub struct AgentRegistryEntry {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub problem_types: Vec<ProblemType>,
    #[serde(default)]
    pub priority: i32,
    /// Model identity recorded in the audit trail for runs of this agent.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    agents: Vec<AgentRegistryEntry>,
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    entries: Vec<AgentRegistryEntry>,
}

impl AgentRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PackwrightError::AgentError(format!(
                "failed to read agent registry {}: {}",
                path.display(),
                e
            ))
        })?;
        let doc: RegistryDocument = toml::from_str(&text)?;
        info!("loaded {} agents from {}", doc.agents.len(), path.display());
        Ok(Self { entries: doc.agents })
    }

    pub fn from_entries(entries: Vec<AgentRegistryEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best handler for a problem type, or None when nothing matches.
    pub fn lookup_for(&self, problem_type: ProblemType) -> Option<&AgentRegistryEntry> {
        self.entries
            .iter()
            .filter(|e| e.problem_types.contains(&problem_type))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.name.cmp(&b.name))
            })
    }
}
