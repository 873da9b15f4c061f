//! Append-only JSONL trails at the workspace root: the audit trace, the
//! tool-call log and the agent-response log. Writes are best-effort; a full
//! disk degrades observability, not the build.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditTraceEntry {
    pub workflow_run_id: String,
    pub step_name: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cost_usd: f64,
    pub validation_status: ValidationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error_type: Option<String>,
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolCallEntry {
    pub workflow_run_id: String,
    pub tool: String,
    pub package: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    pub exit_ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseEntry {
    pub workflow_run_id: String,
    pub agent: String,
    pub package: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub response: String,
}

#[derive(Clone)]
pub struct TraceWriter {
    audit_trace: PathBuf,
    tool_call_log: PathBuf,
    response_log: PathBuf,
}

impl TraceWriter {
    pub fn new(workspace_root: &Path) -> Self {
        Self {
            audit_trace: workspace_root.join("audit_trace.jsonl"),
            tool_call_log: workspace_root.join("tool_call_log.jsonl"),
            response_log: workspace_root.join("response_log.jsonl"),
        }
    }

    pub fn audit(&self, entry: &AuditTraceEntry) {
        append_line(&self.audit_trace, entry);
    }

    pub fn tool_call(&self, entry: &ToolCallEntry) {
        append_line(&self.tool_call_log, entry);
    }

    pub fn response(&self, entry: &ResponseEntry) {
        append_line(&self.response_log, entry);
    }
}

fn append_line<T: Serialize>(path: &Path, entry: &T) {
    let line = match serde_json::to_string(entry) {
        Ok(line) => line,
        Err(e) => {
            warn!("failed to serialize trace entry: {}", e);
            return;
        }
    };
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{}", line));
    if let Err(e) = result {
        warn!("failed to append to {}: {}", path.display(), e);
    }
}
