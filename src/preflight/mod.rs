//! Pre-flight classification: decide per package whether any work is
//! needed at all, and assemble the audit context for partial packages.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::Result;
use crate::plan::PackageSpec;
use crate::registry::RegistryLookup;

/// Where a package starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    /// No local directory; scaffold from nothing.
    Fresh,
    /// Local directory exists but the registry has never seen it.
    Partial,
    /// Published and the plan asks for nothing new.
    PublishedCurrent { version: String },
    /// Published, and the plan carries an upgrade indicator.
    NeedsUpgrade { version: String },
}

impl PublishState {
    pub fn label(&self) -> &'static str {
        match self {
            PublishState::Fresh => "fresh",
            PublishState::Partial => "partial",
            PublishState::PublishedCurrent { .. } => "published-current",
            PublishState::NeedsUpgrade { .. } => "needs-upgrade",
        }
    }
}

/// Classify one package against the (filesystem, registry, plan) snapshot.
/// Pure with respect to that snapshot: no caching, no side effects.
pub fn classify(
    spec: &PackageSpec,
    package_dir: &Path,
    plan_has_upgrade_indicator: bool,
    registry: &dyn RegistryLookup,
) -> Result<PublishState> {
    let verdict = registry.lookup(&spec.name)?;

    if verdict.published {
        if let Some(version) = verdict.version {
            return Ok(if plan_has_upgrade_indicator {
                PublishState::NeedsUpgrade { version }
            } else {
                PublishState::PublishedCurrent { version }
            });
        }
    }

    if package_dir.is_dir() {
        Ok(PublishState::Partial)
    } else {
        Ok(PublishState::Fresh)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Complete,
    Incomplete,
}

/// Structured description of how far along a partial package is.
/// Rendering (the ✅/❌ file list agents see) happens at the presentation
/// boundary; nothing ever parses this back out of text.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageAudit {
    pub completion_percentage: u32,
    pub existing_files: Vec<String>,
    pub missing_files: Vec<String>,
    pub next_steps: Vec<String>,
    pub status: AuditStatus,
}

impl PackageAudit {
    /// Render the audit as the file checklist a scaffolding agent receives.
    pub fn render_checklist(&self) -> String {
        let mut out = String::new();
        for f in &self.existing_files {
            out.push_str(&format!("✅ {}\n", f));
        }
        for f in &self.missing_files {
            out.push_str(&format!("❌ {}\n", f));
        }
        out
    }
}

/// Partition the plan's expected file list against what is on disk.
///
/// When the plan declares no expected files, the conventional minimum for a
/// publishable package is assumed: a `package.json` and a `src/` tree.
pub fn audit_package(package_dir: &Path, expected_files: &[String]) -> PackageAudit {
    let expected: Vec<String> = if expected_files.is_empty() {
        vec!["package.json".to_string(), "src".to_string()]
    } else {
        expected_files.to_vec()
    };

    let present = scan_present(package_dir);
    debug!("audit of {}: {} entries on disk", package_dir.display(), present.len());

    let mut existing_files = Vec::new();
    let mut missing_files = Vec::new();
    for file in expected {
        if present.contains(&file) {
            existing_files.push(file);
        } else {
            missing_files.push(file);
        }
    }

    let total = existing_files.len() + missing_files.len();
    let completion_percentage = if total == 0 {
        0
    } else {
        ((existing_files.len() as f64 / total as f64) * 100.0).round() as u32
    };

    let next_steps: Vec<String> = missing_files.iter().map(|f| format!("create {}", f)).collect();
    let status = if missing_files.is_empty() {
        AuditStatus::Complete
    } else {
        AuditStatus::Incomplete
    };

    PackageAudit {
        completion_percentage,
        existing_files,
        missing_files,
        next_steps,
        status,
    }
}

/// Relative paths of every file and directory under the package root.
fn scan_present(package_dir: &Path) -> BTreeSet<String> {
    let mut present = BTreeSet::new();
    if !package_dir.is_dir() {
        return present;
    }
    for entry in WalkDir::new(package_dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if let Ok(rel) = entry.path().strip_prefix(package_dir) {
            present.insert(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    present
}
