//! Input documents: the build plan, the audit-report document, and the
//! upgrade-indicator scan over plan text.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{PackwrightError, Result};
use crate::graph::PackageCategory;

/// One package entry as declared in a plan document or supplied directly.
#[derive(Debug, Deserialize, Clone)]
pub struct PackageSpec {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub deps: Vec<String>,
    /// Files the finished package is expected to contain, relative to `path`.
    /// Drives the audit partition for partial packages.
    #[serde(default)]
    pub files: Vec<String>,
}

impl PackageSpec {
    pub fn category(&self) -> PackageCategory {
        PackageCategory::parse(&self.category)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PlanMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// A parsed plan document. The raw text is kept alongside the structured
/// entries: the upgrade-indicator scan runs over the whole document, not
/// just the fields this parser understands.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub path: PathBuf,
    pub metadata: PlanMetadata,
    pub packages: Vec<PackageSpec>,
    pub raw_text: String,
}

#[derive(Debug, Deserialize)]
struct PlanDocument {
    #[serde(default)]
    plan: PlanMetadata,
    #[serde(default)]
    packages: Vec<PackageSpec>,
}

impl BuildPlan {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw_text = std::fs::read_to_string(path).map_err(|e| {
            PackwrightError::PlanError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let doc: PlanDocument = toml::from_str(&raw_text)?;
        if doc.packages.is_empty() && doc.plan.name.is_empty() {
            return Err(PackwrightError::PlanError(format!(
                "{}: document declares neither plan metadata nor packages",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            metadata: doc.plan,
            packages: doc.packages,
            raw_text,
        })
    }

    /// Whether the plan text calls for re-publishing an already-published
    /// package. Matched case-insensitively.
    pub fn has_upgrade_indicator(&self) -> bool {
        has_upgrade_indicator(&self.raw_text)
    }
}

/// An audit-report document: one root package plus its direct dependencies.
#[derive(Debug, Deserialize, Clone)]
pub struct AuditReport {
    pub root: PackageSpec,
    #[serde(default)]
    pub dependencies: Vec<PackageSpec>,
}

impl AuditReport {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PackwrightError::PlanError(format!(
                "failed to read audit report {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Flatten into the package list the graph builder takes. The root's
    /// dependency set is the named dependency entries.
    pub fn into_specs(self) -> Vec<PackageSpec> {
        let mut root = self.root;
        for dep in &self.dependencies {
            if !root.deps.contains(&dep.name) {
                root.deps.push(dep.name.clone());
            }
        }
        let mut specs = self.dependencies;
        specs.push(root);
        specs
    }
}

/// Case-insensitive scan for language that signals an upgrade:
/// "upgrade", "update", "version X.Y.Z to A.B.C", "enhancement",
/// "breaking change", "migration".
pub fn has_upgrade_indicator(text: &str) -> bool {
    let lower = text.to_lowercase();
    if ["upgrade", "update", "enhancement", "breaking change", "migration"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        return true;
    }
    version_transition_re().is_match(&lower)
}

fn version_transition_re() -> &'static regex::Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"version\s+\d+\.\d+\.\d+\s+to\s+\d+\.\d+\.\d+").unwrap()
    })
}
