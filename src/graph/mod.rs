//! Dependency graph construction: category layering, node ordering,
//! and cycle detection over the package set.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PackwrightError, Result};

/// Package categories, ordered by build layer. Leaves come first:
/// a `validator` depends on nothing, a `suite` may depend on anything below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageCategory {
    Validator,
    Core,
    Utility,
    Service,
    Ui,
    Suite,
}

impl PackageCategory {
    /// Numeric build layer. Derived from the category, never declared.
    pub fn layer(&self) -> u32 {
        match self {
            PackageCategory::Validator => 0,
            PackageCategory::Core => 1,
            PackageCategory::Utility => 2,
            PackageCategory::Service => 3,
            PackageCategory::Ui => 4,
            PackageCategory::Suite => 5,
        }
    }

    /// Parse a free-form category declaration by token containment.
    ///
    /// A declaration can carry more than one recognizable token
    /// (e.g. "ui test suite"); the most specific one wins, in the order
    /// suite > validator > core > utility > service > ui. Unrecognized
    /// text falls back to `Service`.
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        const BY_SPECIFICITY: &[(&str, PackageCategory)] = &[
            ("suite", PackageCategory::Suite),
            ("validator", PackageCategory::Validator),
            ("core", PackageCategory::Core),
            ("utility", PackageCategory::Utility),
            ("service", PackageCategory::Service),
            ("ui", PackageCategory::Ui),
        ];
        for (token, category) in BY_SPECIFICITY {
            if lower.contains(token) {
                return *category;
            }
        }
        PackageCategory::Service
    }
}

impl std::fmt::Display for PackageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PackageCategory::Validator => "validator",
            PackageCategory::Core => "core",
            PackageCategory::Utility => "utility",
            PackageCategory::Service => "service",
            PackageCategory::Ui => "ui",
            PackageCategory::Suite => "suite",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Building,
    Completed,
    Failed,
}

/// One package in the build graph. Created during graph construction,
/// status-mutated only by the orchestrator.
#[derive(Debug, Clone)]
pub struct PackageNode {
    pub name: String,
    pub category: PackageCategory,
    pub layer: u32,
    pub dependencies: HashSet<String>,
    pub build_status: BuildStatus,
}

impl PackageNode {
    pub fn new(name: impl Into<String>, category: PackageCategory, deps: &[String]) -> Self {
        let name = name.into();
        Self {
            name,
            layer: category.layer(),
            category,
            dependencies: deps.iter().cloned().collect(),
            build_status: BuildStatus::Pending,
        }
    }
}

/// Order nodes stable-sorted by (layer ascending, name ascending),
/// rejecting duplicates and dependency cycles.
///
/// A node whose layer sits below one of its dependencies only draws a
/// warning; layering is advisory, the per-node dependency sets are what
/// the scheduler enforces.
pub fn build_graph(mut nodes: Vec<PackageNode>) -> Result<Vec<PackageNode>> {
    let mut seen = HashSet::new();
    for node in &nodes {
        if !seen.insert(node.name.clone()) {
            return Err(PackwrightError::DuplicatePackage(node.name.clone()));
        }
    }

    detect_cycles(&nodes)?;

    let layers: HashMap<String, u32> = nodes.iter().map(|n| (n.name.clone(), n.layer)).collect();
    for node in &nodes {
        for dep in &node.dependencies {
            if let Some(dep_layer) = layers.get(dep) {
                if node.layer < *dep_layer {
                    warn!(
                        "package {} (layer {}) sits below its dependency {} (layer {})",
                        node.name, node.layer, dep, dep_layer
                    );
                }
            }
        }
    }

    nodes.sort_by(|a, b| a.layer.cmp(&b.layer).then_with(|| a.name.cmp(&b.name)));
    Ok(nodes)
}

/// Depth-first cycle check over the dependency relation. Edges to packages
/// outside the node set are ignored; those are satisfied externally.
fn detect_cycles(nodes: &[PackageNode]) -> Result<()> {
    let by_name: HashMap<&str, &PackageNode> =
        nodes.iter().map(|n| (n.name.as_str(), n)).collect();

    let mut visited = HashSet::new();
    let mut visiting = HashSet::new();

    for node in nodes {
        visit(&node.name, &by_name, &mut visited, &mut visiting)?;
    }

    Ok(())
}

fn visit(
    name: &str,
    by_name: &HashMap<&str, &PackageNode>,
    visited: &mut HashSet<String>,
    visiting: &mut HashSet<String>,
) -> Result<()> {
    if visited.contains(name) {
        return Ok(());
    }
    if visiting.contains(name) {
        return Err(PackwrightError::DependencyError(format!(
            "circular dependency detected: {}",
            name
        )));
    }

    visiting.insert(name.to_string());

    if let Some(node) = by_name.get(name) {
        for dep in &node.dependencies {
            if by_name.contains_key(dep.as_str()) {
                visit(dep, by_name, visited, visiting)?;
            }
        }
    }

    visiting.remove(name);
    visited.insert(name.to_string());

    Ok(())
}
