//! Build reports. One report per package pipeline, one aggregate per
//! orchestrator run. Reports are written atomically and never edited in
//! place.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{PackwrightError, Result};
use crate::pipeline::Phase;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildMetrics {
    /// Seconds spent in each phase, summed across retries.
    pub build_time: f64,
    pub test_time: f64,
    pub quality_check_time: f64,
    pub publish_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualitySummary {
    pub lint_score: u32,
    pub test_coverage: u32,
    pub type_errors: u32,
    pub passed: bool,
}

impl QualitySummary {
    /// Synthetic summary for packages that needed no work.
    pub fn skipped() -> Self {
        Self { lint_score: 100, test_coverage: 0, type_errors: 0, passed: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixAttempt {
    /// Ordinal of this attempt within its phase, starting at 1.
    pub count: u32,
    pub types: Vec<String>,
    pub agent_prompt_used: String,
    /// Seconds the repair took.
    pub fix_duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageBuildReport {
    pub package_name: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub end_time: chrono::DateTime<chrono::Utc>,
    /// Seconds from pipeline start to completion.
    pub duration: f64,
    pub build_metrics: BuildMetrics,
    pub quality: QualitySummary,
    pub fix_attempts: Vec<FixAttempt>,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dependencies: Vec<String>,
    pub waited_for: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageFailure {
    pub package_name: String,
    pub failed_phase: Phase,
    pub error: String,
    pub fix_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowestEntry {
    pub package_name: String,
    pub duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixCountEntry {
    pub package_name: String,
    pub fix_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub build_id: String,
    pub total_packages: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_duration: f64,
    pub slowest_packages: Vec<SlowestEntry>,
    pub most_fix_attempts: Vec<FixCountEntry>,
    pub failures: Vec<PackageFailure>,
    pub packages: Vec<PackageBuildReport>,
}

/// Assemble the aggregate view over every per-package report.
pub fn aggregate(
    build_id: impl Into<String>,
    total_duration: f64,
    reports: Vec<PackageBuildReport>,
    failures: Vec<PackageFailure>,
) -> BuildReport {
    let successful = reports.iter().filter(|r| r.status == ReportStatus::Success).count();
    let failed = reports.len() - successful + failures
        .iter()
        .filter(|f| !reports.iter().any(|r| r.package_name == f.package_name))
        .count();

    let mut slowest: Vec<SlowestEntry> = reports
        .iter()
        .map(|r| SlowestEntry { package_name: r.package_name.clone(), duration: r.duration })
        .collect();
    slowest.sort_by(|a, b| b.duration.partial_cmp(&a.duration).unwrap_or(std::cmp::Ordering::Equal));
    slowest.truncate(5);

    let mut most_fixes: Vec<FixCountEntry> = reports
        .iter()
        .map(|r| FixCountEntry {
            package_name: r.package_name.clone(),
            fix_attempts: r.fix_attempts.len() as u32,
        })
        .collect();
    most_fixes.sort_by(|a, b| {
        b.fix_attempts
            .cmp(&a.fix_attempts)
            .then_with(|| a.package_name.cmp(&b.package_name))
    });
    most_fixes.truncate(5);

    let total_packages = reports.len()
        + failures
            .iter()
            .filter(|f| !reports.iter().any(|r| r.package_name == f.package_name))
            .count();

    BuildReport {
        build_id: build_id.into(),
        total_packages,
        successful,
        failed,
        total_duration,
        slowest_packages: slowest,
        most_fix_attempts: most_fixes,
        failures,
        packages: reports,
    }
}

pub struct Reporter {
    reports_dir: PathBuf,
}

impl Reporter {
    pub fn new(reports_dir: impl Into<PathBuf>) -> Self {
        Self { reports_dir: reports_dir.into() }
    }

    /// Write a per-package report, named after the package.
    pub fn write_package_report(&self, report: &PackageBuildReport) -> Result<PathBuf> {
        let filename = format!("{}.json", sanitize_name(&report.package_name));
        self.write_json(&filename, report)
    }

    /// Write the aggregate report, keyed by build id.
    pub fn write_aggregate(&self, report: &BuildReport) -> Result<PathBuf> {
        let filename = format!("{}.json", sanitize_name(&report.build_id));
        let path = self.write_json(&filename, report)?;
        info!("aggregate report written to {}", path.display());
        Ok(path)
    }

    fn write_json<T: Serialize>(&self, filename: &str, value: &T) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.reports_dir).map_err(PackwrightError::IoError)?;
        let dest = self.reports_dir.join(filename);

        // Write to a temp file in the same directory, then rename into
        // place, so a crash never leaves a truncated report behind.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.reports_dir)
            .map_err(PackwrightError::IoError)?;
        let body = serde_json::to_string_pretty(value)?;
        tmp.write_all(body.as_bytes()).map_err(PackwrightError::IoError)?;
        tmp.persist(&dest).map_err(|e| PackwrightError::ReportError {
            path: dest.clone(),
            message: e.to_string(),
        })?;
        Ok(dest)
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            '@' => '_',
            c => c,
        })
        .collect()
}
