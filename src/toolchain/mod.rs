//! Local toolchain adapters: build, test, quality and publish runners.
//!
//! Every runner is a subprocess with captured output and an independent
//! timeout. Exit nonzero means failure with stderr preserved; parsing of
//! coverage and lint findings happens here so the pipeline only ever sees
//! structured results.

pub mod process;

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::Result;
use self::process::run_command;

/// Outcome of a build or publish invocation.
#[derive(Debug, Clone)]
pub struct CommandReport {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct TestReport {
    pub ok: bool,
    /// Parsed from `Coverage: N%` in stdout; 0 when the marker is absent.
    pub coverage: u32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QualityFailure {
    #[serde(rename = "type")]
    pub kind: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct QualityReport {
    pub passed: bool,
    pub failures: Vec<QualityFailure>,
    pub duration: Duration,
}

pub trait Toolchain: Send + Sync {
    fn run_build(&self, package_dir: &Path) -> Result<CommandReport>;
    fn run_tests(&self, package_dir: &Path) -> Result<TestReport>;
    fn run_quality(&self, package_dir: &Path) -> Result<QualityReport>;
    fn publish(&self, package_dir: &Path, registry_token: &str) -> Result<CommandReport>;
}

/// Command lines for each phase, split shell-free into argv form.
#[derive(Debug, Clone)]
pub struct ToolchainCommands {
    pub build: Vec<String>,
    pub test: Vec<String>,
    pub quality: Vec<String>,
    pub publish: Vec<String>,
}

impl Default for ToolchainCommands {
    fn default() -> Self {
        Self {
            build: argv(&["npm", "run", "build"]),
            test: argv(&["npm", "test"]),
            quality: argv(&["npm", "run", "quality"]),
            publish: argv(&["npm", "publish"]),
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Toolchain backed by the package's own command lines.
pub struct CommandToolchain {
    commands: ToolchainCommands,
    timeout: Duration,
}

impl CommandToolchain {
    pub fn new(commands: ToolchainCommands, timeout: Duration) -> Self {
        Self { commands, timeout }
    }
}

impl Toolchain for CommandToolchain {
    fn run_build(&self, package_dir: &Path) -> Result<CommandReport> {
        info!("running build in {}", package_dir.display());
        let result = run_command(&self.commands.build, package_dir, &HashMap::new(), self.timeout)?;
        Ok(CommandReport {
            ok: result.exit_code == 0,
            stdout: result.stdout,
            stderr: result.stderr,
            duration: result.duration,
        })
    }

    fn run_tests(&self, package_dir: &Path) -> Result<TestReport> {
        info!("running tests in {}", package_dir.display());
        let result = run_command(&self.commands.test, package_dir, &HashMap::new(), self.timeout)?;
        let coverage = parse_coverage(&result.stdout);
        debug!("parsed coverage: {}%", coverage);
        Ok(TestReport {
            ok: result.exit_code == 0,
            coverage,
            stdout: result.stdout,
            stderr: result.stderr,
            duration: result.duration,
        })
    }

    fn run_quality(&self, package_dir: &Path) -> Result<QualityReport> {
        info!("running quality checks in {}", package_dir.display());
        let result = run_command(&self.commands.quality, package_dir, &HashMap::new(), self.timeout)?;
        let passed = result.exit_code == 0;
        let failures = if passed {
            Vec::new()
        } else {
            parse_quality_failures(&result.stdout, &result.stderr)
        };
        Ok(QualityReport { passed, failures, duration: result.duration })
    }

    fn publish(&self, package_dir: &Path, registry_token: &str) -> Result<CommandReport> {
        info!("publishing {}", package_dir.display());
        let mut env = HashMap::new();
        // The token travels through the child environment, never argv.
        env.insert("NODE_AUTH_TOKEN".to_string(), registry_token.to_string());
        let result = run_command(&self.commands.publish, package_dir, &env, self.timeout)?;
        Ok(CommandReport {
            ok: result.exit_code == 0,
            stdout: result.stdout,
            stderr: result.stderr,
            duration: result.duration,
        })
    }
}

fn coverage_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Coverage:\s*(\d+)%").unwrap())
}

fn lint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"LINT ERROR:\s*([^:]+):(\d+)\s*-\s*(.+)").unwrap())
}

fn type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"TYPE ERROR:\s*([^:]+):(\d+)\s*-\s*(.+)").unwrap())
}

/// `Coverage: N%` in test stdout; absent means 0.
pub fn parse_coverage(stdout: &str) -> u32 {
    coverage_re()
        .captures(stdout)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Extract structured failures from quality-runner output. Lines that match
/// neither marker collapse into one generic entry so a failing run never
/// produces an empty failure list.
pub fn parse_quality_failures(stdout: &str, stderr: &str) -> Vec<QualityFailure> {
    let mut failures = Vec::new();
    for line in stdout.lines().chain(stderr.lines()) {
        if let Some(caps) = lint_re().captures(line) {
            failures.push(QualityFailure {
                kind: "lint".to_string(),
                file: Some(caps[1].trim().to_string()),
                line: caps[2].parse().ok(),
                message: caps[3].trim().to_string(),
            });
        } else if let Some(caps) = type_re().captures(line) {
            failures.push(QualityFailure {
                kind: "type".to_string(),
                file: Some(caps[1].trim().to_string()),
                line: caps[2].parse().ok(),
                message: caps[3].trim().to_string(),
            });
        }
    }

    if failures.is_empty() {
        failures.push(QualityFailure {
            kind: "quality".to_string(),
            file: None,
            line: None,
            message: summarize_output(stdout, stderr, 20),
        });
    }

    failures
}

/// Condense runner output for error reports and agent prompts.
///
/// Build tools scatter diagnostics across both streams, so neither is
/// discarded: the tail of stderr comes first, then the tail of stdout,
/// blank lines dropped, each stream contributing at most `max_per_stream`
/// lines.
pub fn summarize_output(stdout: &str, stderr: &str, max_per_stream: usize) -> String {
    let mut sections = Vec::new();
    for text in [stderr, stdout] {
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.is_empty() {
            continue;
        }
        let dropped = lines.len().saturating_sub(max_per_stream);
        let mut section = String::new();
        if dropped > 0 {
            section.push_str(&format!("[{} earlier lines dropped]\n", dropped));
        }
        section.push_str(&lines[dropped..].join("\n"));
        sections.push(section);
    }
    if sections.is_empty() {
        "no output captured".to_string()
    } else {
        sections.join("\n")
    }
}
