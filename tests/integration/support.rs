//! Scripted collaborators for driving pipelines and the orchestrator
//! without a real registry, toolchain, git remote, or agent binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use packwright::agents::executor::{AgentExecutor, AgentOutcome, AgentTask};
use packwright::agents::{AgentRegistry, AgentRegistryEntry};
use packwright::coordinator::ProblemType;
use packwright::error::Result;
use packwright::pipeline::{
    BuildPipeline, CancelToken, PackageBuildInput, PipelineContext, PipelineSettings,
};
use packwright::registry::{RegistryLookup, RegistryVerdict};
use packwright::report::Reporter;
use packwright::status::{PackageStatus, StatusSink};
use packwright::toolchain::{
    CommandReport, QualityFailure, QualityReport, TestReport, Toolchain,
};
use packwright::trace::TraceWriter;
use packwright::vcs::{CommitOutcome, SourceControl};

/// Per-package behavior for the fake toolchain.
#[derive(Debug, Clone)]
pub struct PackageScript {
    pub build_failures_before_ok: usize,
    pub test_failures_before_ok: usize,
    /// `usize::MAX` means quality never passes.
    pub quality_failures_before_ok: usize,
    pub publish_fails: bool,
    pub coverage: u32,
}

impl Default for PackageScript {
    fn default() -> Self {
        Self {
            build_failures_before_ok: 0,
            test_failures_before_ok: 0,
            quality_failures_before_ok: 0,
            publish_fails: false,
            coverage: 95,
        }
    }
}

pub struct FakeToolchain {
    scripts: Mutex<HashMap<String, PackageScript>>,
    counters: Mutex<HashMap<String, usize>>,
    /// Every invocation, in order: (phase, package key).
    pub calls: Mutex<Vec<(String, String)>>,
    active: Mutex<usize>,
    pub max_active: Mutex<usize>,
    pub delay: Duration,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            active: Mutex::new(0),
            max_active: Mutex::new(0),
            delay: Duration::from_millis(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn script(&self, package_key: &str, script: PackageScript) {
        self.scripts.lock().unwrap().insert(package_key.to_string(), script);
    }

    pub fn calls_for(&self, package_key: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, key)| key == package_key)
            .map(|(phase, _)| phase.clone())
            .collect()
    }

    fn key(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string())
    }

    fn begin(&self, phase: &str, key: &str) -> (PackageScript, usize) {
        {
            let mut active = self.active.lock().unwrap();
            *active += 1;
            let mut max = self.max_active.lock().unwrap();
            if *active > *max {
                *max = *active;
            }
        }
        self.calls.lock().unwrap().push((phase.to_string(), key.to_string()));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default();
        let counter_key = format!("{}:{}", phase, key);
        let mut counters = self.counters.lock().unwrap();
        let count = counters.entry(counter_key).or_insert(0);
        let this_call = *count;
        *count += 1;
        (script, this_call)
    }

    fn end(&self) {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        *self.active.lock().unwrap() -= 1;
    }
}

impl Toolchain for FakeToolchain {
    fn run_build(&self, package_dir: &Path) -> Result<CommandReport> {
        let key = Self::key(package_dir);
        let (script, call) = self.begin("build", &key);
        let ok = call >= script.build_failures_before_ok;
        self.end();
        Ok(CommandReport {
            ok,
            stdout: String::new(),
            stderr: if ok {
                String::new()
            } else {
                "error TS2322: Type 'string' is not assignable".to_string()
            },
            duration: Duration::from_millis(10),
        })
    }

    fn run_tests(&self, package_dir: &Path) -> Result<TestReport> {
        let key = Self::key(package_dir);
        let (script, call) = self.begin("test", &key);
        let ok = call >= script.test_failures_before_ok;
        self.end();
        Ok(TestReport {
            ok,
            coverage: if ok { script.coverage } else { 0 },
            stdout: format!("Coverage: {}%", script.coverage),
            stderr: if ok { String::new() } else { "1 suite failed".to_string() },
            duration: Duration::from_millis(10),
        })
    }

    fn run_quality(&self, package_dir: &Path) -> Result<QualityReport> {
        let key = Self::key(package_dir);
        let (script, call) = self.begin("quality", &key);
        let passed = call >= script.quality_failures_before_ok;
        self.end();
        Ok(QualityReport {
            passed,
            failures: if passed {
                vec![]
            } else {
                vec![QualityFailure {
                    kind: "lint".to_string(),
                    file: Some("src/index.ts".to_string()),
                    line: Some(1),
                    message: "unexpected any".to_string(),
                }]
            },
            duration: Duration::from_millis(10),
        })
    }

    fn publish(&self, package_dir: &Path, _registry_token: &str) -> Result<CommandReport> {
        let key = Self::key(package_dir);
        let (script, _) = self.begin("publish", &key);
        self.end();
        Ok(CommandReport {
            ok: !script.publish_fails,
            stdout: String::new(),
            stderr: if script.publish_fails { "403 Forbidden".to_string() } else { String::new() },
            duration: Duration::from_millis(10),
        })
    }
}

pub struct FakeRegistry {
    verdicts: Mutex<HashMap<String, RegistryVerdict>>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self { verdicts: Mutex::new(HashMap::new()) }
    }

    pub fn publish(&self, name: &str, version: &str) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(name.to_string(), RegistryVerdict::published(version));
    }
}

impl RegistryLookup for FakeRegistry {
    fn lookup(&self, name: &str) -> Result<RegistryVerdict> {
        Ok(self
            .verdicts
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_else(RegistryVerdict::not_published))
    }
}

pub struct FakeVcs {
    pub commits: Mutex<Vec<(PathBuf, String)>>,
    pub pushes: Mutex<Vec<(PathBuf, String)>>,
    pub push_fails: bool,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self {
            commits: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            push_fails: false,
        }
    }

    pub fn failing_push() -> Self {
        Self { push_fails: true, ..Self::new() }
    }

    pub fn commit_messages(&self) -> Vec<String> {
        self.commits.lock().unwrap().iter().map(|(_, m)| m.clone()).collect()
    }
}

impl SourceControl for FakeVcs {
    fn configure_user(&self, _repo: &Path, _name: &str, _email: &str) -> Result<()> {
        Ok(())
    }

    fn create_branch(&self, _repo: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    fn commit(&self, repo: &Path, message: &str) -> Result<CommitOutcome> {
        self.commits
            .lock()
            .unwrap()
            .push((repo.to_path_buf(), message.to_string()));
        Ok(CommitOutcome::Committed)
    }

    fn push(&self, repo: &Path, remote: &str, branch: &str, _force: bool) -> Result<()> {
        if self.push_fails {
            return Err(packwright::error::PackwrightError::VcsError(
                "remote hung up".to_string(),
            ));
        }
        self.pushes
            .lock()
            .unwrap()
            .push((repo.to_path_buf(), format!("{}/{}", remote, branch)));
        Ok(())
    }

    fn changed_paths(&self, _repo: &Path) -> Result<Vec<PathBuf>> {
        Ok(vec![])
    }
}

pub struct FakeAgentExecutor {
    pub succeed: bool,
    pub produce_changes: bool,
    pub calls: Mutex<Vec<(String, AgentTask)>>,
}

impl FakeAgentExecutor {
    pub fn new() -> Self {
        Self { succeed: true, produce_changes: true, calls: Mutex::new(Vec::new()) }
    }

    pub fn inert() -> Self {
        Self { succeed: true, produce_changes: false, calls: Mutex::new(Vec::new()) }
    }

    pub fn instructions(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, task)| task.instructions.clone())
            .collect()
    }
}

impl AgentExecutor for FakeAgentExecutor {
    fn execute(&self, entry: &AgentRegistryEntry, task: &AgentTask) -> Result<AgentOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((entry.name.clone(), task.clone()));
        if !self.succeed {
            return Err(packwright::error::PackwrightError::AgentError(
                "agent binary missing".to_string(),
            ));
        }
        Ok(AgentOutcome {
            success: true,
            changes: if self.produce_changes {
                vec![PathBuf::from("src/index.ts")]
            } else {
                vec![]
            },
            output: "done".to_string(),
            duration: Duration::from_millis(5),
        })
    }
}

pub struct RecordingStatusSink {
    pub updates: Mutex<Vec<(String, PackageStatus, Option<String>)>>,
}

impl RecordingStatusSink {
    pub fn new() -> Self {
        Self { updates: Mutex::new(Vec::new()) }
    }

    pub fn statuses_for(&self, name: &str) -> Vec<PackageStatus> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, s, _)| *s)
            .collect()
    }
}

impl StatusSink for RecordingStatusSink {
    fn update_status(&self, name: &str, status: PackageStatus, error_details: Option<&str>) {
        self.updates.lock().unwrap().push((
            name.to_string(),
            status,
            error_details.map(|s| s.to_string()),
        ));
    }
}

fn agent_entry(name: &str, problem_types: &[ProblemType]) -> AgentRegistryEntry {
    AgentRegistryEntry {
        name: name.to_string(),
        path: PathBuf::from(format!("/opt/agents/{}", name)),
        capabilities: vec![],
        problem_types: problem_types.to_vec(),
        priority: 0,
        model: None,
    }
}

/// Registry with one handler per problem type the pipeline can raise.
pub fn full_agent_registry() -> AgentRegistry {
    AgentRegistry::from_entries(vec![
        agent_entry("scaffolder", &[ProblemType::PackageScaffolding]),
        agent_entry("build-medic", &[ProblemType::BuildFailure]),
        agent_entry("test-medic", &[ProblemType::TestFailure]),
        agent_entry("quality-medic", &[ProblemType::QualityFailure]),
    ])
}

/// Registry that only knows how to scaffold.
pub fn scaffold_only_registry() -> AgentRegistry {
    AgentRegistry::from_entries(vec![agent_entry(
        "scaffolder",
        &[ProblemType::PackageScaffolding],
    )])
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub toolchain: Arc<FakeToolchain>,
    pub registry: Arc<FakeRegistry>,
    pub vcs: Arc<FakeVcs>,
    pub agent_registry: Arc<AgentRegistry>,
    pub executor: Arc<FakeAgentExecutor>,
    pub status: Arc<RecordingStatusSink>,
    pub reporter: Arc<Reporter>,
    pub trace: TraceWriter,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            toolchain: Arc::new(FakeToolchain::new()),
            registry: Arc::new(FakeRegistry::new()),
            vcs: Arc::new(FakeVcs::new()),
            agent_registry: Arc::new(full_agent_registry()),
            executor: Arc::new(FakeAgentExecutor::new()),
            status: Arc::new(RecordingStatusSink::new()),
            reporter: Arc::new(Reporter::new(dir.path().join("reports"))),
            trace: TraceWriter::new(dir.path()),
            dir,
        }
    }

    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            run_id: "test-run".to_string(),
            max_coordinator_attempts: 3,
            max_quality_fix_attempts: 3,
            registry_token: "token".to_string(),
            git_user: "tester".to_string(),
            git_email: "tester@example.com".to_string(),
        }
    }

    pub fn pipeline(&self) -> BuildPipeline {
        self.pipeline_with_cancel(CancelToken::new())
    }

    pub fn pipeline_with_cancel(&self, cancel: CancelToken) -> BuildPipeline {
        BuildPipeline::new(PipelineContext {
            toolchain: self.toolchain.clone(),
            registry: self.registry.clone(),
            vcs: self.vcs.clone(),
            agent_registry: self.agent_registry.clone(),
            agent_executor: self.executor.clone(),
            status: self.status.clone(),
            reporter: self.reporter.clone(),
            trace: self.trace.clone(),
            settings: self.settings(),
            cancel,
        })
    }

    /// Input for a fresh package living under the fixture workspace.
    pub fn input(&self, name: &str, dir_name: &str) -> PackageBuildInput {
        PackageBuildInput {
            name: name.to_string(),
            path: self.dir.path().join(dir_name),
            plan_path: self.dir.path().join("plan.toml"),
            category: packwright::graph::PackageCategory::Core,
            deps: vec![],
            workspace_root: self.dir.path().to_path_buf(),
            expected_files: vec![],
            waited_for: vec![],
            plan_has_upgrade_indicator: false,
        }
    }
}
