//! Build orchestrator — ingests a package plan, classifies what actually
//! needs work, and drives per-package pipelines in dependency order under a
//! concurrency cap.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::agents::executor::{AgentExecutor, ProcessAgentExecutor};
use crate::agents::AgentRegistry;
use crate::config::GlobalConfig;
use crate::graph::{self, BuildStatus, PackageNode};
use crate::pipeline::{
    infer_failed_phase, BuildPipeline, CancelToken, PackageBuildInput, Phase, PipelineContext,
    PipelineOutcome, PipelineSettings,
};
use crate::plan::{self, AuditReport, BuildPlan, PackageSpec};
use crate::preflight::{self, PublishState};
use crate::registry::{HttpRegistry, RegistryLookup};
use crate::report::{
    self, BuildMetrics, BuildReport, PackageBuildReport, PackageFailure, QualitySummary, Reporter,
    ReportStatus,
};
use crate::status::{HttpStatusSink, NullStatusSink, PackageStatus, StatusSink};
use crate::toolchain::{CommandToolchain, Toolchain};
use crate::trace::TraceWriter;
use crate::vcs::{GitCli, SourceControl};

/// The three ways a build can be described. Supplying none of them is a
/// contract violation the CLI rejects before this type is constructed.
#[derive(Debug, Clone)]
pub enum BuilderInput {
    /// Path to a plan document.
    Plan(PathBuf),
    /// Path to an audit-report document (root package + direct deps).
    Audit(PathBuf),
    /// Explicit package list.
    Packages(Vec<PackageSpec>),
}

/// Collaborator set shared by every pipeline this orchestrator admits.
pub struct OrchestratorContext {
    pub toolchain: Arc<dyn Toolchain>,
    pub registry: Arc<dyn RegistryLookup>,
    pub vcs: Arc<dyn SourceControl>,
    pub agent_registry: Arc<AgentRegistry>,
    pub agent_executor: Arc<dyn AgentExecutor>,
    pub status: Arc<dyn StatusSink>,
    pub reporter: Arc<Reporter>,
    pub trace: TraceWriter,
}

pub struct Orchestrator {
    config: GlobalConfig,
    ctx: OrchestratorContext,
    cancel: CancelToken,
}

/// Resolved input: the package set plus the plan facts classification needs.
struct Workload {
    specs: Vec<PackageSpec>,
    plan_path: PathBuf,
    has_upgrade_indicator: bool,
}

impl Orchestrator {
    pub fn new(config: GlobalConfig, ctx: OrchestratorContext) -> Self {
        Self { config, ctx, cancel: CancelToken::new() }
    }

    /// Wire up the real collaborators from configuration.
    pub fn from_config(config: GlobalConfig) -> Result<Self> {
        let vcs: Arc<dyn SourceControl> = Arc::new(GitCli);

        let agent_registry = if config.general.agent_registry.exists() {
            AgentRegistry::load(&config.general.agent_registry)
                .context("failed to load agent registry")?
        } else {
            warn!(
                "agent registry {} not found; running without repair agents",
                config.general.agent_registry.display()
            );
            AgentRegistry::from_entries(Vec::new())
        };

        let status: Arc<dyn StatusSink> = match &config.status.endpoint {
            Some(endpoint) => Arc::new(HttpStatusSink::new(
                endpoint.clone(),
                config.registry.timeout(),
            )),
            None => Arc::new(NullStatusSink),
        };

        let ctx = OrchestratorContext {
            toolchain: Arc::new(CommandToolchain::new(
                config.build.toolchain_commands(),
                config.build.tool_timeout(),
            )),
            registry: Arc::new(
                HttpRegistry::new(config.registry.url.clone(), config.registry.timeout())?
                    .with_attempts(config.network.retry_count),
            ),
            agent_executor: Arc::new(ProcessAgentExecutor::new(
                vcs.clone(),
                config.build.agent_timeout(),
            )),
            vcs,
            agent_registry: Arc::new(agent_registry),
            status,
            reporter: Arc::new(Reporter::new(config.general.reports_dir.clone())),
            trace: TraceWriter::new(&config.general.workspace_root),
        };
        Ok(Self::new(config, ctx))
    }

    /// Token for cooperative cancellation from the outside. Pipelines
    /// finish their current activity, then report `failed (cancelled)`.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the full PLAN → BUILD → VERIFY → COMPLETE sequence and return
    /// the aggregate report.
    pub fn run(&self, input: BuilderInput) -> Result<BuildReport> {
        let started = Instant::now();
        let build_id = format!("build-{}", chrono::Utc::now().format("%Y%m%d%H%M%S"));
        info!("starting {}", build_id);

        let workload = self.resolve_input(input)?;
        let mut nodes = graph::build_graph(
            workload
                .specs
                .iter()
                .map(|s| PackageNode::new(s.name.clone(), s.category(), &s.deps))
                .collect(),
        )?;

        if nodes.is_empty() {
            info!("nothing to build");
            let aggregate = report::aggregate(build_id, started.elapsed().as_secs_f64(), vec![], vec![]);
            self.ctx.reporter.write_aggregate(&aggregate)?;
            return Ok(aggregate);
        }

        let specs_by_name: HashMap<String, PackageSpec> = workload
            .specs
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();

        // PLAN: classify every package; already-published ones need no
        // pipeline but still count as completed (and as successes).
        let mut completed: HashSet<String> = HashSet::new();
        let mut reports: Vec<PackageBuildReport> = Vec::new();
        let mut failures: Vec<PackageFailure> = Vec::new();
        let mut skipped: HashSet<String> = HashSet::new();

        for node in nodes.iter_mut() {
            let spec = &specs_by_name[&node.name];
            let package_dir = package_dir(&self.config.general.workspace_root, spec);
            match preflight::classify(
                spec,
                &package_dir,
                workload.has_upgrade_indicator,
                self.ctx.registry.as_ref(),
            ) {
                Ok(PublishState::PublishedCurrent { version }) => {
                    info!("{}: published at {} and plan asks nothing new; skipping", node.name, version);
                    node.build_status = BuildStatus::Completed;
                    completed.insert(node.name.clone());
                    skipped.insert(node.name.clone());
                    self.ctx.status.update_status(&node.name, PackageStatus::Published, None);
                    let synthetic = synthetic_success(&node.name, &spec.deps);
                    if let Err(e) = self.ctx.reporter.write_package_report(&synthetic) {
                        warn!("failed to write report for {}: {}", node.name, e);
                    }
                    reports.push(synthetic);
                }
                Ok(PublishState::NeedsUpgrade { version }) => {
                    warn!("{}: published at {} but the plan calls for an upgrade", node.name, version);
                }
                Ok(state) => {
                    info!("{}: preflight {}", node.name, state.label());
                }
                Err(e) => {
                    warn!("{}: preflight classification failed: {}", node.name, e);
                    node.build_status = BuildStatus::Failed;
                    failures.push(PackageFailure {
                        package_name: node.name.clone(),
                        failed_phase: Phase::Preflight,
                        error: e.to_string(),
                        fix_attempts: 0,
                    });
                }
            }
        }

        // BUILD: admit pipelines as their dependencies complete.
        self.build_phase(
            &build_id,
            &mut nodes,
            &specs_by_name,
            &workload,
            &skipped,
            &mut completed,
            &mut reports,
            &mut failures,
        );

        // VERIFY: reserved for integration checks.

        // COMPLETE
        let aggregate =
            report::aggregate(build_id, started.elapsed().as_secs_f64(), reports, failures);
        self.ctx.reporter.write_aggregate(&aggregate)?;
        info!(
            "finished: {}/{} packages published, {} failed, {:.1}s",
            aggregate.successful, aggregate.total_packages, aggregate.failed, aggregate.total_duration
        );
        Ok(aggregate)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_phase(
        &self,
        build_id: &str,
        nodes: &mut [PackageNode],
        specs_by_name: &HashMap<String, PackageSpec>,
        workload: &Workload,
        skipped: &HashSet<String>,
        completed: &mut HashSet<String>,
        reports: &mut Vec<PackageBuildReport>,
        failures: &mut Vec<PackageFailure>,
    ) {
        let (tx, rx) = mpsc::channel::<PipelineOutcome>();
        let mut in_progress: HashSet<String> = HashSet::new();
        let index: HashMap<String, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        let in_set: HashSet<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let pipeline = Arc::new(BuildPipeline::new(PipelineContext {
            toolchain: self.ctx.toolchain.clone(),
            registry: self.ctx.registry.clone(),
            vcs: self.ctx.vcs.clone(),
            agent_registry: self.ctx.agent_registry.clone(),
            agent_executor: self.ctx.agent_executor.clone(),
            status: self.ctx.status.clone(),
            reporter: self.ctx.reporter.clone(),
            trace: self.ctx.trace.clone(),
            settings: PipelineSettings {
                run_id: build_id.to_string(),
                max_coordinator_attempts: self.config.build.max_coordinator_attempts,
                max_quality_fix_attempts: self.config.build.max_quality_fix_attempts,
                registry_token: self.config.registry.token.clone(),
                git_user: self.config.general.git_user.clone(),
                git_email: self.config.general.git_email.clone(),
            },
            cancel: self.cancel.clone(),
        }));

        loop {
            // Readiness: pending, with every in-set dependency completed.
            // Only the orchestrator task reads or writes this state.
            let ready: Vec<String> = nodes
                .iter()
                .filter(|n| n.build_status == BuildStatus::Pending)
                .filter(|n| {
                    n.dependencies
                        .iter()
                        .filter(|d| in_set.contains(*d))
                        .all(|d| completed.contains(d))
                })
                .map(|n| n.name.clone())
                .collect();

            for name in ready {
                if in_progress.len() >= self.config.build.max_concurrent_builds {
                    break;
                }
                nodes[index[&name]].build_status = BuildStatus::Building;
                in_progress.insert(name.clone());

                let spec = &specs_by_name[&name];
                let input = PackageBuildInput {
                    name: name.clone(),
                    path: package_dir(&self.config.general.workspace_root, spec),
                    plan_path: workload.plan_path.clone(),
                    category: spec.category(),
                    deps: spec.deps.clone(),
                    workspace_root: self.config.general.workspace_root.clone(),
                    expected_files: spec.files.clone(),
                    waited_for: spec
                        .deps
                        .iter()
                        .filter(|d| in_set.contains(*d) && !skipped.contains(*d))
                        .cloned()
                        .collect(),
                    plan_has_upgrade_indicator: workload.has_upgrade_indicator,
                };

                let tx = tx.clone();
                let pipeline = pipeline.clone();
                info!("admitting {} ({} building)", name, in_progress.len());
                std::thread::spawn(move || {
                    let outcome = pipeline.run(&input);
                    // The orchestrator may already be gone on cancellation.
                    let _ = tx.send(outcome);
                });
            }

            if in_progress.is_empty() {
                let stuck: Vec<String> = nodes
                    .iter()
                    .filter(|n| n.build_status == BuildStatus::Pending)
                    .map(|n| n.name.clone())
                    .collect();
                if stuck.is_empty() {
                    break;
                }
                // Nothing running and nothing ready: the remaining packages
                // are waiting on dependencies that will never complete.
                for name in stuck {
                    warn!("{}: dependency not satisfied; not building", name);
                    nodes[index[&name]].build_status = BuildStatus::Failed;
                    self.ctx.status.update_status(
                        &name,
                        PackageStatus::Failed,
                        Some("dependency not satisfied"),
                    );
                    failures.push(PackageFailure {
                        package_name: name,
                        failed_phase: Phase::Preflight,
                        error: "dependency not satisfied".to_string(),
                        fix_attempts: 0,
                    });
                }
                break;
            }

            let outcome = match rx.recv() {
                Ok(outcome) => outcome,
                Err(_) => break,
            };
            in_progress.remove(&outcome.package_name);
            if outcome.succeeded() {
                nodes[index[&outcome.package_name]].build_status = BuildStatus::Completed;
                completed.insert(outcome.package_name.clone());
            } else {
                nodes[index[&outcome.package_name]].build_status = BuildStatus::Failed;
                let error = outcome
                    .report
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string());
                failures.push(PackageFailure {
                    package_name: outcome.package_name.clone(),
                    failed_phase: outcome.failed_phase.unwrap_or_else(|| infer_failed_phase(&error)),
                    error,
                    fix_attempts: outcome.report.fix_attempts.len() as u32,
                });
            }
            reports.push(outcome.report);
        }
    }

    fn resolve_input(&self, input: BuilderInput) -> Result<Workload> {
        match input {
            BuilderInput::Plan(path) => {
                let plan = BuildPlan::from_file(&path)
                    .with_context(|| format!("failed to load plan {}", path.display()))?;
                Ok(Workload {
                    has_upgrade_indicator: plan.has_upgrade_indicator(),
                    specs: plan.packages,
                    plan_path: path,
                })
            }
            BuilderInput::Audit(path) => {
                let report = AuditReport::from_file(&path)
                    .with_context(|| format!("failed to load audit report {}", path.display()))?;
                let raw = std::fs::read_to_string(&path).unwrap_or_default();
                Ok(Workload {
                    has_upgrade_indicator: plan::has_upgrade_indicator(&raw),
                    specs: report.into_specs(),
                    plan_path: path,
                })
            }
            BuilderInput::Packages(specs) => Ok(Workload {
                specs,
                plan_path: self.config.general.workspace_root.clone(),
                has_upgrade_indicator: false,
            }),
        }
    }
}

fn package_dir(workspace_root: &Path, spec: &PackageSpec) -> PathBuf {
    if spec.path.is_absolute() {
        spec.path.clone()
    } else {
        workspace_root.join(&spec.path)
    }
}

/// Report emitted for a package that needed no work, shaped like any other
/// success so aggregates stay uniform.
fn synthetic_success(name: &str, deps: &[String]) -> PackageBuildReport {
    let now = chrono::Utc::now();
    PackageBuildReport {
        package_name: name.to_string(),
        start_time: now,
        end_time: now,
        duration: 0.0,
        build_metrics: BuildMetrics::default(),
        quality: QualitySummary::skipped(),
        fix_attempts: Vec::new(),
        status: ReportStatus::Success,
        error: None,
        dependencies: deps.to_vec(),
        waited_for: Vec::new(),
    }
}
