//! Per-package build pipeline: the phase state machine running
//! preflight → scaffold → build → test → quality → publish → push, with
//! commit checkpoints and coordinator-assisted retry loops.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::agents::executor::{AgentExecutor, AgentTask};
use crate::agents::AgentRegistry;
use crate::coordinator::{
    Coordinator, CoordinatorAction, ErrorDetail, Problem, ProblemContext, ProblemType,
};
use crate::graph::PackageCategory;
use crate::preflight::{self, PackageAudit, PublishState};
use crate::registry::RegistryLookup;
use crate::report::{
    BuildMetrics, FixAttempt, PackageBuildReport, QualitySummary, Reporter, ReportStatus,
};
use crate::status::{PackageStatus, StatusSink};
use crate::toolchain::{QualityFailure, Toolchain};
use crate::trace::{AuditTraceEntry, ToolCallEntry, TraceWriter, ValidationStatus};
use crate::vcs::{self, CommitType, SourceControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Preflight,
    Scaffold,
    Build,
    Test,
    Quality,
    Publish,
    Push,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Preflight => "preflight",
            Phase::Scaffold => "scaffold",
            Phase::Build => "build",
            Phase::Test => "test",
            Phase::Quality => "quality",
            Phase::Publish => "publish",
            Phase::Push => "push",
        };
        write!(f, "{}", s)
    }
}

/// Legacy mapping from error text to a phase, for errors that did not
/// travel through the pipeline and so carry no phase of their own.
/// Anything unrecognized is attributed to the build.
pub fn infer_failed_phase(message: &str) -> Phase {
    if message.contains("Build failed") {
        Phase::Build
    } else if message.contains("Tests failed") {
        Phase::Test
    } else if message.contains("Quality checks failed") {
        Phase::Quality
    } else if message.contains("Publish failed") {
        Phase::Publish
    } else {
        Phase::Build
    }
}

/// Errors no repair agent can fix: a full disk or an OOM-killed subprocess.
pub fn is_resource_exhausted(text: &str) -> bool {
    ["ENOSPC", "EDQUOT", "out of memory", "Cannot allocate memory", "OOM"]
        .iter()
        .any(|marker| text.contains(marker))
}

/// Cooperative cancellation flag shared between the orchestrator and its
/// pipelines. Checked at phase boundaries; the current activity always
/// finishes.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a pipeline run needs to know about its package.
#[derive(Debug, Clone)]
pub struct PackageBuildInput {
    pub name: String,
    pub path: PathBuf,
    pub plan_path: PathBuf,
    pub category: PackageCategory,
    pub deps: Vec<String>,
    pub workspace_root: PathBuf,
    /// Files the finished package is expected to contain.
    pub expected_files: Vec<String>,
    /// Dependencies this package actually waited on in this run.
    pub waited_for: Vec<String>,
    pub plan_has_upgrade_indicator: bool,
}

impl PackageBuildInput {
    fn agent_task(&self, instructions: String) -> AgentTask {
        AgentTask {
            package_name: self.name.clone(),
            package_path: self.path.clone(),
            plan_path: self.plan_path.clone(),
            workspace_root: self.workspace_root.clone(),
            category: self.category.to_string(),
            instructions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub run_id: String,
    pub max_coordinator_attempts: u32,
    pub max_quality_fix_attempts: u32,
    pub registry_token: String,
    pub git_user: String,
    pub git_email: String,
}

/// Completion value returned to the orchestrator. The orchestrator owns all
/// shared state; a pipeline communicates only through this.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub package_name: String,
    pub report: PackageBuildReport,
    pub failed_phase: Option<Phase>,
}

impl PipelineOutcome {
    pub fn succeeded(&self) -> bool {
        self.report.status == ReportStatus::Success
    }
}

/// Collaborators handed to a pipeline. Mirrors the capability table: every
/// external effect goes through one of these.
pub struct PipelineContext {
    pub toolchain: Arc<dyn Toolchain>,
    pub registry: Arc<dyn RegistryLookup>,
    pub vcs: Arc<dyn SourceControl>,
    pub agent_registry: Arc<AgentRegistry>,
    pub agent_executor: Arc<dyn AgentExecutor>,
    pub status: Arc<dyn StatusSink>,
    pub reporter: Arc<Reporter>,
    pub trace: TraceWriter,
    pub settings: PipelineSettings,
    pub cancel: CancelToken,
}

pub struct BuildPipeline {
    ctx: PipelineContext,
    coordinator: Coordinator,
}

/// Mutable bookkeeping for one run: accumulated timings and fix attempts.
struct RunState {
    started: Instant,
    start_time: chrono::DateTime<chrono::Utc>,
    metrics: BuildMetrics,
    fix_attempts: Vec<FixAttempt>,
    coverage: u32,
    last_quality_failures: Vec<QualityFailure>,
    quality_passed: bool,
}

impl RunState {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            start_time: chrono::Utc::now(),
            metrics: BuildMetrics::default(),
            fix_attempts: Vec::new(),
            coverage: 0,
            last_quality_failures: Vec::new(),
            quality_passed: false,
        }
    }

    fn quality_summary(&self) -> QualitySummary {
        let lint_count = self
            .last_quality_failures
            .iter()
            .filter(|f| f.kind == "lint")
            .count() as u32;
        let type_errors = self
            .last_quality_failures
            .iter()
            .filter(|f| f.kind == "type")
            .count() as u32;
        QualitySummary {
            lint_score: 100u32.saturating_sub(lint_count * 5),
            test_coverage: self.coverage,
            type_errors,
            passed: self.quality_passed,
        }
    }
}

impl BuildPipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        let coordinator = Coordinator::new(
            (*ctx.agent_registry).clone(),
            ctx.agent_executor.clone(),
            ctx.settings.max_coordinator_attempts,
        );
        Self { ctx, coordinator }
    }

    pub fn run(&self, input: &PackageBuildInput) -> PipelineOutcome {
        let mut state = RunState::new();

        let verdict = match preflight::classify(
            &spec_view(input),
            &input.path,
            input.plan_has_upgrade_indicator,
            self.ctx.registry.as_ref(),
        ) {
            Ok(verdict) => verdict,
            Err(e) => {
                return self.fail(input, &state, Phase::Preflight, format!("preflight failed: {}", e));
            }
        };
        info!("{}: preflight verdict {}", input.name, verdict.label());
        self.audit_step(input, "preflight", ValidationStatus::Pass, None);

        if let PublishState::PublishedCurrent { version } = &verdict {
            return self.skip_published(input, state, version);
        }

        self.ctx
            .status
            .update_status(&input.name, PackageStatus::Building, None);

        let audit = match &verdict {
            PublishState::Partial | PublishState::NeedsUpgrade { .. } => {
                Some(preflight::audit_package(&input.path, &input.expected_files))
            }
            _ => None,
        };

        self.prepare_worktree(input);

        // SCAFFOLD
        if let Some(failure) = self.scaffold(input, &mut state, audit.as_ref()) {
            return failure;
        }
        vcs::checkpoint(
            self.ctx.vcs.as_ref(),
            &input.path,
            &vcs::commit_message(CommitType::Feat, &input.name, "scaffold package"),
        );

        // BUILD
        if let Some(failure) = self.build_loop(input, &mut state) {
            return failure;
        }

        // TEST
        if let Some(failure) = self.test_loop(input, &mut state) {
            return failure;
        }
        vcs::checkpoint(
            self.ctx.vcs.as_ref(),
            &input.path,
            &vcs::commit_message(CommitType::Test, &input.name, "tests passing"),
        );

        // QUALITY
        if let Some(failure) = self.quality_loop(input, &mut state) {
            return failure;
        }

        // PUBLISH
        if let Some(failure) = self.publish(input, &mut state) {
            return failure;
        }

        // PUSH is best-effort; the package is published either way.
        if let Err(e) = self.ctx.vcs.push(&input.path, "origin", "HEAD", false) {
            warn!("{}: push failed (non-fatal): {}", input.name, e);
        }

        self.ctx
            .status
            .update_status(&input.name, PackageStatus::Published, None);
        self.finish_success(input, state)
    }

    fn prepare_worktree(&self, input: &PackageBuildInput) {
        if let Err(e) = self.ctx.vcs.configure_user(
            &input.path,
            &self.ctx.settings.git_user,
            &self.ctx.settings.git_email,
        ) {
            warn!("{}: could not configure git user: {}", input.name, e);
        }
        let branch = format!("build/{}", input.name.replace(['@', '/'], "-"));
        if let Err(e) = self.ctx.vcs.create_branch(&input.path, &branch) {
            warn!("{}: could not create branch {}: {}", input.name, branch, e);
        }
    }

    fn scaffold(
        &self,
        input: &PackageBuildInput,
        state: &mut RunState,
        audit: Option<&PackageAudit>,
    ) -> Option<PipelineOutcome> {
        if let Some(outcome) = self.check_cancelled(input, state, Phase::Scaffold) {
            return Some(outcome);
        }

        let mut instructions = format!(
            "Scaffold the package {} ({}) at {} so it builds, tests and publishes cleanly.",
            input.name,
            input.category,
            input.path.display()
        );
        if let Some(audit) = audit {
            instructions.push_str(&format!(
                "\nThe package is {}% complete. File status:\n{}Next steps:\n{}",
                audit.completion_percentage,
                audit.render_checklist(),
                audit.next_steps.join("\n")
            ));
        }

        let problem = Problem {
            problem_type: ProblemType::PackageScaffolding,
            error: ErrorDetail {
                message: "package requires scaffolding".to_string(),
                ..Default::default()
            },
            context: ProblemContext {
                package_name: input.name.clone(),
                package_path: input.path.clone(),
                plan_path: input.plan_path.clone(),
                phase: Phase::Scaffold,
                attempt_number: 1,
            },
        };

        let task = input.agent_task(instructions);
        let action = self.coordinator.decide(&problem, &task);
        self.log_action(input, Phase::Scaffold, &action);

        if action.is_forward_progress() {
            // RESOLVED and RETRY both mean the scaffold is in place.
            None
        } else {
            Some(self.fail(
                input,
                state,
                Phase::Scaffold,
                format!("Scaffolding failed: {}", action.reasoning),
            ))
        }
    }

    fn build_loop(&self, input: &PackageBuildInput, state: &mut RunState) -> Option<PipelineOutcome> {
        self.phase_loop(input, state, Phase::Build, ProblemType::BuildFailure)
    }

    fn test_loop(&self, input: &PackageBuildInput, state: &mut RunState) -> Option<PipelineOutcome> {
        self.phase_loop(input, state, Phase::Test, ProblemType::TestFailure)
    }

    /// Shared coordinator-assisted retry loop for the build and test phases.
    fn phase_loop(
        &self,
        input: &PackageBuildInput,
        state: &mut RunState,
        phase: Phase,
        problem_type: ProblemType,
    ) -> Option<PipelineOutcome> {
        let max_attempts = self.ctx.settings.max_coordinator_attempts;
        let mut attempt = 0u32;

        loop {
            if let Some(outcome) = self.check_cancelled(input, state, phase) {
                return Some(outcome);
            }

            let (ok, stdout, stderr, duration) = match phase {
                Phase::Build => match self.ctx.toolchain.run_build(&input.path) {
                    Ok(r) => (r.ok, r.stdout, r.stderr, r.duration),
                    Err(e) => {
                        return Some(self.fail(input, state, phase, format!("{}", e)));
                    }
                },
                Phase::Test => match self.ctx.toolchain.run_tests(&input.path) {
                    Ok(r) => {
                        state.coverage = r.coverage;
                        (r.ok, r.stdout, r.stderr, r.duration)
                    }
                    Err(e) => {
                        return Some(self.fail(input, state, phase, format!("{}", e)));
                    }
                },
                _ => unreachable!("phase_loop only drives build and test"),
            };

            let secs = duration.as_secs_f64();
            match phase {
                Phase::Build => state.metrics.build_time += secs,
                Phase::Test => state.metrics.test_time += secs,
                _ => {}
            }
            self.tool_step(input, phase, secs, ok);

            if ok {
                self.audit_step(input, &phase.to_string(), ValidationStatus::Pass, None);
                return None;
            }

            let headline = match phase {
                Phase::Build => "Build failed",
                Phase::Test => "Tests failed",
                _ => unreachable!(),
            };
            self.audit_step(
                input,
                &phase.to_string(),
                ValidationStatus::Fail,
                Some(problem_type.to_string()),
            );

            if is_resource_exhausted(&stderr) || is_resource_exhausted(&stdout) {
                return Some(self.fail(
                    input,
                    state,
                    phase,
                    format!(
                        "{}: resource exhausted: {}",
                        headline,
                        crate::toolchain::summarize_output(&stdout, &stderr, 10)
                    ),
                ));
            }

            attempt += 1;
            if attempt > max_attempts {
                return Some(self.fail(
                    input,
                    state,
                    phase,
                    format!("{}: exhausted {} coordinator attempts", headline, max_attempts),
                ));
            }

            let problem = Problem {
                problem_type,
                error: ErrorDetail {
                    message: headline.to_string(),
                    stderr: Some(stderr.clone()),
                    stdout: Some(stdout.clone()),
                    code: None,
                },
                context: ProblemContext {
                    package_name: input.name.clone(),
                    package_path: input.path.clone(),
                    plan_path: input.plan_path.clone(),
                    phase,
                    attempt_number: attempt,
                },
            };
            let task = input.agent_task(format!(
                "{} for {} (attempt {}). Fix the underlying problem.\n\n{}",
                headline,
                input.name,
                attempt,
                crate::toolchain::summarize_output(&stdout, &stderr, 40)
            ));

            let fix_started = Instant::now();
            let action = self.coordinator.decide(&problem, &task);
            state.fix_attempts.push(FixAttempt {
                count: attempt,
                types: vec![problem_type.to_string()],
                agent_prompt_used: task.instructions.clone(),
                fix_duration: fix_started.elapsed().as_secs_f64(),
            });
            self.log_action(input, phase, &action);

            if !action.is_forward_progress() {
                return Some(self.fail(
                    input,
                    state,
                    phase,
                    format!("{}: {}", headline, action.reasoning),
                ));
            }
            // RETRY: loop around and re-run the phase.
        }
    }

    fn quality_loop(&self, input: &PackageBuildInput, state: &mut RunState) -> Option<PipelineOutcome> {
        let max_fixes = self.ctx.settings.max_quality_fix_attempts;
        let mut fix_count = 0u32;

        loop {
            if let Some(outcome) = self.check_cancelled(input, state, Phase::Quality) {
                return Some(outcome);
            }

            let report = match self.ctx.toolchain.run_quality(&input.path) {
                Ok(r) => r,
                Err(e) => {
                    return Some(self.fail(input, state, Phase::Quality, format!("{}", e)));
                }
            };
            state.metrics.quality_check_time += report.duration.as_secs_f64();
            self.tool_step(input, Phase::Quality, report.duration.as_secs_f64(), report.passed);
            state.last_quality_failures = report.failures.clone();

            if report.passed {
                state.quality_passed = true;
                self.audit_step(input, "quality", ValidationStatus::Pass, None);
                return None;
            }
            self.audit_step(
                input,
                "quality",
                ValidationStatus::Fail,
                Some(ProblemType::QualityFailure.to_string()),
            );

            if fix_count >= max_fixes {
                return Some(self.fail(
                    input,
                    state,
                    Phase::Quality,
                    format!("Quality checks failed after {} fix attempts", max_fixes),
                ));
            }
            fix_count += 1;

            // Quality repairs go straight to the matching agent; there is
            // no retry/escalate decision to make, just fix and re-check.
            let entry = match self.ctx.agent_registry.lookup_for(ProblemType::QualityFailure) {
                Some(entry) => entry,
                None => {
                    return Some(self.fail(
                        input,
                        state,
                        Phase::Quality,
                        "Quality checks failed: no handler for QUALITY_FAILURE".to_string(),
                    ));
                }
            };

            let failures_text = report
                .failures
                .iter()
                .map(|f| match (&f.file, f.line) {
                    (Some(file), Some(line)) => format!("{} {}:{} {}", f.kind, file, line, f.message),
                    _ => format!("{} {}", f.kind, f.message),
                })
                .collect::<Vec<_>>()
                .join("\n");
            let task = input.agent_task(format!(
                "Quality checks failed for {} (fix attempt {}). Resolve each finding:\n{}",
                input.name, fix_count, failures_text
            ));

            let fix_started = Instant::now();
            match self.ctx.agent_executor.execute(entry, &task) {
                Ok(outcome) => {
                    state.fix_attempts.push(FixAttempt {
                        count: fix_count,
                        types: vec![ProblemType::QualityFailure.to_string()],
                        agent_prompt_used: task.instructions.clone(),
                        fix_duration: fix_started.elapsed().as_secs_f64(),
                    });
                    if !outcome.success {
                        warn!("{}: quality fix agent exited nonzero", input.name);
                    }
                }
                Err(e) => {
                    return Some(self.fail(
                        input,
                        state,
                        Phase::Quality,
                        format!("Quality checks failed: fix agent error: {}", e),
                    ));
                }
            }
        }
    }

    fn publish(&self, input: &PackageBuildInput, state: &mut RunState) -> Option<PipelineOutcome> {
        if let Some(outcome) = self.check_cancelled(input, state, Phase::Publish) {
            return Some(outcome);
        }

        let report = match self
            .ctx
            .toolchain
            .publish(&input.path, &self.ctx.settings.registry_token)
        {
            Ok(r) => r,
            Err(e) => {
                return Some(self.fail(input, state, Phase::Publish, format!("{}", e)));
            }
        };
        state.metrics.publish_time += report.duration.as_secs_f64();
        self.tool_step(input, Phase::Publish, report.duration.as_secs_f64(), report.ok);

        if report.ok {
            self.audit_step(input, "publish", ValidationStatus::Pass, None);
            None
        } else {
            self.audit_step(input, "publish", ValidationStatus::Fail, None);
            Some(self.fail(
                input,
                state,
                Phase::Publish,
                format!(
                    "Publish failed: {}",
                    crate::toolchain::summarize_output(&report.stdout, &report.stderr, 20)
                ),
            ))
        }
    }

    /// Synthetic success for a package the registry already carries: the
    /// report stays uniform with built packages and the sink still hears
    /// about it.
    fn skip_published(
        &self,
        input: &PackageBuildInput,
        state: RunState,
        version: &str,
    ) -> PipelineOutcome {
        info!("{}: already published at {}; skipping", input.name, version);
        self.ctx
            .status
            .update_status(&input.name, PackageStatus::Published, None);

        let end_time = chrono::Utc::now();
        let report = PackageBuildReport {
            package_name: input.name.clone(),
            start_time: state.start_time,
            end_time,
            duration: state.started.elapsed().as_secs_f64(),
            build_metrics: BuildMetrics::default(),
            quality: QualitySummary::skipped(),
            fix_attempts: Vec::new(),
            status: ReportStatus::Success,
            error: None,
            dependencies: input.deps.clone(),
            waited_for: input.waited_for.clone(),
        };
        self.persist(&report);
        PipelineOutcome {
            package_name: input.name.clone(),
            report,
            failed_phase: None,
        }
    }

    fn finish_success(&self, input: &PackageBuildInput, state: RunState) -> PipelineOutcome {
        let report = PackageBuildReport {
            package_name: input.name.clone(),
            start_time: state.start_time,
            end_time: chrono::Utc::now(),
            duration: state.started.elapsed().as_secs_f64(),
            build_metrics: state.metrics.clone(),
            quality: state.quality_summary(),
            fix_attempts: state.fix_attempts.clone(),
            status: ReportStatus::Success,
            error: None,
            dependencies: input.deps.clone(),
            waited_for: input.waited_for.clone(),
        };
        self.persist(&report);
        info!("{}: published in {:.1}s", input.name, report.duration);
        PipelineOutcome {
            package_name: input.name.clone(),
            report,
            failed_phase: None,
        }
    }

    fn check_cancelled(
        &self,
        input: &PackageBuildInput,
        state: &mut RunState,
        phase: Phase,
    ) -> Option<PipelineOutcome> {
        if self.ctx.cancel.is_cancelled() {
            Some(self.fail(input, state, phase, "failed (cancelled)".to_string()))
        } else {
            None
        }
    }

    fn fail(
        &self,
        input: &PackageBuildInput,
        state: &RunState,
        phase: Phase,
        message: String,
    ) -> PipelineOutcome {
        warn!("{}: failed in {}: {}", input.name, phase, message);
        self.ctx
            .status
            .update_status(&input.name, PackageStatus::Failed, Some(&message));

        let report = PackageBuildReport {
            package_name: input.name.clone(),
            start_time: state.start_time,
            end_time: chrono::Utc::now(),
            duration: state.started.elapsed().as_secs_f64(),
            build_metrics: state.metrics.clone(),
            quality: state.quality_summary(),
            fix_attempts: state.fix_attempts.clone(),
            status: ReportStatus::Failed,
            error: Some(message),
            dependencies: input.deps.clone(),
            waited_for: input.waited_for.clone(),
        };
        self.persist(&report);
        PipelineOutcome {
            package_name: input.name.clone(),
            report,
            failed_phase: Some(phase),
        }
    }

    fn persist(&self, report: &PackageBuildReport) {
        if let Err(e) = self.ctx.reporter.write_package_report(report) {
            warn!("failed to write report for {}: {}", report.package_name, e);
        }
    }

    fn log_action(&self, input: &PackageBuildInput, phase: Phase, action: &CoordinatorAction) {
        if let Some(agent) = &action.agent {
            self.ctx.trace.response(&crate::trace::ResponseEntry {
                workflow_run_id: self.ctx.settings.run_id.clone(),
                agent: agent.clone(),
                package: input.name.clone(),
                timestamp: chrono::Utc::now(),
                response: action.reasoning.clone(),
            });
        }
        info!(
            "{}: coordinator {:?} in {} ({})",
            input.name, action.decision, phase, action.reasoning
        );
    }

    fn tool_step(&self, input: &PackageBuildInput, phase: Phase, secs: f64, ok: bool) {
        self.ctx.trace.tool_call(&ToolCallEntry {
            workflow_run_id: self.ctx.settings.run_id.clone(),
            tool: phase.to_string(),
            package: input.name.clone(),
            timestamp: chrono::Utc::now(),
            duration_ms: (secs * 1000.0) as u64,
            exit_ok: ok,
        });
    }

    fn audit_step(
        &self,
        input: &PackageBuildInput,
        step: &str,
        status: ValidationStatus,
        error_type: Option<String>,
    ) {
        self.ctx.trace.audit(&AuditTraceEntry {
            workflow_run_id: self.ctx.settings.run_id.clone(),
            step_name: format!("{}:{}", input.name, step),
            timestamp: chrono::Utc::now(),
            cost_usd: 0.0,
            validation_status: status,
            validation_error_type: error_type,
            model: "external".to_string(),
        });
    }
}

fn spec_view(input: &PackageBuildInput) -> crate::plan::PackageSpec {
    crate::plan::PackageSpec {
        name: input.name.clone(),
        path: input.path.clone(),
        category: input.category.to_string(),
        deps: input.deps.clone(),
        files: input.expected_files.clone(),
    }
}
