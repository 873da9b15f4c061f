use packwright::pipeline::{CancelToken, Phase};
use packwright::report::ReportStatus;
use packwright::status::PackageStatus;

use crate::support::{Fixture, PackageScript};

#[test]
fn test_fresh_package_happy_path() {
    let fixture = Fixture::new();
    let pipeline = fixture.pipeline();

    let outcome = pipeline.run(&fixture.input("@x/core", "core"));

    assert!(outcome.succeeded());
    assert!(outcome.failed_phase.is_none());
    let report = &outcome.report;
    assert_eq!(report.status, ReportStatus::Success);
    assert!(report.quality.passed);
    assert_eq!(report.quality.test_coverage, 95);
    assert!(report.fix_attempts.is_empty());
    assert!(report.error.is_none());

    // each phase ran exactly once
    assert_eq!(fixture.toolchain.calls_for("core"), vec!["build", "test", "quality", "publish"]);

    // commit checkpoints after scaffold and after tests
    let messages = fixture.vcs.commit_messages();
    assert_eq!(
        messages,
        vec![
            "feat(@x/core): scaffold package".to_string(),
            "test(@x/core): tests passing".to_string(),
        ]
    );

    // scaffolder ran exactly once
    let agent_calls = fixture.executor.calls.lock().unwrap();
    assert_eq!(agent_calls.len(), 1);
    assert_eq!(agent_calls[0].0, "scaffolder");

    assert_eq!(
        fixture.status.statuses_for("@x/core"),
        vec![PackageStatus::Building, PackageStatus::Published]
    );

    // the push went out
    assert_eq!(fixture.vcs.pushes.lock().unwrap().len(), 1);
}

#[test]
fn test_published_current_skips_everything() {
    let fixture = Fixture::new();
    fixture.registry.publish("@x/core", "1.0.0");
    let pipeline = fixture.pipeline();

    let outcome = pipeline.run(&fixture.input("@x/core", "core"));

    assert!(outcome.succeeded());
    assert!(outcome.report.quality.passed);
    assert!(fixture.toolchain.calls.lock().unwrap().is_empty());
    assert!(fixture.executor.calls.lock().unwrap().is_empty());
    assert!(fixture.vcs.commit_messages().is_empty());
    assert_eq!(
        fixture.status.statuses_for("@x/core"),
        vec![PackageStatus::Published]
    );
}

#[test]
fn test_partial_package_surfaces_audit_context() {
    let fixture = Fixture::new();
    let package_dir = fixture.dir.path().join("core");
    std::fs::create_dir_all(package_dir.join("src")).unwrap();
    std::fs::write(package_dir.join("package.json"), "{}").unwrap();
    std::fs::write(package_dir.join("src/index.ts"), "export {};").unwrap();

    let mut input = fixture.input("@x/core", "core");
    input.expected_files = vec![
        "package.json".to_string(),
        "src/index.ts".to_string(),
        "src/types.ts".to_string(),
    ];

    let pipeline = fixture.pipeline();
    let outcome = pipeline.run(&input);
    assert!(outcome.succeeded());

    let instructions = fixture.executor.instructions();
    assert_eq!(instructions.len(), 1);
    let scaffold = &instructions[0];
    assert!(scaffold.contains("67% complete"));
    assert!(scaffold.contains("✅ package.json"));
    assert!(scaffold.contains("✅ src/index.ts"));
    assert!(scaffold.contains("❌ src/types.ts"));
    assert!(scaffold.contains("create src/types.ts"));
}

#[test]
fn test_build_fails_twice_then_succeeds() {
    let fixture = Fixture::new();
    fixture.toolchain.script(
        "core",
        PackageScript { build_failures_before_ok: 2, ..Default::default() },
    );
    let pipeline = fixture.pipeline();

    let outcome = pipeline.run(&fixture.input("@x/core", "core"));

    assert!(outcome.succeeded());
    let report = &outcome.report;
    assert_eq!(report.fix_attempts.len(), 2);
    for (i, attempt) in report.fix_attempts.iter().enumerate() {
        assert_eq!(attempt.count, i as u32 + 1);
        assert_eq!(attempt.types, vec!["BUILD_FAILURE".to_string()]);
        assert!(attempt.agent_prompt_used.contains("TS2322"));
    }
    // three build invocations: fail, fail, pass
    assert_eq!(
        fixture.toolchain.calls_for("core"),
        vec!["build", "build", "build", "test", "quality", "publish"]
    );
}

#[test]
fn test_test_failures_route_through_coordinator() {
    let fixture = Fixture::new();
    fixture.toolchain.script(
        "core",
        PackageScript { test_failures_before_ok: 1, ..Default::default() },
    );
    let pipeline = fixture.pipeline();

    let outcome = pipeline.run(&fixture.input("@x/core", "core"));

    assert!(outcome.succeeded());
    assert_eq!(outcome.report.fix_attempts.len(), 1);
    assert_eq!(
        outcome.report.fix_attempts[0].types,
        vec!["TEST_FAILURE".to_string()]
    );
    assert_eq!(
        fixture.toolchain.calls_for("core"),
        vec!["build", "test", "test", "quality", "publish"]
    );
    // the tests-passing checkpoint lands only after the retry succeeded
    assert_eq!(
        fixture.vcs.commit_messages().last().unwrap(),
        "test(@x/core): tests passing"
    );
}

#[test]
fn test_build_retry_budget_is_bounded() {
    let fixture = Fixture::new();
    fixture.toolchain.script(
        "core",
        PackageScript { build_failures_before_ok: usize::MAX, ..Default::default() },
    );
    let pipeline = fixture.pipeline();

    let outcome = pipeline.run(&fixture.input("@x/core", "core"));

    assert!(!outcome.succeeded());
    assert_eq!(outcome.failed_phase, Some(Phase::Build));
    // coordinator consulted at most max_coordinator_attempts times
    assert_eq!(outcome.report.fix_attempts.len(), 3);
    let builds = fixture
        .toolchain
        .calls_for("core")
        .iter()
        .filter(|p| *p == "build")
        .count();
    assert_eq!(builds, 4);
    assert!(outcome.report.error.as_deref().unwrap().contains("Build failed"));
}

#[test]
fn test_agent_without_modifications_fails_fast() {
    let fixture = Fixture::new();
    let fixture = Fixture {
        executor: std::sync::Arc::new(crate::support::FakeAgentExecutor::inert()),
        ..fixture
    };
    fixture.toolchain.script(
        "core",
        PackageScript { build_failures_before_ok: usize::MAX, ..Default::default() },
    );
    let pipeline = fixture.pipeline();

    let outcome = pipeline.run(&fixture.input("@x/core", "core"));

    assert!(!outcome.succeeded());
    assert_eq!(outcome.failed_phase, Some(Phase::Build));
    // FAIL on the first decision: one fix attempt, two builds never happen
    assert_eq!(outcome.report.fix_attempts.len(), 1);
    let builds = fixture
        .toolchain
        .calls_for("core")
        .iter()
        .filter(|p| *p == "build")
        .count();
    assert_eq!(builds, 1);
}

#[test]
fn test_quality_exhaustion_after_three_fix_attempts() {
    let fixture = Fixture::new();
    fixture.toolchain.script(
        "core",
        PackageScript { quality_failures_before_ok: usize::MAX, ..Default::default() },
    );
    let pipeline = fixture.pipeline();

    let outcome = pipeline.run(&fixture.input("@x/core", "core"));

    assert!(!outcome.succeeded());
    assert_eq!(outcome.failed_phase, Some(Phase::Quality));
    assert_eq!(outcome.report.fix_attempts.len(), 3);
    assert!(outcome
        .report
        .fix_attempts
        .iter()
        .all(|a| a.types == vec!["QUALITY_FAILURE".to_string()]));
    // four quality runs: initial + one after each of the three fixes
    let quality_runs = fixture
        .toolchain
        .calls_for("core")
        .iter()
        .filter(|p| *p == "quality")
        .count();
    assert_eq!(quality_runs, 4);
    // publish never attempted
    assert!(!fixture.toolchain.calls_for("core").contains(&"publish".to_string()));
}

#[test]
fn test_publish_failure_is_terminal_without_retry() {
    let fixture = Fixture::new();
    fixture.toolchain.script(
        "core",
        PackageScript { publish_fails: true, ..Default::default() },
    );
    let pipeline = fixture.pipeline();

    let outcome = pipeline.run(&fixture.input("@x/core", "core"));

    assert!(!outcome.succeeded());
    assert_eq!(outcome.failed_phase, Some(Phase::Publish));
    let publishes = fixture
        .toolchain
        .calls_for("core")
        .iter()
        .filter(|p| *p == "publish")
        .count();
    assert_eq!(publishes, 1);
    assert!(fixture.vcs.pushes.lock().unwrap().is_empty());
}

#[test]
fn test_push_failure_is_not_fatal() {
    let fixture = Fixture::new();
    let fixture = Fixture {
        vcs: std::sync::Arc::new(crate::support::FakeVcs::failing_push()),
        ..fixture
    };
    let pipeline = fixture.pipeline();

    let outcome = pipeline.run(&fixture.input("@x/core", "core"));

    assert!(outcome.succeeded());
    assert_eq!(
        fixture.status.statuses_for("@x/core"),
        vec![PackageStatus::Building, PackageStatus::Published]
    );
}

#[test]
fn test_cancellation_stops_before_next_phase() {
    let fixture = Fixture::new();
    let cancel = CancelToken::new();
    cancel.cancel();
    let pipeline = fixture.pipeline_with_cancel(cancel);

    let outcome = pipeline.run(&fixture.input("@x/core", "core"));

    assert!(!outcome.succeeded());
    assert!(outcome
        .report
        .error
        .as_deref()
        .unwrap()
        .contains("cancelled"));
    assert!(fixture.toolchain.calls.lock().unwrap().is_empty());
}
