use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use packwright::config::GlobalConfig;
use packwright::orchestrator::{BuilderInput, Orchestrator, OrchestratorContext};
use packwright::pipeline::Phase;
use packwright::plan::PackageSpec;
use packwright::report::ReportStatus;

use crate::support::{scaffold_only_registry, FakeToolchain, Fixture, PackageScript};

fn orchestrator(fixture: &Fixture, max_concurrent: usize) -> Orchestrator {
    let mut config = GlobalConfig::default();
    config.general.workspace_root = fixture.dir.path().to_path_buf();
    config.general.reports_dir = fixture.dir.path().join("reports");
    config.build.max_concurrent_builds = max_concurrent;
    Orchestrator::new(
        config,
        OrchestratorContext {
            toolchain: fixture.toolchain.clone(),
            registry: fixture.registry.clone(),
            vcs: fixture.vcs.clone(),
            agent_registry: fixture.agent_registry.clone(),
            agent_executor: fixture.executor.clone(),
            status: fixture.status.clone(),
            reporter: fixture.reporter.clone(),
            trace: fixture.trace.clone(),
        },
    )
}

fn spec(name: &str, dir: &str, category: &str, deps: &[&str]) -> PackageSpec {
    PackageSpec {
        name: name.to_string(),
        path: PathBuf::from(dir),
        category: category.to_string(),
        deps: deps.iter().map(|d| d.to_string()).collect(),
        files: vec![],
    }
}

#[test]
fn test_empty_package_list_succeeds_trivially() {
    let fixture = Fixture::new();
    let report = orchestrator(&fixture, 4)
        .run(BuilderInput::Packages(vec![]))
        .unwrap();
    assert_eq!(report.total_packages, 0);
    assert_eq!(report.successful, 0);
    assert_eq!(report.failed, 0);
    assert!(fixture.toolchain.calls.lock().unwrap().is_empty());
}

#[test]
fn test_dependency_order_is_respected() {
    let fixture = Fixture::new();
    let fixture = Fixture {
        toolchain: Arc::new(FakeToolchain::new().with_delay(Duration::from_millis(20))),
        ..fixture
    };

    let report = orchestrator(&fixture, 4)
        .run(BuilderInput::Packages(vec![
            spec("@acme/app", "app", "suite", &["@acme/lib"]),
            spec("@acme/lib", "lib", "core", &[]),
        ]))
        .unwrap();

    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 0);

    // every lib activity precedes every app activity
    let calls = fixture.toolchain.calls.lock().unwrap();
    let last_lib = calls.iter().rposition(|(_, k)| k == "lib").unwrap();
    let first_app = calls.iter().position(|(_, k)| k == "app").unwrap();
    assert!(last_lib < first_app, "dependency built after its dependent");

    // with only a chain to run, pipelines never overlapped
    assert_eq!(*fixture.toolchain.max_active.lock().unwrap(), 1);

    // the dependent recorded what it waited on
    let app_report = report
        .packages
        .iter()
        .find(|r| r.package_name == "@acme/app")
        .unwrap();
    assert_eq!(app_report.waited_for, vec!["@acme/lib"]);
}

#[test]
fn test_concurrency_stays_under_the_cap() {
    let fixture = Fixture::new();
    let fixture = Fixture {
        toolchain: Arc::new(FakeToolchain::new().with_delay(Duration::from_millis(30))),
        ..fixture
    };

    let specs: Vec<PackageSpec> = (0..6)
        .map(|i| spec(&format!("@acme/p{}", i), &format!("p{}", i), "core", &[]))
        .collect();
    let report = orchestrator(&fixture, 2).run(BuilderInput::Packages(specs)).unwrap();

    assert_eq!(report.successful, 6);
    assert!(*fixture.toolchain.max_active.lock().unwrap() <= 2);
}

#[test]
fn test_all_packages_already_published() {
    let fixture = Fixture::new();
    fixture.registry.publish("@acme/lib", "1.0.0");
    fixture.registry.publish("@acme/app", "2.1.0");

    let report = orchestrator(&fixture, 4)
        .run(BuilderInput::Packages(vec![
            spec("@acme/lib", "lib", "core", &[]),
            spec("@acme/app", "app", "suite", &["@acme/lib"]),
        ]))
        .unwrap();

    assert_eq!(report.total_packages, 2);
    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 0);
    assert!(fixture.toolchain.calls.lock().unwrap().is_empty());
    assert!(report.packages.iter().all(|r| r.quality.passed));
}

#[test]
fn test_failed_dependency_blocks_dependent() {
    let fixture = Fixture::new();
    // no build-repair agent registered, so a build failure is terminal
    let fixture = Fixture {
        agent_registry: Arc::new(scaffold_only_registry()),
        ..fixture
    };
    fixture.toolchain.script(
        "lib",
        PackageScript { build_failures_before_ok: usize::MAX, ..Default::default() },
    );

    let report = orchestrator(&fixture, 4)
        .run(BuilderInput::Packages(vec![
            spec("@acme/lib", "lib", "core", &[]),
            spec("@acme/app", "app", "suite", &["@acme/lib"]),
        ]))
        .unwrap();

    assert_eq!(report.total_packages, 2);
    assert_eq!(report.successful, 0);
    assert_eq!(report.failed, 2);

    let app_failure = report
        .failures
        .iter()
        .find(|f| f.package_name == "@acme/app")
        .unwrap();
    assert_eq!(app_failure.error, "dependency not satisfied");

    let lib_failure = report
        .failures
        .iter()
        .find(|f| f.package_name == "@acme/lib")
        .unwrap();
    assert_eq!(lib_failure.failed_phase, Phase::Build);

    // the dependent never started a pipeline
    assert!(fixture.toolchain.calls_for("app").is_empty());
}

#[test]
fn test_cycle_is_rejected_before_any_build() {
    let fixture = Fixture::new();
    let result = orchestrator(&fixture, 4).run(BuilderInput::Packages(vec![
        spec("@acme/a", "a", "core", &["@acme/b"]),
        spec("@acme/b", "b", "core", &["@acme/a"]),
    ]));
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("circular dependency"));
    assert!(fixture.toolchain.calls.lock().unwrap().is_empty());
}

#[test]
fn test_plan_document_input() {
    let fixture = Fixture::new();
    fixture.registry.publish("@acme/lib", "1.0.0");

    let plan_path = fixture.dir.path().join("plan.toml");
    std::fs::write(
        &plan_path,
        r#"
[plan]
name = "initial publish"
description = "first release of the acme workspace"

[[packages]]
name = "@acme/lib"
path = "lib"
category = "core"

[[packages]]
name = "@acme/widgets"
path = "widgets"
category = "ui"
deps = ["@acme/lib"]
"#,
    )
    .unwrap();

    let report = orchestrator(&fixture, 4).run(BuilderInput::Plan(plan_path)).unwrap();

    assert_eq!(report.total_packages, 2);
    assert_eq!(report.successful, 2);
    // only the unpublished package went through the toolchain
    assert!(fixture.toolchain.calls_for("lib").is_empty());
    assert_eq!(
        fixture.toolchain.calls_for("widgets"),
        vec!["build", "test", "quality", "publish"]
    );
}

#[test]
fn test_upgrade_indicator_sends_published_package_back_through() {
    let fixture = Fixture::new();
    fixture.registry.publish("@acme/lib", "1.0.0");

    let plan_path = fixture.dir.path().join("plan.toml");
    std::fs::write(
        &plan_path,
        r#"
[plan]
name = "lib refresh"
description = "upgrade of @acme/lib with a breaking change"

[[packages]]
name = "@acme/lib"
path = "lib"
category = "core"
"#,
    )
    .unwrap();

    let report = orchestrator(&fixture, 4).run(BuilderInput::Plan(plan_path)).unwrap();

    assert_eq!(report.successful, 1);
    // published, but the plan forces a rebuild
    assert_eq!(
        fixture.toolchain.calls_for("lib"),
        vec!["build", "test", "quality", "publish"]
    );
}

#[test]
fn test_missing_plan_is_a_contract_violation() {
    let fixture = Fixture::new();
    let result = orchestrator(&fixture, 4)
        .run(BuilderInput::Plan(fixture.dir.path().join("no-such-plan.toml")));
    assert!(result.is_err());
    assert!(fixture.toolchain.calls.lock().unwrap().is_empty());
}

#[test]
fn test_audit_report_input_builds_root_and_deps() {
    let fixture = Fixture::new();
    let audit_path = fixture.dir.path().join("audit.toml");
    std::fs::write(
        &audit_path,
        r#"
[root]
name = "@acme/suite"
path = "suite"
category = "suite"

[[dependencies]]
name = "@acme/lib"
path = "lib"
category = "core"
"#,
    )
    .unwrap();

    let report = orchestrator(&fixture, 4).run(BuilderInput::Audit(audit_path)).unwrap();

    assert_eq!(report.total_packages, 2);
    assert_eq!(report.successful, 2);

    // the root waited for its dependency
    let calls = fixture.toolchain.calls.lock().unwrap();
    let last_lib = calls.iter().rposition(|(_, k)| k == "lib").unwrap();
    let first_suite = calls.iter().position(|(_, k)| k == "suite").unwrap();
    assert!(last_lib < first_suite);
}

#[test]
fn test_report_totals_hold() {
    let fixture = Fixture::new();
    fixture.toolchain.script(
        "bad",
        PackageScript { publish_fails: true, ..Default::default() },
    );
    fixture.registry.publish("@acme/done", "3.0.0");

    let report = orchestrator(&fixture, 4)
        .run(BuilderInput::Packages(vec![
            spec("@acme/done", "done", "core", &[]),
            spec("@acme/good", "good", "core", &[]),
            spec("@acme/bad", "bad", "utility", &[]),
        ]))
        .unwrap();

    assert_eq!(report.total_packages, 3);
    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 1);
    assert!(report.successful + report.failed <= report.total_packages);
    let bad = report.failures.iter().find(|f| f.package_name == "@acme/bad").unwrap();
    assert_eq!(bad.failed_phase, Phase::Publish);

    // per-package reports exist for all three, aggregate for the run
    let entries: Vec<_> = std::fs::read_dir(fixture.dir.path().join("reports"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(entries.iter().any(|n| n.contains("_acme_done")));
    assert!(entries.iter().any(|n| n.contains("_acme_good")));
    assert!(entries.iter().any(|n| n.contains("_acme_bad")));
    assert!(entries.iter().any(|n| n.starts_with("build-")));

    let status_reports: Vec<ReportStatus> =
        report.packages.iter().map(|r| r.status).collect();
    assert_eq!(
        status_reports.iter().filter(|s| **s == ReportStatus::Failed).count(),
        1
    );
}
