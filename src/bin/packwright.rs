use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use packwright::config::GlobalConfig;
use packwright::orchestrator::{BuilderInput, Orchestrator};
use packwright::plan::PackageSpec;

#[derive(Parser)]
#[command(name = "packwright", about = "agent-driven package build orchestrator")]
struct Cli {
    /// Explicit packages to build, as name=path[:category] entries
    packages: Vec<String>,

    /// Path to a plan document
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Path to an audit-report document
    #[arg(long)]
    audit: Option<PathBuf>,

    /// Path to config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Max number of concurrent package builds
    #[arg(short = 'j', long)]
    jobs: Option<usize>,

    /// Directory for per-package and aggregate reports
    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = GlobalConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(jobs) = cli.jobs {
        config.build.max_concurrent_builds = jobs.max(1);
    }
    if let Some(dir) = cli.reports_dir {
        config.general.reports_dir = dir;
    }

    let input = match (&cli.plan, &cli.audit, cli.packages.is_empty()) {
        (Some(plan), None, true) => BuilderInput::Plan(plan.clone()),
        (None, Some(audit), true) => BuilderInput::Audit(audit.clone()),
        (None, None, false) => BuilderInput::Packages(parse_package_args(&cli.packages)?),
        (None, None, true) => {
            anyhow::bail!("nothing to build: pass --plan, --audit, or explicit packages")
        }
        _ => anyhow::bail!("--plan, --audit and explicit packages are mutually exclusive"),
    };

    let orchestrator = Orchestrator::from_config(config)?;
    let report = orchestrator.run(input)?;

    println!("Build {}:", report.build_id);
    println!(
        "  {} total, {} published, {} failed in {:.1}s",
        report.total_packages, report.successful, report.failed, report.total_duration
    );
    if !report.slowest_packages.is_empty() {
        println!("  Slowest:");
        for entry in &report.slowest_packages {
            println!("    {: <40} {:.1}s", entry.package_name, entry.duration);
        }
    }
    for failure in &report.failures {
        println!(
            "  FAILED {} in {} ({} fix attempts): {}",
            failure.package_name, failure.failed_phase, failure.fix_attempts, failure.error
        );
    }

    if report.failed > 0 {
        std::process::exit(1);
    }
    info!("all packages published");
    Ok(())
}

/// Parse `name=path[:category]` package arguments.
fn parse_package_args(args: &[String]) -> Result<Vec<PackageSpec>> {
    args.iter()
        .map(|arg| {
            let (name, rest) = arg
                .split_once('=')
                .with_context(|| format!("expected name=path[:category], got '{}'", arg))?;
            let (path, category) = match rest.rsplit_once(':') {
                Some((path, category)) if !path.is_empty() => (path, category.to_string()),
                _ => (rest, String::new()),
            };
            Ok(PackageSpec {
                name: name.to_string(),
                path: PathBuf::from(path),
                category,
                deps: Vec::new(),
                files: Vec::new(),
            })
        })
        .collect()
}
