//! Command handlers.

use crate::commands::Format;
use anyhow::{Context, Result};
use console::style;
use gantry_cache::store::FilesystemStore;
use gantry_core::definition::{EventKind, PipelineDefinition};
use gantry_core::outcome::Outcome;
use gantry_core::ports::{OutputLine, OutputStream};
use gantry_core::report::RunReport;
use gantry_runner::ShellExecutor;
use gantry_scheduler::triggers::{self, TriggerContext};
use gantry_scheduler::{ExecutionGraph, Scheduler, SchedulerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct RunArgs {
    pub file: PathBuf,
    pub branch: String,
    pub event: EventKind,
    pub format: Format,
    pub workspace: PathBuf,
    pub vars: Vec<(String, String)>,
    pub cache_dir: Option<PathBuf>,
}

/// Execute a pipeline run and return the process exit code.
pub async fn run(args: RunArgs) -> Result<i32> {
    let pipeline = load(&args.file)?;
    let ctx = TriggerContext {
        branch: args.branch,
        event: args.event,
    };
    let jobs = triggers::select_jobs(&pipeline, &ctx);
    let graph = ExecutionGraph::build(&jobs)
        .with_context(|| format!("invalid pipeline '{}'", pipeline.name))?;

    let mut config = SchedulerConfig::new(&args.workspace);
    config.variables = pipeline.variables.clone();
    config.variables.extend(args.vars);
    config.policies = pipeline.policies;

    let mut scheduler = Scheduler::new(Arc::new(ShellExecutor::new()), config);
    if let Some(dir) = args.cache_dir {
        scheduler = scheduler.with_cache(Arc::new(FilesystemStore::new(dir)));
    }

    let (tx, mut rx) = mpsc::channel::<OutputLine>(256);
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            let prefix = style(format!("[{}]", line.node)).dim();
            match line.stream {
                OutputStream::Stdout => println!("{} {}", prefix, line.content),
                OutputStream::Stderr => eprintln!("{} {}", prefix, line.content),
            }
        }
    });

    let report = scheduler.run(&pipeline.name, &graph, tx).await;
    let _ = printer.await;

    match args.format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Format::Text => print_report(&report),
    }
    Ok(report.exit_code())
}

/// Parse a pipeline file and check its structure, matrix expansion included.
pub async fn validate(file: &Path) -> Result<()> {
    let pipeline = load(file)?;
    let graph = ExecutionGraph::build(&pipeline.jobs)
        .with_context(|| format!("invalid pipeline '{}'", pipeline.name))?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        pipeline.name
    );
    println!(
        "  Jobs: {}, nodes after matrix expansion: {}",
        pipeline.jobs.len(),
        graph.node_count()
    );
    Ok(())
}

/// Print the execution plan grouped by dependency tier.
pub async fn plan(file: &Path, branch: String, event: EventKind) -> Result<()> {
    let pipeline = load(file)?;
    let ctx = TriggerContext { branch, event };
    let jobs = triggers::select_jobs(&pipeline, &ctx);
    let graph = ExecutionGraph::build(&jobs)
        .with_context(|| format!("invalid pipeline '{}'", pipeline.name))?;

    println!("Execution plan for {}", style(&pipeline.name).bold());
    for (i, tier) in graph.tiers().iter().enumerate() {
        println!("  tier {}:", i);
        for id in tier {
            println!("    {}", id);
        }
    }
    Ok(())
}

fn load(path: &Path) -> Result<PipelineDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_report(report: &RunReport) {
    println!();
    for node in &report.nodes {
        let mark = match node.outcome {
            Outcome::Succeeded => style("✓").green(),
            Outcome::Failed | Outcome::TimedOut => style("✗").red(),
            Outcome::Skipped => style("-").dim(),
            Outcome::Cancelled => style("!").yellow(),
        };
        let mut line = format!(
            "{} {:<40} {:>9} {:>8}ms",
            mark, node.name, node.outcome, node.duration_ms
        );
        if let Some(reason) = &node.reason {
            line.push_str(&format!("  {}", style(reason).dim()));
        }
        if let Some(key) = &node.restored_key {
            line.push_str(&format!("  {}", style(format!("cache: {}", key)).cyan()));
        }
        println!("{}", line);
    }

    println!();
    if report.success {
        println!(
            "{} Run {} succeeded in {}ms",
            style("✓").green(),
            style(&report.pipeline).bold(),
            report.duration_ms
        );
    } else {
        println!(
            "{} Run {} failed in {}ms",
            style("✗").red(),
            style(&report.pipeline).bold(),
            report.duration_ms
        );
    }
}
