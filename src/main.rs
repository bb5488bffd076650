//! reconflow CLI Entry Point
//!
//! Provides the command-line interface for running a scan template
//! against one target.
//!
//! # Usage
//!
//! ```bash
//! # Run the default template
//! reconflow 10.0.0.1
//!
//! # Pick a template and stream tool output
//! reconflow scanme.example.org --workflow web --debug
//!
//! # Allow sudo for raw-socket scans
//! reconflow 10.0.0.0/24 --sudo
//!
//! # Check installed tools and template validity
//! reconflow --health
//! ```

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Local;
use clap::{CommandFactory, Parser};
use colored::Colorize;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use reconflow::execution::process::is_root;
use reconflow::execution::{
    ActiveProcesses, CancellationCoordinator, Engine, PropagationBridge, RunGlobals, RunSummary,
    ToolRunner, ToolWorkflowRunner, CANCELLED_EXIT_CODE,
};
use reconflow::reporting::{report_dir_for, JsonReporter};
use reconflow::{health, load_template, EngineError, Settings, APP_NAME, VERSION};

/// Marks a re-invocation that already went through sudo.
const SUDO_RESTART_FLAG: &str = "--sudo-restart";

/// Exit status when no target was given.
const USAGE_EXIT_CODE: u8 = 2;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "reconflow", version, about = "Dependency-aware reconnaissance workflow runner")]
struct Cli {
    /// Host, IP, CIDR or URL to scan
    target: Option<String>,

    /// Template to run (directory under the templates dir)
    #[arg(short, long)]
    workflow: Option<String>,

    /// Stream tool output and keep going after failed steps
    #[arg(short, long)]
    debug: bool,

    /// Check tools, privileges and the template, then exit
    #[arg(long)]
    health: bool,

    /// Prepend sudo to tool invocations that need raw sockets
    #[arg(long)]
    sudo: bool,

    /// Settings file (defaults to ./reconflow.yaml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    templates_dir: Option<PathBuf>,

    #[arg(long)]
    reports_dir: Option<PathBuf>,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Reconnaissance Workflow Orchestrator");
    println!();
}

/// Removes the hidden restart flag. Returns whether it was present.
fn strip_sudo_restart(args: &mut Vec<String>) -> bool {
    let before = args.len();
    args.retain(|arg| arg != SUDO_RESTART_FLAG);
    args.len() != before
}

fn print_summary(summary: &RunSummary, debug: bool) {
    println!();
    println!("{}", "Scan Summary".bold());
    println!("{}", "============".bold());

    for report in &summary.reports {
        let secs = report.duration.as_secs_f64();
        if report.succeeded() {
            println!("  {} {} ({:.1}s)", "✓".green(), report.key, secs);
        } else {
            println!("  {} {} ({:.1}s)", "✗".red(), report.key, secs);
            for failure in &report.failures {
                println!("      {}", failure.dimmed());
            }
        }
    }

    let merged = summary.merged_results();
    let ports = merged.open_ports();
    println!();
    if ports.is_empty() {
        println!("Open ports: {}", "none found".yellow());
    } else {
        let list: Vec<String> = ports.iter().map(u16::to_string).collect();
        println!("Open ports: {}", list.join(", ").cyan());
    }

    if !merged.vulnerabilities.is_empty() {
        println!("Findings: {}", merged.vulnerabilities.len().to_string().red());
        for vuln in &merged.vulnerabilities {
            println!("  [{}] {} {}", vuln.severity, vuln.name, vuln.url.dimmed());
        }
    }

    println!();
    println!(
        "Workflows: {} completed, {} failed in {:.1}s",
        summary.completed().to_string().green(),
        summary.failed().to_string().red(),
        summary.elapsed.as_secs_f64()
    );

    if debug {
        println!();
        println!("{}", summary.timeline.gantt_chart());
    }
}

/// Main application entry point.
async fn run() -> Result<ExitCode, Box<dyn Error>> {
    let mut args: Vec<String> = env::args().collect();
    let sudo_restart = strip_sudo_restart(&mut args);
    let cli = Cli::parse_from(args);

    setup_logging(cli.debug);
    print_banner();

    let mut settings = Settings::load_or_default(cli.config.as_deref())?;
    if let Some(dir) = cli.templates_dir {
        settings.templates_dir = dir;
    }
    if let Some(dir) = cli.reports_dir {
        settings.reports_dir = dir;
    }
    let template_name = cli
        .workflow
        .unwrap_or_else(|| settings.default_template.clone());

    if cli.health {
        let report = health::check(&settings.templates_dir, &template_name);
        println!("{}", report.render());
        return Ok(if report.is_healthy() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let Some(target) = cli.target else {
        eprintln!("Error: missing <TARGET>");
        eprintln!();
        Cli::command().print_help()?;
        return Ok(ExitCode::from(USAGE_EXIT_CODE));
    };

    let privileged = sudo_restart || is_root();
    if cli.sudo && !privileged {
        info!("sudo will be used for tool flags that need raw sockets");
    }

    let template = load_template(&settings.templates_dir, &template_name).map_err(|e| {
        error!("Failed to load template: {}", e);
        e
    })?;

    let report_dir = report_dir_for(&settings.reports_dir, &target, Local::now());
    info!("Target: {}", target);
    info!("Reports: {}", report_dir.display());
    let globals = RunGlobals::new(target, template_name, report_dir);

    let cancel = CancellationToken::new();
    let processes = ActiveProcesses::new();
    let coordinator = Arc::new(
        CancellationCoordinator::new(cancel.clone(), processes.clone(), privileged)
            .with_watchdogs(settings.privileged_watchdog(), settings.watchdog()),
    );
    coordinator.install()?;

    let tools = ToolRunner::new(cancel.clone())
        .with_processes(processes)
        .with_kill_grace(settings.kill_grace())
        .with_debug(cli.debug);
    let runner = ToolWorkflowRunner::new(tools)
        .with_sudo(cli.sudo)
        .with_privileged(privileged)
        .with_debug(cli.debug);
    let bridge = PropagationBridge::new(Arc::new(JsonReporter::new()))
        .with_settle(settings.output_settle_timeout(), settings.output_poll_interval())
        .with_debug(cli.debug);

    let mut engine = Engine::new(template, globals, Arc::new(runner))?;
    engine.set_cancellation_token(cancel);
    engine.set_propagation(bridge);

    let result = engine.run().await;
    coordinator.mark_clean_exit();

    match &result {
        Ok(summary) => {
            if !summary.all_succeeded() {
                warn!("{} workflow(s) failed", summary.failed());
            }
            print_summary(summary, cli.debug);
        }
        Err(EngineError::Cancelled) => warn!("Scan cancelled"),
        Err(_) => {}
    }

    match (exit_code_for(&result), result) {
        (Some(code), _) => Ok(ExitCode::from(code)),
        (None, Err(e)) => Err(e.into()),
        (None, Ok(_)) => Ok(ExitCode::SUCCESS),
    }
}

/// Exit status for a finished run. `None` means a hard error.
fn exit_code_for(result: &Result<RunSummary, EngineError>) -> Option<u8> {
    match result {
        Ok(_) => Some(0),
        Err(EngineError::Cancelled) => Some(CANCELLED_EXIT_CODE as u8),
        Err(_) => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
