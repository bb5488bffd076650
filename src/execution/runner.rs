//! Workflow Step Loop
//!
//! Runs the steps of one already-substituted workflow in order. The
//! scheduler only talks to the [`WorkflowRunner`] trait so scheduling
//! can be exercised without launching real scanners.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, error, warn};

use super::tool::{output_file_args, ToolInvocation, ToolOutput, ToolRunner};
use crate::error::EngineError;
use crate::parsers::{ScanResults, ScanType};
use crate::reporting::raw_output_dir;
use crate::workflow::variables::{unresolved_placeholders, REPORT_DIR};
use crate::workflow::{Step, Vars, Workflow, WorkflowKey};

/// What happened while running a workflow's steps.
#[derive(Debug, Clone, Default)]
pub struct StepsOutcome {
    /// Merged parse results of every successful step
    pub results: Option<ScanResults>,
    /// One message per failed step
    pub failures: Vec<String>,
    pub steps_run: usize,
    /// `(tool, path)` for every file the tools were asked to write
    pub output_files: Vec<(String, PathBuf)>,
}

impl StepsOutcome {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn scan_type(&self) -> Option<ScanType> {
        self.results.as_ref().map(|r| r.scan_type)
    }

    /// Adds one step's parsed output to the workflow result.
    pub fn absorb(&mut self, results: ScanResults) {
        match self.results.as_mut() {
            Some(merged) => merged.merge(results),
            None => self.results = Some(results),
        }
    }
}

/// Executes the steps of a single workflow.
///
/// Implementations return `Err` only for cancellation; step failures
/// are reported through [`StepsOutcome::failures`].
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn run_steps(
        &self,
        key: &WorkflowKey,
        workflow: &Workflow,
        vars: &Vars,
    ) -> Result<StepsOutcome, EngineError>;
}

/// Runs steps as external processes through a [`ToolRunner`].
#[derive(Debug, Clone)]
pub struct ToolWorkflowRunner {
    tools: ToolRunner,
    use_sudo: bool,
    privileged: bool,
    debug: bool,
}

impl ToolWorkflowRunner {
    pub fn new(tools: ToolRunner) -> Self {
        Self {
            tools,
            use_sudo: false,
            privileged: false,
            debug: false,
        }
    }

    pub fn with_sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }

    /// The process already has raw-socket rights (root or a sudo re-run).
    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// `args_sudo` is chosen when sudo was requested or the run is privileged.
    pub fn select_args<'a>(&self, step: &'a Step) -> &'a [String] {
        step.select_args(self.use_sudo || self.privileged)
    }

    /// In debug mode every step runs even after a failure.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    async fn run_step(&self, step: &Step, args: Vec<String>) -> Result<ToolOutput, EngineError> {
        let unresolved = unresolved_placeholders(&args);
        if !unresolved.is_empty() {
            return Err(EngineError::Substitution {
                step: step.tool.clone(),
                placeholders: unresolved,
            });
        }

        let invocation = ToolInvocation::new(step.tool.as_str(), args)
            .realtime(self.tools.realtime_for(&step.tool))
            .sudo(self.use_sudo);
        self.tools.run(&invocation).await
    }
}

#[async_trait]
impl WorkflowRunner for ToolWorkflowRunner {
    async fn run_steps(
        &self,
        key: &WorkflowKey,
        workflow: &Workflow,
        vars: &Vars,
    ) -> Result<StepsOutcome, EngineError> {
        let mut outcome = StepsOutcome::default();
        let raw_dir = vars
            .non_empty(REPORT_DIR)
            .map(|dir| raw_output_dir(Path::new(dir), key));

        for (index, step) in workflow.steps.iter().enumerate() {
            if self.tools.cancellation().is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let number = index + 1;
            let args = self.select_args(step).to_vec();
            outcome.output_files.extend(
                output_file_args(&args)
                    .into_iter()
                    .map(|path| (step.tool.clone(), path)),
            );
            debug!("{}: step {} ({})", key, number, step.tool);

            match self.run_step(step, args).await {
                Ok(output) => {
                    outcome.steps_run += 1;
                    if let Some(dir) = &raw_dir {
                        if let Err(e) = persist_raw_output(dir, number, &step.tool, &output) {
                            warn!("{}: could not save raw output: {}", key, e);
                        }
                    }
                    if let Some(results) = output.results {
                        outcome.absorb(results);
                    }
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    outcome.steps_run += 1;
                    error!("{}: step {} ({}) failed: {}", key, number, step.tool, e);
                    outcome.failures.push(e.to_string());
                    if !self.debug {
                        if number < workflow.steps.len() {
                            warn!("{}: skipping remaining steps", key);
                        }
                        break;
                    }
                }
            }
        }

        Ok(outcome)
    }
}

/// Writes `<NN>_<tool>.log` and, when parsed, `<NN>_<tool>.json`.
fn persist_raw_output(dir: &Path, number: usize, tool: &str, output: &ToolOutput) -> io::Result<()> {
    fs::create_dir_all(dir)?;

    let stem = format!("{:02}_{}", number, tool);
    let mut text = output.lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(dir.join(format!("{}.log", stem)), text)?;

    if let Some(results) = &output.results {
        let json = serde_json::to_string_pretty(results)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(format!("{}.json", stem)), json)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::tool::build_argv;
    use crate::workflow::RunGlobals;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    fn sh(script: &str) -> Step {
        Step::new("sh", ["-c", script])
    }

    fn vars_for(dir: &Path) -> Vars {
        Vars::from_snapshot(HashMap::new(), &RunGlobals::new("127.0.0.1", "test", dir))
    }

    fn runner(debug: bool) -> ToolWorkflowRunner {
        ToolWorkflowRunner::new(ToolRunner::new(CancellationToken::new())).with_debug(debug)
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let temp_dir = tempdir().unwrap();
        let marker = temp_dir.path().join("marker");
        let workflow = Workflow::new("w")
            .with_step(sh("exit 1"))
            .with_step(sh(&format!("touch {}", marker.display())));

        let outcome = runner(false)
            .run_steps(&WorkflowKey::new("sh", "w"), &workflow, &vars_for(temp_dir.path()))
            .await
            .unwrap();

        assert!(!outcome.succeeded());
        assert_eq!(outcome.steps_run, 1);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_debug_runs_every_step() {
        let temp_dir = tempdir().unwrap();
        let marker = temp_dir.path().join("marker");
        let workflow = Workflow::new("w")
            .with_step(sh("exit 1"))
            .with_step(sh(&format!("touch {}", marker.display())));

        let outcome = runner(true)
            .run_steps(&WorkflowKey::new("sh", "w"), &workflow, &vars_for(temp_dir.path()))
            .await
            .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.steps_run, 2);
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_unresolved_placeholder_fails_step() {
        let temp_dir = tempdir().unwrap();
        let workflow = Workflow::new("v").with_step(Step::new("nuclei", ["-u", "{{target_urls}}"]));

        let outcome = runner(false)
            .run_steps(&WorkflowKey::new("nuclei", "v"), &workflow, &vars_for(temp_dir.path()))
            .await
            .unwrap();

        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].contains("target_urls"));
    }

    #[tokio::test]
    async fn test_raw_output_persisted() {
        let temp_dir = tempdir().unwrap();
        let key = WorkflowKey::new("sh", "hello");
        let workflow = Workflow::new("h").with_step(sh("echo hello"));

        let outcome = runner(false)
            .run_steps(&key, &workflow, &vars_for(temp_dir.path()))
            .await
            .unwrap();
        assert!(outcome.succeeded());

        let log = raw_output_dir(temp_dir.path(), &key).join("01_sh.log");
        assert_eq!(fs::read_to_string(log).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn test_privileged_run_uses_sudo_form_without_sudo() {
        let nmap = Step::with_modes("nmap", ["-sS", "-p", "22", "x"], ["-sT", "-p", "22", "x"]);
        let privileged = runner(false).with_privileged(true);
        let args = privileged.select_args(&nmap);
        assert_eq!(args[0], "-sS");
        assert_eq!(build_argv("nmap", args, privileged.use_sudo, true)[0], "nmap");
        assert_eq!(runner(false).select_args(&nmap)[0], "-sT");

        let temp_dir = tempdir().unwrap();
        let key = WorkflowKey::new("sh", "modes");
        let workflow = Workflow::new("m").with_step(Step::with_modes(
            "sh",
            ["-c", "echo raw-socket"],
            ["-c", "echo connect"],
        ));
        privileged
            .run_steps(&key, &workflow, &vars_for(temp_dir.path()))
            .await
            .unwrap();

        let log = raw_output_dir(temp_dir.path(), &key).join("01_sh.log");
        assert_eq!(fs::read_to_string(log).unwrap(), "raw-socket\n");
    }

    #[tokio::test]
    async fn test_cancelled_before_step() {
        let temp_dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = ToolWorkflowRunner::new(ToolRunner::new(cancel));
        let workflow = Workflow::new("w").with_step(sh("true"));

        let err = runner
            .run_steps(&WorkflowKey::new("sh", "w"), &workflow, &vars_for(temp_dir.path()))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_absorb_merges_results() {
        let mut outcome = StepsOutcome::default();
        let mut first = ScanResults::new(ScanType::PortDiscovery);
        first.ports.push(crate::parsers::PortInfo::open(22));
        let mut second = ScanResults::new(ScanType::DeepScan);
        second.ports.push(crate::parsers::PortInfo::open(80));

        outcome.absorb(first);
        outcome.absorb(second);
        assert_eq!(outcome.results.as_ref().unwrap().open_ports(), vec![22, 80]);
        assert_eq!(outcome.scan_type(), Some(ScanType::DeepScan));
    }
}
