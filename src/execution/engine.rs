//! Workflow Execution Engine
//!
//! Drives a planned template level by level:
//! - Levels run strictly in order
//! - The sequential bucket runs one workflow at a time, sorted by key
//! - Named parallel groups are taken one after another; members of a
//!   multi-member group run concurrently and are joined before moving on
//! - Each workflow gets a private snapshot of the provided data
//! - Cancellation is checked at level start, workflow start and per step

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::propagation::{Propagated, PropagationBridge};
use super::runner::WorkflowRunner;
use crate::error::{EngineError, GraphError};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::parsers::ScanResults;
use crate::reporting::JsonReporter;
use crate::workflow::variables::{apply_derivations, substitute_workflow};
use crate::workflow::{
    build_levels, ExecutionLevel, ExecutionPlan, ProvidedData, RunGlobals, Template, Vars,
    WorkflowKey,
};

/// Final state of one workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Completed,
    Failed,
}

/// Outcome of one workflow in a run.
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub key: WorkflowKey,
    pub status: WorkflowStatus,
    pub failures: Vec<String>,
    pub results: Option<ScanResults>,
    /// Values this workflow wrote to the provided data
    pub propagated: Vec<Propagated>,
    pub duration: Duration,
}

impl WorkflowReport {
    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }
}

/// Everything a finished run produced.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// Reports in completion order
    pub reports: Vec<WorkflowReport>,
    /// Final provided data
    pub provided: HashMap<String, String>,
    pub timeline: ExecutionTimeline,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.reports.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports.len() - self.completed()
    }

    pub fn all_succeeded(&self) -> bool {
        self.reports.iter().all(WorkflowReport::succeeded)
    }

    pub fn report(&self, key: &WorkflowKey) -> Option<&WorkflowReport> {
        self.reports.iter().find(|r| &r.key == key)
    }

    /// Results of every successful workflow merged together.
    pub fn merged_results(&self) -> ScanResults {
        let mut merged = ScanResults::default();
        for results in self
            .reports
            .iter()
            .filter(|r| r.succeeded())
            .filter_map(|r| r.results.clone())
        {
            merged.merge(results);
        }
        merged
    }
}

/// State shared by every workflow task of one run.
struct RunContext {
    template: Arc<Template>,
    runner: Arc<dyn WorkflowRunner>,
    bridge: PropagationBridge,
    provided: ProvidedData,
    globals: RunGlobals,
    cancel: CancellationToken,
    timeline: Mutex<ExecutionTimeline>,
}

impl RunContext {
    fn check_cancelled(&self) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn record(&self, key: &WorkflowKey, event: EventType) {
        self.timeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_event(key.to_string(), event);
    }
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
///
/// use reconflow::execution::{Engine, ToolRunner, ToolWorkflowRunner};
/// use reconflow::workflow::{load_template, RunGlobals};
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let template = load_template("workflows", "default")?;
/// let cancel = CancellationToken::new();
/// let runner = ToolWorkflowRunner::new(ToolRunner::new(cancel.clone()));
///
/// let mut engine = Engine::new(
///     template,
///     RunGlobals::new("10.0.0.1", "default", "reports/10.0.0.1"),
///     Arc::new(runner),
/// )?;
/// engine.set_cancellation_token(cancel);
///
/// let summary = engine.run().await?;
/// println!("{} workflows completed", summary.completed());
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    template: Arc<Template>,
    plan: ExecutionPlan,
    runner: Arc<dyn WorkflowRunner>,
    bridge: PropagationBridge,
    provided: ProvidedData,
    globals: RunGlobals,
    cancel: CancellationToken,
}

impl Engine {
    /// Plans `template`; fails on a cycle or unknown dependency.
    pub fn new(
        template: Template,
        globals: RunGlobals,
        runner: Arc<dyn WorkflowRunner>,
    ) -> Result<Self, GraphError> {
        let plan = build_levels(&template)?;
        Ok(Self {
            template: Arc::new(template),
            plan,
            runner,
            bridge: PropagationBridge::new(Arc::new(JsonReporter::new())),
            provided: ProvidedData::new(),
            globals,
            cancel: CancellationToken::new(),
        })
    }

    pub fn set_cancellation_token(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    pub fn set_propagation(&mut self, bridge: PropagationBridge) {
        self.bridge = bridge;
    }

    /// Seeds the run with already known values.
    pub fn set_provided_data(&mut self, provided: ProvidedData) {
        self.provided = provided;
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn provided(&self) -> &ProvidedData {
        &self.provided
    }

    /// Runs every level. Only cancellation ends the run early.
    pub async fn run(&self) -> Result<RunSummary, EngineError> {
        let started = Instant::now();
        let ctx = Arc::new(RunContext {
            template: Arc::clone(&self.template),
            runner: Arc::clone(&self.runner),
            bridge: self.bridge.clone(),
            provided: self.provided.clone(),
            globals: self.globals.clone(),
            cancel: self.cancel.clone(),
            timeline: Mutex::new(ExecutionTimeline::new()),
        });

        info!(
            "Running template '{}' against {} ({} workflows, {} levels)",
            self.template.name,
            self.globals.target,
            self.plan.workflow_count(),
            self.plan.levels.len()
        );

        let mut reports = Vec::new();
        for (index, level) in self.plan.levels.iter().enumerate() {
            ctx.check_cancelled()?;
            info!("Level {}/{}: {} workflows", index + 1, self.plan.levels.len(), level.len());
            run_level(&ctx, level, &mut reports).await?;
            debug!("Level {} done, {} provided values", index + 1, ctx.provided.len());
        }

        let timeline = ctx
            .timeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let summary = RunSummary {
            reports,
            provided: ctx.provided.snapshot(),
            timeline,
            elapsed: started.elapsed(),
        };
        info!(
            "Run finished: {} completed, {} failed in {:.1}s",
            summary.completed(),
            summary.failed(),
            summary.elapsed.as_secs_f64()
        );
        Ok(summary)
    }
}

async fn run_level(
    ctx: &Arc<RunContext>,
    level: &ExecutionLevel,
    reports: &mut Vec<WorkflowReport>,
) -> Result<(), EngineError> {
    for key in &level.sequential {
        reports.push(execute_workflow(Arc::clone(ctx), key.clone()).await?);
    }

    for group in &level.groups {
        ctx.check_cancelled()?;

        if let [only] = group.members.as_slice() {
            reports.push(execute_workflow(Arc::clone(ctx), only.clone()).await?);
            continue;
        }

        debug!(
            "Parallel group '{}': {} workflows",
            group.name,
            group.members.len()
        );
        let mut set = JoinSet::new();
        for key in &group.members {
            set.spawn(execute_workflow(Arc::clone(ctx), key.clone()));
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    error!("Workflow task in group '{}' panicked: {}", group.name, join_error);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
    }
    Ok(())
}

/// Runs one workflow; `Err` only on cancellation.
async fn execute_workflow(
    ctx: Arc<RunContext>,
    key: WorkflowKey,
) -> Result<WorkflowReport, EngineError> {
    ctx.check_cancelled()?;
    let started = Instant::now();

    let Some(definition) = ctx.template.workflows.get(&key) else {
        warn!("{}: not present in template, skipping", key);
        return Ok(WorkflowReport {
            key,
            status: WorkflowStatus::Failed,
            failures: vec!["not present in template".to_string()],
            results: None,
            propagated: Vec::new(),
            duration: Duration::ZERO,
        });
    };

    info!("Starting {}", key);
    ctx.record(&key, EventType::Started);

    let mut vars = Vars::from_snapshot(ctx.provided.snapshot(), &ctx.globals);
    apply_derivations(&key, definition, &mut vars);

    let mut workflow = definition.clone();
    substitute_workflow(&mut workflow, &vars);

    let outcome = match ctx.runner.run_steps(&key, &workflow, &vars).await {
        Ok(outcome) => outcome,
        Err(e) => {
            ctx.record(&key, EventType::Failed);
            return Err(e);
        }
    };

    if !outcome.succeeded() {
        warn!("{} failed ({} step failures)", key, outcome.failures.len());
        ctx.record(&key, EventType::Failed);
        return Ok(WorkflowReport {
            key,
            status: WorkflowStatus::Failed,
            failures: outcome.failures,
            results: outcome.results,
            propagated: Vec::new(),
            duration: started.elapsed(),
        });
    }

    let propagated = ctx
        .bridge
        .propagate(&key, &workflow, &outcome, &ctx.globals, &ctx.provided, &ctx.cancel)
        .await;

    ctx.record(&key, EventType::Completed);
    info!("Completed {} in {:.1}s", key, started.elapsed().as_secs_f64());

    Ok(WorkflowReport {
        key,
        status: WorkflowStatus::Completed,
        failures: Vec::new(),
        results: outcome.results,
        propagated,
        duration: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::runner::StepsOutcome;
    use crate::parsers::{PortInfo, ScanType};
    use crate::workflow::variables::{DISCOVERED_PORTS, TARGET_URLS};
    use crate::workflow::{Step, Workflow};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    /// Records concurrency and the variables each workflow saw.
    #[derive(Default)]
    struct FakeRunner {
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
        results: HashMap<String, ScanResults>,
        failing: HashSet<String>,
        seen: Mutex<Vec<(String, Vars, Workflow)>>,
    }

    impl FakeRunner {
        fn with_delay(ms: u64) -> Self {
            Self {
                delay: Duration::from_millis(ms),
                ..Self::default()
            }
        }

        fn order(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|(k, _, _)| k.clone()).collect()
        }

        fn vars_of(&self, key: &str) -> Vars {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .find(|(k, _, _)| k == key)
                .map(|(_, v, _)| v.clone())
                .unwrap()
        }
    }

    #[async_trait]
    impl WorkflowRunner for FakeRunner {
        async fn run_steps(
            &self,
            key: &WorkflowKey,
            workflow: &Workflow,
            vars: &Vars,
        ) -> Result<StepsOutcome, EngineError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((key.to_string(), vars.clone(), workflow.clone()));

            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            let mut outcome = StepsOutcome {
                results: self.results.get(&key.to_string()).cloned(),
                steps_run: workflow.steps.len(),
                ..StepsOutcome::default()
            };
            if self.failing.contains(&key.to_string()) {
                outcome.failures.push("exit status: 1".to_string());
            }
            Ok(outcome)
        }
    }

    fn wf() -> Workflow {
        Workflow::new("w").with_step(Step::new("sh", ["-c", "true"]))
    }

    fn engine(template: Template, runner: Arc<FakeRunner>) -> (Engine, TempDir) {
        let temp_dir = tempdir().unwrap();
        let globals = RunGlobals::new("10.0.0.1", "test", temp_dir.path());
        let mut engine = Engine::new(template, globals, runner).unwrap();
        engine.set_propagation(
            PropagationBridge::new(Arc::new(JsonReporter::new()))
                .with_settle(Duration::from_millis(50), Duration::from_millis(10)),
        );
        (engine, temp_dir)
    }

    #[tokio::test]
    async fn test_sequential_workflows_never_overlap() {
        let mut template = Template::new("t");
        for name in ["c", "a", "b"] {
            template.insert(WorkflowKey::new("sh", name), wf());
        }
        template.insert(WorkflowKey::new("sh", "solo"), wf().in_group("alone"));

        let runner = Arc::new(FakeRunner::with_delay(30));
        let (engine, _dir) = engine(template, runner.clone());
        let summary = engine.run().await.unwrap();

        assert_eq!(summary.completed(), 4);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(runner.order(), vec!["sh_a", "sh_b", "sh_c", "sh_solo"]);
    }

    #[tokio::test]
    async fn test_group_members_run_concurrently() {
        let mut template = Template::new("t");
        for name in ["x", "y", "z"] {
            template.insert(WorkflowKey::new("sh", name), wf().in_group("enum"));
        }

        let runner = Arc::new(FakeRunner::with_delay(150));
        let (engine, _dir) = engine(template, runner.clone());
        let started = Instant::now();
        engine.run().await.unwrap();

        assert_eq!(runner.max_active.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_distinct_groups_do_not_overlap() {
        let mut template = Template::new("t");
        template.insert(WorkflowKey::new("sh", "a1"), wf().in_group("alpha"));
        template.insert(WorkflowKey::new("sh", "a2"), wf().in_group("alpha"));
        template.insert(WorkflowKey::new("sh", "b1"), wf().in_group("beta"));
        template.insert(WorkflowKey::new("sh", "b2"), wf().in_group("beta"));

        let runner = Arc::new(FakeRunner::with_delay(80));
        let (engine, _dir) = engine(template, runner.clone());
        engine.run().await.unwrap();

        assert_eq!(runner.max_active.load(Ordering::SeqCst), 2);
        let order = runner.order();
        let first_beta = order.iter().position(|k| k.starts_with("sh_b")).unwrap();
        assert!(order[..first_beta].iter().all(|k| k.starts_with("sh_a")));
    }

    #[tokio::test]
    async fn test_discovered_ports_flow_into_target_urls() {
        let mut template = Template::new("t");
        template.insert(
            WorkflowKey::new("naabu", "port_discovery"),
            Workflow::new("ports")
                .with_step(Step::new("naabu", ["-host", "{{target}}"]))
                .provides(DISCOVERED_PORTS),
        );
        template.insert(
            WorkflowKey::new("nuclei", "vulns"),
            Workflow::new("vulns")
                .with_step(Step::new("nuclei", ["-u", "{{target_urls}}"]))
                .requires("port_discovery"),
        );

        let mut ports = ScanResults::new(ScanType::PortDiscovery);
        ports.ports = vec![PortInfo::open(22), PortInfo::open(80)];
        let mut runner = FakeRunner::default();
        runner.results.insert("naabu_port_discovery".to_string(), ports);
        let runner = Arc::new(runner);

        let (engine, _dir) = engine(template, runner.clone());
        let summary = engine.run().await.unwrap();

        assert_eq!(summary.provided[DISCOVERED_PORTS], "22,80");
        let vars = runner.vars_of("nuclei_vulns");
        assert_eq!(vars.get(TARGET_URLS), Some("http://10.0.0.1"));

        let seen = runner.seen.lock().unwrap();
        let (_, _, nuclei) = seen.iter().find(|(k, _, _)| k == "nuclei_vulns").unwrap();
        assert_eq!(nuclei.steps[0].args, vec!["-u", "http://10.0.0.1"]);
        let (_, _, naabu) = seen.iter().find(|(k, _, _)| k == "naabu_port_discovery").unwrap();
        assert_eq!(naabu.steps[0].args[1], "10.0.0.1");
    }

    #[tokio::test]
    async fn test_failure_isolated_and_not_propagated() {
        let mut template = Template::new("t");
        template.insert(
            WorkflowKey::new("sh", "bad"),
            wf().in_group("g").provides("token"),
        );
        template.insert(WorkflowKey::new("sh", "good"), wf().in_group("g"));
        template.insert(WorkflowKey::new("sh", "later"), wf().requires("good"));

        let mut runner = FakeRunner::with_delay(10);
        runner.failing.insert("sh_bad".to_string());
        let runner = Arc::new(runner);

        let (engine, _dir) = engine(template, runner.clone());
        let summary = engine.run().await.unwrap();

        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.completed(), 2);
        let bad = summary.report(&WorkflowKey::new("sh", "bad")).unwrap();
        assert_eq!(bad.status, WorkflowStatus::Failed);
        assert!(!summary.provided.contains_key("token"));
        assert!(runner.order().contains(&"sh_later".to_string()));
        assert_eq!(summary.timeline.spans().len(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_level() {
        let mut template = Template::new("t");
        template.insert(WorkflowKey::new("sh", "first"), wf());
        template.insert(WorkflowKey::new("sh", "second"), wf().requires("first"));

        let runner = Arc::new(FakeRunner::with_delay(200));
        let (mut engine, _dir) = engine(template, runner.clone());
        let cancel = CancellationToken::new();
        engine.set_cancellation_token(cancel.clone());

        let handle = tokio::spawn(async move { engine.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(runner.order(), vec!["sh_first"]);
    }

    #[test]
    fn test_cycle_rejected_at_construction() {
        let mut template = Template::new("t");
        template.insert(WorkflowKey::new("sh", "a"), wf().requires("b"));
        template.insert(WorkflowKey::new("sh", "b"), wf().requires("a"));

        let result = Engine::new(
            template,
            RunGlobals::new("x", "t", "/tmp"),
            Arc::new(FakeRunner::default()),
        );
        assert!(matches!(result, Err(GraphError::Cycle { .. })));
    }
}
