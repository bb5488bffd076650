//! Tool Invocation
//!
//! Runs one external scanner and captures its output:
//! - Privilege decision (`sudo` prefix)
//! - Output directory creation for `-o`-style arguments
//! - Streaming (line-by-line) or buffered execution
//! - Cancellation with process-group termination
//! - Parsing into [`ScanResults`] when a parser exists

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, error, info};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::process::{is_root, signaller_for, terminate_process_tree, ActiveProcesses, Signal};
use crate::error::EngineError;
use crate::parsers::{self, ScanResults};

/// Default pause between SIGTERM and SIGKILL of a process group.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_millis(50);

/// nmap scan types that need raw sockets.
const NMAP_PRIVILEGED_FLAGS: &[&str] = &["-sS", "-sF", "-sN", "-sX", "-sA", "-sW", "-sM", "-O"];

/// Flags whose next argument is a file the tool writes.
const OUTPUT_FLAGS: &[&str] = &["-o", "-oX", "-oN", "-oG", "-oA", "-oJ", "-output", "--output"];

/// True when this tool/flag combination needs root.
///
/// ```
/// use reconflow::execution::tool::requires_privilege;
///
/// let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();
/// assert!(requires_privilege("nmap", &args(&["-sS", "10.0.0.1"])));
/// assert!(!requires_privilege("nmap", &args(&["-sT", "10.0.0.1"])));
/// assert!(requires_privilege("masscan", &[]));
/// assert!(!requires_privilege("nuclei", &args(&["-sS"])));
/// ```
pub fn requires_privilege(tool: &str, args: &[String]) -> bool {
    match tool {
        "nmap" => args
            .iter()
            .any(|a| NMAP_PRIVILEGED_FLAGS.contains(&a.as_str())),
        "masscan" => true,
        _ => false,
    }
}

/// Full argv for a tool, with `sudo` prepended only when requested,
/// needed, and not already root.
pub fn build_argv(tool: &str, args: &[String], use_sudo: bool, running_as_root: bool) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 2);
    if use_sudo && !running_as_root && requires_privilege(tool, args) {
        argv.push("sudo".to_string());
    }
    argv.push(tool.to_string());
    argv.extend(args.iter().cloned());
    argv
}

/// Paths following `-o`, `-oX`, `-oN`, ... in `args`.
pub fn output_file_args(args: &[String]) -> Vec<PathBuf> {
    args.windows(2)
        .filter(|pair| OUTPUT_FLAGS.contains(&pair[0].as_str()))
        .map(|pair| pair[1].as_str())
        .filter(|path| !path.is_empty() && *path != "-")
        .map(PathBuf::from)
        .collect()
}

/// Creates parent directories for output files.
pub fn ensure_output_directories(output_files: &[PathBuf]) -> io::Result<()> {
    for output_file in output_files {
        if let Some(parent) = output_file.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

/// One tool call as the runner sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub tool: String,
    pub args: Vec<String>,
    /// Stream lines as they arrive instead of buffering
    pub realtime: bool,
    /// Prefix privileged flag combinations with sudo
    pub use_sudo: bool,
}

impl ToolInvocation {
    pub fn new(tool: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            tool: tool.into(),
            args,
            realtime: false,
            use_sudo: false,
        }
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn sudo(mut self, use_sudo: bool) -> Self {
        self.use_sudo = use_sudo;
        self
    }
}

/// Everything captured from a finished tool.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// The literal command line that was run
    pub command: String,
    /// Output lines (stderr lines when stdout was empty)
    pub lines: Vec<String>,
    pub stderr: Vec<String>,
    /// True when `lines` came from stderr
    pub from_stderr: bool,
    /// Parsed form, if a parser exists for the tool
    pub results: Option<ScanResults>,
}

/// Launches external tools under a shared cancellation token.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    cancel: CancellationToken,
    processes: ActiveProcesses,
    kill_grace: Duration,
    debug: bool,
}

impl ToolRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            processes: ActiveProcesses::new(),
            kill_grace: DEFAULT_KILL_GRACE,
            debug: false,
        }
    }

    /// Registers launched process groups in `processes`.
    pub fn with_processes(mut self, processes: ActiveProcesses) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn processes(&self) -> &ActiveProcesses {
        &self.processes
    }

    /// Streaming is used in debug mode and for tools with a parser.
    pub fn realtime_for(&self, tool: &str) -> bool {
        self.debug || parsers::has_parser(tool)
    }

    /// Runs `invocation` to completion or until cancelled.
    pub async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, EngineError> {
        let argv = build_argv(
            &invocation.tool,
            &invocation.args,
            invocation.use_sudo,
            is_root(),
        );
        let command = argv.join(" ");
        let with_sudo = argv.first().map(String::as_str) == Some("sudo");

        ensure_output_directories(&output_file_args(&invocation.args))?;

        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        debug!("Executing: {}", command);
        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                command: command.clone(),
                source,
            })?;

        let pid = child.id();
        let _guard = pid.map(|pid| self.processes.register(pid, with_sudo));

        let captured = if invocation.realtime {
            self.stream(&invocation.tool, &mut child, pid, with_sudo).await?
        } else {
            self.buffered(child, pid, with_sudo).await?
        };

        let Captured {
            status,
            stdout,
            stderr,
        } = captured;

        if !status.success() {
            error!("'{}' failed with exit code: {:?}", invocation.tool, status.code());
            if !stderr.is_empty() {
                error!("stderr:\n{}", stderr.join("\n"));
            }
            return Err(EngineError::Execution {
                command,
                status: status.to_string(),
                stderr: stderr.join("\n"),
            });
        }

        let (lines, from_stderr) = if stdout.is_empty() && !stderr.is_empty() {
            debug!("'{}' wrote nothing to stdout, using stderr", invocation.tool);
            (stderr.clone(), true)
        } else {
            (stdout, false)
        };

        let results = parsers::parse_output(&invocation.tool, &lines, &invocation.args);
        debug!(
            "'{}' completed: {} lines captured",
            invocation.tool,
            lines.len()
        );

        Ok(ToolOutput {
            command,
            lines,
            stderr,
            from_stderr,
            results,
        })
    }

    async fn stream(
        &self,
        tool: &str,
        child: &mut Child,
        pid: Option<u32>,
        with_sudo: bool,
    ) -> Result<Captured, EngineError> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, out_tx));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, err_tx));
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut out_open = true;
        let mut err_open = true;

        // Readers are not joined on cancellation.
        while out_open || err_open {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.terminate(pid, with_sudo).await;
                    return Err(EngineError::Cancelled);
                }
                line = out_rx.recv(), if out_open => match line {
                    Some(line) => {
                        self.echo(tool, &line);
                        stdout.push(line);
                    }
                    None => out_open = false,
                },
                line = err_rx.recv(), if err_open => match line {
                    Some(line) => {
                        self.echo(tool, &line);
                        stderr.push(line);
                    }
                    None => err_open = false,
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.terminate(pid, with_sudo).await;
                return Err(EngineError::Cancelled);
            }
            status = child.wait() => status?,
        };

        Ok(Captured {
            status,
            stdout,
            stderr,
        })
    }

    async fn buffered(
        &self,
        child: Child,
        pid: Option<u32>,
        with_sudo: bool,
    ) -> Result<Captured, EngineError> {
        let output = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.terminate(pid, with_sudo).await;
                return Err(EngineError::Cancelled);
            }
            output = child.wait_with_output() => output?,
        };

        Ok(Captured {
            status: output.status,
            stdout: split_lines(&output.stdout),
            stderr: split_lines(&output.stderr),
        })
    }

    async fn terminate(&self, pid: Option<u32>, with_sudo: bool) {
        let Some(pid) = pid else {
            return;
        };
        info!("Cancellation requested, stopping process group {}", pid);
        terminate_process_tree(signaller_for(with_sudo), pid, self.kill_grace, Signal::Kill).await;
    }

    fn echo(&self, tool: &str, line: &str) {
        if self.debug {
            info!("[{}] {}", tool, line);
        } else {
            debug!("[{}] {}", tool, line);
        }
    }
}

struct Captured {
    status: ExitStatus,
    stdout: Vec<String>,
    stderr: Vec<String>,
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::tempdir;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_requires_privilege_table() {
        for flag in NMAP_PRIVILEGED_FLAGS {
            assert!(requires_privilege("nmap", &args(&[flag, "x"])), "{flag}");
        }
        assert!(!requires_privilege("nmap", &args(&["-sT", "-sV", "x"])));
        assert!(requires_privilege("masscan", &args(&["-p80"])));
        assert!(!requires_privilege("naabu", &args(&["-sS"])));
    }

    #[test]
    fn test_build_argv_sudo_rules() {
        let syn = args(&["-sS", "10.0.0.1"]);

        assert_eq!(build_argv("nmap", &syn, true, false)[0], "sudo");
        assert_eq!(build_argv("nmap", &syn, false, false)[0], "nmap");
        assert_eq!(build_argv("nmap", &syn, true, true)[0], "nmap");
        assert_eq!(build_argv("nmap", &args(&["-sT"]), true, false)[0], "nmap");
        assert_eq!(
            build_argv("nuclei", &args(&["-u", "x"]), true, false),
            args(&["nuclei", "-u", "x"])
        );
    }

    #[test]
    fn test_output_file_args() {
        let a = args(&[
            "-sV", "-oN", "/tmp/r/nmap/deep.txt", "-oX", "-", "x", "-o", "out/ports.jsonl",
        ]);
        assert_eq!(
            output_file_args(&a),
            vec![
                PathBuf::from("/tmp/r/nmap/deep.txt"),
                PathBuf::from("out/ports.jsonl")
            ]
        );
        assert!(output_file_args(&args(&["-o"])).is_empty());
    }

    #[test]
    fn test_ensure_output_directories() {
        let temp_dir = tempdir().unwrap();
        let nested = temp_dir.path().join("subdir1/subdir2/output.txt");

        ensure_output_directories(&[nested, PathBuf::from("bare.txt")]).unwrap();
        assert!(temp_dir.path().join("subdir1/subdir2").exists());
    }

    #[tokio::test]
    async fn test_streaming_captures_stdout() {
        let runner = ToolRunner::new(CancellationToken::new());
        let invocation =
            ToolInvocation::new("sh", args(&["-c", "echo one; echo two; echo noise 1>&2"])).realtime(true);

        let output = runner.run(&invocation).await.unwrap();
        assert_eq!(output.lines, args(&["one", "two"]));
        assert_eq!(output.stderr, args(&["noise"]));
        assert!(!output.from_stderr);
        assert!(output.results.is_none());
        assert!(runner.processes().is_empty());
    }

    #[tokio::test]
    async fn test_stderr_used_when_stdout_empty() {
        let runner = ToolRunner::new(CancellationToken::new());
        let invocation = ToolInvocation::new("sh", args(&["-c", "echo '{\"port\":22}' 1>&2"])).realtime(true);

        let output = runner.run(&invocation).await.unwrap();
        assert!(output.from_stderr);
        assert_eq!(output.lines, args(&["{\"port\":22}"]));
    }

    #[tokio::test]
    async fn test_buffered_mode() {
        let runner = ToolRunner::new(CancellationToken::new());
        let invocation = ToolInvocation::new("sh", args(&["-c", "printf 'a\\nb\\n'"]));

        let output = runner.run(&invocation).await.unwrap();
        assert_eq!(output.lines, args(&["a", "b"]));
        assert_eq!(output.command, "sh -c printf 'a\\nb\\n'");
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr_and_command() {
        let runner = ToolRunner::new(CancellationToken::new());
        let invocation = ToolInvocation::new("sh", args(&["-c", "echo boom 1>&2; exit 3"])).realtime(true);

        let err = runner.run(&invocation).await.unwrap_err();
        match err {
            EngineError::Execution {
                command, stderr, ..
            } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected execution error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let runner = ToolRunner::new(CancellationToken::new());
        let invocation = ToolInvocation::new("reconflow-no-such-tool", args(&["-x"]));

        let err = runner.run(&invocation).await.unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_creates_output_directories_before_launch() {
        let temp_dir = tempdir().unwrap();
        let out = temp_dir.path().join("naabu/ports.jsonl");
        let runner = ToolRunner::new(CancellationToken::new());
        let invocation = ToolInvocation::new(
            "sh",
            vec![
                "-c".to_string(),
                "true".to_string(),
                "-o".to_string(),
                out.display().to_string(),
            ],
        );

        runner.run(&invocation).await.unwrap();
        assert!(temp_dir.path().join("naabu").is_dir());
    }

    #[tokio::test]
    async fn test_cancellation_stops_streaming_process() {
        let cancel = CancellationToken::new();
        let runner = ToolRunner::new(cancel.clone());
        let invocation =
            ToolInvocation::new("sh", args(&["-c", "echo started; sleep 30"])).realtime(true);

        let started = Instant::now();
        let handle = tokio::spawn(async move { runner.run(&invocation).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancelled_before_launch() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = ToolRunner::new(cancel);

        let err = runner
            .run(&ToolInvocation::new("sh", args(&["-c", "true"])))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_realtime_selection() {
        assert!(ToolRunner::new(CancellationToken::new()).realtime_for("naabu"));
        assert!(!ToolRunner::new(CancellationToken::new()).realtime_for("sh"));
        assert!(ToolRunner::new(CancellationToken::new())
            .with_debug(true)
            .realtime_for("sh"));
    }
}
