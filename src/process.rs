//! Child processes with both output pipes drained concurrently.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::StepOutput;

const MAX_CONSECUTIVE_READ_ERRORS: u32 = 16;

/// A command line plus the directory and environment it runs with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit status {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub exit: ProcessExit,
    /// Stdout and stderr lines in arrival order.
    pub combined: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, forwarding output lines to the log per `output`.
    async fn run_streamed(&self, spec: &CommandSpec, output: StepOutput) -> Result<ProcessExit>;

    /// Run to completion, collecting stdout and stderr into one string.
    async fn run_captured(&self, spec: &CommandSpec) -> Result<CapturedOutput>;
}

pub struct TokioCommandRunner;

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl TokioCommandRunner {
    fn spawn(spec: &CommandSpec) -> Result<Child> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.spawn().with_context(|| format!("Failed to start '{}'", spec))
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    #[tracing::instrument(skip(self))]
    async fn run_streamed(&self, spec: &CommandSpec, output: StepOutput) -> Result<ProcessExit> {
        debug!("Running '{}'", spec);
        let mut child = Self::spawn(spec)?;
        let stdout = child.stdout.take().context("Child stdout was not captured")?;
        let stderr = child.stderr.take().context("Child stderr was not captured")?;

        let stdout_task = tokio::spawn(forward_lines(stdout, Stream::Stdout, output));
        let stderr_task = tokio::spawn(forward_lines(stderr, Stream::Stderr, output));

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for '{}'", spec))?;

        join_reader(stdout_task, Stream::Stdout).await;
        join_reader(stderr_task, Stream::Stderr).await;

        let exit = ProcessExit { code: status.code() };
        debug!("'{}' finished with {}", spec, exit);
        Ok(exit)
    }

    #[tracing::instrument(skip(self))]
    async fn run_captured(&self, spec: &CommandSpec) -> Result<CapturedOutput> {
        debug!("Running '{}'", spec);
        let mut child = Self::spawn(spec)?;
        let stdout = child.stdout.take().context("Child stdout was not captured")?;
        let stderr = child.stderr.take().context("Child stderr was not captured")?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(collect_lines(stdout, tx.clone()));
        let stderr_task = tokio::spawn(collect_lines(stderr, tx));

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for '{}'", spec))?;

        join_reader(stdout_task, Stream::Stdout).await;
        join_reader(stderr_task, Stream::Stderr).await;

        let mut combined = String::new();
        while let Some(line) = rx.recv().await {
            combined.push_str(&line);
            combined.push('\n');
        }

        Ok(CapturedOutput {
            exit: ProcessExit { code: status.code() },
            combined,
        })
    }
}

async fn join_reader(task: JoinHandle<()>, stream: Stream) {
    if let Err(e) = task.await {
        debug!("{:?} reader task failed: {}", stream, e);
    }
}

/// Read `reader` to EOF, handing each line to `sink` with invalid UTF-8
/// replaced. The read end stays open until EOF so the child never hits a
/// closed pipe.
async fn drain_lines<Rd, F>(reader: Rd, mut sink: F)
where
    Rd: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut failures = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                failures = 0;
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                sink(String::from_utf8_lossy(&buf).into_owned());
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Error reading child output: {}", e);
                failures += 1;
                if failures >= MAX_CONSECUTIVE_READ_ERRORS {
                    break;
                }
            }
        }
    }
}

async fn forward_lines<Rd>(reader: Rd, stream: Stream, output: StepOutput)
where
    Rd: AsyncRead + Unpin,
{
    drain_lines(reader, |line| match (output, stream) {
        (StepOutput::Quiet, _) => {}
        (StepOutput::Verbose, Stream::Stdout) => info!("{}", line),
        (StepOutput::Verbose, Stream::Stderr) => warn!("{}", line),
    })
    .await;
}

async fn collect_lines<Rd>(reader: Rd, tx: mpsc::UnboundedSender<String>)
where
    Rd: AsyncRead + Unpin,
{
    // A closed receiver only means nobody reads the lines; keep draining.
    drain_lines(reader, |line| {
        let _ = tx.send(line);
    })
    .await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_run_streamed_reports_exit_code() {
        let exit = TokioCommandRunner
            .run_streamed(&sh("echo out; echo err >&2; exit 3"), StepOutput::Verbose)
            .await
            .unwrap();
        assert_eq!(exit.code, Some(3));
        assert!(!exit.success());
    }

    #[tokio::test]
    async fn test_run_streamed_drains_large_output() {
        // More than a pipe buffer on both streams
        let script = "i=0; while [ $i -lt 5000 ]; do echo line-$i; echo err-$i >&2; i=$((i+1)); done";
        let exit = TokioCommandRunner
            .run_streamed(&sh(script), StepOutput::Quiet)
            .await
            .unwrap();
        assert!(exit.success());
    }

    #[tokio::test]
    async fn test_invalid_utf8_does_not_stop_draining() {
        // A non-UTF-8 line followed by more than a pipe buffer of output
        let script = "printf '\\377\\376 latin1\\n'; printf '\\377\\n' >&2; \
                      i=0; while [ $i -lt 20000 ]; do echo line-$i; echo err-$i >&2; i=$((i+1)); done; exit 0";

        let exit = TokioCommandRunner
            .run_streamed(&sh(script), StepOutput::Verbose)
            .await
            .unwrap();
        assert_eq!(exit.code, Some(0));

        let captured = TokioCommandRunner.run_captured(&sh(script)).await.unwrap();
        assert_eq!(captured.exit.code, Some(0));
        assert!(captured.combined.contains("\u{FFFD}\u{FFFD} latin1\n"));
        assert!(captured.combined.contains("line-19999\n"));
        assert!(captured.combined.contains("err-19999\n"));
        assert_eq!(captured.combined.lines().count(), 2 + 2 * 20000);
    }

    #[tokio::test]
    async fn test_run_captured_combines_streams() {
        let captured = TokioCommandRunner
            .run_captured(&sh("echo out; echo err >&2"))
            .await
            .unwrap();
        assert!(captured.exit.success());
        assert!(captured.combined.contains("out\n"));
        assert!(captured.combined.contains("err\n"));
    }

    #[tokio::test]
    async fn test_run_captured_uses_cwd_and_env() {
        let dir = tempdir().unwrap();
        let spec = sh("pwd; echo $JAVA_HOME")
            .current_dir(dir.path())
            .env("JAVA_HOME", "/deps/0/openjdk");

        let captured = TokioCommandRunner.run_captured(&spec).await.unwrap();

        let canonical = dir.path().canonicalize().unwrap();
        assert!(captured.combined.contains(canonical.to_str().unwrap()));
        assert!(captured.combined.contains("/deps/0/openjdk"));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_start() {
        let result = TokioCommandRunner
            .run_captured(&CommandSpec::new("/nonexistent/program"))
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_command_spec_display() {
        let spec = CommandSpec::new("make").args(["-j", "8"]);
        assert_eq!(spec.to_string(), "make -j 8");
    }
}
