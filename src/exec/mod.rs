//! Execution adapter: runs an allowed command and reports how it ended.
//!
//! The adapter owns the timeout. A run that is still going when the
//! timeout elapses is asked to stop (SIGTERM, so capture tools flush their
//! files), then killed after a grace period, and always reaped. Ending by
//! timeout is a normal completion for bounded captures, not a failure.

pub mod capture;
pub mod netns;

pub use capture::CapturedOutput;
pub use netns::{CrictlResolver, NetnsResolver};

use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

use crate::config::Config;
use crate::eval::{EvaluationRequest, TargetRef, Verdict};

/// Exit code reported when the tool could not be started at all.
pub const EXIT_NOT_STARTED: i32 = 127;
/// Exit code reported when the run was cancelled by the caller.
pub const EXIT_CANCELLED: i32 = 130;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("verdict does not allow execution")]
    NotAllowed,
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("error waiting for {program}: {source}")]
    Wait {
        program: String,
        source: std::io::Error,
    },
    #[error("cannot resolve network namespace of {target}: {reason}")]
    Resolve { target: String, reason: String },
}

impl ExecutionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionError::NotAllowed => 1,
            _ => EXIT_NOT_STARTED,
        }
    }
}

/// Shared cancellation signal for an in-flight run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
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

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The tool exited by itself.
    Exited,
    /// The timeout elapsed and the tool was stopped; counts as success.
    TimedOut,
    /// The caller cancelled the run.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub termination: Termination,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// Files the run left in its output directory.
    pub artifacts: Vec<PathBuf>,
    pub elapsed: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.termination != Termination::Cancelled
    }

    pub fn completed_by_timeout(&self) -> bool {
        self.termination == Termination::TimedOut
    }

    /// One-line summary for audit reasons and responses.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        match self.termination {
            Termination::Exited => parts.push(format!("exit code {}", self.exit_code)),
            Termination::TimedOut => parts.push(format!(
                "completed by timeout after {}s",
                self.elapsed.as_secs()
            )),
            Termination::Cancelled => parts.push("cancelled".to_string()),
        }
        let stderr = self.stderr.text.trim();
        if !self.success() && !stderr.is_empty() {
            let head: String = stderr.chars().take(200).collect();
            parts.push(format!("stderr: {}", head.replace('\n', "; ")));
        }
        parts.join(", ")
    }
}

/// What to run: built only from an allowing verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub arguments: Vec<String>,
    pub target: TargetRef,
    /// Output file named by the effective arguments, for artifact listing.
    pub output_file: Option<PathBuf>,
}

impl Invocation {
    /// The invocation an allowing verdict permits. A denial yields
    /// [`ExecutionError::NotAllowed`] and nothing is ever launched for it.
    pub fn from_verdict(
        request: &EvaluationRequest,
        verdict: &Verdict,
        output_file: Option<PathBuf>,
    ) -> Result<Self, ExecutionError> {
        let arguments = match (&verdict.effective_arguments, verdict.is_allowed()) {
            (Some(args), true) => args.clone(),
            _ => return Err(ExecutionError::NotAllowed),
        };
        Ok(Self {
            program: request.command.clone(),
            arguments,
            target: request.target.clone(),
            output_file,
        })
    }
}

/// Runs invocations with an enforced timeout.
pub struct Executor {
    output_limit: usize,
    kill_grace: Duration,
    nsenter: String,
    resolver: Box<dyn NetnsResolver>,
}

impl Executor {
    pub fn new(
        output_limit: usize,
        kill_grace: Duration,
        nsenter: impl Into<String>,
        resolver: Box<dyn NetnsResolver>,
    ) -> Self {
        Self {
            output_limit,
            kill_grace,
            nsenter: nsenter.into(),
            resolver,
        }
    }

    /// Build an executor from configuration, resolving pods with crictl.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.settings.output_limit_bytes,
            Duration::from_secs(config.settings.kill_grace_secs),
            config.execution.nsenter.clone(),
            Box::new(CrictlResolver::new(config.execution.crictl.clone())),
        )
    }

    /// The command line that will actually be launched.
    fn command(&self, invocation: &Invocation) -> Result<Command, ExecutionError> {
        let mut cmd = match &invocation.target {
            TargetRef::Host => Command::new(&invocation.program),
            TargetRef::Pod { namespace, name } => {
                let pid = self.resolver.resolve(namespace, name)?;
                let mut cmd = Command::new(&self.nsenter);
                cmd.arg("--target")
                    .arg(pid.to_string())
                    .arg("--net")
                    .arg("--")
                    .arg(&invocation.program);
                cmd
            }
        };
        cmd.args(&invocation.arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group: terminal signals reach us, not the tool,
            // and stopping the run reaches everything it started
            .process_group(0);
        Ok(cmd)
    }

    /// Run an invocation, stopping it when `timeout` elapses or `cancel` is set.
    pub fn execute(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
        cancel: &CancelFlag,
    ) -> Result<ExecutionResult, ExecutionError> {
        let mut cmd = self.command(invocation)?;
        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ExecutionError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;
        log::info!(
            "started {} (pid {}) timeout={:?}",
            invocation.program,
            child.id(),
            timeout
        );

        let stdout = child
            .stdout
            .take()
            .map(|p| capture::spawn_reader(p, self.output_limit));
        let stderr = child
            .stderr
            .take()
            .map(|p| capture::spawn_reader(p, self.output_limit));

        let deadline = timeout.map(|t| start + t);
        let (status, termination) = loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    // Background children may still hold the output pipes open
                    let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
                    break (status, Termination::Exited);
                }
                Ok(None) => {}
                Err(source) => {
                    let _ = self.stop(&mut child);
                    return Err(ExecutionError::Wait {
                        program: invocation.program.clone(),
                        source,
                    });
                }
            }
            if cancel.is_cancelled() {
                log::warn!("cancelling {} (pid {})", invocation.program, child.id());
                break (self.stop_reaped(&mut child, &invocation.program)?, Termination::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                log::info!("timeout reached for {} (pid {})", invocation.program, child.id());
                break (self.stop_reaped(&mut child, &invocation.program)?, Termination::TimedOut);
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stdout = capture::join_reader(stdout);
        let stderr = capture::join_reader(stderr);
        let exit_code = match termination {
            Termination::Exited => exit_code(status),
            Termination::TimedOut => 0,
            Termination::Cancelled => EXIT_CANCELLED,
        };
        let artifacts = invocation
            .output_file
            .as_deref()
            .map(list_artifacts)
            .unwrap_or_default();

        Ok(ExecutionResult {
            exit_code,
            termination,
            stdout,
            stderr,
            artifacts,
            elapsed: start.elapsed(),
        })
    }

    fn stop_reaped(&self, child: &mut Child, program: &str) -> Result<ExitStatus, ExecutionError> {
        self.stop(child).map_err(|source| ExecutionError::Wait {
            program: program.to_string(),
            source,
        })
    }

    /// SIGTERM the process group, wait out the grace period, then SIGKILL.
    /// Returns once the child has been reaped.
    fn stop(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        let pgid = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            log::debug!("SIGTERM to group {pgid} failed: {e}");
        }
        let grace_end = Instant::now() + self.kill_grace;
        while Instant::now() < grace_end {
            if let Some(status) = child.try_wait()? {
                // Leftover group members do not outlive the run
                let _ = killpg(pgid, Signal::SIGKILL);
                return Ok(status);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        log::warn!("pid {} ignored SIGTERM; killing", child.id());
        let _ = killpg(pgid, Signal::SIGKILL);
        let _ = child.kill();
        child.wait()
    }
}

/// Exit code of a finished child; `128 + signal` when killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

/// Files in the output file's directory whose name starts with the output
/// file's name (tcpdump rotation appends numeric suffixes).
fn list_artifacts(output_file: &Path) -> Vec<PathBuf> {
    let (Some(dir), Some(stem)) = (output_file.parent(), output_file.file_name()) else {
        return Vec::new();
    };
    let stem = stem.to_string_lossy();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("cannot list artifacts in {}: {e}", dir.display());
            return Vec::new();
        }
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with(&*stem))
        .map(|e| e.path())
        .collect();
    found.sort();
    found
}
