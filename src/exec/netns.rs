//! Pod network-namespace lookup.
//!
//! The gateway does not scan /proc itself; it asks the node's container
//! runtime for the pod sandbox's pid and enters its network namespace with
//! `nsenter`.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use super::ExecutionError;
use super::capture::{join_reader, spawn_reader};

/// Resolves a pod to a pid whose network namespace commands should join.
pub trait NetnsResolver: Send + Sync {
    fn resolve(&self, namespace: &str, pod: &str) -> Result<u32, ExecutionError>;
}

/// Resolver backed by `crictl` on the node.
pub struct CrictlResolver {
    crictl: String,
    timeout: Duration,
}

impl CrictlResolver {
    pub fn new(crictl: impl Into<String>) -> Self {
        Self {
            crictl: crictl.into(),
            timeout: Duration::from_secs(15),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, String> {
        run_with_timeout(&self.crictl, args, self.timeout)
    }
}

impl NetnsResolver for CrictlResolver {
    fn resolve(&self, namespace: &str, pod: &str) -> Result<u32, ExecutionError> {
        let target = format!("{namespace}/{pod}");
        let fail = |reason: String| ExecutionError::Resolve {
            target: target.clone(),
            reason,
        };

        let ids = self
            .run(&["pods", "--name", pod, "--namespace", namespace, "--state", "ready", "-q"])
            .map_err(fail)?;
        let sandbox = single_sandbox(&ids).map_err(fail)?;
        let inspect = self.run(&["inspectp", sandbox]).map_err(fail)?;
        sandbox_pid(&inspect).map_err(fail)
    }
}

/// Exactly one sandbox id from `crictl pods -q` output.
fn single_sandbox(ids: &str) -> Result<&str, String> {
    let mut lines = ids.lines().map(str::trim).filter(|l| !l.is_empty());
    match (lines.next(), lines.next()) {
        (Some(id), None) => Ok(id),
        (None, _) => Err("no ready pod sandbox found".into()),
        (Some(_), Some(_)) => Err("pod name matches more than one sandbox".into()),
    }
}

/// `info.pid` from `crictl inspectp` JSON.
fn sandbox_pid(json: &str) -> Result<u32, String> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("unreadable inspectp output: {e}"))?;
    value["info"]["pid"]
        .as_u64()
        .filter(|pid| *pid > 0)
        .and_then(|pid| u32::try_from(pid).ok())
        .ok_or_else(|| "inspectp output has no sandbox pid".to_string())
}

/// Run a helper command with a timeout, killing it if it exceeds the bound.
fn run_with_timeout(program: &str, args: &[&str], timeout: Duration) -> Result<String, String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn {program}: {e}"))?;
    let stdout = child.stdout.take().map(|p| spawn_reader(p, 1 << 20));
    let stderr = child.stderr.take().map(|p| spawn_reader(p, 4096));
    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("{program} timed out after {}s", timeout.as_secs()));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(format!("error waiting for {program}: {e}")),
        }
    };
    let stdout = join_reader(stdout);
    if !status.success() {
        let stderr = join_reader(stderr);
        let sub = args.first().copied().unwrap_or_default();
        return Err(format!("{program} {sub} failed ({status}): {}", stderr.text.trim()));
    }
    Ok(stdout.text)
}
