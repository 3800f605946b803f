//! Append-only audit trail.
//!
//! Every evaluation and every execution outcome becomes one JSON object on
//! one line. Lines go to the primary sink (normally a file) and are
//! mirrored to a live channel for tailing. Audit failures never fail the
//! request: a broken sink degrades to the mirror (or stdout) and a warning.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::MirrorTarget;
use crate::eval::EvaluationRequest;

/// Greppable marker on denials.
pub const VIOLATION_MARKER: &str = "VIOLATION";
/// Greppable marker on every other event.
pub const EXECUTE_MARKER: &str = "EXECUTE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    #[serde(rename = "EXECUTE-ATTEMPT")]
    ExecuteAttempt,
    #[serde(rename = "ALLOW")]
    Allow,
    #[serde(rename = "DENY")]
    Deny,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::ExecuteAttempt => "EXECUTE-ATTEMPT",
            Action::Allow => "ALLOW",
            Action::Deny => "DENY",
            Action::Success => "SUCCESS",
            Action::Failure => "FAILURE",
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            Action::Deny => VIOLATION_MARKER,
            _ => EXECUTE_MARKER,
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    /// UTC, RFC 3339, second precision.
    pub timestamp: String,
    pub correlation_id: Uuid,
    pub principal: String,
    pub target_node: String,
    pub target_pod_ref: String,
    pub action: Action,
    pub marker: &'static str,
    pub command: String,
    /// Arguments as submitted, before any policy-driven additions.
    pub arguments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
}

impl AuditEvent {
    /// An event for `request`, stamped now.
    pub fn new(request: &EvaluationRequest, action: Action) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            correlation_id: request.correlation_id,
            principal: request.principal.clone(),
            target_node: request.target_node.clone(),
            target_pod_ref: request.target.to_string(),
            action,
            marker: action.marker(),
            command: request.command.clone(),
            arguments: request.arguments.clone(),
            reason: None,
            exit_code: None,
            artifacts: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Failure to persist an audit line.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("cannot open audit log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write audit log {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write audit line to {stream}: {source}")]
    Stream {
        stream: &'static str,
        source: std::io::Error,
    },
}

/// Destination for serialized audit lines.
///
/// Implementations must write each line atomically with respect to other
/// callers: concurrent `write_line` calls never interleave.
pub trait AuditSink: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), SinkError>;
}

/// Appends lines to a file, creating it (and its directory) on first use.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, SinkError> {
        if let Some(dir) = self.path.parent() {
            // Best-effort; the open below reports the real error
            let _ = std::fs::create_dir_all(dir);
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| SinkError::Open {
                path: self.path.clone(),
                source,
            })
    }
}

impl AuditSink for FileSink {
    fn write_line(&self, line: &str) -> Result<(), SinkError> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        let result = file.write_all(buf.as_bytes()).and_then(|()| file.flush());
        if let Err(source) = result {
            // Reopen on the next event (the file may have been rotated away)
            *guard = None;
            return Err(SinkError::Write {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}

/// Keeps lines in memory. Used by tests and embedders.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemorySink {
    fn write_line(&self, line: &str) -> Result<(), SinkError> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
        Ok(())
    }
}

/// Discards every line; only the mirror sees events.
pub struct NullSink;

impl AuditSink for NullSink {
    fn write_line(&self, _line: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// One of the process's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdout,
    Stderr,
}

impl AuditSink for StdStream {
    fn write_line(&self, line: &str) -> Result<(), SinkError> {
        // Locked writeln keeps each line whole under concurrent callers
        let (stream, result) = match self {
            StdStream::Stdout => ("stdout", writeln!(std::io::stdout().lock(), "{line}")),
            StdStream::Stderr => ("stderr", writeln!(std::io::stderr().lock(), "{line}")),
        };
        result.map_err(|source| SinkError::Stream { stream, source })
    }
}

impl<T: AuditSink + ?Sized> AuditSink for std::sync::Arc<T> {
    fn write_line(&self, line: &str) -> Result<(), SinkError> {
        (**self).write_line(line)
    }
}

/// Writes every event to the primary sink and mirrors it to a live channel.
pub struct AuditRecorder {
    primary: Option<Box<dyn AuditSink>>,
    mirror: MirrorTarget,
    stdout: Box<dyn AuditSink>,
    stderr: Box<dyn AuditSink>,
}

impl AuditRecorder {
    pub fn new(primary: Option<Box<dyn AuditSink>>, mirror: MirrorTarget) -> Self {
        Self {
            primary,
            mirror,
            stdout: Box::new(StdStream::Stdout),
            stderr: Box::new(StdStream::Stderr),
        }
    }

    /// A recorder that only mirrors.
    pub fn mirror_only(mirror: MirrorTarget) -> Self {
        Self::new(None, mirror)
    }

    /// Send the live channel somewhere other than the process's stdout and
    /// stderr.
    pub fn with_streams(mut self, stdout: Box<dyn AuditSink>, stderr: Box<dyn AuditSink>) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Record one event. Never fails; sink problems are logged and the
    /// line is still emitted on a secondary channel.
    pub fn record(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                log::error!("cannot serialize audit event {}: {e}", event.action.as_str());
                return;
            }
        };
        log::debug!(
            "audit {} {} {}",
            event.correlation_id,
            event.action.as_str(),
            event.command
        );

        let target = match &self.primary {
            Some(primary) => match primary.write_line(&line) {
                Ok(()) => self.mirror,
                Err(e) => {
                    log::warn!("audit sink failure, falling back to live channel: {e}");
                    match self.mirror {
                        MirrorTarget::None => MirrorTarget::Stdout,
                        other => other,
                    }
                }
            },
            None => self.mirror,
        };
        self.emit(target, &line);
    }

    fn emit(&self, target: MirrorTarget, line: &str) {
        let stream = match target {
            MirrorTarget::Stdout => &self.stdout,
            MirrorTarget::Stderr => &self.stderr,
            MirrorTarget::None => return,
        };
        if let Err(e) = stream.write_line(line) {
            log::warn!("{e}");
        }
    }
}
