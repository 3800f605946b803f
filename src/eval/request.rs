use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Principal recorded when the caller's identity is not known.
pub const UNKNOWN_PRINCIPAL: &str = "unknown";

/// Sentinel spelling of a host-level target.
pub const HOST_TARGET: &str = "host";

/// Where the command runs: the node's own network namespace, or a pod's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    Host,
    Pod { namespace: String, name: String },
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRef::Host => f.write_str(HOST_TARGET),
            TargetRef::Pod { namespace, name } => write!(f, "{namespace}/{name}"),
        }
    }
}

impl FromStr for TargetRef {
    type Err = String;

    /// `host` or `<namespace>/<pod>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == HOST_TARGET {
            return Ok(TargetRef::Host);
        }
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(TargetRef::Pod {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(format!("target must be 'host' or '<namespace>/<pod>', got '{s}'")),
        }
    }
}

/// One command submission, as handed to the evaluator.
///
/// Immutable once built. `arguments` are exactly what the caller supplied;
/// any policy-driven additions live only in the resulting verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationRequest {
    /// Ties every audit event of this invocation together.
    pub correlation_id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub principal: String,
    pub target_node: String,
    pub target: TargetRef,
    pub command: String,
    pub arguments: Vec<String>,
}

impl EvaluationRequest {
    /// Build a request stamped with the current time and a fresh correlation id.
    /// An empty principal is recorded as [`UNKNOWN_PRINCIPAL`].
    pub fn new(
        principal: impl Into<String>,
        target_node: impl Into<String>,
        target: TargetRef,
        command: impl Into<String>,
        arguments: Vec<String>,
    ) -> Self {
        let principal = principal.into();
        let principal = if principal.trim().is_empty() {
            UNKNOWN_PRINCIPAL.to_string()
        } else {
            principal
        };
        Self {
            correlation_id: Uuid::new_v4(),
            submitted_at: Utc::now(),
            principal,
            target_node: target_node.into(),
            target,
            command: command.into(),
            arguments,
        }
    }

    /// Replace the submission time (tests, replays).
    pub fn with_submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_at = at;
        self
    }
}
