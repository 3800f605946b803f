use serde::Serialize;

/// Reason attached to every allow.
pub const POLICY_SATISFIED: &str = "policy satisfied";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Allow,
    Deny,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Allow => "allow",
            Outcome::Deny => "deny",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Outcome::Allow => "ALLOW",
            Outcome::Deny => "DENY",
        }
    }
}

/// The evaluator's decision.
///
/// `effective_arguments` is only ever `Some` for [`Outcome::Allow`]: it is
/// the argument list to execute, after policy-driven defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub reason: String,
    pub effective_arguments: Option<Vec<String>>,
}

impl Verdict {
    pub fn allow(effective_arguments: Vec<String>) -> Self {
        Self {
            outcome: Outcome::Allow,
            reason: POLICY_SATISFIED.into(),
            effective_arguments: Some(effective_arguments),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Deny,
            reason: reason.into(),
            effective_arguments: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allow
    }
}
