//! node-debug-gate: a policy gateway for privileged network-debugging tools.
//!
//! Namespace-scoped users submit a tool invocation (`tcpdump`, `ncat`, `ip`,
//! `ifconfig`) against a cluster node. The gateway parses the argument list,
//! evaluates it against a default-deny allowlist, audits the verdict, and
//! only on [`eval::Outcome::Allow`] runs the tool under an enforced timeout.
//!
//! # Architecture
//!
//! - **[`parse`]**: getopt-style argument parsing over already-tokenized arguments.
//! - **[`policy`]**: per-program policies, argument rules, capture profiles, live reload.
//! - **[`eval`]**: requests, verdicts, and the pure evaluator.
//! - **[`audit`]**: JSON-lines audit trail with a mirrored live channel.
//! - **[`exec`]**: process launch, timeouts, pod network-namespace entry.
//! - **[`gateway`]**: orchestration of the above per submission.
//! - **[`config`]**: embedded defaults + user overlay merge.
//! - **[`logging`]**: diagnostic stderr logging.

/// Audit events, sinks, and the recorder.
pub mod audit;
/// Configuration types, loading, and overlay merge logic.
pub mod config;
/// Gateway-level error taxonomy.
pub mod error;
/// Evaluation requests, verdicts, and the evaluator.
pub mod eval;
/// Execution adapter: bounded runs of allowed commands.
pub mod exec;
/// Submission handling and audit ordering.
pub mod gateway;
/// Diagnostic logger setup.
pub mod logging;
/// Argument parsing and command-line tokenizing.
pub mod parse;
/// Policy model and the live policy store.
pub mod policy;

use eval::{EvaluationRequest, Verdict};

/// Evaluate a request against the embedded default policies.
///
/// This is the main entry point for tests and simple usage.
/// For user configuration or a capture profile, build a [`policy::PolicySet`] directly.
pub fn evaluate(request: &EvaluationRequest) -> Verdict {
    let policies = policy::PolicySet::default_policies();
    eval::evaluate(&policies, request)
}
