pub mod request;
pub mod verdict;

pub use request::{EvaluationRequest, HOST_TARGET, TargetRef, UNKNOWN_PRINCIPAL};
pub use verdict::{Outcome, POLICY_SATISFIED, Verdict};

use crate::policy::PolicySet;

/// Prefix of every denial for a request that cannot be evaluated at all.
pub const MALFORMED_REQUEST: &str = "malformed request";

/// Reject requests that are structurally unusable before any policy lookup.
pub fn malformed_reason(request: &EvaluationRequest) -> Option<String> {
    if request.command.trim().is_empty() {
        return Some(format!("{MALFORMED_REQUEST}: empty command"));
    }
    if request.target_node.trim().is_empty() {
        return Some(format!("{MALFORMED_REQUEST}: empty target node"));
    }
    if request.command.contains('\0') || request.arguments.iter().any(|a| a.contains('\0')) {
        return Some(format!("{MALFORMED_REQUEST}: NUL byte in command line"));
    }
    None
}

/// Decide whether a request may run.
///
/// 1. Malformed request → DENY
/// 2. Program not in the policy set → DENY
/// 3. An abbreviated long option matching several options → DENY
/// 4. Argument rules in declared order → first violation DENY
/// 5. Policy defaults for omitted flags are prepended → ALLOW
///
/// Pure: the same policy set and request always give the same verdict.
pub fn evaluate(policies: &PolicySet, request: &EvaluationRequest) -> Verdict {
    if let Some(reason) = malformed_reason(request) {
        return Verdict::deny(reason);
    }

    let Some(policy) = policies.lookup(&request.command) else {
        return Verdict::deny(format!("command not allowed: {}", request.command));
    };

    let parsed = policy.parse(&request.arguments);

    if let Some(token) = parsed.ambiguous_options().first() {
        return Verdict::deny(format!("ambiguous option abbreviation: {token}"));
    }

    for rule in &policy.rules {
        if let Some(reason) = rule.violation(&parsed, &policy.grammar) {
            return Verdict::deny(reason);
        }
    }

    // Defaults go in front so they stay options even after a caller's `--`
    let mut effective = Vec::with_capacity(request.arguments.len() + 4);
    for default in &policy.default_arguments {
        if !parsed.has_option(&default.flag) {
            effective.push(default.flag.clone());
            effective.push(default.value.clone());
        }
    }
    if let Some(output) = &policy.default_output
        && !parsed.has_option(&policy.grammar.canonical(&output.flag))
    {
        effective.push(output.flag.clone());
        effective.push(output.render(&request.target_node, request.submitted_at));
    }
    effective.extend(request.arguments.iter().cloned());

    Verdict::allow(effective)
}
