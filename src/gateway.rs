//! Request orchestration: receive, evaluate, audit, execute, audit.
//!
//! Every submission produces an EXECUTE-ATTEMPT event on receipt and exactly
//! one ALLOW or DENY event before anything runs. Allowed runs add one
//! SUCCESS or FAILURE event when they end. All events of one submission
//! share its correlation id.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::audit::{Action, AuditEvent, AuditRecorder, AuditSink, FileSink, NullSink};
use crate::config::Config;
use crate::error::GatewayError;
use crate::eval::{self, EvaluationRequest, MALFORMED_REQUEST, Outcome, TargetRef, Verdict};
use crate::exec::{CancelFlag, ExecutionResult, Executor, Invocation};
use crate::policy::{PolicySet, PolicyStore};

/// A submission as received from a caller. Every field is optional on the
/// wire; missing required fields make the request malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Submission {
    pub principal: Option<String>,
    pub target_node: Option<String>,
    /// `host` or `<namespace>/<pod>`; absent means host.
    pub target_pod_ref: Option<String>,
    pub command: Option<String>,
    pub arguments: Option<Vec<String>>,
    pub timeout_seconds: Option<u64>,
}

impl Submission {
    /// A complete submission.
    pub fn new(
        principal: impl Into<String>,
        target_node: impl Into<String>,
        target: &TargetRef,
        command: impl Into<String>,
        arguments: Vec<String>,
    ) -> Self {
        Self {
            principal: Some(principal.into()),
            target_node: Some(target_node.into()),
            target_pod_ref: Some(target.to_string()),
            command: Some(command.into()),
            arguments: Some(arguments),
            timeout_seconds: None,
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// The request to evaluate, plus the reason it is malformed when its
    /// shape alone rules it out. A malformed submission still yields a
    /// request so the denial can be audited.
    fn into_request(self) -> (EvaluationRequest, Option<String>) {
        let mut malformed = None;
        if self.arguments.is_none() {
            malformed = Some(format!("{MALFORMED_REQUEST}: arguments missing"));
        }
        let target = match self.target_pod_ref.as_deref().unwrap_or_default().parse() {
            Ok(target) => target,
            Err(e) => {
                malformed.get_or_insert(format!("{MALFORMED_REQUEST}: {e}"));
                TargetRef::Host
            }
        };
        let request = EvaluationRequest::new(
            self.principal.unwrap_or_default(),
            self.target_node.unwrap_or_default(),
            target,
            self.command.unwrap_or_default(),
            self.arguments.unwrap_or_default(),
        );
        (request, malformed)
    }
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Present once something was (or failed to be) executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    pub correlation_id: Uuid,
    #[serde(skip)]
    pub stdout: String,
    #[serde(skip)]
    pub stderr: String,
}

impl Response {
    fn from_verdict(request: &EvaluationRequest, verdict: &Verdict) -> Self {
        Self {
            outcome: verdict.outcome,
            reason: Some(verdict.reason.clone()),
            exit_code: None,
            artifacts: Vec::new(),
            correlation_id: request.correlation_id,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// The process exit status this response maps to.
    pub fn status_code(&self) -> i32 {
        match self.outcome {
            Outcome::Deny => 1,
            Outcome::Allow => self.exit_code.unwrap_or(0),
        }
    }
}

/// The policy gateway.
pub struct Gateway {
    store: Arc<PolicyStore>,
    recorder: AuditRecorder,
    executor: Executor,
}

impl Gateway {
    pub fn new(store: Arc<PolicyStore>, recorder: AuditRecorder, executor: Executor) -> Self {
        Self {
            store,
            recorder,
            executor,
        }
    }

    /// Wire a gateway from configuration: file audit sink, crictl resolver.
    pub fn from_config(config: &Config) -> Self {
        let sink: Box<dyn AuditSink> = match config.audit_log_path() {
            Some(path) => Box::new(FileSink::new(path)),
            None => {
                log::warn!("audit_log is empty; audit events only go to the mirror");
                Box::new(NullSink)
            }
        };
        Self::new(
            Arc::new(PolicyStore::new(PolicySet::from_config(config))),
            AuditRecorder::new(Some(sink), config.settings.mirror),
            Executor::from_config(config),
        )
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Install a new policy set; submissions already evaluating keep theirs.
    pub fn reload(&self, config: &Config) {
        self.store.replace(PolicySet::from_config(config));
        log::info!("policy set reloaded");
    }

    /// Evaluate and audit a submission without executing it.
    pub fn check(&self, submission: Submission) -> Response {
        let (request, malformed) = submission.into_request();
        let policies = self.store.current();
        let verdict = self.decide(&policies, &request, malformed);
        Response::from_verdict(&request, &verdict)
    }

    /// Evaluate a submission and, if allowed, run it to completion.
    pub fn submit(&self, submission: Submission, cancel: &CancelFlag) -> Response {
        let timeout = submission
            .timeout_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let (request, malformed) = submission.into_request();
        self.recorder
            .record(&AuditEvent::new(&request, Action::ExecuteAttempt));

        let policies = self.store.current();
        let verdict = self.decide(&policies, &request, malformed);
        let mut response = Response::from_verdict(&request, &verdict);
        if !verdict.is_allowed() {
            return response;
        }

        let Some(policy) = policies.lookup(&request.command) else {
            // An allow always names a policy in this snapshot
            return response;
        };
        if let Some(risk) = &policy.risk {
            log::warn!("{} allowed despite known risk: {risk}", policy.name);
        }
        let timeout = timeout.or(policy.default_timeout);
        let output_file = verdict.effective_arguments.as_deref().and_then(|args| {
            let flag = policy.default_output.as_ref()?;
            let parsed = policy.parse(args);
            parsed
                .option_value(&policy.grammar.canonical(&flag.flag))
                .map(PathBuf::from)
        });

        match self.run(&request, &verdict, output_file, timeout, cancel) {
            Ok(result) => {
                let artifacts: Vec<String> = result
                    .artifacts
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                let action = if result.success() {
                    Action::Success
                } else {
                    Action::Failure
                };
                self.recorder.record(
                    &AuditEvent::new(&request, action)
                        .with_reason(result.summary())
                        .with_exit_code(result.exit_code)
                        .with_artifacts(artifacts.clone()),
                );
                response.reason = Some(result.summary());
                response.exit_code = Some(result.exit_code);
                response.artifacts = artifacts;
                response.stdout = result.stdout.text;
                response.stderr = result.stderr.text;
            }
            Err(e) => {
                log::error!("{}: {e}", request.command);
                self.recorder.record(
                    &AuditEvent::new(&request, Action::Failure)
                        .with_reason(e.to_string())
                        .with_exit_code(e.exit_code()),
                );
                response.reason = Some(e.to_string());
                response.exit_code = Some(e.exit_code());
            }
        }
        response
    }

    /// Evaluate and record the ALLOW/DENY event.
    fn decide(
        &self,
        policies: &PolicySet,
        request: &EvaluationRequest,
        malformed: Option<String>,
    ) -> Verdict {
        let verdict = match malformed {
            Some(reason) => Verdict::deny(reason),
            None => eval::evaluate(policies, request),
        };
        let action = match verdict.outcome {
            Outcome::Allow => Action::Allow,
            Outcome::Deny => Action::Deny,
        };
        log::info!(
            "{} {} {} by {}: {}",
            verdict.outcome.label(),
            request.correlation_id,
            request.command,
            request.principal,
            verdict.reason
        );
        self.recorder
            .record(&AuditEvent::new(request, action).with_reason(verdict.reason.clone()));
        verdict
    }

    fn run(
        &self,
        request: &EvaluationRequest,
        verdict: &Verdict,
        output_file: Option<PathBuf>,
        timeout: Option<Duration>,
        cancel: &CancelFlag,
    ) -> Result<ExecutionResult, GatewayError> {
        let invocation = Invocation::from_verdict(request, verdict, output_file)?;
        Ok(self.executor.execute(&invocation, timeout, cancel)?)
    }
}
