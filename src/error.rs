use crate::exec::ExecutionError;

/// Why a submission did not produce a successful run.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The submission could not be evaluated at all.
    #[error("{0}")]
    MalformedRequest(String),
    /// The policy denied the command.
    #[error("{0}")]
    PolicyViolation(String),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl GatewayError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            GatewayError::MalformedRequest(_) | GatewayError::PolicyViolation(_) => 1,
            GatewayError::Execution(e) => e.exit_code(),
        }
    }
}
