use crate::{RunId, RunStatus, StepId};

pub type BackboneResult<T> = Result<T, BackboneError>;

/// Coarse error families. Callers branch on these rather than on individual variants.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorCategory {
    Validation,
    Concurrency,
    Policy,
    Execution,
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum BackboneError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("stale state for run {run_id}: expected {expected}, found {actual}")]
    StaleState {
        run_id: RunId,
        expected: RunStatus,
        actual: RunStatus,
    },
    #[error("illegal transition for run {run_id}: {from} -> {to}")]
    IllegalTransition {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("run {run_id} is locked by {holder} until {expires_at}")]
    LockHeld {
        run_id: RunId,
        holder: String,
        expires_at: String,
    },
    #[error("lease on run {run_id} is no longer held by {holder}")]
    LockLost { run_id: RunId, holder: String },
    #[error("idempotency key '{key}' is being processed by another caller")]
    IdempotencyInFlight { key: String },
    #[error("approval invalidated for run {run_id}: {reason}")]
    ApprovalInvalidated { run_id: RunId, reason: String },
    #[error("artifact '{name}' rejected: matched secret pattern '{pattern}'")]
    SecretDetected { name: String, pattern: String },
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("step {step_id} of run {run_id} failed: {reason}")]
    StepFailed {
        run_id: RunId,
        step_id: StepId,
        reason: String,
    },
    #[error("run {run_id} was aborted")]
    Aborted { run_id: RunId },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transient storage error: {0:#}")]
    TransientStorage(anyhow::Error),
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl BackboneError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::SecretDetected { .. } | Self::Configuration(_) => {
                ErrorCategory::Validation
            }
            Self::StaleState { .. }
            | Self::LockHeld { .. }
            | Self::LockLost { .. }
            | Self::IdempotencyInFlight { .. } => ErrorCategory::Concurrency,
            Self::IllegalTransition { .. }
            | Self::ApprovalInvalidated { .. }
            | Self::NotFound { .. } => ErrorCategory::Policy,
            Self::StepFailed { .. } | Self::Aborted { .. } => ErrorCategory::Execution,
            Self::TransientStorage(_) | Self::Storage(_) => ErrorCategory::Storage,
        }
    }

    /// Whether re-reading and retrying the same call can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Concurrency)
            || matches!(self, Self::TransientStorage(_))
    }

    #[must_use]
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<anyhow::Error> for BackboneError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<BackboneError>() {
            Ok(inner) => inner,
            Err(other) => Self::Storage(other),
        }
    }
}
