use agent_backbone_domain::{RunId, StepId};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;

/// Cooperative cancellation handle handed to every step.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the run is aborted. Never resolves if nobody can abort it anymore.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                if *self.rx.borrow() {
                    return;
                }
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub step_id: StepId,
    pub attempt: u32,
    pub input: Value,
    pub cancel: CancelSignal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    pub output: Value,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl AgentOutput {
    #[must_use]
    pub fn new(output: Value) -> Self {
        Self {
            output,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    #[must_use]
    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AgentFailure {
    pub message: String,
    pub retryable: bool,
}

impl AgentFailure {
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// One automation agent (triage, planner, code generator, resolver, reviewer).
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: StepContext) -> Result<AgentOutput, AgentFailure>;
}
