use std::time::Duration;

use agent_backbone_domain::{
    AbortPrecedence, BackboneError, BackboneResult, LockLease, RunStatus, StepId, StepRecord,
};
use agent_backbone_store_core::{BackboneStore, CheckpointStore, RunStore, StepOutcome};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{Agent, AgentOutput, CancelSignal, RetryPolicy, RunLedger, StepContext};

const REASON_TIMEOUT: &str = "timeout";
const REASON_ABORTED: &str = "aborted";
const REASON_AGENT_ERROR: &str = "agent_error";

enum AttemptResult {
    Completed(AgentOutput),
    Failed {
        reason: String,
        error: String,
        retryable: bool,
    },
    Aborted {
        reason: &'static str,
        error: String,
    },
}

enum Interrupt {
    Abort,
    Deadline,
}

impl<S: BackboneStore> RunLedger<S> {
    /// Execute one agent step for the run `lease` covers.
    ///
    /// Each attempt is a new step row. Failures are retried with backoff while
    /// the agent says they are retryable and attempts remain; after that the
    /// run is failed. An abort observed while the step is in flight ends the
    /// dispatch with [`BackboneError::Aborted`].
    ///
    /// # Errors
    /// `LockLost` without a live lease, `StepFailed` once retries are
    /// exhausted, `Aborted` when the run is aborted.
    #[tracing::instrument(skip_all, fields(run_id = %lease.run_id, agent = agent.name()))]
    pub async fn dispatch_step(
        &self,
        lease: &LockLease,
        agent: &dyn Agent,
        input: Value,
    ) -> BackboneResult<StepRecord> {
        let run_id = lease.run_id;
        let name = agent.name().to_string();
        let timeout = self.config.step.timeout_for(&name);
        let policy = RetryPolicy::from(&self.config.step.retry);
        let precedence = self.config.step.abort_precedence;
        let mut cancel = self.cancel_signal(run_id)?;
        let mut attempt = 1_u32;

        loop {
            self.ensure_lease(lease)?;
            if cancel.is_cancelled() {
                return Err(BackboneError::Aborted { run_id });
            }

            let now = self.now();
            let (step, _) = self.with_store("start_step", |store| {
                store.start_step(run_id, &name, attempt, &input, &lease.holder, now)
            })?;
            info!(step_id = %step.step_id, attempt, "step dispatched");

            let ctx = StepContext {
                run_id,
                step_id: step.step_id,
                attempt,
                input: input.clone(),
                cancel: cancel.clone(),
            };

            match run_attempt(agent, ctx, timeout, &mut cancel, precedence).await {
                AttemptResult::Completed(output) => {
                    return self.complete_step(lease, &step, &name, attempt, output);
                }
                AttemptResult::Aborted { reason, error } => {
                    self.record_failure(step.step_id, reason, &error, &lease.holder)?;
                    warn!(step_id = %step.step_id, reason, "in-flight step stopped by abort");
                    return Err(BackboneError::Aborted { run_id });
                }
                AttemptResult::Failed {
                    reason,
                    error,
                    retryable,
                } => {
                    self.record_failure(step.step_id, &reason, &error, &lease.holder)?;
                    if retryable && policy.allows_another(attempt) {
                        let delay = policy.next_delay(attempt);
                        warn!(
                            step_id = %step.step_id,
                            attempt,
                            reason = %reason,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            "step failed, retrying"
                        );
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {}
                            () = cancel.cancelled() => return Err(BackboneError::Aborted { run_id }),
                        }
                        attempt += 1;
                        continue;
                    }
                    return Err(self.fail_after_step(lease, step.step_id, &name, attempt, reason));
                }
            }
        }
    }

    fn complete_step(
        &self,
        lease: &LockLease,
        step: &StepRecord,
        agent: &str,
        attempt: u32,
        output: AgentOutput,
    ) -> BackboneResult<StepRecord> {
        let run_id = lease.run_id;
        let outcome = StepOutcome::Completed {
            output: output.output.clone(),
            tokens_in: output.tokens_in,
            tokens_out: output.tokens_out,
        };
        let now = self.now();
        let (finished, _) = self.with_store("finish_step", |store| {
            store.finish_step(step.step_id, &outcome, &lease.holder, now)
        })?;
        let state = json!({
            "agent": agent,
            "attempt": attempt,
            "step_seq": step.step_seq,
            "output": output.output,
        });
        let checkpoint = self.with_store("save_checkpoint", |store| {
            store.save_checkpoint(run_id, step.step_id, agent, &state, now)
        })?;
        info!(
            step_id = %step.step_id,
            attempt,
            checkpoint = checkpoint.version,
            tokens_in = output.tokens_in,
            tokens_out = output.tokens_out,
            "step completed"
        );
        Ok(finished)
    }

    fn record_failure(
        &self,
        step_id: StepId,
        reason: &str,
        error: &str,
        actor: &str,
    ) -> BackboneResult<StepRecord> {
        let outcome = StepOutcome::Failed {
            reason: reason.to_string(),
            error: error.to_string(),
        };
        let now = self.now();
        self.with_store("finish_step", |store| {
            store.finish_step(step_id, &outcome, actor, now)
        })
        .map(|(step, _)| step)
    }

    fn fail_after_step(
        &self,
        lease: &LockLease,
        step_id: StepId,
        agent: &str,
        attempts: u32,
        reason: String,
    ) -> BackboneError {
        let run_id = lease.run_id;
        warn!(%step_id, attempts, reason = %reason, "step failed permanently, failing run");
        let payload = json!({
            "reason": format!("{agent} failed after {attempts} attempt(s): {reason}"),
            "step_id": step_id.to_string(),
            "agent": agent,
        });
        match self.fail_run(run_id, &payload, &lease.holder) {
            Ok(_) => BackboneError::StepFailed {
                run_id,
                step_id,
                reason,
            },
            Err(BackboneError::IllegalTransition {
                from: RunStatus::Aborted,
                ..
            }) => BackboneError::Aborted { run_id },
            Err(err) => err,
        }
    }
}

async fn run_attempt(
    agent: &dyn Agent,
    ctx: StepContext,
    timeout: Duration,
    cancel: &mut CancelSignal,
    precedence: AbortPrecedence,
) -> AttemptResult {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut work = agent.execute(ctx);

    let interrupt = tokio::select! {
        biased;
        () = cancel.cancelled() => Interrupt::Abort,
        () = &mut deadline => Interrupt::Deadline,
        result = &mut work => {
            return match result {
                Ok(output) => AttemptResult::Completed(output),
                Err(failure) => AttemptResult::Failed {
                    reason: REASON_AGENT_ERROR.to_string(),
                    error: failure.message,
                    retryable: failure.retryable,
                },
            };
        }
    };

    let timeout_error = format!(
        "step exceeded its {} ms deadline",
        u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
    );
    let deadline_passed = tokio::time::Instant::now() >= deadline.deadline();
    let aborted = cancel.is_cancelled();

    match (interrupt, aborted, deadline_passed) {
        // Abort seen and the deadline had passed too: configured precedence picks the reason.
        (Interrupt::Abort, _, true) | (Interrupt::Deadline, true, _) => match precedence {
            AbortPrecedence::Abort => AttemptResult::Aborted {
                reason: REASON_ABORTED,
                error: "run aborted while step was in flight".to_string(),
            },
            AbortPrecedence::Timeout => AttemptResult::Aborted {
                reason: REASON_TIMEOUT,
                error: timeout_error,
            },
        },
        (Interrupt::Abort, _, false) => AttemptResult::Aborted {
            reason: REASON_ABORTED,
            error: "run aborted while step was in flight".to_string(),
        },
        (Interrupt::Deadline, false, _) => AttemptResult::Failed {
            reason: REASON_TIMEOUT.to_string(),
            error: timeout_error,
            retryable: true,
        },
    }
}
