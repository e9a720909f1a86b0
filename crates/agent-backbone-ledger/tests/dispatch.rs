mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_backbone_domain::{
    AbortPrecedence, AuditEventType, BackboneError, RunId, RunStatus, StepStatus,
};
use agent_backbone_ledger::{Agent, AgentFailure, AgentOutput, StepContext};
use async_trait::async_trait;
use common::{advance_to, fast_config, ledger, ledger_with, must, new_run, Ledger};
use serde_json::{json, Value};

struct Echo;

#[async_trait]
impl Agent for Echo {
    fn name(&self) -> &str {
        "planner"
    }

    async fn execute(&self, ctx: StepContext) -> Result<AgentOutput, AgentFailure> {
        Ok(AgentOutput::new(json!({"plan": ctx.input, "attempt": ctx.attempt})).with_tokens(100, 50))
    }
}

struct Flaky {
    failures_left: AtomicU32,
}

#[async_trait]
impl Agent for Flaky {
    fn name(&self) -> &str {
        "code-generator"
    }

    async fn execute(&self, _ctx: StepContext) -> Result<AgentOutput, AgentFailure> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(AgentFailure::retryable("model endpoint returned 503"));
        }
        Ok(AgentOutput::new(json!({"patch": "ok"})))
    }
}

struct Fatal;

#[async_trait]
impl Agent for Fatal {
    fn name(&self) -> &str {
        "resolver"
    }

    async fn execute(&self, _ctx: StepContext) -> Result<AgentOutput, AgentFailure> {
        Err(AgentFailure::fatal("repository is archived"))
    }
}

/// Never finishes on its own.
struct Stuck;

#[async_trait]
impl Agent for Stuck {
    fn name(&self) -> &str {
        "slow"
    }

    async fn execute(&self, _ctx: StepContext) -> Result<AgentOutput, AgentFailure> {
        std::future::pending::<()>().await;
        Ok(AgentOutput::new(Value::Null))
    }
}

/// Blocks past its deadline, aborts its own run, then waits to be cancelled.
/// The dispatcher observes the abort and the expired deadline together.
struct OverrunThenAbort {
    ledger: Arc<Ledger>,
    run_id: RunId,
}

#[async_trait]
impl Agent for OverrunThenAbort {
    fn name(&self) -> &str {
        "slow"
    }

    async fn execute(&self, _ctx: StepContext) -> Result<AgentOutput, AgentFailure> {
        std::thread::sleep(Duration::from_millis(60));
        must(self.ledger.abort(self.run_id, "operator request", "dana"));
        std::future::pending::<()>().await;
        Ok(AgentOutput::new(Value::Null))
    }
}

fn step_failed_reasons(ledger: &Ledger, run_id: RunId) -> Vec<String> {
    must(ledger.list_audit_events(run_id))
        .into_iter()
        .filter(|event| event.event_type == AuditEventType::StepFailed)
        .map(|event| event.detail_str("reason").unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn completed_step_is_recorded_and_checkpointed() {
    let (ledger, _) = ledger();
    let run_id = new_run(&ledger);
    must(advance_to(&ledger, run_id, RunStatus::Triaged));
    let lease = must(ledger.acquire_lock(run_id, "worker-1"));

    let step = must(ledger.dispatch_step(&lease, &Echo, json!({"issue": 77})).await);
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.attempt, 1);
    assert_eq!(step.tokens_in, 100);
    assert_eq!(step.output, Some(json!({"plan": {"issue": 77}, "attempt": 1})));

    assert_eq!(must(ledger.get_run(run_id)).tokens_used, 150);

    let resume = must(ledger.resume_point(run_id));
    assert!(resume.is_done("planner"));
    let checkpoint = resume
        .latest_checkpoint
        .unwrap_or_else(|| panic!("no checkpoint saved"));
    assert_eq!(checkpoint.version, 1);
    assert_eq!(checkpoint.step_id, step.step_id);
    assert_eq!(checkpoint.state["agent"], json!("planner"));
}

#[tokio::test]
async fn retryable_failures_get_new_attempts() {
    let (ledger, _) = ledger();
    let run_id = new_run(&ledger);
    let lease = must(ledger.acquire_lock(run_id, "worker-1"));
    let agent = Flaky {
        failures_left: AtomicU32::new(2),
    };

    let step = must(ledger.dispatch_step(&lease, &agent, json!({})).await);
    assert_eq!(step.attempt, 3);

    let steps = must(ledger.list_steps(run_id));
    let statuses: Vec<(u32, StepStatus)> =
        steps.iter().map(|step| (step.attempt, step.status)).collect();
    assert_eq!(
        statuses,
        vec![
            (1, StepStatus::Failed),
            (2, StepStatus::Failed),
            (3, StepStatus::Completed),
        ]
    );
    assert_eq!(step_failed_reasons(&ledger, run_id), vec!["agent_error", "agent_error"]);
    assert_eq!(must(ledger.get_run(run_id)).status, RunStatus::Queued);
}

#[tokio::test]
async fn timeouts_are_retried_then_fail_the_run() {
    let mut config = fast_config();
    config.step.timeouts_ms.insert("slow".to_string(), 20);
    let (ledger, _) = ledger_with(config);
    let run_id = new_run(&ledger);
    must(advance_to(&ledger, run_id, RunStatus::Resolving));
    let lease = must(ledger.acquire_lock(run_id, "worker-1"));

    let result = ledger.dispatch_step(&lease, &Stuck, json!({})).await;
    assert!(matches!(result, Err(BackboneError::StepFailed { .. })));

    assert_eq!(step_failed_reasons(&ledger, run_id), vec!["timeout"; 3]);
    let run = must(ledger.get_run(run_id));
    assert_eq!(run.status, RunStatus::Failed);
    let summary = run.summary.unwrap_or_default();
    assert!(summary.contains("Last failure: slow (timeout)"), "{summary}");

    let steps = must(ledger.list_steps(run_id));
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|step| step.status == StepStatus::Failed));
}

#[tokio::test]
async fn fatal_failures_are_not_retried() {
    let (ledger, _) = ledger();
    let run_id = new_run(&ledger);
    let lease = must(ledger.acquire_lock(run_id, "worker-1"));

    let result = ledger.dispatch_step(&lease, &Fatal, json!({})).await;
    assert!(matches!(result, Err(BackboneError::StepFailed { .. })));
    assert_eq!(must(ledger.list_steps(run_id)).len(), 1);
    assert_eq!(must(ledger.get_run(run_id)).status, RunStatus::Failed);
}

#[tokio::test]
async fn abort_stops_an_in_flight_step() {
    let (ledger, _) = ledger();
    let run_id = new_run(&ledger);
    let lease = must(ledger.acquire_lock(run_id, "worker-1"));

    let abort = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        ledger.abort(run_id, "operator request", "dana")
    };
    let (dispatched, aborted) = tokio::join!(ledger.dispatch_step(&lease, &Stuck, json!({})), abort);

    assert!(matches!(dispatched, Err(BackboneError::Aborted { .. })));
    assert_eq!(must(aborted).status, RunStatus::Aborted);
    assert_eq!(step_failed_reasons(&ledger, run_id), vec!["aborted"]);
    assert_eq!(must(ledger.list_steps(run_id))[0].status, StepStatus::Failed);
}

async fn race_abort_and_timeout(precedence: AbortPrecedence) -> Vec<String> {
    let mut config = fast_config();
    config.step.timeouts_ms.insert("slow".to_string(), 20);
    config.step.abort_precedence = precedence;
    let (ledger, _) = ledger_with(config);
    let ledger = Arc::new(ledger);
    let run_id = new_run(&ledger);
    let lease = must(ledger.acquire_lock(run_id, "worker-1"));
    let agent = OverrunThenAbort {
        ledger: Arc::clone(&ledger),
        run_id,
    };

    let result = ledger.dispatch_step(&lease, &agent, json!({})).await;
    assert!(matches!(result, Err(BackboneError::Aborted { .. })));
    assert_eq!(must(ledger.get_run(run_id)).status, RunStatus::Aborted);
    step_failed_reasons(&ledger, run_id)
}

#[tokio::test]
async fn abort_precedence_names_the_abort() {
    assert_eq!(race_abort_and_timeout(AbortPrecedence::Abort).await, vec!["aborted"]);
}

#[tokio::test]
async fn timeout_precedence_names_the_timeout() {
    assert_eq!(race_abort_and_timeout(AbortPrecedence::Timeout).await, vec!["timeout"]);
}

#[tokio::test]
async fn dispatch_requires_the_live_lease() {
    let (ledger, _) = ledger();
    let run_id = new_run(&ledger);
    let lease = must(ledger.acquire_lock(run_id, "worker-1"));
    assert!(must(ledger.release(&lease)));

    let result = ledger.dispatch_step(&lease, &Echo, json!({})).await;
    assert!(matches!(result, Err(BackboneError::LockLost { .. })));
    assert!(must(ledger.list_steps(run_id)).is_empty());
}

#[tokio::test]
async fn expired_lease_taken_by_another_worker_blocks_dispatch() {
    let (ledger, clock) = ledger();
    let run_id = new_run(&ledger);
    let stale = must(ledger.acquire_lock(run_id, "worker-1"));
    clock.advance(ledger.config().lock.ttl() + Duration::from_millis(1));
    let fresh = must(ledger.acquire_lock(run_id, "worker-2"));
    assert!(fresh.fencing_token > stale.fencing_token);

    let result = ledger.dispatch_step(&stale, &Echo, json!({})).await;
    assert!(matches!(result, Err(BackboneError::LockLost { .. })));
    assert!(ledger.dispatch_step(&fresh, &Echo, json!({})).await.is_ok());
}

#[tokio::test]
async fn aborted_runs_refuse_new_steps() {
    let (ledger, _) = ledger();
    let run_id = new_run(&ledger);
    let lease = must(ledger.acquire_lock(run_id, "worker-1"));
    must(ledger.abort(run_id, "duplicate", "dana"));

    let result = ledger.dispatch_step(&lease, &Echo, json!({})).await;
    assert!(matches!(result, Err(BackboneError::Aborted { .. })));
    assert!(must(ledger.list_steps(run_id)).is_empty());
}
