use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ApprovalStatus, AuditEvent, AuditEventType, BackboneError, BackboneResult, RunId, RunStatus,
    StepId, StepStatus,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StepProjection {
    pub step_id: StepId,
    pub agent: String,
    pub attempt: u32,
    pub status: StepStatus,
}

/// Run state as derived purely from its audit log.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunProjection {
    pub run_id: RunId,
    pub status: RunStatus,
    pub approval_status: ApprovalStatus,
    pub patch_hash: Option<String>,
    pub tokens_used: u64,
    pub transitions: usize,
    pub steps: Vec<StepProjection>,
    pub gated_operations: Vec<String>,
}

/// Fold an ordered audit log into the run projection.
///
/// # Errors
/// Returns [`BackboneError::Validation`] when the stream does not start with
/// `run_created`, mixes runs, or records a transition that does not follow
/// from the folded state.
pub fn project_run(events: &[AuditEvent]) -> BackboneResult<RunProjection> {
    let Some(first) = events.first() else {
        return Err(BackboneError::Validation(
            "cannot project an empty audit log".to_string(),
        ));
    };
    if first.event_type != AuditEventType::RunCreated {
        return Err(BackboneError::Validation(
            "audit log MUST begin with run_created".to_string(),
        ));
    }

    let mut projection = RunProjection {
        run_id: first.run_id,
        status: RunStatus::Queued,
        approval_status: ApprovalStatus::None,
        patch_hash: None,
        tokens_used: 0,
        transitions: 0,
        steps: Vec::new(),
        gated_operations: Vec::new(),
    };

    for event in &events[1..] {
        if event.run_id != projection.run_id {
            return Err(BackboneError::Validation(format!(
                "audit log for {} contains event of run {}",
                projection.run_id, event.run_id
            )));
        }
        apply_event(&mut projection, event)?;
    }

    Ok(projection)
}

fn apply_event(projection: &mut RunProjection, event: &AuditEvent) -> BackboneResult<()> {
    match event.event_type {
        AuditEventType::RunCreated => {
            return Err(BackboneError::Validation(format!(
                "duplicate run_created at seq {}",
                event.run_seq
            )));
        }
        AuditEventType::StateTransition => {
            let Some((from, to)) = event.transition() else {
                return Err(malformed(event, "from/to"));
            };
            if from != projection.status || !from.can_transition_to(to) {
                return Err(BackboneError::Validation(format!(
                    "transition {from} -> {to} at seq {} does not follow state {}",
                    event.run_seq, projection.status
                )));
            }
            projection.status = to;
            projection.transitions += 1;
        }
        AuditEventType::StepStarted => {
            let step_id = step_id_of(event)?;
            let agent = event
                .detail_str("agent")
                .ok_or_else(|| malformed(event, "agent"))?
                .to_string();
            let attempt = event
                .detail_u64("attempt")
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(1);
            projection.steps.push(StepProjection {
                step_id,
                agent,
                attempt,
                status: StepStatus::Running,
            });
        }
        AuditEventType::StepCompleted => {
            let step_id = step_id_of(event)?;
            let skipped = event.detail_str("outcome") == Some("skipped");
            if skipped {
                let agent = event.detail_str("agent").unwrap_or_default().to_string();
                projection.steps.push(StepProjection {
                    step_id,
                    agent,
                    attempt: 1,
                    status: StepStatus::Skipped,
                });
            } else {
                set_step_status(projection, event, step_id, StepStatus::Completed)?;
                let tokens = event.detail_u64("tokens_in").unwrap_or(0)
                    + event.detail_u64("tokens_out").unwrap_or(0);
                projection.tokens_used = projection.tokens_used.saturating_add(tokens);
            }
        }
        AuditEventType::StepFailed => {
            let step_id = step_id_of(event)?;
            set_step_status(projection, event, step_id, StepStatus::Failed)?;
        }
        AuditEventType::ApprovalRequested => {
            let hash = event
                .detail_str("patch_hash")
                .ok_or_else(|| malformed(event, "patch_hash"))?;
            projection.patch_hash = Some(hash.to_string());
            projection.approval_status = ApprovalStatus::Pending;
        }
        AuditEventType::ApprovalGranted => projection.approval_status = ApprovalStatus::Approved,
        AuditEventType::ApprovalRejected => projection.approval_status = ApprovalStatus::Rejected,
        AuditEventType::GatedOperationExecuted => {
            let operation = event
                .detail_str("operation")
                .ok_or_else(|| malformed(event, "operation"))?;
            projection.gated_operations.push(operation.to_string());
        }
        AuditEventType::Error => {}
    }
    Ok(())
}

fn set_step_status(
    projection: &mut RunProjection,
    event: &AuditEvent,
    step_id: StepId,
    status: StepStatus,
) -> BackboneResult<()> {
    let Some(step) = projection
        .steps
        .iter_mut()
        .find(|step| step.step_id == step_id)
    else {
        return Err(BackboneError::Validation(format!(
            "{} at seq {} references unknown step {step_id}",
            event.event_type.as_str(),
            event.run_seq
        )));
    };
    if step.status.is_terminal() {
        return Err(BackboneError::Validation(format!(
            "step {step_id} is already {} at seq {}",
            step.status.as_str(),
            event.run_seq
        )));
    }
    step.status = status;
    Ok(())
}

fn step_id_of(event: &AuditEvent) -> BackboneResult<StepId> {
    let raw = event
        .detail_str("step_id")
        .ok_or_else(|| malformed(event, "step_id"))?;
    StepId::parse(raw)
}

fn malformed(event: &AuditEvent, field: &str) -> BackboneError {
    BackboneError::Validation(format!(
        "{} at seq {} is missing '{field}'",
        event.event_type.as_str(),
        event.run_seq
    ))
}

/// Human-readable account of a run, built only from its audit log.
#[must_use]
pub fn summarize(events: &[AuditEvent]) -> String {
    let Some(first) = events.first() else {
        return "no audit events recorded".to_string();
    };

    let mut path: Vec<RunStatus> = vec![RunStatus::Queued];
    let mut completed = 0_usize;
    let mut failed = 0_usize;
    let mut skipped = 0_usize;
    let mut tokens = 0_u64;
    let mut approval: Option<String> = None;
    let mut gated: Vec<String> = Vec::new();
    let mut last_failure: Option<String> = None;
    let mut terminal_note: Option<String> = None;

    for event in events {
        match event.event_type {
            AuditEventType::StateTransition => {
                if let Some((_, to)) = event.transition() {
                    path.push(to);
                    if to.is_terminal() {
                        terminal_note = event
                            .details
                            .get("payload")
                            .and_then(|payload| payload.get("reason"))
                            .and_then(Value::as_str)
                            .map(str::to_string);
                    }
                }
            }
            AuditEventType::StepCompleted => {
                if event.detail_str("outcome") == Some("skipped") {
                    skipped += 1;
                } else {
                    completed += 1;
                    tokens = tokens
                        .saturating_add(event.detail_u64("tokens_in").unwrap_or(0))
                        .saturating_add(event.detail_u64("tokens_out").unwrap_or(0));
                }
            }
            AuditEventType::StepFailed => {
                failed += 1;
                last_failure = Some(format!(
                    "{} ({})",
                    event.detail_str("agent").unwrap_or("unknown agent"),
                    event.detail_str("reason").unwrap_or("unspecified")
                ));
            }
            AuditEventType::ApprovalGranted => {
                approval = Some(format!(
                    "approved by {}",
                    event.detail_str("decided_by").unwrap_or(&event.actor)
                ));
            }
            AuditEventType::ApprovalRejected => {
                approval = Some(format!(
                    "rejected by {}",
                    event.detail_str("decided_by").unwrap_or(&event.actor)
                ));
            }
            AuditEventType::GatedOperationExecuted => {
                if let Some(operation) = event.detail_str("operation") {
                    gated.push(operation.to_string());
                }
            }
            AuditEventType::RunCreated
            | AuditEventType::StepStarted
            | AuditEventType::ApprovalRequested
            | AuditEventType::Error => {}
        }
    }

    let final_status = path.last().copied().unwrap_or(RunStatus::Queued);
    let path_text = path
        .iter()
        .map(|status| status.as_str())
        .collect::<Vec<_>>()
        .join(" -> ");

    let mut summary = format!(
        "Run {} ended {} after {} transition(s): {}. Steps: {completed} completed, {failed} failed, {skipped} skipped; {tokens} tokens used.",
        first.run_id,
        final_status,
        path.len() - 1,
        path_text,
    );
    if let Some(note) = terminal_note {
        summary.push_str(&format!(" Reason: {note}."));
    }
    if let (RunStatus::Failed, Some(failure)) = (final_status, &last_failure) {
        summary.push_str(&format!(" Last failure: {failure}."));
    }
    if let Some(approval) = approval {
        summary.push_str(&format!(" Approval: {approval}."));
    }
    if !gated.is_empty() {
        summary.push_str(&format!(" Gated operations: {}.", gated.join(", ")));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compute_event_hash, hash_json, now_utc, EventId};
    use serde_json::json;

    struct LogBuilder {
        run_id: RunId,
        events: Vec<AuditEvent>,
    }

    impl LogBuilder {
        fn new() -> Self {
            let mut builder = Self {
                run_id: RunId::new(),
                events: Vec::new(),
            };
            builder.push(AuditEventType::RunCreated, json!({"tenant_id": "acme"}));
            builder
        }

        fn push(&mut self, event_type: AuditEventType, details: Value) -> &mut Self {
            let run_seq = self.events.len() as u64 + 1;
            let prev = self.events.last().map(|event| event.event_hash.clone());
            let event_id = EventId::new();
            let occurred_at = now_utc();
            let details_hash = hash_json(&details).unwrap_or_else(|_| unreachable!());
            let event_hash = compute_event_hash(
                event_id,
                self.run_id,
                run_seq,
                event_type,
                "worker-1",
                occurred_at,
                &details_hash,
                prev.as_deref(),
            )
            .unwrap_or_else(|_| unreachable!());
            self.events.push(AuditEvent {
                event_seq: i64::try_from(run_seq).unwrap_or_else(|_| unreachable!()),
                event_id,
                run_id: self.run_id,
                run_seq,
                event_type,
                actor: "worker-1".to_string(),
                occurred_at,
                details,
                details_hash,
                prev_event_hash: prev,
                event_hash,
            });
            self
        }

        fn transition(&mut self, from: RunStatus, to: RunStatus) -> &mut Self {
            self.push(
                AuditEventType::StateTransition,
                json!({"from": from, "to": to, "payload": {}}),
            )
        }
    }

    #[test]
    fn fold_tracks_status_steps_and_tokens() {
        let step_id = StepId::new();
        let mut log = LogBuilder::new();
        log.transition(RunStatus::Queued, RunStatus::Triaged)
            .push(
                AuditEventType::StepStarted,
                json!({"step_id": step_id.to_string(), "agent": "planner", "attempt": 1}),
            )
            .push(
                AuditEventType::StepCompleted,
                json!({"step_id": step_id.to_string(), "agent": "planner", "tokens_in": 10, "tokens_out": 5}),
            )
            .transition(RunStatus::Triaged, RunStatus::Planned)
            .push(AuditEventType::ApprovalRequested, json!({"patch_hash": "h1"}))
            .push(AuditEventType::ApprovalGranted, json!({"decided_by": "alice"}));

        let projection = project_run(&log.events).unwrap_or_else(|_| unreachable!());
        assert_eq!(projection.status, RunStatus::Planned);
        assert_eq!(projection.transitions, 2);
        assert_eq!(projection.tokens_used, 15);
        assert_eq!(projection.steps.len(), 1);
        assert_eq!(projection.steps[0].status, StepStatus::Completed);
        assert_eq!(projection.approval_status, ApprovalStatus::Approved);
        assert_eq!(projection.patch_hash.as_deref(), Some("h1"));
    }

    #[test]
    fn fold_rejects_transition_that_skips_state() {
        let mut log = LogBuilder::new();
        log.transition(RunStatus::Triaged, RunStatus::Planned);
        assert!(project_run(&log.events).is_err());
    }

    #[test]
    fn fold_rejects_double_terminal_step() {
        let step_id = StepId::new();
        let mut log = LogBuilder::new();
        log.push(
            AuditEventType::StepStarted,
            json!({"step_id": step_id.to_string(), "agent": "triage"}),
        )
        .push(
            AuditEventType::StepFailed,
            json!({"step_id": step_id.to_string(), "reason": "timeout"}),
        )
        .push(
            AuditEventType::StepCompleted,
            json!({"step_id": step_id.to_string()}),
        );
        assert!(project_run(&log.events).is_err());
    }

    #[test]
    fn summary_names_terminal_state_reason_and_failure() {
        let step_id = StepId::new();
        let mut log = LogBuilder::new();
        log.push(
            AuditEventType::StepStarted,
            json!({"step_id": step_id.to_string(), "agent": "triage"}),
        )
        .push(
            AuditEventType::StepFailed,
            json!({"step_id": step_id.to_string(), "agent": "triage", "reason": "timeout"}),
        )
        .push(
            AuditEventType::StateTransition,
            json!({"from": "queued", "to": "failed", "payload": {"reason": "retries exhausted"}}),
        );

        let summary = summarize(&log.events);
        assert!(summary.contains("ended failed"));
        assert!(summary.contains("queued -> failed"));
        assert!(summary.contains("retries exhausted"));
        assert!(summary.contains("triage (timeout)"));
        assert!(summary.contains("1 failed"));
    }
}
