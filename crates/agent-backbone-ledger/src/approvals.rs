use agent_backbone_domain::{
    ApprovalDecision, ApprovalId, ApprovalRecord, ApprovalSnapshot, AuditEvent, AuditEventDraft,
    AuditEventType, BackboneError, BackboneResult, ProposedChangeSet, RunId, RunRecord, RunStatus,
};
use agent_backbone_store_core::{BackboneStore, ChangeProposal, RunStore};
use serde_json::json;
use tracing::{info, warn};

use crate::{RunLedger, APPROVAL_ARTIFACT, PATCH_ARTIFACT};

impl<S: BackboneStore> RunLedger<S> {
    /// Attach the change set produced in review and move the run to
    /// `awaiting_approval`. Any later decision is bound to this patch hash.
    /// The patch artifact, the change set and the transition commit together.
    ///
    /// # Errors
    /// `Validation` for an empty or duplicate-path change set, `SecretDetected`
    /// when the rendered patch matches a secret pattern, `StaleState` when the
    /// run is no longer in review.
    pub fn request_approval(
        &self,
        run_id: RunId,
        changes: &ProposedChangeSet,
        actor: &str,
    ) -> BackboneResult<RunRecord> {
        let run = self.get_run(run_id)?;
        if run.status != RunStatus::Review {
            warn!(%run_id, status = %run.status, "approval requested outside review");
            return Err(BackboneError::StaleState {
                run_id,
                expected: RunStatus::Review,
                actual: run.status,
            });
        }
        let (record, event) = self.propose(run_id, RunStatus::Review, changes, actor)?;
        info!(
            %run_id,
            patch_hash = record.patch_hash.as_deref().unwrap_or_default(),
            changes = changes.changes.len(),
            run_seq = event.run_seq,
            "approval requested"
        );
        Ok(record)
    }

    /// Replace the change set of a run that is waiting for approval. Earlier
    /// approvals stop covering the run because they name the old hash.
    ///
    /// # Errors
    /// `Validation` unless the run is awaiting approval.
    pub fn revise_proposed_changes(
        &self,
        run_id: RunId,
        changes: &ProposedChangeSet,
        actor: &str,
    ) -> BackboneResult<RunRecord> {
        let run = self.get_run(run_id)?;
        if run.status != RunStatus::AwaitingApproval {
            return Err(BackboneError::Validation(format!(
                "run {run_id} is {}; only runs awaiting approval can be revised",
                run.status
            )));
        }
        let (record, _) = self.propose(run_id, RunStatus::AwaitingApproval, changes, actor)?;
        info!(
            %run_id,
            patch_hash = record.patch_hash.as_deref().unwrap_or_default(),
            previous = run.patch_hash.as_deref().unwrap_or("<none>"),
            "proposed changes revised, approval reset to pending"
        );
        Ok(record)
    }

    fn propose(
        &self,
        run_id: RunId,
        expected: RunStatus,
        changes: &ProposedChangeSet,
        actor: &str,
    ) -> BackboneResult<(RunRecord, AuditEvent)> {
        changes.validate()?;
        let patch_hash = changes.patch_hash()?;
        let patch = changes.render_patch();
        self.screen_artifact(run_id, PATCH_ARTIFACT, patch.as_bytes())?;
        let proposal = ChangeProposal {
            run_id,
            expected,
            changes,
            patch_hash: &patch_hash,
            artifact_name: PATCH_ARTIFACT,
            patch: patch.as_bytes(),
            actor,
        };
        let now = self.now();
        self.with_store("propose_changes", |store| {
            store.propose_changes(&proposal, now)
        })
    }

    /// Record a human decision on the patch identified by `patch_hash`.
    /// A rejection leaves the run awaiting approval so it can be revised or aborted.
    ///
    /// # Errors
    /// `ApprovalInvalidated` when `patch_hash` is not the run's current patch
    /// or the run is not awaiting approval.
    pub fn record_decision(
        &self,
        run_id: RunId,
        decision: ApprovalDecision,
        decided_by: &str,
        patch_hash: &str,
        reason: Option<String>,
    ) -> BackboneResult<ApprovalRecord> {
        agent_backbone_domain::ensure_non_empty("decided_by", decided_by)?;
        let approval = ApprovalRecord {
            approval_id: ApprovalId::new(),
            run_id,
            decision,
            decided_by: decided_by.to_string(),
            decided_at: self.now(),
            patch_hash: patch_hash.to_string(),
            reason,
        };
        let result = self.with_store("record_approval", |store| store.record_approval(&approval));
        if let Err(BackboneError::ApprovalInvalidated { reason, .. }) = &result {
            warn!(%run_id, decided_by, patch_hash, reason = %reason, "approval decision refused");
        }
        result?;

        let body = serde_json::to_vec_pretty(&approval)
            .map_err(|err| BackboneError::Validation(format!("approval record: {err}")))?;
        self.write_artifact(run_id, APPROVAL_ARTIFACT, &body)?;
        info!(
            %run_id,
            approval_id = %approval.approval_id,
            decision = decision.as_str(),
            decided_by,
            "approval decision recorded"
        );
        Ok(approval)
    }

    /// Current approval state as the capability gate sees it. The patch hash is
    /// recomputed from the stored change set rather than trusted from the row.
    ///
    /// # Errors
    /// `NotFound` for unknown runs.
    pub fn approval_snapshot(&self, run_id: RunId) -> BackboneResult<ApprovalSnapshot> {
        let run = self.get_run(run_id)?;
        let current_patch_hash = run
            .proposed_changes
            .as_ref()
            .map(ProposedChangeSet::patch_hash)
            .transpose()?;
        let approvals = self.with_store("list_approvals", |store| store.list_approvals(run_id))?;
        Ok(ApprovalSnapshot {
            run_id,
            status: run.status,
            current_patch_hash,
            approvals,
        })
    }

    /// Audit a gated operation that was allowed through and forwarded.
    ///
    /// # Errors
    /// `NotFound` for unknown runs.
    pub fn record_gated_operation(
        &self,
        run_id: RunId,
        operation: &str,
        payload_hash: &str,
        approval_id: ApprovalId,
        actor: &str,
    ) -> BackboneResult<AuditEvent> {
        self.append_audit_event(&AuditEventDraft::new(
            run_id,
            AuditEventType::GatedOperationExecuted,
            actor,
            json!({
                "operation": operation,
                "payload_hash": payload_hash,
                "approval_id": approval_id.to_string(),
            }),
        ))
    }

    /// Audit a gated operation the gate refused.
    ///
    /// # Errors
    /// `NotFound` for unknown runs.
    pub fn record_gate_denial(
        &self,
        run_id: RunId,
        operation: &str,
        reason: &str,
        actor: &str,
    ) -> BackboneResult<AuditEvent> {
        self.append_audit_event(&AuditEventDraft::new(
            run_id,
            AuditEventType::Error,
            actor,
            json!({"kind": "gate_denied", "operation": operation, "reason": reason}),
        ))
    }
}

/// The approval, if any, that currently authorizes gated work on the snapshot's run:
/// the latest decision on the current patch hash, when that decision is an approval.
#[must_use]
pub fn current_approval(snapshot: &ApprovalSnapshot) -> Option<&ApprovalRecord> {
    let current = snapshot.current_patch_hash.as_deref()?;
    snapshot
        .approvals
        .iter()
        .rev()
        .find(|approval| approval.patch_hash == current)
        .filter(|approval| approval.decision == ApprovalDecision::Approved)
}
