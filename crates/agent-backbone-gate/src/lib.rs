#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]
//! Capability gate in front of the source-control client.
//!
//! Every external-effecting call goes through [`CapabilityGate::invoke`].
//! The decision itself is the pure [`check`]; the gate adds the audit trail
//! and the single side effect of forwarding an allowed call.

use std::sync::Arc;

use agent_backbone_domain::{
    hash_json, ApprovalDecision, ApprovalId, ApprovalSnapshot, BackboneError, BackboneResult,
    GateConfig, RunId,
};
use agent_backbone_ledger::{current_approval, RunLedger};
use agent_backbone_policy::{OperationClass, OperationClassifier};
use agent_backbone_store_core::BackboneStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateRequest {
    pub run_id: RunId,
    pub operation_type: String,
    pub target_payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub class: OperationClass,
    /// The approval that authorized a gated call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<ApprovalId>,
}

impl GateDecision {
    fn safe() -> Self {
        Self {
            allowed: true,
            reason: None,
            class: OperationClass::Safe,
            approval_id: None,
        }
    }

    fn approved(approval_id: ApprovalId) -> Self {
        Self {
            allowed: true,
            reason: None,
            class: OperationClass::Gated,
            approval_id: Some(approval_id),
        }
    }

    fn denied(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            class: OperationClass::Gated,
            approval_id: None,
        }
    }
}

/// Decide whether `request` may run given the run's approval state.
///
/// SAFE operations are always allowed. GATED operations need an APPROVED
/// decision whose patch hash equals the hash of the run's current change set.
#[must_use]
pub fn check(
    classifier: &OperationClassifier,
    request: &GateRequest,
    snapshot: &ApprovalSnapshot,
) -> GateDecision {
    if classifier.classify(&request.operation_type) == OperationClass::Safe {
        return GateDecision::safe();
    }
    if snapshot.run_id != request.run_id {
        return GateDecision::denied(format!(
            "approval state is for run {}, not {}",
            snapshot.run_id, request.run_id
        ));
    }
    if snapshot.status.is_terminal() {
        return GateDecision::denied(format!("run is {}", snapshot.status));
    }
    let Some(current) = snapshot.current_patch_hash.as_deref() else {
        return GateDecision::denied("run has no proposed changes".to_string());
    };
    if let Some(approval) = current_approval(snapshot) {
        return GateDecision::approved(approval.approval_id);
    }

    let latest_on_current = snapshot
        .approvals
        .iter()
        .rev()
        .find(|approval| approval.patch_hash == current);
    let reason = match latest_on_current {
        Some(decision) if decision.decision == ApprovalDecision::Rejected => {
            format!("patch {current} was rejected by {}", decision.decided_by)
        }
        _ => match snapshot
            .approvals
            .iter()
            .rev()
            .find(|approval| approval.decision == ApprovalDecision::Approved)
        {
            Some(stale) => format!(
                "approved patch {} does not match current patch {current}",
                stale.patch_hash
            ),
            None => format!("no approval recorded for patch {current}"),
        },
    };
    GateDecision::denied(reason)
}

/// The run-ledger side of the gate: approval state in, audit events out.
pub trait ApprovalState: Send + Sync {
    fn approval_snapshot(&self, run_id: RunId) -> BackboneResult<ApprovalSnapshot>;

    fn record_gated_operation(
        &self,
        run_id: RunId,
        operation: &str,
        payload_hash: &str,
        approval_id: ApprovalId,
        actor: &str,
    ) -> BackboneResult<()>;

    fn record_gate_denial(
        &self,
        run_id: RunId,
        operation: &str,
        reason: &str,
        actor: &str,
    ) -> BackboneResult<()>;
}

impl<S: BackboneStore> ApprovalState for RunLedger<S> {
    fn approval_snapshot(&self, run_id: RunId) -> BackboneResult<ApprovalSnapshot> {
        RunLedger::approval_snapshot(self, run_id)
    }

    fn record_gated_operation(
        &self,
        run_id: RunId,
        operation: &str,
        payload_hash: &str,
        approval_id: ApprovalId,
        actor: &str,
    ) -> BackboneResult<()> {
        RunLedger::record_gated_operation(self, run_id, operation, payload_hash, approval_id, actor)
            .map(|_| ())
    }

    fn record_gate_denial(
        &self,
        run_id: RunId,
        operation: &str,
        reason: &str,
        actor: &str,
    ) -> BackboneResult<()> {
        RunLedger::record_gate_denial(self, run_id, operation, reason, actor).map(|_| ())
    }
}

/// The external source-control client. Retries, if any, belong to the client.
#[async_trait]
pub trait OperationClient: Send + Sync {
    async fn execute(&self, operation_type: &str, payload: &Value) -> anyhow::Result<Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error(transparent)]
    Backbone(#[from] BackboneError),
    #[error("operation '{operation}' failed: {source:#}")]
    Operation {
        operation: String,
        #[source]
        source: anyhow::Error,
    },
}

pub struct CapabilityGate<A, C> {
    state: Arc<A>,
    client: C,
    classifier: OperationClassifier,
}

impl<A: ApprovalState, C: OperationClient> CapabilityGate<A, C> {
    /// # Errors
    /// Returns [`BackboneError::Configuration`] if the config lists a gated operation as safe.
    pub fn new(state: Arc<A>, client: C, config: &GateConfig) -> BackboneResult<Self> {
        Ok(Self {
            state,
            client,
            classifier: OperationClassifier::from_config(config)?,
        })
    }

    /// The boundary response for `request`, without forwarding or auditing.
    ///
    /// # Errors
    /// `NotFound` when a gated request names an unknown run.
    pub fn decide(&self, request: &GateRequest) -> BackboneResult<GateDecision> {
        if self.classifier.classify(&request.operation_type) == OperationClass::Safe {
            return Ok(GateDecision::safe());
        }
        let snapshot = self.state.approval_snapshot(request.run_id)?;
        Ok(check(&self.classifier, request, &snapshot))
    }

    /// Check `request` and forward it to the client when allowed.
    ///
    /// # Errors
    /// `ApprovalInvalidated` when a gated call is refused. Client failures
    /// come back as [`GateError::Operation`].
    pub async fn invoke(&self, request: &GateRequest, actor: &str) -> Result<Value, GateError> {
        let run_id = request.run_id;
        let operation = request.operation_type.as_str();
        let decision = self.decide(request)?;

        if decision.class == OperationClass::Safe {
            debug!(%run_id, operation, "safe operation forwarded");
            return self.forward(request).await;
        }

        let Some(approval_id) = decision.approval_id.filter(|_| decision.allowed) else {
            let reason = decision
                .reason
                .unwrap_or_else(|| "gated operation not approved".to_string());
            warn!(%run_id, operation, actor, reason = %reason, "gated operation refused");
            self.state
                .record_gate_denial(run_id, operation, &reason, actor)?;
            return Err(BackboneError::ApprovalInvalidated { run_id, reason }.into());
        };

        let payload_hash = hash_json(&request.target_payload)?;
        let result = self.forward(request).await?;
        self.state
            .record_gated_operation(run_id, operation, &payload_hash, approval_id, actor)?;
        info!(%run_id, operation, %approval_id, actor, "gated operation executed");
        Ok(result)
    }

    async fn forward(&self, request: &GateRequest) -> Result<Value, GateError> {
        self.client
            .execute(&request.operation_type, &request.target_payload)
            .await
            .map_err(|source| {
                warn!(
                    run_id = %request.run_id,
                    operation = %request.operation_type,
                    error = %source,
                    "operation client failed"
                );
                GateError::Operation {
                    operation: request.operation_type.clone(),
                    source,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use agent_backbone_domain::{now_utc, ApprovalRecord, RunStatus};
    use serde_json::json;

    use super::*;

    fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        result.unwrap_or_else(|err| panic!("unexpected error: {err:?}"))
    }

    fn approval(run_id: RunId, patch_hash: &str, decision: ApprovalDecision) -> ApprovalRecord {
        ApprovalRecord {
            approval_id: ApprovalId::new(),
            run_id,
            decision,
            decided_by: "maintainer".to_string(),
            decided_at: now_utc(),
            patch_hash: patch_hash.to_string(),
            reason: None,
        }
    }

    fn snapshot(run_id: RunId, current: &str, approvals: Vec<ApprovalRecord>) -> ApprovalSnapshot {
        ApprovalSnapshot {
            run_id,
            status: RunStatus::Applying,
            current_patch_hash: Some(current.to_string()),
            approvals,
        }
    }

    fn request(run_id: RunId, operation: &str) -> GateRequest {
        GateRequest {
            run_id,
            operation_type: operation.to_string(),
            target_payload: json!({"branch": "backbone/fix-77"}),
        }
    }

    fn classifier() -> OperationClassifier {
        must(OperationClassifier::from_config(&GateConfig::default()))
    }

    #[derive(Default)]
    struct FakeState {
        snapshot: Mutex<Option<ApprovalSnapshot>>,
        executed: Mutex<Vec<(String, ApprovalId)>>,
        denied: Mutex<Vec<(String, String)>>,
    }

    impl FakeState {
        fn with(snapshot: ApprovalSnapshot) -> Arc<Self> {
            let state = Self::default();
            *must(state.snapshot.lock()) = Some(snapshot);
            Arc::new(state)
        }
    }

    impl ApprovalState for FakeState {
        fn approval_snapshot(&self, run_id: RunId) -> BackboneResult<ApprovalSnapshot> {
            must(self.snapshot.lock())
                .clone()
                .ok_or_else(|| BackboneError::not_found("run", run_id))
        }

        fn record_gated_operation(
            &self,
            _run_id: RunId,
            operation: &str,
            _payload_hash: &str,
            approval_id: ApprovalId,
            _actor: &str,
        ) -> BackboneResult<()> {
            must(self.executed.lock()).push((operation.to_string(), approval_id));
            Ok(())
        }

        fn record_gate_denial(
            &self,
            _run_id: RunId,
            operation: &str,
            reason: &str,
            _actor: &str,
        ) -> BackboneResult<()> {
            must(self.denied.lock()).push((operation.to_string(), reason.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingClient {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OperationClient for RecordingClient {
        async fn execute(&self, operation_type: &str, _payload: &Value) -> anyhow::Result<Value> {
            must(self.calls.lock()).push(operation_type.to_string());
            Ok(json!({"ok": true}))
        }
    }

    #[test]
    fn safe_operations_need_no_approval() {
        let run_id = RunId::new();
        let decision = check(
            &classifier(),
            &request(run_id, "post_comment"),
            &snapshot(run_id, "abc123", Vec::new()),
        );
        assert!(decision.allowed);
        assert_eq!(decision.class, OperationClass::Safe);
    }

    #[test]
    fn approval_on_current_patch_allows_gated_operation() {
        let run_id = RunId::new();
        let granted = approval(run_id, "abc123", ApprovalDecision::Approved);
        let decision = check(
            &classifier(),
            &request(run_id, "push"),
            &snapshot(run_id, "abc123", vec![granted.clone()]),
        );
        assert!(decision.allowed);
        assert_eq!(decision.approval_id, Some(granted.approval_id));
    }

    #[test]
    fn approval_of_a_previous_patch_is_not_enough() {
        let run_id = RunId::new();
        let decision = check(
            &classifier(),
            &request(run_id, "commit"),
            &snapshot(
                run_id,
                "def456",
                vec![approval(run_id, "abc123", ApprovalDecision::Approved)],
            ),
        );
        assert!(!decision.allowed);
        let reason = decision.reason.unwrap_or_default();
        assert!(reason.contains("abc123") && reason.contains("def456"), "{reason}");
    }

    #[test]
    fn later_rejection_overrides_earlier_approval() {
        let run_id = RunId::new();
        let decision = check(
            &classifier(),
            &request(run_id, "merge"),
            &snapshot(
                run_id,
                "abc123",
                vec![
                    approval(run_id, "abc123", ApprovalDecision::Approved),
                    approval(run_id, "abc123", ApprovalDecision::Rejected),
                ],
            ),
        );
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap_or_default().contains("rejected"));
    }

    #[test]
    fn unknown_operations_and_finished_runs_are_gated() {
        let run_id = RunId::new();
        let approved = vec![approval(run_id, "abc123", ApprovalDecision::Approved)];

        let unknown = check(
            &classifier(),
            &request(run_id, "delete_branch"),
            &snapshot(run_id, "abc123", Vec::new()),
        );
        assert!(!unknown.allowed);
        assert_eq!(unknown.class, OperationClass::Gated);

        let mut finished = snapshot(run_id, "abc123", approved);
        finished.status = RunStatus::Aborted;
        assert!(!check(&classifier(), &request(run_id, "push"), &finished).allowed);

        let mut empty = snapshot(run_id, "abc123", Vec::new());
        empty.current_patch_hash = None;
        assert!(!check(&classifier(), &request(run_id, "push"), &empty).allowed);
    }

    #[tokio::test]
    async fn refused_gated_call_is_audited_and_never_forwarded() {
        let run_id = RunId::new();
        let state = FakeState::with(snapshot(
            run_id,
            "def456",
            vec![approval(run_id, "abc123", ApprovalDecision::Approved)],
        ));
        let gate = must(CapabilityGate::new(
            Arc::clone(&state),
            RecordingClient::default(),
            &GateConfig::default(),
        ));

        let result = gate.invoke(&request(run_id, "push"), "code-generator").await;
        assert!(matches!(
            result,
            Err(GateError::Backbone(BackboneError::ApprovalInvalidated { .. }))
        ));
        assert!(must(gate.client.calls.lock()).is_empty());
        assert_eq!(must(state.denied.lock()).len(), 1);
        assert!(must(state.executed.lock()).is_empty());
    }

    #[tokio::test]
    async fn approved_gated_call_is_forwarded_and_audited() {
        let run_id = RunId::new();
        let granted = approval(run_id, "abc123", ApprovalDecision::Approved);
        let state = FakeState::with(snapshot(run_id, "abc123", vec![granted.clone()]));
        let gate = must(CapabilityGate::new(
            Arc::clone(&state),
            RecordingClient::default(),
            &GateConfig::default(),
        ));

        let result = must(gate.invoke(&request(run_id, "open-pull-request"), "applier").await);
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(
            must(state.executed.lock()).as_slice(),
            &[("open-pull-request".to_string(), granted.approval_id)]
        );
    }

    #[tokio::test]
    async fn safe_calls_skip_state_and_audit() {
        let run_id = RunId::new();
        let state = Arc::new(FakeState::default());
        let gate = must(CapabilityGate::new(
            Arc::clone(&state),
            RecordingClient::default(),
            &GateConfig::default(),
        ));

        must(gate.invoke(&request(run_id, "read_file"), "planner").await);
        assert_eq!(must(gate.client.calls.lock()).as_slice(), &["read_file".to_string()]);
        assert!(must(state.executed.lock()).is_empty());
        assert!(must(state.denied.lock()).is_empty());
    }
}
