#![forbid(unsafe_code)]
//! The run ledger: the only writer of run state.
//!
//! Every mutation goes through a compare-and-set transition recorded in the
//! run's audit log. Step dispatch, approvals, triage and bundle export are
//! layered on top of the same store handle.

mod agent;
mod approvals;
mod blocking;
mod bundle;
mod dispatch;
mod lease;
mod retry;
pub mod telemetry;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use agent_backbone_domain::{
    project_run, summarize, verify_chain, ArtifactRecord, AuditEvent, AuditEventDraft,
    AuditEventType, AuditVerification, BackboneConfig, BackboneError, BackboneResult, Checkpoint,
    Clock, IdempotencyOutcome, LockLease, NewRun, RunId, RunProjection, RunRecord, RunStatus,
    StartRunRequest, StepRecord, StepStatus, SystemClock,
};
use agent_backbone_policy::{check_artifact, SecretScanner};
use agent_backbone_scoring::{ChangeMetadata, ModelAdjustment, TriageResult};
use agent_backbone_store_core::{
    ArtifactStore, AuditLog, BackboneStore, CheckpointStore, IdempotencyClaim, IdempotencyStore,
    ProjectionRepair, RunLockStore, RunStore,
};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub use agent::{Agent, AgentFailure, AgentOutput, CancelSignal, StepContext};
pub use approvals::current_approval;
pub use lease::LeaseKeeper;
pub use retry::RetryPolicy;

pub const TRIAGE_RESULT_ARTIFACT: &str = "triage_result.json";
pub const PATCH_ARTIFACT: &str = "patch.diff";
pub const APPROVAL_ARTIFACT: &str = "approval.json";

#[derive(Debug, Clone, PartialEq)]
pub struct StartRunOutcome {
    pub run: RunRecord,
    /// `false` when an idempotency key replayed an earlier run.
    pub created: bool,
}

/// Where a restarted worker should pick a run back up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub run_id: RunId,
    pub status: RunStatus,
    pub latest_checkpoint: Option<Checkpoint>,
    /// Agents whose steps already completed or were skipped, in step order.
    pub completed_agents: Vec<String>,
}

impl ResumePoint {
    #[must_use]
    pub fn is_done(&self, agent: &str) -> bool {
        self.completed_agents.iter().any(|name| name == agent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionReport {
    pub run_id: RunId,
    pub consistent: bool,
    pub mismatches: Vec<String>,
}

pub struct RunLedger<S> {
    store: Mutex<S>,
    config: BackboneConfig,
    clock: Arc<dyn Clock>,
    scanner: SecretScanner,
    storage_retry: RetryPolicy,
    cancellations: Mutex<HashMap<RunId, watch::Sender<bool>>>,
}

impl<S: BackboneStore> RunLedger<S> {
    /// # Errors
    /// Returns [`BackboneError::Configuration`] for an invalid config, or a
    /// storage error if the schema cannot be migrated.
    pub fn new(mut store: S, config: BackboneConfig) -> BackboneResult<Self> {
        config.validate()?;
        let scanner = SecretScanner::from_config(&config.artifacts)?;
        store.migrate()?;
        Ok(Self {
            store: Mutex::new(store),
            storage_retry: RetryPolicy::from(&config.storage.retry),
            config,
            clock: Arc::new(SystemClock),
            scanner,
            cancellations: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    pub(crate) fn now(&self) -> agent_backbone_domain::DateTimeUtc {
        self.clock.now()
    }

    /// Run `op` against the store, retrying transient storage failures with backoff.
    /// The store guard never outlives the closure. Inside a multi-threaded tokio
    /// runtime the whole call, backoff included, is moved off the async worker.
    pub(crate) fn with_store<T>(
        &self,
        operation: &str,
        op: impl FnMut(&mut S) -> BackboneResult<T>,
    ) -> BackboneResult<T> {
        blocking::offload(|| self.with_store_blocking(operation, op))
    }

    fn with_store_blocking<T>(
        &self,
        operation: &str,
        mut op: impl FnMut(&mut S) -> BackboneResult<T>,
    ) -> BackboneResult<T> {
        let mut attempt = 1;
        loop {
            let result = {
                let mut guard = self
                    .store
                    .lock()
                    .map_err(|_| BackboneError::Storage(anyhow!("store mutex poisoned")))?;
                op(&mut guard)
            };
            match result {
                Err(BackboneError::TransientStorage(err))
                    if self.storage_retry.allows_another(attempt) =>
                {
                    let delay = self.storage_retry.next_delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying transient storage failure"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(BackboneError::TransientStorage(err)) => {
                    error!(
                        operation,
                        attempts = attempt,
                        error = %err,
                        "storage retries exhausted"
                    );
                    return Err(BackboneError::Storage(err));
                }
                other => return other,
            }
        }
    }

    /// Create a run, or return the run an earlier delivery of the same key created.
    ///
    /// # Errors
    /// `Validation` for malformed requests or a reused key with a different
    /// request, `IdempotencyInFlight` while another caller holds the key.
    pub fn start_run(&self, request: &StartRunRequest) -> BackboneResult<StartRunOutcome> {
        request.validate()?;
        let now = self.now();
        let claim_ttl = std::time::Duration::from_millis(self.config.idempotency.claim_ttl_ms);

        let claim = match &request.idempotency_key {
            Some(key) => {
                let fingerprint = request.fingerprint()?;
                let outcome = self.with_store("begin_or_get", |store| {
                    store.begin_or_get(&request.tenant_id, key, &fingerprint, claim_ttl, now)
                })?;
                match outcome {
                    IdempotencyOutcome::Fresh => Some(IdempotencyClaim {
                        scope: request.tenant_id.clone(),
                        key: key.clone(),
                    }),
                    IdempotencyOutcome::InFlight { .. } => {
                        warn!(tenant_id = %request.tenant_id, key, "trigger already in flight");
                        return Err(BackboneError::IdempotencyInFlight { key: key.clone() });
                    }
                    IdempotencyOutcome::Completed(result) => {
                        return self.replayed_run(key, &result);
                    }
                }
            }
            None => None,
        };

        let run = NewRun::from_request(request, now);
        let created = self.with_store("create_run", |store| {
            store.create_run(&run, &request.trigger.actor, claim.as_ref())
        });
        match created {
            Ok(record) => {
                info!(
                    run_id = %record.run_id,
                    tenant_id = %record.tenant_id,
                    repo_id = %record.repo_id,
                    run_type = record.run_type.as_str(),
                    "run created"
                );
                Ok(StartRunOutcome {
                    run: record,
                    created: true,
                })
            }
            Err(BackboneError::IdempotencyInFlight { key }) => {
                let fingerprint = request.fingerprint()?;
                let outcome = self.with_store("begin_or_get", |store| {
                    store.begin_or_get(&request.tenant_id, &key, &fingerprint, claim_ttl, now)
                })?;
                match outcome {
                    IdempotencyOutcome::Completed(result) => self.replayed_run(&key, &result),
                    _ => Err(BackboneError::IdempotencyInFlight { key }),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn replayed_run(&self, key: &str, result: &Value) -> BackboneResult<StartRunOutcome> {
        let run_id = result
            .get("run_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BackboneError::Storage(anyhow!("idempotency result for '{key}' has no run_id"))
            })
            .and_then(RunId::parse)?;
        let run = self.get_run(run_id)?;
        debug!(%run_id, key, "idempotent replay of trigger");
        Ok(StartRunOutcome {
            run,
            created: false,
        })
    }

    /// # Errors
    /// `NotFound` for unknown runs.
    pub fn get_run(&self, run_id: RunId) -> BackboneResult<RunRecord> {
        self.with_store("get_run", |store| store.get_run(run_id))?
            .ok_or_else(|| BackboneError::not_found("run", run_id))
    }

    /// # Errors
    /// Returns a storage error if steps cannot be read.
    pub fn list_steps(&self, run_id: RunId) -> BackboneResult<Vec<StepRecord>> {
        self.with_store("list_steps", |store| store.list_steps(run_id))
    }

    /// The optimistic-concurrency transition. Terminal transitions also persist
    /// the audit-derived summary.
    ///
    /// # Errors
    /// `IllegalTransition` (logged as a defect) or `StaleState`; neither mutates the run.
    pub fn transition(
        &self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
        payload: &Value,
        actor: &str,
    ) -> BackboneResult<RunRecord> {
        let now = self.now();
        let result = self.with_store("transition_run", |store| {
            store.transition_run(run_id, from, to, payload, actor, now)
        });
        let (record, event) = match result {
            Ok(done) => done,
            Err(err @ BackboneError::IllegalTransition { .. }) => {
                error!(%run_id, %from, %to, actor, "illegal run transition requested");
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        info!(%run_id, %from, %to, actor, run_seq = event.run_seq, "run transitioned");

        if to.is_terminal() {
            return self.finalize(run_id);
        }
        Ok(record)
    }

    fn finalize(&self, run_id: RunId) -> BackboneResult<RunRecord> {
        let events = self.list_audit_events(run_id)?;
        let summary = summarize(&events);
        self.with_store("set_run_summary", |store| {
            store.set_run_summary(run_id, &summary)
        })?;
        self.signal_cancel(run_id);
        info!(%run_id, summary = %summary, "run reached terminal state");
        self.get_run(run_id)
    }

    /// Move a non-terminal run to `failed`, whatever state it is in now.
    pub(crate) fn fail_run(
        &self,
        run_id: RunId,
        payload: &Value,
        actor: &str,
    ) -> BackboneResult<RunRecord> {
        self.force_terminal(run_id, RunStatus::Failed, payload, actor)
    }

    fn force_terminal(
        &self,
        run_id: RunId,
        target: RunStatus,
        payload: &Value,
        actor: &str,
    ) -> BackboneResult<RunRecord> {
        loop {
            let current = self.get_run(run_id)?;
            if current.status.is_terminal() {
                if current.status == target {
                    return Ok(current);
                }
                return Err(BackboneError::IllegalTransition {
                    run_id,
                    from: current.status,
                    to: target,
                });
            }
            match self.transition(run_id, current.status, target, payload, actor) {
                Err(BackboneError::StaleState { .. }) => {
                    debug!(
                        %run_id,
                        target = %target,
                        "run moved during forced transition, re-reading"
                    );
                }
                other => return other,
            }
        }
    }

    /// Unconditionally abort a run and signal any in-flight step to stop.
    ///
    /// # Errors
    /// `IllegalTransition` if the run already ended as `done` or `failed`.
    pub fn abort(&self, run_id: RunId, reason: &str, actor: &str) -> BackboneResult<RunRecord> {
        let record = self.force_terminal(
            run_id,
            RunStatus::Aborted,
            &json!({"reason": reason}),
            actor,
        )?;
        self.signal_cancel(run_id);
        warn!(%run_id, actor, reason, "run aborted");
        Ok(record)
    }

    pub(crate) fn cancel_signal(&self, run_id: RunId) -> BackboneResult<CancelSignal> {
        let mut registry = self
            .cancellations
            .lock()
            .map_err(|_| BackboneError::Storage(anyhow!("cancellation registry poisoned")))?;
        let sender = registry
            .entry(run_id)
            .or_insert_with(|| watch::channel(false).0);
        Ok(CancelSignal::new(sender.subscribe()))
    }

    /// Drop the cancel registration of a run this worker no longer holds,
    /// without signalling it.
    pub(crate) fn forget_run(&self, run_id: RunId) {
        if let Ok(mut registry) = self.cancellations.lock() {
            if registry.remove(&run_id).is_some() {
                debug!(%run_id, "cancel registration dropped");
            }
        }
    }

    fn signal_cancel(&self, run_id: RunId) {
        if let Ok(mut registry) = self.cancellations.lock() {
            if let Some(sender) = registry.remove(&run_id) {
                sender.send_replace(true);
            }
        }
    }

    /// Score the change, store `triage_result.json` and move the run to `triaged`.
    ///
    /// # Errors
    /// `Validation` when the model adjustment is rejected; the run stays queued.
    pub fn triage(
        &self,
        run_id: RunId,
        metadata: &ChangeMetadata,
        adjustment: Option<&ModelAdjustment>,
        actor: &str,
    ) -> BackboneResult<TriageResult> {
        let result = agent_backbone_scoring::triage(run_id, metadata, adjustment)?;
        let body = serde_json::to_vec_pretty(&result)
            .map_err(|err| BackboneError::Validation(format!("triage result: {err}")))?;
        let artifact = self.write_artifact(run_id, TRIAGE_RESULT_ARTIFACT, &body)?;
        self.transition(
            run_id,
            RunStatus::Queued,
            RunStatus::Triaged,
            &json!({
                "baseline_score": result.baseline_score,
                "final_score": result.final_score,
                "model_adjustment": result.model_adjustment,
                "triage_artifact_hash": artifact.content_hash,
            }),
            actor,
        )?;
        Ok(result)
    }

    /// Policy-checked artifact write. A secret match is audited and refused.
    ///
    /// # Errors
    /// `Validation` for bad names or sizes, `SecretDetected` on a pattern match.
    pub fn write_artifact(
        &self,
        run_id: RunId,
        name: &str,
        content: &[u8],
    ) -> BackboneResult<ArtifactRecord> {
        self.screen_artifact(run_id, name, content)?;
        let now = self.now();
        self.with_store("write_artifact", |store| {
            store.write_artifact(run_id, name, content, now)
        })
    }

    /// Name, size and secret checks for content about to be stored as an artifact.
    pub(crate) fn screen_artifact(
        &self,
        run_id: RunId,
        name: &str,
        content: &[u8],
    ) -> BackboneResult<()> {
        let Err(err) = check_artifact(&self.scanner, &self.config.artifacts, name, content) else {
            return Ok(());
        };
        if let BackboneError::SecretDetected { pattern, .. } = &err {
            warn!(%run_id, name, pattern, "artifact rejected by secret scan");
            self.append_audit_event(&AuditEventDraft::new(
                run_id,
                AuditEventType::Error,
                "artifact-store",
                json!({"kind": "secret_detected", "name": name, "pattern": pattern}),
            ))?;
        }
        Err(err)
    }

    /// # Errors
    /// Returns a storage error if the artifact cannot be read.
    pub fn read_artifact(&self, run_id: RunId, name: &str) -> BackboneResult<Option<Vec<u8>>> {
        self.with_store("read_artifact", |store| store.read_artifact(run_id, name))
    }

    /// # Errors
    /// Returns a storage error if artifacts cannot be listed.
    pub fn list_artifacts(&self, run_id: RunId) -> BackboneResult<Vec<ArtifactRecord>> {
        self.with_store("list_artifacts", |store| store.list_artifacts(run_id))
    }

    /// # Errors
    /// `NotFound` for unknown runs.
    pub fn append_audit_event(&self, draft: &AuditEventDraft) -> BackboneResult<AuditEvent> {
        let now = self.now();
        self.with_store("append_audit_event", |store| {
            store.append_audit_event(draft, now)
        })
    }

    /// # Errors
    /// Returns a storage error if the log cannot be read.
    pub fn list_audit_events(&self, run_id: RunId) -> BackboneResult<Vec<AuditEvent>> {
        self.with_store("list_audit_events", |store| store.list_audit_events(run_id))
    }

    /// # Errors
    /// `LockHeld` while another worker's lease is live.
    pub fn acquire_lock(&self, run_id: RunId, holder: &str) -> BackboneResult<LockLease> {
        let now = self.now();
        let ttl = self.config.lock.ttl();
        self.with_store("acquire_lock", |store| {
            store.acquire_lock(run_id, holder, ttl, now)
        })
    }

    /// # Errors
    /// `LockLost` when the lease expired and was taken, or was released.
    pub fn renew(&self, lease: &LockLease) -> BackboneResult<LockLease> {
        let now = self.now();
        let ttl = self.config.lock.ttl();
        self.with_store("renew_lock", |store| store.renew_lock(lease, ttl, now))
    }

    /// Give the lease back. Returns `false` when it had already expired or been
    /// taken over. Either way this worker stops tracking the run.
    ///
    /// # Errors
    /// Returns a storage error if the lease row cannot be updated.
    pub fn release(&self, lease: &LockLease) -> BackboneResult<bool> {
        let now = self.now();
        let released = self.with_store("release_lock", |store| store.release_lock(lease, now));
        self.forget_run(lease.run_id);
        released
    }

    /// Fail unless `lease` is still the live lease on its run.
    pub(crate) fn ensure_lease(&self, lease: &LockLease) -> BackboneResult<()> {
        let now = self.now();
        let current = self.with_store("current_lock", |store| {
            store.current_lock(lease.run_id, now)
        })?;
        match current {
            Some(live)
                if live.holder == lease.holder && live.fencing_token == lease.fencing_token =>
            {
                Ok(())
            }
            _ => {
                warn!(
                    run_id = %lease.run_id,
                    holder = %lease.holder,
                    "dispatch refused without a live lease"
                );
                self.forget_run(lease.run_id);
                Err(BackboneError::LockLost {
                    run_id: lease.run_id,
                    holder: lease.holder.clone(),
                })
            }
        }
    }

    /// # Errors
    /// `NotFound` for unknown runs.
    pub fn resume_point(&self, run_id: RunId) -> BackboneResult<ResumePoint> {
        let run = self.get_run(run_id)?;
        let latest_checkpoint =
            self.with_store("latest_checkpoint", |store| store.latest_checkpoint(run_id))?;
        let mut completed_agents: Vec<String> = Vec::new();
        for step in self.list_steps(run_id)? {
            if matches!(step.status, StepStatus::Completed | StepStatus::Skipped)
                && !completed_agents.contains(&step.agent)
            {
                completed_agents.push(step.agent);
            }
        }
        Ok(ResumePoint {
            run_id,
            status: run.status,
            latest_checkpoint,
            completed_agents,
        })
    }

    /// Record that `agent` is bypassed, typically because a checkpoint shows it already ran.
    ///
    /// # Errors
    /// `Aborted` or `Validation` when the run has ended.
    pub fn skip_step(
        &self,
        run_id: RunId,
        agent: &str,
        reason: &str,
        actor: &str,
    ) -> BackboneResult<StepRecord> {
        let now = self.now();
        let (step, _) = self.with_store("record_skipped_step", |store| {
            store.record_skipped_step(run_id, agent, reason, actor, now)
        })?;
        info!(%run_id, agent, reason, "step skipped");
        Ok(step)
    }

    /// # Errors
    /// Returns a storage error if the log cannot be read.
    pub fn verify_audit(&self, run_id: RunId) -> BackboneResult<AuditVerification> {
        let events = self.list_audit_events(run_id)?;
        let report = verify_chain(run_id, &events)?;
        if !report.chain_valid {
            error!(
                %run_id,
                first_invalid_seq = ?report.first_invalid_seq,
                "audit chain verification failed"
            );
        }
        Ok(report)
    }

    /// Compare the stored run and step rows against a fold of the audit log.
    ///
    /// # Errors
    /// `Validation` if the audit log itself cannot be folded.
    pub fn verify_projection(&self, run_id: RunId) -> BackboneResult<ProjectionReport> {
        let run = self.get_run(run_id)?;
        let projection = project_run(&self.list_audit_events(run_id)?)?;
        let steps = self.list_steps(run_id)?;

        let mut mismatches = Vec::new();
        if run.status != projection.status {
            mismatches.push(format!(
                "status: stored {} vs audit {}",
                run.status, projection.status
            ));
        }
        if run.approval_status != projection.approval_status {
            mismatches.push(format!(
                "approval_status: stored {} vs audit {}",
                run.approval_status.as_str(),
                projection.approval_status.as_str()
            ));
        }
        if run.patch_hash != projection.patch_hash {
            mismatches.push("patch_hash differs from last approval_requested".to_string());
        }
        if run.tokens_used != projection.tokens_used {
            mismatches.push(format!(
                "tokens_used: stored {} vs audit {}",
                run.tokens_used, projection.tokens_used
            ));
        }
        if steps.len() != projection.steps.len() {
            mismatches.push(format!(
                "steps: stored {} vs audit {}",
                steps.len(),
                projection.steps.len()
            ));
        }
        for step in &steps {
            match projection
                .steps
                .iter()
                .find(|projected| projected.step_id == step.step_id)
            {
                Some(projected) if projected.status == step.status => {}
                Some(projected) => mismatches.push(format!(
                    "step {}: stored {} vs audit {}",
                    step.step_id,
                    step.status.as_str(),
                    projected.status.as_str()
                )),
                None => mismatches.push(format!("step {} has no audit events", step.step_id)),
            }
        }

        if !mismatches.is_empty() {
            warn!(%run_id, count = mismatches.len(), "run projection diverges from audit log");
        }
        Ok(ProjectionReport {
            run_id,
            consistent: mismatches.is_empty(),
            mismatches,
        })
    }

}

impl<S: BackboneStore + ProjectionRepair> RunLedger<S> {
    /// Overwrite the derived run fields from the audit log fold. Repair only:
    /// the write bypasses the transition path and is not itself audited.
    ///
    /// # Errors
    /// `Validation` if the log cannot be folded.
    pub fn rebuild_projection(&self, run_id: RunId) -> BackboneResult<RunProjection> {
        let projection = project_run(&self.list_audit_events(run_id)?)?;
        self.with_store("apply_projection", |store| {
            store.apply_projection(&projection)
        })?;
        info!(%run_id, status = %projection.status, "run projection rebuilt from audit log");
        Ok(projection)
    }
}


#[cfg(test)]
mod tests {
    use agent_backbone_domain::{
        BackboneConfig, LockLease, RunId, RunType, StartRunRequest, Trigger, TriggerSource,
    };
    use agent_backbone_store_sqlite::SqliteBackboneStore;

    use super::RunLedger;

    fn must<T, E>(result: Result<T, E>) -> T {
        result.unwrap_or_else(|_| unreachable!())
    }

    fn ledger() -> RunLedger<SqliteBackboneStore> {
        let store = must(SqliteBackboneStore::open_in_memory());
        must(RunLedger::new(store, BackboneConfig::default()))
    }

    fn start(ledger: &RunLedger<SqliteBackboneStore>) -> RunId {
        let request = StartRunRequest {
            tenant_id: "acme".to_string(),
            repo_id: "widgets".to_string(),
            subject_id: "issue-12".to_string(),
            run_type: RunType::Plan,
            trigger: Trigger {
                source: TriggerSource::Interactive,
                actor: "dana".to_string(),
                command: Some("/plan".to_string()),
            },
            idempotency_key: None,
        };
        must(ledger.start_run(&request)).run.run_id
    }

    fn registered(ledger: &RunLedger<SqliteBackboneStore>, run_id: RunId) -> bool {
        ledger
            .cancellations
            .lock()
            .map(|registry| registry.contains_key(&run_id))
            .unwrap_or(false)
    }

    #[test]
    fn releasing_a_lease_drops_the_cancel_registration() {
        let ledger = ledger();
        let run_id = start(&ledger);
        let lease = must(ledger.acquire_lock(run_id, "worker-1"));
        must(ledger.cancel_signal(run_id));
        assert!(registered(&ledger, run_id));

        assert!(must(ledger.release(&lease)));
        assert!(!registered(&ledger, run_id));
    }

    #[test]
    fn a_lost_lease_drops_the_cancel_registration() {
        let ledger = ledger();
        let run_id = start(&ledger);
        let lease = must(ledger.acquire_lock(run_id, "worker-1"));
        let signal = must(ledger.cancel_signal(run_id));

        let forged = LockLease {
            fencing_token: lease.fencing_token + 1,
            ..lease.clone()
        };
        assert!(ledger.ensure_lease(&forged).is_err());
        assert!(!registered(&ledger, run_id));
        assert!(!signal.is_cancelled());

        assert!(ledger.ensure_lease(&lease).is_ok());
    }
}
