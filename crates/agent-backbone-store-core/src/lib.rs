#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

use std::time::Duration;

use agent_backbone_domain::{
    ApprovalRecord, ArtifactRecord, AuditEvent, AuditEventDraft, BackboneResult, Checkpoint,
    DateTimeUtc, IdempotencyOutcome, LockLease, NewRun, ProposedChangeSet, RunId, RunProjection,
    RunRecord, RunStatus, StepId, StepRecord,
};
use serde_json::Value;

/// Idempotency slot a new run should close when it is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyClaim {
    pub scope: String,
    pub key: String,
}

/// Outcome an agent reported for a running step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed {
        output: Value,
        tokens_in: u64,
        tokens_out: u64,
    },
    Failed {
        reason: String,
        error: String,
    },
}

/// A change set headed for human review, with its rendered patch.
#[derive(Debug, Clone, Copy)]
pub struct ChangeProposal<'a> {
    pub run_id: RunId,
    /// Status the run must be in: `review` for a first request, `awaiting_approval`
    /// for a revision.
    pub expected: RunStatus,
    pub changes: &'a ProposedChangeSet,
    pub patch_hash: &'a str,
    pub artifact_name: &'a str,
    pub patch: &'a [u8],
    pub actor: &'a str,
}

/// Runs, steps and approvals. Every mutating call appends its audit event in the
/// same transaction as the projection update.
pub trait RunStore {
    fn migrate(&mut self) -> BackboneResult<()>;

    /// Insert a `queued` run with its `run_created` event, closing `claim` if given.
    fn create_run(
        &mut self,
        run: &NewRun,
        actor: &str,
        claim: Option<&IdempotencyClaim>,
    ) -> BackboneResult<RunRecord>;

    fn get_run(&self, run_id: RunId) -> BackboneResult<Option<RunRecord>>;

    /// Compare-and-set the run status.
    ///
    /// # Errors
    /// `IllegalTransition` when `to` is not a successor of `from`, `StaleState`
    /// when the persisted status is not `from`. Neither mutates anything.
    fn transition_run(
        &mut self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
        payload: &Value,
        actor: &str,
        now: DateTimeUtc,
    ) -> BackboneResult<(RunRecord, AuditEvent)>;

    fn set_run_summary(&mut self, run_id: RunId, summary: &str) -> BackboneResult<()>;

    /// Store a change set with its patch artifact and reopen approval for it.
    /// From `review` the run also moves to `awaiting_approval`; a run already
    /// awaiting approval is revised in place. One transaction covers all of it.
    ///
    /// # Errors
    /// `StaleState` when the run is not in `proposal.expected`, `Validation`
    /// when `expected` is neither `review` nor `awaiting_approval`. Neither
    /// mutates anything.
    fn propose_changes(
        &mut self,
        proposal: &ChangeProposal<'_>,
        now: DateTimeUtc,
    ) -> BackboneResult<(RunRecord, AuditEvent)>;

    /// # Errors
    /// `ApprovalInvalidated` when the decision's patch hash is not the run's
    /// current one, or the run is not awaiting approval.
    fn record_approval(
        &mut self,
        approval: &ApprovalRecord,
    ) -> BackboneResult<(RunRecord, AuditEvent)>;

    fn list_approvals(&self, run_id: RunId) -> BackboneResult<Vec<ApprovalRecord>>;

    fn start_step(
        &mut self,
        run_id: RunId,
        agent: &str,
        attempt: u32,
        input: &Value,
        actor: &str,
        now: DateTimeUtc,
    ) -> BackboneResult<(StepRecord, AuditEvent)>;

    fn finish_step(
        &mut self,
        step_id: StepId,
        outcome: &StepOutcome,
        actor: &str,
        now: DateTimeUtc,
    ) -> BackboneResult<(StepRecord, AuditEvent)>;

    fn record_skipped_step(
        &mut self,
        run_id: RunId,
        agent: &str,
        reason: &str,
        actor: &str,
        now: DateTimeUtc,
    ) -> BackboneResult<(StepRecord, AuditEvent)>;

    fn get_step(&self, step_id: StepId) -> BackboneResult<Option<StepRecord>>;

    fn list_steps(&self, run_id: RunId) -> BackboneResult<Vec<StepRecord>>;
}

/// Append-only, per-run hash-chained audit log.
pub trait AuditLog {
    fn append_audit_event(
        &mut self,
        draft: &AuditEventDraft,
        now: DateTimeUtc,
    ) -> BackboneResult<AuditEvent>;

    fn list_audit_events(&self, run_id: RunId) -> BackboneResult<Vec<AuditEvent>>;
}

/// Named, versioned artifacts namespaced by tenant/repo/run.
pub trait ArtifactStore {
    /// Writing identical content under the same name returns the existing record.
    fn write_artifact(
        &mut self,
        run_id: RunId,
        name: &str,
        content: &[u8],
        now: DateTimeUtc,
    ) -> BackboneResult<ArtifactRecord>;

    /// Latest version of `name`; the reserved audit log name renders the audit log.
    fn read_artifact(&self, run_id: RunId, name: &str) -> BackboneResult<Option<Vec<u8>>>;

    fn list_artifacts(&self, run_id: RunId) -> BackboneResult<Vec<ArtifactRecord>>;
}

/// Lease-based run lock shared by every worker.
pub trait RunLockStore {
    /// # Errors
    /// `LockHeld` while another holder's lease is unexpired.
    fn acquire_lock(
        &mut self,
        run_id: RunId,
        holder: &str,
        ttl: Duration,
        now: DateTimeUtc,
    ) -> BackboneResult<LockLease>;

    /// # Errors
    /// `LockLost` when the lease expired and was taken, or was released.
    fn renew_lock(
        &mut self,
        lease: &LockLease,
        ttl: Duration,
        now: DateTimeUtc,
    ) -> BackboneResult<LockLease>;

    /// Returns whether the caller still held a live lease when releasing it;
    /// `false` once the lease expired at `now` or was taken over.
    fn release_lock(&mut self, lease: &LockLease, now: DateTimeUtc) -> BackboneResult<bool>;

    fn current_lock(&self, run_id: RunId, now: DateTimeUtc) -> BackboneResult<Option<LockLease>>;
}

pub trait IdempotencyStore {
    /// # Errors
    /// `Validation` when `key` was first used with a different request hash.
    fn begin_or_get(
        &mut self,
        scope: &str,
        key: &str,
        request_hash: &str,
        claim_ttl: Duration,
        now: DateTimeUtc,
    ) -> BackboneResult<IdempotencyOutcome>;

    fn complete_idempotency(
        &mut self,
        scope: &str,
        key: &str,
        result: &Value,
        now: DateTimeUtc,
    ) -> BackboneResult<()>;
}

pub trait CheckpointStore {
    fn save_checkpoint(
        &mut self,
        run_id: RunId,
        step_id: StepId,
        agent: &str,
        state: &Value,
        now: DateTimeUtc,
    ) -> BackboneResult<Checkpoint>;

    fn latest_checkpoint(&self, run_id: RunId) -> BackboneResult<Option<Checkpoint>>;

    fn list_checkpoints(&self, run_id: RunId) -> BackboneResult<Vec<Checkpoint>>;
}

/// Repair path for run rows that drifted from their audit log.
///
/// Writes the derived fields directly: no compare-and-set and no audit event.
/// Only a fold of the run's own audit log may be applied; normal state changes
/// go through [`RunStore::transition_run`].
pub trait ProjectionRepair {
    fn apply_projection(&mut self, projection: &RunProjection) -> BackboneResult<()>;
}

/// Everything the ledger needs from a storage backend.
pub trait BackboneStore:
    RunStore + AuditLog + ArtifactStore + RunLockStore + IdempotencyStore + CheckpointStore + Send
{
}

impl<T> BackboneStore for T where
    T: RunStore + AuditLog + ArtifactStore + RunLockStore + IdempotencyStore + CheckpointStore + Send
{
}
