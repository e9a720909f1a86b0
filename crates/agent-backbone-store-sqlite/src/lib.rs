#![forbid(unsafe_code)]

mod artifacts;
mod audit;
mod coordination;
mod runs;

use std::path::Path;
use std::time::Duration;

use agent_backbone_domain::{
    format_rfc3339, now_utc, parse_rfc3339, ApprovalRecord, ArtifactRecord, AuditEvent,
    AuditEventDraft, BackboneError, BackboneResult, Checkpoint, DateTimeUtc, IdempotencyOutcome,
    LockLease, NewRun, RunId, RunProjection, RunRecord, RunStatus, StepId, StepRecord,
};
use agent_backbone_store_core::{
    ArtifactStore, AuditLog, ChangeProposal, CheckpointStore, IdempotencyClaim, IdempotencyStore,
    ProjectionRepair, RunLockStore, RunStore, StepOutcome,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, Transaction, TransactionBehavior};
use serde_json::Value;
use time::OffsetDateTime;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  tenant_id TEXT NOT NULL,
  repo_id TEXT NOT NULL,
  subject_id TEXT NOT NULL,
  run_type TEXT NOT NULL CHECK (run_type IN ('triage','plan','resolve','review','autopilot')),
  status TEXT NOT NULL CHECK (
    status IN (
      'queued','triaged','planned','resolving','review',
      'awaiting_approval','applying','done','failed','aborted'
    )
  ),
  state_payload_json TEXT NOT NULL DEFAULT '{}',
  trigger_json TEXT NOT NULL,
  approval_status TEXT NOT NULL DEFAULT 'none'
    CHECK (approval_status IN ('none','pending','approved','rejected')),
  proposed_changes_json TEXT,
  patch_hash TEXT,
  tokens_used INTEGER NOT NULL DEFAULT 0 CHECK (tokens_used >= 0),
  summary TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_tenant_repo
  ON runs(tenant_id, repo_id, created_at);

CREATE TRIGGER IF NOT EXISTS trg_runs_terminal_status_final
BEFORE UPDATE OF status ON runs
WHEN OLD.status IN ('done','failed','aborted') AND NEW.status <> OLD.status
BEGIN
  SELECT RAISE(FAIL, 'terminal run status is final');
END;

CREATE TRIGGER IF NOT EXISTS trg_runs_no_delete
BEFORE DELETE ON runs
BEGIN
  SELECT RAISE(FAIL, 'runs are never deleted');
END;

CREATE TABLE IF NOT EXISTS steps (
  step_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  step_seq INTEGER NOT NULL CHECK (step_seq >= 1),
  agent TEXT NOT NULL,
  attempt INTEGER NOT NULL CHECK (attempt >= 1),
  status TEXT NOT NULL CHECK (status IN ('pending','running','completed','failed','skipped')),
  input_json TEXT NOT NULL,
  output_json TEXT,
  error TEXT,
  started_at TEXT,
  finished_at TEXT,
  duration_ms INTEGER CHECK (duration_ms IS NULL OR duration_ms >= 0),
  tokens_in INTEGER NOT NULL DEFAULT 0 CHECK (tokens_in >= 0),
  tokens_out INTEGER NOT NULL DEFAULT 0 CHECK (tokens_out >= 0),
  UNIQUE(run_id, step_seq),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TRIGGER IF NOT EXISTS trg_steps_terminal_immutable
BEFORE UPDATE ON steps
WHEN OLD.status IN ('completed','failed','skipped')
BEGIN
  SELECT RAISE(FAIL, 'steps are immutable once terminal');
END;

CREATE TRIGGER IF NOT EXISTS trg_steps_no_delete
BEFORE DELETE ON steps
BEGIN
  SELECT RAISE(FAIL, 'steps are append-only');
END;

CREATE TABLE IF NOT EXISTS approvals (
  approval_id TEXT PRIMARY KEY,
  run_id TEXT NOT NULL,
  decision TEXT NOT NULL CHECK (decision IN ('approved','rejected')),
  decided_by TEXT NOT NULL,
  decided_at TEXT NOT NULL,
  patch_hash TEXT NOT NULL,
  reason TEXT,
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE INDEX IF NOT EXISTS idx_approvals_run ON approvals(run_id, decided_at);

CREATE TRIGGER IF NOT EXISTS trg_approvals_no_update
BEFORE UPDATE ON approvals
BEGIN
  SELECT RAISE(FAIL, 'approvals is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_approvals_no_delete
BEFORE DELETE ON approvals
BEGIN
  SELECT RAISE(FAIL, 'approvals is append-only');
END;

CREATE TABLE IF NOT EXISTS audit_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  run_id TEXT NOT NULL,
  run_seq INTEGER NOT NULL CHECK (run_seq >= 1),
  event_type TEXT NOT NULL CHECK (
    event_type IN (
      'run_created',
      'state_transition',
      'step_started',
      'step_completed',
      'step_failed',
      'approval_requested',
      'approval_granted',
      'approval_rejected',
      'gated_operation_executed',
      'error'
    )
  ),
  actor TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  details_json TEXT NOT NULL,
  details_hash TEXT NOT NULL,
  prev_event_hash TEXT,
  event_hash TEXT NOT NULL,
  UNIQUE(run_id, run_seq),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TRIGGER IF NOT EXISTS trg_audit_events_no_update
BEFORE UPDATE ON audit_events
BEGIN
  SELECT RAISE(FAIL, 'audit_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_audit_events_no_delete
BEFORE DELETE ON audit_events
BEGIN
  SELECT RAISE(FAIL, 'audit_events is append-only');
END;

CREATE TABLE IF NOT EXISTS artifacts (
  run_id TEXT NOT NULL,
  name TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  content_hash TEXT NOT NULL,
  path TEXT NOT NULL,
  content BLOB NOT NULL,
  size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
  created_at TEXT NOT NULL,
  PRIMARY KEY (run_id, name, version),
  FOREIGN KEY (run_id) REFERENCES runs(run_id)
);

CREATE TRIGGER IF NOT EXISTS trg_artifacts_no_update
BEFORE UPDATE ON artifacts
BEGIN
  SELECT RAISE(FAIL, 'artifacts is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_artifacts_no_delete
BEFORE DELETE ON artifacts
BEGIN
  SELECT RAISE(FAIL, 'artifacts is append-only');
END;

CREATE TABLE IF NOT EXISTS run_locks (
  run_id TEXT PRIMARY KEY,
  holder TEXT NOT NULL,
  fencing_token INTEGER NOT NULL CHECK (fencing_token >= 1),
  acquired_at TEXT NOT NULL,
  expires_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS idempotency_keys (
  scope TEXT NOT NULL,
  idem_key TEXT NOT NULL,
  request_hash TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('processing','completed')),
  result_json TEXT,
  claimed_at_ms INTEGER NOT NULL,
  completed_at TEXT,
  PRIMARY KEY (scope, idem_key)
);

CREATE TABLE IF NOT EXISTS checkpoints (
  run_id TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  step_id TEXT NOT NULL,
  agent TEXT NOT NULL,
  state_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  PRIMARY KEY (run_id, version),
  FOREIGN KEY (run_id) REFERENCES runs(run_id),
  FOREIGN KEY (step_id) REFERENCES steps(step_id)
);

CREATE TRIGGER IF NOT EXISTS trg_checkpoints_no_update
BEFORE UPDATE ON checkpoints
BEGIN
  SELECT RAISE(FAIL, 'checkpoints is append-only');
END;
";

/// `SQLite` backend for every backbone store trait. One instance wraps one
/// connection; independent workers open their own instance on the same file.
pub struct SqliteBackboneStore {
    conn: Connection,
}

impl SqliteBackboneStore {
    /// Open or create a database file and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> BackboneResult<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))
            .map_err(storage_error)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")
        .map_err(storage_error)?;

        Ok(Self { conn })
    }

    /// Private in-memory database, mostly for tests and dry runs.
    ///
    /// # Errors
    /// Returns an error if the database cannot be created.
    pub fn open_in_memory() -> BackboneResult<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn immediate(&mut self) -> Result<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin immediate transaction")
    }
}

/// Map an internal failure onto the backbone taxonomy: typed errors pass
/// through, busy/locked databases become transient, the rest is fatal storage.
pub(crate) fn storage_error(err: anyhow::Error) -> BackboneError {
    let transient = err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(failure, _))
                if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    });
    if transient {
        tracing::warn!(error = %err, "sqlite reported a transient busy/locked condition");
        return BackboneError::TransientStorage(err);
    }
    BackboneError::from(err)
}

impl RunStore for SqliteBackboneStore {
    fn migrate(&mut self) -> BackboneResult<()> {
        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply backbone schema")
            .map_err(storage_error)?;

        let now = rfc3339(now_utc()).map_err(storage_error)?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )
            .context("failed to record backbone migration")
            .map_err(storage_error)?;
        Ok(())
    }

    fn create_run(
        &mut self,
        run: &NewRun,
        actor: &str,
        claim: Option<&IdempotencyClaim>,
    ) -> BackboneResult<RunRecord> {
        let mut inner = || -> Result<RunRecord> {
            let tx = self.immediate()?;
            runs::insert_run(&tx, run, actor, claim)?;
            let record = runs::require_run(&tx, run.run_id)?;
            tx.commit().context("failed to commit run creation")?;
            Ok(record)
        };
        inner().map_err(storage_error)
    }

    fn get_run(&self, run_id: RunId) -> BackboneResult<Option<RunRecord>> {
        runs::load_run(&self.conn, run_id).map_err(storage_error)
    }

    fn transition_run(
        &mut self,
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
        payload: &Value,
        actor: &str,
        now: DateTimeUtc,
    ) -> BackboneResult<(RunRecord, AuditEvent)> {
        if !from.can_transition_to(to) {
            return Err(BackboneError::IllegalTransition { run_id, from, to });
        }
        let mut inner = || -> Result<(RunRecord, AuditEvent)> {
            let tx = self.immediate()?;
            let event = runs::transition(&tx, run_id, from, to, payload, actor, now)?;
            let record = runs::require_run(&tx, run_id)?;
            tx.commit().context("failed to commit transition")?;
            Ok((record, event))
        };
        inner().map_err(storage_error)
    }

    fn set_run_summary(&mut self, run_id: RunId, summary: &str) -> BackboneResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs SET summary = ?2 WHERE run_id = ?1",
                params![run_id.to_string(), summary],
            )
            .context("failed to store run summary")
            .map_err(storage_error)?;
        if changed == 0 {
            return Err(BackboneError::not_found("run", run_id));
        }
        Ok(())
    }

    fn propose_changes(
        &mut self,
        proposal: &ChangeProposal<'_>,
        now: DateTimeUtc,
    ) -> BackboneResult<(RunRecord, AuditEvent)> {
        let mut inner = || -> Result<(RunRecord, AuditEvent)> {
            let tx = self.immediate()?;
            let event = runs::propose_changes(&tx, proposal, now)?;
            let record = runs::require_run(&tx, proposal.run_id)?;
            tx.commit().context("failed to commit proposed changes")?;
            Ok((record, event))
        };
        inner().map_err(storage_error)
    }

    fn record_approval(
        &mut self,
        approval: &ApprovalRecord,
    ) -> BackboneResult<(RunRecord, AuditEvent)> {
        let mut inner = || -> Result<(RunRecord, AuditEvent)> {
            let tx = self.immediate()?;
            let event = runs::record_approval(&tx, approval)?;
            let record = runs::require_run(&tx, approval.run_id)?;
            tx.commit().context("failed to commit approval")?;
            Ok((record, event))
        };
        inner().map_err(storage_error)
    }

    fn list_approvals(&self, run_id: RunId) -> BackboneResult<Vec<ApprovalRecord>> {
        runs::list_approvals(&self.conn, run_id).map_err(storage_error)
    }

    fn start_step(
        &mut self,
        run_id: RunId,
        agent: &str,
        attempt: u32,
        input: &Value,
        actor: &str,
        now: DateTimeUtc,
    ) -> BackboneResult<(StepRecord, AuditEvent)> {
        let mut inner = || -> Result<(StepRecord, AuditEvent)> {
            let tx = self.immediate()?;
            let (step_id, event) = runs::start_step(&tx, run_id, agent, attempt, input, actor, now)?;
            let step = runs::require_step(&tx, step_id)?;
            tx.commit().context("failed to commit step start")?;
            Ok((step, event))
        };
        inner().map_err(storage_error)
    }

    fn finish_step(
        &mut self,
        step_id: StepId,
        outcome: &StepOutcome,
        actor: &str,
        now: DateTimeUtc,
    ) -> BackboneResult<(StepRecord, AuditEvent)> {
        let mut inner = || -> Result<(StepRecord, AuditEvent)> {
            let tx = self.immediate()?;
            let event = runs::finish_step(&tx, step_id, outcome, actor, now)?;
            let step = runs::require_step(&tx, step_id)?;
            tx.commit().context("failed to commit step outcome")?;
            Ok((step, event))
        };
        inner().map_err(storage_error)
    }

    fn record_skipped_step(
        &mut self,
        run_id: RunId,
        agent: &str,
        reason: &str,
        actor: &str,
        now: DateTimeUtc,
    ) -> BackboneResult<(StepRecord, AuditEvent)> {
        let mut inner = || -> Result<(StepRecord, AuditEvent)> {
            let tx = self.immediate()?;
            let (step_id, event) = runs::record_skipped_step(&tx, run_id, agent, reason, actor, now)?;
            let step = runs::require_step(&tx, step_id)?;
            tx.commit().context("failed to commit skipped step")?;
            Ok((step, event))
        };
        inner().map_err(storage_error)
    }

    fn get_step(&self, step_id: StepId) -> BackboneResult<Option<StepRecord>> {
        runs::load_step(&self.conn, step_id).map_err(storage_error)
    }

    fn list_steps(&self, run_id: RunId) -> BackboneResult<Vec<StepRecord>> {
        runs::list_steps(&self.conn, run_id).map_err(storage_error)
    }
}

impl ProjectionRepair for SqliteBackboneStore {
    fn apply_projection(&mut self, projection: &RunProjection) -> BackboneResult<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE runs
                 SET status = ?2, approval_status = ?3, patch_hash = ?4, tokens_used = ?5
                 WHERE run_id = ?1",
                params![
                    projection.run_id.to_string(),
                    projection.status.as_str(),
                    projection.approval_status.as_str(),
                    projection.patch_hash,
                    to_sql_u64(projection.tokens_used).map_err(storage_error)?,
                ],
            )
            .context("failed to apply run projection")
            .map_err(storage_error)?;
        if changed == 0 {
            return Err(BackboneError::not_found("run", projection.run_id));
        }
        Ok(())
    }
}

impl AuditLog for SqliteBackboneStore {
    fn append_audit_event(
        &mut self,
        draft: &AuditEventDraft,
        now: DateTimeUtc,
    ) -> BackboneResult<AuditEvent> {
        let mut inner = || -> Result<AuditEvent> {
            let tx = self.immediate()?;
            runs::require_run(&tx, draft.run_id)?;
            let event = audit::append(&tx, draft, now)?;
            tx.commit().context("failed to commit audit event")?;
            Ok(event)
        };
        inner().map_err(storage_error)
    }

    fn list_audit_events(&self, run_id: RunId) -> BackboneResult<Vec<AuditEvent>> {
        audit::list_for_run(&self.conn, run_id).map_err(storage_error)
    }
}

impl ArtifactStore for SqliteBackboneStore {
    fn write_artifact(
        &mut self,
        run_id: RunId,
        name: &str,
        content: &[u8],
        now: DateTimeUtc,
    ) -> BackboneResult<ArtifactRecord> {
        let mut inner = || -> Result<ArtifactRecord> {
            let tx = self.immediate()?;
            let record = artifacts::write(&tx, run_id, name, content, now)?;
            tx.commit().context("failed to commit artifact")?;
            Ok(record)
        };
        inner().map_err(storage_error)
    }

    fn read_artifact(&self, run_id: RunId, name: &str) -> BackboneResult<Option<Vec<u8>>> {
        artifacts::read(&self.conn, run_id, name).map_err(storage_error)
    }

    fn list_artifacts(&self, run_id: RunId) -> BackboneResult<Vec<ArtifactRecord>> {
        artifacts::list(&self.conn, run_id).map_err(storage_error)
    }
}

impl RunLockStore for SqliteBackboneStore {
    fn acquire_lock(
        &mut self,
        run_id: RunId,
        holder: &str,
        ttl: Duration,
        now: DateTimeUtc,
    ) -> BackboneResult<LockLease> {
        let mut inner = || -> Result<LockLease> {
            let tx = self.immediate()?;
            let lease = coordination::acquire_lock(&tx, run_id, holder, ttl, now)?;
            tx.commit().context("failed to commit lock acquisition")?;
            Ok(lease)
        };
        inner().map_err(storage_error)
    }

    fn renew_lock(
        &mut self,
        lease: &LockLease,
        ttl: Duration,
        now: DateTimeUtc,
    ) -> BackboneResult<LockLease> {
        coordination::renew_lock(&self.conn, lease, ttl, now).map_err(storage_error)
    }

    fn release_lock(&mut self, lease: &LockLease, now: DateTimeUtc) -> BackboneResult<bool> {
        coordination::release_lock(&self.conn, lease, now).map_err(storage_error)
    }

    fn current_lock(&self, run_id: RunId, now: DateTimeUtc) -> BackboneResult<Option<LockLease>> {
        coordination::current_lock(&self.conn, run_id, now).map_err(storage_error)
    }
}

impl IdempotencyStore for SqliteBackboneStore {
    fn begin_or_get(
        &mut self,
        scope: &str,
        key: &str,
        request_hash: &str,
        claim_ttl: Duration,
        now: DateTimeUtc,
    ) -> BackboneResult<IdempotencyOutcome> {
        let mut inner = || -> Result<IdempotencyOutcome> {
            let tx = self.immediate()?;
            let outcome =
                coordination::begin_or_get(&tx, scope, key, request_hash, claim_ttl, now)?;
            tx.commit().context("failed to commit idempotency claim")?;
            Ok(outcome)
        };
        inner().map_err(storage_error)
    }

    fn complete_idempotency(
        &mut self,
        scope: &str,
        key: &str,
        result: &Value,
        now: DateTimeUtc,
    ) -> BackboneResult<()> {
        coordination::complete_idempotency(&self.conn, scope, key, result, now)
            .map_err(storage_error)
    }
}

impl CheckpointStore for SqliteBackboneStore {
    fn save_checkpoint(
        &mut self,
        run_id: RunId,
        step_id: StepId,
        agent: &str,
        state: &Value,
        now: DateTimeUtc,
    ) -> BackboneResult<Checkpoint> {
        let mut inner = || -> Result<Checkpoint> {
            let tx = self.immediate()?;
            let checkpoint = coordination::save_checkpoint(&tx, run_id, step_id, agent, state, now)?;
            tx.commit().context("failed to commit checkpoint")?;
            Ok(checkpoint)
        };
        inner().map_err(storage_error)
    }

    fn latest_checkpoint(&self, run_id: RunId) -> BackboneResult<Option<Checkpoint>> {
        coordination::latest_checkpoint(&self.conn, run_id).map_err(storage_error)
    }

    fn list_checkpoints(&self, run_id: RunId) -> BackboneResult<Vec<Checkpoint>> {
        coordination::list_checkpoints(&self.conn, run_id).map_err(storage_error)
    }
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> Result<String> {
    Ok(format_rfc3339(value)?)
}

pub(crate) fn parse_time(value: &str) -> Result<OffsetDateTime> {
    Ok(parse_rfc3339(value)?)
}

pub(crate) fn to_millis(value: OffsetDateTime) -> Result<i64> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000)
        .map_err(|_| anyhow!("timestamp out of millisecond range: {value}"))
}

pub(crate) fn from_millis(value: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(value) * 1_000_000)
        .map_err(|err| anyhow!("invalid millisecond timestamp {value}: {err}"))
}

pub(crate) fn duration_millis(value: Duration) -> Result<i64> {
    i64::try_from(value.as_millis()).map_err(|_| anyhow!("duration too large: {value:?}"))
}

pub(crate) fn to_sql_u64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds sqlite INTEGER range"))
}

pub(crate) fn from_sql_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("negative {column}: {value}"))
}

pub(crate) fn from_sql_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("invalid {column}: {value}"))
}

pub(crate) fn parse_json(raw: &str, column: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid {column}"))
}
