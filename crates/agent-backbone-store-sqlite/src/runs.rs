use agent_backbone_domain::{
    ApprovalDecision, ApprovalId, ApprovalRecord, ApprovalStatus, AuditEvent, AuditEventDraft,
    AuditEventType, BackboneError, DateTimeUtc, NewRun, ProposedChangeSet, RunId, RunRecord,
    RunStatus, RunType, StepId, StepRecord, StepStatus,
};
use agent_backbone_store_core::{ChangeProposal, IdempotencyClaim, StepOutcome};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

use crate::{
    artifacts, audit, from_sql_u32, from_sql_u64, parse_json, parse_time, rfc3339, to_sql_u64,
};

const RUN_COLUMNS: &str = "run_id, tenant_id, repo_id, subject_id, run_type, status, \
     state_payload_json, trigger_json, approval_status, proposed_changes_json, patch_hash, \
     tokens_used, summary, created_at, updated_at, completed_at";

const STEP_COLUMNS: &str = "step_id, run_id, step_seq, agent, attempt, status, input_json, \
     output_json, error, started_at, finished_at, duration_ms, tokens_in, tokens_out";

struct RunRow {
    run_id: String,
    tenant_id: String,
    repo_id: String,
    subject_id: String,
    run_type: String,
    status: String,
    state_payload_json: String,
    trigger_json: String,
    approval_status: String,
    proposed_changes_json: Option<String>,
    patch_hash: Option<String>,
    tokens_used: i64,
    summary: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

fn run_row(row: &Row<'_>) -> rusqlite::Result<RunRow> {
    Ok(RunRow {
        run_id: row.get(0)?,
        tenant_id: row.get(1)?,
        repo_id: row.get(2)?,
        subject_id: row.get(3)?,
        run_type: row.get(4)?,
        status: row.get(5)?,
        state_payload_json: row.get(6)?,
        trigger_json: row.get(7)?,
        approval_status: row.get(8)?,
        proposed_changes_json: row.get(9)?,
        patch_hash: row.get(10)?,
        tokens_used: row.get(11)?,
        summary: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

impl RunRow {
    fn into_record(self) -> Result<RunRecord> {
        let proposed_changes = self
            .proposed_changes_json
            .as_deref()
            .map(|raw| {
                serde_json::from_str::<ProposedChangeSet>(raw)
                    .context("invalid proposed_changes_json")
            })
            .transpose()?;
        Ok(RunRecord {
            run_id: RunId::parse(&self.run_id)?,
            tenant_id: self.tenant_id,
            repo_id: self.repo_id,
            subject_id: self.subject_id,
            run_type: RunType::parse(&self.run_type)
                .ok_or_else(|| anyhow!("unknown run_type '{}'", self.run_type))?,
            status: parse_run_status(&self.status)?,
            state_payload: parse_json(&self.state_payload_json, "state_payload_json")?,
            trigger: serde_json::from_str(&self.trigger_json).context("invalid trigger_json")?,
            approval_status: ApprovalStatus::parse(&self.approval_status)
                .ok_or_else(|| anyhow!("unknown approval_status '{}'", self.approval_status))?,
            proposed_changes,
            patch_hash: self.patch_hash,
            tokens_used: from_sql_u64(self.tokens_used, "tokens_used")?,
            summary: self.summary,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

fn parse_run_status(raw: &str) -> Result<RunStatus> {
    RunStatus::parse(raw).ok_or_else(|| anyhow!("unknown run status '{raw}'"))
}

pub(crate) fn load_run(conn: &Connection, run_id: RunId) -> Result<Option<RunRecord>> {
    conn.query_row(
        &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
        params![run_id.to_string()],
        run_row,
    )
    .optional()
    .context("failed to load run")?
    .map(RunRow::into_record)
    .transpose()
}

pub(crate) fn require_run(conn: &Connection, run_id: RunId) -> Result<RunRecord> {
    load_run(conn, run_id)?.ok_or_else(|| BackboneError::not_found("run", run_id).into())
}

pub(crate) fn insert_run(
    conn: &Connection,
    run: &NewRun,
    actor: &str,
    claim: Option<&IdempotencyClaim>,
) -> Result<()> {
    let created_at = rfc3339(run.created_at)?;
    let trigger_json = serde_json::to_string(&run.trigger).context("trigger not serializable")?;
    conn.execute(
        "INSERT INTO runs(
            run_id, tenant_id, repo_id, subject_id, run_type, status,
            state_payload_json, trigger_json, approval_status, tokens_used,
            created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, 'queued', '{}', ?6, 'none', 0, ?7, ?7)",
        params![
            run.run_id.to_string(),
            run.tenant_id,
            run.repo_id,
            run.subject_id,
            run.run_type.as_str(),
            trigger_json,
            created_at,
        ],
    )
    .context("failed to insert run")?;

    audit::append(
        conn,
        &AuditEventDraft::new(
            run.run_id,
            AuditEventType::RunCreated,
            actor,
            json!({
                "tenant_id": run.tenant_id,
                "repo_id": run.repo_id,
                "subject_id": run.subject_id,
                "run_type": run.run_type,
                "trigger": run.trigger,
            }),
        ),
        run.created_at,
    )?;

    if let Some(claim) = claim {
        let closed = conn
            .execute(
                "UPDATE idempotency_keys
                 SET status = 'completed', result_json = ?3, completed_at = ?4
                 WHERE scope = ?1 AND idem_key = ?2 AND status = 'processing'",
                params![
                    claim.scope,
                    claim.key,
                    json!({"run_id": run.run_id}).to_string(),
                    created_at,
                ],
            )
            .context("failed to close idempotency claim")?;
        if closed == 0 {
            return Err(BackboneError::IdempotencyInFlight {
                key: claim.key.clone(),
            }
            .into());
        }
    }
    Ok(())
}

/// Compare-and-set on `status`. Legality is checked by the caller before the
/// transaction opens.
pub(crate) fn transition(
    conn: &Connection,
    run_id: RunId,
    from: RunStatus,
    to: RunStatus,
    payload: &Value,
    actor: &str,
    now: DateTimeUtc,
) -> Result<AuditEvent> {
    let current = require_run(conn, run_id)?;
    if current.status != from {
        tracing::warn!(%run_id, expected = %from, actual = %current.status, "stale run state");
        return Err(BackboneError::StaleState {
            run_id,
            expected: from,
            actual: current.status,
        }
        .into());
    }
    if from == RunStatus::AwaitingApproval
        && to == RunStatus::Applying
        && current.approval_status != ApprovalStatus::Approved
    {
        tracing::warn!(
            %run_id,
            approval = current.approval_status.as_str(),
            "apply refused without approval"
        );
        return Err(BackboneError::ApprovalInvalidated {
            run_id,
            reason: format!(
                "approval is {}; applying needs an approved patch",
                current.approval_status.as_str()
            ),
        }
        .into());
    }

    let mut state = current.state_payload;
    merge_payload(&mut state, payload);
    let now_text = rfc3339(now)?;
    let completed_at = to.is_terminal().then(|| now_text.clone());

    let changed = conn
        .execute(
            "UPDATE runs
             SET status = ?3, state_payload_json = ?4, updated_at = ?5,
                 completed_at = COALESCE(?6, completed_at)
             WHERE run_id = ?1 AND status = ?2",
            params![
                run_id.to_string(),
                from.as_str(),
                to.as_str(),
                state.to_string(),
                now_text,
                completed_at,
            ],
        )
        .context("failed to update run status")?;
    if changed != 1 {
        return Err(anyhow!("run {run_id} changed underneath an immediate transaction"));
    }

    audit::append(
        conn,
        &AuditEventDraft::transition(run_id, actor, from, to, payload),
        now,
    )
}

/// Object payloads are merged key by key into the run state; anything else is
/// stored under `last_payload`.
fn merge_payload(state: &mut Value, payload: &Value) {
    if !state.is_object() {
        *state = json!({});
    }
    let Some(target) = state.as_object_mut() else {
        return;
    };
    match payload {
        Value::Object(entries) => {
            for (key, value) in entries {
                target.insert(key.clone(), value.clone());
            }
        }
        Value::Null => {}
        other => {
            target.insert("last_payload".to_string(), other.clone());
        }
    }
}

/// Patch artifact, change set and, from `review`, the hand-off to
/// `awaiting_approval`. Runs inside the caller's transaction.
pub(crate) fn propose_changes(
    conn: &Connection,
    proposal: &ChangeProposal<'_>,
    now: DateTimeUtc,
) -> Result<AuditEvent> {
    let run_id = proposal.run_id;
    if !matches!(
        proposal.expected,
        RunStatus::Review | RunStatus::AwaitingApproval
    ) {
        return Err(BackboneError::Validation(format!(
            "changes cannot be proposed for a run in {}",
            proposal.expected
        ))
        .into());
    }
    let run = require_run(conn, run_id)?;
    if run.status != proposal.expected {
        tracing::warn!(
            %run_id,
            expected = %proposal.expected,
            actual = %run.status,
            "stale run state for proposed changes"
        );
        return Err(BackboneError::StaleState {
            run_id,
            expected: proposal.expected,
            actual: run.status,
        }
        .into());
    }

    artifacts::write(conn, run_id, proposal.artifact_name, proposal.patch, now)?;
    let requested = set_proposed_changes(
        conn,
        run_id,
        proposal.changes,
        proposal.patch_hash,
        proposal.actor,
        now,
    )?;
    if proposal.expected == RunStatus::AwaitingApproval {
        return Ok(requested);
    }
    transition(
        conn,
        run_id,
        RunStatus::Review,
        RunStatus::AwaitingApproval,
        &json!({"patch_hash": proposal.patch_hash}),
        proposal.actor,
        now,
    )
}

fn set_proposed_changes(
    conn: &Connection,
    run_id: RunId,
    changes: &ProposedChangeSet,
    patch_hash: &str,
    actor: &str,
    now: DateTimeUtc,
) -> Result<AuditEvent> {
    let run = require_run(conn, run_id)?;
    if !matches!(run.status, RunStatus::Review | RunStatus::AwaitingApproval) {
        return Err(BackboneError::Validation(format!(
            "run {run_id} is {}; changes can only be proposed during review or approval",
            run.status
        ))
        .into());
    }

    let changes_json = serde_json::to_string(changes).context("change set not serializable")?;
    conn.execute(
        "UPDATE runs
         SET proposed_changes_json = ?2, patch_hash = ?3, approval_status = 'pending', updated_at = ?4
         WHERE run_id = ?1",
        params![run_id.to_string(), changes_json, patch_hash, rfc3339(now)?],
    )
    .context("failed to store proposed changes")?;

    audit::append(
        conn,
        &AuditEventDraft::new(
            run_id,
            AuditEventType::ApprovalRequested,
            actor,
            json!({
                "patch_hash": patch_hash,
                "previous_patch_hash": run.patch_hash,
                "change_count": changes.changes.len(),
            }),
        ),
        now,
    )
}

pub(crate) fn record_approval(conn: &Connection, approval: &ApprovalRecord) -> Result<AuditEvent> {
    let run_id = approval.run_id;
    let run = require_run(conn, run_id)?;
    if run.status != RunStatus::AwaitingApproval {
        return Err(BackboneError::ApprovalInvalidated {
            run_id,
            reason: format!("run is {}, not awaiting approval", run.status),
        }
        .into());
    }
    if run.patch_hash.as_deref() != Some(approval.patch_hash.as_str()) {
        return Err(BackboneError::ApprovalInvalidated {
            run_id,
            reason: format!(
                "decision targets patch {} but the current patch is {}",
                approval.patch_hash,
                run.patch_hash.as_deref().unwrap_or("<none>")
            ),
        }
        .into());
    }

    let decided_at = rfc3339(approval.decided_at)?;
    conn.execute(
        "INSERT INTO approvals(approval_id, run_id, decision, decided_by, decided_at, patch_hash, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            approval.approval_id.to_string(),
            run_id.to_string(),
            approval.decision.as_str(),
            approval.decided_by,
            decided_at,
            approval.patch_hash,
            approval.reason,
        ],
    )
    .context("failed to insert approval")?;

    let (status, event_type) = match approval.decision {
        ApprovalDecision::Approved => (ApprovalStatus::Approved, AuditEventType::ApprovalGranted),
        ApprovalDecision::Rejected => (ApprovalStatus::Rejected, AuditEventType::ApprovalRejected),
    };
    conn.execute(
        "UPDATE runs SET approval_status = ?2, updated_at = ?3 WHERE run_id = ?1",
        params![run_id.to_string(), status.as_str(), decided_at],
    )
    .context("failed to update approval status")?;

    audit::append(
        conn,
        &AuditEventDraft::new(
            run_id,
            event_type,
            &approval.decided_by,
            json!({
                "approval_id": approval.approval_id.to_string(),
                "patch_hash": approval.patch_hash,
                "decided_by": approval.decided_by,
                "reason": approval.reason,
            }),
        ),
        approval.decided_at,
    )
}

pub(crate) fn list_approvals(conn: &Connection, run_id: RunId) -> Result<Vec<ApprovalRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT approval_id, decision, decided_by, decided_at, patch_hash, reason
             FROM approvals WHERE run_id = ?1
             ORDER BY decided_at ASC, approval_id ASC",
        )
        .context("failed to prepare approval listing")?;
    let rows = stmt
        .query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })
        .context("failed to list approvals")?;

    let mut out = Vec::new();
    for row in rows {
        let (approval_id, decision, decided_by, decided_at, patch_hash, reason) = row?;
        out.push(ApprovalRecord {
            approval_id: ApprovalId::parse(&approval_id)?,
            run_id,
            decision: ApprovalDecision::parse(&decision)
                .ok_or_else(|| anyhow!("unknown approval decision '{decision}'"))?,
            decided_by,
            decided_at: parse_time(&decided_at)?,
            patch_hash,
            reason,
        });
    }
    Ok(out)
}

struct StepRow {
    step_id: String,
    run_id: String,
    step_seq: i64,
    agent: String,
    attempt: i64,
    status: String,
    input_json: String,
    output_json: Option<String>,
    error: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    duration_ms: Option<i64>,
    tokens_in: i64,
    tokens_out: i64,
}

fn step_row(row: &Row<'_>) -> rusqlite::Result<StepRow> {
    Ok(StepRow {
        step_id: row.get(0)?,
        run_id: row.get(1)?,
        step_seq: row.get(2)?,
        agent: row.get(3)?,
        attempt: row.get(4)?,
        status: row.get(5)?,
        input_json: row.get(6)?,
        output_json: row.get(7)?,
        error: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
        duration_ms: row.get(11)?,
        tokens_in: row.get(12)?,
        tokens_out: row.get(13)?,
    })
}

impl StepRow {
    fn into_record(self) -> Result<StepRecord> {
        Ok(StepRecord {
            step_id: StepId::parse(&self.step_id)?,
            run_id: RunId::parse(&self.run_id)?,
            step_seq: from_sql_u32(self.step_seq, "step_seq")?,
            agent: self.agent,
            attempt: from_sql_u32(self.attempt, "attempt")?,
            status: StepStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown step status '{}'", self.status))?,
            input: parse_json(&self.input_json, "input_json")?,
            output: self
                .output_json
                .as_deref()
                .map(|raw| parse_json(raw, "output_json"))
                .transpose()?,
            error: self.error,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            finished_at: self.finished_at.as_deref().map(parse_time).transpose()?,
            duration_ms: self
                .duration_ms
                .map(|value| from_sql_u64(value, "duration_ms"))
                .transpose()?,
            tokens_in: from_sql_u64(self.tokens_in, "tokens_in")?,
            tokens_out: from_sql_u64(self.tokens_out, "tokens_out")?,
        })
    }
}

pub(crate) fn load_step(conn: &Connection, step_id: StepId) -> Result<Option<StepRecord>> {
    conn.query_row(
        &format!("SELECT {STEP_COLUMNS} FROM steps WHERE step_id = ?1"),
        params![step_id.to_string()],
        step_row,
    )
    .optional()
    .context("failed to load step")?
    .map(StepRow::into_record)
    .transpose()
}

pub(crate) fn require_step(conn: &Connection, step_id: StepId) -> Result<StepRecord> {
    load_step(conn, step_id)?.ok_or_else(|| BackboneError::not_found("step", step_id).into())
}

pub(crate) fn list_steps(conn: &Connection, run_id: RunId) -> Result<Vec<StepRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = ?1 ORDER BY step_seq ASC"
        ))
        .context("failed to prepare step listing")?;
    let rows = stmt
        .query_map(params![run_id.to_string()], step_row)
        .context("failed to list steps")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_record()?);
    }
    Ok(out)
}

fn next_step_seq(conn: &Connection, run_id: RunId) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(step_seq), 0) + 1 FROM steps WHERE run_id = ?1",
        params![run_id.to_string()],
        |row| row.get(0),
    )
    .context("failed to compute next step_seq")
}

fn ensure_run_active(conn: &Connection, run_id: RunId) -> Result<RunRecord> {
    let run = require_run(conn, run_id)?;
    if run.status.is_terminal() {
        if run.status == RunStatus::Aborted {
            return Err(BackboneError::Aborted { run_id }.into());
        }
        return Err(BackboneError::Validation(format!(
            "run {run_id} is {} and accepts no further steps",
            run.status
        ))
        .into());
    }
    Ok(run)
}

pub(crate) fn start_step(
    conn: &Connection,
    run_id: RunId,
    agent: &str,
    attempt: u32,
    input: &Value,
    actor: &str,
    now: DateTimeUtc,
) -> Result<(StepId, AuditEvent)> {
    ensure_run_active(conn, run_id)?;
    let step_id = StepId::new();
    let step_seq = next_step_seq(conn, run_id)?;

    conn.execute(
        "INSERT INTO steps(step_id, run_id, step_seq, agent, attempt, status, input_json, started_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?7)",
        params![
            step_id.to_string(),
            run_id.to_string(),
            step_seq,
            agent,
            attempt,
            input.to_string(),
            rfc3339(now)?,
        ],
    )
    .context("failed to insert step")?;

    let event = audit::append(
        conn,
        &AuditEventDraft::new(
            run_id,
            AuditEventType::StepStarted,
            actor,
            json!({
                "step_id": step_id.to_string(),
                "agent": agent,
                "attempt": attempt,
                "step_seq": step_seq,
            }),
        ),
        now,
    )?;
    Ok((step_id, event))
}

pub(crate) fn finish_step(
    conn: &Connection,
    step_id: StepId,
    outcome: &StepOutcome,
    actor: &str,
    now: DateTimeUtc,
) -> Result<AuditEvent> {
    let step = require_step(conn, step_id)?;
    if step.status.is_terminal() {
        return Err(BackboneError::Validation(format!(
            "step {step_id} is already {}",
            step.status.as_str()
        ))
        .into());
    }

    let duration_ms = step
        .started_at
        .map(|started| (now - started).whole_milliseconds().max(0))
        .map(|millis| i64::try_from(millis).unwrap_or(i64::MAX));
    let finished_at = rfc3339(now)?;

    let draft = match outcome {
        StepOutcome::Completed {
            output,
            tokens_in,
            tokens_out,
        } => {
            conn.execute(
                "UPDATE steps
                 SET status = 'completed', output_json = ?2, finished_at = ?3,
                     duration_ms = ?4, tokens_in = ?5, tokens_out = ?6
                 WHERE step_id = ?1",
                params![
                    step_id.to_string(),
                    output.to_string(),
                    finished_at,
                    duration_ms,
                    to_sql_u64(*tokens_in)?,
                    to_sql_u64(*tokens_out)?,
                ],
            )
            .context("failed to complete step")?;
            conn.execute(
                "UPDATE runs SET tokens_used = tokens_used + ?2, updated_at = ?3 WHERE run_id = ?1",
                params![
                    step.run_id.to_string(),
                    to_sql_u64(tokens_in.saturating_add(*tokens_out))?,
                    finished_at,
                ],
            )
            .context("failed to account step tokens")?;
            AuditEventDraft::new(
                step.run_id,
                AuditEventType::StepCompleted,
                actor,
                json!({
                    "step_id": step_id.to_string(),
                    "agent": step.agent,
                    "attempt": step.attempt,
                    "tokens_in": tokens_in,
                    "tokens_out": tokens_out,
                    "duration_ms": duration_ms,
                }),
            )
        }
        StepOutcome::Failed { reason, error } => {
            conn.execute(
                "UPDATE steps
                 SET status = 'failed', error = ?2, finished_at = ?3, duration_ms = ?4
                 WHERE step_id = ?1",
                params![step_id.to_string(), error, finished_at, duration_ms],
            )
            .context("failed to fail step")?;
            AuditEventDraft::new(
                step.run_id,
                AuditEventType::StepFailed,
                actor,
                json!({
                    "step_id": step_id.to_string(),
                    "agent": step.agent,
                    "attempt": step.attempt,
                    "reason": reason,
                    "error": error,
                }),
            )
        }
    };

    audit::append(conn, &draft, now)
}

pub(crate) fn record_skipped_step(
    conn: &Connection,
    run_id: RunId,
    agent: &str,
    reason: &str,
    actor: &str,
    now: DateTimeUtc,
) -> Result<(StepId, AuditEvent)> {
    ensure_run_active(conn, run_id)?;
    let step_id = StepId::new();
    let step_seq = next_step_seq(conn, run_id)?;
    let now_text = rfc3339(now)?;

    conn.execute(
        "INSERT INTO steps(
            step_id, run_id, step_seq, agent, attempt, status, input_json, error,
            started_at, finished_at, duration_ms
         ) VALUES (?1, ?2, ?3, ?4, 1, 'skipped', '{}', ?5, ?6, ?6, 0)",
        params![
            step_id.to_string(),
            run_id.to_string(),
            step_seq,
            agent,
            reason,
            now_text,
        ],
    )
    .context("failed to insert skipped step")?;

    let event = audit::append(
        conn,
        &AuditEventDraft::new(
            run_id,
            AuditEventType::StepCompleted,
            actor,
            json!({
                "step_id": step_id.to_string(),
                "agent": agent,
                "attempt": 1,
                "outcome": "skipped",
                "reason": reason,
                "step_seq": step_seq,
            }),
        ),
        now,
    )?;
    Ok((step_id, event))
}
