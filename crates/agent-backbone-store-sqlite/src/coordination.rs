//! Worker coordination tables: run leases, idempotency slots and checkpoints.

use std::time::Duration;

use agent_backbone_domain::{
    BackboneError, Checkpoint, DateTimeUtc, IdempotencyOutcome, LockLease, RunId, StepId,
};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::{
    duration_millis, from_millis, from_sql_u32, parse_json, parse_time, rfc3339, runs, to_millis,
};

struct LockRow {
    holder: String,
    fencing_token: i64,
    acquired_at: String,
    expires_at_ms: i64,
}

fn load_lock(conn: &Connection, run_id: RunId) -> Result<Option<LockRow>> {
    conn.query_row(
        "SELECT holder, fencing_token, acquired_at, expires_at_ms FROM run_locks WHERE run_id = ?1",
        params![run_id.to_string()],
        |row| {
            Ok(LockRow {
                holder: row.get(0)?,
                fencing_token: row.get(1)?,
                acquired_at: row.get(2)?,
                expires_at_ms: row.get(3)?,
            })
        },
    )
    .optional()
    .context("failed to load run lock")
}

pub(crate) fn acquire_lock(
    conn: &Connection,
    run_id: RunId,
    holder: &str,
    ttl: Duration,
    now: DateTimeUtc,
) -> Result<LockLease> {
    runs::require_run(conn, run_id)?;
    let now_ms = to_millis(now)?;
    let expires_at_ms = now_ms.saturating_add(duration_millis(ttl)?);
    let run_key = run_id.to_string();

    let (fencing_token, acquired_at) = match load_lock(conn, run_id)? {
        None => {
            conn.execute(
                "INSERT INTO run_locks(run_id, holder, fencing_token, acquired_at, expires_at_ms)
                 VALUES (?1, ?2, 1, ?3, ?4)",
                params![run_key, holder, rfc3339(now)?, expires_at_ms],
            )
            .context("failed to insert run lock")?;
            (1, now)
        }
        Some(existing) if existing.expires_at_ms > now_ms => {
            if existing.holder != holder {
                tracing::warn!(%run_id, holder, current = %existing.holder, "run lock is held");
                return Err(BackboneError::LockHeld {
                    run_id,
                    holder: existing.holder,
                    expires_at: rfc3339(from_millis(existing.expires_at_ms)?)?,
                }
                .into());
            }
            conn.execute(
                "UPDATE run_locks SET expires_at_ms = ?2 WHERE run_id = ?1",
                params![run_key, expires_at_ms],
            )
            .context("failed to extend run lock")?;
            (existing.fencing_token, parse_time(&existing.acquired_at)?)
        }
        Some(existing) => {
            let token = existing.fencing_token + 1;
            conn.execute(
                "UPDATE run_locks
                 SET holder = ?2, fencing_token = ?3, acquired_at = ?4, expires_at_ms = ?5
                 WHERE run_id = ?1",
                params![run_key, holder, token, rfc3339(now)?, expires_at_ms],
            )
            .context("failed to take over run lock")?;
            (token, now)
        }
    };

    tracing::debug!(%run_id, holder, fencing_token, "run lock acquired");
    Ok(LockLease {
        run_id,
        holder: holder.to_string(),
        fencing_token,
        acquired_at,
        expires_at: from_millis(expires_at_ms)?,
    })
}

pub(crate) fn renew_lock(
    conn: &Connection,
    lease: &LockLease,
    ttl: Duration,
    now: DateTimeUtc,
) -> Result<LockLease> {
    let now_ms = to_millis(now)?;
    let expires_at_ms = now_ms.saturating_add(duration_millis(ttl)?);
    let changed = conn
        .execute(
            "UPDATE run_locks SET expires_at_ms = ?4
             WHERE run_id = ?1 AND holder = ?2 AND fencing_token = ?3 AND expires_at_ms > ?5",
            params![
                lease.run_id.to_string(),
                lease.holder,
                lease.fencing_token,
                expires_at_ms,
                now_ms,
            ],
        )
        .context("failed to renew run lock")?;
    if changed == 0 {
        tracing::warn!(run_id = %lease.run_id, holder = %lease.holder, "run lock lost");
        return Err(BackboneError::LockLost {
            run_id: lease.run_id,
            holder: lease.holder.clone(),
        }
        .into());
    }
    Ok(LockLease {
        expires_at: from_millis(expires_at_ms)?,
        ..lease.clone()
    })
}

/// Releasing keeps the row so the next holder still gets a larger fencing token.
/// A lease that already expired is reported as not held.
pub(crate) fn release_lock(
    conn: &Connection,
    lease: &LockLease,
    now: DateTimeUtc,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE run_locks SET expires_at_ms = 0
             WHERE run_id = ?1 AND holder = ?2 AND fencing_token = ?3 AND expires_at_ms > ?4",
            params![
                lease.run_id.to_string(),
                lease.holder,
                lease.fencing_token,
                to_millis(now)?,
            ],
        )
        .context("failed to release run lock")?;
    if changed == 0 {
        tracing::warn!(
            run_id = %lease.run_id,
            holder = %lease.holder,
            "released a lease no longer held"
        );
    }
    Ok(changed == 1)
}

pub(crate) fn current_lock(
    conn: &Connection,
    run_id: RunId,
    now: DateTimeUtc,
) -> Result<Option<LockLease>> {
    let now_ms = to_millis(now)?;
    match load_lock(conn, run_id)? {
        Some(row) if row.expires_at_ms > now_ms => Ok(Some(LockLease {
            run_id,
            holder: row.holder,
            fencing_token: row.fencing_token,
            acquired_at: parse_time(&row.acquired_at)?,
            expires_at: from_millis(row.expires_at_ms)?,
        })),
        _ => Ok(None),
    }
}

pub(crate) fn begin_or_get(
    conn: &Connection,
    scope: &str,
    key: &str,
    request_hash: &str,
    claim_ttl: Duration,
    now: DateTimeUtc,
) -> Result<IdempotencyOutcome> {
    let now_ms = to_millis(now)?;
    let existing: Option<(String, String, Option<String>, i64)> = conn
        .query_row(
            "SELECT request_hash, status, result_json, claimed_at_ms
             FROM idempotency_keys WHERE scope = ?1 AND idem_key = ?2",
            params![scope, key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .context("failed to read idempotency key")?;

    let Some((stored_hash, status, result_json, claimed_at_ms)) = existing else {
        conn.execute(
            "INSERT INTO idempotency_keys(scope, idem_key, request_hash, status, claimed_at_ms)
             VALUES (?1, ?2, ?3, 'processing', ?4)",
            params![scope, key, request_hash, now_ms],
        )
        .context("failed to claim idempotency key")?;
        return Ok(IdempotencyOutcome::Fresh);
    };

    if stored_hash != request_hash {
        return Err(BackboneError::Validation(format!(
            "idempotency key '{key}' was already used for a different request"
        ))
        .into());
    }

    if status == "completed" {
        let result = result_json
            .as_deref()
            .map(|raw| parse_json(raw, "result_json"))
            .transpose()?
            .unwrap_or(Value::Null);
        return Ok(IdempotencyOutcome::Completed(result));
    }

    let claim_ttl_ms = duration_millis(claim_ttl)?;
    if now_ms.saturating_sub(claimed_at_ms) < claim_ttl_ms {
        return Ok(IdempotencyOutcome::InFlight {
            claimed_at: from_millis(claimed_at_ms)?,
        });
    }

    tracing::warn!(scope, key, "reclaiming expired idempotency slot");
    conn.execute(
        "UPDATE idempotency_keys SET claimed_at_ms = ?3 WHERE scope = ?1 AND idem_key = ?2",
        params![scope, key, now_ms],
    )
    .context("failed to reclaim idempotency key")?;
    Ok(IdempotencyOutcome::Fresh)
}

pub(crate) fn complete_idempotency(
    conn: &Connection,
    scope: &str,
    key: &str,
    result: &Value,
    now: DateTimeUtc,
) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE idempotency_keys
             SET status = 'completed', result_json = ?3, completed_at = ?4
             WHERE scope = ?1 AND idem_key = ?2",
            params![scope, key, result.to_string(), rfc3339(now)?],
        )
        .context("failed to complete idempotency key")?;
    if changed == 0 {
        return Err(BackboneError::not_found("idempotency key", format!("{scope}/{key}")).into());
    }
    Ok(())
}

fn checkpoint_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_checkpoint(
    run_id: RunId,
    (version, step_id, agent, state_json, created_at): (i64, String, String, String, String),
) -> Result<Checkpoint> {
    Ok(Checkpoint {
        run_id,
        version: from_sql_u32(version, "checkpoint version")?,
        step_id: StepId::parse(&step_id)?,
        agent,
        state: parse_json(&state_json, "state_json")?,
        created_at: parse_time(&created_at)?,
    })
}

pub(crate) fn save_checkpoint(
    conn: &Connection,
    run_id: RunId,
    step_id: StepId,
    agent: &str,
    state: &Value,
    now: DateTimeUtc,
) -> Result<Checkpoint> {
    let step = runs::require_step(conn, step_id)?;
    if step.run_id != run_id {
        return Err(BackboneError::Validation(format!(
            "step {step_id} belongs to run {}, not {run_id}",
            step.run_id
        ))
        .into());
    }

    let version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM checkpoints WHERE run_id = ?1",
            params![run_id.to_string()],
            |row| row.get(0),
        )
        .context("failed to compute checkpoint version")?;

    conn.execute(
        "INSERT INTO checkpoints(run_id, version, step_id, agent, state_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            run_id.to_string(),
            version,
            step_id.to_string(),
            agent,
            state.to_string(),
            rfc3339(now)?,
        ],
    )
    .context("failed to insert checkpoint")?;

    Ok(Checkpoint {
        run_id,
        version: from_sql_u32(version, "checkpoint version")?,
        step_id,
        agent: agent.to_string(),
        state: state.clone(),
        created_at: now,
    })
}

pub(crate) fn latest_checkpoint(conn: &Connection, run_id: RunId) -> Result<Option<Checkpoint>> {
    conn.query_row(
        "SELECT version, step_id, agent, state_json, created_at
         FROM checkpoints WHERE run_id = ?1
         ORDER BY version DESC LIMIT 1",
        params![run_id.to_string()],
        checkpoint_row,
    )
    .optional()
    .context("failed to load latest checkpoint")?
    .map(|row| into_checkpoint(run_id, row))
    .transpose()
}

pub(crate) fn list_checkpoints(conn: &Connection, run_id: RunId) -> Result<Vec<Checkpoint>> {
    let mut stmt = conn
        .prepare(
            "SELECT version, step_id, agent, state_json, created_at
             FROM checkpoints WHERE run_id = ?1
             ORDER BY version ASC",
        )
        .context("failed to prepare checkpoint listing")?;
    let rows = stmt
        .query_map(params![run_id.to_string()], checkpoint_row)
        .context("failed to list checkpoints")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(into_checkpoint(run_id, row?)?);
    }
    Ok(out)
}
