use agent_backbone_domain::{
    audit_line, compute_event_hash, hash_json, AuditEvent, AuditEventDraft, AuditEventType,
    DateTimeUtc, EventId, RunId,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{from_sql_u64, parse_json, parse_time, rfc3339, to_sql_u64};

/// Append one event to a run's chain. Must run inside the caller's transaction
/// so the sequence number and predecessor hash cannot race.
pub(crate) fn append(
    conn: &Connection,
    draft: &AuditEventDraft,
    now: DateTimeUtc,
) -> Result<AuditEvent> {
    let run_key = draft.run_id.to_string();
    let last: Option<(i64, String)> = conn
        .query_row(
            "SELECT run_seq, event_hash FROM audit_events
             WHERE run_id = ?1 ORDER BY run_seq DESC LIMIT 1",
            params![run_key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("failed to read audit chain head")?;

    let (run_seq, prev_event_hash) = match last {
        Some((seq, hash)) => (from_sql_u64(seq, "run_seq")? + 1, Some(hash)),
        None => (1, None),
    };

    let event_id = EventId::new();
    let details_hash = hash_json(&draft.details)?;
    let event_hash = compute_event_hash(
        event_id,
        draft.run_id,
        run_seq,
        draft.event_type,
        &draft.actor,
        now,
        &details_hash,
        prev_event_hash.as_deref(),
    )?;

    conn.execute(
        "INSERT INTO audit_events(
            event_id, run_id, run_seq, event_type, actor, occurred_at,
            details_json, details_hash, prev_event_hash, event_hash
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event_id.to_string(),
            run_key,
            to_sql_u64(run_seq)?,
            draft.event_type.as_str(),
            draft.actor,
            rfc3339(now)?,
            draft.details.to_string(),
            details_hash,
            prev_event_hash,
            event_hash,
        ],
    )
    .context("failed to append audit event")?;

    tracing::debug!(
        run_id = %draft.run_id,
        run_seq,
        event_type = draft.event_type.as_str(),
        "audit event appended"
    );

    Ok(AuditEvent {
        event_seq: conn.last_insert_rowid(),
        event_id,
        run_id: draft.run_id,
        run_seq,
        event_type: draft.event_type,
        actor: draft.actor.clone(),
        occurred_at: now,
        details: draft.details.clone(),
        details_hash,
        prev_event_hash,
        event_hash,
    })
}

pub(crate) fn list_for_run(conn: &Connection, run_id: RunId) -> Result<Vec<AuditEvent>> {
    let mut stmt = conn
        .prepare(
            "SELECT event_seq, event_id, run_seq, event_type, actor, occurred_at,
                    details_json, details_hash, prev_event_hash, event_hash
             FROM audit_events
             WHERE run_id = ?1
             ORDER BY run_seq ASC",
        )
        .context("failed to prepare audit listing")?;

    let rows = stmt
        .query_map(params![run_id.to_string()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, String>(9)?,
            ))
        })
        .context("failed to list audit events")?;

    let mut out = Vec::new();
    for row in rows {
        let (
            event_seq,
            event_id,
            run_seq,
            event_type,
            actor,
            occurred_at,
            details_json,
            details_hash,
            prev_event_hash,
            event_hash,
        ) = row?;
        out.push(AuditEvent {
            event_seq,
            event_id: EventId::parse(&event_id)?,
            run_id,
            run_seq: from_sql_u64(run_seq, "run_seq")?,
            event_type: AuditEventType::parse(&event_type)
                .ok_or_else(|| anyhow!("unknown audit event type '{event_type}'"))?,
            actor,
            occurred_at: parse_time(&occurred_at)?,
            details: parse_json(&details_json, "details_json")?,
            details_hash,
            prev_event_hash,
            event_hash,
        });
    }
    Ok(out)
}

pub(crate) fn count_for_run(conn: &Connection, run_id: RunId) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM audit_events WHERE run_id = ?1",
            params![run_id.to_string()],
            |row| row.get(0),
        )
        .context("failed to count audit events")?;
    from_sql_u64(count, "audit event count")
}

/// Line-delimited rendering of a run's log, one record per event.
pub(crate) fn render_jsonl(conn: &Connection, run_id: RunId) -> Result<Vec<u8>> {
    let mut out = String::new();
    for event in list_for_run(conn, run_id)? {
        out.push_str(&audit_line(&event)?);
        out.push('\n');
    }
    Ok(out.into_bytes())
}
