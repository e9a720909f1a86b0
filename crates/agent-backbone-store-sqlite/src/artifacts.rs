use agent_backbone_domain::{
    hash_bytes, ArtifactRecord, BackboneError, DateTimeUtc, RunId, AUDIT_LOG_ARTIFACT,
};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{audit, from_sql_u32, from_sql_u64, parse_time, rfc3339, runs, to_sql_u64};

const ARTIFACT_COLUMNS: &str = "name, version, content_hash, path, size_bytes, created_at";

fn artifact_row(row: &Row<'_>) -> rusqlite::Result<(String, i64, String, String, i64, String)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn into_record(
    run_id: RunId,
    (name, version, content_hash, path, size_bytes, created_at): (
        String,
        i64,
        String,
        String,
        i64,
        String,
    ),
) -> Result<ArtifactRecord> {
    Ok(ArtifactRecord {
        run_id,
        name,
        version: from_sql_u32(version, "artifact version")?,
        content_hash,
        path,
        size_bytes: from_sql_u64(size_bytes, "size_bytes")?,
        created_at: parse_time(&created_at)?,
    })
}

fn latest(conn: &Connection, run_id: RunId, name: &str) -> Result<Option<ArtifactRecord>> {
    conn.query_row(
        &format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts
             WHERE run_id = ?1 AND name = ?2
             ORDER BY version DESC LIMIT 1"
        ),
        params![run_id.to_string(), name],
        artifact_row,
    )
    .optional()
    .context("failed to load latest artifact version")?
    .map(|row| into_record(run_id, row))
    .transpose()
}

pub(crate) fn write(
    conn: &Connection,
    run_id: RunId,
    name: &str,
    content: &[u8],
    now: DateTimeUtc,
) -> Result<ArtifactRecord> {
    if name == AUDIT_LOG_ARTIFACT {
        return Err(BackboneError::Validation(format!(
            "'{AUDIT_LOG_ARTIFACT}' is rendered from the audit log and cannot be written"
        ))
        .into());
    }
    let run = runs::require_run(conn, run_id)?;
    let content_hash = hash_bytes(content);

    let current = latest(conn, run_id, name)?;
    if let Some(existing) = &current {
        if existing.content_hash == content_hash {
            tracing::debug!(%run_id, name, version = existing.version, "artifact unchanged");
            return Ok(existing.clone());
        }
    }

    let version = current.map_or(1, |existing| existing.version + 1);
    let path = format!("{}/{name}", run.namespace());
    let size_bytes = u64::try_from(content.len()).unwrap_or(u64::MAX);

    conn.execute(
        "INSERT INTO artifacts(run_id, name, version, content_hash, path, content, size_bytes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            run_id.to_string(),
            name,
            version,
            content_hash,
            path,
            content,
            to_sql_u64(size_bytes)?,
            rfc3339(now)?,
        ],
    )
    .context("failed to insert artifact")?;

    tracing::debug!(%run_id, name, version, "artifact written");
    Ok(ArtifactRecord {
        run_id,
        name: name.to_string(),
        version,
        content_hash,
        path,
        size_bytes,
        created_at: now,
    })
}

pub(crate) fn read(conn: &Connection, run_id: RunId, name: &str) -> Result<Option<Vec<u8>>> {
    if name == AUDIT_LOG_ARTIFACT {
        if runs::load_run(conn, run_id)?.is_none() {
            return Ok(None);
        }
        return audit::render_jsonl(conn, run_id).map(Some);
    }
    conn.query_row(
        "SELECT content FROM artifacts
         WHERE run_id = ?1 AND name = ?2
         ORDER BY version DESC LIMIT 1",
        params![run_id.to_string(), name],
        |row| row.get::<_, Vec<u8>>(0),
    )
    .optional()
    .context("failed to read artifact")
}

/// Latest version of every named artifact, by name, followed by the audit log rendering.
pub(crate) fn list(conn: &Connection, run_id: RunId) -> Result<Vec<ArtifactRecord>> {
    let Some(run) = runs::load_run(conn, run_id)? else {
        return Ok(Vec::new());
    };

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM artifacts AS a
             WHERE run_id = ?1
               AND version = (
                 SELECT MAX(version) FROM artifacts AS b
                 WHERE b.run_id = a.run_id AND b.name = a.name
               )
             ORDER BY name ASC"
        ))
        .context("failed to prepare artifact listing")?;
    let rows = stmt
        .query_map(params![run_id.to_string()], artifact_row)
        .context("failed to list artifacts")?;

    let mut out = Vec::new();
    for row in rows {
        out.push(into_record(run_id, row?)?);
    }

    let rendered = audit::render_jsonl(conn, run_id)?;
    let events = audit::count_for_run(conn, run_id)?;
    out.push(ArtifactRecord {
        run_id,
        name: AUDIT_LOG_ARTIFACT.to_string(),
        version: u32::try_from(events).unwrap_or(u32::MAX),
        content_hash: hash_bytes(&rendered),
        path: format!("{}/{AUDIT_LOG_ARTIFACT}", run.namespace()),
        size_bytes: u64::try_from(rendered.len()).unwrap_or(u64::MAX),
        created_at: run.updated_at,
    });
    Ok(out)
}
