use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    format_rfc3339, hash_json, AuditEvent, AuditEventType, BackboneError, BackboneResult,
    DateTimeUtc, EventId, RunId,
};

/// Reserved artifact name under which the audit log of a run is rendered.
pub const AUDIT_LOG_ARTIFACT: &str = "audit.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditVerification {
    pub run_id: RunId,
    pub events: usize,
    pub chain_valid: bool,
    pub first_invalid_seq: Option<u64>,
}

/// Hash over the identity, position and content of one audit event, linked to its predecessor.
///
/// # Errors
/// Returns an error if the timestamp or material cannot be serialized.
#[allow(clippy::too_many_arguments)]
pub fn compute_event_hash(
    event_id: EventId,
    run_id: RunId,
    run_seq: u64,
    event_type: AuditEventType,
    actor: &str,
    occurred_at: DateTimeUtc,
    details_hash: &str,
    prev_event_hash: Option<&str>,
) -> BackboneResult<String> {
    let material = json!({
        "event_id": event_id,
        "run_id": run_id,
        "run_seq": run_seq,
        "event_type": event_type,
        "actor": actor,
        "occurred_at": format_rfc3339(occurred_at)?,
        "details_hash": details_hash,
        "prev_event_hash": prev_event_hash,
    });
    hash_json(&material)
}

/// Walk one run's events in order and check sequence, linkage and both hashes.
///
/// # Errors
/// Returns an error only if hashing itself fails.
pub fn verify_chain(run_id: RunId, events: &[AuditEvent]) -> BackboneResult<AuditVerification> {
    let mut prev: Option<String> = None;
    let mut first_invalid_seq = None;

    for (index, event) in events.iter().enumerate() {
        let expected_seq = u64::try_from(index).map_or(u64::MAX, |value| value + 1);
        let recomputed_details = hash_json(&event.details)?;
        let recomputed_event = compute_event_hash(
            event.event_id,
            event.run_id,
            event.run_seq,
            event.event_type,
            &event.actor,
            event.occurred_at,
            &event.details_hash,
            event.prev_event_hash.as_deref(),
        )?;

        let intact = event.run_id == run_id
            && event.run_seq == expected_seq
            && event.prev_event_hash == prev
            && event.details_hash == recomputed_details
            && event.event_hash == recomputed_event;
        if !intact {
            first_invalid_seq = Some(event.run_seq);
            break;
        }
        prev = Some(event.event_hash.clone());
    }

    Ok(AuditVerification {
        run_id,
        events: events.len(),
        chain_valid: first_invalid_seq.is_none(),
        first_invalid_seq,
    })
}

/// One line of the `audit.jsonl` rendering, without the trailing newline.
///
/// # Errors
/// Returns an error if the event cannot be serialized.
pub fn audit_line(event: &AuditEvent) -> BackboneResult<String> {
    let line = json!({
        "timestamp": format_rfc3339(event.occurred_at)?,
        "run_id": event.run_id,
        "actor": event.actor,
        "action": event.event_type,
        "details": event.details,
        "seq": event.run_seq,
        "event_hash": event.event_hash,
    });
    serde_json::to_string(&line)
        .map_err(|err| BackboneError::Validation(format!("audit line not serializable: {err}")))
}
