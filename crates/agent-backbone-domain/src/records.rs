use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    ensure_non_empty, hash_json, ApprovalDecision, ApprovalId, ApprovalStatus, AuditEventType,
    BackboneError, BackboneResult, DateTimeUtc, EventId, RunId, RunStatus, RunType, StepId,
    StepStatus, TriggerSource,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Trigger {
    pub source: TriggerSource,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StartRunRequest {
    pub tenant_id: String,
    pub repo_id: String,
    pub subject_id: String,
    pub run_type: RunType,
    pub trigger: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl StartRunRequest {
    /// # Errors
    /// Returns [`BackboneError::Validation`] for empty identifiers, or when an
    /// automated trigger arrives without an idempotency key.
    pub fn validate(&self) -> BackboneResult<()> {
        ensure_non_empty("tenant_id", &self.tenant_id)?;
        ensure_non_empty("repo_id", &self.repo_id)?;
        ensure_non_empty("subject_id", &self.subject_id)?;
        ensure_non_empty("trigger.actor", &self.trigger.actor)?;

        for (field, value) in [("tenant_id", &self.tenant_id), ("repo_id", &self.repo_id)] {
            if value.contains('/') || value == "." || value == ".." {
                return Err(BackboneError::Validation(format!(
                    "{field} MUST NOT contain path separators"
                )));
            }
        }

        match &self.idempotency_key {
            Some(key) => ensure_non_empty("idempotency_key", key)?,
            None if self.trigger.source.is_automated() => {
                return Err(BackboneError::Validation(
                    "idempotency_key is required for webhook and scheduled triggers".to_string(),
                ));
            }
            None => {}
        }
        Ok(())
    }

    /// Hash of everything except the idempotency key. A key reused with a
    /// different fingerprint is a caller error.
    ///
    /// # Errors
    /// Returns an error if the request cannot be serialized.
    pub fn fingerprint(&self) -> BackboneResult<String> {
        hash_json(&json!({
            "tenant_id": self.tenant_id,
            "repo_id": self.repo_id,
            "subject_id": self.subject_id,
            "run_type": self.run_type,
            "trigger": self.trigger,
        }))
    }
}

/// Run fields fixed at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewRun {
    pub run_id: RunId,
    pub tenant_id: String,
    pub repo_id: String,
    pub subject_id: String,
    pub run_type: RunType,
    pub trigger: Trigger,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

impl NewRun {
    #[must_use]
    pub fn from_request(request: &StartRunRequest, created_at: DateTimeUtc) -> Self {
        Self {
            run_id: RunId::new(),
            tenant_id: request.tenant_id.clone(),
            repo_id: request.repo_id.clone(),
            subject_id: request.subject_id.clone(),
            run_type: request.run_type,
            trigger: request.trigger.clone(),
            created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: RunId,
    pub tenant_id: String,
    pub repo_id: String,
    pub subject_id: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub state_payload: Value,
    pub trigger: Trigger,
    pub approval_status: ApprovalStatus,
    pub proposed_changes: Option<ProposedChangeSet>,
    pub patch_hash: Option<String>,
    pub tokens_used: u64,
    pub summary: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<DateTimeUtc>,
}

impl RunRecord {
    /// `tenant/repo/run`, the prefix every artifact of this run lives under.
    #[must_use]
    pub fn namespace(&self) -> String {
        format!("{}/{}/{}", self.tenant_id, self.repo_id, self.run_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step_id: StepId,
    pub run_id: RunId,
    pub step_seq: u32,
    pub agent: String,
    pub attempt: u32,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<DateTimeUtc>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<DateTimeUtc>,
    pub duration_ms: Option<u64>,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApprovalRecord {
    pub approval_id: ApprovalId,
    pub run_id: RunId,
    pub decision: ApprovalDecision,
    pub decided_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub decided_at: DateTimeUtc,
    pub patch_hash: String,
    pub reason: Option<String>,
}

/// Everything the capability gate needs to decide on a run.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApprovalSnapshot {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_patch_hash: Option<String>,
    pub approvals: Vec<ApprovalRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProposedChange {
    pub path: String,
    pub diff: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProposedChangeSet {
    pub changes: Vec<ProposedChange>,
}

impl ProposedChangeSet {
    /// # Errors
    /// Returns [`BackboneError::Validation`] for an empty set, empty paths, or
    /// the same path proposed twice.
    pub fn validate(&self) -> BackboneResult<()> {
        if self.changes.is_empty() {
            return Err(BackboneError::Validation(
                "proposed change set MUST contain at least one change".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for change in &self.changes {
            ensure_non_empty("change.path", &change.path)?;
            if !seen.insert(change.path.as_str()) {
                return Err(BackboneError::Validation(format!(
                    "path '{}' appears more than once in the change set",
                    change.path
                )));
            }
        }
        Ok(())
    }

    /// Content hash over the change set, independent of the order changes were listed in.
    ///
    /// # Errors
    /// Returns an error if the change set cannot be serialized.
    pub fn patch_hash(&self) -> BackboneResult<String> {
        let mut ordered: Vec<&ProposedChange> = self.changes.iter().collect();
        ordered.sort_by(|left, right| left.path.cmp(&right.path));
        let canonical: Vec<Value> = ordered
            .into_iter()
            .map(|change| json!({"path": change.path, "diff": change.diff}))
            .collect();
        hash_json(&Value::Array(canonical))
    }

    /// Concatenated diff text, in path order.
    #[must_use]
    pub fn render_patch(&self) -> String {
        let mut ordered: Vec<&ProposedChange> = self.changes.iter().collect();
        ordered.sort_by(|left, right| left.path.cmp(&right.path));
        let mut out = String::new();
        for change in ordered {
            out.push_str(&change.diff);
            if !change.diff.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// An audit event before the log assigns its sequence and hashes.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEventDraft {
    pub run_id: RunId,
    pub event_type: AuditEventType,
    pub actor: String,
    pub details: Value,
}

impl AuditEventDraft {
    #[must_use]
    pub fn new(run_id: RunId, event_type: AuditEventType, actor: &str, details: Value) -> Self {
        Self {
            run_id,
            event_type,
            actor: actor.to_string(),
            details,
        }
    }

    #[must_use]
    pub fn transition(
        run_id: RunId,
        actor: &str,
        from: RunStatus,
        to: RunStatus,
        payload: &Value,
    ) -> Self {
        Self::new(
            run_id,
            AuditEventType::StateTransition,
            actor,
            json!({"from": from, "to": to, "payload": payload}),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub event_seq: i64,
    pub event_id: EventId,
    pub run_id: RunId,
    pub run_seq: u64,
    pub event_type: AuditEventType,
    pub actor: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: DateTimeUtc,
    pub details: Value,
    pub details_hash: String,
    pub prev_event_hash: Option<String>,
    pub event_hash: String,
}

impl AuditEvent {
    /// `(from, to)` for `state_transition` events.
    #[must_use]
    pub fn transition(&self) -> Option<(RunStatus, RunStatus)> {
        if self.event_type != AuditEventType::StateTransition {
            return None;
        }
        let from = self.details.get("from")?.as_str().and_then(RunStatus::parse)?;
        let to = self.details.get("to")?.as_str().and_then(RunStatus::parse)?;
        Some((from, to))
    }

    #[must_use]
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn detail_u64(&self, key: &str) -> Option<u64> {
        self.details.get(key).and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LockLease {
    pub run_id: RunId,
    pub holder: String,
    pub fencing_token: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub acquired_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: DateTimeUtc,
}

impl LockLease {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTimeUtc) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyOutcome {
    /// The caller owns a new processing slot and must call `complete` when done.
    Fresh,
    /// Another caller claimed the key and has not finished.
    InFlight { claimed_at: DateTimeUtc },
    /// The key already finished; the cached result is returned as-is.
    Completed(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub version: u32,
    pub step_id: StepId,
    pub agent: String,
    pub state: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArtifactRecord {
    pub run_id: RunId,
    pub name: String,
    pub version: u32,
    pub content_hash: String,
    pub path: String,
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
}
