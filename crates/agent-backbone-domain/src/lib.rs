#![forbid(unsafe_code)]

mod audit;
mod config;
mod error;
mod projection;
mod records;
mod status;

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub use audit::{
    audit_line, compute_event_hash, verify_chain, AuditVerification, AUDIT_LOG_ARTIFACT,
};
pub use config::{
    AbortPrecedence, ArtifactConfig, BackboneConfig, GateConfig, IdempotencyConfig, LockConfig,
    RetryConfig, SecretPatternConfig, StepConfig, StorageConfig,
};
pub use error::{BackboneError, BackboneResult, ErrorCategory};
pub use projection::{project_run, summarize, RunProjection, StepProjection};
pub use records::{
    ApprovalRecord, ApprovalSnapshot, ArtifactRecord, AuditEvent, AuditEventDraft, Checkpoint,
    IdempotencyOutcome, LockLease, NewRun, ProposedChange, ProposedChangeSet, RunRecord,
    StartRunRequest, StepRecord, Trigger,
};
pub use status::{
    ApprovalDecision, ApprovalStatus, AuditEventType, RunStatus, RunType, StepStatus,
    TriggerSource,
};

pub type DateTimeUtc = OffsetDateTime;

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse the canonical ULID text form.
            ///
            /// # Errors
            /// Returns [`BackboneError::Validation`] for malformed ULIDs.
            pub fn parse(value: &str) -> BackboneResult<Self> {
                Ulid::from_str(value).map(Self).map_err(|err| {
                    BackboneError::Validation(format!("invalid {} ULID '{value}': {err}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(RunId, "run_id");
ulid_id!(StepId, "step_id");
ulid_id!(ApprovalId, "approval_id");
ulid_id!(EventId, "event_id");

/// Source of wall-clock time. Tests substitute a fixed or manually advanced clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTimeUtc;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTimeUtc {
        now_utc()
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> BackboneResult<String> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| BackboneError::Validation(format!("value is not serializable: {err}")))?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`BackboneError::Validation`] when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> BackboneResult<()> {
    if value.trim().is_empty() {
        return Err(BackboneError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

#[must_use]
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

/// # Errors
/// Returns an error if the timestamp cannot be rendered as RFC3339.
pub fn format_rfc3339(value: DateTimeUtc) -> BackboneResult<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| BackboneError::Validation(format!("invalid RFC3339 value: {err}")))
}

/// # Errors
/// Returns an error if `value` is not an RFC3339 timestamp.
pub fn parse_rfc3339(value: &str) -> BackboneResult<DateTimeUtc> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| BackboneError::Validation(format!("invalid RFC3339 datetime: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_bytes_is_stable_sha256() {
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn ids_round_trip_through_text() {
        let run_id = RunId::new();
        let parsed = RunId::parse(&run_id.to_string());
        assert_eq!(parsed.ok(), Some(run_id));
        assert!(StepId::parse("not-a-ulid").is_err());
    }

    #[test]
    fn sha256_hex_detection() {
        assert!(is_sha256_hex(&hash_bytes(b"x")));
        assert!(!is_sha256_hex("abc123"));
        assert!(!is_sha256_hex(&hash_bytes(b"x").to_uppercase()));
    }

    #[test]
    fn ensure_non_empty_rejects_whitespace() {
        assert!(ensure_non_empty("tenant_id", "  ").is_err());
        assert!(ensure_non_empty("tenant_id", "acme").is_ok());
    }
}
