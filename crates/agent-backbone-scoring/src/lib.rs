#![forbid(unsafe_code)]
//! Deterministic complexity scoring for incoming changes.
//!
//! The baseline comes from a fixed rubric over extracted features. A model may
//! nudge it, but only by a bounded integer and only with verifiable provenance.

mod baseline;
mod features;

use serde::{Deserialize, Serialize};

use agent_backbone_domain::{ensure_non_empty, is_sha256_hex, BackboneError, BackboneResult, RunId};

pub use baseline::{
    baseline_score, clamp_score, BaselineScore, Feature, ScoreContribution, SCORE_CEILING,
    SCORE_FLOOR,
};
pub use features::{
    extract_features, ChangeMetadata, FeatureSet, SizeBucket, LARGE_MIN_LINES, MANY_FILES_MIN,
    MEDIUM_MIN_LINES,
};

pub const MAX_ADJUSTMENT: i64 = 2;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AdjustmentProvenance {
    pub model: String,
    pub request_id: String,
    /// SHA-256 hex of the change metadata the model was shown.
    pub input_hash: String,
}

impl AdjustmentProvenance {
    /// # Errors
    /// Returns [`BackboneError::Validation`] when any field is empty or the
    /// input hash is not a lowercase SHA-256 hex digest.
    pub fn validate(&self) -> BackboneResult<()> {
        ensure_non_empty("provenance.model", &self.model)?;
        ensure_non_empty("provenance.request_id", &self.request_id)?;
        if !is_sha256_hex(&self.input_hash) {
            return Err(BackboneError::Validation(
                "provenance.input_hash MUST be a lowercase SHA-256 hex digest".to_string(),
            ));
        }
        Ok(())
    }
}

/// A model-proposed delta. Magnitude is never trusted as given.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ModelAdjustment {
    pub value: i64,
    #[serde(default)]
    pub provenance: Option<AdjustmentProvenance>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriageResult {
    pub run_id: RunId,
    pub features: FeatureSet,
    pub baseline_score: f64,
    pub requested_adjustment: Option<i64>,
    pub model_adjustment: Option<i64>,
    pub provenance: Option<AdjustmentProvenance>,
    pub final_score: f64,
    pub explanation: Vec<ScoreContribution>,
}

#[must_use]
pub fn clamp_adjustment(raw: i64) -> i64 {
    raw.clamp(-MAX_ADJUSTMENT, MAX_ADJUSTMENT)
}

/// Clamp the adjustment to ±2, add it, clamp the sum to the score range.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bounded_final_score(baseline: f64, raw_adjustment: i64) -> f64 {
    clamp_score(baseline + clamp_adjustment(raw_adjustment) as f64)
}

/// Check provenance against the scored change, then bound the adjustment.
/// Returns the applied delta.
///
/// # Errors
/// Returns [`BackboneError::Validation`] when provenance is missing, malformed,
/// or cites an input hash other than `metadata`'s.
pub fn enforce_adjustment_bounds(
    adjustment: &ModelAdjustment,
    metadata: &ChangeMetadata,
) -> BackboneResult<i64> {
    let Some(provenance) = &adjustment.provenance else {
        return Err(BackboneError::Validation(
            "model adjustment rejected: provenance is missing".to_string(),
        ));
    };
    provenance
        .validate()
        .map_err(|err| BackboneError::Validation(format!("model adjustment rejected: {err}")))?;
    let expected = metadata.input_hash()?;
    if provenance.input_hash != expected {
        return Err(BackboneError::Validation(format!(
            "model adjustment rejected: provenance cites input {} but the change hashes to {expected}",
            provenance.input_hash
        )));
    }
    Ok(clamp_adjustment(adjustment.value))
}

/// Extract, score and (optionally) adjust. Pure in `(metadata, adjustment)`.
///
/// # Errors
/// Returns [`BackboneError::Validation`] if the adjustment is rejected.
pub fn triage(
    run_id: RunId,
    metadata: &ChangeMetadata,
    adjustment: Option<&ModelAdjustment>,
) -> BackboneResult<TriageResult> {
    let features = extract_features(metadata);
    let baseline = baseline_score(&features);

    let (requested, applied, provenance) = match adjustment {
        Some(adjustment) => {
            let applied = enforce_adjustment_bounds(adjustment, metadata)?;
            (
                Some(adjustment.value),
                Some(applied),
                adjustment.provenance.clone(),
            )
        }
        None => (None, None, None),
    };

    let final_score = bounded_final_score(baseline.score, applied.unwrap_or(0));

    Ok(TriageResult {
        run_id,
        features,
        baseline_score: baseline.score,
        requested_adjustment: requested,
        model_adjustment: applied,
        provenance,
        final_score,
        explanation: baseline.explanation,
    })
}
