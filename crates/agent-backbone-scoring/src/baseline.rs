use serde::{Deserialize, Serialize};

use crate::features::{FeatureSet, SizeBucket};

pub const SCORE_FLOOR: f64 = 1.0;
pub const SCORE_CEILING: f64 = 10.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    SizeSmall,
    SizeMedium,
    SizeLarge,
    ManyFiles,
    AuthSensitive,
    SecuritySensitive,
    InfraSensitive,
    TestOnly,
}

impl Feature {
    #[must_use]
    pub fn weight(self) -> f64 {
        match self {
            Self::SizeSmall => 0.0,
            Self::SizeMedium => 1.0,
            Self::SizeLarge | Self::InfraSensitive => 2.0,
            Self::ManyFiles => 1.5,
            Self::AuthSensitive | Self::SecuritySensitive => 3.0,
            Self::TestOnly => -1.0,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SizeSmall => "size_small",
            Self::SizeMedium => "size_medium",
            Self::SizeLarge => "size_large",
            Self::ManyFiles => "many_files",
            Self::AuthSensitive => "auth_sensitive",
            Self::SecuritySensitive => "security_sensitive",
            Self::InfraSensitive => "infra_sensitive",
            Self::TestOnly => "test_only",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreContribution {
    pub feature: Feature,
    pub weight: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaselineScore {
    pub score: f64,
    pub explanation: Vec<ScoreContribution>,
}

#[must_use]
pub fn clamp_score(value: f64) -> f64 {
    value.clamp(SCORE_FLOOR, SCORE_CEILING)
}

/// Apply the fixed rubric to a feature set. Contributions are listed in rubric order.
#[must_use]
pub fn baseline_score(features: &FeatureSet) -> BaselineScore {
    let mut explanation = Vec::new();

    let (size_feature, size_note) = match features.size {
        SizeBucket::Small => (Feature::SizeSmall, "small change"),
        SizeBucket::Medium => (Feature::SizeMedium, "medium change"),
        SizeBucket::Large => (Feature::SizeLarge, "large change"),
    };
    explanation.push(contribution(
        size_feature,
        format!("{size_note}: {} lines changed", features.lines_changed),
    ));

    if features.many_files {
        explanation.push(contribution(
            Feature::ManyFiles,
            format!("{} files changed", features.files_changed),
        ));
    }
    if features.auth_sensitive {
        explanation.push(contribution(
            Feature::AuthSensitive,
            "touches authentication or authorization paths".to_string(),
        ));
    }
    if features.security_sensitive {
        explanation.push(contribution(
            Feature::SecuritySensitive,
            "touches security-sensitive paths".to_string(),
        ));
    }
    if features.infra_sensitive {
        explanation.push(contribution(
            Feature::InfraSensitive,
            "touches infrastructure or deployment paths".to_string(),
        ));
    }
    if features.test_only {
        explanation.push(contribution(
            Feature::TestOnly,
            "only test code changed".to_string(),
        ));
    }

    let raw = explanation
        .iter()
        .fold(SCORE_FLOOR, |total, item| total + item.weight);

    BaselineScore {
        score: clamp_score(raw),
        explanation,
    }
}

fn contribution(feature: Feature, rationale: String) -> ScoreContribution {
    ScoreContribution {
        feature,
        weight: feature.weight(),
        rationale,
    }
}
