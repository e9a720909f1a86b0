use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use agent_backbone_domain::{hash_json, BackboneResult};

pub const MEDIUM_MIN_LINES: u32 = 100;
pub const LARGE_MIN_LINES: u32 = 500;
pub const MANY_FILES_MIN: u32 = 10;

const AUTH_MARKERS: [&str; 5] = ["auth", "login", "session", "oauth", "permission"];
const SECURITY_MARKERS: [&str; 5] = ["security", "crypto", "secret", "tls", ".pem"];
const INFRA_MARKERS: [&str; 7] = [
    "infra",
    "terraform",
    ".github/workflows",
    "dockerfile",
    "k8s",
    "helm",
    "deploy",
];

/// Raw change metadata as reported by the source-control side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChangeMetadata {
    pub files_changed: u32,
    pub lines_changed: u32,
    pub touched_paths: Vec<String>,
    pub touches_auth_path: bool,
    pub touches_security_path: bool,
    pub touches_infra_path: bool,
    pub test_only: bool,
}

impl ChangeMetadata {
    /// Hash a model must cite in its adjustment provenance.
    ///
    /// # Errors
    /// Returns an error if the metadata cannot be serialized.
    pub fn input_hash(&self) -> BackboneResult<String> {
        hash_json(&json!({
            "files_changed": self.files_changed,
            "lines_changed": self.lines_changed,
            "touched_paths": self.touched_paths,
            "touches_auth_path": self.touches_auth_path,
            "touches_security_path": self.touches_security_path,
            "touches_infra_path": self.touches_infra_path,
            "test_only": self.test_only,
        }))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SizeBucket {
    Small,
    Medium,
    Large,
}

impl SizeBucket {
    #[must_use]
    pub fn for_lines(lines_changed: u32) -> Self {
        if lines_changed >= LARGE_MIN_LINES {
            Self::Large
        } else if lines_changed >= MEDIUM_MIN_LINES {
            Self::Medium
        } else {
            Self::Small
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureSet {
    pub size: SizeBucket,
    pub files_changed: u32,
    pub lines_changed: u32,
    pub many_files: bool,
    pub auth_sensitive: bool,
    pub security_sensitive: bool,
    pub infra_sensitive: bool,
    pub test_only: bool,
}

impl FeatureSet {
    /// Feature name/value pairs in rubric order.
    #[must_use]
    pub fn entries(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("size", json!(self.size)),
            ("files_changed", json!(self.files_changed)),
            ("lines_changed", json!(self.lines_changed)),
            ("many_files", json!(self.many_files)),
            ("auth_sensitive", json!(self.auth_sensitive)),
            ("security_sensitive", json!(self.security_sensitive)),
            ("infra_sensitive", json!(self.infra_sensitive)),
            ("test_only", json!(self.test_only)),
        ]
    }
}

#[must_use]
pub fn extract_features(metadata: &ChangeMetadata) -> FeatureSet {
    let lowered: Vec<String> = metadata
        .touched_paths
        .iter()
        .map(|path| path.to_ascii_lowercase().replace('\\', "/"))
        .collect();
    let any_path = |markers: &[&str]| {
        lowered
            .iter()
            .any(|path| markers.iter().any(|marker| path.contains(marker)))
    };

    let all_tests = !lowered.is_empty() && lowered.iter().all(|path| is_test_path(path));

    FeatureSet {
        size: SizeBucket::for_lines(metadata.lines_changed),
        files_changed: metadata.files_changed,
        lines_changed: metadata.lines_changed,
        many_files: metadata.files_changed >= MANY_FILES_MIN,
        auth_sensitive: metadata.touches_auth_path || any_path(&AUTH_MARKERS),
        security_sensitive: metadata.touches_security_path || any_path(&SECURITY_MARKERS),
        infra_sensitive: metadata.touches_infra_path || any_path(&INFRA_MARKERS),
        test_only: metadata.test_only || all_tests,
    }
}

fn is_test_path(path: &str) -> bool {
    path.starts_with("tests/")
        || path.starts_with("test/")
        || path.contains("/tests/")
        || path.contains("/test/")
        || path.contains("/__tests__/")
        || path.contains("_test.")
        || path.contains(".test.")
        || path.contains(".spec.")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_bucket_boundaries() {
        assert_eq!(SizeBucket::for_lines(0), SizeBucket::Small);
        assert_eq!(SizeBucket::for_lines(99), SizeBucket::Small);
        assert_eq!(SizeBucket::for_lines(100), SizeBucket::Medium);
        assert_eq!(SizeBucket::for_lines(499), SizeBucket::Medium);
        assert_eq!(SizeBucket::for_lines(500), SizeBucket::Large);
    }

    #[test]
    fn path_heuristics_supplement_flags() {
        let metadata = ChangeMetadata {
            files_changed: 2,
            lines_changed: 12,
            touched_paths: vec![
                "src/Auth/session.rs".to_string(),
                "deploy/terraform/main.tf".to_string(),
            ],
            ..ChangeMetadata::default()
        };
        let features = extract_features(&metadata);
        assert!(features.auth_sensitive);
        assert!(features.infra_sensitive);
        assert!(!features.security_sensitive);
        assert!(!features.test_only);
    }

    #[test]
    fn all_test_paths_mark_test_only() {
        let metadata = ChangeMetadata {
            files_changed: 2,
            lines_changed: 30,
            touched_paths: vec![
                "tests/ledger.rs".to_string(),
                "web/src/button.spec.ts".to_string(),
            ],
            ..ChangeMetadata::default()
        };
        assert!(extract_features(&metadata).test_only);

        let mixed = ChangeMetadata {
            touched_paths: vec!["tests/ledger.rs".to_string(), "src/lib.rs".to_string()],
            ..metadata
        };
        assert!(!extract_features(&mixed).test_only);
    }

    #[test]
    fn no_paths_never_infers_test_only() {
        assert!(!extract_features(&ChangeMetadata::default()).test_only);
    }

    #[test]
    fn input_hash_tracks_content() {
        let base = ChangeMetadata {
            files_changed: 1,
            ..ChangeMetadata::default()
        };
        let other = ChangeMetadata {
            files_changed: 2,
            ..ChangeMetadata::default()
        };
        assert_eq!(base.input_hash().ok(), base.clone().input_hash().ok());
        assert_ne!(base.input_hash().ok(), other.input_hash().ok());
    }
}
