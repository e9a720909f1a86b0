use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BackboneError, BackboneResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BackboneConfig {
    pub lock: LockConfig,
    pub step: StepConfig,
    pub storage: StorageConfig,
    pub idempotency: IdempotencyConfig,
    pub artifacts: ArtifactConfig,
    pub gate: GateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub ttl_ms: u64,
    pub renew_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            renew_interval_ms: 10_000,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    #[must_use]
    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms)
    }
}

/// Which reason wins when a step's deadline and an explicit abort are both observed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortPrecedence {
    #[default]
    Abort,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    fn validate(&self, section: &str) -> BackboneResult<()> {
        if self.max_attempts == 0 {
            return Err(BackboneError::Configuration(format!(
                "{section}.max_attempts MUST be >= 1"
            )));
        }
        if self.multiplier == 0 {
            return Err(BackboneError::Configuration(format!(
                "{section}.multiplier MUST be >= 1"
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(BackboneError::Configuration(format!(
                "{section}.max_delay_ms MUST be >= base_delay_ms"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StepConfig {
    pub default_timeout_ms: u64,
    pub timeouts_ms: BTreeMap<String, u64>,
    pub retry: RetryConfig,
    pub abort_precedence: AbortPrecedence,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 120_000,
            timeouts_ms: BTreeMap::new(),
            retry: RetryConfig::default(),
            abort_precedence: AbortPrecedence::Abort,
        }
    }
}

impl StepConfig {
    #[must_use]
    pub fn timeout_for(&self, agent: &str) -> Duration {
        Duration::from_millis(
            self.timeouts_ms
                .get(agent)
                .copied()
                .unwrap_or(self.default_timeout_ms),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub retry: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 25,
                multiplier: 2,
                max_delay_ms: 250,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct IdempotencyConfig {
    pub claim_ttl_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            claim_ttl_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SecretPatternConfig {
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ArtifactConfig {
    pub secret_patterns: Vec<SecretPatternConfig>,
    pub max_bytes: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        let patterns = [
            ("aws_access_key_id", r"\b(AKIA|ASIA)[0-9A-Z]{16}\b"),
            (
                "private_key_block",
                r"-----BEGIN (RSA |EC |DSA |OPENSSH |PGP )?PRIVATE KEY( BLOCK)?-----",
            ),
            ("github_token", r"\b(ghp|gho|ghu|ghs|ghr)_[A-Za-z0-9]{36,}\b"),
            ("slack_token", r"\bxox[abposr]-[A-Za-z0-9-]{10,}\b"),
            (
                "generic_secret_assignment",
                r#"(?i)\b(password|passwd|secret|api[_-]?key|access[_-]?token)\s*[:=]\s*["']?[^\s"']{8,}"#,
            ),
        ];
        Self {
            secret_patterns: patterns
                .into_iter()
                .map(|(name, pattern)| SecretPatternConfig {
                    name: name.to_string(),
                    pattern: pattern.to_string(),
                })
                .collect(),
            max_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    pub safe_operations: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            safe_operations: [
                "read_file",
                "list_files",
                "get_pull_request",
                "post_comment",
                "add_label",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl BackboneConfig {
    /// # Errors
    /// Returns [`BackboneError::Configuration`] when the YAML is malformed or invalid.
    pub fn from_yaml_str(raw: &str) -> BackboneResult<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| BackboneError::Configuration(format!("invalid config YAML: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`BackboneError::Configuration`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> BackboneResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            BackboneError::Configuration(format!(
                "failed to read config file {}: {err}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// # Errors
    /// Returns [`BackboneError::Configuration`] for values that cannot work together.
    pub fn validate(&self) -> BackboneResult<()> {
        if self.lock.ttl_ms == 0 {
            return Err(BackboneError::Configuration(
                "lock.ttl_ms MUST be > 0".to_string(),
            ));
        }
        if self.lock.renew_interval_ms == 0 || self.lock.renew_interval_ms >= self.lock.ttl_ms {
            return Err(BackboneError::Configuration(
                "lock.renew_interval_ms MUST be > 0 and < lock.ttl_ms".to_string(),
            ));
        }
        if self.step.default_timeout_ms == 0 || self.step.timeouts_ms.values().any(|ms| *ms == 0)
        {
            return Err(BackboneError::Configuration(
                "step timeouts MUST be > 0".to_string(),
            ));
        }
        self.step.retry.validate("step.retry")?;
        self.storage.retry.validate("storage.retry")?;
        if self.idempotency.claim_ttl_ms == 0 {
            return Err(BackboneError::Configuration(
                "idempotency.claim_ttl_ms MUST be > 0".to_string(),
            ));
        }
        if self.artifacts.max_bytes == 0 {
            return Err(BackboneError::Configuration(
                "artifacts.max_bytes MUST be > 0".to_string(),
            ));
        }
        for pattern in &self.artifacts.secret_patterns {
            if pattern.name.trim().is_empty() || pattern.pattern.is_empty() {
                return Err(BackboneError::Configuration(
                    "artifacts.secret_patterns entries need a name and a pattern".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(BackboneConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_sections() {
        let config = BackboneConfig::from_yaml_str(
            "step:\n  default_timeout_ms: 5000\n  timeouts_ms:\n    code_generator: 60000\n  abort_precedence: timeout\n  retry:\n    max_attempts: 5\n",
        );
        assert!(config.is_ok());
        let config = config.unwrap_or_else(|_| unreachable!());
        assert_eq!(config.step.retry.max_attempts, 5);
        assert_eq!(config.step.retry.base_delay_ms, 500);
        assert_eq!(config.step.abort_precedence, AbortPrecedence::Timeout);
        assert_eq!(
            config.step.timeout_for("code_generator"),
            Duration::from_secs(60)
        );
        assert_eq!(config.step.timeout_for("triage"), Duration::from_secs(5));
        assert_eq!(config.lock, LockConfig::default());
    }

    #[test]
    fn renew_interval_must_be_shorter_than_ttl() {
        let result =
            BackboneConfig::from_yaml_str("lock:\n  ttl_ms: 1000\n  renew_interval_ms: 1000\n");
        assert!(matches!(result, Err(BackboneError::Configuration(_))));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = BackboneConfig::from_yaml_str("lock:\n  ttl: 1000\n");
        assert!(result.is_err());
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let result = BackboneConfig::from_yaml_str("storage:\n  retry:\n    max_attempts: 0\n");
        assert!(result.is_err());
    }
}
