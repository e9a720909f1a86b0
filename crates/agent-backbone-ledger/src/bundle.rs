//! Run bundle export: the on-disk layout an operator or auditor can read
//! without the database.
//!
//! ```text
//! <root>/<tenant>/<repo>/<run_id>/
//!   run.json
//!   steps.jsonl
//!   audit.jsonl
//!   artifacts/<name>
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use agent_backbone_domain::{
    BackboneError, BackboneResult, RunId, RunRecord, StepRecord, AUDIT_LOG_ARTIFACT,
};
use agent_backbone_store_core::BackboneStore;
use anyhow::{Context, Result};
use tracing::info;

use crate::RunLedger;

impl<S: BackboneStore> RunLedger<S> {
    /// Write the run's bundle under `root` and return the run directory.
    /// Re-exporting overwrites files in place.
    ///
    /// # Errors
    /// `NotFound` for unknown runs, `Storage` when the files cannot be written.
    pub fn export_bundle(&self, run_id: RunId, root: &Path) -> BackboneResult<PathBuf> {
        let run = self.get_run(run_id)?;
        let steps = self.list_steps(run_id)?;
        let audit = self
            .read_artifact(run_id, AUDIT_LOG_ARTIFACT)?
            .unwrap_or_default();

        let mut artifacts = Vec::new();
        for record in self.list_artifacts(run_id)? {
            if record.name == AUDIT_LOG_ARTIFACT {
                continue;
            }
            let content = self
                .read_artifact(run_id, &record.name)?
                .ok_or_else(|| BackboneError::not_found("artifact", &record.name))?;
            artifacts.push((record.name, content));
        }

        let dir = root
            .join(path_component(&run.tenant_id))
            .join(path_component(&run.repo_id))
            .join(run_id.to_string());
        write_bundle(&dir, &run, &steps, &audit, &artifacts)?;
        info!(
            %run_id,
            dir = %dir.display(),
            steps = steps.len(),
            artifacts = artifacts.len(),
            "run bundle exported"
        );
        Ok(dir)
    }
}

fn write_bundle(
    dir: &Path,
    run: &RunRecord,
    steps: &[StepRecord],
    audit: &[u8],
    artifacts: &[(String, Vec<u8>)],
) -> Result<()> {
    let artifact_dir = dir.join("artifacts");
    fs::create_dir_all(&artifact_dir)
        .with_context(|| format!("failed to create {}", artifact_dir.display()))?;

    let run_json = serde_json::to_vec_pretty(run).context("run record not serializable")?;
    write_file(&dir.join("run.json"), &run_json)?;

    let mut steps_jsonl = String::new();
    for step in steps {
        steps_jsonl.push_str(&serde_json::to_string(step).context("step not serializable")?);
        steps_jsonl.push('\n');
    }
    write_file(&dir.join("steps.jsonl"), steps_jsonl.as_bytes())?;
    write_file(&dir.join(AUDIT_LOG_ARTIFACT), audit)?;

    for (name, content) in artifacts {
        write_file(&artifact_dir.join(name), content)?;
    }
    Ok(())
}

fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

/// Tenant and repo ids are free text; keep them to one safe directory level.
fn path_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}
