#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_backbone_domain::{
    ApprovalDecision, BackboneConfig, BackboneResult, Clock, DateTimeUtc, ProposedChange,
    ProposedChangeSet, RunId, RunStatus, RunType, StartRunRequest, Trigger, TriggerSource,
};
use agent_backbone_ledger::{telemetry, RunLedger};
use agent_backbone_store_sqlite::SqliteBackboneStore;
use time::OffsetDateTime;

pub type Ledger = RunLedger<SqliteBackboneStore>;

pub fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
    result.unwrap_or_else(|err| panic!("unexpected error: {err:?}"))
}

/// Clock that only moves when a test says so.
pub struct ManualClock {
    now: Mutex<DateTimeUtc>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(must(OffsetDateTime::from_unix_timestamp(1_772_355_600))),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|_| unreachable!());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTimeUtc {
        *self.now.lock().unwrap_or_else(|_| unreachable!())
    }
}

/// Small timeouts and near-zero backoff so dispatch tests run in milliseconds.
pub fn fast_config() -> BackboneConfig {
    let mut config = BackboneConfig::default();
    config.step.default_timeout_ms = 200;
    config.step.retry.base_delay_ms = 1;
    config.step.retry.max_delay_ms = 5;
    config.storage.retry.base_delay_ms = 1;
    config.storage.retry.max_delay_ms = 2;
    config
}

pub fn ledger_with(config: BackboneConfig) -> (Ledger, Arc<ManualClock>) {
    telemetry::try_init_tracing("warn");
    let clock = ManualClock::new();
    let store = must(SqliteBackboneStore::open_in_memory());
    let ledger = must(RunLedger::new(store, config)).with_clock(clock.clone());
    (ledger, clock)
}

pub fn ledger() -> (Ledger, Arc<ManualClock>) {
    ledger_with(fast_config())
}

pub fn webhook_request(key: &str) -> StartRunRequest {
    StartRunRequest {
        tenant_id: "acme".to_string(),
        repo_id: "widgets".to_string(),
        subject_id: "pr-4411".to_string(),
        run_type: RunType::Autopilot,
        trigger: Trigger {
            source: TriggerSource::Webhook,
            actor: "github-webhook".to_string(),
            command: None,
        },
        idempotency_key: Some(key.to_string()),
    }
}

pub fn interactive_request() -> StartRunRequest {
    StartRunRequest {
        tenant_id: "acme".to_string(),
        repo_id: "widgets".to_string(),
        subject_id: "issue-77".to_string(),
        run_type: RunType::Resolve,
        trigger: Trigger {
            source: TriggerSource::Interactive,
            actor: "dana".to_string(),
            command: Some("/resolve".to_string()),
        },
        idempotency_key: None,
    }
}

pub fn new_run(ledger: &Ledger) -> RunId {
    must(ledger.start_run(&interactive_request())).run.run_id
}

/// Walk the happy path from the run's current status up to `target`. Reaching
/// `awaiting_approval` proposes a patch, and a maintainer approves it at once.
pub fn advance_to(ledger: &Ledger, run_id: RunId, target: RunStatus) -> BackboneResult<()> {
    let mut current = ledger.get_run(run_id)?.status;
    while current != target {
        let Some(next) = current.next_stage() else {
            panic!("{target} is not reachable from {current}");
        };
        if next == RunStatus::AwaitingApproval {
            let run = ledger.request_approval(run_id, &change_set("walked"), "orchestrator")?;
            let patch_hash = run.patch_hash.unwrap_or_default();
            ledger.record_decision(
                run_id,
                ApprovalDecision::Approved,
                "maintainer",
                &patch_hash,
                None,
            )?;
        } else {
            ledger.transition(run_id, current, next, &serde_json::json!({}), "orchestrator")?;
        }
        current = next;
    }
    Ok(())
}

pub fn change_set(body: &str) -> ProposedChangeSet {
    ProposedChangeSet {
        changes: vec![
            ProposedChange {
                path: "src/lib.rs".to_string(),
                diff: format!("--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-old\n+{body}\n"),
            },
            ProposedChange {
                path: "README.md".to_string(),
                diff: "--- a/README.md\n+++ b/README.md\n@@ -1 +1 @@\n-a\n+b\n".to_string(),
            },
        ],
    }
}
