use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Triaged,
    Planned,
    Resolving,
    Review,
    AwaitingApproval,
    Applying,
    Done,
    Failed,
    Aborted,
}

impl RunStatus {
    pub const ALL: [Self; 10] = [
        Self::Queued,
        Self::Triaged,
        Self::Planned,
        Self::Resolving,
        Self::Review,
        Self::AwaitingApproval,
        Self::Applying,
        Self::Done,
        Self::Failed,
        Self::Aborted,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Triaged => "triaged",
            Self::Planned => "planned",
            Self::Resolving => "resolving",
            Self::Review => "review",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Applying => "applying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Aborted)
    }

    /// The forward edge of the pipeline, if any.
    #[must_use]
    pub fn next_stage(self) -> Option<Self> {
        match self {
            Self::Queued => Some(Self::Triaged),
            Self::Triaged => Some(Self::Planned),
            Self::Planned => Some(Self::Resolving),
            Self::Resolving => Some(Self::Review),
            Self::Review => Some(Self::AwaitingApproval),
            Self::AwaitingApproval => Some(Self::Applying),
            Self::Applying => Some(Self::Done),
            Self::Done | Self::Failed | Self::Aborted => None,
        }
    }

    /// Edge table of the run lifecycle: one forward edge per stage, plus
    /// `failed`/`aborted` from every non-terminal state.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(to, Self::Failed | Self::Aborted) || self.next_stage() == Some(to)
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Triage,
    Plan,
    Resolve,
    Review,
    Autopilot,
}

impl RunType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Triage => "triage",
            Self::Plan => "plan",
            Self::Resolve => "resolve",
            Self::Review => "review",
            Self::Autopilot => "autopilot",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "triage" => Some(Self::Triage),
            "plan" => Some(Self::Plan),
            "resolve" => Some(Self::Resolve),
            "review" => Some(Self::Review),
            "autopilot" => Some(Self::Autopilot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    None,
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Webhook,
    Scheduled,
    Interactive,
}

impl TriggerSource {
    /// Automated sources may redeliver, so they must carry an idempotency key.
    #[must_use]
    pub fn is_automated(self) -> bool {
        matches!(self, Self::Webhook | Self::Scheduled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RunCreated,
    StateTransition,
    StepStarted,
    StepCompleted,
    StepFailed,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalRejected,
    GatedOperationExecuted,
    Error,
}

impl AuditEventType {
    pub const ALL: [Self; 10] = [
        Self::RunCreated,
        Self::StateTransition,
        Self::StepStarted,
        Self::StepCompleted,
        Self::StepFailed,
        Self::ApprovalRequested,
        Self::ApprovalGranted,
        Self::ApprovalRejected,
        Self::GatedOperationExecuted,
        Self::Error,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::StateTransition => "state_transition",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalGranted => "approval_granted",
            Self::ApprovalRejected => "approval_rejected",
            Self::GatedOperationExecuted => "gated_operation_executed",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}
