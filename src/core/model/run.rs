use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    AwaitingApproval,
    Approved,
    Completed,
    Failed,
    Stopped,
    TimedOut,
}

impl RunStatus {
    pub const ALL: [RunStatus; 8] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::AwaitingApproval,
        RunStatus::Approved,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::Stopped,
        RunStatus::TimedOut,
    ];

    pub const NON_TERMINAL: [RunStatus; 3] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::AwaitingApproval,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::AwaitingApproval => "awaiting_approval",
            RunStatus::Approved => "approved",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
            RunStatus::TimedOut => "timed_out",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "awaiting_approval" => Some(RunStatus::AwaitingApproval),
            "approved" => Some(RunStatus::Approved),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "stopped" => Some(RunStatus::Stopped),
            "timed_out" => Some(RunStatus::TimedOut),
            _ => None,
        }
    }

    /// `approved` is terminal: a partially applied diff keeps the run there
    /// with the remaining files recorded in its summary.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            RunStatus::Pending | RunStatus::Running | RunStatus::AwaitingApproval
        )
    }

    /// Status edges of the run state machine. Staying in the same status is
    /// allowed so the phase can advance (e.g. `stopped/finalizing` to
    /// `stopped/done`); leaving a terminal status never is.
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        if self == to {
            return true;
        }
        match self {
            RunStatus::Pending => matches!(
                to,
                RunStatus::Running | RunStatus::Failed | RunStatus::Stopped
            ),
            RunStatus::Running => matches!(
                to,
                RunStatus::AwaitingApproval
                    | RunStatus::Completed
                    | RunStatus::Failed
                    | RunStatus::Stopped
                    | RunStatus::TimedOut
            ),
            RunStatus::AwaitingApproval => matches!(
                to,
                RunStatus::Approved | RunStatus::Completed | RunStatus::Failed | RunStatus::Stopped
            ),
            RunStatus::Approved
            | RunStatus::Completed
            | RunStatus::Failed
            | RunStatus::Stopped
            | RunStatus::TimedOut => false,
        }
    }

    /// Rank in the status partial order. Terminal statuses share the top rank.
    pub fn rank(self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Running => 1,
            RunStatus::AwaitingApproval => 2,
            _ => 3,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RunStatus::from_status(s)
            .ok_or_else(|| Error::invalid_args(format!("unknown run status '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Queued,
    Initializing,
    Executing,
    ProducingDiff,
    AwaitingReview,
    Applying,
    Finalizing,
    Done,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Queued => "queued",
            RunPhase::Initializing => "initializing",
            RunPhase::Executing => "executing",
            RunPhase::ProducingDiff => "producing_diff",
            RunPhase::AwaitingReview => "awaiting_review",
            RunPhase::Applying => "applying",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Done => "done",
        }
    }

    pub fn from_phase(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunPhase::Queued),
            "initializing" => Some(RunPhase::Initializing),
            "executing" => Some(RunPhase::Executing),
            "producing_diff" => Some(RunPhase::ProducingDiff),
            "awaiting_review" => Some(RunPhase::AwaitingReview),
            "applying" => Some(RunPhase::Applying),
            "finalizing" => Some(RunPhase::Finalizing),
            "done" => Some(RunPhase::Done),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerType {
    #[default]
    #[serde(rename = "claude-code")]
    ClaudeCode,
    #[serde(rename = "codex")]
    Codex,
    #[serde(rename = "opencode")]
    OpenCode,
}

impl RunnerType {
    pub const ALL: [RunnerType; 3] = [RunnerType::ClaudeCode, RunnerType::Codex, RunnerType::OpenCode];

    pub fn as_str(self) -> &'static str {
        match self {
            RunnerType::ClaudeCode => "claude-code",
            RunnerType::Codex => "codex",
            RunnerType::OpenCode => "opencode",
        }
    }

    pub fn from_tag(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude-code" => Some(RunnerType::ClaudeCode),
            "codex" => Some(RunnerType::Codex),
            "opencode" => Some(RunnerType::OpenCode),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunnerType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RunnerType::from_tag(s)
            .ok_or_else(|| Error::invalid_args(format!("unknown runner type '{}'", s)))
    }
}

/// Effective configuration for one run. Captured when the run is created and
/// never rewritten afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    pub runner_type: RunnerType,
    pub requires_approval: bool,
    pub timeout_ms: i64,
    pub project_root: String,
    pub scope_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_key: Option<String>,
    #[serde(default)]
    pub runner_allow_list: Vec<String>,
    #[serde(default)]
    pub runner_options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub files_changed: i64,
    pub additions: i64,
    pub deletions: i64,
    #[serde(default)]
    pub applied_count: i64,
    #[serde(default)]
    pub remaining: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub task_id: Uuid,
    pub profile_id: Option<Uuid>,
    pub runner_type: RunnerType,
    pub resolved_config: Option<ResolvedConfig>,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub idempotency_key: Option<String>,
    pub requires_approval: bool,
    pub timeout_ms: i64,
    pub attempt: i32,
    pub parent_run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub sandbox_id: Option<String>,
    pub summary: Option<RunSummary>,
}

impl Run {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(0) as u64)
    }

    /// `ended_at - started_at`, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Field updates applied together with a status/phase transition.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub sandbox_id: Option<String>,
    pub summary: Option<RunSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub statuses: Vec<RunStatus>,
    pub runner_type: Option<RunnerType>,
    pub task_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}
