use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::RunStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Approved,
    Rejected,
    Failed,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Failed => "failed",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "approved" => Some(TaskStatus::Approved),
            "rejected" => Some(TaskStatus::Rejected),
            "failed" => Some(TaskStatus::Failed),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }

    /// Task status mirrored from the status of its latest run.
    pub fn mirror(run: RunStatus) -> Self {
        match run {
            RunStatus::Pending => TaskStatus::Queued,
            RunStatus::Running | RunStatus::AwaitingApproval => TaskStatus::Running,
            RunStatus::Approved => TaskStatus::Approved,
            RunStatus::Completed => TaskStatus::Completed,
            RunStatus::Failed | RunStatus::Stopped | RunStatus::TimedOut => TaskStatus::Failed,
        }
    }
}

/// Caller-supplied context handed to the runner alongside the task text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextAttachment {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub scope_path: String,
    pub project_root: String,
    pub status: TaskStatus,
    pub created_by: String,
    pub context: Vec<ContextAttachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub scope_path: String,
    pub project_root: String,
    pub created_by: String,
    pub context: Vec<ContextAttachment>,
}
