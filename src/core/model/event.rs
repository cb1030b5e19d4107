use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{RunPhase, RunnerType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunCreated,
    RunStarted,
    PhaseChanged,
    DiffProduced,
    ApprovalRequested,
    Approved,
    Applied,
    ApplyFailed,
    Rejected,
    RunCompleted,
    RunFailed,
    RunStopped,
    RunTimedOut,
    RunError,
    CheckpointSaved,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RunCreated => "run_created",
            EventType::RunStarted => "run_started",
            EventType::PhaseChanged => "phase_changed",
            EventType::DiffProduced => "diff_produced",
            EventType::ApprovalRequested => "approval_requested",
            EventType::Approved => "approved",
            EventType::Applied => "applied",
            EventType::ApplyFailed => "apply_failed",
            EventType::Rejected => "rejected",
            EventType::RunCompleted => "run_completed",
            EventType::RunFailed => "run_failed",
            EventType::RunStopped => "run_stopped",
            EventType::RunTimedOut => "run_timed_out",
            EventType::RunError => "run_error",
            EventType::CheckpointSaved => "checkpoint_saved",
        }
    }
}

/// Typed event payloads, tagged by event type. Stored as a `type` column
/// plus a JSON `payload` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    RunCreated {
        task_id: Uuid,
        runner_type: RunnerType,
        attempt: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<Uuid>,
    },
    RunStarted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sandbox_id: Option<String>,
    },
    PhaseChanged {
        from: RunPhase,
        to: RunPhase,
    },
    DiffProduced {
        sandbox_id: String,
        files_changed: i64,
        additions: i64,
        deletions: i64,
    },
    ApprovalRequested {
        files_changed: i64,
    },
    Approved {
        actor: String,
    },
    Applied {
        applied_count: i64,
        #[serde(default)]
        remaining: Vec<String>,
        is_partial: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        commit_hash: Option<String>,
    },
    ApplyFailed {
        message: String,
        #[serde(default)]
        failed: Vec<String>,
    },
    Rejected {
        actor: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    RunCompleted {
        duration_ms: i64,
    },
    RunFailed {
        error_kind: String,
        message: String,
    },
    RunStopped {
        reason: String,
    },
    RunTimedOut {
        timeout_ms: i64,
        elapsed_ms: i64,
    },
    RunError {
        kind: String,
        message: String,
        #[serde(default)]
        attempt: u32,
    },
    CheckpointSaved {
        label: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::RunCreated { .. } => EventType::RunCreated,
            EventPayload::RunStarted { .. } => EventType::RunStarted,
            EventPayload::PhaseChanged { .. } => EventType::PhaseChanged,
            EventPayload::DiffProduced { .. } => EventType::DiffProduced,
            EventPayload::ApprovalRequested { .. } => EventType::ApprovalRequested,
            EventPayload::Approved { .. } => EventType::Approved,
            EventPayload::Applied { .. } => EventType::Applied,
            EventPayload::ApplyFailed { .. } => EventType::ApplyFailed,
            EventPayload::Rejected { .. } => EventType::Rejected,
            EventPayload::RunCompleted { .. } => EventType::RunCompleted,
            EventPayload::RunFailed { .. } => EventType::RunFailed,
            EventPayload::RunStopped { .. } => EventType::RunStopped,
            EventPayload::RunTimedOut { .. } => EventType::RunTimedOut,
            EventPayload::RunError { .. } => EventType::RunError,
            EventPayload::CheckpointSaved { .. } => EventType::CheckpointSaved,
        }
    }

    /// Split into the `(type, payload)` column pair.
    pub fn to_columns(&self) -> serde_json::Result<(String, serde_json::Value)> {
        let mut value = serde_json::to_value(self)?;
        let payload = value
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or_else(|| serde_json::json!({}));
        Ok((self.event_type().as_str().to_string(), payload))
    }

    pub fn from_columns(event_type: &str, payload: serde_json::Value) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::json!({ "type": event_type, "payload": payload }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: i64,
    pub run_id: Uuid,
    pub seq: i64,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub emitted_at: DateTime<Utc>,
}

impl RunEvent {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}
