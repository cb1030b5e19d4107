use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::model::{ContextAttachment, Run, RunStatus, RunnerType};
use crate::core::orchestrator::{ApproveRequest, ListRunsQuery, Orchestrator, SpawnRequest};

use super::definitions::{
    APPROVE_AGENT_CHANGES, CHECK_AGENT_STATUS, GET_AGENT_DIFF, LIST_ACTIVE_AGENTS,
    SPAWN_CODING_AGENT, STOP_AGENT,
};

pub const DEFAULT_APPROVER: &str = "agent-inbox";

/// The four codes tool callers see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCode {
    InvalidArgs,
    NotFound,
    InternalError,
    UnknownTool,
}

impl From<ErrorKind> for ToolErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::InvalidArgs | ErrorKind::Conflict | ErrorKind::PreconditionFailed => {
                ToolErrorCode::InvalidArgs
            }
            ErrorKind::NotFound => ToolErrorCode::NotFound,
            ErrorKind::Transient | ErrorKind::Timeout | ErrorKind::Internal => {
                ToolErrorCode::InternalError
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<ToolErrorCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_async: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ToolResult {
    fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
            code: None,
            is_async: None,
            run_id: None,
        }
    }

    fn failed(code: ToolErrorCode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
            code: Some(code),
            is_async: None,
            run_id: None,
        }
    }

    fn from_error(err: &Error) -> Self {
        Self::failed(err.kind().into(), err.message())
    }
}

/// Maps tool calls onto orchestrator operations. Never fails: every
/// outcome is a [`ToolResult`].
#[derive(Clone)]
pub struct ToolExecutor {
    orchestrator: Arc<Orchestrator>,
}

impl ToolExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    pub async fn execute(&self, name: &str, args: &Value) -> ToolResult {
        debug!("Tool call {}", name);
        let empty = Map::new();
        let args = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => {
                return ToolResult::failed(
                    ToolErrorCode::InvalidArgs,
                    "arguments must be a JSON object",
                );
            }
        };

        let outcome = match name {
            SPAWN_CODING_AGENT => self.spawn(args).await,
            CHECK_AGENT_STATUS => self.status(args).await,
            STOP_AGENT => self.stop(args).await,
            LIST_ACTIVE_AGENTS => self.list_active(args).await,
            GET_AGENT_DIFF => self.diff(args).await,
            APPROVE_AGENT_CHANGES => self.approve(args).await,
            other => {
                return ToolResult::failed(
                    ToolErrorCode::UnknownTool,
                    format!("unknown tool: {}", other),
                );
            }
        };
        outcome.unwrap_or_else(|err| {
            if err.kind() == ErrorKind::Internal || err.is_transient() {
                warn!("Tool {} failed: {}", name, err.detail());
            }
            ToolResult::from_error(&err)
        })
    }

    async fn spawn(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let task = required_str(args, "task")?;
        let runner_type = optional_str(args, "runner_type")?
            .map(|tag| tag.parse::<RunnerType>())
            .transpose()?;
        let timeout = optional_positive_int(args, "timeout_minutes")?
            .map(|minutes| {
                minutes
                    .checked_mul(60)
                    .map(Duration::from_secs)
                    .ok_or_else(|| Error::invalid_args("timeout_minutes is too large"))
            })
            .transpose()?;
        let context = match args.get("_context_attachments") {
            None | Some(Value::Null) => Vec::new(),
            Some(raw) => serde_json::from_value::<Vec<ContextAttachment>>(raw.clone()).map_err(|e| {
                Error::invalid_args(format!("_context_attachments is malformed: {}", e))
            })?,
        };

        let outcome = self
            .orchestrator
            .spawn(SpawnRequest {
                task,
                title: optional_str(args, "title")?,
                runner_type,
                profile_key: optional_str(args, "profile_key")?,
                workspace_path: optional_str(args, "workspace_path")?,
                scope_path: optional_str(args, "scope_path")?,
                timeout,
                requires_approval: optional_bool(args, "requires_approval")?,
                idempotency_key: optional_str(args, "idempotency_key")?,
                created_by: Some("tool".to_string()),
                context,
            })
            .await?;

        let run = outcome.run;
        let message = if outcome.created {
            format!("{} run queued; poll check_agent_status with the run_id", run.runner_type)
        } else {
            "an earlier run with this idempotency key was returned".to_string()
        };
        let mut result = ToolResult::ok(json!({
            "success": true,
            "run_id": run.id,
            "task_id": run.task_id,
            "status": run.status,
            "message": message,
        }));
        result.is_async = Some(true);
        result.run_id = Some(run.id.to_string());
        Ok(result)
    }

    async fn status(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let run = self.orchestrator.get_run(required_uuid(args, "run_id")?).await?;
        Ok(ToolResult::ok(snapshot(&run)))
    }

    async fn stop(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let run_id = required_uuid(args, "run_id")?;
        let reason = optional_str(args, "reason")?.unwrap_or_default();
        let run = self.orchestrator.stop_run(run_id, &reason).await?;
        Ok(ToolResult::ok(snapshot(&run)))
    }

    async fn list_active(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let limit = optional_positive_int(args, "limit")?.unwrap_or(50);
        let runs = self
            .orchestrator
            .list_runs(&ListRunsQuery {
                status: Some(RunStatus::Running.as_str().to_string()),
                limit: Some(limit.min(i64::MAX as u64) as i64),
                ..ListRunsQuery::default()
            })
            .await?;
        let agents: Vec<Value> = runs.iter().map(snapshot).collect();
        Ok(ToolResult::ok(json!({
            "count": agents.len(),
            "agents": agents,
        })))
    }

    async fn diff(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let artifact = self
            .orchestrator
            .get_run_diff(required_uuid(args, "run_id")?)
            .await?;
        Ok(ToolResult::ok(json!({
            "run_id": artifact.run_id,
            "sandbox_id": artifact.sandbox_id,
            "diff": artifact.unified_diff,
            "files": artifact.files.iter().map(|f| json!({
                "path": f.path,
                "change_type": f.change_type,
                "additions": f.additions,
                "deletions": f.deletions,
                "binary": f.binary,
            })).collect::<Vec<_>>(),
            "stats": artifact.stats,
            "generated_at": artifact.generated_at,
        })))
    }

    async fn approve(&self, args: &Map<String, Value>) -> Result<ToolResult> {
        let run_id = required_uuid(args, "run_id")?;
        let actor = optional_str(args, "actor")?.unwrap_or_else(|| DEFAULT_APPROVER.to_string());
        let outcome = self
            .orchestrator
            .approve_run(ApproveRequest { run_id, actor })
            .await?;
        let body = serde_json::to_value(&outcome)?;
        if outcome.success {
            Ok(ToolResult::ok(body))
        } else {
            let mut failed =
                ToolResult::failed(ToolErrorCode::InternalError, "none of the changes could be applied");
            failed.result = Some(body);
            Ok(failed)
        }
    }
}

fn snapshot(run: &Run) -> Value {
    let mut snap = json!({
        "run_id": run.id,
        "task_id": run.task_id,
        "status": run.status,
        "phase": run.phase,
        "attempt": run.attempt,
        "requires_approval": run.requires_approval,
        "created_at": run.created_at,
        "started_at": run.started_at,
        "ended_at": run.ended_at,
        "error_kind": run.error_kind,
        "error_message": run.error_message,
        "summary": run.summary,
    });
    if let (Some(cfg), Value::Object(map)) = (&run.resolved_config, &mut snap) {
        map.insert("runner_type".to_string(), json!(cfg.runner_type));
        map.insert("timeout_ms".to_string(), json!(cfg.timeout_ms));
    }
    snap
}

fn required_str(args: &Map<String, Value>, name: &str) -> Result<String> {
    optional_str(args, name)?.ok_or_else(|| Error::invalid_args(format!("{} is required", name)))
}

/// Blank strings count as absent.
fn optional_str(args: &Map<String, Value>, name: &str) -> Result<Option<String>> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(Error::invalid_args(format!("{} must be a string", name))),
    }
}

fn required_uuid(args: &Map<String, Value>, name: &str) -> Result<Uuid> {
    let raw = required_str(args, name)?;
    Uuid::parse_str(&raw).map_err(|_| Error::invalid_args(format!("{} must be a uuid", name)))
}

fn optional_bool(args: &Map<String, Value>, name: &str) -> Result<Option<bool>> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(Error::invalid_args(format!("{} must be a boolean", name))),
    }
}

/// Accepts `5` and `5.0`; JSON decoders on the calling side often hand
/// integers over as floats.
fn optional_positive_int(args: &Map<String, Value>, name: &str) -> Result<Option<u64>> {
    let invalid = || Error::invalid_args(format!("{} must be a positive integer", name));
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                return if v > 0 { Ok(Some(v)) } else { Err(invalid()) };
            }
            match n.as_f64() {
                Some(f) if f.is_finite() && f >= 1.0 && f.fract() == 0.0 && f <= u32::MAX as f64 => {
                    Ok(Some(f as u64))
                }
                _ => Err(invalid()),
            }
        }
        Some(_) => Err(invalid()),
    }
}
