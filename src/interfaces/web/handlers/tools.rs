use axum::{
    Json,
    extract::{Path, State},
};

use crate::core::error::Error;
use crate::core::tools::{ToolManifest, ToolResult, definitions};

use super::super::AppState;
use super::super::error::{ApiError, ApiResult};

pub async fn manifest(State(state): State<AppState>) -> ApiResult<Json<ToolManifest>> {
    state
        .registry
        .manifest(definitions::PROVIDER)
        .map(Json)
        .ok_or_else(|| ApiError(Error::not_found("tool provider", definitions::PROVIDER)))
}

/// Tool calls always answer 200; the outcome is in the body.
pub async fn call_tool(
    Path(name): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<serde_json::Value>>,
) -> Json<ToolResult> {
    let args = body.map(|Json(v)| v).unwrap_or(serde_json::Value::Null);
    Json(state.tools.execute(&name, &args).await)
}
