use axum::{Json, extract::State};

use crate::core::model::RunStatus;

use super::super::AppState;
use super::super::error::ApiResult;

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let store = state.orchestrator.store();
    store.health_check().await?;
    let running = store.count_runs(RunStatus::Running).await?;
    let pending = store.count_runs(RunStatus::Pending).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "database": store.dialect(),
        "runs": { "running": running, "pending": pending },
        "max_concurrent_runs": state.orchestrator.settings().max_concurrent_runs,
        "runners": state.orchestrator.runners().runner_types(),
    })))
}
