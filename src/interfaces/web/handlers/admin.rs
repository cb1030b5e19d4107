use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

use crate::core::model::{Page, PolicyRules, RunnerType};
use crate::core::store::NewProfile;

use super::super::AppState;
use super::super::error::{ApiResult, parse_id};

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageQuery {
    fn page(&self) -> Page {
        Page::new(self.limit, self.offset)
    }
}

fn default_timeout_minutes() -> i64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct CreateProfileRequest {
    pub key: String,
    pub runner_type: RunnerType,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_timeout_minutes")]
    pub default_timeout_minutes: i64,
    #[serde(default)]
    pub requires_approval: bool,
}

pub async fn list_profiles(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let profiles = state.orchestrator.list_profiles(query.page()).await?;
    Ok(Json(serde_json::json!({ "success": true, "profiles": profiles })))
}

pub async fn create_profile(
    State(state): State<AppState>,
    Json(payload): Json<CreateProfileRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let profile = state
        .orchestrator
        .create_profile(NewProfile {
            key: payload.key.trim().to_string(),
            runner_type: payload.runner_type,
            config: payload.config,
            default_timeout_minutes: payload.default_timeout_minutes,
            requires_approval: payload.requires_approval,
        })
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "profile": profile })))
}

pub async fn get_profile(
    Path(key): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let profile = state.orchestrator.get_profile(&key).await?;
    Ok(Json(serde_json::json!({ "success": true, "profile": profile })))
}

pub async fn list_policies(
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let policies = state.orchestrator.list_policies(query.page()).await?;
    Ok(Json(serde_json::json!({ "success": true, "policies": policies })))
}

pub async fn get_policy(
    Path(key): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let policy = state.orchestrator.get_policy(&key).await?;
    Ok(Json(serde_json::json!({ "success": true, "policy": policy })))
}

pub async fn put_policy(
    Path(key): Path<String>,
    State(state): State<AppState>,
    Json(rules): Json<PolicyRules>,
) -> ApiResult<Json<serde_json::Value>> {
    let policy = state.orchestrator.upsert_policy(&key, &rules).await?;
    Ok(Json(serde_json::json!({ "success": true, "policy": policy })))
}

pub async fn delete_task(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = parse_id(&id, "task id")?;
    state.orchestrator.delete_task(id).await?;
    Ok(Json(serde_json::json!({ "success": true, "deleted": id })))
}
