use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::model::{Page, RunEvent, RunPhase};
use crate::core::orchestrator::{ApproveRequest, ListRunsQuery, Orchestrator, RejectRequest};

use super::super::AppState;
use super::super::error::{ApiResult, parse_id};

const STREAM_BATCH: i64 = 500;
const STREAM_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    pub status: Option<String>,
    pub runner_type: Option<String>,
    pub task_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub after: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StopBody {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApproveBody {
    pub actor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RejectBody {
    pub actor: Option<String>,
    pub reason: Option<String>,
}

fn actor_or_default(actor: Option<String>) -> String {
    actor
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| "api".to_string())
}

pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let runs = state
        .orchestrator
        .list_runs(&ListRunsQuery {
            status: query.status,
            runner_type: query.runner_type,
            task_id: query.task_id,
            created_after: query.created_after,
            created_before: query.created_before,
            limit: query.limit,
            offset: query.offset,
        })
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "runs": runs })))
}

pub async fn get_run(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let run = state.orchestrator.get_run(parse_id(&id, "run id")?).await?;
    Ok(Json(serde_json::json!({ "success": true, "run": run })))
}

pub async fn list_events(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let events = state
        .orchestrator
        .list_events(
            parse_id(&id, "run id")?,
            query.after,
            Page::new(query.limit, query.offset),
        )
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "events": events })))
}

pub async fn get_diff(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let diff = state.orchestrator.get_run_diff(parse_id(&id, "run id")?).await?;
    Ok(Json(serde_json::json!({ "success": true, "diff": diff })))
}

pub async fn list_checkpoints(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let checkpoints = state
        .orchestrator
        .list_checkpoints(parse_id(&id, "run id")?)
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "checkpoints": checkpoints })))
}

pub async fn stop_run(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<StopBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let reason = body.and_then(|Json(b)| b.reason).unwrap_or_default();
    let run = state
        .orchestrator
        .stop_run(parse_id(&id, "run id")?, &reason)
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "run": run })))
}

pub async fn approve_run(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<ApproveBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let actor = actor_or_default(body.and_then(|Json(b)| b.actor));
    let result = state
        .orchestrator
        .approve_run(ApproveRequest {
            run_id: parse_id(&id, "run id")?,
            actor,
        })
        .await?;
    Ok(Json(serde_json::json!({ "success": result.success, "result": result })))
}

pub async fn reject_run(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Option<Json<RejectBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let run = state
        .orchestrator
        .reject_run(RejectRequest {
            run_id: parse_id(&id, "run id")?,
            actor: actor_or_default(body.actor),
            reason: body.reason,
        })
        .await?;
    Ok(Json(serde_json::json!({ "success": true, "run": run })))
}

pub async fn retry_run(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<serde_json::Value>> {
    let run = state.orchestrator.retry_run(parse_id(&id, "run id")?).await?;
    Ok(Json(serde_json::json!({ "success": true, "run": run })))
}

struct EventCursor {
    orchestrator: Arc<Orchestrator>,
    run_id: Uuid,
    last_seq: i64,
    wake: broadcast::Receiver<RunEvent>,
    pending: VecDeque<RunEvent>,
    finished: bool,
}

impl EventCursor {
    /// Next SSE frame: journal replay first, then live events until the run
    /// is terminal and finalized, then one `end` frame.
    async fn next_frame(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event_frame(&event));
            }
            if self.finished {
                return None;
            }

            let batch = match self
                .orchestrator
                .list_events(self.run_id, Some(self.last_seq), Page::new(Some(STREAM_BATCH), None))
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    self.finished = true;
                    return Some(error_frame(e.message()));
                }
            };
            if let Some(last) = batch.last() {
                self.last_seq = last.seq;
                self.pending.extend(batch);
                continue;
            }

            match self.orchestrator.get_run(self.run_id).await {
                Ok(run) if run.is_terminal() && run.phase == RunPhase::Done => {
                    // Re-read once: the final transition may have committed
                    // events after the batch above.
                    if let Ok(tail) = self
                        .orchestrator
                        .list_events(self.run_id, Some(self.last_seq), Page::new(Some(STREAM_BATCH), None))
                        .await
                        && !tail.is_empty()
                    {
                        if let Some(last) = tail.last() {
                            self.last_seq = last.seq;
                        }
                        self.pending.extend(tail);
                        continue;
                    }
                    self.finished = true;
                    let data = serde_json::json!({ "status": run.status, "phase": run.phase });
                    return Some(Event::default().event("end").data(data.to_string()));
                }
                Ok(_) => {}
                Err(e) => {
                    self.finished = true;
                    return Some(error_frame(e.message()));
                }
            }

            tokio::select! {
                _ = self.wake.recv() => {}
                _ = tokio::time::sleep(STREAM_POLL) => {}
            }
        }
    }
}

fn event_frame(event: &RunEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .id(event.seq.to_string())
        .event(event.event_type().as_str())
        .data(data)
}

fn error_frame(message: &str) -> Event {
    Event::default()
        .event("error")
        .data(serde_json::json!({ "error": message }).to_string())
}

pub async fn stream_events(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let run_id = parse_id(&id, "run id")?;
    // Subscribe before the existence check so nothing committed after it is missed.
    let wake = state.orchestrator.subscribe();
    state.orchestrator.get_run(run_id).await?;

    let cursor = EventCursor {
        orchestrator: state.orchestrator.clone(),
        run_id,
        last_seq: query.after.unwrap_or(0).max(0),
        wake,
        pending: VecDeque::new(),
        finished: false,
    };
    let frames = stream::unfold(cursor, |mut cursor| async move {
        cursor
            .next_frame()
            .await
            .map(|frame| (Ok::<_, Infallible>(frame), cursor))
    });
    Ok(Sse::new(frames).keep_alive(KeepAlive::default()))
}
