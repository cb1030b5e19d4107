use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;

use super::handlers::{admin, health, runs, tools};
use super::{AppState, sse_logs_endpoint};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub(crate) fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route("/api/tools/manifest", get(tools::manifest))
        .route("/api/tools/{name}", post(tools::call_tool))
        .route("/api/runs", get(runs::list_runs))
        .route("/api/runs/{id}", get(runs::get_run))
        .route("/api/runs/{id}/events", get(runs::list_events))
        .route("/api/runs/{id}/events/stream", get(runs::stream_events))
        .route("/api/runs/{id}/diff", get(runs::get_diff))
        .route("/api/runs/{id}/checkpoints", get(runs::list_checkpoints))
        .route("/api/runs/{id}/stop", post(runs::stop_run))
        .route("/api/runs/{id}/approve", post(runs::approve_run))
        .route("/api/runs/{id}/reject", post(runs::reject_run))
        .route("/api/runs/{id}/retry", post(runs::retry_run))
        .route(
            "/api/profiles",
            get(admin::list_profiles).post(admin::create_profile),
        )
        .route("/api/profiles/{key}", get(admin::get_profile))
        .route("/api/policies", get(admin::list_policies))
        .route(
            "/api/policies/{key}",
            get(admin::get_policy).put(admin::put_policy),
        )
        .route("/api/tasks/{id}", delete(admin::delete_task))
        .route("/api/logs", get(sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::RunStatus;
    use crate::core::orchestrator::runners::scripted::Script;
    use crate::core::orchestrator::tests::{Harness, harness, harness_with, wait_for};
    use axum::http::StatusCode;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn state_for(h: &Harness) -> AppState {
        let (log_tx, _) = tokio::sync::broadcast::channel(16);
        AppState::new(h.orch.clone(), log_tx, 17890)
    }

    async fn idle_harness() -> Harness {
        let runner = Arc::new(
            crate::core::orchestrator::runners::scripted::ScriptedRunner::new(
                crate::core::model::RunnerType::ClaudeCode,
                Script::Hang,
            ),
        );
        harness_with(vec![runner], |_| {}, false).await
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    async fn spawn_via_tool(app: Router, task: &str, extra: serde_json::Value) -> uuid::Uuid {
        let mut args = serde_json::json!({ "task": task });
        if let (Some(args), serde_json::Value::Object(extra)) = (args.as_object_mut(), extra) {
            args.extend(extra);
        }
        let (status, json) =
            json_request(app, Method::POST, "/api/tools/spawn_coding_agent", Some(args)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true, "{}", json);
        uuid::Uuid::parse_str(json["run_id"].as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let h = idle_harness().await;
        let app = build_api_router(state_for(&h));
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn health_reports_store_and_queue() {
        let h = idle_harness().await;
        let (status, json) =
            json_request(build_api_router(state_for(&h)), Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["database"], "embedded");
        assert_eq!(json["runs"]["pending"], 0);
        assert_eq!(json["runners"], serde_json::json!(["claude-code"]));
    }

    #[tokio::test]
    async fn manifest_and_unknown_tool() {
        let h = idle_harness().await;
        let app = build_api_router(state_for(&h));

        let (status, json) =
            json_request(app.clone(), Method::GET, "/api/tools/manifest", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["tools"].as_array().unwrap().len(), 6);
        assert!(json["generated_at"].is_string());

        let (status, json) =
            json_request(app, Method::POST, "/api/tools/frobnicate", Some(serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "unknown_tool");
        assert_eq!(json["error"], "unknown tool: frobnicate");
    }

    #[tokio::test]
    async fn tool_call_without_body_is_invalid_args() {
        let h = idle_harness().await;
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/tools/check_agent_status")
            .body(Body::empty())
            .unwrap();
        let resp = build_api_router(state_for(&h)).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["code"], "invalid_args");
    }

    #[tokio::test]
    async fn completed_run_is_readable_over_http() {
        let h = harness(Script::Write(vec![("README.md".into(), "# hi\n".into())])).await;
        let app = build_api_router(state_for(&h));
        let id = spawn_via_tool(app.clone(), "add a README", serde_json::json!({})).await;
        wait_for(&h.orch, id, |r| r.status == RunStatus::Completed).await;

        let (status, json) =
            json_request(app.clone(), Method::GET, &format!("/api/runs/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["run"]["status"], "completed");
        assert_eq!(json["run"]["summary"]["applied_count"], 1);

        let (_, json) = json_request(
            app.clone(),
            Method::GET,
            &format!("/api/runs/{}/events?after=1&limit=2", id),
            None,
        )
        .await;
        let events = json["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["seq"], 2);

        let (_, json) =
            json_request(app.clone(), Method::GET, &format!("/api/runs/{}/diff", id), None).await;
        assert!(json["diff"]["unified_diff"].as_str().unwrap().contains("+# hi"));

        let (_, json) = json_request(
            app.clone(),
            Method::GET,
            &format!("/api/runs/{}/checkpoints", id),
            None,
        )
        .await;
        let labels: Vec<&str> = json["checkpoints"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|c| c["label"].as_str())
            .collect();
        assert!(labels.contains(&"workspace"));
        assert!(labels.contains(&"runner"));

        let (_, json) =
            json_request(app, Method::GET, "/api/runs?status=completed,failed", None).await;
        assert_eq!(json["runs"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn event_stream_replays_and_ends_for_finished_runs() {
        let h = harness(Script::Write(vec![("a.txt".into(), "a\n".into())])).await;
        let app = build_api_router(state_for(&h));
        let id = spawn_via_tool(app.clone(), "write a", serde_json::json!({})).await;
        wait_for(&h.orch, id, |r| r.status == RunStatus::Completed).await;

        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("/api/runs/{}/events/stream", id))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            axum::body::to_bytes(resp.into_body(), 1024 * 1024),
        )
        .await
        .unwrap()
        .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: run_created"));
        assert!(text.contains("event: run_completed"));
        assert!(text.contains("event: end"));
        assert!(text.find("run_created").unwrap() < text.find("run_completed").unwrap());
    }

    #[tokio::test]
    async fn errors_are_json_with_codes() {
        let h = idle_harness().await;
        let app = build_api_router(state_for(&h));

        let (status, json) =
            json_request(app.clone(), Method::GET, "/api/runs/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "invalid_args");

        let (status, json) = json_request(
            app.clone(),
            Method::GET,
            &format!("/api/runs/{}", uuid::Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");

        let (status, json) =
            json_request(app.clone(), Method::GET, "/api/runs?status=sleeping", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "invalid_args");

        let id = spawn_via_tool(app.clone(), "idle", serde_json::json!({})).await;
        let (status, json) = json_request(
            app.clone(),
            Method::POST,
            &format!("/api/runs/{}/approve", id),
            Some(serde_json::json!({ "actor": "reviewer" })),
        )
        .await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);
        assert_eq!(json["code"], "precondition_failed");

        let (status, _) =
            json_request(app.clone(), Method::POST, &format!("/api/runs/{}/retry", id), None).await;
        assert_eq!(status, StatusCode::PRECONDITION_FAILED);

        let (status, json) =
            json_request(app, Method::GET, &format!("/api/runs/{}/diff", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");
    }

    #[tokio::test]
    async fn stop_then_delete_task() {
        let h = idle_harness().await;
        let app = build_api_router(state_for(&h));
        let id = spawn_via_tool(app.clone(), "queued work", serde_json::json!({})).await;
        let task_id = h.orch.get_run(id).await.unwrap().task_id;

        let (status, json) = json_request(
            app.clone(),
            Method::DELETE,
            &format!("/api/tasks/{}", task_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "conflict");

        let (status, json) = json_request(
            app.clone(),
            Method::POST,
            &format!("/api/runs/{}/stop", id),
            Some(serde_json::json!({ "reason": "not needed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["run"]["status"], "stopped");

        let (status, json) = json_request(
            app.clone(),
            Method::DELETE,
            &format!("/api/tasks/{}", task_id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", json);

        let (status, _) =
            json_request(app, Method::GET, &format!("/api/runs/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn profiles_and_policies_admin() {
        let h = idle_harness().await;
        let app = build_api_router(state_for(&h));

        let (status, json) = json_request(
            app.clone(),
            Method::POST,
            "/api/profiles",
            Some(serde_json::json!({
                "key": "careful",
                "runner_type": "claude-code",
                "requires_approval": true,
                "config": { "model": "large" },
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", json);
        assert_eq!(json["profile"]["default_timeout_minutes"], 30);

        let (status, json) = json_request(
            app.clone(),
            Method::POST,
            "/api/profiles",
            Some(serde_json::json!({ "key": "careful", "runner_type": "claude-code" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["code"], "conflict");

        let (_, json) = json_request(app.clone(), Method::GET, "/api/profiles/careful", None).await;
        assert_eq!(json["profile"]["requires_approval"], true);
        let (_, json) = json_request(app.clone(), Method::GET, "/api/profiles", None).await;
        assert_eq!(json["profiles"].as_array().unwrap().len(), 1);

        let (status, json) =
            json_request(app.clone(), Method::GET, "/api/policies/default", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");

        let (status, json) = json_request(
            app.clone(),
            Method::PUT,
            "/api/policies/default",
            Some(serde_json::json!({ "max_timeout_minutes": 10, "runner_allow_list": ["claude-code"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", json);

        let (status, json) = json_request(
            app.clone(),
            Method::PUT,
            "/api/policies/default",
            Some(serde_json::json!({ "runner_allow_list": ["gpt"] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "invalid_args");

        let (_, json) = json_request(app.clone(), Method::GET, "/api/policies/default", None).await;
        assert_eq!(json["policy"]["rules"]["max_timeout_minutes"], 10);

        let id = spawn_via_tool(
            app.clone(),
            "careful work",
            serde_json::json!({ "profile_key": "careful", "timeout_minutes": 60 }),
        )
        .await;
        let run = h.orch.get_run(id).await.unwrap();
        assert!(run.requires_approval);
        assert_eq!(run.timeout_ms, 10 * 60 * 1000);
    }

    #[tokio::test]
    async fn api_route_contract_has_all_expected_paths() {
        let id = uuid::Uuid::new_v4();
        let paths = [
            "/api/health".to_string(),
            "/api/tools/manifest".to_string(),
            "/api/tools/spawn_coding_agent".to_string(),
            "/api/runs".to_string(),
            format!("/api/runs/{}", id),
            format!("/api/runs/{}/events", id),
            format!("/api/runs/{}/events/stream", id),
            format!("/api/runs/{}/diff", id),
            format!("/api/runs/{}/checkpoints", id),
            format!("/api/runs/{}/stop", id),
            format!("/api/runs/{}/approve", id),
            format!("/api/runs/{}/reject", id),
            format!("/api/runs/{}/retry", id),
            "/api/profiles".to_string(),
            "/api/profiles/careful".to_string(),
            "/api/policies".to_string(),
            "/api/policies/default".to_string(),
            format!("/api/tasks/{}", id),
            "/api/logs".to_string(),
        ];
        let unique: HashSet<&String> = paths.iter().collect();
        assert_eq!(unique.len(), paths.len(), "Duplicate routes found in route contract");

        let h = idle_harness().await;
        let app = build_api_router(state_for(&h));
        for path in &paths {
            let req = Request::builder()
                .method(Method::PATCH)
                .uri(path)
                .body(Body::empty())
                .expect("request should build");
            let resp = app
                .clone()
                .oneshot(req)
                .await
                .expect("router oneshot should succeed");
            assert_eq!(
                resp.status(),
                StatusCode::METHOD_NOT_ALLOWED,
                "Route missing from router: {}",
                path
            );
        }
    }
}
