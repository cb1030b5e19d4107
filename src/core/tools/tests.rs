use std::sync::Arc;

use serde_json::json;

use super::definitions::{self, ParamType, ScenarioInfo, ToolCategory};
use super::{ToolErrorCode, ToolExecutor, ToolRegistry};
use crate::core::model::{EventPayload, Page, RunFilter, RunStatus, RunnerType};
use crate::core::orchestrator::runners::scripted::{Script, ScriptedRunner};
use crate::core::orchestrator::tests::{events, harness, harness_with, wait_for};

fn scenario(name: &str) -> ScenarioInfo {
    ScenarioInfo {
        name: name.to_string(),
        version: "0.1.0".to_string(),
        description: String::new(),
    }
}

fn category(name: &str, description: &str) -> ToolCategory {
    ToolCategory {
        name: name.to_string(),
        description: description.to_string(),
    }
}

fn run_id(result: &super::ToolResult) -> uuid::Uuid {
    uuid::Uuid::parse_str(result.run_id.as_deref().unwrap()).unwrap()
}

async fn spawn(tools: &ToolExecutor, args: serde_json::Value) -> uuid::Uuid {
    let result = tools.execute("spawn_coding_agent", &args).await;
    assert!(result.success, "{:?}", result);
    run_id(&result)
}

#[test]
fn builtin_manifest_lists_the_six_tools() {
    let manifest = ToolRegistry::with_builtin()
        .manifest(definitions::PROVIDER)
        .unwrap();
    assert_eq!(manifest.protocol_version, definitions::PROTOCOL_VERSION);
    assert_eq!(manifest.scenario.name, "agent-core");
    let names: Vec<&str> = manifest.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "spawn_coding_agent",
            "check_agent_status",
            "stop_agent",
            "list_active_agents",
            "get_agent_diff",
            "approve_agent_changes",
        ]
    );
    for tool in &manifest.tools {
        assert_eq!(tool.parameters.kind, "object");
        for required in &tool.parameters.required {
            assert!(tool.parameters.properties.contains_key(required), "{}", tool.name);
        }
        assert!(manifest.categories.iter().any(|c| c.name == tool.category));
    }

    let spawn = &manifest.tools[0];
    assert_eq!(spawn.parameters.required, vec!["task".to_string()]);
    assert_eq!(spawn.parameters.properties["timeout_minutes"].kind, ParamType::Integer);
    assert!(spawn.metadata.long_running);

    let wire = serde_json::to_value(&manifest).unwrap();
    assert_eq!(wire["tools"][0]["parameters"]["type"], "object");
    assert_eq!(wire["tools"][0]["metadata"]["cost_estimate"], "high");
    assert_eq!(
        wire["tools"][0]["parameters"]["properties"]["runner_type"]["enum"],
        json!(["claude-code", "codex", "opencode"])
    );
}

#[test]
fn registering_a_provider_again_replaces_it() {
    let mut registry = ToolRegistry::new();
    registry.register("a", scenario("a"), definitions::tool_definitions(), vec![]);
    registry.register("b", scenario("b"), vec![], vec![]);
    registry.register("a", scenario("a2"), vec![], vec![]);

    assert_eq!(registry.providers(), vec!["b", "a"]);
    let manifest = registry.manifest("a").unwrap();
    assert_eq!(manifest.scenario.name, "a2");
    assert!(manifest.tools.is_empty());
    assert!(registry.manifest("missing").is_none());
    assert!(registry.find_tool("spawn_coding_agent").is_none());
}

#[test]
fn later_providers_win_category_conflicts() {
    let mut registry = ToolRegistry::new();
    registry.register(
        "first",
        scenario("first"),
        vec![],
        vec![category("agents", "old"), category("misc", "kept")],
    );
    registry.register("second", scenario("second"), vec![], vec![category("agents", "new")]);

    let manifest = registry.combined_manifest(scenario("all"));
    assert_eq!(manifest.categories.len(), 2);
    let agents = manifest.categories.iter().find(|c| c.name == "agents").unwrap();
    assert_eq!(agents.description, "new");
}

#[tokio::test]
async fn unknown_tool_creates_nothing() {
    let h = harness(Script::Write(vec![])).await;
    let tools = ToolExecutor::new(h.orch.clone());

    let result = tools.execute("frobnicate", &json!({})).await;
    assert!(!result.success);
    assert_eq!(result.code, Some(ToolErrorCode::UnknownTool));
    assert_eq!(result.error.as_deref(), Some("unknown tool: frobnicate"));

    let wire = serde_json::to_value(&result).unwrap();
    assert_eq!(wire["code"], "unknown_tool");
    assert!(wire.get("result").is_none());

    let runs = h.store.list_runs(&RunFilter::default(), Page::default()).await.unwrap();
    assert!(runs.is_empty());
    assert!(h.store.list_tasks(Page::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn spawn_then_poll_to_completion() {
    let h = harness(Script::Write(vec![("README.md".into(), "# hello\n".into())])).await;
    let tools = ToolExecutor::new(h.orch.clone());

    let result = tools
        .execute(
            "spawn_coding_agent",
            &json!({ "task": "add a README", "runner_type": "claude-code" }),
        )
        .await;
    assert!(result.success);
    assert_eq!(result.is_async, Some(true));
    let body = result.result.clone().unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["run_id"], json!(result.run_id.clone().unwrap()));
    assert!(body["task_id"].is_string());

    let id = run_id(&result);
    wait_for(&h.orch, id, |r| r.status == RunStatus::Completed).await;

    let status = tools.execute("check_agent_status", &json!({ "run_id": id })).await;
    let snap = status.result.unwrap();
    assert_eq!(snap["status"], "completed");
    assert_eq!(snap["phase"], "done");
    assert_eq!(snap["runner_type"], "claude-code");

    let diff = tools.execute("get_agent_diff", &json!({ "run_id": id })).await;
    assert!(diff.success);
    let diff = diff.result.unwrap();
    assert!(diff["diff"].as_str().unwrap().contains("+# hello"));
    assert_eq!(diff["files"][0]["path"], "README.md");
    assert_eq!(diff["stats"]["files_changed"], 1);
    assert_eq!(
        std::fs::read_to_string(h.project.path().join("README.md")).unwrap(),
        "# hello\n"
    );
}

#[tokio::test]
async fn spawn_validates_arguments() {
    let h = harness_with(
        vec![Arc::new(ScriptedRunner::new(RunnerType::ClaudeCode, Script::Hang))],
        |_| {},
        false,
    )
    .await;
    let tools = ToolExecutor::new(h.orch.clone());

    for args in [
        json!({}),
        json!({ "task": "   " }),
        json!({ "task": 42 }),
        json!({ "task": "x", "runner_type": "gpt-engineer" }),
        json!({ "task": "x", "timeout_minutes": 0 }),
        json!({ "task": "x", "timeout_minutes": -5 }),
        json!({ "task": "x", "timeout_minutes": 1.5 }),
        json!({ "task": "x", "timeout_minutes": "ten" }),
        json!({ "task": "x", "timeout_minutes": u64::MAX }),
        json!({ "task": "x", "workspace_path": "relative" }),
        json!({ "task": "x", "_context_attachments": "nope" }),
        json!(["task"]),
    ] {
        let result = tools.execute("spawn_coding_agent", &args).await;
        assert!(!result.success, "{}", args);
        assert_eq!(result.code, Some(ToolErrorCode::InvalidArgs), "{}", args);
    }
    let runs = h.store.list_runs(&RunFilter::default(), Page::default()).await.unwrap();
    assert!(runs.is_empty());
}

#[tokio::test]
async fn huge_timeout_is_capped_to_the_stored_range() {
    let h = harness_with(
        vec![Arc::new(ScriptedRunner::new(RunnerType::ClaudeCode, Script::Hang))],
        |_| {},
        false,
    )
    .await;
    let tools = ToolExecutor::new(h.orch.clone());

    let id = spawn(&tools, json!({ "task": "x", "timeout_minutes": u64::MAX / 60 })).await;
    let run = h.orch.get_run(id).await.unwrap();
    assert_eq!(run.timeout_ms, i64::MAX);
}

#[tokio::test]
async fn float_minutes_and_attachments_are_accepted() {
    let h = harness_with(
        vec![Arc::new(ScriptedRunner::new(RunnerType::ClaudeCode, Script::Hang))],
        |_| {},
        false,
    )
    .await;
    let tools = ToolExecutor::new(h.orch.clone());

    let id = spawn(
        &tools,
        json!({
            "task": "fix the flaky test",
            "timeout_minutes": 2.0,
            "_context_attachments": [
                { "type": "file", "key": "ci", "label": "CI log", "content": "boom", "format": "text", "tags": ["ci"] }
            ],
        }),
    )
    .await;

    let run = h.orch.get_run(id).await.unwrap();
    assert_eq!(run.timeout_ms, 2 * 60 * 1000);
    let task = h.store.get_task(run.task_id).await.unwrap();
    assert_eq!(task.context.len(), 1);
    assert_eq!(task.context[0].kind, "file");
    assert_eq!(task.context[0].tags, vec!["ci".to_string()]);
    assert_eq!(task.created_by, "tool");
}

#[tokio::test]
async fn lookups_map_errors_to_tool_codes() {
    let h = harness_with(
        vec![Arc::new(ScriptedRunner::new(RunnerType::ClaudeCode, Script::Hang))],
        |_| {},
        false,
    )
    .await;
    let tools = ToolExecutor::new(h.orch.clone());

    let bad = tools.execute("check_agent_status", &json!({ "run_id": "not-a-uuid" })).await;
    assert_eq!(bad.code, Some(ToolErrorCode::InvalidArgs));

    let missing = uuid::Uuid::new_v4();
    let gone = tools.execute("check_agent_status", &json!({ "run_id": missing })).await;
    assert_eq!(gone.code, Some(ToolErrorCode::NotFound));

    let id = spawn(&tools, json!({ "task": "refactor" })).await;
    let diff = tools.execute("get_agent_diff", &json!({ "run_id": id })).await;
    assert!(!diff.success);
    assert_eq!(diff.code, Some(ToolErrorCode::NotFound));

    // Pending runs cannot be approved.
    let approve = tools.execute("approve_agent_changes", &json!({ "run_id": id })).await;
    assert_eq!(approve.code, Some(ToolErrorCode::InvalidArgs));
}

#[tokio::test]
async fn stop_is_repeatable() {
    let h = harness(Script::Hang).await;
    let tools = ToolExecutor::new(h.orch.clone());
    let id = spawn(&tools, json!({ "task": "spin" })).await;
    wait_for(&h.orch, id, |r| r.status == RunStatus::Running).await;

    let active = tools.execute("list_active_agents", &json!({})).await;
    let active = active.result.unwrap();
    assert_eq!(active["count"], 1);
    assert_eq!(active["agents"][0]["run_id"], json!(id));

    let first = tools.execute("stop_agent", &json!({ "run_id": id })).await;
    assert!(first.success);
    assert_eq!(first.result.unwrap()["status"], "stopped");
    let second = tools.execute("stop_agent", &json!({ "run_id": id })).await;
    assert!(second.success);
    assert_eq!(second.result.unwrap()["status"], "stopped");

    wait_for(&h.orch, id, |r| r.phase == crate::core::model::RunPhase::Done).await;
    let active = tools.execute("list_active_agents", &json!({ "limit": 10.0 })).await;
    assert_eq!(active.result.unwrap()["count"], 0);
}

#[tokio::test]
async fn approval_defaults_the_actor() {
    let h = harness(Script::Write(vec![("NOTES.md".into(), "notes\n".into())])).await;
    let tools = ToolExecutor::new(h.orch.clone());
    let id = spawn(
        &tools,
        json!({ "task": "write notes", "requires_approval": true }),
    )
    .await;
    wait_for(&h.orch, id, |r| r.status == RunStatus::AwaitingApproval).await;
    assert!(!h.project.path().join("NOTES.md").exists());

    let result = tools.execute("approve_agent_changes", &json!({ "run_id": id })).await;
    assert!(result.success, "{:?}", result);
    let body = result.result.unwrap();
    assert_eq!(body["applied_count"], 1);
    assert_eq!(body["is_partial"], false);

    let approved = events(&h.orch, id)
        .await
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::Approved { actor } => Some(actor),
            _ => None,
        });
    assert_eq!(approved.as_deref(), Some("agent-inbox"));
    assert!(h.project.path().join("NOTES.md").exists());
}
