use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "1.0.0";
pub const PROVIDER: &str = "agent-core";

pub const SPAWN_CODING_AGENT: &str = "spawn_coding_agent";
pub const CHECK_AGENT_STATUS: &str = "check_agent_status";
pub const STOP_AGENT: &str = "stop_agent";
pub const LIST_ACTIVE_AGENTS: &str = "list_active_agents";
pub const GET_AGENT_DIFF: &str = "get_agent_diff";
pub const APPROVE_AGENT_CHANGES: &str = "approve_agent_changes";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolManifest {
    pub protocol_version: String,
    pub scenario: ScenarioInfo,
    pub tools: Vec<ToolDefinition>,
    pub categories: Vec<ToolCategory>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioInfo {
    pub name: String,
    pub version: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCategory {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub category: String,
    pub parameters: ToolParameters,
    pub metadata: ToolMetadata,
}

/// JSON-schema subset: always an object at the top level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameters {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: BTreeMap<String, ParamSchema>,
    pub required: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    #[serde(rename = "type")]
    pub kind: ParamType,
    pub description: String,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<ParamSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl ParamSchema {
    fn new(kind: ParamType, description: &str) -> Self {
        Self {
            kind,
            description: description.to_string(),
            allowed: None,
            items: None,
            default: None,
        }
    }

    fn one_of(mut self, values: &[&str]) -> Self {
        self.allowed = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }

    fn items(mut self, items: ParamSchema) -> Self {
        self.items = Some(Box::new(items));
        self
    }

    fn default_value(mut self, value: serde_json::Value) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostEstimate {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub enabled_by_default: bool,
    pub requires_approval: bool,
    pub timeout_seconds: u64,
    pub rate_limit_per_minute: u32,
    pub cost_estimate: CostEstimate,
    pub long_running: bool,
    pub idempotent: bool,
    pub tags: Vec<String>,
    pub examples: Vec<serde_json::Value>,
}

impl ToolMetadata {
    fn quick(tags: &[&str]) -> Self {
        Self {
            enabled_by_default: true,
            requires_approval: false,
            timeout_seconds: 10,
            rate_limit_per_minute: 120,
            cost_estimate: CostEstimate::Low,
            long_running: false,
            idempotent: true,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            examples: Vec::new(),
        }
    }
}

struct ToolBuilder {
    def: ToolDefinition,
}

impl ToolBuilder {
    fn new(name: &str, category: &str, description: &str, metadata: ToolMetadata) -> Self {
        Self {
            def: ToolDefinition {
                name: name.to_string(),
                description: description.to_string(),
                category: category.to_string(),
                parameters: ToolParameters {
                    kind: "object".to_string(),
                    properties: BTreeMap::new(),
                    required: Vec::new(),
                },
                metadata,
            },
        }
    }

    fn param(mut self, name: &str, schema: ParamSchema, required: bool) -> Self {
        self.def.parameters.properties.insert(name.to_string(), schema);
        if required {
            self.def.parameters.required.push(name.to_string());
        }
        self
    }

    fn example(mut self, example: serde_json::Value) -> Self {
        self.def.metadata.examples.push(example);
        self
    }

    fn build(self) -> ToolDefinition {
        self.def
    }
}

fn run_id_param() -> ParamSchema {
    ParamSchema::new(ParamType::String, "Run id (uuid) returned by spawn_coding_agent")
}

pub fn scenario() -> ScenarioInfo {
    ScenarioInfo {
        name: PROVIDER.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "Spawn coding agents in sandboxes, review their diffs and apply them"
            .to_string(),
    }
}

pub fn categories() -> Vec<ToolCategory> {
    vec![
        ToolCategory {
            name: "agents".to_string(),
            description: "Start, inspect and stop coding-agent runs".to_string(),
        },
        ToolCategory {
            name: "review".to_string(),
            description: "Inspect and approve the changes a run produced".to_string(),
        },
    ]
}

pub fn tool_definitions() -> Vec<ToolDefinition> {
    let runner_tags = ["claude-code", "codex", "opencode"];
    let attachment = ParamSchema::new(
        ParamType::Object,
        "Context attachment: {type, key, label, content, format, tags}",
    );

    vec![
        ToolBuilder::new(
            SPAWN_CODING_AGENT,
            "agents",
            "Queue a coding agent on a task. Returns immediately with a run_id to poll.",
            ToolMetadata {
                timeout_seconds: 30,
                rate_limit_per_minute: 30,
                cost_estimate: CostEstimate::High,
                long_running: true,
                idempotent: false,
                ..ToolMetadata::quick(&["spawn", "async"])
            },
        )
        .param(
            "task",
            ParamSchema::new(ParamType::String, "What the agent should do"),
            true,
        )
        .param(
            "runner_type",
            ParamSchema::new(ParamType::String, "Which coding agent runs the task")
                .one_of(&runner_tags)
                .default_value(serde_json::json!("claude-code")),
            false,
        )
        .param(
            "workspace_path",
            ParamSchema::new(ParamType::String, "Absolute project root"),
            false,
        )
        .param(
            "scope_path",
            ParamSchema::new(ParamType::String, "Sub-directory of the project the agent may touch"),
            false,
        )
        .param(
            "timeout_minutes",
            ParamSchema::new(ParamType::Integer, "Run deadline in minutes, greater than zero")
                .default_value(serde_json::json!(30)),
            false,
        )
        .param(
            "profile_key",
            ParamSchema::new(ParamType::String, "Named profile with runner defaults"),
            false,
        )
        .param(
            "idempotency_key",
            ParamSchema::new(ParamType::String, "Repeat-safe key; the same key returns the same run"),
            false,
        )
        .param(
            "_context_attachments",
            ParamSchema::new(ParamType::Array, "Extra context for the agent").items(attachment),
            false,
        )
        .example(serde_json::json!({ "task": "add a README", "runner_type": "claude-code" }))
        .build(),
        ToolBuilder::new(
            CHECK_AGENT_STATUS,
            "agents",
            "Current status, phase and outcome of a run.",
            ToolMetadata::quick(&["status"]),
        )
        .param("run_id", run_id_param(), true)
        .build(),
        ToolBuilder::new(
            STOP_AGENT,
            "agents",
            "Ask a run to stop. Safe to repeat.",
            ToolMetadata::quick(&["control"]),
        )
        .param("run_id", run_id_param(), true)
        .param(
            "reason",
            ParamSchema::new(ParamType::String, "Recorded on the run_stopped event"),
            false,
        )
        .build(),
        ToolBuilder::new(
            LIST_ACTIVE_AGENTS,
            "agents",
            "Runs that are currently executing.",
            ToolMetadata::quick(&["status"]),
        )
        .param(
            "limit",
            ParamSchema::new(ParamType::Integer, "Maximum number of runs").default_value(serde_json::json!(50)),
            false,
        )
        .build(),
        ToolBuilder::new(
            GET_AGENT_DIFF,
            "review",
            "The unified diff and per-file changes a run produced.",
            ToolMetadata::quick(&["diff", "review"]),
        )
        .param("run_id", run_id_param(), true)
        .build(),
        ToolBuilder::new(
            APPROVE_AGENT_CHANGES,
            "review",
            "Apply a run's diff to the project root.",
            ToolMetadata {
                requires_approval: true,
                timeout_seconds: 120,
                rate_limit_per_minute: 30,
                cost_estimate: CostEstimate::Medium,
                idempotent: false,
                ..ToolMetadata::quick(&["apply", "review"])
            },
        )
        .param("run_id", run_id_param(), true)
        .param(
            "actor",
            ParamSchema::new(ParamType::String, "Who approved the changes")
                .default_value(serde_json::json!("agent-inbox")),
            false,
        )
        .build(),
    ]
}
