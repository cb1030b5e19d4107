use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::RunnerType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub key: String,
    pub runner_type: RunnerType,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub default_timeout_minutes: i64,
    pub requires_approval: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_approval: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_minutes: Option<i64>,
    #[serde(default)]
    pub runner_allow_list: Vec<String>,
}

impl PolicyRules {
    /// Overlay `other` on top of `self`; set fields in `other` win.
    pub fn merged_with(&self, other: &PolicyRules) -> PolicyRules {
        PolicyRules {
            requires_approval: other.requires_approval.or(self.requires_approval),
            max_timeout_minutes: other.max_timeout_minutes.or(self.max_timeout_minutes),
            runner_allow_list: if other.runner_allow_list.is_empty() {
                self.runner_allow_list.clone()
            } else {
                other.runner_allow_list.clone()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: Uuid,
    pub key: String,
    pub rules: PolicyRules,
    pub updated_at: DateTime<Utc>,
}
