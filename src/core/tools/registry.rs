use chrono::Utc;

use super::definitions::{
    self, PROTOCOL_VERSION, ScenarioInfo, ToolCategory, ToolDefinition, ToolManifest,
};

#[derive(Debug, Clone)]
struct ProviderEntry {
    name: String,
    scenario: ScenarioInfo,
    tools: Vec<ToolDefinition>,
    categories: Vec<ToolCategory>,
}

/// Static tool metadata keyed by provider. Registering a provider name
/// again replaces the earlier entry and makes it the latest registration.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    providers: Vec<ProviderEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in agent-core provider.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            definitions::PROVIDER,
            definitions::scenario(),
            definitions::tool_definitions(),
            definitions::categories(),
        );
        registry
    }

    pub fn register(
        &mut self,
        provider: &str,
        scenario: ScenarioInfo,
        tools: Vec<ToolDefinition>,
        categories: Vec<ToolCategory>,
    ) {
        self.providers.retain(|p| p.name != provider);
        self.providers.push(ProviderEntry {
            name: provider.to_string(),
            scenario,
            tools,
            categories,
        });
    }

    pub fn providers(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn manifest(&self, provider: &str) -> Option<ToolManifest> {
        self.providers
            .iter()
            .find(|p| p.name == provider)
            .map(|p| ToolManifest {
                protocol_version: PROTOCOL_VERSION.to_string(),
                scenario: p.scenario.clone(),
                tools: p.tools.clone(),
                categories: p.categories.clone(),
                generated_at: Utc::now(),
            })
    }

    /// Every provider's tools in one manifest under `scenario`. A category
    /// or tool name seen in several providers keeps the latest definition.
    pub fn combined_manifest(&self, scenario: ScenarioInfo) -> ToolManifest {
        let mut tools: Vec<ToolDefinition> = Vec::new();
        let mut categories: Vec<ToolCategory> = Vec::new();
        for provider in &self.providers {
            for tool in &provider.tools {
                match tools.iter_mut().find(|t| t.name == tool.name) {
                    Some(existing) => *existing = tool.clone(),
                    None => tools.push(tool.clone()),
                }
            }
            for category in &provider.categories {
                match categories.iter_mut().find(|c| c.name == category.name) {
                    Some(existing) => *existing = category.clone(),
                    None => categories.push(category.clone()),
                }
            }
        }
        ToolManifest {
            protocol_version: PROTOCOL_VERSION.to_string(),
            scenario,
            tools,
            categories,
            generated_at: Utc::now(),
        }
    }

    pub fn find_tool(&self, name: &str) -> Option<&ToolDefinition> {
        self.providers
            .iter()
            .rev()
            .flat_map(|p| p.tools.iter())
            .find(|t| t.name == name)
    }
}
