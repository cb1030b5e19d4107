//! Tool surface for calling agents: static definitions, the provider
//! registry and the executor that maps calls onto the orchestrator.

pub mod definitions;
mod executor;
mod registry;

pub use definitions::{ToolDefinition, ToolManifest};
pub use executor::{DEFAULT_APPROVER, ToolErrorCode, ToolExecutor, ToolResult};
pub use registry::ToolRegistry;

#[cfg(test)]
mod tests;
