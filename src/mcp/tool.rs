//! Tool executors and the tool registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{McpError, McpResult};
use crate::mcp::registry::Registry;
use crate::mcp::types::{ToolDefinition, ToolResult};

/// A callable tool.
///
/// Executors are shared across concurrent calls; any mutable state they hold
/// must be synchronised by the executor itself.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// The tool's definition. Its name is the registry key.
    fn definition(&self) -> &ToolDefinition;

    /// Runs the tool.
    ///
    /// # Errors
    ///
    /// Returns an error when the arguments are invalid or the tool fails.
    async fn execute(&self, arguments: Map<String, Value>) -> McpResult<ToolResult>;
}

/// Concurrency-safe map from tool name to executor.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Registry<dyn ToolExecutor>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor, replacing any tool with the same name.
    pub async fn register(&self, executor: impl ToolExecutor + 'static) {
        self.register_shared(Arc::new(executor)).await;
    }

    /// Registers a shared executor, replacing any tool with the same name.
    pub async fn register_shared(&self, executor: Arc<dyn ToolExecutor>) {
        let name = executor.definition().name.clone();
        if self.tools.insert(name.clone(), executor).await.is_some() {
            tracing::debug!(tool = %name, "Replaced tool");
        } else {
            tracing::debug!(tool = %name, "Registered tool");
        }
    }

    /// Removes a tool. Unknown names are ignored.
    pub async fn unregister(&self, name: &str) {
        if self.tools.remove(name).await.is_some() {
            tracing::debug!(tool = %name, "Unregistered tool");
        }
    }

    /// Looks up an executor by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.tools.get(name).await
    }

    /// Snapshot of all tool definitions in registration order.
    pub async fn list(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .await
            .iter()
            .map(|tool| tool.definition().clone())
            .collect()
    }

    /// Executes the named tool.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::MethodNotFound`] for an unknown tool, otherwise
    /// whatever the executor returns.
    pub async fn execute(&self, name: &str, arguments: Map<String, Value>) -> McpResult<ToolResult> {
        let executor = self
            .get(name)
            .await
            .ok_or_else(|| McpError::method_not_found(format!("Tool '{name}'")))?;
        executor.execute(arguments).await
    }
}
