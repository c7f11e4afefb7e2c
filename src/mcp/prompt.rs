//! Prompt providers and the prompt registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{McpError, McpResult};
use crate::mcp::registry::Registry;
use crate::mcp::types::{PromptDefinition, PromptMessage};

/// A named template that generates a message sequence.
#[async_trait]
pub trait PromptProvider: Send + Sync {
    /// The prompt's definition. Its name is the registry key.
    fn definition(&self) -> &PromptDefinition;

    /// Generates messages for the given arguments.
    ///
    /// # Errors
    ///
    /// Returns an error such as [`McpError::MissingRequiredArgument`] when
    /// the arguments are incomplete, or a generation error.
    async fn generate(&self, arguments: HashMap<String, String>) -> McpResult<Vec<PromptMessage>>;
}

/// Concurrency-safe map from prompt name to provider.
#[derive(Default)]
pub struct PromptRegistry {
    prompts: Registry<dyn PromptProvider>,
}

impl PromptRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider, replacing any prompt with the same name.
    pub async fn register(&self, provider: impl PromptProvider + 'static) {
        self.register_shared(Arc::new(provider)).await;
    }

    /// Registers a shared provider, replacing any prompt with the same name.
    pub async fn register_shared(&self, provider: Arc<dyn PromptProvider>) {
        let name = provider.definition().name.clone();
        if self.prompts.insert(name.clone(), provider).await.is_some() {
            tracing::debug!(prompt = %name, "Replaced prompt");
        } else {
            tracing::debug!(prompt = %name, "Registered prompt");
        }
    }

    /// Removes a prompt. Unknown names are ignored.
    pub async fn unregister(&self, name: &str) {
        if self.prompts.remove(name).await.is_some() {
            tracing::debug!(prompt = %name, "Unregistered prompt");
        }
    }

    /// Looks up a provider by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn PromptProvider>> {
        self.prompts.get(name).await
    }

    /// Snapshot of all prompt definitions in registration order.
    pub async fn list(&self) -> Vec<PromptDefinition> {
        self.prompts
            .values()
            .await
            .iter()
            .map(|prompt| prompt.definition().clone())
            .collect()
    }

    /// Generates messages from the named prompt.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::MethodNotFound`] for an unknown prompt, otherwise
    /// whatever the provider returns.
    pub async fn generate(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> McpResult<Vec<PromptMessage>> {
        let provider = self
            .get(name)
            .await
            .ok_or_else(|| McpError::method_not_found(format!("Prompt '{name}'")))?;
        provider.generate(arguments).await
    }
}
