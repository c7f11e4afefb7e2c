//! Fluent construction of a configured [`McpServer`].
//!
//! ```no_run
//! use mcp_engine::mcp::{ServerBuilder, StaticResource, StdioTransport};
//!
//! # async fn run() -> mcp_engine::error::McpResult<()> {
//! let server = ServerBuilder::new("notes", "1.0.0")
//!     .instructions("Read notes://today before answering.")
//!     .resource(StaticResource::text("notes://today", "Buy milk"))
//!     .resources_subscribe(true)
//!     .build()
//!     .await;
//!
//! server.start(StdioTransport::stdio()).await?;
//! server.closed().await;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Weak};

use crate::config::Config;
use crate::mcp::prompt::PromptProvider;
use crate::mcp::resource::ResourceProvider;
use crate::mcp::server::{McpServer, ServerDelegate};
use crate::mcp::tool::ToolExecutor;
use crate::mcp::types::{
    Implementation, LoggingCapability, PromptsCapability, ResourcesCapability, ServerCapabilities,
    ToolsCapability,
};

/// Accumulates server settings and capabilities.
///
/// Every method only records its argument; nothing happens until
/// [`ServerBuilder::build`].
#[must_use]
#[allow(clippy::struct_excessive_bools)]
pub struct ServerBuilder {
    name: String,
    version: String,
    title: Option<String>,
    instructions: Option<String>,
    delegate: Option<Weak<dyn ServerDelegate>>,
    tools: Vec<Arc<dyn ToolExecutor>>,
    resources: Vec<Arc<dyn ResourceProvider>>,
    prompts: Vec<Arc<dyn PromptProvider>>,
    tools_list_changed: bool,
    resources_list_changed: bool,
    resources_subscribe: bool,
    prompts_list_changed: bool,
    logging: bool,
}

impl ServerBuilder {
    /// Starts a builder for a server with the given identity.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            title: None,
            instructions: None,
            delegate: None,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            tools_list_changed: false,
            resources_list_changed: false,
            resources_subscribe: false,
            prompts_list_changed: false,
            logging: false,
        }
    }

    /// Starts a builder from a loaded configuration file.
    pub fn from_config(config: &Config) -> Self {
        let server = &config.server;
        let capabilities = &config.capabilities;
        let mut builder = Self::new(server.name.clone(), server.version.clone())
            .tools_list_changed(capabilities.tools_list_changed)
            .resources_list_changed(capabilities.resources_list_changed)
            .resources_subscribe(capabilities.resources_subscribe)
            .prompts_list_changed(capabilities.prompts_list_changed)
            .logging(capabilities.logging);
        builder.title.clone_from(&server.title);
        builder.instructions.clone_from(&server.instructions);
        builder
    }

    /// Sets the human-readable title.
    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Sets the instructions sent in the initialize result.
    pub fn instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Sets the delegate. Only a weak reference is kept.
    pub fn delegate<D: ServerDelegate + 'static>(mut self, delegate: &Arc<D>) -> Self {
        let weak = Arc::downgrade(delegate);
        let weak: Weak<dyn ServerDelegate> = weak;
        self.delegate = Some(weak);
        self
    }

    /// Adds a tool.
    pub fn tool(self, executor: impl ToolExecutor + 'static) -> Self {
        self.tool_shared(Arc::new(executor))
    }

    /// Adds a shared tool.
    pub fn tool_shared(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.tools.push(executor);
        self
    }

    /// Adds a resource.
    pub fn resource(self, provider: impl ResourceProvider + 'static) -> Self {
        self.resource_shared(Arc::new(provider))
    }

    /// Adds a shared resource.
    pub fn resource_shared(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.resources.push(provider);
        self
    }

    /// Adds a prompt.
    pub fn prompt(self, provider: impl PromptProvider + 'static) -> Self {
        self.prompt_shared(Arc::new(provider))
    }

    /// Adds a shared prompt.
    pub fn prompt_shared(mut self, provider: Arc<dyn PromptProvider>) -> Self {
        self.prompts.push(provider);
        self
    }

    /// Advertises `tools.listChanged`.
    pub const fn tools_list_changed(mut self, enabled: bool) -> Self {
        self.tools_list_changed = enabled;
        self
    }

    /// Advertises `resources.listChanged`.
    pub const fn resources_list_changed(mut self, enabled: bool) -> Self {
        self.resources_list_changed = enabled;
        self
    }

    /// Advertises `resources.subscribe`.
    pub const fn resources_subscribe(mut self, enabled: bool) -> Self {
        self.resources_subscribe = enabled;
        self
    }

    /// Advertises `prompts.listChanged`.
    pub const fn prompts_list_changed(mut self, enabled: bool) -> Self {
        self.prompts_list_changed = enabled;
        self
    }

    /// Advertises the `logging` capability.
    pub const fn logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// The capabilities [`ServerBuilder::build`] will advertise.
    ///
    /// A capability kind is present when it has something registered or one
    /// of its flags is set; otherwise it is left off the wire.
    #[must_use]
    pub fn capabilities(&self) -> ServerCapabilities {
        let tools = (!self.tools.is_empty() || self.tools_list_changed).then(|| ToolsCapability {
            list_changed: self.tools_list_changed,
        });
        let resources = (!self.resources.is_empty()
            || self.resources_list_changed
            || self.resources_subscribe)
            .then(|| ResourcesCapability {
                subscribe: self.resources_subscribe,
                list_changed: self.resources_list_changed,
            });
        let prompts =
            (!self.prompts.is_empty() || self.prompts_list_changed).then(|| PromptsCapability {
                list_changed: self.prompts_list_changed,
            });
        let logging = self.logging.then(LoggingCapability::default);

        ServerCapabilities {
            tools,
            resources,
            prompts,
            logging,
        }
    }

    /// Builds the server with everything registered.
    pub async fn build(self) -> McpServer {
        let capabilities = self.capabilities();
        let info = Implementation {
            name: self.name,
            title: self.title,
            version: self.version,
        };
        tracing::debug!(
            server = %info.name,
            tools = self.tools.len(),
            resources = self.resources.len(),
            prompts = self.prompts.len(),
            "Building server"
        );

        let server = McpServer::new(info, capabilities, self.instructions);
        if let Some(delegate) = self.delegate {
            server.set_delegate_weak(delegate).await;
        }
        for tool in self.tools {
            server.register_tool_shared(tool).await;
        }
        for resource in self.resources {
            server.register_resource_shared(resource).await;
        }
        for prompt in self.prompts {
            server.register_prompt_shared(prompt).await;
        }
        server
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::McpResult;
    use crate::mcp::resource::StaticResource;
    use crate::mcp::types::{ToolDefinition, ToolResult};
    use async_trait::async_trait;
    use serde_json::{Map, Value};

    struct Noop {
        definition: ToolDefinition,
    }

    #[async_trait]
    impl ToolExecutor for Noop {
        fn definition(&self) -> &ToolDefinition {
            &self.definition
        }

        async fn execute(&self, _arguments: Map<String, Value>) -> McpResult<ToolResult> {
            Ok(ToolResult::text("ok"))
        }
    }

    #[test]
    fn empty_builder_advertises_nothing() {
        let capabilities = ServerBuilder::new("s", "1").capabilities();
        assert_eq!(capabilities, ServerCapabilities::default());
        assert_eq!(serde_json::to_value(&capabilities).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn registered_kinds_are_advertised() {
        let capabilities = ServerBuilder::new("s", "1")
            .tool(Noop {
                definition: ToolDefinition::new("noop"),
            })
            .capabilities();
        assert_eq!(capabilities.tools, Some(ToolsCapability::default()));
        assert!(capabilities.resources.is_none());
        assert!(capabilities.prompts.is_none());
    }

    #[test]
    fn flags_alone_advertise_kinds() {
        let capabilities = ServerBuilder::new("s", "1")
            .resources_subscribe(true)
            .prompts_list_changed(true)
            .logging(true)
            .capabilities();
        assert_eq!(
            capabilities.resources,
            Some(ResourcesCapability {
                subscribe: true,
                list_changed: false,
            })
        );
        assert_eq!(
            capabilities.prompts,
            Some(PromptsCapability { list_changed: true })
        );
        assert!(capabilities.logging.is_some());
        assert!(capabilities.tools.is_none());
    }

    #[tokio::test]
    async fn build_registers_everything() {
        let server = ServerBuilder::new("s", "1")
            .title("Server")
            .instructions("Be nice")
            .tool(Noop {
                definition: ToolDefinition::new("noop"),
            })
            .resource(StaticResource::text("mem://a", "A"))
            .build()
            .await;

        assert_eq!(server.server_info().title.as_deref(), Some("Server"));
        assert_eq!(server.instructions(), Some("Be nice"));
        assert_eq!(server.tools().list().await.len(), 1);
        assert_eq!(server.resources().list().await.len(), 1);
        assert!(server.prompts().list().await.is_empty());
    }

    #[test]
    fn from_config_copies_identity_and_flags() {
        let config: Config = serde_json::from_str(
            r#"{
                "server": { "name": "cfg", "version": "9.9.9", "instructions": "hi" },
                "capabilities": { "tools_list_changed": true }
            }"#,
        )
        .unwrap();
        let builder = ServerBuilder::from_config(&config);
        assert_eq!(builder.name, "cfg");
        assert_eq!(builder.version, "9.9.9");
        assert_eq!(builder.instructions.as_deref(), Some("hi"));
        assert_eq!(
            builder.capabilities().tools,
            Some(ToolsCapability { list_changed: true })
        );
    }
}
