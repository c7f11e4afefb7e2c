//! Model Context Protocol (MCP) server engine.
//!
//! Exposes tools, resources and prompts to an MCP client over any
//! [`Transport`]. Messages are JSON-RPC 2.0.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          McpServer                           │
//! │                                                              │
//! │   ┌─────────────┐    ┌──────────────┐    ┌──────────────┐    │
//! │   │  Transport  │───▶│  lifecycle + │───▶│  registries  │    │
//! │   │ (stdio/mem) │◀───│   routing    │    │ tool/res/pmt │    │
//! │   └─────────────┘    └──────────────┘    └──────────────┘    │
//! │                             │                                │
//! │                             ▼                                │
//! │                     ┌──────────────┐                         │
//! │                     │   delegate   │  (unknown methods,      │
//! │                     │   (weak)     │   notifications, hooks) │
//! │                     └──────────────┘                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2025-06-18.

pub mod builder;
pub mod prompt;
pub mod protocol;
pub mod registry;
pub mod resource;
pub mod server;
pub mod tool;
pub mod transport;
pub mod types;

pub use builder::ServerBuilder;
pub use prompt::{PromptProvider, PromptRegistry};
pub use protocol::{
    JsonRpcErrorData, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    MCP_PROTOCOL_VERSION,
};
pub use resource::{
    ObservableResource, ResourceProvider, ResourceRegistry, ResourceUpdateHandler,
    StaticResource, SubscriptionId,
};
pub use server::{McpServer, ServerDelegate, ServerState};
pub use tool::{ToolExecutor, ToolRegistry};
pub use transport::{LineTransport, MemoryClient, MemoryTransport, StdioTransport, Transport};
