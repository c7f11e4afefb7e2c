//! mcp-engine: a Model Context Protocol server engine
//!
//! This library lets an application expose callable tools, readable and
//! subscribable resources and generatable prompts to an MCP client.
//!
//! # Architecture
//!
//! The engine owns the protocol; the application owns the capabilities:
//!
//! - **Registries**: concurrency-safe maps from name or URI to provider
//! - **Server engine**: lifecycle state machine, handshake, request routing
//! - **Transports**: newline-delimited stdio and an in-memory channel pair
//!
//! The application supplies:
//! - [`ToolExecutor`](mcp::ToolExecutor), [`ResourceProvider`](mcp::ResourceProvider)
//!   and [`PromptProvider`](mcp::PromptProvider) implementations
//! - An optional [`ServerDelegate`](mcp::ServerDelegate) for custom methods
//!   and lifecycle hooks
//!
//! # Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types
//! - [`mcp`]: MCP protocol implementation

pub mod config;
pub mod error;
pub mod mcp;
