//! Error types for mcp-engine.
//!
//! Three families live here:
//!
//! - [`ConfigError`]: loading and validating the configuration file
//! - [`TransportError`]: byte-level transport failures
//! - [`McpError`]: everything raised by registries, providers and the engine
//!
//! [`McpError::to_rpc_error`] is the single place where domain errors are
//! mapped onto JSON-RPC error objects.

use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

use crate::mcp::protocol::{ErrorCode, JsonRpcErrorData};

/// Result type for registry, provider and engine operations.
pub type McpResult<T> = Result<T, McpError>;

/// Errors that can occur during configuration operations.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Configuration file not found.
    #[error("configuration file not found: {path}")]
    NotFound {
        /// Path where the configuration file was expected.
        path: PathBuf,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },
}

/// Errors raised by a [`Transport`](crate::mcp::transport::Transport).
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport could not be started.
    #[error("failed to start transport: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
        /// Underlying I/O error, if any.
        #[source]
        source: Option<std::io::Error>,
    },

    /// A frame could not be written.
    #[error("failed to send message")]
    Send(#[source] std::io::Error),

    /// A frame could not be read.
    #[error("failed to receive message")]
    Receive(#[source] std::io::Error),

    /// The transport has been stopped or its peer went away.
    #[error("transport closed")]
    Closed,

    /// An operation was attempted before `start`.
    #[error("transport not started")]
    NotStarted,
}

/// Errors raised by registries, capability providers and the server engine.
#[derive(Error, Debug)]
pub enum McpError {
    /// No tool, resource, prompt or handler matches the requested key.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Request parameters are missing or malformed.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// A prompt was generated without one of its required arguments.
    #[error("Missing required argument: {0}")]
    MissingRequiredArgument(String),

    /// A request other than `initialize` arrived before the handshake completed.
    #[error("Server not initialized")]
    ServerNotInitialized,

    /// The resource provider does not support subscriptions.
    #[error("Subscriptions not supported for resource: {0}")]
    SubscriptionUnsupported(String),

    /// A tool executor failed.
    #[error("Tool execution failed: {0}")]
    Execution(String),

    /// A resource provider failed to read its content.
    #[error("Resource read failed: {0}")]
    Read(String),

    /// A prompt provider failed to generate messages.
    #[error("Prompt generation failed: {0}")]
    Generation(String),

    /// A lifecycle operation was called in the wrong state.
    #[error("Invalid server state: {0}")]
    InvalidState(String),

    /// A provider error that already carries a JSON-RPC code.
    #[error("{}", .0.message)]
    Rpc(JsonRpcErrorData),

    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// JSON serialisation failure.
    #[error("Serialisation failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected failure, such as a panicking executor.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl McpError {
    /// Creates a method not found error.
    pub fn method_not_found(what: impl Into<String>) -> Self {
        Self::MethodNotFound(what.into())
    }

    /// Creates an invalid params error.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams(message.into())
    }

    /// Creates a tool execution error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution(message.into())
    }

    /// Creates a resource read error.
    pub fn read(message: impl Into<String>) -> Self {
        Self::Read(message.into())
    }

    /// Creates a prompt generation error.
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation(message.into())
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Returns the JSON-RPC code this error maps to.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::MethodNotFound(_) => ErrorCode::MethodNotFound.code(),
            Self::InvalidParams(_) | Self::MissingRequiredArgument(_) => {
                ErrorCode::InvalidParams.code()
            }
            Self::ServerNotInitialized => ErrorCode::ServerNotInitialized.code(),
            Self::Rpc(data) => data.code,
            _ => ErrorCode::InternalError.code(),
        }
    }

    /// Converts this error into a JSON-RPC error object.
    ///
    /// Method-not-found, invalid-params and not-initialized errors keep their
    /// standard codes. Errors already shaped as JSON-RPC pass through
    /// unchanged. Everything else becomes `-32603` with the description
    /// attached as `data`.
    #[must_use]
    pub fn to_rpc_error(&self) -> JsonRpcErrorData {
        match self {
            Self::MethodNotFound(_)
            | Self::InvalidParams(_)
            | Self::MissingRequiredArgument(_)
            | Self::ServerNotInitialized => {
                JsonRpcErrorData::with_message(ErrorCode::ServerError(self.code()), self.to_string())
            }
            Self::Rpc(data) => data.clone(),
            _ => JsonRpcErrorData::from_code(ErrorCode::InternalError)
                .with_data(Value::String(self.to_string())),
        }
    }
}

impl From<JsonRpcErrorData> for McpError {
    fn from(data: JsonRpcErrorData) -> Self {
        Self::Rpc(data)
    }
}
