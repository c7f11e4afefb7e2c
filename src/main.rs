//! mcp-engine: Model Context Protocol server over stdio
//!
//! Serves a built-in `echo` tool and a `server://info` resource. Useful for
//! checking that a client can talk to the engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Map, Value};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mcp_engine::config::{self, Config};
use mcp_engine::error::{McpError, McpResult};
use mcp_engine::mcp::types::{ResourceDefinition, ToolAnnotations, ToolDefinition, ToolResult};
use mcp_engine::mcp::{McpServer, ServerBuilder, StaticResource, StdioTransport, ToolExecutor};

/// Model Context Protocol server engine.
///
/// Speaks newline-delimited JSON-RPC on stdin/stdout. Logs go to stderr.
#[derive(Parser, Debug)]
#[command(name = "mcp-engine")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN, // Default to warn for unknown levels
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Echoes its `message` argument back.
struct EchoTool {
    definition: ToolDefinition,
}

impl EchoTool {
    fn new() -> Self {
        Self {
            definition: ToolDefinition::new("echo")
                .with_title("Echo")
                .with_description("Returns the given message unchanged")
                .with_input_schema(json!({
                    "type": "object",
                    "properties": {
                        "message": { "type": "string", "description": "Text to echo" }
                    },
                    "required": ["message"]
                }))
                .with_annotations(ToolAnnotations {
                    read_only_hint: Some(true),
                    idempotent_hint: Some(true),
                    ..ToolAnnotations::default()
                }),
        }
    }
}

#[async_trait]
impl ToolExecutor for EchoTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn execute(&self, arguments: Map<String, Value>) -> McpResult<ToolResult> {
        let message = arguments
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::invalid_params("'message' must be a string"))?;
        Ok(ToolResult::text(message))
    }
}

/// Describes this server as a JSON resource.
fn info_resource(cfg: &Config) -> StaticResource {
    let info = json!({
        "name": cfg.server.name,
        "version": cfg.server.version,
        "engine": env!("CARGO_PKG_NAME"),
        "engineVersion": env!("CARGO_PKG_VERSION"),
    });
    StaticResource::new(
        ResourceDefinition::new("server://info")
            .with_name("Server information")
            .with_mime_type("application/json")
            .with_text(info.to_string()),
    )
}

/// Resolves when the process is asked to stop.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
    Ok(())
}

/// Resolves when the process is asked to stop.
#[cfg(windows)]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, initiating graceful shutdown");
    Ok(())
}

/// Runs the server until the client hangs up or a signal arrives.
async fn serve(server: McpServer) -> McpResult<()> {
    server.start(StdioTransport::stdio()).await?;
    info!("MCP server ready, waiting for client connection...");

    tokio::select! {
        () = server.closed() => info!("Client disconnected"),
        result = shutdown_signal() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signals");
            }
        }
    }

    match server.shutdown().await {
        Ok(()) => Ok(()),
        // The client left before finishing the handshake.
        Err(McpError::InvalidState(reason)) => {
            info!(reason = %reason, "Exiting without shutdown handshake");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Entry point for the mcp-engine server.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let cfg = match config::load_config_or_default(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nExpected config at: {}", default_path.display());
                    eprintln!("Create one based on config/example-config.json");
                }
            }
            return ExitCode::FAILURE;
        }
    };

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    // Display GPL license notice (required by GPLv3 Section 5d)
    eprintln!(
        "mcp-engine {}  Copyright (C) 2026  The Embedded Society",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("This program comes with ABSOLUTELY NO WARRANTY.");
    eprintln!("This is free software, licensed under GPL-3.0-or-later.");
    eprintln!();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %cfg.server.name,
        "Starting mcp-engine server"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async {
        let server = ServerBuilder::from_config(&cfg)
            .tool(EchoTool::new())
            .resource(info_resource(&cfg))
            .build()
            .await;
        serve(server).await
    });

    // Stdin reads park a blocking thread that never finishes on its own.
    runtime.shutdown_timeout(Duration::from_millis(100));

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
