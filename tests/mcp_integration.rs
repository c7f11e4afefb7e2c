//! Integration tests for MCP protocol handling.
//!
//! These tests verify the MCP server's JSON-RPC 2.0 protocol implementation,
//! including request/response handling, error responses, lifecycle management
//! and resource subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_test::{assert_err, assert_ok};

use mcp_engine::error::{McpError, McpResult};
use mcp_engine::mcp::protocol::{parse_message, DecodeError, IncomingMessage, RequestId};
use mcp_engine::mcp::types::{
    PromptArgument, PromptDefinition, PromptMessage, ResourceDefinition, Role, ToolDefinition,
    ToolResult,
};
use mcp_engine::mcp::{
    JsonRpcErrorData, JsonRpcRequest, LineTransport, McpServer, MemoryClient, MemoryTransport,
    ObservableResource, PromptProvider, ResourceProvider, ResourceUpdateHandler, ServerBuilder,
    ServerDelegate, ServerState, StaticResource, ToolExecutor,
};

// =============================================================================
// Fixtures
// =============================================================================

struct EchoTool {
    definition: ToolDefinition,
}

impl EchoTool {
    fn new() -> Self {
        Self::named("echo")
    }

    fn named(name: &str) -> Self {
        Self {
            definition: ToolDefinition::new(name).with_description("Echo a message"),
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
            .ok_or_else(|| McpError::execution("message is required"))?;
        Ok(ToolResult::text(format!("Echo: {message}")))
    }
}

struct SummarisePrompt {
    definition: PromptDefinition,
}

impl SummarisePrompt {
    fn new() -> Self {
        Self {
            definition: PromptDefinition::new("summarise")
                .with_description("Summarise a document")
                .with_argument(PromptArgument::required("text", "Text to summarise"))
                .with_argument(PromptArgument::optional("style", "Tone of the summary")),
        }
    }
}

#[async_trait]
impl PromptProvider for SummarisePrompt {
    fn definition(&self) -> &PromptDefinition {
        &self.definition
    }

    async fn generate(&self, arguments: HashMap<String, String>) -> McpResult<Vec<PromptMessage>> {
        self.definition.check_arguments(&arguments)?;
        let style = arguments.get("style").map_or("plain", String::as_str);
        let text = arguments.get("text").map_or("", String::as_str);
        Ok(vec![
            PromptMessage::text(Role::System, format!("Write a {style} summary.")),
            PromptMessage::text(Role::User, text),
        ])
    }
}

/// Counts provider-level subscribe and unsubscribe calls.
struct CountingFeed {
    subscribes: AtomicUsize,
    teardowns: AtomicUsize,
}

impl CountingFeed {
    const fn new() -> Self {
        Self {
            subscribes: AtomicUsize::new(0),
            teardowns: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ResourceProvider for CountingFeed {
    async fn definition(&self) -> ResourceDefinition {
        ResourceDefinition::new("feed://ticks").with_mime_type("text/plain")
    }

    async fn read(&self) -> McpResult<ResourceDefinition> {
        Ok(self.definition().await.with_text("0"))
    }

    async fn subscribe(&self, _handler: ResourceUpdateHandler) -> McpResult<()> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self) {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// A resource and prompt whose providers always fail.
struct Broken {
    prompt: PromptDefinition,
}

impl Broken {
    fn new() -> Self {
        Self {
            prompt: PromptDefinition::new("broken"),
        }
    }
}

#[async_trait]
impl ResourceProvider for Broken {
    async fn definition(&self) -> ResourceDefinition {
        ResourceDefinition::new("disk://offline")
    }

    async fn read(&self) -> McpResult<ResourceDefinition> {
        Err(McpError::read("disk unavailable"))
    }
}

#[async_trait]
impl PromptProvider for Broken {
    fn definition(&self) -> &PromptDefinition {
        &self.prompt
    }

    async fn generate(&self, _arguments: HashMap<String, String>) -> McpResult<Vec<PromptMessage>> {
        Err(McpError::generation("template missing"))
    }
}

#[derive(Default)]
struct RecordingDelegate {
    initialized: AtomicUsize,
    notifications: AtomicUsize,
    will_shutdown: AtomicUsize,
}

#[async_trait]
impl ServerDelegate for RecordingDelegate {
    async fn on_request(&self, request: &JsonRpcRequest) -> Result<Value, JsonRpcErrorData> {
        match request.method.as_str() {
            "custom/time" => Ok(json!({"now": "noon"})),
            "custom/quota" => Err(JsonRpcErrorData {
                code: -32042,
                message: "quota exceeded".to_string(),
                data: None,
            }),
            other => Err(JsonRpcErrorData::method_not_found(other)),
        }
    }

    async fn on_notification(&self, _notification: &mcp_engine::mcp::JsonRpcNotification) {
        self.notifications.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_initialized(&self) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_will_shutdown(&self) {
        self.will_shutdown.fetch_add(1, Ordering::SeqCst);
    }
}

fn initialize_request(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "1.0.0"}
        }
    })
}

fn initialized_notification() -> Value {
    json!({"jsonrpc": "2.0", "method": "notifications/initialized"})
}

fn request(id: i64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

async fn send(server: &McpServer, message: &Value) -> Option<Value> {
    let bytes = server.handle_message(message.to_string().as_bytes()).await?;
    Some(serde_json::from_slice(&bytes).expect("response is JSON"))
}

async fn send_request(server: &McpServer, message: &Value) -> Value {
    send(server, message).await.expect("request gets a response")
}

async fn ready(server: &McpServer) {
    send_request(server, &initialize_request(0)).await;
    assert!(send(server, &initialized_notification()).await.is_none());
    assert_eq!(server.state(), ServerState::Ready);
}

async fn recv(client: &mut MemoryClient) -> Value {
    tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("server hung up")
}

fn assert_result_xor_error(response: &Value) {
    let has_result = response.get("result").is_some();
    let has_error = response.get("error").is_some();
    assert!(has_result ^ has_error, "bad response shape: {response}");
}

// =============================================================================
// Protocol Parsing Tests
// =============================================================================

#[test]
fn test_parse_initialize_request() {
    let json = r#"{
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {
                "name": "test-client",
                "version": "1.0.0"
            }
        }
    }"#;

    let result = parse_message(json);
    assert!(result.is_ok());

    if let IncomingMessage::Request(req) = result.unwrap() {
        assert_eq!(req.method, "initialize");
        assert_eq!(req.id, RequestId::Number(1));
    } else {
        panic!("Expected Request");
    }
}

#[test]
fn test_parse_notification() {
    let json = r#"{
        "jsonrpc": "2.0",
        "method": "notifications/initialized"
    }"#;

    let result = parse_message(json);
    assert!(result.is_ok());

    if let IncomingMessage::Notification(notif) = result.unwrap() {
        assert_eq!(notif.method, "notifications/initialized");
    } else {
        panic!("Expected Notification");
    }
}

#[test]
fn test_parse_invalid_json() {
    let result = parse_message("not valid json");
    assert!(matches!(result, Err(DecodeError::Unrecognized(_))));
}

#[test]
fn test_parse_empty_method_keeps_id() {
    let json = r#"{"jsonrpc": "2.0", "id": "x", "method": ""}"#;
    assert!(matches!(
        parse_message(json),
        Err(DecodeError::InvalidRequest { id: RequestId::String(ref s), .. }) if s == "x"
    ));
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_echo_tool_call() {
    let server = ServerBuilder::new("scenario", "1.0.0")
        .tool(EchoTool::new())
        .build()
        .await;
    ready(&server).await;

    let response = send_request(
        &server,
        &request(
            1,
            "tools/call",
            json!({"name": "echo", "arguments": {"message": "hi"}}),
        ),
    )
    .await;

    assert_eq!(response["id"], 1);
    assert_eq!(
        response["result"],
        json!({"content": [{"type": "text", "text": "Echo: hi"}]})
    );
}

#[tokio::test]
async fn test_call_before_initialize_is_rejected() {
    let server = ServerBuilder::new("scenario", "1.0.0")
        .tool(EchoTool::new())
        .build()
        .await;

    let response = send_request(
        &server,
        &request(
            7,
            "tools/call",
            json!({"name": "echo", "arguments": {"message": "hello"}}),
        ),
    )
    .await;

    assert_eq!(response["id"], 7);
    assert_eq!(response["error"]["code"], -32002);
    assert_eq!(response["error"]["message"], "Server not initialized");
    assert_eq!(server.state(), ServerState::Uninitialized);
}

#[tokio::test]
async fn test_static_resource_read() {
    let server = ServerBuilder::new("scenario", "1.0.0")
        .resource(StaticResource::text("config://app", "debug=true"))
        .build()
        .await;
    ready(&server).await;

    let response = send_request(
        &server,
        &request(2, "resources/read", json!({"uri": "config://app"})),
    )
    .await;
    assert_eq!(
        response["result"]["contents"],
        json!([{"uri": "config://app", "mimeType": "text/plain", "text": "debug=true"}])
    );

    let missing = send_request(
        &server,
        &request(3, "resources/read", json!({"uri": "config://missing"})),
    )
    .await;
    assert_eq!(missing["error"]["code"], -32601);
}

#[tokio::test]
async fn test_prompt_missing_argument() {
    let server = ServerBuilder::new("scenario", "1.0.0")
        .prompt(SummarisePrompt::new())
        .build()
        .await;
    ready(&server).await;

    let response = send_request(
        &server,
        &request(4, "prompts/get", json!({"name": "summarise", "arguments": {}})),
    )
    .await;
    assert_eq!(response["error"]["code"], -32602);
    assert!(response["error"]["message"]
        .as_str()
        .unwrap()
        .contains("text"));
    assert_eq!(server.state(), ServerState::Ready);

    let response = send_request(
        &server,
        &request(
            5,
            "prompts/get",
            json!({"name": "summarise", "arguments": {"text": "A long story", "style": "terse"}}),
        ),
    )
    .await;
    let result = &response["result"];
    assert_eq!(result["description"], "Summarise a document");
    assert_eq!(result["messages"][0]["role"], "system");
    assert_eq!(result["messages"][1]["content"]["text"], "A long story");
}

#[tokio::test]
async fn test_subscription_reference_counting() {
    let server = ServerBuilder::new("scenario", "1.0.0").build().await;
    let feed = Arc::new(CountingFeed::new());
    server.register_resource_shared(feed.clone()).await;

    let handler: ResourceUpdateHandler = Arc::new(|_resource: &ResourceDefinition| {});
    let first = assert_ok!(server.resources().subscribe("feed://ticks", handler.clone()).await);
    let second = assert_ok!(server.resources().subscribe("feed://ticks", handler).await);
    assert_ne!(first, second);
    assert_eq!(feed.subscribes.load(Ordering::SeqCst), 2);

    server.resources().unsubscribe("feed://ticks", first).await;
    assert_eq!(feed.teardowns.load(Ordering::SeqCst), 0);
    assert_eq!(server.resources().subscriber_count("feed://ticks").await, 1);

    // Releasing the same id twice changes nothing.
    server.resources().unsubscribe("feed://ticks", first).await;
    assert_eq!(feed.teardowns.load(Ordering::SeqCst), 0);

    server.resources().unsubscribe("feed://ticks", second).await;
    assert_eq!(feed.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(server.resources().subscriber_count("feed://ticks").await, 0);
}

#[tokio::test]
async fn test_subscribe_unsupported_leaves_no_entry() {
    let server = ServerBuilder::new("scenario", "1.0.0")
        .resource(StaticResource::text("config://app", "x"))
        .build()
        .await;

    let handler: ResourceUpdateHandler = Arc::new(|_resource: &ResourceDefinition| {});
    let err = assert_err!(server.resources().subscribe("config://app", handler).await);
    assert!(matches!(err, McpError::SubscriptionUnsupported(_)));
    assert_eq!(server.resources().subscriber_count("config://app").await, 0);
}

// =============================================================================
// Registry and Routing Properties
// =============================================================================

#[tokio::test]
async fn test_registration_replaces_by_key() {
    let server = ServerBuilder::new("props", "1.0.0").build().await;
    server.register_tool(EchoTool::new()).await;
    server
        .register_tool(EchoTool {
            definition: ToolDefinition::new("echo").with_description("second"),
        })
        .await;
    ready(&server).await;

    let response = send_request(&server, &request(1, "tools/list", json!({}))).await;
    let tools = response["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["description"], "second");
}

#[tokio::test]
async fn test_unknown_names_do_not_change_state() {
    let server = ServerBuilder::new("props", "1.0.0")
        .tool(EchoTool::new())
        .build()
        .await;
    ready(&server).await;

    for (id, message) in [
        (1, request(1, "tools/call", json!({"name": "nope"}))),
        (2, request(2, "prompts/get", json!({"name": "nope"}))),
        (3, request(3, "resources/read", json!({"uri": "nope://x"}))),
        (4, request(4, "no/such/method", json!({}))),
    ] {
        let response = send_request(&server, &message).await;
        assert_eq!(response["id"], id);
        assert_eq!(response["error"]["code"], -32601);
    }

    assert_eq!(server.tools().list().await.len(), 1);
    assert_eq!(server.state(), ServerState::Ready);
}

#[tokio::test]
async fn test_every_gated_method_is_rejected_before_ready() {
    let server = ServerBuilder::new("props", "1.0.0").build().await;
    send_request(&server, &initialize_request(1)).await;
    assert_eq!(server.state(), ServerState::Initializing);

    for method in [
        "ping",
        "tools/list",
        "tools/call",
        "resources/list",
        "resources/read",
        "resources/subscribe",
        "prompts/list",
        "prompts/get",
        "custom/anything",
    ] {
        let response = send_request(&server, &request(2, method, json!({}))).await;
        assert_eq!(response["error"]["code"], -32002, "method {method}");
    }
}

#[tokio::test]
async fn test_requests_after_shutdown_are_rejected() {
    let server = ServerBuilder::new("props", "1.0.0")
        .tool(EchoTool::new())
        .build()
        .await;
    ready(&server).await;
    assert_ok!(server.shutdown().await);
    assert_eq!(server.state(), ServerState::Terminated);

    for (id, method) in [(9, "tools/list"), (10, "ping"), (11, "custom/anything")] {
        let response = send_request(&server, &request(id, method, json!({}))).await;
        assert_eq!(response["id"], id);
        assert_eq!(response["error"]["code"], -32002, "method {method}");
    }
    assert_eq!(server.state(), ServerState::Terminated);
}

#[tokio::test]
async fn test_response_ids_and_shapes() {
    let server = ServerBuilder::new("props", "1.0.0")
        .tool(EchoTool::new())
        .build()
        .await;
    ready(&server).await;

    let messages = [
        json!({"jsonrpc": "2.0", "id": "str-id", "method": "ping"}),
        json!({"jsonrpc": "2.0", "id": 42, "method": "tools/list"}),
        json!({"jsonrpc": "2.0", "id": 43, "method": "tools/call", "params": {"name": "echo"}}),
        json!({"jsonrpc": "2.0", "id": 44, "method": "tools/call"}),
    ];
    for message in &messages {
        let response = send_request(&server, message).await;
        assert_eq!(response["id"], message["id"]);
        assert_eq!(response["jsonrpc"], "2.0");
        assert_result_xor_error(&response);
    }

    // Executor failure: internal error with the description as data.
    let response = send_request(&server, &messages[2]).await;
    assert_eq!(response["error"]["code"], -32603);
    assert_eq!(
        response["error"]["data"],
        "Tool execution failed: message is required"
    );

    // Missing params: invalid params.
    let response = send_request(&server, &messages[3]).await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn test_provider_failures_are_internal_errors() {
    let server = ServerBuilder::new("props", "1.0.0")
        .resource(Broken::new())
        .prompt(Broken::new())
        .build()
        .await;
    ready(&server).await;

    let response = send_request(
        &server,
        &request(1, "resources/read", json!({"uri": "disk://offline"})),
    )
    .await;
    assert_eq!(response["error"]["code"], -32603);
    assert_eq!(response["error"]["data"], "Resource read failed: disk unavailable");

    let response = send_request(
        &server,
        &request(2, "prompts/get", json!({"name": "broken"})),
    )
    .await;
    assert_eq!(response["error"]["code"], -32603);
    assert_eq!(response["error"]["data"], "Prompt generation failed: template missing");
    assert_eq!(server.state(), ServerState::Ready);
}

#[tokio::test]
async fn test_delegate_routing_and_hooks() {
    let delegate = Arc::new(RecordingDelegate::default());
    let server = ServerBuilder::new("props", "1.0.0")
        .delegate(&delegate)
        .build()
        .await;

    ready(&server).await;
    send(&server, &initialized_notification()).await;
    assert_eq!(delegate.initialized.load(Ordering::SeqCst), 1);

    let response = send_request(&server, &request(1, "custom/time", json!({}))).await;
    assert_eq!(response["result"]["now"], "noon");

    let response = send_request(&server, &request(2, "custom/quota", json!({}))).await;
    assert_eq!(response["error"]["code"], -32042);
    assert_eq!(response["error"]["message"], "quota exceeded");

    send(
        &server,
        &json!({"jsonrpc": "2.0", "method": "notifications/roots/list_changed"}),
    )
    .await;
    assert_eq!(delegate.notifications.load(Ordering::SeqCst), 1);

    assert_ok!(server.shutdown().await);
    assert_eq!(delegate.will_shutdown.load(Ordering::SeqCst), 1);
    assert_eq!(server.state(), ServerState::Terminated);
}

#[tokio::test]
async fn test_initialize_result_shape() {
    let server = ServerBuilder::new("shape", "3.2.1")
        .title("Shape Server")
        .tool(EchoTool::new())
        .resources_subscribe(true)
        .build()
        .await;

    let response = send_request(&server, &initialize_request(1)).await;
    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2025-06-18");
    assert_eq!(result["serverInfo"]["name"], "shape");
    assert_eq!(result["serverInfo"]["title"], "Shape Server");
    assert_eq!(result["serverInfo"]["version"], "3.2.1");
    assert_eq!(result["capabilities"]["tools"], json!({}));
    assert_eq!(result["capabilities"]["resources"], json!({"subscribe": true}));
    assert!(result["capabilities"].get("prompts").is_none());
    assert!(result["capabilities"].get("logging").is_none());
    assert!(result["instructions"].is_null());

    // A second initialize answers again without moving the state.
    send(&server, &initialized_notification()).await;
    let again = send_request(&server, &initialize_request(2)).await;
    assert_eq!(again["result"]["protocolVersion"], "2025-06-18");
    assert_eq!(server.state(), ServerState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registry_access() {
    let server = ServerBuilder::new("concurrent", "1.0.0").build().await;
    ready(&server).await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let server = server.clone();
        handles.push(tokio::spawn(async move {
            let name = format!("tool-{i}");
            server.register_tool(EchoTool::named(&name)).await;
            let response = send_request(
                &server,
                &request(
                    i,
                    "tools/call",
                    json!({"name": name, "arguments": {"message": name}}),
                ),
            )
            .await;
            assert_eq!(response["result"]["content"][0]["text"], format!("Echo: {name}"));
            if i % 2 == 0 {
                server.unregister_tool(&name).await;
            }
            let listed = server.tools().list().await;
            assert!(listed.len() <= 32);
        }));
    }
    for handle in handles {
        assert_ok!(handle.await);
    }

    let remaining = server.tools().list().await;
    assert_eq!(remaining.len(), 16);
    let mut names: Vec<_> = remaining.iter().map(|tool| tool.name.clone()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 16);
}

// =============================================================================
// Transport Loop
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loop_handshake_call_and_shutdown() {
    let delegate = Arc::new(RecordingDelegate::default());
    let server = ServerBuilder::new("loop", "1.0.0")
        .delegate(&delegate)
        .tool(EchoTool::new())
        .build()
        .await;
    let (transport, mut client) = MemoryTransport::pair();
    assert_ok!(server.start(transport).await);
    assert_eq!(server.state(), ServerState::Initializing);

    client.send(&initialize_request(1)).unwrap();
    let response = recv(&mut client).await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["serverInfo"]["name"], "loop");

    // Sent back to back: the call must observe the completed handshake.
    client.send(&initialized_notification()).unwrap();
    client
        .send(&request(
            2,
            "tools/call",
            json!({"name": "echo", "arguments": {"message": "over the wire"}}),
        ))
        .unwrap();
    let response = recv(&mut client).await;
    assert_eq!(response["id"], 2);
    assert_eq!(response["result"]["content"][0]["text"], "Echo: over the wire");
    assert_eq!(server.state(), ServerState::Ready);
    assert_eq!(delegate.initialized.load(Ordering::SeqCst), 1);
    assert_eq!(
        server.client_info().await.map(|info| info.name),
        Some("test-client".to_string())
    );

    // Garbage is dropped without a reply; the next request still works.
    client.send_raw("{{{ not json").unwrap();
    client.send(&request(3, "ping", json!({}))).unwrap();
    let response = recv(&mut client).await;
    assert_eq!(response["id"], 3);
    assert_eq!(response["result"], json!({}));

    assert_ok!(server.shutdown().await);
    assert_eq!(server.state(), ServerState::Terminated);
    assert_eq!(delegate.will_shutdown.load(Ordering::SeqCst), 1);
    tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .expect("receive loop exits after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_loop_concurrent_requests_correlate_by_id() {
    let server = ServerBuilder::new("loop", "1.0.0")
        .tool(EchoTool::new())
        .build()
        .await;
    let (transport, mut client) = MemoryTransport::pair();
    assert_ok!(server.start(transport).await);

    client.send(&initialize_request(0)).unwrap();
    recv(&mut client).await;
    client.send(&initialized_notification()).unwrap();

    for id in 1..=20 {
        client
            .send(&request(
                id,
                "tools/call",
                json!({"name": "echo", "arguments": {"message": format!("m{id}")}}),
            ))
            .unwrap();
    }

    let mut seen = HashMap::new();
    for _ in 1..=20 {
        let response = recv(&mut client).await;
        assert_result_xor_error(&response);
        let id = response["id"].as_i64().unwrap();
        seen.insert(id, response["result"]["content"][0]["text"].clone());
    }
    for id in 1..=20 {
        assert_eq!(seen[&id], format!("Echo: m{id}"));
    }
}

#[tokio::test]
async fn test_loop_ends_when_client_hangs_up() {
    let server = ServerBuilder::new("loop", "1.0.0").build().await;
    let (transport, client) = MemoryTransport::pair();
    assert_ok!(server.start(transport).await);

    client.close();
    tokio::time::timeout(Duration::from_secs(5), server.closed())
        .await
        .expect("receive loop exits on end of input");
    // Hang-up alone does not move the lifecycle.
    assert_eq!(server.state(), ServerState::Initializing);
    assert!(matches!(
        server.shutdown().await,
        Err(McpError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_start_twice_is_invalid_state() {
    let server = ServerBuilder::new("loop", "1.0.0").build().await;
    let (first, _first_client) = MemoryTransport::pair();
    let (second, _second_client) = MemoryTransport::pair();
    assert_ok!(server.start(first).await);
    let err = assert_err!(server.start(second).await);
    assert!(matches!(err, McpError::InvalidState(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wire_subscription_delivers_updates() {
    let live = ObservableResource::new(
        ResourceDefinition::new("status://build")
            .with_mime_type("text/plain")
            .with_text("pending"),
    );
    let server = ServerBuilder::new("subs", "1.0.0")
        .resource(live.clone())
        .resources_subscribe(true)
        .build()
        .await;
    let (transport, mut client) = MemoryTransport::pair();
    assert_ok!(server.start(transport).await);

    client.send(&initialize_request(0)).unwrap();
    recv(&mut client).await;
    client.send(&initialized_notification()).unwrap();

    client
        .send(&request(1, "resources/subscribe", json!({"uri": "status://build"})))
        .unwrap();
    assert_eq!(recv(&mut client).await["result"], json!({}));

    // Repeating the subscribe is harmless.
    client
        .send(&request(2, "resources/subscribe", json!({"uri": "status://build"})))
        .unwrap();
    assert_eq!(recv(&mut client).await["id"], 2);
    assert_eq!(server.resources().subscriber_count("status://build").await, 1);

    live.update(ResourceDefinition::new("status://build").with_text("passed"))
        .await;
    let notification = recv(&mut client).await;
    assert_eq!(notification["method"], "notifications/resources/updated");
    assert_eq!(notification["params"]["uri"], "status://build");
    assert!(notification.get("id").is_none());

    client
        .send(&request(3, "resources/read", json!({"uri": "status://build"})))
        .unwrap();
    let response = recv(&mut client).await;
    assert_eq!(response["result"]["contents"][0]["text"], "passed");

    client
        .send(&request(4, "resources/unsubscribe", json!({"uri": "status://build"})))
        .unwrap();
    assert_eq!(recv(&mut client).await["id"], 4);
    assert_eq!(server.resources().subscriber_count("status://build").await, 0);
    assert_eq!(live.handler_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_releases_client_subscriptions() {
    let feed = Arc::new(CountingFeed::new());
    let server = ServerBuilder::new("subs", "1.0.0")
        .resource_shared(feed.clone())
        .resources_subscribe(true)
        .build()
        .await;
    ready(&server).await;

    let response = send_request(
        &server,
        &request(1, "resources/subscribe", json!({"uri": "feed://ticks"})),
    )
    .await;
    assert_eq!(response["result"], json!({}));
    assert_eq!(feed.subscribes.load(Ordering::SeqCst), 1);

    assert_ok!(server.shutdown().await);
    assert_eq!(feed.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resubscribe_reaches_replacement_provider() {
    let first = Arc::new(CountingFeed::new());
    let server = ServerBuilder::new("subs", "1.0.0")
        .resource_shared(first.clone())
        .resources_subscribe(true)
        .build()
        .await;
    ready(&server).await;

    let subscribe = request(1, "resources/subscribe", json!({"uri": "feed://ticks"}));
    assert_eq!(send_request(&server, &subscribe).await["result"], json!({}));
    assert_eq!(first.subscribes.load(Ordering::SeqCst), 1);

    let second = Arc::new(CountingFeed::new());
    server.register_resource_shared(second.clone()).await;
    assert_eq!(first.teardowns.load(Ordering::SeqCst), 1);
    assert_eq!(server.resources().subscriber_count("feed://ticks").await, 0);

    assert_eq!(send_request(&server, &subscribe).await["result"], json!({}));
    assert_eq!(second.subscribes.load(Ordering::SeqCst), 1);
    assert_eq!(server.resources().subscriber_count("feed://ticks").await, 1);

    // Still live: a repeat does not subscribe again.
    assert_eq!(send_request(&server, &subscribe).await["result"], json!({}));
    assert_eq!(second.subscribes.load(Ordering::SeqCst), 1);

    let unsubscribe = request(2, "resources/unsubscribe", json!({"uri": "feed://ticks"}));
    assert_eq!(send_request(&server, &unsubscribe).await["result"], json!({}));
    assert_eq!(second.teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_subscribe_requires_advertised_capability() {
    let feed = Arc::new(CountingFeed::new());
    let server = ServerBuilder::new("subs", "1.0.0")
        .resource_shared(feed.clone())
        .build()
        .await;
    ready(&server).await;

    for (id, method) in [(1, "resources/subscribe"), (2, "resources/unsubscribe")] {
        let response =
            send_request(&server, &request(id, method, json!({"uri": "feed://ticks"}))).await;
        assert_eq!(response["id"], id);
        assert_eq!(response["error"]["code"], -32601, "method {method}");
    }
    assert_eq!(feed.subscribes.load(Ordering::SeqCst), 0);
    assert_eq!(server.resources().subscriber_count("feed://ticks").await, 0);

    // Reads are unaffected.
    let response = send_request(
        &server,
        &request(3, "resources/read", json!({"uri": "feed://ticks"})),
    )
    .await;
    assert_eq!(response["result"]["contents"][0]["text"], "0");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_line_loop_survives_invalid_utf8() {
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    let server = ServerBuilder::new("lines", "1.0.0").build().await;
    let (mut client_in, server_in) = duplex(4096);
    let (server_out, client_out) = duplex(4096);
    assert_ok!(server.start(LineTransport::new(server_in, server_out)).await);

    client_in.write_all(b"\xff\xfe\xfd\n").await.unwrap();
    let mut frame = initialize_request(1).to_string().into_bytes();
    frame.push(b'\n');
    client_in.write_all(&frame).await.unwrap();

    let mut lines = BufReader::new(client_out).lines();
    let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
        .expect("server hung up");
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"]["serverInfo"]["name"], "lines");
    assert_eq!(server.state(), ServerState::Initializing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_list_changed_notifications_follow_capabilities() {
    let server = ServerBuilder::new("notify", "1.0.0")
        .tools_list_changed(true)
        .build()
        .await;
    let (transport, mut client) = MemoryTransport::pair();
    assert_ok!(server.start(transport).await);

    // Not advertised: nothing is sent.
    assert_ok!(server.notify_prompts_list_changed());
    assert_ok!(server.notify_tools_list_changed());

    let notification = recv(&mut client).await;
    assert_eq!(notification["method"], "notifications/tools/list_changed");
    assert!(notification.get("params").is_none());
}
