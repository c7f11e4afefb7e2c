//! MCP server engine.
//!
//! This module implements the MCP server lifecycle:
//!
//! 1. **Initialisation**: `initialize` request, then `notifications/initialized`
//! 2. **Operation**: routing requests to the tool, resource and prompt
//!    registries, or to the [`ServerDelegate`] for anything else
//! 3. **Shutdown**: delegate hook, transport stop, terminal state
//!
//! ```text
//! uninitialized --start(transport)-----------> initializing
//! initializing  --notifications/initialized--> ready
//! ready         --shutdown()-----------------> shuttingDown --> terminated
//! ```
//!
//! A request other than `initialize` that arrives before the server is ready
//! is answered with `-32002` and never reaches a registry.
//!
//! # Ordering
//!
//! The receive loop decodes frames one at a time. Notifications, `initialize`
//! and the readiness check run inline, in arrival order. The registry work
//! behind each admitted request runs as its own task, so responses to
//! concurrent requests may be sent out of order; clients correlate them by id.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};

use crate::error::{McpError, McpResult, TransportError};
use crate::mcp::prompt::{PromptProvider, PromptRegistry};
use crate::mcp::protocol::{
    decode_message, DecodeError, ErrorCode, IncomingMessage, JsonRpcErrorData, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, OutgoingNotification, MCP_PROTOCOL_VERSION,
};
use crate::mcp::resource::{
    ResourceProvider, ResourceRegistry, ResourceUpdateHandler, SubscriptionId,
};
use crate::mcp::tool::{ToolExecutor, ToolRegistry};
use crate::mcp::transport::Transport;
use crate::mcp::types::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult, ResourceDefinition,
    ServerCapabilities,
};

/// Server state in the MCP lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Constructed; waiting for `start` or `initialize`.
    Uninitialized,
    /// Handshake in progress; waiting for `notifications/initialized`.
    Initializing,
    /// Ready for normal operation.
    Ready,
    /// Shutdown in progress.
    ShuttingDown,
    /// Shut down; the receive loop has been told to exit.
    Terminated,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::ShuttingDown => "shuttingDown",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Application hooks the engine calls out to.
///
/// The engine holds its delegate weakly: it never keeps the delegate alive,
/// so the application must hold the `Arc` for as long as the hooks should
/// fire. Once the delegate is dropped the engine behaves as if none was set.
#[async_trait]
pub trait ServerDelegate: Send + Sync {
    /// Handles a request whose method the engine does not route itself.
    ///
    /// # Errors
    ///
    /// The default implementation answers "method not found".
    async fn on_request(&self, request: &JsonRpcRequest) -> Result<Value, JsonRpcErrorData> {
        Err(JsonRpcErrorData::method_not_found(&request.method))
    }

    /// Receives any notification other than `notifications/initialized`.
    async fn on_notification(&self, notification: &JsonRpcNotification) {
        let _ = notification;
    }

    /// Called once, when the handshake completes.
    async fn on_initialized(&self) {}

    /// Called once, at the start of [`McpServer::shutdown`].
    async fn on_will_shutdown(&self) {}
}

/// What the client told us during `initialize`.
#[derive(Debug, Clone)]
struct ClientSession {
    info: Implementation,
    capabilities: ClientCapabilities,
    protocol_version: String,
}

/// Outcome of the inline part of message processing.
enum Processed {
    /// Answer ready to send.
    Reply(JsonRpcResponse),
    /// Admitted request whose registry work is still to run.
    Deferred(JsonRpcRequest),
    /// Nothing to send.
    Silent,
}

/// Parameters for `tools/call`.
#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

/// Parameters for `resources/read`, `resources/subscribe` and `resources/unsubscribe`.
#[derive(Debug, Deserialize)]
struct ResourceUriParams {
    uri: String,
}

/// Parameters for `prompts/get`.
#[derive(Debug, Deserialize)]
struct PromptGetParams {
    name: String,
    #[serde(default)]
    arguments: Option<HashMap<String, String>>,
}

struct ServerInner {
    info: Implementation,
    instructions: Option<String>,
    capabilities: ServerCapabilities,
    state: watch::Sender<ServerState>,
    tools: ToolRegistry,
    resources: ResourceRegistry,
    prompts: PromptRegistry,
    delegate: RwLock<Option<Weak<dyn ServerDelegate>>>,
    session: RwLock<Option<ClientSession>>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    connected: AtomicBool,
    outbox: mpsc::UnboundedSender<OutgoingNotification>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<OutgoingNotification>>>,
    receive_loop: Mutex<Option<JoinHandle<()>>>,
    // Client-held subscriptions made through `resources/subscribe`.
    client_subscriptions: Mutex<HashMap<String, SubscriptionId>>,
}

/// The MCP server engine.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct McpServer {
    inner: Arc<ServerInner>,
}

impl McpServer {
    /// Creates a server with empty registries.
    #[must_use]
    pub fn new(
        info: Implementation,
        capabilities: ServerCapabilities,
        instructions: Option<String>,
    ) -> Self {
        let (state, _) = watch::channel(ServerState::Uninitialized);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ServerInner {
                info,
                instructions,
                capabilities,
                state,
                tools: ToolRegistry::new(),
                resources: ResourceRegistry::new(),
                prompts: PromptRegistry::new(),
                delegate: RwLock::new(None),
                session: RwLock::new(None),
                transport: RwLock::new(None),
                connected: AtomicBool::new(false),
                outbox,
                outbox_rx: Mutex::new(Some(outbox_rx)),
                receive_loop: Mutex::new(None),
                client_subscriptions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the current server state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        self.inner.state()
    }

    /// Returns a receiver that observes every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ServerState> {
        self.inner.state.subscribe()
    }

    /// Returns the advertised capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.inner.capabilities
    }

    /// Returns the server's identity.
    #[must_use]
    pub fn server_info(&self) -> &Implementation {
        &self.inner.info
    }

    /// Returns the instructions sent to clients.
    #[must_use]
    pub fn instructions(&self) -> Option<&str> {
        self.inner.instructions.as_deref()
    }

    /// Returns the client's identity, once `initialize` has been received.
    pub async fn client_info(&self) -> Option<Implementation> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.info.clone())
    }

    /// Returns the client's declared capabilities, once known.
    pub async fn client_capabilities(&self) -> Option<ClientCapabilities> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.capabilities.clone())
    }

    /// Returns the protocol version the client asked for, once known.
    pub async fn client_protocol_version(&self) -> Option<String> {
        self.inner
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.protocol_version.clone())
    }

    /// The tool registry.
    #[must_use]
    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    /// The resource registry.
    #[must_use]
    pub fn resources(&self) -> &ResourceRegistry {
        &self.inner.resources
    }

    /// The prompt registry.
    #[must_use]
    pub fn prompts(&self) -> &PromptRegistry {
        &self.inner.prompts
    }

    /// Sets the delegate. The server keeps only a weak reference.
    pub async fn set_delegate<D: ServerDelegate + 'static>(&self, delegate: &Arc<D>) {
        let weak = Arc::downgrade(delegate);
        let weak: Weak<dyn ServerDelegate> = weak;
        self.set_delegate_weak(weak).await;
    }

    /// Sets the delegate from an existing weak reference.
    pub async fn set_delegate_weak(&self, delegate: Weak<dyn ServerDelegate>) {
        *self.inner.delegate.write().await = Some(delegate);
    }

    /// Removes the delegate.
    pub async fn clear_delegate(&self) {
        *self.inner.delegate.write().await = None;
    }

    /// Registers a tool. Valid in any state.
    pub async fn register_tool(&self, executor: impl ToolExecutor + 'static) {
        self.inner.tools.register(executor).await;
    }

    /// Registers a shared tool. Valid in any state.
    pub async fn register_tool_shared(&self, executor: Arc<dyn ToolExecutor>) {
        self.inner.tools.register_shared(executor).await;
    }

    /// Removes a tool.
    pub async fn unregister_tool(&self, name: &str) {
        self.inner.tools.unregister(name).await;
    }

    /// Registers a resource. Valid in any state.
    pub async fn register_resource(&self, provider: impl ResourceProvider + 'static) {
        self.inner.resources.register(provider).await;
    }

    /// Registers a shared resource. Valid in any state.
    pub async fn register_resource_shared(&self, provider: Arc<dyn ResourceProvider>) {
        self.inner.resources.register_shared(provider).await;
    }

    /// Removes a resource.
    pub async fn unregister_resource(&self, uri: &str) {
        self.inner.resources.unregister(uri).await;
    }

    /// Registers a prompt. Valid in any state.
    pub async fn register_prompt(&self, provider: impl PromptProvider + 'static) {
        self.inner.prompts.register(provider).await;
    }

    /// Registers a shared prompt. Valid in any state.
    pub async fn register_prompt_shared(&self, provider: Arc<dyn PromptProvider>) {
        self.inner.prompts.register_shared(provider).await;
    }

    /// Removes a prompt.
    pub async fn unregister_prompt(&self, name: &str) {
        self.inner.prompts.unregister(name).await;
    }

    /// Starts the transport and spawns the receive loop.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidState`] unless the server is
    /// uninitialized, or the transport's start error.
    pub async fn start(&self, transport: impl Transport + 'static) -> McpResult<()> {
        self.start_shared(Arc::new(transport)).await
    }

    /// Starts a shared transport and spawns the receive loop.
    ///
    /// # Errors
    ///
    /// See [`McpServer::start`].
    pub async fn start_shared(&self, transport: Arc<dyn Transport>) -> McpResult<()> {
        let inner = &self.inner;
        let mut receive_loop = inner.receive_loop.lock().await;

        let state = inner.state();
        if state != ServerState::Uninitialized {
            return Err(McpError::invalid_state(format!(
                "cannot start a server that is {state}"
            )));
        }

        transport.start().await?;
        *inner.transport.write().await = Some(Arc::clone(&transport));
        inner.transition(ServerState::Uninitialized, ServerState::Initializing);
        inner.connected.store(true, Ordering::SeqCst);
        tracing::info!(server = %inner.info.name, "Transport started, awaiting initialize");

        if let Some(outbox_rx) = inner.outbox_rx.lock().await.take() {
            tokio::spawn(forward_notifications(
                Arc::clone(&transport),
                outbox_rx,
                inner.state.subscribe(),
            ));
        }

        *receive_loop = Some(tokio::spawn(receive_loop_task(
            Arc::clone(inner),
            transport,
        )));
        Ok(())
    }

    /// Waits for the receive loop to finish.
    ///
    /// Returns immediately if the server was never started or another caller
    /// is already waiting.
    pub async fn closed(&self) {
        let handle = self.inner.receive_loop.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Receive loop ended abnormally");
            }
        }
    }

    /// Shuts the server down.
    ///
    /// Runs the delegate's pre-shutdown hook, releases subscriptions held by
    /// the client, stops the transport and moves to
    /// [`ServerState::Terminated`]. Requests already being handled are not
    /// cancelled; their responses are dropped once the transport is stopped.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::InvalidState`] unless the server is ready.
    pub async fn shutdown(&self) -> McpResult<()> {
        let inner = &self.inner;
        if !inner.transition(ServerState::Ready, ServerState::ShuttingDown) {
            return Err(McpError::invalid_state(format!(
                "cannot shut down a server that is {}",
                inner.state()
            )));
        }
        tracing::info!(server = %inner.info.name, "Shutting down");

        if let Some(delegate) = inner.delegate().await {
            delegate.on_will_shutdown().await;
        }

        inner.release_client_subscriptions().await;

        inner.connected.store(false, Ordering::SeqCst);
        let transport = inner.transport.read().await.clone();
        if let Some(transport) = transport {
            transport.stop().await;
        }

        inner.state.send_replace(ServerState::Terminated);
        tracing::info!(server = %inner.info.name, "Server terminated");
        Ok(())
    }

    /// Decodes, dispatches and encodes one frame without a running loop.
    ///
    /// Applies the same lifecycle gating as the receive loop. Returns the
    /// encoded response for a request, and `None` for a notification or an
    /// undecodable frame.
    pub async fn handle_message(&self, message: &[u8]) -> Option<Vec<u8>> {
        let response = match self.inner.process(message).await {
            Processed::Reply(response) => response,
            Processed::Deferred(request) => Arc::clone(&self.inner).dispatch(request).await,
            Processed::Silent => return None,
        };
        encode_response(&response)
    }

    /// Sends a notification to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::NotStarted`] when no transport is running.
    pub fn notify(&self, method: impl Into<String>, params: Option<Value>) -> McpResult<()> {
        self.inner
            .enqueue(OutgoingNotification::new(method, params))
    }

    /// Tells the client the tool list changed.
    ///
    /// Does nothing unless `tools.listChanged` is advertised.
    ///
    /// # Errors
    ///
    /// See [`McpServer::notify`].
    pub fn notify_tools_list_changed(&self) -> McpResult<()> {
        let advertised = self
            .inner
            .capabilities
            .tools
            .as_ref()
            .is_some_and(|tools| tools.list_changed);
        self.notify_if(advertised, "notifications/tools/list_changed")
    }

    /// Tells the client the resource list changed.
    ///
    /// Does nothing unless `resources.listChanged` is advertised.
    ///
    /// # Errors
    ///
    /// See [`McpServer::notify`].
    pub fn notify_resources_list_changed(&self) -> McpResult<()> {
        let advertised = self
            .inner
            .capabilities
            .resources
            .as_ref()
            .is_some_and(|resources| resources.list_changed);
        self.notify_if(advertised, "notifications/resources/list_changed")
    }

    /// Tells the client the prompt list changed.
    ///
    /// Does nothing unless `prompts.listChanged` is advertised.
    ///
    /// # Errors
    ///
    /// See [`McpServer::notify`].
    pub fn notify_prompts_list_changed(&self) -> McpResult<()> {
        let advertised = self
            .inner
            .capabilities
            .prompts
            .as_ref()
            .is_some_and(|prompts| prompts.list_changed);
        self.notify_if(advertised, "notifications/prompts/list_changed")
    }

    /// Tells the client a resource changed.
    ///
    /// # Errors
    ///
    /// See [`McpServer::notify`].
    pub fn notify_resource_updated(&self, uri: &str) -> McpResult<()> {
        self.inner
            .enqueue(OutgoingNotification::resource_updated(uri))
    }

    fn notify_if(&self, advertised: bool, method: &str) -> McpResult<()> {
        if !advertised {
            tracing::debug!(method, "Capability not advertised, notification skipped");
            return Ok(());
        }
        self.notify(method, None)
    }
}

impl fmt::Debug for McpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpServer")
            .field("info", &self.inner.info)
            .field("state", &self.inner.state())
            .field("capabilities", &self.inner.capabilities)
            .finish_non_exhaustive()
    }
}

impl ServerInner {
    fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Moves from `from` to `to`; returns `false` if the state was not `from`.
    fn transition(&self, from: ServerState, to: ServerState) -> bool {
        let moved = self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::debug!(from = %from, to = %to, "State transition");
        }
        moved
    }

    async fn delegate(&self) -> Option<Arc<dyn ServerDelegate>> {
        self.delegate.read().await.as_ref().and_then(Weak::upgrade)
    }

    fn enqueue(&self, notification: OutgoingNotification) -> McpResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::debug!(method = %notification.method, "No transport, notification dropped");
            return Err(TransportError::NotStarted.into());
        }
        self.outbox
            .send(notification)
            .map_err(|_| McpError::Transport(TransportError::Closed))
    }

    /// Decodes a frame and does everything that must happen in arrival order.
    async fn process(&self, message: &[u8]) -> Processed {
        let msg = match decode_message(message) {
            Ok(msg) => msg,
            Err(DecodeError::InvalidRequest { id, reason }) => {
                tracing::warn!(id = %id, reason = %reason, "Invalid request");
                return Processed::Reply(JsonRpcResponse::invalid_request(id, reason));
            }
            Err(DecodeError::Unrecognized(reason)) => {
                tracing::warn!(reason = %reason, "Dropping undecodable frame");
                return Processed::Silent;
            }
        };
        tracing::trace!(method = %msg.method(), id = ?msg.id(), "Received message");

        match msg {
            IncomingMessage::Notification(notification) => {
                self.handle_notification(notification).await;
                Processed::Silent
            }
            IncomingMessage::Request(request) if request.method == "initialize" => {
                Processed::Reply(self.handle_initialize(&request).await)
            }
            IncomingMessage::Request(request) => {
                let state = self.state();
                if state == ServerState::Ready {
                    Processed::Deferred(request)
                } else {
                    tracing::warn!(
                        method = %request.method,
                        state = %state,
                        "Request before initialisation completed"
                    );
                    Processed::Reply(JsonRpcResponse::error(
                        request.id,
                        McpError::ServerNotInitialized.to_rpc_error(),
                    ))
                }
            }
        }
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        if notification.method == "notifications/initialized" {
            if self.transition(ServerState::Initializing, ServerState::Ready) {
                tracing::info!("Client initialised, server ready");
                if let Some(delegate) = self.delegate().await {
                    delegate.on_initialized().await;
                }
            } else {
                tracing::warn!(
                    state = %self.state(),
                    "Ignoring initialized notification outside of the handshake"
                );
            }
            return;
        }

        match self.delegate().await {
            Some(delegate) => delegate.on_notification(&notification).await,
            None => tracing::debug!(method = %notification.method, "Dropping unhandled notification"),
        }
    }

    /// Handles the initialize request.
    async fn handle_initialize(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        let params: InitializeParams = match parse_params(req.params.clone()) {
            Ok(params) => params,
            Err(e) => return JsonRpcResponse::error(req.id.clone(), e.to_rpc_error()),
        };

        tracing::info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            requested_version = %params.protocol_version,
            "Initialize request"
        );

        *self.session.write().await = Some(ClientSession {
            info: params.client_info,
            capabilities: params.capabilities,
            protocol_version: params.protocol_version,
        });

        if !self.transition(ServerState::Uninitialized, ServerState::Initializing) {
            let state = self.state();
            if state != ServerState::Initializing {
                tracing::warn!(state = %state, "Repeated initialize, state unchanged");
            }
        }

        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: self.capabilities.clone(),
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        };

        match serde_json::to_value(result) {
            Ok(value) => JsonRpcResponse::success(req.id.clone(), value),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialise initialize result");
                JsonRpcResponse::error(
                    req.id.clone(),
                    McpError::Serialization(e).to_rpc_error(),
                )
            }
        }
    }

    /// Runs an admitted request on its own task so a panicking provider
    /// cannot take the engine down with it.
    async fn dispatch(self: Arc<Self>, request: JsonRpcRequest) -> JsonRpcResponse {
        let id = request.id.clone();
        let method = request.method.clone();
        match tokio::spawn(async move { self.route(request).await }).await {
            Ok(response) => response,
            Err(e) => {
                let message = panic_message(e);
                tracing::error!(method = %method, error = %message, "Request handler failed");
                JsonRpcResponse::error(id, McpError::Internal(message).to_rpc_error())
            }
        }
    }

    async fn route(self: &Arc<Self>, request: JsonRpcRequest) -> JsonRpcResponse {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;

        let result = match method.as_str() {
            "ping" => Ok(json!({})),
            "tools/list" => self.list_tools().await,
            "tools/call" => self.call_tool(params).await,
            "resources/list" => self.list_resources().await,
            "resources/read" => self.read_resource(params).await,
            "resources/subscribe" | "resources/unsubscribe" if !self.subscriptions_advertised() => {
                Err(McpError::method_not_found(method.clone()))
            }
            "resources/subscribe" => self.subscribe_resource(params).await,
            "resources/unsubscribe" => self.unsubscribe_resource(params).await,
            "prompts/list" => self.list_prompts().await,
            "prompts/get" => self.get_prompt(params).await,
            _ => {
                let request = JsonRpcRequest::new(id.clone(), method.clone(), params);
                self.delegate_request(&request).await
            }
        };

        match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => {
                let error = e.to_rpc_error();
                if error.code == ErrorCode::InternalError.code() {
                    tracing::error!(method = %method, error = %e, "Request failed");
                } else {
                    tracing::warn!(method = %method, error = %e, "Request rejected");
                }
                JsonRpcResponse::error(id, error)
            }
        }
    }

    async fn delegate_request(&self, request: &JsonRpcRequest) -> McpResult<Value> {
        match self.delegate().await {
            Some(delegate) => delegate.on_request(request).await.map_err(McpError::Rpc),
            None => Err(McpError::method_not_found(request.method.clone())),
        }
    }

    async fn list_tools(&self) -> McpResult<Value> {
        Ok(json!({ "tools": self.tools.list().await }))
    }

    async fn call_tool(&self, params: Option<Value>) -> McpResult<Value> {
        let params: ToolCallParams = parse_params(params)?;
        tracing::debug!(tool = %params.name, "Calling tool");
        let result = self
            .tools
            .execute(&params.name, params.arguments.unwrap_or_default())
            .await?;
        Ok(serde_json::to_value(result)?)
    }

    async fn list_resources(&self) -> McpResult<Value> {
        let resources: Vec<Value> = self
            .resources
            .list()
            .await
            .iter()
            .map(ResourceDefinition::listing)
            .collect();
        Ok(json!({ "resources": resources }))
    }

    async fn read_resource(&self, params: Option<Value>) -> McpResult<Value> {
        let ResourceUriParams { uri } = parse_params(params)?;
        let resource = self.resources.read(&uri).await?;
        Ok(json!({ "contents": [resource.contents()] }))
    }

    fn subscriptions_advertised(&self) -> bool {
        self.capabilities
            .resources
            .as_ref()
            .is_some_and(|resources| resources.subscribe)
    }

    async fn subscribe_resource(self: &Arc<Self>, params: Option<Value>) -> McpResult<Value> {
        let ResourceUriParams { uri } = parse_params(params)?;
        let mut subscriptions = self.client_subscriptions.lock().await;
        if let Some(&id) = subscriptions.get(&uri) {
            if self.resources.is_subscribed(&uri, id).await {
                return Ok(json!({}));
            }
            // The provider was replaced or removed since.
            subscriptions.remove(&uri);
        }

        let server = Arc::downgrade(self);
        let handler: ResourceUpdateHandler = Arc::new(move |resource: &ResourceDefinition| {
            if let Some(server) = server.upgrade() {
                // Dropped silently once the transport is gone.
                let _ = server.enqueue(OutgoingNotification::resource_updated(&resource.uri));
            }
        });

        let id = self.resources.subscribe(&uri, handler).await?;
        subscriptions.insert(uri, id);
        Ok(json!({}))
    }

    async fn unsubscribe_resource(&self, params: Option<Value>) -> McpResult<Value> {
        let ResourceUriParams { uri } = parse_params(params)?;
        let id = self.client_subscriptions.lock().await.remove(&uri);
        if let Some(id) = id {
            self.resources.unsubscribe(&uri, id).await;
        }
        Ok(json!({}))
    }

    async fn release_client_subscriptions(&self) {
        let held: Vec<(String, SubscriptionId)> =
            self.client_subscriptions.lock().await.drain().collect();
        for (uri, id) in held {
            self.resources.unsubscribe(&uri, id).await;
        }
    }

    async fn list_prompts(&self) -> McpResult<Value> {
        Ok(json!({ "prompts": self.prompts.list().await }))
    }

    async fn get_prompt(&self, params: Option<Value>) -> McpResult<Value> {
        let params: PromptGetParams = parse_params(params)?;
        let messages = self
            .prompts
            .generate(&params.name, params.arguments.unwrap_or_default())
            .await?;

        let mut result = Map::new();
        let description = self
            .prompts
            .get(&params.name)
            .await
            .and_then(|prompt| prompt.definition().description.clone());
        if let Some(description) = description {
            result.insert("description".to_string(), Value::String(description));
        }
        result.insert("messages".to_string(), serde_json::to_value(messages)?);
        Ok(Value::Object(result))
    }
}

/// Pulls frames off the transport until it ends or the server terminates.
async fn receive_loop_task(inner: Arc<ServerInner>, transport: Arc<dyn Transport>) {
    let terminated = terminated(inner.state.subscribe());
    tokio::pin!(terminated);
    loop {
        let frame = tokio::select! {
            () = &mut terminated => {
                tracing::debug!("Server terminated, leaving receive loop");
                break;
            }
            frame = transport.receive() => frame,
        };

        let bytes = match frame {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::info!("Transport closed by peer");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Receive failed, stopping receive loop");
                break;
            }
        };

        match inner.process(&bytes).await {
            Processed::Reply(response) => send_response(transport.as_ref(), &response).await,
            Processed::Deferred(request) => {
                let inner = Arc::clone(&inner);
                let transport = Arc::clone(&transport);
                tokio::spawn(async move {
                    let response = inner.dispatch(request).await;
                    send_response(transport.as_ref(), &response).await;
                });
            }
            Processed::Silent => {}
        }
    }
}

/// Drains the outbox onto the transport.
async fn forward_notifications(
    transport: Arc<dyn Transport>,
    mut outbox: mpsc::UnboundedReceiver<OutgoingNotification>,
    state: watch::Receiver<ServerState>,
) {
    let terminated = terminated(state);
    tokio::pin!(terminated);
    loop {
        let notification = tokio::select! {
            () = &mut terminated => break,
            notification = outbox.recv() => match notification {
                Some(notification) => notification,
                None => break,
            },
        };

        match serde_json::to_vec(&notification) {
            Ok(bytes) => {
                if let Err(e) = transport.send(&bytes).await {
                    tracing::warn!(method = %notification.method, error = %e, "Failed to send notification");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to serialise notification"),
        }
    }
}

/// Resolves once the server is terminated or dropped.
async fn terminated(mut state: watch::Receiver<ServerState>) {
    let _ = state
        .wait_for(|s| *s == ServerState::Terminated)
        .await;
}

async fn send_response(transport: &dyn Transport, response: &JsonRpcResponse) {
    let Some(bytes) = encode_response(response) else {
        return;
    };
    if let Err(e) = transport.send(&bytes).await {
        tracing::warn!(id = %response.id, error = %e, "Failed to send response");
    }
}

fn encode_response(response: &JsonRpcResponse) -> Option<Vec<u8>> {
    match serde_json::to_vec(response) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!(id = %response.id, error = %e, "Failed to serialise response");
            None
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> McpResult<T> {
    let params = params.unwrap_or_else(|| Value::Object(Map::new()));
    serde_json::from_value(params).map_err(|e| McpError::invalid_params(e.to_string()))
}

fn panic_message(error: JoinError) -> String {
    match error.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "request handler panicked".to_string()),
        Err(error) => error.to_string(),
    }
}
