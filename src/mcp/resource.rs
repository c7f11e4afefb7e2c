//! Resource providers, the resource registry and its subscription table.
//!
//! # Subscriptions
//!
//! Every call to [`ResourceRegistry::subscribe`] allocates a fresh
//! [`SubscriptionId`] and hands its handler straight to the provider. The
//! registry only counts interest: a URI has a live provider-level
//! subscription exactly while its id set is non-empty, and the provider's
//! `unsubscribe` runs when the last id for that URI is released.
//!
//! Whether one provider multiplexes a single feed across many handlers or
//! starts one feed per handler is the provider's business.
//! [`ObservableResource`] keeps a handler list and fans each update out to
//! all of them.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{McpError, McpResult};
use crate::mcp::registry::Registry;
use crate::mcp::types::ResourceDefinition;

/// Callback invoked by a provider whenever its resource changes.
pub type ResourceUpdateHandler = Arc<dyn Fn(&ResourceDefinition) + Send + Sync>;

/// Identifies one subscription held against the resource registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A readable, optionally subscribable resource.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// The resource's metadata. Its URI is the registry key.
    async fn definition(&self) -> ResourceDefinition;

    /// Reads the current content.
    ///
    /// # Errors
    ///
    /// Returns an error if the content cannot be produced.
    async fn read(&self) -> McpResult<ResourceDefinition>;

    /// Starts delivering updates to `handler`.
    ///
    /// # Errors
    ///
    /// The default implementation returns
    /// [`McpError::SubscriptionUnsupported`].
    async fn subscribe(&self, handler: ResourceUpdateHandler) -> McpResult<()> {
        let _ = handler;
        Err(McpError::SubscriptionUnsupported(self.definition().await.uri))
    }

    /// Stops delivering updates. Called once the last subscriber leaves.
    async fn unsubscribe(&self) {}
}

/// Concurrency-safe map from URI to provider, plus the subscription table.
#[derive(Default)]
pub struct ResourceRegistry {
    providers: Registry<dyn ResourceProvider>,
    // Held across provider subscribe/unsubscribe calls so the table and the
    // provider-level subscription state never disagree.
    subscriptions: Mutex<HashMap<String, HashSet<SubscriptionId>>>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider, replacing any provider with the same URI.
    pub async fn register(&self, provider: impl ResourceProvider + 'static) {
        self.register_shared(Arc::new(provider)).await;
    }

    /// Registers a shared provider, replacing any provider with the same URI.
    ///
    /// Subscriptions held against a replaced provider are torn down; their
    /// ids become stale.
    pub async fn register_shared(&self, provider: Arc<dyn ResourceProvider>) {
        let uri = provider.definition().await.uri;
        let mut subscriptions = self.subscriptions.lock().await;
        let replaced = self.providers.insert(uri.clone(), provider).await;
        match replaced {
            Some(old) => {
                tracing::debug!(uri = %uri, "Replaced resource");
                if subscriptions.remove(&uri).is_some() {
                    old.unsubscribe().await;
                }
            }
            None => tracing::debug!(uri = %uri, "Registered resource"),
        }
    }

    /// Removes a provider, tearing down any subscriptions it still has.
    pub async fn unregister(&self, uri: &str) {
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(old) = self.providers.remove(uri).await {
            tracing::debug!(uri = %uri, "Unregistered resource");
            if subscriptions.remove(uri).is_some() {
                old.unsubscribe().await;
            }
        }
    }

    /// Looks up a provider by URI.
    pub async fn get(&self, uri: &str) -> Option<Arc<dyn ResourceProvider>> {
        self.providers.get(uri).await
    }

    /// Snapshot of all resource definitions in registration order.
    pub async fn list(&self) -> Vec<ResourceDefinition> {
        let providers = self.providers.values().await;
        let mut definitions = Vec::with_capacity(providers.len());
        for provider in providers {
            definitions.push(provider.definition().await);
        }
        definitions
    }

    /// Reads a resource.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::MethodNotFound`] for an unknown URI, otherwise
    /// whatever the provider returns.
    pub async fn read(&self, uri: &str) -> McpResult<ResourceDefinition> {
        let provider = self.get(uri).await.ok_or_else(|| not_found(uri))?;
        provider.read().await
    }

    /// Subscribes `handler` to updates of `uri`.
    ///
    /// The provider is asked to subscribe on every call, whether this is the
    /// first or the Nth subscriber.
    ///
    /// # Errors
    ///
    /// Returns [`McpError::MethodNotFound`] for an unknown URI, or the
    /// provider's error (for example [`McpError::SubscriptionUnsupported`]).
    /// A failed subscription leaves the table as it was.
    pub async fn subscribe(
        &self,
        uri: &str,
        handler: ResourceUpdateHandler,
    ) -> McpResult<SubscriptionId> {
        let mut subscriptions = self.subscriptions.lock().await;
        let provider = self.providers.get(uri).await.ok_or_else(|| not_found(uri))?;

        let id = SubscriptionId::new();
        subscriptions.entry(uri.to_string()).or_default().insert(id);

        if let Err(e) = provider.subscribe(handler).await {
            if let Some(ids) = subscriptions.get_mut(uri) {
                ids.remove(&id);
                if ids.is_empty() {
                    subscriptions.remove(uri);
                }
            }
            return Err(e);
        }

        tracing::debug!(uri = %uri, subscription = %id, "Subscribed to resource");
        Ok(id)
    }

    /// Releases one subscription.
    ///
    /// Unknown ids are ignored. Releasing the last id for a URI calls the
    /// provider's `unsubscribe` and removes the table entry.
    pub async fn unsubscribe(&self, uri: &str, id: SubscriptionId) {
        let mut subscriptions = self.subscriptions.lock().await;
        let Some(ids) = subscriptions.get_mut(uri) else {
            return;
        };
        if !ids.remove(&id) {
            return;
        }
        tracing::debug!(uri = %uri, subscription = %id, "Unsubscribed from resource");

        if ids.is_empty() {
            subscriptions.remove(uri);
            if let Some(provider) = self.providers.get(uri).await {
                provider.unsubscribe().await;
            }
        }
    }

    /// Number of live subscriptions for `uri`.
    pub async fn subscriber_count(&self, uri: &str) -> usize {
        self.subscriptions.lock().await.get(uri).map_or(0, HashSet::len)
    }

    /// Whether `id` is still a live subscription for `uri`.
    ///
    /// Ids go stale when their provider is replaced or unregistered.
    pub async fn is_subscribed(&self, uri: &str, id: SubscriptionId) -> bool {
        self.subscriptions
            .lock()
            .await
            .get(uri)
            .is_some_and(|ids| ids.contains(&id))
    }
}

fn not_found(uri: &str) -> McpError {
    McpError::method_not_found(format!("Resource '{uri}'"))
}

/// A resource whose content never changes.
#[derive(Debug, Clone)]
pub struct StaticResource {
    resource: ResourceDefinition,
}

impl StaticResource {
    /// Wraps a fixed resource.
    #[must_use]
    pub const fn new(resource: ResourceDefinition) -> Self {
        Self { resource }
    }

    /// Creates a plain-text resource.
    #[must_use]
    pub fn text(uri: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            ResourceDefinition::new(uri)
                .with_mime_type("text/plain")
                .with_text(text),
        )
    }
}

#[async_trait]
impl ResourceProvider for StaticResource {
    async fn definition(&self) -> ResourceDefinition {
        self.resource.clone()
    }

    async fn read(&self) -> McpResult<ResourceDefinition> {
        Ok(self.resource.clone())
    }
}

/// A resource that pushes every update to all of its subscribers.
///
/// Cloning yields another handle to the same resource.
#[derive(Clone)]
pub struct ObservableResource {
    current: Arc<RwLock<ResourceDefinition>>,
    handlers: Arc<RwLock<Vec<ResourceUpdateHandler>>>,
}

impl ObservableResource {
    /// Creates an observable resource with initial content.
    #[must_use]
    pub fn new(initial: ResourceDefinition) -> Self {
        Self {
            current: Arc::new(RwLock::new(initial)),
            handlers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Replaces the content and notifies every subscriber.
    ///
    /// The URI is fixed at construction; a different URI in `resource` is
    /// overwritten.
    pub async fn update(&self, mut resource: ResourceDefinition) {
        {
            let mut current = self.current.write().await;
            resource.uri.clone_from(&current.uri);
            *current = resource.clone();
        }
        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            handler(&resource);
        }
    }

    /// Number of handlers currently attached.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

#[async_trait]
impl ResourceProvider for ObservableResource {
    async fn definition(&self) -> ResourceDefinition {
        self.current.read().await.clone()
    }

    async fn read(&self) -> McpResult<ResourceDefinition> {
        Ok(self.current.read().await.clone())
    }

    async fn subscribe(&self, handler: ResourceUpdateHandler) -> McpResult<()> {
        self.handlers.write().await.push(handler);
        Ok(())
    }

    async fn unsubscribe(&self) {
        self.handlers.write().await.clear();
    }
}
