//! Keyed provider storage shared by the tool, resource and prompt registries.
//!
//! Each registry owns one [`Registry`]: an insertion-ordered map behind a
//! `tokio` read-write lock. The lock is fair, so mutations and reads against
//! one registry are served in arrival order. Guards never escape this module
//! and are always released before a provider is called.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::RwLock;

/// An insertion-ordered, concurrency-safe map from key to shared provider.
pub struct Registry<P: ?Sized> {
    entries: RwLock<IndexMap<String, Arc<P>>>,
}

impl<P: ?Sized> Registry<P> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// Inserts `provider` under `key`, returning the provider it replaced.
    pub async fn insert(&self, key: String, provider: Arc<P>) -> Option<Arc<P>> {
        self.entries.write().await.insert(key, provider)
    }

    /// Removes the provider under `key`, if any.
    pub async fn remove(&self, key: &str) -> Option<Arc<P>> {
        self.entries.write().await.shift_remove(key)
    }

    /// Looks up the provider under `key`.
    pub async fn get(&self, key: &str) -> Option<Arc<P>> {
        self.entries.read().await.get(key).cloned()
    }

    /// Snapshot of all providers in registration order.
    pub async fn values(&self) -> Vec<Arc<P>> {
        self.entries.read().await.values().cloned().collect()
    }
}

impl<P: ?Sized> Default for Registry<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_replaces_in_place() {
        let registry: Registry<str> = Registry::new();
        registry.insert("a".into(), Arc::from("first")).await;
        registry.insert("b".into(), Arc::from("second")).await;
        let replaced = registry.insert("a".into(), Arc::from("third")).await;

        assert_eq!(replaced.as_deref(), Some("first"));
        let values = registry.values().await;
        let values: Vec<&str> = values.iter().map(AsRef::as_ref).collect();
        assert_eq!(values, vec!["third", "second"]);
    }

    #[tokio::test]
    async fn remove_keeps_order_of_the_rest() {
        let registry: Registry<str> = Registry::new();
        for key in ["a", "b", "c"] {
            registry.insert(key.into(), Arc::from(key)).await;
        }
        assert!(registry.remove("b").await.is_some());
        assert!(registry.remove("b").await.is_none());
        assert!(registry.get("b").await.is_none());
        let values = registry.values().await;
        let values: Vec<&str> = values.iter().map(AsRef::as_ref).collect();
        assert_eq!(values, vec!["a", "c"]);
    }
}
