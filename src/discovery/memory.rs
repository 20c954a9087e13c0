//! In-memory backend registry.
//!
//! Descriptors live in a `DashMap`; every successful write is broadcast to
//! watchers. Events only name what changed: consumers read the current
//! descriptor back, so an event overtaken by a later write is harmless.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::BackendDescriptor;
use crate::discovery::registry::{
    BackendRegistry, BackendStore, DeletedBackend, RegistryEvent, RegistryWatch,
};
use crate::discovery::validation::validate_descriptor;

const RESOURCE: &str = "backend";
const EVENT_BUFFER: usize = 256;

pub struct MemoryRegistry {
    backends: DashMap<String, BackendDescriptor>,
    events: broadcast::Sender<RegistryEvent>,
    reserved_group: String,
}

impl MemoryRegistry {
    /// Create an empty registry. Writes claiming `reserved_group` are rejected.
    pub fn new(reserved_group: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            backends: DashMap::new(),
            events,
            reserved_group: reserved_group.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine; the controller relists on start.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl BackendRegistry for MemoryRegistry {
    async fn list(&self) -> AggregatorResult<Vec<BackendDescriptor>> {
        Ok(self
            .backends
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn get(&self, name: &str) -> AggregatorResult<BackendDescriptor> {
        self.backends
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AggregatorError::not_found(RESOURCE, name))
    }

    fn watch(&self) -> RegistryWatch {
        self.events.subscribe()
    }
}

#[async_trait]
impl BackendStore for MemoryRegistry {
    async fn create(&self, descriptor: BackendDescriptor) -> AggregatorResult<BackendDescriptor> {
        validate_descriptor(&descriptor, &self.reserved_group)?;

        match self.backends.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => Err(AggregatorError::already_exists(RESOURCE, &descriptor.name)),
            Entry::Vacant(entry) => {
                entry.insert(descriptor.clone());
                debug!(backend = %descriptor.name, "Backend created");
                self.publish(RegistryEvent::Added(descriptor.clone()));
                Ok(descriptor)
            }
        }
    }

    async fn update(&self, descriptor: BackendDescriptor) -> AggregatorResult<BackendDescriptor> {
        validate_descriptor(&descriptor, &self.reserved_group)?;

        match self.backends.entry(descriptor.name.clone()) {
            Entry::Vacant(_) => Err(AggregatorError::not_found(RESOURCE, &descriptor.name)),
            Entry::Occupied(mut entry) => {
                entry.insert(descriptor.clone());
                debug!(backend = %descriptor.name, "Backend updated");
                self.publish(RegistryEvent::Modified(descriptor.clone()));
                Ok(descriptor)
            }
        }
    }

    async fn delete(&self, name: &str) -> AggregatorResult<BackendDescriptor> {
        match self.backends.entry(name.to_string()) {
            Entry::Vacant(_) => Err(AggregatorError::not_found(RESOURCE, name)),
            Entry::Occupied(entry) => {
                let removed = entry.remove();
                debug!(backend = %name, "Backend deleted");
                self.publish(RegistryEvent::Deleted(DeletedBackend::Final(removed.clone())));
                Ok(removed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MemoryRegistry {
        MemoryRegistry::new("apiregistration.aggregator.io")
    }

    #[tokio::test]
    async fn test_create_get_delete_emit_events() {
        let registry = registry();
        let mut watch = registry.watch();
        let descriptor = BackendDescriptor::new("foo.io", "v1", "foo:443", 10);

        registry.create(descriptor.clone()).await.unwrap();
        assert_eq!(registry.get("v1.foo.io").await.unwrap(), descriptor);
        assert_eq!(watch.recv().await.unwrap(), RegistryEvent::Added(descriptor.clone()));

        let mut changed = descriptor.clone();
        changed.priority = 20;
        registry.update(changed.clone()).await.unwrap();
        assert_eq!(watch.recv().await.unwrap(), RegistryEvent::Modified(changed.clone()));

        registry.delete("v1.foo.io").await.unwrap();
        assert_eq!(
            watch.recv().await.unwrap(),
            RegistryEvent::Deleted(DeletedBackend::Final(changed))
        );
        assert!(registry.get("v1.foo.io").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_write_errors() {
        let registry = registry();
        let descriptor = BackendDescriptor::new("foo.io", "v1", "foo:443", 10);

        assert!(registry.update(descriptor.clone()).await.unwrap_err().is_not_found());
        assert!(registry.delete("v1.foo.io").await.unwrap_err().is_not_found());

        registry.create(descriptor.clone()).await.unwrap();
        assert!(matches!(
            registry.create(descriptor).await,
            Err(AggregatorError::AlreadyExists { .. })
        ));

        let invalid = BackendDescriptor::new("foo.io", "v2", "no-port", 10);
        assert!(matches!(
            registry.create(invalid).await,
            Err(AggregatorError::Validation { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let registry = registry();
        let mut watch = registry.watch();
        let descriptor = BackendDescriptor::new("foo.io", "v1", "foo:443", 10);

        assert!(registry.apply(descriptor.clone()).await.unwrap());
        assert!(!registry.apply(descriptor.clone()).await.unwrap());

        assert!(matches!(watch.recv().await.unwrap(), RegistryEvent::Added(_)));
        assert!(watch.try_recv().is_err());
    }
}
