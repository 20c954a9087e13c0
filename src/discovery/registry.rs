//! # Backend Registry Interface
//!
//! The registry is the source of truth for [`BackendDescriptor`] objects. The
//! aggregator only reads it: the controller watches it and looks names up,
//! discovery handlers list it on every request.
//!
//! ## Rust Concepts Used
//!
//! - `async_trait` so implementations may suspend on remote lookups
//! - `tokio::sync::broadcast` for the watch stream; a lagging receiver gets
//!   `RecvError::Lagged` and is expected to relist

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::BackendDescriptor;

/// Change notification for one descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Added(BackendDescriptor),
    Modified(BackendDescriptor),
    Deleted(DeletedBackend),
}

/// Payload of a delete notification.
///
/// When a watcher missed the actual delete, the registry can only report the
/// key and possibly a stale copy of the object.
#[derive(Debug, Clone, PartialEq)]
pub enum DeletedBackend {
    Final(BackendDescriptor),
    Tombstone {
        key: String,
        last_known: Option<BackendDescriptor>,
    },
}

impl DeletedBackend {
    /// Name of the deleted backend, if one can be recovered
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Final(descriptor) => Some(descriptor.name.as_str()),
            Self::Tombstone {
                last_known: Some(descriptor),
                ..
            } => Some(descriptor.name.as_str()),
            Self::Tombstone { key, .. } if !key.is_empty() => Some(key.as_str()),
            Self::Tombstone { .. } => None,
        }
    }
}

impl RegistryEvent {
    /// Name of the backend the event is about
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Added(descriptor) | Self::Modified(descriptor) => Some(descriptor.name.as_str()),
            Self::Deleted(deleted) => deleted.name(),
        }
    }
}

pub type RegistryWatch = broadcast::Receiver<RegistryEvent>;

/// Read and watch access to backend descriptors
#[async_trait]
pub trait BackendRegistry: Send + Sync {
    /// Every stored descriptor, in no particular order
    async fn list(&self) -> AggregatorResult<Vec<BackendDescriptor>>;

    /// The descriptor named `name`; a miss is `AggregatorError::NotFound`
    async fn get(&self, name: &str) -> AggregatorResult<BackendDescriptor>;

    /// Subscribe to changes made after this call
    fn watch(&self) -> RegistryWatch;
}

/// Write access used by the registration API and the manifest loader
#[async_trait]
pub trait BackendStore: BackendRegistry {
    async fn create(&self, descriptor: BackendDescriptor) -> AggregatorResult<BackendDescriptor>;

    async fn update(&self, descriptor: BackendDescriptor) -> AggregatorResult<BackendDescriptor>;

    async fn delete(&self, name: &str) -> AggregatorResult<BackendDescriptor>;

    /// Create or update. Returns `false` when the stored copy was already identical.
    async fn apply(&self, descriptor: BackendDescriptor) -> AggregatorResult<bool> {
        match self.get(&descriptor.name).await {
            Ok(existing) if existing == descriptor => Ok(false),
            Ok(_) => self.update(descriptor).await.map(|_| true),
            Err(AggregatorError::NotFound { .. }) => self.create(descriptor).await.map(|_| true),
            Err(e) => Err(e),
        }
    }
}
