//! Backend registry: the interface the aggregator reads descriptors through,
//! an in-memory implementation, descriptor validation and a manifest loader.

pub mod manifest;
pub mod memory;
pub mod registry;
pub mod validation;

pub use manifest::{BackendManifest, ManifestSource, ManifestSummary};
pub use memory::MemoryRegistry;
pub use registry::{BackendRegistry, BackendStore, DeletedBackend, RegistryEvent, RegistryWatch};
