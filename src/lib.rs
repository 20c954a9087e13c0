//! # API Aggregator Library
//!
//! An aggregation front-end that puts many independently deployed API
//! backends behind one endpoint. Backends are registered as descriptors
//! (`group`, `version`, `internalHost`, `priority`, TLS settings); the
//! aggregator keeps a reverse proxy per backend under `/apis/<group>/<version>`
//! (or `/api` for the legacy core backend) and serves a merged `/apis`
//! discovery document.
//!
//! ## Module Layout
//!
//! - `core`: errors, configuration and the descriptor/discovery data model
//! - `discovery`: the backend registry, validation and the manifest loader
//! - `controller`: the work queue and the registration controller that
//!   reconciles registry state into routes
//! - `routing`: the dynamic path multiplexer and the route manager
//! - `protocols`: the per-backend proxy, its transports and identity propagation
//! - `aggregation`: `/apis` documents and the aggregator's own registration API
//! - `auth`: bearer-token authentication of callers
//! - `observability`: logging setup, request ids and Prometheus export
//! - `gateway`: the server that wires everything together

/// Error types, configuration and the shared data model
pub mod core;

/// Backend registry interface, in-memory store and manifest loader
pub mod discovery;

/// Rate-limited work queue and the registration controller
pub mod controller;

/// Path multiplexer and route manager
pub mod routing;

/// Reverse proxy, transports and identity propagation
pub mod protocols;

/// Discovery aggregation and the registration API
pub mod aggregation;

/// Caller authentication
pub mod auth;

/// Logging, request identifiers and metrics export
pub mod observability;

/// Server assembly
pub mod gateway;

pub use core::config::AggregatorConfig;
pub use core::error::{AggregatorError, AggregatorResult};
pub use core::types::{BackendDescriptor, BackendKind, UserInfo};

pub use controller::registration::{BackendHandlerManager, RegistrationController};
pub use discovery::{BackendRegistry, BackendStore, ManifestSource, MemoryRegistry, RegistryEvent};
pub use gateway::server::AggregatorServer;
pub use protocols::proxy::ProxyHandler;
pub use routing::manager::RouteManager;
