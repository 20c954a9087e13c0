//! # Route Manager
//!
//! Owns the route table (`backend name -> ProxyHandler`) and installs handlers
//! into the path multiplexer. It is the [`BackendHandlerManager`] the
//! registration controller drives.
//!
//! Handlers are created once per name and mutated afterwards; routes are
//! never unregistered. Removing a backend disables its proxy, which then
//! answers 404 until the backend is added again.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::aggregation::apis::GroupDiscoveryHandler;
use crate::controller::registration::BackendHandlerManager;
use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::{BackendDescriptor, BackendKind};
use crate::discovery::registry::BackendRegistry;
use crate::discovery::validation::split_host_port;
use crate::protocols::identity::IdentityAccessor;
use crate::protocols::proxy::ProxyHandler;
use crate::protocols::transport::ProxySettings;
use crate::routing::mux::{PathMux, RouteHandler};

pub struct RouteManager {
    mux: Arc<PathMux>,
    handlers: DashMap<String, Arc<ProxyHandler>>,
    registry: Arc<dyn BackendRegistry>,
    settings: Arc<ProxySettings>,
    identity: IdentityAccessor,
    reserved_group: String,
}

impl RouteManager {
    /// `registry` backs the group discovery handlers; `reserved_group` is the
    /// aggregator's own group, which backends may not take over.
    pub fn new(
        mux: Arc<PathMux>,
        registry: Arc<dyn BackendRegistry>,
        settings: Arc<ProxySettings>,
        identity: IdentityAccessor,
        reserved_group: impl Into<String>,
    ) -> Self {
        Self {
            mux,
            handlers: DashMap::new(),
            registry,
            settings,
            identity,
            reserved_group: reserved_group.into(),
        }
    }

    pub fn mux(&self) -> &Arc<PathMux> {
        &self.mux
    }

    /// Handler installed for `name`, enabled or not
    pub fn handler(&self, name: &str) -> Option<Arc<ProxyHandler>> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn check(&self, descriptor: &BackendDescriptor) -> AggregatorResult<()> {
        split_host_port(&descriptor.internal_host).map_err(|e| {
            AggregatorError::validation("backend", &descriptor.name, vec![format!("internalHost: {}", e)])
        })?;
        if descriptor.group == self.reserved_group {
            return Err(AggregatorError::validation(
                "backend",
                &descriptor.name,
                vec![format!("group '{}' is reserved", descriptor.group)],
            ));
        }
        Ok(())
    }

    fn build_handler(&self, descriptor: &BackendDescriptor) -> Arc<ProxyHandler> {
        Arc::new(ProxyHandler::new(
            descriptor,
            Arc::clone(&self.settings),
            Arc::clone(&self.identity),
        ))
    }

    fn install(&self, descriptor: &BackendDescriptor, kind: &BackendKind, handler: &Arc<ProxyHandler>) -> AggregatorResult<()> {
        let path = kind.route_path();
        self.mux.register(
            &[path.clone(), format!("{}/", path)],
            Arc::clone(handler) as Arc<dyn RouteHandler>,
        )?;

        if let (BackendKind::Group { group, .. }, Some(group_path)) = (kind, kind.group_path()) {
            let discovery = Arc::new(GroupDiscoveryHandler::new(group.clone(), Arc::clone(&self.registry)));
            match self.mux.register(&[group_path.clone(), format!("{}/", group_path)], discovery) {
                // Another version of the group installed it already.
                Ok(()) | Err(AggregatorError::RouteConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        info!(backend = %descriptor.name, path = %path, host = %descriptor.internal_host, "Installed backend proxy");
        Ok(())
    }
}

impl BackendHandlerManager for RouteManager {
    fn add_backend(&self, descriptor: &BackendDescriptor) -> AggregatorResult<()> {
        self.check(descriptor)?;
        let kind = descriptor.kind();

        if let Some(existing) = self.handler(&descriptor.name) {
            existing.update_from(descriptor);
            debug!(backend = %descriptor.name, host = %descriptor.internal_host, "Updated backend proxy");
            return Ok(());
        }

        // Built outside the shard lock; a racing add of the same name wins
        // the entry and this handler is dropped unused.
        let handler = self.build_handler(descriptor);

        // The entry guard serializes concurrent adds of one name.
        match self.handlers.entry(descriptor.name.clone()) {
            Entry::Occupied(entry) => {
                entry.get().update_from(descriptor);
                debug!(backend = %descriptor.name, host = %descriptor.internal_host, "Updated backend proxy");
            }
            Entry::Vacant(entry) => {
                self.install(descriptor, &kind, &handler)?;
                entry.insert(handler);
            }
        }
        Ok(())
    }

    fn remove_backend(&self, name: &str) {
        if let Some(handler) = self.handlers.get(name) {
            handler.set_enabled(false);
            info!(backend = %name, "Disabled backend proxy");
        }
    }

    fn known_backends(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }
}
