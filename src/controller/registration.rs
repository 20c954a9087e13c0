//! # Registration Controller
//!
//! Keeps the route table in line with the backend registry. Registry events
//! only enqueue backend names; workers then look each name up and either
//! install/update its handlers or disable them.
//!
//! Reconciliation is level based: `sync` reads the current state of one name,
//! so duplicate or reordered events are harmless and the last state wins.

use futures::FutureExt;
use metrics::counter;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::queue::WorkQueue;
use crate::controller::rate_limiter::ItemExponentialBackoff;
use crate::core::config::ControllerConfig;
use crate::core::error::AggregatorResult;
use crate::core::types::BackendDescriptor;
use crate::discovery::registry::{BackendRegistry, RegistryEvent, RegistryWatch};

/// What the controller drives: something that can install and disable the
/// handlers of one backend.
pub trait BackendHandlerManager: Send + Sync {
    /// Install or update the handlers of `descriptor`. Errors are retried.
    fn add_backend(&self, descriptor: &BackendDescriptor) -> AggregatorResult<()>;

    /// Disable the handlers of `name`; unknown names are ignored.
    fn remove_backend(&self, name: &str);

    /// Names the manager currently holds handlers for
    fn known_backends(&self) -> Vec<String>;
}

pub struct RegistrationController {
    registry: Arc<dyn BackendRegistry>,
    manager: Arc<dyn BackendHandlerManager>,
    queue: Arc<WorkQueue>,
    resync_interval: Duration,
}

impl RegistrationController {
    pub fn new(
        registry: Arc<dyn BackendRegistry>,
        manager: Arc<dyn BackendHandlerManager>,
        config: &ControllerConfig,
    ) -> Self {
        let limiter = ItemExponentialBackoff::new(config.base_backoff, config.max_backoff);
        Self {
            registry,
            manager,
            queue: Arc::new(WorkQueue::new("backend_registration", limiter)),
            resync_interval: config.resync_interval,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Reconcile one backend name against the registry
    pub async fn sync(&self, name: &str) -> AggregatorResult<()> {
        match self.registry.get(name).await {
            Ok(descriptor) => self.manager.add_backend(&descriptor),
            Err(e) if e.is_not_found() => {
                self.manager.remove_backend(name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Enqueue the backend an event refers to
    pub fn handle_event(&self, event: &RegistryEvent) {
        match event.name() {
            Some(name) => {
                debug!(backend = %name, "Queueing backend");
                self.queue.add(name);
            }
            None => error!(event = ?event, "Couldn't get backend name from delete tombstone"),
        }
    }

    /// Run `workers` reconciliation workers until `shutdown` fires.
    ///
    /// Returns once the queue has been drained and every worker has exited.
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: CancellationToken) {
        info!(workers, "Starting backend registration controller");

        // Subscribe before the initial list so nothing written in between is missed.
        let watch = self.registry.watch();
        self.resync().await;

        let watcher = tokio::spawn(Arc::clone(&self).watch_loop(watch, shutdown.clone()));

        let mut pool = JoinSet::new();
        for worker in 0..workers.max(1) {
            pool.spawn(Arc::clone(&self).run_worker(worker));
        }

        shutdown.cancelled().await;
        info!("Shutting down backend registration controller");
        self.queue.shut_down();

        while let Some(result) = pool.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Registration worker exited abnormally");
            }
        }
        if let Err(e) = watcher.await {
            error!(error = %e, "Registry watch loop exited abnormally");
        }
        info!("Backend registration controller stopped");
    }

    async fn watch_loop(self: Arc<Self>, mut watch: RegistryWatch, shutdown: CancellationToken) {
        let mut resync = tokio::time::interval(self.resync_interval);
        // The first tick completes immediately; the initial list already ran.
        resync.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = resync.tick() => {
                    debug!("Periodic backend resync");
                    self.resync().await;
                }
                event = watch.recv() => match event {
                    Ok(event) => self.handle_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Registry watch lagged, relisting");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Registry watch closed, relying on periodic resync");
                        // Keep resyncing on the timer until shutdown.
                        loop {
                            tokio::select! {
                                _ = shutdown.cancelled() => return,
                                _ = resync.tick() => self.resync().await,
                            }
                        }
                    }
                },
            }
        }
    }

    /// Enqueue every listed backend plus every backend the manager still knows,
    /// so deletes missed by the watch are reconciled too.
    async fn resync(&self) {
        let mut names: HashSet<String> = match self.registry.list().await {
            Ok(descriptors) => descriptors.into_iter().map(|d| d.name).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list backends for resync");
                return;
            }
        };
        names.extend(self.manager.known_backends());

        for name in &names {
            self.queue.add(name);
        }
        debug!(count = names.len(), "Queued backends for resync");
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        debug!(worker, "Registration worker started");
        while self.process_next_work_item().await {}
        debug!(worker, "Registration worker stopped");
    }

    /// Process one queued name. Returns `false` once the queue is shut down and empty.
    async fn process_next_work_item(&self) -> bool {
        let Some(name) = self.queue.get().await else {
            return false;
        };

        match AssertUnwindSafe(self.sync(&name)).catch_unwind().await {
            Ok(Ok(())) => {
                counter!("aggregator_backend_syncs_total", "result" => "success").increment(1);
                self.queue.forget(&name);
            }
            Ok(Err(e)) => {
                counter!("aggregator_backend_syncs_total", "result" => "error").increment(1);
                warn!(
                    backend = %name,
                    error = %e,
                    requeues = self.queue.num_requeues(&name),
                    "Failed to sync backend, requeueing"
                );
                self.queue.add_rate_limited(&name);
            }
            Err(_) => {
                counter!("aggregator_backend_syncs_total", "result" => "panic").increment(1);
                error!(backend = %name, "Backend sync panicked, requeueing");
                self.queue.add_rate_limited(&name);
            }
        }

        self.queue.done(&name);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::AggregatorError;
    use crate::discovery::memory::MemoryRegistry;
    use crate::discovery::registry::{BackendStore, DeletedBackend};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingManager {
        calls: Mutex<Vec<String>>,
        known: Mutex<HashSet<String>>,
        fail_adds: Mutex<u32>,
    }

    impl BackendHandlerManager for RecordingManager {
        fn add_backend(&self, descriptor: &BackendDescriptor) -> AggregatorResult<()> {
            let mut remaining = self.fail_adds.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AggregatorError::internal("injected failure"));
            }
            self.calls.lock().push(format!("add {}", descriptor.name));
            self.known.lock().insert(descriptor.name.clone());
            Ok(())
        }

        fn remove_backend(&self, name: &str) {
            self.calls.lock().push(format!("remove {}", name));
        }

        fn known_backends(&self) -> Vec<String> {
            self.known.lock().iter().cloned().collect()
        }
    }

    fn controller(
        registry: Arc<MemoryRegistry>,
        manager: Arc<RecordingManager>,
    ) -> RegistrationController {
        let config = ControllerConfig {
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            ..ControllerConfig::default()
        };
        RegistrationController::new(registry, manager, &config)
    }

    #[tokio::test]
    async fn test_sync_adds_present_backend() {
        let registry = Arc::new(MemoryRegistry::new("apiregistration.aggregator.io"));
        let manager = Arc::new(RecordingManager::default());
        registry
            .create(BackendDescriptor::new("foo.io", "v1", "foo:443", 1))
            .await
            .unwrap();

        let controller = controller(registry, manager.clone());
        controller.sync("v1.foo.io").await.unwrap();
        assert_eq!(*manager.calls.lock(), vec!["add v1.foo.io"]);
    }

    #[tokio::test]
    async fn test_sync_removes_missing_backend() {
        let registry = Arc::new(MemoryRegistry::new("apiregistration.aggregator.io"));
        let manager = Arc::new(RecordingManager::default());

        let controller = controller(registry, manager.clone());
        controller.sync("v1.gone.io").await.unwrap();
        assert_eq!(*manager.calls.lock(), vec!["remove v1.gone.io"]);
    }

    #[tokio::test]
    async fn test_sync_propagates_add_errors() {
        let registry = Arc::new(MemoryRegistry::new("apiregistration.aggregator.io"));
        let manager = Arc::new(RecordingManager::default());
        *manager.fail_adds.lock() = 1;
        registry
            .create(BackendDescriptor::new("foo.io", "v1", "foo:443", 1))
            .await
            .unwrap();

        let controller = controller(registry, manager.clone());
        assert!(controller.sync("v1.foo.io").await.is_err());
        assert!(manager.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_item_is_requeued_with_backoff() {
        let registry = Arc::new(MemoryRegistry::new("apiregistration.aggregator.io"));
        let manager = Arc::new(RecordingManager::default());
        *manager.fail_adds.lock() = 2;
        registry
            .create(BackendDescriptor::new("foo.io", "v1", "foo:443", 1))
            .await
            .unwrap();

        let controller = controller(registry, manager.clone());
        controller.queue().add("v1.foo.io");

        assert!(controller.process_next_work_item().await);
        assert_eq!(controller.queue().num_requeues("v1.foo.io"), 1);
        assert!(controller.process_next_work_item().await);
        assert_eq!(controller.queue().num_requeues("v1.foo.io"), 2);
        assert!(controller.process_next_work_item().await);

        assert_eq!(*manager.calls.lock(), vec!["add v1.foo.io"]);
        assert_eq!(controller.queue().num_requeues("v1.foo.io"), 0);
    }

    #[tokio::test]
    async fn test_events_enqueue_names() {
        let registry = Arc::new(MemoryRegistry::new("apiregistration.aggregator.io"));
        let manager = Arc::new(RecordingManager::default());
        let controller = controller(registry, manager);
        let descriptor = BackendDescriptor::new("foo.io", "v1", "foo:443", 1);

        controller.handle_event(&RegistryEvent::Added(descriptor.clone()));
        controller.handle_event(&RegistryEvent::Modified(descriptor.clone()));
        controller.handle_event(&RegistryEvent::Deleted(DeletedBackend::Tombstone {
            key: "v2.bar.io".to_string(),
            last_known: None,
        }));
        controller.handle_event(&RegistryEvent::Deleted(DeletedBackend::Tombstone {
            key: String::new(),
            last_known: None,
        }));

        assert_eq!(controller.queue().len(), 2);
    }
}
