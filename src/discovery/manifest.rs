//! # Backend Manifest Loader
//!
//! Loads backend descriptors from a YAML file into a [`BackendStore`] and,
//! optionally, reapplies the file whenever it changes on disk.
//!
//! ```yaml
//! backends:
//!   - name: v1beta1.metrics.example.io
//!     group: metrics.example.io
//!     version: v1beta1
//!     internalHost: metrics.monitoring.svc:443
//!     priority: 100
//!     caBundle: LS0tLS1CRUdJTi...
//! ```
//!
//! Entries that fail validation are logged and skipped; a previously applied
//! copy of a rejected entry stays in place. Entries this loader applied and
//! that disappear from the file are deleted from the store.

use notify::{recommended_watcher, Event, EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::error::{AggregatorError, AggregatorResult};
use crate::core::types::BackendDescriptor;
use crate::discovery::registry::BackendStore;

/// On-disk manifest format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendManifest {
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
}

/// Outcome of one manifest load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSummary {
    pub applied: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub removed: usize,
}

pub struct ManifestSource {
    path: PathBuf,
    store: Arc<dyn BackendStore>,
    /// Names this loader has written to the store
    owned: Mutex<HashSet<String>>,
}

impl ManifestSource {
    pub fn new(path: impl Into<PathBuf>, store: Arc<dyn BackendStore>) -> Self {
        Self {
            path: path.into(),
            store,
            owned: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the manifest and reconcile the store with it
    pub async fn load(&self) -> AggregatorResult<ManifestSummary> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            AggregatorError::config(format!(
                "Failed to read backend manifest {}: {}",
                self.path.display(),
                e
            ))
        })?;
        let manifest: BackendManifest = serde_yaml::from_str(&content)?;

        // Held for the whole pass so overlapping reloads apply in order.
        let mut owned = self.owned.lock().await;
        let mut summary = ManifestSummary::default();
        let mut now_owned = HashSet::new();

        for descriptor in manifest.backends {
            let name = descriptor.name.clone();
            match self.store.apply(descriptor).await {
                Ok(true) => {
                    summary.applied += 1;
                    now_owned.insert(name);
                }
                Ok(false) => {
                    summary.unchanged += 1;
                    now_owned.insert(name);
                }
                Err(e) => {
                    error!(backend = %name, error = %e, "Rejected manifest entry");
                    summary.rejected += 1;
                    if owned.contains(&name) {
                        now_owned.insert(name);
                    }
                }
            }
        }

        for stale in owned.difference(&now_owned) {
            match self.store.delete(stale).await {
                Ok(_) => summary.removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(backend = %stale, error = %e, "Failed to remove backend dropped from manifest"),
            }
        }
        *owned = now_owned;

        info!(
            path = %self.path.display(),
            applied = summary.applied,
            unchanged = summary.unchanged,
            rejected = summary.rejected,
            removed = summary.removed,
            "Backend manifest loaded"
        );
        Ok(summary)
    }

    /// Reload the manifest whenever it changes, until `shutdown` fires.
    ///
    /// The parent directory is watched rather than the file, so editors that
    /// write a temporary file and rename it are picked up too.
    pub fn watch(self: Arc<Self>, shutdown: CancellationToken) -> AggregatorResult<JoinHandle<()>> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| AggregatorError::config(format!("Failed to create manifest watcher: {}", e)))?;

        let watch_dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| AggregatorError::config(format!("Failed to watch manifest directory: {}", e)))?;

        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| AggregatorError::config("Invalid backend manifest path"))?
            .to_owned();

        info!(path = %self.path.display(), "Watching backend manifest for changes");

        Ok(tokio::spawn(async move {
            // The watcher stops delivering events once dropped.
            let _watcher = watcher;

            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let touches_manifest = event
                    .paths
                    .iter()
                    .any(|path| path.file_name() == Some(file_name.as_os_str()));
                if !touches_manifest || !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }

                // Let the write settle and fold the burst of events it caused.
                tokio::time::sleep(Duration::from_millis(100)).await;
                while rx.try_recv().is_ok() {}

                debug!(path = %self.path.display(), "Backend manifest changed, reloading");
                if let Err(e) = self.load().await {
                    error!(error = %e, "Failed to reload backend manifest");
                }
            }
            debug!("Backend manifest watcher stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::memory::MemoryRegistry;
    use crate::discovery::registry::BackendRegistry;

    const MANIFEST: &str = r#"
backends:
  - name: v1.foo.io
    group: foo.io
    version: v1
    internalHost: "foo.svc:443"
    priority: 10
  - name: v1.bar.io
    group: bar.io
    version: v1
    internalHost: "bar.svc:443"
    priority: 20
  - name: broken
    group: baz.io
    version: v1
    internalHost: "baz.svc"
    priority: 0
"#;

    #[tokio::test]
    async fn test_load_applies_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backends.yaml");
        tokio::fs::write(&path, MANIFEST).await.unwrap();

        let registry = Arc::new(MemoryRegistry::new("apiregistration.aggregator.io"));
        let source = ManifestSource::new(&path, registry.clone());

        let summary = source.load().await.unwrap();
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(registry.len(), 2);

        let again = source.load().await.unwrap();
        assert_eq!(again.unchanged, 2);
        assert_eq!(again.applied, 0);
    }

    #[tokio::test]
    async fn test_reload_removes_dropped_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backends.yaml");
        tokio::fs::write(&path, MANIFEST).await.unwrap();

        let registry = Arc::new(MemoryRegistry::new("apiregistration.aggregator.io"));
        // Registered out of band; the manifest does not own it.
        registry
            .create(BackendDescriptor::new("other.io", "v1", "other:443", 1))
            .await
            .unwrap();

        let source = ManifestSource::new(&path, registry.clone());
        source.load().await.unwrap();

        tokio::fs::write(
            &path,
            "backends:\n  - {name: v1.foo.io, group: foo.io, version: v1, internalHost: 'foo.svc:443', priority: 10}\n",
        )
        .await
        .unwrap();
        let summary = source.load().await.unwrap();
        assert_eq!(summary.removed, 1);

        assert!(registry.get("v1.bar.io").await.unwrap_err().is_not_found());
        assert!(registry.get("v1.foo.io").await.is_ok());
        assert!(registry.get("v1.other.io").await.is_ok());
    }

    #[tokio::test]
    async fn test_unparsable_manifest_leaves_store_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backends.yaml");
        tokio::fs::write(&path, MANIFEST).await.unwrap();

        let registry = Arc::new(MemoryRegistry::new("apiregistration.aggregator.io"));
        let source = ManifestSource::new(&path, registry.clone());
        source.load().await.unwrap();

        tokio::fs::write(&path, "backends: [not: valid: yaml").await.unwrap();
        assert!(source.load().await.is_err());
        assert_eq!(registry.len(), 2);
    }
}
