//! File watcher driving workflow hot reload.
//!
//! # Responsibilities
//! - Register callbacks against files or directories
//! - Deliver filesystem events to every matching callback
//! - Stop delivering once closed
//!
//! # Design Decisions
//! - Files are watched through their parent directory so editors that
//!   replace files (write-to-temp + rename) still trigger
//! - An event matches a registration when its path equals the registered
//!   path or its parent directory equals it
//! - Callbacks run as independent tasks, cloned out of the registry first

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Zero-argument async action invoked on change.
pub type WatchCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Error type for watch registration.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("watcher is closed")]
    Closed,
    #[error("path does not exist: {path}: {source}")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create watcher: {0}")]
    Create(#[source] notify::Error),
    #[error("failed to add path to watcher: {0}")]
    Add(#[source] notify::Error),
}

/// Filesystem change notification capability.
pub trait FileWatcher: Send + Sync {
    /// Invoke `callback` whenever `path` (or, for a directory, its direct
    /// children) changes.
    fn watch(&self, path: &Path, callback: WatchCallback) -> Result<(), WatchError>;

    /// Stop watching. Idempotent.
    fn close(&self) -> Result<(), WatchError>;
}

/// Registered callbacks keyed by canonical path.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: DashMap<PathBuf, Vec<WatchCallback>>,
}

impl CallbackRegistry {
    pub fn register(&self, path: PathBuf, callback: WatchCallback) {
        self.callbacks.entry(path).or_default().push(callback);
    }

    /// Callbacks whose key equals `event_path` or its parent directory.
    pub fn matching(&self, event_path: &Path) -> Vec<WatchCallback> {
        let parent = event_path.parent();
        self.callbacks
            .iter()
            .filter(|entry| entry.key() == event_path || Some(entry.key().as_path()) == parent)
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// [`FileWatcher`] backed by the platform's native notification API.
pub struct NotifyFileWatcher {
    /// `None` once closed.
    inner: Mutex<Option<RecommendedWatcher>>,
    registry: Arc<CallbackRegistry>,
}

impl NotifyFileWatcher {
    /// Create the watcher and spawn its dispatch task. Requires a Tokio runtime.
    pub fn new() -> Result<Self, WatchError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => tracing::error!(error = %e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(WatchError::Create)?;

        let registry = Arc::new(CallbackRegistry::default());
        tokio::spawn(dispatch(event_rx, Arc::clone(&registry)));

        Ok(Self {
            inner: Mutex::new(Some(watcher)),
            registry,
        })
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }
}

impl FileWatcher for NotifyFileWatcher {
    fn watch(&self, path: &Path, callback: WatchCallback) -> Result<(), WatchError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let watcher = guard.as_mut().ok_or(WatchError::Closed)?;

        let abs = std::fs::canonicalize(path).map_err(|source| WatchError::NotFound {
            path: path.to_path_buf(),
            source,
        })?;
        let target = if abs.is_dir() {
            abs.clone()
        } else {
            abs.parent().map(Path::to_path_buf).unwrap_or_else(|| abs.clone())
        };

        self.registry.register(abs.clone(), callback);
        watcher
            .watch(&target, RecursiveMode::NonRecursive)
            .map_err(WatchError::Add)?;

        tracing::info!(path = %abs.display(), "Watching for changes");
        Ok(())
    }

    fn close(&self) -> Result<(), WatchError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            tracing::debug!("File watcher closed");
        }
        Ok(())
    }
}

/// Deliver events until the watcher (and so the sender) is dropped.
async fn dispatch(mut events: mpsc::UnboundedReceiver<Event>, registry: Arc<CallbackRegistry>) {
    while let Some(event) = events.recv().await {
        if matches!(event.kind, EventKind::Access(_)) {
            continue;
        }
        for path in &event.paths {
            for callback in registry.matching(path) {
                tokio::spawn(callback());
            }
        }
    }
    tracing::debug!("Watch dispatch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn counting(counter: Arc<AtomicUsize>) -> WatchCallback {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[test]
    fn registry_matches_path_and_parent() {
        let registry = CallbackRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        registry.register(PathBuf::from("/srv/app/workflow.yaml"), counting(hits.clone()));
        registry.register(PathBuf::from("/srv/app/resources"), counting(hits.clone()));
        registry.register(PathBuf::from("/srv/app/resources"), counting(hits));

        assert_eq!(registry.matching(Path::new("/srv/app/workflow.yaml")).len(), 1);
        assert_eq!(registry.matching(Path::new("/srv/app/resources/a.yaml")).len(), 2);
        assert_eq!(registry.matching(Path::new("/srv/app/resources")).len(), 2);
        assert!(registry.matching(Path::new("/srv/app/other.yaml")).is_empty());
        assert!(registry.matching(Path::new("/srv/app/resources/nested/b.yaml")).is_empty());
    }

    #[tokio::test]
    async fn rejects_missing_paths_and_closed_watcher() {
        let dir = TempDir::new().unwrap();
        let watcher = NotifyFileWatcher::new().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let err = watcher
            .watch(&dir.path().join("missing.yaml"), counting(hits.clone()))
            .unwrap_err();
        assert!(matches!(err, WatchError::NotFound { .. }));

        watcher.close().unwrap();
        watcher.close().unwrap();
        let err = watcher.watch(dir.path(), counting(hits)).unwrap_err();
        assert!(matches!(err, WatchError::Closed));
    }

    #[tokio::test]
    async fn file_change_invokes_callback() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("workflow.yaml");
        std::fs::write(&file, "v1").unwrap();

        let watcher = NotifyFileWatcher::new().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        watcher
            .watch(
                &file,
                Arc::new(move || {
                    let tx = tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(());
                    })
                }),
            )
            .unwrap();
        assert_eq!(watcher.registry().len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&file, "v2").unwrap();

        let fired = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await;
        assert!(matches!(fired, Ok(Some(()))));
        watcher.close().unwrap();
    }
}
