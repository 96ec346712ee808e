//! Scratch storage for uploaded files.
//!
//! # Responsibilities
//! - Persist upload content under a content+time derived ID
//! - Index stored files in memory for lookup and deletion
//! - Expire files older than a TTL from a background sweep
//! - Remove everything on close
//!
//! # Design Decisions
//! - File names are reduced to their base name before hitting disk
//! - Files are written owner-only (0600)
//! - Sweep failures are ignored; the next tick retries

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

/// Error type for file store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create upload directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("failed to write file: {0}")]
    Write(#[source] std::io::Error),
    #[error("failed to delete file: {0}")]
    Delete(#[source] std::io::Error),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file store is closed")]
    Closed,
}

/// Metadata for a stored upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub id: String,
    /// Base name of the original filename.
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub path: PathBuf,
    pub uploaded_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

/// Storage backend for uploaded files.
pub trait FileStore: Send + Sync {
    fn store(&self, filename: &str, content: &[u8], content_type: &str)
        -> Result<UploadedFile, StoreError>;
    fn get(&self, id: &str) -> Result<UploadedFile, StoreError>;
    fn path(&self, id: &str) -> Result<PathBuf, StoreError>;
    fn delete(&self, id: &str) -> Result<(), StoreError>;
    /// Remove every file whose age is at least `ttl`.
    fn cleanup(&self, ttl: Duration) -> Result<(), StoreError>;
    /// Stop background work and remove all files. Idempotent.
    fn close(&self) -> Result<(), StoreError>;
}

/// Disk-backed [`FileStore`] under a dedicated directory.
pub struct TemporaryFileStore {
    base_dir: PathBuf,
    files: DashMap<String, UploadedFile>,
    closed: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl TemporaryFileStore {
    /// Create the store, creating `base_dir` if needed.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Arc<Self>, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(StoreError::CreateDir)?;
        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            base_dir,
            files: DashMap::new(),
            closed: AtomicBool::new(false),
            stop_tx,
        }))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Spawn the periodic sweep. The task ends when the store is closed or dropped.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration, ttl: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(store) = weak.upgrade() else { break };
                        if let Err(e) = store.cleanup(ttl) {
                            tracing::warn!(error = %e, "Upload cleanup failed");
                        }
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            tracing::debug!("Upload cleanup loop stopped");
        });
    }

    fn remove_entry(&self, file: &UploadedFile) {
        if let Err(e) = fs::remove_file(&file.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %file.path.display(), error = %e, "Failed to remove upload");
            }
        }
    }

    fn record_active(&self) {
        metrics::gauge!("gateway_upload_files_active").set(self.files.len() as f64);
    }
}

/// `hex(sha256(content ++ now))[..16]`.
fn generate_id(content: &[u8], now: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.update(now.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Strip any directory component from a client-supplied filename.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    match base {
        "" | "." | ".." => "upload".to_string(),
        name => name.to_string(),
    }
}

fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.flush()
}

impl FileStore for TemporaryFileStore {
    fn store(
        &self,
        filename: &str,
        content: &[u8],
        content_type: &str,
    ) -> Result<UploadedFile, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }

        let now = Utc::now();
        let id = generate_id(content, &now);
        let filename = sanitize_filename(filename);
        let path = self.base_dir.join(format!("{}_{}", id, filename));

        write_private(&path, content).map_err(StoreError::Write)?;

        let file = UploadedFile {
            id: id.clone(),
            filename,
            content_type: content_type.to_string(),
            size: content.len() as u64,
            path,
            uploaded_at: now,
            metadata: HashMap::new(),
        };
        self.files.insert(id, file.clone());
        metrics::counter!("gateway_uploads_total").increment(1);
        self.record_active();

        tracing::debug!(id = %file.id, filename = %file.filename, size = file.size, "Upload stored");
        Ok(file)
    }

    fn get(&self, id: &str) -> Result<UploadedFile, StoreError> {
        self.files
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn path(&self, id: &str) -> Result<PathBuf, StoreError> {
        self.get(id).map(|file| file.path)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let file = self
            .get(id)
            .map_err(|_| StoreError::NotFound(id.to_string()))?;

        match fs::remove_file(&file.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Delete(e)),
        }
        self.files.remove(id);
        self.record_active();
        Ok(())
    }

    fn cleanup(&self, ttl: Duration) -> Result<(), StoreError> {
        let now = Utc::now();
        let expired: Vec<UploadedFile> = self
            .files
            .iter()
            .filter(|entry| {
                let age = now.signed_duration_since(entry.uploaded_at);
                age.to_std().map(|age| age >= ttl).unwrap_or(ttl.is_zero())
            })
            .map(|entry| entry.value().clone())
            .collect();

        for file in &expired {
            self.remove_entry(file);
            self.files.remove(&file.id);
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "Expired uploads removed");
            self.record_active();
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.stop_tx.send(true);

        let remaining: Vec<UploadedFile> =
            self.files.iter().map(|entry| entry.value().clone()).collect();
        for file in &remaining {
            self.remove_entry(file);
        }
        self.files.clear();
        self.record_active();
        tracing::info!(removed = remaining.len(), "File store closed");
        Ok(())
    }
}
