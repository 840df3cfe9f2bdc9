//! Desired-state persistence

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{PanelError, PanelResult};
use crate::model::Snapshot;

/// Durable home of the snapshot
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the snapshot; `NotFound` when nothing was saved yet
    async fn load(&self) -> PanelResult<Snapshot>;

    /// Persist the snapshot atomically
    async fn save(&self, snapshot: &Snapshot) -> PanelResult<()>;
}

/// Pretty-printed JSON file, replaced atomically on every save
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "db.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> PanelResult<Snapshot> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PanelError::NotFound(format!("{}", self.path.display())));
            }
            Err(e) => {
                return Err(PanelError::Store(format!(
                    "Failed to read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        serde_json::from_str(&content)
            .map_err(|e| {
                PanelError::Store(format!("Failed to parse {}: {}", self.path.display(), e))
            })
    }

    async fn save(&self, snapshot: &Snapshot) -> PanelResult<()> {
        use std::os::unix::fs::PermissionsExt;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.temp_path();

        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| PanelError::Store(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| {
                PanelError::Store(format!("Failed to replace {}: {}", self.path.display(), e))
            })?;

        debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

/// In-process store, counting saves
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Option<Snapshot>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: Mutex::new(Some(snapshot)),
            saves: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every following save fail until switched back
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Last saved snapshot
    pub fn current(&self) -> Option<Snapshot> {
        self.snapshot.lock().ok().and_then(|s| s.clone())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> PanelResult<Snapshot> {
        self.current()
            .ok_or_else(|| PanelError::NotFound("no snapshot saved".to_string()))
    }

    async fn save(&self, snapshot: &Snapshot) -> PanelResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(PanelError::Store("memory store refused the save".to_string()));
        }
        let mut slot = self
            .snapshot
            .lock()
            .map_err(|_| PanelError::Store("memory store poisoned".to_string()))?;
        *slot = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
