//! On-disk mirror of session metadata.
//!
//! No process survives a restart, so the mirror is informational only: it is
//! rewritten on every lifecycle event and wiped at boot.

use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;
use crate::session::SessionSummary;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode session metadata: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub const FILE_NAME: &'static str = "sessions.json";

    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(Self::FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the mirrored summaries. A missing file reads as empty.
    pub fn load(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Replace the mirror with `sessions`. Writes a sibling temp file and
    /// renames it into place so readers never see a partial file.
    pub fn write_all(&self, sessions: &[SessionSummary]) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_vec_pretty(sessions).map_err(StoreError::Encode)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|source| StoreError::Write {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }

    /// Wipe the mirror. Returns how many stale entries were discarded; an
    /// unreadable previous file counts as zero.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let stale = match self.load() {
            Ok(rows) => rows.len(),
            Err(e) => {
                tracing::warn!(%e, "discarding unreadable session metadata");
                0
            }
        };
        self.write_all(&[])?;
        Ok(stale)
    }
}

/// Rewrite the mirror whenever the registry reports a lifecycle event,
/// until `cancel` fires.
pub fn spawn_mirror(
    registry: SessionRegistry,
    store: MetadataStore,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = registry.subscribe_events();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "metadata mirror lagged, rewriting");
                        }
                        Err(RecvError::Closed) => break,
                    }
                    let sessions = registry.list(None);
                    let store = store.clone();
                    match tokio::task::spawn_blocking(move || store.write_all(&sessions)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => tracing::warn!(%e, "failed to mirror session metadata"),
                        Err(e) => tracing::error!("metadata mirror task panicked: {:?}", e),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CreateSession, RegistrySettings};
    use std::time::Duration;

    fn summary(id: &str) -> SessionSummary {
        SessionSummary {
            id: id.to_string(),
            title: "Terminal 1".to_string(),
            project: None,
            owner: "alice".to_string(),
            created_at: 1,
            last_activity: 2,
            cols: 80,
            rows: 24,
            exited: false,
            attached: 0,
        }
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(&dir.path().join("nested"));
        store.write_all(&[summary("a"), summary("b")]).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded, vec![summary("a"), summary("b")]);
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn clear_reports_stale_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        store.write_all(&[summary("a"), summary("b")]).unwrap();

        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.load().unwrap().is_empty());
        assert_eq!(store.clear().unwrap(), 0);
    }

    #[test]
    fn clear_overwrites_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        std::fs::write(store.path(), b"{not json").unwrap();

        assert!(matches!(store.load(), Err(StoreError::Parse { .. })));
        assert_eq!(store.clear().unwrap(), 0);
        assert!(store.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mirror_follows_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        let registry = SessionRegistry::new(RegistrySettings {
            shell: "/bin/sh".to_string(),
            home_dir: std::env::temp_dir(),
            ..RegistrySettings::default()
        });
        let cancel = CancellationToken::new();
        let handle = spawn_mirror(registry.clone(), store.clone(), cancel.clone());

        let session = registry
            .create(CreateSession {
                cols: 80,
                rows: 24,
                title: Some("mirrored".into()),
                project: None,
                owner: "alice".into(),
            })
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let rows = store.load().unwrap_or_default();
            if rows.iter().any(|s| s.id == session.id() && s.title == "mirrored") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "mirror never written");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        registry.destroy(session.id());
        loop {
            if store.load().map(|rows| rows.is_empty()).unwrap_or(false) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "mirror never cleared");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
    }
}
