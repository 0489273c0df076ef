use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::coalescer::CoalesceConfig;
use crate::pty::{default_env, resolve_shell, PtyError, SpawnOptions};
use crate::scrollback::DEFAULT_SCROLLBACK_BYTES;
use crate::session::{resolve_cwd, Session, SessionParams, SessionSummary};

/// Longest accepted session title, in characters.
pub const MAX_TITLE_CHARS: usize = 128;

/// Server-level session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: String },
    Renamed { id: String, title: String },
    Exited { id: String },
    Destroyed { id: String },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("maximum number of sessions reached ({max})")]
    CapacityExceeded { max: usize },
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("failed to spawn session: {0}")]
    SpawnFailed(#[from] PtyError),
    #[error("invalid title: {0}")]
    InvalidTitle(String),
    #[error("server is shutting down")]
    ShuttingDown,
}

/// Limits and process defaults applied to every session.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub max_sessions: usize,
    pub scrollback_bytes: usize,
    pub coalesce: CoalesceConfig,
    pub shell: String,
    pub home_dir: PathBuf,
    pub projects_root: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl RegistrySettings {
    pub const DEFAULT_MAX_SESSIONS: usize = 10;
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_sessions: Self::DEFAULT_MAX_SESSIONS,
            scrollback_bytes: DEFAULT_SCROLLBACK_BYTES,
            coalesce: CoalesceConfig::default(),
            shell: resolve_shell(None),
            home_dir: dirs::home_dir().unwrap_or_else(std::env::temp_dir),
            projects_root: None,
            env: default_env(),
        }
    }
}

/// A request to create a session.
#[derive(Debug, Clone)]
pub struct CreateSession {
    pub cols: u16,
    pub rows: u16,
    pub title: Option<String>,
    pub project: Option<String>,
    pub owner: String,
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    next_seq: u64,
    draining: bool,
}

/// Bounded collection of live sessions keyed by id.
///
/// The map lock is never held across process spawn or per-session work.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    settings: Arc<RegistrySettings>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}

impl SessionRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                next_seq: 0,
                draining: false,
            })),
            settings: Arc::new(settings),
            events_tx,
        }
    }

    /// Spawn a new session and register it.
    ///
    /// The capacity check up front is advisory and only avoids a pointless
    /// fork/exec. The authoritative check happens at insertion under the
    /// write lock; a session that loses that race is killed before the
    /// error is returned, so the ceiling is never exceeded.
    pub async fn create(&self, req: CreateSession) -> Result<Session, RegistryError> {
        let title = req.title.as_deref().map(validate_title).transpose()?;
        let project = req
            .project
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        let max = self.settings.max_sessions;
        let seq = {
            let mut inner = self.inner.write();
            if inner.draining {
                return Err(RegistryError::ShuttingDown);
            }
            if inner.sessions.len() >= max {
                return Err(RegistryError::CapacityExceeded { max });
            }
            inner.next_seq += 1;
            inner.next_seq
        };

        let id = uuid::Uuid::new_v4().to_string();
        let cwd = resolve_cwd(
            &self.settings.home_dir,
            self.settings.projects_root.as_deref(),
            project.as_deref(),
        );
        let params = SessionParams {
            id: id.clone(),
            seq,
            owner: req.owner,
            title: title.unwrap_or_else(|| format!("Terminal {seq}")),
            project,
            spawn: SpawnOptions {
                shell: self.settings.shell.clone(),
                cwd,
                cols: req.cols.max(1),
                rows: req.rows.max(1),
                env: self.settings.env.clone(),
            },
            scrollback_bytes: self.settings.scrollback_bytes,
            coalesce: self.settings.coalesce,
        };

        let events_tx = self.events_tx.clone();
        let session = tokio::task::spawn_blocking(move || Session::spawn(params, events_tx))
            .await
            .map_err(|e| PtyError::SpawnCommand(anyhow::Error::new(e)))??;

        let refused = {
            let mut inner = self.inner.write();
            if inner.draining {
                Some(RegistryError::ShuttingDown)
            } else if inner.sessions.len() >= max {
                Some(RegistryError::CapacityExceeded { max })
            } else {
                inner.sessions.insert(id.clone(), session.clone());
                None
            }
        };
        if let Some(err) = refused {
            tracing::warn!(session = %id, %err, "session refused at insertion, killing it");
            session.close();
            return Err(err);
        }

        tracing::info!(
            session = %id,
            owner = %session.owner(),
            pid = ?session.pid(),
            "session created"
        );
        let _ = self.events_tx.send(SessionEvent::Created { id });
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().sessions.get(id).cloned()
    }

    /// Summaries ordered by creation time, optionally restricted to one owner.
    pub fn list(&self, owner: Option<&str>) -> Vec<SessionSummary> {
        let mut sessions: Vec<Session> = {
            let inner = self.inner.read();
            inner
                .sessions
                .values()
                .filter(|s| owner.map_or(true, |o| s.owner() == o))
                .cloned()
                .collect()
        };
        sessions.sort_by_key(|s| (s.created_at(), s.seq()));
        sessions.iter().map(Session::summary).collect()
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Session> {
        self.inner.read().sessions.values().cloned().collect()
    }

    /// Remove a session and kill its process. Returns `false` if it wasn't
    /// registered, which is not an error.
    pub fn destroy(&self, id: &str) -> bool {
        let removed = self.inner.write().sessions.remove(id);
        match removed {
            Some(session) => {
                session.close();
                tracing::info!(session = %id, "session destroyed");
                let _ = self.events_tx.send(SessionEvent::Destroyed { id: id.to_string() });
                true
            }
            None => false,
        }
    }

    pub fn rename(&self, id: &str, title: &str) -> Result<SessionSummary, RegistryError> {
        let title = validate_title(title)?;
        let session = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let summary = session.set_title(title.clone());
        let _ = self.events_tx.send(SessionEvent::Renamed {
            id: id.to_string(),
            title,
        });
        Ok(summary)
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and kill every session. Creates that are in flight when this
    /// runs are refused at insertion.
    ///
    /// Returns the number of sessions drained.
    pub fn drain(&self) -> usize {
        let drained: Vec<(String, Session)> = {
            let mut inner = self.inner.write();
            inner.draining = true;
            inner.sessions.drain().collect()
        };
        for (id, session) in &drained {
            session.close();
            let _ = self.events_tx.send(SessionEvent::Destroyed { id: id.clone() });
        }
        if !drained.is_empty() {
            tracing::info!(count = drained.len(), "drained sessions");
        }
        drained.len()
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

/// Trim a title and check its length.
pub fn validate_title(title: &str) -> Result<String, RegistryError> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(RegistryError::InvalidTitle("title must not be empty".into()));
    }
    let chars = trimmed.chars().count();
    if chars > MAX_TITLE_CHARS {
        return Err(RegistryError::InvalidTitle(format!(
            "title too long ({chars} chars, max {MAX_TITLE_CHARS})"
        )));
    }
    Ok(trimmed.to_string())
}
