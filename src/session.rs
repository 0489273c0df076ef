use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::activity::{epoch_ms, ActivityTracker};
use crate::coalescer::{CoalesceConfig, OutputSink, Pump};
use crate::pty::{ProcessHandle, PtyError, SpawnOptions};
use crate::registry::SessionEvent;
use crate::scrollback::Scrollback;

/// Appended to scrollback and sent to viewers once the process is gone.
pub const EXIT_MARKER: &[u8] = b"\r\n[Process exited]\r\n";

/// Identifies one viewer connection across the sessions it attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Pushed to an attached viewer, in per-session emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerEvent {
    /// Scrollback contents at attach time.
    Replay { session_id: String, data: Bytes },
    /// Live output.
    Output { session_id: String, data: Bytes },
    /// The process has exited.
    Exited { session_id: String },
    /// The session was destroyed; the attachment is over.
    Closed { session_id: String },
}

/// Client-facing view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub project: Option<String>,
    pub owner: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Milliseconds since the Unix epoch.
    pub last_activity: u64,
    pub cols: u16,
    pub rows: u16,
    pub exited: bool,
    pub attached: usize,
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub id: String,
    /// Creation sequence number, used to order sessions created in the same millisecond.
    pub seq: u64,
    pub owner: String,
    pub title: String,
    pub project: Option<String>,
    pub spawn: SpawnOptions,
    pub scrollback_bytes: usize,
    pub coalesce: CoalesceConfig,
}

struct SessionState {
    title: String,
    cols: u16,
    rows: u16,
    exited: bool,
    destroyed: bool,
    scrollback: Scrollback,
    viewers: HashMap<ConnectionId, mpsc::UnboundedSender<ViewerEvent>>,
}

impl SessionState {
    /// Send to every viewer, pruning those whose receiving end is gone.
    fn broadcast(&mut self, event: &ViewerEvent) {
        self.viewers.retain(|conn, tx| {
            let alive = tx.send(event.clone()).is_ok();
            if !alive {
                tracing::debug!(%conn, "pruning closed viewer");
            }
            alive
        });
    }
}

struct SessionInner {
    id: String,
    seq: u64,
    owner: String,
    project: Option<String>,
    created_at: u64,
    state: Mutex<SessionState>,
    process: ProcessHandle,
    activity: ActivityTracker,
    pump: Arc<Pump<SessionSink>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

/// One shell process plus its scrollback and attached viewers.
///
/// Cheap to clone; clones refer to the same session. All mutable state sits
/// behind one per-session mutex, so attach, detach, input, resize, kill and
/// output flushes are serialized per session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("owner", &self.inner.owner)
            .field("pid", &self.inner.process.pid())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the shell and start the output pump.
    ///
    /// Runs blocking PTY setup; callers on the async runtime should go
    /// through `spawn_blocking`. Must be called within a tokio runtime.
    pub fn spawn(
        params: SessionParams,
        events_tx: broadcast::Sender<SessionEvent>,
    ) -> Result<Self, PtyError> {
        let (process, process_rx) = ProcessHandle::spawn(&params.spawn)?;

        let inner = Arc::new_cyclic(|weak| SessionInner {
            id: params.id,
            seq: params.seq,
            owner: params.owner,
            project: params.project,
            created_at: epoch_ms(SystemTime::now()),
            state: Mutex::new(SessionState {
                title: params.title,
                cols: params.spawn.cols,
                rows: params.spawn.rows,
                exited: false,
                destroyed: false,
                scrollback: Scrollback::new(params.scrollback_bytes),
                viewers: HashMap::new(),
            }),
            process,
            activity: ActivityTracker::new(),
            pump: Pump::new(process_rx, params.coalesce, SessionSink(weak.clone())),
            events_tx,
        });

        tokio::spawn(inner.pump.clone().run());

        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn project(&self) -> Option<&str> {
        self.inner.project.as_deref()
    }

    pub fn created_at(&self) -> u64 {
        self.inner.created_at
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.process.pid()
    }

    pub fn title(&self) -> String {
        self.inner.state.lock().title.clone()
    }

    pub fn is_exited(&self) -> bool {
        self.inner.state.lock().exited
    }

    pub fn attached_count(&self) -> usize {
        self.inner.state.lock().viewers.len()
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.activity.idle_for()
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.inner.state.lock();
        self.summary_locked(&state)
    }

    fn summary_locked(&self, state: &SessionState) -> SessionSummary {
        SessionSummary {
            id: self.inner.id.clone(),
            title: state.title.clone(),
            project: self.inner.project.clone(),
            owner: self.inner.owner.clone(),
            created_at: self.inner.created_at,
            last_activity: self.inner.activity.last_activity_ms(),
            cols: state.cols,
            rows: state.rows,
            exited: state.exited,
            attached: state.viewers.len(),
        }
    }

    /// Attach a viewer.
    ///
    /// The replay (when requested and non-empty) is queued before the viewer
    /// joins the fan-out set, under the same lock, so live output follows it
    /// with no gap or overlap. An already-exited session also queues the
    /// exit signal. Returns `None` if the session has been destroyed.
    pub fn attach(
        &self,
        conn: ConnectionId,
        size: Option<(u16, u16)>,
        replay: bool,
    ) -> Option<(SessionSummary, mpsc::UnboundedReceiver<ViewerEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let summary = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return None;
            }
            if let Some((cols, rows)) = size {
                self.resize_locked(&mut state, cols, rows);
            }
            if replay && !state.scrollback.is_empty() {
                let _ = tx.send(ViewerEvent::Replay {
                    session_id: self.inner.id.clone(),
                    data: state.scrollback.snapshot(),
                });
            }
            if state.exited {
                let _ = tx.send(ViewerEvent::Exited {
                    session_id: self.inner.id.clone(),
                });
            }
            state.viewers.insert(conn, tx);
            self.summary_locked(&state)
        };
        self.inner.activity.touch();
        tracing::debug!(session = %self.inner.id, %conn, attached = summary.attached, "viewer attached");
        Some((summary, rx))
    }

    /// Remove a viewer. Never affects the process.
    pub fn detach(&self, conn: ConnectionId) -> bool {
        let removed = self.inner.state.lock().viewers.remove(&conn).is_some();
        if removed {
            self.inner.activity.touch();
            tracing::debug!(session = %self.inner.id, %conn, "viewer detached");
        }
        removed
    }

    /// Forward input to the process. Dropped once the session has exited.
    pub fn write(&self, data: Bytes) -> bool {
        if self.inner.state.lock().exited {
            return false;
        }
        let sent = self.inner.process.write(data);
        if sent {
            self.inner.activity.touch();
        }
        sent
    }

    /// Resize the terminal. Ignored when exited or when either dimension is zero.
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        let resized = {
            let mut state = self.inner.state.lock();
            self.resize_locked(&mut state, cols, rows)
        };
        if resized {
            self.inner.activity.touch();
        }
        resized
    }

    fn resize_locked(&self, state: &mut SessionState, cols: u16, rows: u16) -> bool {
        if state.exited || cols == 0 || rows == 0 {
            return false;
        }
        if let Err(e) = self.inner.process.resize(cols, rows) {
            tracing::warn!(session = %self.inner.id, ?e, "resize failed");
            return false;
        }
        state.cols = cols;
        state.rows = rows;
        true
    }

    /// Terminate the process and run the exit path. Output already read from
    /// the process is delivered ahead of the exit marker.
    pub fn kill(&self) {
        self.inner.process.terminate();
        self.inner.pump.finish_now();
        self.finish_exit();
    }

    /// Kill the process and tell every viewer the session is gone. After
    /// this, [`Session::attach`] fails.
    pub fn close(&self) {
        self.kill();
        let mut state = self.inner.state.lock();
        state.destroyed = true;
        state.broadcast(&ViewerEvent::Closed {
            session_id: self.inner.id.clone(),
        });
        state.viewers.clear();
    }

    /// Mark the session as destroyed if nobody is attached and it has
    /// either exited or been idle for at least `idle_timeout`.
    ///
    /// The check and the claim happen under the session lock, so a viewer
    /// attaching concurrently either lands first (and the claim fails) or
    /// finds the session destroyed.
    pub fn try_claim_for_reaping(&self, idle_timeout: Duration) -> bool {
        let mut state = self.inner.state.lock();
        if state.destroyed || !state.viewers.is_empty() {
            return false;
        }
        if state.exited || self.inner.activity.idle_for() >= idle_timeout {
            state.destroyed = true;
            return true;
        }
        false
    }

    pub(crate) fn set_title(&self, title: String) -> SessionSummary {
        let mut state = self.inner.state.lock();
        state.title = title;
        self.summary_locked(&state)
    }

    /// The single exit path, shared by natural exit and explicit kill.
    fn finish_exit(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.exited {
                return;
            }
            state.exited = true;
            let marker = Bytes::from_static(EXIT_MARKER);
            state.scrollback.append(&marker);
            state.broadcast(&ViewerEvent::Output {
                session_id: self.inner.id.clone(),
                data: marker,
            });
            state.broadcast(&ViewerEvent::Exited {
                session_id: self.inner.id.clone(),
            });
        }
        tracing::info!(session = %self.inner.id, "session process exited");
        let _ = self.inner.events_tx.send(SessionEvent::Exited {
            id: self.inner.id.clone(),
        });
    }

    fn deliver(&self, data: Bytes) {
        {
            let mut state = self.inner.state.lock();
            // Nothing follows the exit marker.
            if state.exited {
                return;
            }
            state.scrollback.append(&data);
            state.broadcast(&ViewerEvent::Output {
                session_id: self.inner.id.clone(),
                data,
            });
        }
        self.inner.activity.touch();
    }
}

/// Coalescer output target. Holds the session weakly so an abandoned
/// session isn't kept alive by its own pump.
struct SessionSink(Weak<SessionInner>);

impl SessionSink {
    fn session(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl OutputSink for SessionSink {
    fn deliver(&self, data: Bytes) {
        if let Some(session) = self.session() {
            session.deliver(data);
        }
    }

    fn finish(&self) {
        if let Some(session) = self.session() {
            session.finish_exit();
        }
    }
}

/// Working directory for a new session: `projects_root/<project>` when the
/// project names an existing directory directly under the root, else `home`.
pub fn resolve_cwd(home: &Path, projects_root: Option<&Path>, project: Option<&str>) -> PathBuf {
    let (Some(root), Some(project)) = (projects_root, project) else {
        return home.to_path_buf();
    };
    let mut components = Path::new(project).components();
    let single_normal = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single_normal {
        tracing::warn!(project, "ignoring project tag that is not a plain directory name");
        return home.to_path_buf();
    }
    let candidate = root.join(project);
    if candidate.is_dir() {
        candidate
    } else {
        home.to_path_buf()
    }
}
