use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Capacity of the process event channel. The reader thread uses
/// `blocking_send`, so a stalled consumer pushes back on the child through
/// the kernel PTY buffer instead of dropping output.
const EVENT_CHANNEL_CAPACITY: usize = 256;

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),
}

/// What to run inside a new pseudo-terminal.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub shell: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Applied on top of the inherited host environment.
    pub env: Vec<(String, String)>,
}

/// Environment overrides applied to every spawned shell.
pub fn default_env() -> Vec<(String, String)> {
    vec![
        ("TERM".to_string(), "xterm-256color".to_string()),
        ("COLORTERM".to_string(), "truecolor".to_string()),
        ("LANG".to_string(), "C.UTF-8".to_string()),
    ]
}

/// Resolve the shell to spawn: explicit configuration, then `$SHELL`, then `/bin/sh`.
pub fn resolve_shell(configured: Option<&str>) -> String {
    match configured {
        Some(shell) => shell.to_string(),
        None => std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
    }
}

/// Events produced by a running process, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk read from the PTY master.
    Output(Bytes),
    /// The PTY reader reached end-of-stream.
    Eof,
    /// The child process exited (reported by the exit watcher).
    Exited,
}

/// Thin wrapper over an opened PTY with a spawned child.
///
/// The slave side is dropped right after spawning so that the master sees
/// end-of-stream once the child (and anything holding its terminal) is gone.
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Option<Box<dyn Child + Send + Sync>>,
}

impl Pty {
    pub fn spawn(opts: &SpawnOptions) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(opts.cols, opts.rows))
            .map_err(PtyError::OpenPty)?;

        let mut cmd = CommandBuilder::new(&opts.shell);
        cmd.cwd(&opts.cwd);
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let child = pair.slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child: Some(child),
        })
    }

    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        self.master.try_clone_reader().map_err(PtyError::CloneReader)
    }

    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>, PtyError> {
        self.master.take_writer().map_err(PtyError::TakeWriter)
    }

    /// Take ownership of the child handle. Returns `None` on the second call.
    pub fn take_child(&mut self) -> Option<Box<dyn Child + Send + Sync>> {
        self.child.take()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(cols, rows))
            .map_err(PtyError::Resize)
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A live shell process: input goes in through [`ProcessHandle::write`],
/// output and lifecycle come out of the receiver returned by
/// [`ProcessHandle::spawn`].
pub struct ProcessHandle {
    pid: Option<u32>,
    pty: Mutex<Pty>,
    input_tx: mpsc::UnboundedSender<Bytes>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Spawn the process and its three blocking helpers (reader, writer,
    /// exit watcher). Must be called from within a tokio runtime.
    pub fn spawn(
        opts: &SpawnOptions,
    ) -> Result<(Self, mpsc::Receiver<ProcessEvent>), PtyError> {
        let mut pty = Pty::spawn(opts)?;
        let reader = pty.take_reader()?;
        let writer = pty.take_writer()?;
        let child = pty
            .take_child()
            .ok_or_else(|| PtyError::SpawnCommand(anyhow::anyhow!("child handle missing")))?;
        let pid = child.process_id();
        let killer = child.clone_killer();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::unbounded_channel::<Bytes>();
        let exited = Arc::new(AtomicBool::new(false));

        spawn_reader(reader, events_tx.clone());
        spawn_writer(writer, input_rx);
        spawn_exit_watcher(child, exited.clone(), events_tx);

        Ok((
            Self {
                pid,
                pty: Mutex::new(pty),
                input_tx,
                killer: Mutex::new(killer),
                exited,
            },
            events_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Queue bytes for the child's stdin. Returns `false` if the writer is gone.
    pub fn write(&self, data: Bytes) -> bool {
        self.input_tx.send(data).is_ok()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.pty.lock().resize(cols, rows)
    }

    /// Kill the child and its process group.
    ///
    /// Skipped once the exit watcher has seen the child go, so a recycled
    /// PID is never signalled.
    pub fn terminate(&self) {
        if self.has_exited() {
            tracing::debug!(pid = ?self.pid, "child already exited, skipping kill");
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            if pid != 0 && pid <= i32::MAX as u32 {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGKILL);
                }
            }
        }
        if let Err(e) = self.killer.lock().kill() {
            tracing::debug!(pid = ?self.pid, ?e, "child kill returned error");
        }
    }
}

fn spawn_reader(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<ProcessEvent>) {
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut buf = [0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let data = Bytes::copy_from_slice(&buf[..n]);
                        if tx.blocking_send(ProcessEvent::Output(data)).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once the slave side is gone
                    Err(_) => break,
                }
            }
            let _ = tx.blocking_send(ProcessEvent::Eof);
        }));
        if let Err(e) = result {
            tracing::error!("PTY reader task panicked: {:?}", e);
        }
    });
}

fn spawn_writer(mut writer: Box<dyn Write + Send>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            while let Some(data) = rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        }));
        if let Err(e) = result {
            tracing::error!("PTY writer task panicked: {:?}", e);
        }
    });
}

fn spawn_exit_watcher(
    mut child: Box<dyn Child + Send + Sync>,
    exited: Arc<AtomicBool>,
    tx: mpsc::Sender<ProcessEvent>,
) {
    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            match child.wait() {
                Ok(status) => tracing::debug!(?status, "session child exited"),
                Err(e) => tracing::error!(?e, "error waiting for session child"),
            }
        }));
        if let Err(e) = result {
            tracing::error!("child exit monitor task panicked: {:?}", e);
        }
        exited.store(true, Ordering::Release);
        let _ = tx.blocking_send(ProcessEvent::Exited);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh_options() -> SpawnOptions {
        SpawnOptions {
            shell: "/bin/sh".to_string(),
            cwd: std::env::temp_dir(),
            cols: 80,
            rows: 24,
            env: default_env(),
        }
    }

    /// Collect output until `needle` shows up or the deadline passes.
    async fn read_until(rx: &mut mpsc::Receiver<ProcessEvent>, needle: &str) -> String {
        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if let ProcessEvent::Output(data) = event {
                collected.extend_from_slice(&data);
                if String::from_utf8_lossy(&collected).contains(needle) {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }

    async fn wait_for_exit(rx: &mut mpsc::Receiver<ProcessEvent>) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            if event == ProcessEvent::Exited {
                return true;
            }
        }
        false
    }

    #[test]
    fn resolve_shell_prefers_configured() {
        assert_eq!(resolve_shell(Some("/bin/bash")), "/bin/bash");
    }

    #[test]
    fn default_env_sets_terminal_type() {
        let env = default_env();
        assert!(env.iter().any(|(k, v)| k == "TERM" && v == "xterm-256color"));
        assert!(env.iter().any(|(k, _)| k == "LANG"));
    }

    #[tokio::test]
    async fn spawn_echoes_written_input() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh_options()).expect("spawn sh");
        assert!(handle.pid().is_some());

        assert!(handle.write(Bytes::from_static(b"echo pty-$((40+2))\n")));
        let output = read_until(&mut rx, "pty-42").await;
        assert!(output.contains("pty-42"), "got: {output}");
        handle.terminate();
    }

    #[tokio::test]
    async fn spawn_applies_env_overrides() {
        let mut opts = sh_options();
        opts.env.push(("TERMHUB_TEST_VAR".to_string(), "from-env".to_string()));
        let (handle, mut rx) = ProcessHandle::spawn(&opts).expect("spawn sh");

        handle.write(Bytes::from_static(b"echo \"[$TERMHUB_TEST_VAR]\"\n"));
        let output = read_until(&mut rx, "[from-env]").await;
        assert!(output.contains("[from-env]"), "got: {output}");
        handle.terminate();
    }

    #[tokio::test]
    async fn exit_command_reports_exited() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh_options()).expect("spawn sh");
        handle.write(Bytes::from_static(b"exit\n"));

        assert!(wait_for_exit(&mut rx).await, "exit event should arrive");
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn terminate_reports_exited() {
        let (handle, mut rx) = ProcessHandle::spawn(&sh_options()).expect("spawn sh");
        handle.terminate();

        assert!(wait_for_exit(&mut rx).await, "exit event should arrive");
        assert!(handle.has_exited());
        // Second terminate is a no-op.
        handle.terminate();
    }

    #[tokio::test]
    async fn resize_live_process_succeeds() {
        let (handle, _rx) = ProcessHandle::spawn(&sh_options()).expect("spawn sh");
        assert!(handle.resize(120, 40).is_ok());
        handle.terminate();
    }

    #[tokio::test]
    async fn spawn_missing_shell_fails() {
        let mut opts = sh_options();
        opts.shell = "/nonexistent/termhub-shell".to_string();
        // portable-pty reports a missing program either at spawn time or as
        // an immediate exit, depending on platform.
        match ProcessHandle::spawn(&opts) {
            Err(PtyError::SpawnCommand(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok((_handle, mut rx)) => assert!(wait_for_exit(&mut rx).await),
        }
    }
}
