//! Output coalescing between a process and its viewers.
//!
//! Chunks read from the PTY are accumulated and released either when the
//! accumulator reaches a size threshold or when a short delay has elapsed
//! since the first pending byte, whichever comes first. Released chunks
//! concatenate to exactly the bytes the process produced.

use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::pty::ProcessEvent;

pub const DEFAULT_FLUSH_THRESHOLD: usize = 32 * 1024;
pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(8);

/// How long to wait for the reader to drain after the child exits before
/// finalizing anyway (a background job may still hold the terminal open).
pub const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceConfig {
    pub threshold: usize,
    pub delay: Duration,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FLUSH_THRESHOLD,
            delay: DEFAULT_FLUSH_DELAY,
        }
    }
}

/// Pending-bytes accumulator with an optional flush deadline.
#[derive(Debug)]
pub struct OutputCoalescer {
    pending: BytesMut,
    deadline: Option<Instant>,
    config: CoalesceConfig,
}

impl OutputCoalescer {
    pub fn new(config: CoalesceConfig) -> Self {
        Self {
            pending: BytesMut::new(),
            deadline: None,
            config,
        }
    }

    /// Accumulate a chunk. Returns the bytes to flush right now if the size
    /// threshold was reached; otherwise arms the deadline if it isn't armed.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() >= self.config.threshold {
            return self.take();
        }
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.config.delay);
        }
        None
    }

    /// Take everything pending and disarm the deadline.
    pub fn take(&mut self) -> Option<Bytes> {
        self.deadline = None;
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Receiver of coalesced output.
pub trait OutputSink: Send + Sync + 'static {
    /// Deliver one flushed chunk.
    fn deliver(&self, data: Bytes);
    /// The process is gone and every byte it produced has been delivered.
    fn finish(&self);
}

struct PumpState {
    events: mpsc::Receiver<ProcessEvent>,
    coalescer: OutputCoalescer,
    reader_done: bool,
    process_done: bool,
    drain_deadline: Option<Instant>,
    finished: bool,
}

/// Drives a process's event stream through an [`OutputCoalescer`] into a
/// sink.
///
/// The event receiver and the coalescer live behind one lock, so
/// [`Pump::finish_now`] can settle the stream from outside the task. Once
/// finished, [`OutputSink::finish`] has been called exactly once and
/// nothing more reaches the sink.
pub struct Pump<S> {
    state: Mutex<PumpState>,
    sink: S,
    done: CancellationToken,
}

impl<S: OutputSink> Pump<S> {
    pub fn new(events: mpsc::Receiver<ProcessEvent>, config: CoalesceConfig, sink: S) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PumpState {
                events,
                coalescer: OutputCoalescer::new(config),
                reader_done: false,
                process_done: false,
                drain_deadline: None,
                finished: false,
            }),
            sink,
            done: CancellationToken::new(),
        })
    }

    /// Pump until the process has exited and its output has drained, or
    /// until [`Pump::finish_now`] settles the stream.
    pub async fn run(self: Arc<Self>) {
        loop {
            let (flush_at, drain_at) = {
                let state = self.state.lock();
                if state.finished {
                    return;
                }
                (state.coalescer.deadline(), state.drain_deadline)
            };
            tokio::select! {
                biased;

                _ = self.done.cancelled() => return,

                _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    self.flush_due();
                }

                finished = std::future::poll_fn(|cx| self.poll_event(cx)) => {
                    if finished {
                        return;
                    }
                }

                _ = sleep_until(drain_at.unwrap_or_else(Instant::now)), if drain_at.is_some() => {
                    tracing::debug!("output did not drain after exit, finalizing");
                    self.finish();
                    return;
                }
            }
        }
    }

    /// Deliver everything already received, then finish. Returns `false`
    /// if the stream had already finished.
    pub fn finish_now(&self) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        state.events.close();
        while let Ok(event) = state.events.try_recv() {
            if let ProcessEvent::Output(data) = event {
                if let Some(flushed) = state.coalescer.push(&data) {
                    self.sink.deliver(flushed);
                }
            }
        }
        self.finish_locked(&mut state);
        true
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    fn flush_due(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        if let Some(data) = state.coalescer.take() {
            self.sink.deliver(data);
        }
    }

    fn finish(&self) {
        let mut state = self.state.lock();
        if !state.finished {
            self.finish_locked(&mut state);
        }
    }

    /// Receive and handle one event under the lock. Resolves to `true` once
    /// the stream is finished.
    fn poll_event(&self, cx: &mut Context<'_>) -> Poll<bool> {
        let mut state = self.state.lock();
        if state.finished {
            return Poll::Ready(true);
        }
        let finished = match ready!(state.events.poll_recv(cx)) {
            Some(ProcessEvent::Output(data)) => {
                if let Some(flushed) = state.coalescer.push(&data) {
                    self.sink.deliver(flushed);
                }
                false
            }
            Some(ProcessEvent::Eof) => {
                state.reader_done = true;
                state.process_done
            }
            Some(ProcessEvent::Exited) => {
                state.process_done = true;
                if !state.reader_done {
                    state.drain_deadline = Some(Instant::now() + EXIT_DRAIN_GRACE);
                }
                state.reader_done
            }
            None => true,
        };
        if finished {
            self.finish_locked(&mut state);
        }
        Poll::Ready(finished)
    }

    fn finish_locked(&self, state: &mut PumpState) {
        if let Some(data) = state.coalescer.take() {
            self.sink.deliver(data);
        }
        state.finished = true;
        state.events.close();
        self.sink.finish();
        self.done.cancel();
    }
}
