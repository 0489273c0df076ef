use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;

pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Periodically destroys sessions nobody is watching that have exited or
/// sat idle past the timeout.
#[derive(Clone)]
pub struct IdleReaper {
    registry: SessionRegistry,
    interval: Duration,
    idle_timeout: Duration,
}

impl IdleReaper {
    pub fn new(registry: SessionRegistry, interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            idle_timeout,
        }
    }

    /// One pass over the registry. Returns the ids that were reaped.
    pub fn sweep(&self) -> Vec<String> {
        let mut reaped = Vec::new();
        for session in self.registry.sessions() {
            let id = session.id().to_string();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                if session.try_claim_for_reaping(self.idle_timeout) {
                    let exited = session.is_exited();
                    let idle = session.idle_for();
                    self.registry.destroy(&id);
                    Some((exited, idle))
                } else {
                    None
                }
            }));
            match outcome {
                Ok(Some((exited, idle))) => {
                    tracing::info!(session = %id, exited, idle_secs = idle.as_secs(), "reaped session");
                    reaped.push(id);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(session = %id, "reaping session panicked: {:?}", e),
            }
        }
        reaped
    }

    /// Run [`IdleReaper::sweep`] every interval until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = self.sweep();
                        tracing::debug!(count = reaped.len(), remaining = self.registry.len(), "reaper sweep done");
                    }
                }
            }
        })
    }
}
