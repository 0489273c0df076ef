use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::time::Instant;

/// Tracks the timestamp of the last activity on a session (input, output
/// flush, resize, attach or detach).
///
/// The monotonic instant drives idle reaping; the wall-clock stamp is what
/// clients see in session summaries. Clones share state.
#[derive(Clone)]
pub struct ActivityTracker {
    last: Arc<Mutex<Stamp>>,
}

#[derive(Debug, Clone, Copy)]
struct Stamp {
    at: Instant,
    wall: SystemTime,
}

impl Stamp {
    fn now() -> Self {
        Self {
            at: Instant::now(),
            wall: SystemTime::now(),
        }
    }
}

impl std::fmt::Debug for ActivityTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracker")
            .field("last_activity_ms", &self.last_activity_ms())
            .finish()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    /// Create a new tracker seeded with the current instant.
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Stamp::now())),
        }
    }

    /// Record activity. Safe to call from blocking threads.
    pub fn touch(&self) {
        *self.last.lock() = Stamp::now();
    }

    /// How long since the last activity.
    pub fn idle_for(&self) -> Duration {
        self.last.lock().at.elapsed()
    }

    /// Wall-clock time of the last activity in milliseconds since the epoch.
    pub fn last_activity_ms(&self) -> u64 {
        epoch_ms(self.last.lock().wall)
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for pre-epoch clocks.
pub fn epoch_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn clones_share_the_stamp() {
        let tracker = ActivityTracker::new();
        let clone = tracker.clone();
        tokio::time::advance(Duration::from_secs(600)).await;
        clone.touch();
        assert!(tracker.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_for_grows_without_touch() {
        let tracker = ActivityTracker::new();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(tracker.idle_for() >= Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn touch_resets_idle_time() {
        let tracker = ActivityTracker::new();
        tokio::time::advance(Duration::from_secs(3600)).await;
        tracker.touch();
        assert!(tracker.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn last_activity_is_recent_wall_clock() {
        let before = epoch_ms(SystemTime::now());
        let tracker = ActivityTracker::new();
        tracker.touch();
        let after = epoch_ms(SystemTime::now());
        let last = tracker.last_activity_ms();
        assert!(last >= before && last <= after);
    }

    #[test]
    fn epoch_ms_before_epoch_is_zero() {
        assert_eq!(epoch_ms(UNIX_EPOCH - Duration::from_secs(1)), 0);
    }
}
