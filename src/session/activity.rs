use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Timer resets are collapsed to at most one per this span of wall clock,
/// so a stream of mouse-move events does not churn the timers.
pub const RESET_THROTTLE: Duration = Duration::from_millis(1000);

/// Interaction events the embedding UI reports for idle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    MouseMove,
    MouseDown,
    KeyDown,
    Scroll,
    TouchStart,
    Click,
}

#[derive(Debug)]
struct ActivityState {
    last_activity: Instant,
    last_reset: Option<Instant>,
}

/// Shared last-activity clock with a throttled reset signal.
///
/// Every recorded event moves the timestamp; the boolean returned by
/// [`ActivityTracker::record`] tells the caller whether its timers should
/// actually be rescheduled this time.
#[derive(Debug)]
pub struct ActivityTracker {
    throttle: Duration,
    state: Mutex<ActivityState>,
}

impl ActivityTracker {
    pub fn new(throttle: Duration) -> Self {
        Self {
            throttle,
            state: Mutex::new(ActivityState {
                last_activity: Instant::now(),
                last_reset: None,
            }),
        }
    }

    /// Record one interaction event. Returns true when the caller should
    /// reset its inactivity timers.
    pub async fn record(&self, kind: ActivityKind) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.last_activity = now;
        let reset_due = match state.last_reset {
            None => true,
            Some(previous) => now.duration_since(previous) >= self.throttle,
        };
        if reset_due {
            state.last_reset = Some(now);
        }
        trace!(kind = ?kind, reset = reset_due, "activity recorded");
        reset_due
    }

    /// Time since the most recent recorded event.
    pub async fn idle_for(&self) -> Duration {
        self.state.lock().await.last_activity.elapsed()
    }

    /// Restart the clock, e.g. when a session starts or is explicitly
    /// continued.
    pub async fn restart(&self) {
        let mut state = self.state.lock().await;
        state.last_activity = Instant::now();
        state.last_reset = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_event_always_requests_a_reset() {
        let tracker = ActivityTracker::new(Duration::from_millis(50));
        assert!(tracker.record(ActivityKind::Click).await);
    }

    #[tokio::test]
    async fn events_inside_the_throttle_window_do_not_reset() {
        let tracker = ActivityTracker::new(Duration::from_millis(100));
        assert!(tracker.record(ActivityKind::MouseMove).await);
        assert!(!tracker.record(ActivityKind::MouseMove).await);
        assert!(!tracker.record(ActivityKind::KeyDown).await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(tracker.record(ActivityKind::MouseMove).await);
    }

    #[tokio::test]
    async fn throttled_events_still_move_the_activity_clock() {
        let tracker = ActivityTracker::new(Duration::from_millis(200));
        tracker.record(ActivityKind::Click).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracker.record(ActivityKind::MouseMove).await;
        assert!(tracker.idle_for().await < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn restart_clears_the_throttle_window() {
        let tracker = ActivityTracker::new(Duration::from_millis(500));
        assert!(tracker.record(ActivityKind::Click).await);
        tracker.restart().await;
        assert!(tracker.record(ActivityKind::Click).await);
    }
}
