//! Scheduling: periodic `poll()` invocation and the crash/backoff reload
//! timer.
//!
//! Two independent concerns live here. `PollScheduler` runs a plugin's
//! optional periodic callback on a fixed interval for as long as the
//! plugin stays running. `BackoffTracker` is pure bookkeeping for the
//! lifecycle manager's crash-handling state machine: it records crash
//! timestamps, computes the exponential backoff delay before the next
//! restart attempt, and reports when a plugin has crashed too often in
//! too short a window to be restarted automatically.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CRASH_WINDOW: Duration = Duration::from_secs(60);
const MAX_CRASHES_IN_WINDOW: usize = 3;

/// Runs an async callback on a fixed interval until cancelled.
pub struct PollScheduler {
    plugin_id: String,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollScheduler {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            task: Mutex::new(None),
        }
    }

    /// Start calling `callback` every `interval`, replacing any
    /// previously scheduled poll for this plugin.
    pub async fn start<F, Fut>(&self, interval: Duration, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        self.stop().await;
        let plugin_id = self.plugin_id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                callback().await;
            }
        });
        let _ = &plugin_id;
        *self.task.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.task.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

/// Tracks crash timestamps for one plugin and decides whether the next
/// restart should be attempted, delayed, or refused outright.
pub struct BackoffTracker {
    crash_times: Mutex<VecDeque<Instant>>,
}

pub enum RestartDecision {
    /// Restart immediately (this is the first crash, or enough time has
    /// passed that backoff has reset).
    Immediate,
    /// Wait this long before attempting the restart.
    After(Duration),
    /// Too many crashes within the window; the plugin must be disabled
    /// rather than retried automatically.
    Disable,
}

impl BackoffTracker {
    pub fn new() -> Self {
        Self {
            crash_times: Mutex::new(VecDeque::new()),
        }
    }

    /// Record a crash occurring now and decide what to do about the next
    /// restart attempt.
    pub async fn record_crash(&self, now: Instant) -> RestartDecision {
        let mut crashes = self.crash_times.lock().await;
        while let Some(&front) = crashes.front() {
            if now.duration_since(front) > CRASH_WINDOW {
                crashes.pop_front();
            } else {
                break;
            }
        }
        crashes.push_back(now);

        if crashes.len() > MAX_CRASHES_IN_WINDOW {
            warn!(crashes = crashes.len(), window_secs = CRASH_WINDOW.as_secs(), "crash threshold exceeded, disabling plugin");
            return RestartDecision::Disable;
        }

        let attempt = crashes.len().saturating_sub(1);
        if attempt == 0 {
            RestartDecision::Immediate
        } else {
            let delay = backoff_for_attempt(attempt);
            RestartDecision::After(delay)
        }
    }

    pub async fn reset(&self) {
        self.crash_times.lock().await.clear();
    }
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff_for_attempt(attempt: usize) -> Duration {
    let exponent = attempt.min(5) as u32; // 1s * 2^5 = 32s, already over the 30s cap
    let scaled = INITIAL_BACKOFF.saturating_mul(1u32 << exponent);
    scaled.min(MAX_BACKOFF)
}

/// Convenience wrapper pairing a poll scheduler and a backoff tracker per
/// plugin, the way the lifecycle manager holds one of each per plugin record.
pub struct PluginScheduling {
    pub poll: Arc<PollScheduler>,
    pub backoff: Arc<BackoffTracker>,
}

impl PluginScheduling {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        let plugin_id = plugin_id.into();
        Self {
            poll: Arc::new(PollScheduler::new(plugin_id)),
            backoff: Arc::new(BackoffTracker::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_up_to_cap() {
        assert_eq!(backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(backoff_for_attempt(3), Duration::from_secs(8));
        assert_eq!(backoff_for_attempt(4), Duration::from_secs(16));
        assert_eq!(backoff_for_attempt(5), Duration::from_secs(30));
        assert_eq!(backoff_for_attempt(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn first_crash_restarts_immediately() {
        let tracker = BackoffTracker::new();
        let decision = tracker.record_crash(Instant::now()).await;
        assert!(matches!(decision, RestartDecision::Immediate));
    }

    #[tokio::test]
    async fn second_crash_within_window_backs_off() {
        let tracker = BackoffTracker::new();
        let t0 = Instant::now();
        tracker.record_crash(t0).await;
        let decision = tracker.record_crash(t0 + Duration::from_millis(10)).await;
        assert!(matches!(decision, RestartDecision::After(d) if d == Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn fourth_crash_within_window_disables() {
        let tracker = BackoffTracker::new();
        let t0 = Instant::now();
        tracker.record_crash(t0).await;
        tracker.record_crash(t0 + Duration::from_millis(1)).await;
        tracker.record_crash(t0 + Duration::from_millis(2)).await;
        let decision = tracker.record_crash(t0 + Duration::from_millis(3)).await;
        assert!(matches!(decision, RestartDecision::Disable));
    }

    #[tokio::test]
    async fn crash_outside_window_resets_the_count() {
        let tracker = BackoffTracker::new();
        let t0 = Instant::now();
        tracker.record_crash(t0).await;
        tracker.record_crash(t0 + Duration::from_millis(1)).await;
        tracker.record_crash(t0 + Duration::from_millis(2)).await;

        let decision = tracker.record_crash(t0 + CRASH_WINDOW + Duration::from_secs(1)).await;
        assert!(matches!(decision, RestartDecision::Immediate));
    }

    #[tokio::test]
    async fn reset_clears_crash_history() {
        let tracker = BackoffTracker::new();
        tracker.record_crash(Instant::now()).await;
        tracker.reset().await;
        let decision = tracker.record_crash(Instant::now()).await;
        assert!(matches!(decision, RestartDecision::Immediate));
    }
}
