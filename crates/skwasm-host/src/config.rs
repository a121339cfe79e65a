//! Host-wide configuration.
//!
//! The host is a library embedded by an out-of-scope server rather than a
//! standalone binary — there is no CLI or environment-variable layer here,
//! only the values the embedding server passes to `Host::new`. Every
//! `Default` matches a literal constant named in the component design.

use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the whole host, shared across every plugin it runs.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root directory under which `plugin-config-data/` is created.
    pub config_root: PathBuf,
    /// Wall-clock budget the HTTP bridge gives a guest handler before
    /// responding `504` (§4.F).
    pub http_watchdog: Duration,
    /// Capacity of each UDP socket's non-blocking receive FIFO (§4.D).
    pub udp_buffer_capacity: usize,
    /// Capacity of each plugin's delta reload-replay ring (§4.H).
    pub delta_replay_capacity: usize,
    /// Sliding window within which repeated crashes count toward the
    /// hard-disable threshold (§4.I).
    pub crash_window: Duration,
    /// Restart delay after the first crash in a window; doubles per
    /// subsequent crash up to `max_backoff`.
    pub initial_backoff: Duration,
    /// Ceiling on the exponential restart backoff.
    pub max_backoff: Duration,
    /// Maximum crashes tolerated within `crash_window` before the plugin
    /// is disabled instead of restarted again.
    pub max_crashes_in_window: usize,
    /// Cap on lines returned by the log-viewer hybrid interceptor (§4.G).
    pub log_viewer_line_cap: usize,
    /// Interval between periodic `poll()` invocations for a plugin that
    /// exports it. Not a literal named in the component design — a
    /// reasonable default for "invoked periodically".
    pub poll_interval: Duration,
}

impl HostConfig {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
            ..Self::default()
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            config_root: PathBuf::from("."),
            http_watchdog: Duration::from_secs(10),
            udp_buffer_capacity: 1000,
            delta_replay_capacity: 1000,
            crash_window: Duration::from_secs(60),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            max_crashes_in_window: 3,
            log_viewer_line_cap: 50_000,
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_literals() {
        let config = HostConfig::default();
        assert_eq!(config.udp_buffer_capacity, 1000);
        assert_eq!(config.delta_replay_capacity, 1000);
        assert_eq!(config.crash_window, Duration::from_secs(60));
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.max_crashes_in_window, 3);
        assert_eq!(config.http_watchdog, Duration::from_secs(10));
        assert_eq!(config.log_viewer_line_cap, 50_000);
    }

    #[test]
    fn new_overrides_only_config_root() {
        let config = HostConfig::new("/srv/marine");
        assert_eq!(config.config_root, PathBuf::from("/srv/marine"));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
    }
}
