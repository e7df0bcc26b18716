// Copyright 2021 Joyent, Inc.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::Error;
use crate::host::Host;

// Default rule evaluation gate in seconds
const DEFAULT_CHECK_FREQUENCY: u64 = 1;
// Default bucket retention window in seconds
const DEFAULT_WINDOW: u64 = 20;
// Default debounce after a rule fires, in seconds
const DEFAULT_SUPPRESS_WINDOW: u64 = 90;

/// One eviction rule for the error rate monitor.
///
/// The rule fires when the error count over the trailing `duration_secs`
/// full seconds exceeds `threshold`. A rule may fire at most `repeat` times
/// over the life of a monitor.
#[derive(Clone, Copy, Debug)]
pub struct ErrorThreshold {
    pub threshold: usize,
    pub duration_secs: u64,
    pub repeat: usize,
}

/// Configuration for per-host error rate monitors.
///
/// With no thresholds configured the monitor records errors but never
/// signals eviction.
#[derive(Clone, Debug)]
pub struct ErrorRateMonitorConfig {
    /// Rules are evaluated at most once per this many seconds.
    pub check_frequency_secs: u64,
    /// How many seconds of one-second buckets to retain.
    pub window_secs: u64,
    /// After any rule fires, evaluation is suppressed for this long.
    pub suppress_window_secs: u64,
    /// The eviction rules.
    pub thresholds: Vec<ErrorThreshold>,
}

impl ErrorRateMonitorConfig {
    /// Append an eviction rule. See [`ErrorThreshold`].
    pub fn add_threshold(
        mut self,
        threshold: usize,
        duration_secs: u64,
        repeat: usize,
    ) -> Self {
        self.thresholds.push(ErrorThreshold {
            threshold,
            duration_secs,
            repeat,
        });
        self
    }
}

impl Default for ErrorRateMonitorConfig {
    fn default() -> Self {
        ErrorRateMonitorConfig {
            check_frequency_secs: DEFAULT_CHECK_FREQUENCY,
            window_secs: DEFAULT_WINDOW,
            suppress_window_secs: DEFAULT_SUPPRESS_WINDOW,
            thresholds: Vec::new(),
        }
    }
}

struct Bucket {
    sec: u64,
    count: usize,
}

struct MonitorState {
    // Oldest bucket at the front, current second at the back
    buckets: VecDeque<Bucket>,
    last_check_sec: u64,
    suppressed_until_sec: u64,
    fire_counts: Vec<usize>,
}

/// A sliding-window error counter for a single host.
///
/// Errors are accumulated into one-second buckets. On each recorded event
/// the configured rules are evaluated, gated by the check frequency and the
/// suppress window. Rules only consider completed seconds so that a
/// partially-filled current bucket does not mask a breach.
pub struct ErrorRateMonitor {
    config: ErrorRateMonitorConfig,
    epoch: Instant,
    state: Mutex<MonitorState>,
}

impl ErrorRateMonitor {
    pub fn new(config: ErrorRateMonitorConfig) -> Self {
        let fire_counts = vec![0; config.thresholds.len()];
        ErrorRateMonitor {
            config,
            epoch: Instant::now(),
            state: Mutex::new(MonitorState {
                buckets: VecDeque::new(),
                last_check_sec: 0,
                suppressed_until_sec: 0,
                fire_counts,
            }),
        }
    }

    /// Record `count` errors and report whether any eviction rule fired on
    /// this event.
    pub fn track_error_rate(&self, count: usize) -> bool {
        self.track_at(count, self.epoch.elapsed().as_secs())
    }

    fn track_at(&self, count: usize, now_sec: u64) -> bool {
        let mut state = self.state.lock().unwrap();

        let in_current_bucket = match state.buckets.back_mut() {
            Some(bucket) if bucket.sec == now_sec => {
                bucket.count += count;
                true
            }
            _ => false,
        };
        if !in_current_bucket {
            state.buckets.push_back(Bucket {
                sec: now_sec,
                count,
            });
        }

        while let Some(front) = state.buckets.front() {
            if front.sec + self.config.window_secs < now_sec {
                state.buckets.pop_front();
            } else {
                break;
            }
        }

        if now_sec < state.last_check_sec + self.config.check_frequency_secs {
            return false;
        }
        state.last_check_sec = now_sec;

        if now_sec < state.suppressed_until_sec {
            return false;
        }

        let mut fired = false;
        for (i, rule) in self.config.thresholds.iter().enumerate() {
            if state.fire_counts[i] >= rule.repeat {
                continue;
            }
            let total: usize = state
                .buckets
                .iter()
                .filter(|b| {
                    b.sec < now_sec && b.sec + rule.duration_secs >= now_sec
                })
                .map(|b| b.count)
                .sum();
            if total > rule.threshold {
                state.fire_counts[i] += 1;
                fired = true;
            }
        }

        if fired {
            state.suppressed_until_sec =
                now_sec + self.config.suppress_window_secs;
        }
        fired
    }
}

/// Routes per-host connection errors to their error rate monitors.
///
/// Monitors are created lazily on the first fatal error observed for a
/// host. Only fatal connection errors are recorded; transient errors are
/// already handled by per-connection recycling inside the host pools.
pub struct ConnectionPoolHealthTracker {
    config: ErrorRateMonitorConfig,
    error_rates: Mutex<HashMap<Host, Arc<ErrorRateMonitor>>>,
}

impl ConnectionPoolHealthTracker {
    pub fn new(config: ErrorRateMonitorConfig) -> Self {
        ConnectionPoolHealthTracker {
            config,
            error_rates: Mutex::new(HashMap::new()),
        }
    }

    /// Record a connection-level error for `host`. Returns true when the
    /// host's error rate tripped a rule and the host should be evicted.
    pub fn track_connection_error(&self, host: &Host, error: &Error) -> bool {
        if !error.is_fatal() {
            return false;
        }

        let monitor = {
            let mut error_rates = self.error_rates.lock().unwrap();
            error_rates
                .entry(host.clone())
                .or_insert_with(|| {
                    Arc::new(ErrorRateMonitor::new(self.config.clone()))
                })
                .clone()
        };

        monitor.track_error_rate(1)
    }

    /// Drop the monitor for a departed host so that a re-added host starts
    /// with a clean error history.
    pub fn forget_host(&self, host: &Host) {
        self.error_rates.lock().unwrap().remove(host);
    }
}
