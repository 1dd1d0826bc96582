//! Stability checking for files that are still being written.
//!
//! A newly created file is sampled at a fixed interval. It is considered
//! stable once its size has been identical and non-zero for a number of
//! consecutive samples. If the time budget runs out first, a file whose last
//! observed size was non-zero is still handed on; an empty or vanished file is
//! dropped.

use std::path::Path;
use std::time::{Duration, Instant};

use aiff_drop_daemon_config::WatcherConfig;

/// Sampling parameters for a stability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityPolicy {
    /// Delay between size samples.
    pub interval: Duration,
    /// Consecutive unchanged samples required.
    pub required_samples: u32,
    /// Total time allowed before giving up on stability.
    pub budget: Duration,
}

impl Default for StabilityPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            required_samples: 3,
            budget: Duration::from_secs(30),
        }
    }
}

impl From<&WatcherConfig> for StabilityPolicy {
    fn from(cfg: &WatcherConfig) -> Self {
        Self {
            interval: Duration::from_millis(cfg.poll_interval_ms.max(1)),
            required_samples: cfg.stable_samples.max(1),
            budget: Duration::from_secs(cfg.budget_secs),
        }
    }
}

/// Result of waiting for a file to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityResult {
    /// Size stayed unchanged for the required number of samples.
    Stable { size: u64 },
    /// Budget ran out while the size was still changing.
    BudgetExhausted { last_size: u64 },
    /// The file disappeared or could not be read.
    Vanished,
}

impl StabilityResult {
    /// Size to report if the file should be handed on, `None` if it should be dropped.
    pub fn ready_size(&self) -> Option<u64> {
        match *self {
            StabilityResult::Stable { size } => Some(size),
            StabilityResult::BudgetExhausted { last_size } if last_size > 0 => Some(last_size),
            _ => None,
        }
    }
}

/// Pure sample tracker behind [`wait_for_stable_size`].
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    required: u32,
    previous: Option<u64>,
    unchanged: u32,
}

impl StabilityTracker {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            previous: None,
            unchanged: 0,
        }
    }

    /// Feed one size sample. Returns `true` once the file counts as stable.
    pub fn observe(&mut self, size: u64) -> bool {
        if size > 0 && self.previous == Some(size) {
            self.unchanged += 1;
        } else {
            self.unchanged = 0;
        }
        self.previous = Some(size);
        self.unchanged >= self.required
    }

    pub fn last_size(&self) -> Option<u64> {
        self.previous
    }
}

/// Block until `path` is stable, the budget is spent, or the file vanishes.
///
/// `cancelled` is polled between samples; a cancelled check reports `Vanished`.
pub fn wait_for_stable_size(
    path: &Path,
    policy: &StabilityPolicy,
    cancelled: &dyn Fn() -> bool,
) -> StabilityResult {
    let started = Instant::now();
    let mut tracker = StabilityTracker::new(policy.required_samples);

    loop {
        if cancelled() {
            return StabilityResult::Vanished;
        }

        let size = match std::fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => return StabilityResult::Vanished,
        };

        if tracker.observe(size) {
            return StabilityResult::Stable { size };
        }

        if started.elapsed() + policy.interval > policy.budget {
            return StabilityResult::BudgetExhausted {
                last_size: tracker.last_size().unwrap_or(0),
            };
        }

        std::thread::sleep(policy.interval);
    }
}
