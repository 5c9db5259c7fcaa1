//! Rolling-window crash-loop detector.
//!
//! Every restart (worker crash or failed reconnect) is recorded with its
//! instant. Once more than `max_restarts` fall inside `window`, the source
//! is considered crash-looping and must not be restarted automatically.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
        }
    }
}

/// Per-source restart history.
#[derive(Debug, Clone)]
pub struct RestartWindow {
    policy: RestartPolicy,
    events: VecDeque<Instant>,
}

impl RestartWindow {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            events: VecDeque::new(),
        }
    }

    /// Record a restart at `now`. Returns `true` if the threshold is exceeded.
    pub fn record_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        self.events.push_back(now);
        self.events.len() as u32 > self.policy.max_restarts
    }

    pub fn record(&mut self) -> bool {
        self.record_at(Instant::now())
    }

    /// Restarts currently inside the window.
    pub fn count_at(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.events.len() as u32
    }

    pub fn count(&mut self) -> u32 {
        self.count_at(Instant::now())
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.events.front() {
            if now.saturating_duration_since(front) > self.policy.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}
