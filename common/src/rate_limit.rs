//! In-process sliding-window rate limiting.
//!
//! Client records live inside a single shard actor, so windows are plain
//! compacting timestamp deques rather than a shared store. Capacity is
//! capped at the limit so a spamming client cannot grow the window
//! unboundedly.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy)]
pub struct WindowConfig {
    /// Max events allowed inside the window.
    pub limit: usize,
    /// Window length in milliseconds.
    pub window_ms: i64,
}

#[derive(Debug)]
pub struct SlidingWindow {
    config: WindowConfig,
    stamps: VecDeque<i64>,
}

impl SlidingWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            stamps: VecDeque::with_capacity(config.limit.min(64)),
        }
    }

    fn sweep(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.config.window_ms;
        while let Some(&front) = self.stamps.front() {
            if front > cutoff {
                break;
            }
            self.stamps.pop_front();
        }
    }

    /// Events currently inside the window.
    pub fn count(&mut self, now_ms: i64) -> usize {
        self.sweep(now_ms);
        self.stamps.len()
    }

    /// Admission check: record the event only when the window has room.
    /// Returns false (without recording) when the window is full.
    pub fn try_acquire(&mut self, now_ms: i64) -> bool {
        self.sweep(now_ms);
        if self.stamps.len() >= self.config.limit {
            return false;
        }
        self.stamps.push_back(now_ms);
        true
    }

    /// Churn-style check: always record, then report whether the windowed
    /// count has reached the limit. The deque is capped at the limit so the
    /// oldest stamp falls off once saturated.
    pub fn record_then_over(&mut self, now_ms: i64) -> bool {
        self.sweep(now_ms);
        self.stamps.push_back(now_ms);
        if self.stamps.len() > self.config.limit {
            self.stamps.pop_front();
            return true;
        }
        self.stamps.len() >= self.config.limit
    }
}

/// The two-window setCell limiter: a short burst window and a longer
/// sustained window. An op is admitted only when both windows have room,
/// and is recorded into both.
#[derive(Debug)]
pub struct DualWindow {
    burst: SlidingWindow,
    sustained: SlidingWindow,
}

impl DualWindow {
    pub fn new(burst: WindowConfig, sustained: WindowConfig) -> Self {
        Self {
            burst: SlidingWindow::new(burst),
            sustained: SlidingWindow::new(sustained),
        }
    }

    pub fn try_acquire(&mut self, now_ms: i64) -> bool {
        if self.burst.count(now_ms) >= self.burst.config.limit
            || self.sustained.count(now_ms) >= self.sustained.config.limit
        {
            return false;
        }
        self.burst.stamps.push_back(now_ms);
        self.sustained.stamps.push_back(now_ms);
        true
    }
}
