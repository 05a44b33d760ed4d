//! Per-node cut rate limiting.
//!
//! Fixed-window counting: the first admission opens a window, subsequent
//! admissions increment the count until `max_cuts` is reached, and a window
//! older than `window_minutes` is replaced wholesale. The limiter carries its
//! own mutex; its critical section is strictly narrower than a cut.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::policy::RateLimit;

#[derive(Debug, Clone)]
struct WindowState {
    count: u32,
    window_start: DateTime<Utc>,
}

#[derive(Default)]
pub struct RateLimiter {
    states: Mutex<HashMap<String, WindowState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or deny a cut for `node` under `limit` at time `now`.
    ///
    /// Admission counts against the window even when the cut later fails;
    /// denials do not.
    pub fn admit(&self, node: &str, limit: &RateLimit, now: DateTime<Utc>) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let window = Duration::minutes(i64::from(limit.window_minutes));

        match states.get_mut(node) {
            Some(state) if now - state.window_start <= window => {
                if state.count >= limit.max_cuts {
                    false
                } else {
                    state.count += 1;
                    true
                }
            }
            _ => {
                states.insert(
                    node.to_string(),
                    WindowState {
                        count: 1,
                        window_start: now,
                    },
                );
                true
            }
        }
    }
}
