//! Single-timer debounce.
//!
//! ```text
//!   arm()            expired() resolves
//! IDLE ─────► ARMED ───────────────────► IDLE (caller fires)
//!               │  ▲
//!       arm()   └──┘  old timer dropped, new deadline
//!               │
//!    cancel()   └──────────────────────► IDLE (nothing fires)
//! ```
//!
//! The timer is an owned `Option<Sleep>`. Re-arming replaces it, which drops
//! the previous one, so two timers can never be pending at once and a stale
//! deadline can never fire after a reschedule.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Armed,
}

pub struct Debouncer {
    delay: Duration,
    pending: Option<Pin<Box<Sleep>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn state(&self) -> DebounceState {
        if self.pending.is_some() {
            DebounceState::Armed
        } else {
            DebounceState::Idle
        }
    }

    /// Cancel any pending timer and start a fresh one.
    pub fn arm(&mut self) {
        self.pending = Some(Box::pin(sleep(self.delay)));
    }

    /// Drop the pending timer. Returns whether one was armed.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Resolves when the armed timer elapses; pending forever while idle.
    ///
    /// Cancel-safe: dropping the future leaves the timer armed.
    pub async fn expired(&mut self) {
        match self.pending.as_mut() {
            Some(timer) => timer.await,
            None => std::future::pending().await,
        }
        self.pending = None;
    }
}
