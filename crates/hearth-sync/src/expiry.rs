//! Per-message expiry for rooms with a finite TTL.
//!
//! Each message gets one single-shot timer keyed by its id. Remaining
//! lifetime is always computed from the latest clock offset, and re-checked
//! when a timer fires, so an offset re-sync cannot push an expiry off course.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::poll_fn;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, trace};

use hearth_types::models::Message;

use crate::clock::{ClockOffset, ClockSync};
use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// No expiry at all.
    Never,
    Expired,
    Remaining(Duration),
}

/// Remaining lifetime of something expiring at `expires_at`, at estimated server time `server_now`.
pub fn evaluate(expires_at: Option<DateTime<Utc>>, server_now: DateTime<Utc>) -> Expiry {
    let Some(expires_at) = expires_at else {
        return Expiry::Never;
    };
    match (expires_at - server_now).to_std() {
        Ok(remaining) if !remaining.is_zero() => Expiry::Remaining(remaining),
        _ => Expiry::Expired,
    }
}

struct Timer {
    key: delay_queue::Key,
    expires_at: DateTime<Utc>,
}

pub struct ExpiryScheduler {
    clock: ClockSync,
    queue: DelayQueue<String>,
    timers: HashMap<String, Timer>,
    /// Offset in force when the timers were last armed.
    armed_offset: ClockOffset,
    drift_tolerance: Duration,
    horizon: Duration,
}

impl ExpiryScheduler {
    pub fn new(clock: ClockSync, config: &SyncConfig) -> Self {
        let armed_offset = clock.offset();
        Self {
            clock,
            queue: DelayQueue::new(),
            timers: HashMap::new(),
            armed_offset,
            drift_tolerance: config.clock_drift_tolerance,
            horizon: crate::config::MAX_TIMER_HORIZON,
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn is_scheduled(&self, id: &str) -> bool {
        self.timers.contains_key(id)
    }

    /// Arm (or re-arm) the timer for one message.
    /// Returns `true` if it has already expired; no timer is armed then.
    pub fn schedule(&mut self, message: &Message) -> bool {
        self.cancel(&message.id);
        match evaluate(message.expires_at, self.clock.now()) {
            Expiry::Never => false,
            Expiry::Expired => true,
            Expiry::Remaining(remaining) => {
                if let Some(expires_at) = message.expires_at {
                    self.arm(message.id.clone(), expires_at, remaining);
                }
                false
            }
        }
    }

    pub fn cancel(&mut self, id: &str) {
        if let Some(timer) = self.timers.remove(id) {
            self.queue.try_remove(&timer.key);
        }
    }

    pub fn clear(&mut self) {
        self.timers.clear();
        self.queue.clear();
    }

    /// Bring the timers in line with the current message list: cancel timers
    /// for messages that left, arm new or changed ones. Returns ids already expired.
    pub fn track(&mut self, messages: &[Message]) -> Vec<String> {
        let live: HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
        let gone: Vec<String> = self
            .timers
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect();
        for id in gone {
            self.cancel(&id);
        }

        let mut expired = Vec::new();
        for message in messages {
            let unchanged = self
                .timers
                .get(&message.id)
                .is_some_and(|t| Some(t.expires_at) == message.expires_at);
            if !unchanged && self.schedule(message) {
                expired.push(message.id.clone());
            }
        }
        expired
    }

    /// React to a new clock estimate. If the offset moved beyond the drift
    /// tolerance every timer is re-armed from the latest offset.
    /// Returns ids that are now expired.
    pub fn on_offset_change(&mut self) -> Vec<String> {
        let offset = self.clock.offset();
        if offset.distance(self.armed_offset) <= self.drift_tolerance {
            return Vec::new();
        }
        debug!(
            "Clock offset moved {}ms -> {}ms, re-arming {} expiry timers",
            self.armed_offset.as_millis(),
            offset.as_millis(),
            self.timers.len()
        );
        self.rearm_all()
    }

    fn rearm_all(&mut self) -> Vec<String> {
        self.armed_offset = self.clock.offset();
        let now = self.clock.now();
        let timers: Vec<(String, DateTime<Utc>)> = self
            .timers
            .drain()
            .map(|(id, t)| (id, t.expires_at))
            .collect();
        self.queue.clear();

        let mut expired = Vec::new();
        for (id, expires_at) in timers {
            match evaluate(Some(expires_at), now) {
                Expiry::Remaining(remaining) => self.arm(id, expires_at, remaining),
                _ => expired.push(id),
            }
        }
        expired
    }

    /// Wait for the next message to expire.
    ///
    /// Returns `None` immediately when nothing is scheduled. Cancel safe.
    pub async fn next_expired(&mut self) -> Option<String> {
        loop {
            let fired = poll_fn(|cx| self.queue.poll_expired(cx)).await?;
            let id = fired.into_inner();
            let Some(timer) = self.timers.remove(&id) else {
                continue;
            };

            // The offset may have moved since arming, or the timer was capped at the horizon.
            match evaluate(Some(timer.expires_at), self.clock.now()) {
                Expiry::Remaining(remaining) => {
                    trace!("Expiry timer for {} fired early, re-arming", id);
                    self.arm(id, timer.expires_at, remaining);
                }
                _ => return Some(id),
            }
        }
    }

    fn arm(&mut self, id: String, expires_at: DateTime<Utc>, remaining: Duration) {
        let key = self.queue.insert(id.clone(), remaining.min(self.horizon));
        self.timers.insert(id, Timer { key, expires_at });
    }
}
