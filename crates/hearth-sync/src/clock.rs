//! Client/server clock offset estimation.
//!
//! `serverTime ≈ localTime + offset`. Every TTL decision in the client reads
//! time through [`ClockSync::now`], never the raw local clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::Backend;

/// Signed difference between server and local clocks. A best-effort estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClockOffset(TimeDelta);

impl ClockOffset {
    pub const ZERO: Self = Self(TimeDelta::zero());

    pub fn from_millis(ms: i64) -> Self {
        Self(TimeDelta::milliseconds(ms))
    }

    pub fn as_delta(&self) -> TimeDelta {
        self.0
    }

    pub fn as_millis(&self) -> i64 {
        self.0.num_milliseconds()
    }

    /// Magnitude of the change between two estimates.
    pub fn distance(&self, other: ClockOffset) -> Duration {
        (self.0 - other.0).abs().to_std().unwrap_or(Duration::MAX)
    }
}

/// Offset from a single probe: the server stamped its time at the midpoint of the round trip.
pub fn estimate_offset(sent_at: DateTime<Utc>, round_trip: Duration, server_time: DateTime<Utc>) -> ClockOffset {
    let half_rtt = TimeDelta::from_std(round_trip / 2).unwrap_or(TimeDelta::zero());
    ClockOffset(server_time - (sent_at + half_rtt))
}

/// Single-writer, many-reader clock offset estimator.
#[derive(Clone)]
pub struct ClockSync {
    inner: Arc<ClockSyncInner>,
}

struct ClockSyncInner {
    backend: Arc<dyn Backend>,
    /// `None` until the first successful probe.
    offset_tx: watch::Sender<Option<ClockOffset>>,
    /// Local wall time is read once and then advanced monotonically, so it
    /// moves in lockstep with the timers that act on it.
    anchor_wall: DateTime<Utc>,
    anchor_instant: Instant,
}

impl ClockSync {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::anchored_at(backend, Utc::now())
    }

    /// Clock whose local time reads `local_now` at this instant.
    pub fn anchored_at(backend: Arc<dyn Backend>, local_now: DateTime<Utc>) -> Self {
        let (offset_tx, _) = watch::channel(None);
        Self {
            inner: Arc::new(ClockSyncInner {
                backend,
                offset_tx,
                anchor_wall: local_now,
                anchor_instant: Instant::now(),
            }),
        }
    }

    /// Local wall-clock time.
    pub fn local_now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.inner.anchor_instant.elapsed()).unwrap_or(TimeDelta::zero());
        self.inner.anchor_wall + elapsed
    }

    /// Current best estimate. Zero until a probe has succeeded, so an
    /// unmeasured clock degrades to local time instead of blocking anything.
    pub fn offset(&self) -> ClockOffset {
        self.inner.offset_tx.borrow().unwrap_or(ClockOffset::ZERO)
    }

    pub fn is_measured(&self) -> bool {
        self.inner.offset_tx.borrow().is_some()
    }

    /// Watch for new estimates.
    pub fn subscribe(&self) -> watch::Receiver<Option<ClockOffset>> {
        self.inner.offset_tx.subscribe()
    }

    /// Estimated server time.
    pub fn now(&self) -> DateTime<Utc> {
        self.server_time_at(self.local_now())
    }

    /// Estimated server time at the given local instant, using the latest offset.
    pub fn server_time_at(&self, local: DateTime<Utc>) -> DateTime<Utc> {
        local + self.offset().as_delta()
    }

    /// Store a new estimate.
    pub fn set_offset(&self, offset: ClockOffset) {
        self.inner.offset_tx.send_replace(Some(offset));
    }

    /// Issue one timed probe. A failed probe keeps the previous estimate.
    pub async fn sync(&self) -> Option<ClockOffset> {
        let sent_at = self.local_now();
        let started = Instant::now();

        let server_time = match self.inner.backend.server_time().await {
            Ok(t) => t,
            Err(e) => {
                debug!("Clock probe failed, keeping offset {}ms: {}", self.offset().as_millis(), e);
                return None;
            }
        };

        let round_trip = started.elapsed();
        let offset = estimate_offset(sent_at, round_trip, server_time);
        debug!(
            "Clock probe: rtt={}ms offset={}ms",
            round_trip.as_millis(),
            offset.as_millis()
        );
        self.set_offset(offset);
        Some(offset)
    }

    /// Probe immediately, then on every `interval` until cancelled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let was_measured = self.is_measured();
                    if let Some(offset) = self.sync().await {
                        if !was_measured {
                            info!("Clock synchronised, offset {}ms", offset.as_millis());
                        }
                    }
                }
            }
        }
    }
}
