use std::time::Duration;

use anyhow::Context;

/// Max messages fetched in one page.
pub const MESSAGE_PAGE_SIZE: u32 = 200;

/// Presence heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Presence roster poll interval. Shorter than the heartbeat: the roster has no push equivalent.
pub const PRESENCE_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// How often the clock offset is re-measured.
pub const CLOCK_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Offset changes smaller than this do not reschedule expiry timers.
pub const CLOCK_DRIFT_TOLERANCE: Duration = Duration::from_millis(500);

/// Session token refresh interval.
pub const TOKEN_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Provisional lifetime of an optimistic message in an expiring room.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Reconnect notifications arriving within this window cause a single resync.
pub const RESYNC_DEBOUNCE: Duration = Duration::from_millis(250);

/// Longest single timer the expiry scheduler arms. Later deadlines are re-armed on firing.
pub const MAX_TIMER_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

/// Push channel reconnect delays in milliseconds. The last one repeats forever.
pub const RECONNECT_BACKOFF_MS: &[u64] = &[200, 300, 500, 1000, 1200, 1500, 2000];

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub page_size: u32,
    pub heartbeat_interval: Duration,
    pub presence_poll_interval: Duration,
    pub clock_resync_interval: Duration,
    pub clock_drift_tolerance: Duration,
    pub token_refresh_interval: Duration,
    pub default_ttl: Duration,
    pub resync_debounce: Duration,
    pub reconnect_backoff: Vec<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: MESSAGE_PAGE_SIZE,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            presence_poll_interval: PRESENCE_POLL_INTERVAL,
            clock_resync_interval: CLOCK_RESYNC_INTERVAL,
            clock_drift_tolerance: CLOCK_DRIFT_TOLERANCE,
            token_refresh_interval: TOKEN_REFRESH_INTERVAL,
            default_ttl: DEFAULT_TTL,
            resync_debounce: RESYNC_DEBOUNCE,
            reconnect_backoff: RECONNECT_BACKOFF_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

impl SyncConfig {
    /// Defaults overridden by `HEARTH_*` environment variables (durations in milliseconds).
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = var("HEARTH_PAGE_SIZE") {
            config.page_size = v.trim().parse().context("HEARTH_PAGE_SIZE")?;
        }
        for (slot, key) in [
            (&mut config.heartbeat_interval, "HEARTH_HEARTBEAT_MS"),
            (&mut config.presence_poll_interval, "HEARTH_PRESENCE_POLL_MS"),
            (&mut config.clock_resync_interval, "HEARTH_CLOCK_RESYNC_MS"),
            (&mut config.clock_drift_tolerance, "HEARTH_CLOCK_DRIFT_MS"),
            (&mut config.token_refresh_interval, "HEARTH_TOKEN_REFRESH_MS"),
            (&mut config.resync_debounce, "HEARTH_RESYNC_DEBOUNCE_MS"),
        ] {
            if let Some(v) = var(key) {
                *slot = parse_ms(key, &v)?;
            }
        }

        if let Some(v) = var("HEARTH_RECONNECT_BACKOFF_MS") {
            config.reconnect_backoff = v
                .split(',')
                .map(|ms| ms.trim().parse::<u64>().map(Duration::from_millis))
                .collect::<Result<_, _>>()
                .context("HEARTH_RECONNECT_BACKOFF_MS")?;
        }

        if config.page_size == 0 {
            anyhow::bail!("HEARTH_PAGE_SIZE must be positive");
        }
        if config.reconnect_backoff.is_empty() {
            anyhow::bail!("HEARTH_RECONNECT_BACKOFF_MS must list at least one delay");
        }

        Ok(config)
    }

    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn reconnect_delay(&self, attempt: usize) -> Duration {
        self.reconnect_backoff
            .get(attempt)
            .or_else(|| self.reconnect_backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(2))
    }
}

/// Timer periods must be non-zero: `tokio::time::interval` panics on zero.
fn parse_ms(key: &str, value: &str) -> anyhow::Result<Duration> {
    let ms: u64 = value.trim().parse().with_context(|| format!("{} must be milliseconds", key))?;
    if ms == 0 {
        anyhow::bail!("{} must be positive", key);
    }
    Ok(Duration::from_millis(ms))
}
