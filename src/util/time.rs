//! Time utilities for the authoritative simulation
//!
//! Every engine component works on an explicit millisecond clock (`TimeMs`)
//! handed in by the caller, so tests can drive time by hand and the session
//! loop can drive it from a monotonic `Instant`.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds on a context's simulation clock
pub type TimeMs = u64;

/// Get current Unix timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Default simulation rate
pub const DEFAULT_TICK_RATE: u32 = 60;
/// Weapon snapshots sent per second
pub const SNAPSHOT_TPS: u32 = 10;

/// Length of one tick in milliseconds for the given rate
pub fn tick_millis(tick_rate: u32) -> TimeMs {
    (1_000 / tick_rate.max(1)) as TimeMs
}

/// Convert milliseconds to seconds for kinematics
pub fn ms_to_secs(ms: TimeMs) -> f32 {
    ms as f32 / 1_000.0
}

/// Monotonic clock measuring milliseconds since a session started
#[derive(Debug, Clone)]
pub struct SessionClock {
    start: Instant,
}

impl SessionClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> TimeMs {
        self.start.elapsed().as_millis() as TimeMs
    }
}

impl Default for SessionClock {
    fn default() -> Self {
        Self::new()
    }
}
