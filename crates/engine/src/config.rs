//! Tuning knobs for the workers.

use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub router_interval: Duration,
    pub gate_interval: Duration,
    pub dispatcher_interval: Duration,
    pub reconciler_interval: Duration,
    pub time_window_interval: Duration,
    /// How often the approval listener rechecks every event waiting for
    /// approval, in case a notification was lost.
    pub approval_sweep_interval: Duration,
    /// Rows claimed per tick.
    pub batch_size: i64,
    /// A `started` execution without a reference id older than this is
    /// considered lost and finished as failed.
    pub orphan_timeout: Duration,
    /// Timeout of every outbound executor call.
    pub executor_timeout: Duration,
    pub token_lifetime: Duration,
    /// Offset applied to UTC when checking time windows.
    pub time_window_offset: FixedOffset,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            router_interval: Duration::from_secs(1),
            gate_interval: Duration::from_secs(1),
            dispatcher_interval: Duration::from_secs(1),
            reconciler_interval: Duration::from_secs(15),
            time_window_interval: Duration::from_secs(60),
            approval_sweep_interval: Duration::from_secs(60),
            batch_size: 50,
            orphan_timeout: Duration::from_secs(10 * 60),
            executor_timeout: Duration::from_secs(30),
            token_lifetime: Duration::from_secs(24 * 60 * 60),
            time_window_offset: Utc.fix(),
        }
    }
}

impl EngineConfig {
    /// Set the time-window offset in minutes east of UTC. Out-of-range
    /// values fall back to UTC.
    pub fn with_time_window_offset_minutes(mut self, minutes: i32) -> Self {
        self.time_window_offset = minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix());
        self
    }
}
