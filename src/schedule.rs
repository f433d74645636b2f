// Scheduled start: hold off a run until a wall-clock time of day

use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{error::ConfigError, status::format_elapsed, window::Clock};

const TICK: Duration = Duration::from_secs(1);

pub fn parse_start_time(s: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M:%S")
        .map_err(|_| ConfigError::Invalid(format!("start time '{s}' must be HH:MM:SS")))
}

// Today at `at`, or tomorrow if that moment has already passed
pub fn next_occurrence(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if now.time() > at {
        now.date().succ_opt().unwrap_or(now.date()).and_time(at)
    } else {
        today
    }
}

// Sleep until `target` by the given clock, one tick at a time.
// Re-reads the clock every tick so a wall-clock jump is picked up. Returns
// `false` if `cancel` fired first.
pub async fn wait_until(clock: &dyn Clock, target: NaiveDateTime, cancel: &CancellationToken) -> bool {
    info!(at = %target, "waiting for scheduled start");
    let mut last_logged_minute = None;

    loop {
        let remaining = target - clock.now();
        if remaining <= chrono::Duration::zero() {
            info!("scheduled start reached");
            return true;
        }

        let minute = remaining.num_minutes();
        if last_logged_minute != Some(minute) {
            debug!(remaining = %format_elapsed(remaining), "countdown");
            last_logged_minute = Some(minute);
        }

        let step = remaining.to_std().map(|r| r.min(TICK)).unwrap_or(TICK);
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduled start cancelled");
                return false;
            }
            _ = tokio::time::sleep(step) => {}
        }
    }
}
