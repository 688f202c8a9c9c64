//! Interval timers for the background loops

use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::warn;

/// Shortest period a loop ticks at
pub(crate) const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Delaying interval timer. A zero period would panic inside tokio, so it is
/// raised to `MIN_PERIOD`.
pub(crate) fn periodic(loop_name: &str, period: Duration) -> Interval {
    let period = if period.is_zero() {
        warn!(loop_name = loop_name, "Zero interval configured, using minimum period");
        MIN_PERIOD
    } else {
        period
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
