use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Paces the dispatcher's PINGs. The master's PONG carries the interval it
/// expects; [`Heartbeat::adjust`] switches to it.
pub struct Heartbeat {
    period: Duration,
    interval: Interval,
}

impl Heartbeat {
    pub fn new(interval_ms: u64) -> Self {
        let period = Duration::from_millis(interval_ms.max(1));
        Self {
            period,
            interval: Self::interval(period),
        }
    }

    fn interval(period: Duration) -> Interval {
        // First tick one period from now: the handshake just proved liveness.
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait until the next PING is due.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Returns `true` when the period changed.
    pub fn adjust(&mut self, interval_ms: u64) -> bool {
        let period = Duration::from_millis(interval_ms.max(1));
        if period == self.period {
            return false;
        }
        tracing::debug!(interval_ms, "Ping interval changed");
        self.period = period;
        self.interval = Self::interval(period);
        true
    }
}
