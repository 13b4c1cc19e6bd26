use std::time::Duration;

use tokio::time::{Instant, Interval, interval_at};

use crate::engine::Config;
use crate::event::Event;

/// Periodic events of a session. Choke ticks come from the engine, shared by all sessions.
pub struct Timers {
    keep_alive: Interval,
    sweep: Interval,
    stats: Interval,
}

impl Timers {
    pub fn new(config: &Config) -> Self {
        Self {
            keep_alive: interval_with_delay(config.keep_alive_interval),
            sweep: interval_with_delay(config.sweep_interval),
            stats: interval_with_delay(config.update_stats_interval),
        }
    }

    pub async fn tick(&mut self) -> Event {
        tokio::select! {
            _ = self.keep_alive.tick() => Event::KeepAliveTicked,
            _ = self.stats.tick() => Event::StatsTicked,
            now = self.sweep.tick() => Event::SweepTicked(now),
        }
    }
}

/// Interval whose first tick is one period from now.
pub fn interval_with_delay(period: Duration) -> Interval {
    let start = Instant::now() + period;
    interval_at(start, period)
}
