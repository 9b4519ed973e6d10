//! # Main Loop
//!
//! One cooperative loop drives everything:
//!
//! - **Refresh**: fetch, parse, commit, render. Runs on the refresh interval,
//!   stretched by a back-off after consecutive failed cycles.
//! - **Clock tick**: advance the clock, re-evaluate DST, resync time when due,
//!   re-render so the boards' clocks move.
//!
//! The scheduler owns the committed [`Feed`] and the [`ClockSync`]. Both are only
//! touched between awaits, so a render always sees a whole model. Refreshes never
//! overlap: the next one is scheduled only after the previous one has committed.

use crate::clock::{ClockState, ClockSync};
use crate::display::Screen;
use crate::fetch_client::Fetch;
use crate::ntp::TimeSource;
use crate::rail_data::{Refresh, ResilientFetcher};
use crate::renderer::{BoardRenderer, Feed, FeedStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Loop timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub refresh_interval: Duration,
    pub clock_tick: Duration,
    /// Wait after the first failed cycle; doubles per further failure
    pub failure_backoff: Duration,
    pub failure_backoff_max: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
            clock_tick: Duration::from_secs(60),
            failure_backoff: Duration::from_secs(5),
            failure_backoff_max: Duration::from_secs(180),
        }
    }
}

impl Cadence {
    /// Wait before the next refresh after `failures` consecutive failed cycles.
    pub fn next_refresh_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.refresh_interval;
        }
        let exponent = (failures - 1).min(16);
        self.failure_backoff
            .saturating_mul(1 << exponent)
            .min(self.failure_backoff_max)
    }
}

pub struct Scheduler<F, T, S> {
    fetcher: ResilientFetcher<F>,
    time_source: T,
    clock: ClockSync,
    renderer: BoardRenderer,
    screens: Vec<S>,
    feed: Feed,
    cadence: Cadence,
    failures: u32,
    wall_clock: fn() -> DateTime<Utc>,
}

impl<F: Fetch, T: TimeSource, S: Screen> Scheduler<F, T, S> {
    pub fn new(
        fetcher: ResilientFetcher<F>,
        time_source: T,
        clock: ClockSync,
        renderer: BoardRenderer,
        screens: Vec<S>,
        cadence: Cadence,
    ) -> Self {
        Self {
            fetcher,
            time_source,
            clock,
            renderer,
            screens,
            feed: Feed::loading(),
            cadence,
            failures: 0,
            wall_clock: Utc::now,
        }
    }

    /// Replaces the system clock reading, for deterministic runs.
    pub fn with_wall_clock(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.wall_clock = now;
        self
    }

    pub fn fetcher(&self) -> &ResilientFetcher<F> {
        &self.fetcher
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn clock(&self) -> &ClockState {
        self.clock.state()
    }

    pub fn screens(&self) -> &[S] {
        &self.screens
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// One refresh cycle. Returns the wait before the next one.
    pub async fn refresh_cycle(&mut self) -> Duration {
        let refresh = self.fetcher.refresh().await;
        let live = matches!(refresh, Refresh::Live(_));
        if let Refresh::Offline { reason, .. } = &refresh {
            debug!(reason = %reason, "Refresh fell back");
        }

        let now = self.clock.advance((self.wall_clock)()).utc;
        let status = self.feed.commit(refresh, now);

        self.failures = if live { 0 } else { self.failures + 1 };
        let delay = self.cadence.next_refresh_delay(self.failures);

        self.log_summary(status);
        if !live {
            warn!(
                failures = self.failures,
                retry_in_s = delay.as_secs(),
                "Refresh cycle failed"
            );
        }

        self.render_all();
        delay
    }

    /// The minute tick: clock, DST, optional time resync, re-render.
    pub async fn clock_cycle(&mut self) {
        let state = self.clock.tick((self.wall_clock)());
        debug!(utc = %state.utc, bst = state.is_bst(), "Clock tick");

        if self.clock.resync_due() {
            let system_now = (self.wall_clock)();
            // Failure is logged inside and the old correction kept
            let _ = self.clock.resync(&mut self.time_source, system_now).await;
        }

        self.render_all();
    }

    /// Renders the committed feed onto every screen.
    pub fn render_all(&mut self) {
        let clock = *self.clock.state();
        for (index, screen) in self.screens.iter_mut().enumerate() {
            let layout = self.renderer.render(&self.feed, index, &clock);
            if let Err(e) = screen.show(&layout) {
                warn!(screen = index + 1, error = %e, "Display update failed");
            }
        }
    }

    fn log_summary(&self, status: FeedStatus) {
        let Some(model) = self.feed.model() else {
            return;
        };
        for screen in 0..self.screens.len() {
            info!(
                screen = screen + 1,
                status = ?status,
                station = %model.station.code,
                "{}",
                model.summary(screen)
            );
        }
    }

    /// One refresh and render, then return.
    pub async fn run_once(&mut self) {
        self.render_all();
        self.refresh_cycle().await;
    }

    /// Runs until the process is stopped.
    ///
    /// A refresh or tick always finishes before the other branch is polled.
    pub async fn run(&mut self) {
        info!(
            refresh_s = self.cadence.refresh_interval.as_secs(),
            tick_s = self.cadence.clock_tick.as_secs(),
            screens = self.screens.len(),
            "Departure board running"
        );
        self.render_all();

        let mut next_refresh = Instant::now();
        let mut ticks = interval_at(Instant::now() + self.cadence.clock_tick, self.cadence.clock_tick);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sleep_until(next_refresh) => {
                    let delay = self.refresh_cycle().await;
                    next_refresh = Instant::now() + delay;
                }
                _ = ticks.tick() => self.clock_cycle().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_delay_backs_off_and_caps() {
        let cadence = Cadence::default();
        let secs = |failures| cadence.next_refresh_delay(failures).as_secs();
        assert_eq!(secs(0), 60);
        assert_eq!(secs(1), 5);
        assert_eq!(secs(2), 10);
        assert_eq!(secs(3), 20);
        assert_eq!(secs(6), 160);
        assert_eq!(secs(7), 180);
        assert_eq!(secs(40), 180);
    }
}
