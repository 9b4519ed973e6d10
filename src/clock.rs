//! # Board Clock
//!
//! Keeps UTC (optionally corrected from a network time source) and the UK
//! daylight-saving offset shown on the boards.
//!
//! ## DST Evaluation
//!
//! British Summer Time runs from 01:00 UTC on the last Sunday of March to
//! 01:00 UTC on the last Sunday of October. The offset is re-evaluated only in
//! [`ClockSync::tick`], which the scheduler drives once a minute. A change that
//! happens between ticks shows up at the next tick.
//!
//! ## Degraded Start
//!
//! If the time server cannot be reached at startup the clock runs on the
//! system time uncorrected. The boards flag this, and the sync is retried on
//! the resync cadence when one is configured.

use crate::ntp::{TimeSource, TimeSyncError};
use crate::ClockTime;
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum Fatal {
    #[error("clock initialisation failed: {0}")]
    ClockInitFailure(#[source] TimeSyncError),
}

/// Snapshot of the board clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockState {
    pub utc: DateTime<Utc>,
    /// Zero in winter, one hour during BST
    pub dst_offset: TimeDelta,
    pub last_dst_eval: DateTime<Utc>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl ClockState {
    fn at(utc: DateTime<Utc>) -> Self {
        Self {
            utc,
            dst_offset: uk_dst_offset(utc),
            last_dst_eval: utc,
            last_sync: None,
        }
    }

    pub fn local(&self) -> NaiveDateTime {
        self.utc.naive_utc() + self.dst_offset
    }

    /// Local time of day as shown on the boards.
    pub fn local_time(&self) -> ClockTime {
        ClockTime::from(self.local().time())
    }

    pub fn is_synced(&self) -> bool {
        self.last_sync.is_some()
    }

    pub fn is_bst(&self) -> bool {
        !self.dst_offset.is_zero()
    }
}

/// Last Sunday of `month` in `year`.
pub fn last_sunday(year: i32, month: u32) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }?;
    let last = first_of_next.pred_opt()?;
    let back = u64::from(last.weekday().num_days_from_sunday());
    last.checked_sub_days(Days::new(back))
}

/// UK offset from UTC at `utc`.
pub fn uk_dst_offset(utc: DateTime<Utc>) -> TimeDelta {
    let switch = |month| {
        last_sunday(utc.year(), month)
            .and_then(|day| day.and_hms_opt(1, 0, 0))
            .map(|at| at.and_utc())
    };

    match (switch(3), switch(10)) {
        (Some(start), Some(end)) if utc >= start && utc < end => TimeDelta::hours(1),
        _ => TimeDelta::zero(),
    }
}

/// Owner of the [`ClockState`]; the only thing that mutates it.
#[derive(Debug, Clone)]
pub struct ClockSync {
    state: ClockState,
    /// Network time minus system time at the last sync
    correction: TimeDelta,
    resync_every: Option<TimeDelta>,
    last_attempt: DateTime<Utc>,
}

impl ClockSync {
    /// Clock running on uncorrected system time.
    pub fn unsynced(system_now: DateTime<Utc>) -> Self {
        Self {
            state: ClockState::at(system_now),
            correction: TimeDelta::zero(),
            resync_every: None,
            last_attempt: system_now,
        }
    }

    /// Sets the clock from `source`.
    ///
    /// Callers that cannot do without a clock fall back to [`ClockSync::unsynced`].
    pub async fn initialize<T: TimeSource>(
        source: &mut T,
        system_now: DateTime<Utc>,
    ) -> Result<Self, Fatal> {
        let network_now = source
            .network_time()
            .await
            .map_err(Fatal::ClockInitFailure)?;

        let mut state = ClockState::at(network_now);
        state.last_sync = Some(network_now);
        info!(utc = %network_now, bst = state.is_bst(), "Clock synchronised");

        Ok(Self {
            state,
            correction: network_now - system_now,
            resync_every: None,
            last_attempt: network_now,
        })
    }

    /// Resync with the time source every `every`; `None` disables it.
    ///
    /// Intervals under a minute are raised to one minute.
    pub fn with_resync(mut self, every: Option<Duration>) -> Self {
        self.resync_every = every
            .map(|d| d.max(Duration::from_secs(60)))
            .and_then(|d| TimeDelta::from_std(d).ok());
        self
    }

    pub fn state(&self) -> &ClockState {
        &self.state
    }

    /// Moves the clock forward without looking at DST.
    pub fn advance(&mut self, system_now: DateTime<Utc>) -> ClockState {
        self.state.utc = system_now + self.correction;
        self.state
    }

    /// Minute tick: advances the clock and re-evaluates the DST offset.
    pub fn tick(&mut self, system_now: DateTime<Utc>) -> ClockState {
        self.advance(system_now);
        let offset = uk_dst_offset(self.state.utc);
        if offset != self.state.dst_offset {
            info!(
                utc = %self.state.utc,
                offset_minutes = offset.num_minutes(),
                "Daylight saving offset changed"
            );
            self.state.dst_offset = offset;
        }
        self.state.last_dst_eval = self.state.utc;
        self.state
    }

    pub fn resync_due(&self) -> bool {
        self.resync_every
            .is_some_and(|every| self.state.utc - self.last_attempt >= every)
    }

    /// Re-reads network time; on failure the current correction is kept.
    pub async fn resync<T: TimeSource>(
        &mut self,
        source: &mut T,
        system_now: DateTime<Utc>,
    ) -> Result<(), TimeSyncError> {
        self.advance(system_now);
        self.last_attempt = self.state.utc;

        match source.network_time().await {
            Ok(network_now) => {
                let drift = network_now - self.state.utc;
                self.correction = network_now - system_now;
                self.state.utc = network_now;
                self.state.last_sync = Some(network_now);
                self.last_attempt = network_now;
                info!(drift_ms = drift.num_milliseconds(), "Clock resynchronised");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Clock resync failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::doubles::FixedTime;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn last_sundays() {
        assert_eq!(last_sunday(2024, 3), NaiveDate::from_ymd_opt(2024, 3, 31));
        assert_eq!(last_sunday(2024, 10), NaiveDate::from_ymd_opt(2024, 10, 27));
        assert_eq!(last_sunday(2025, 3), NaiveDate::from_ymd_opt(2025, 3, 30));
        assert_eq!(last_sunday(2025, 10), NaiveDate::from_ymd_opt(2025, 10, 26));
        assert_eq!(last_sunday(2023, 12), NaiveDate::from_ymd_opt(2023, 12, 31));
    }

    #[test]
    fn uk_offset_switches_at_one_utc() {
        assert!(uk_dst_offset(utc(2024, 3, 31, 0, 59)).is_zero());
        assert_eq!(uk_dst_offset(utc(2024, 3, 31, 1, 0)), TimeDelta::hours(1));
        assert_eq!(uk_dst_offset(utc(2024, 7, 1, 12, 0)), TimeDelta::hours(1));
        assert_eq!(uk_dst_offset(utc(2024, 10, 27, 0, 59)), TimeDelta::hours(1));
        assert!(uk_dst_offset(utc(2024, 10, 27, 1, 0)).is_zero());
        assert!(uk_dst_offset(utc(2024, 1, 15, 12, 0)).is_zero());
    }

    #[test]
    fn offset_changes_only_on_tick() {
        let mut clock = ClockSync::unsynced(utc(2024, 3, 31, 0, 59));
        assert!(!clock.state().is_bst());

        // Crossing the boundary between ticks is not picked up by advance
        let state = clock.advance(utc(2024, 3, 31, 1, 0));
        assert!(!state.is_bst());
        assert_eq!(state.local_time().to_string(), "01:00");

        let state = clock.tick(utc(2024, 3, 31, 1, 0));
        assert!(state.is_bst());
        assert_eq!(state.local_time().to_string(), "02:00");
        assert_eq!(state.last_dst_eval, utc(2024, 3, 31, 1, 0));
    }

    #[tokio::test]
    async fn initialize_applies_correction() {
        let network = utc(2024, 6, 1, 9, 0);
        let system = network - TimeDelta::minutes(3);
        let mut source = FixedTime::ok(network);

        let mut clock = ClockSync::initialize(&mut source, system).await.unwrap();
        assert!(clock.state().is_synced());
        assert!(clock.state().is_bst());
        assert_eq!(clock.state().local_time().to_string(), "10:00");

        let state = clock.advance(system + TimeDelta::minutes(1));
        assert_eq!(state.utc, network + TimeDelta::minutes(1));
    }

    #[tokio::test]
    async fn initialize_failure_is_reported() {
        let mut source = FixedTime::failing();
        let err = ClockSync::initialize(&mut source, utc(2024, 6, 1, 9, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, Fatal::ClockInitFailure(_)));
    }

    #[tokio::test]
    async fn resync_cadence() {
        let start = utc(2024, 1, 10, 8, 0);
        let mut clock = ClockSync::unsynced(start).with_resync(Some(Duration::from_secs(10)));
        assert!(!clock.resync_due());

        // Clamped to one minute
        clock.advance(start + TimeDelta::seconds(30));
        assert!(!clock.resync_due());
        clock.advance(start + TimeDelta::minutes(1));
        assert!(clock.resync_due());

        let mut source = FixedTime::ok(start + TimeDelta::minutes(2));
        clock.resync(&mut source, start + TimeDelta::minutes(1)).await.unwrap();
        assert!(clock.state().is_synced());
        assert!(!clock.resync_due());
        assert_eq!(clock.state().utc, start + TimeDelta::minutes(2));
    }

    #[test]
    fn no_resync_without_cadence() {
        let start = utc(2024, 1, 10, 8, 0);
        let mut clock = ClockSync::unsynced(start).with_resync(None);
        clock.advance(start + TimeDelta::days(2));
        assert!(!clock.resync_due());
    }
}
