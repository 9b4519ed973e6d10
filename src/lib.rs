//! # Departure Board Core Library
//!
//! This library provides the data structures and pipeline stages for a two-screen
//! railway departure board. It's designed for devices where the live departures
//! payload can be larger than the memory available to hold it as a parsed tree.
//!
//! ## Design Philosophy
//!
//! ### Memory Efficiency
//! - **Bounded model**: at most [`SERVICES_PER_SCREEN`] services are kept per screen,
//!   every kept string is length-capped at extraction time
//! - **One buffer at a time**: the raw response is dropped as soon as the
//!   [`extractor::BoundedJsonExtractor`] has copied out the fields it needs
//! - **Whole-model replacement**: a [`DepartureModel`] is never patched in place;
//!   each successful refresh builds a new one and the previous one is dropped
//!
//! ### Data Flow
//! 1. **Online**: fetch → extract → commit → render on both screens
//! 2. **Retry**: transient failures back off exponentially inside a fixed window
//! 3. **Offline**: the bundled dataset (or the last good model, marked stale) is shown
//!
//! ## Core Types
//!
//! - [`ClockTime`]: a board time ("HH:MM"), strictly parsed
//! - [`Service`] / [`CallingPoint`]: one departure and its subsequent stops
//! - [`DepartureModel`]: station, per-screen departures and travel alerts

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// Module declarations
pub mod clock;
pub mod config;
pub mod display;
pub mod extractor;
pub mod fallback;
pub mod fetch_client;
pub mod ntp;
pub mod rail_data;
pub mod renderer;
pub mod scheduler;

#[cfg(test)]
mod tests;

/// Number of departures a single screen can show.
pub const SERVICES_PER_SCREEN: usize = 2;

const MINUTES_PER_DAY: i16 = 1440;

/// A time of day as printed on a departure board.
///
/// Board times carry no date. Comparisons between two times therefore go through
/// [`ClockTime::minutes_since`], which treats the shorter way round the clock face
/// as the real difference so that `00:10` comes after `23:50`.
///
/// # Example
/// ```
/// use departure_board_lib::ClockTime;
///
/// let sched: ClockTime = "23:50".parse().unwrap();
/// let est: ClockTime = "00:05".parse().unwrap();
/// assert_eq!(est.minutes_since(sched), 15);
/// assert!("9:05".parse::<ClockTime>().is_err());
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClockTime {
    hour: u8,
    minute: u8,
}

/// A time field did not match the fixed `HH:MM` pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected HH:MM, got {0:?}")]
pub struct InvalidClockTime(pub String);

impl ClockTime {
    /// Builds a time, rejecting out-of-range hours or minutes.
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    /// Minutes elapsed since midnight (0..1440).
    pub fn minutes_of_day(self) -> i16 {
        i16::from(self.hour) * 60 + i16::from(self.minute)
    }

    /// Signed minutes from `origin` to `self`, in the range -720..720.
    pub fn minutes_since(self, origin: ClockTime) -> i16 {
        let diff = (self.minutes_of_day() - origin.minutes_of_day()).rem_euclid(MINUTES_PER_DAY);
        if diff >= MINUTES_PER_DAY / 2 {
            diff - MINUTES_PER_DAY
        } else {
            diff
        }
    }
}

impl FromStr for ClockTime {
    type Err = InvalidClockTime;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidClockTime(s.to_string());
        let digit = |b: u8| b.is_ascii_digit().then(|| b - b'0');

        match s.as_bytes() {
            [h1, h2, b':', m1, m2] => match (digit(*h1), digit(*h2), digit(*m1), digit(*m2)) {
                (Some(h1), Some(h2), Some(m1), Some(m2)) => {
                    ClockTime::new(h1 * 10 + h2, m1 * 10 + m2).ok_or_else(invalid)
                }
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

impl From<chrono::NaiveTime> for ClockTime {
    fn from(time: chrono::NaiveTime) -> Self {
        use chrono::Timelike;
        // NaiveTime guarantees hour < 24 and minute < 60
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
        }
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Running state of a departure relative to its timetable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelayStatus {
    OnTime,
    /// Late; the new time is known unless the feed only says "Delayed".
    Delayed(Option<ClockTime>),
    Cancelled,
}

impl DelayStatus {
    /// Interprets an estimated-time field against the scheduled time.
    ///
    /// Accepts a fixed `HH:MM` time or one of the feed's status words
    /// ("On time", "Delayed", "Cancelled"). Anything else is rejected.
    pub fn from_estimate(scheduled: ClockTime, estimate: &str) -> Result<Self, InvalidClockTime> {
        let estimate = estimate.trim();
        if estimate.eq_ignore_ascii_case("on time") {
            return Ok(DelayStatus::OnTime);
        }
        if estimate.eq_ignore_ascii_case("delayed") {
            return Ok(DelayStatus::Delayed(None));
        }
        if estimate.eq_ignore_ascii_case("cancelled") || estimate.eq_ignore_ascii_case("canceled") {
            return Ok(DelayStatus::Cancelled);
        }

        let expected: ClockTime = estimate.parse()?;
        Ok(if expected == scheduled {
            DelayStatus::OnTime
        } else {
            DelayStatus::Delayed(Some(expected))
        })
    }
}

impl fmt::Display for DelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelayStatus::OnTime => f.write_str("on time"),
            DelayStatus::Delayed(Some(time)) => write!(f, "delayed to {time}"),
            DelayStatus::Delayed(None) => f.write_str("delayed"),
            DelayStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A station a service calls at after leaving this one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallingPoint {
    pub name: String,
    pub time: ClockTime,
}

impl CallingPoint {
    pub fn new(name: impl Into<String>, time: ClockTime) -> Self {
        Self {
            name: name.into(),
            time,
        }
    }
}

/// One departure from the board's station.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Service {
    /// Timetabled departure time
    pub scheduled: ClockTime,
    /// Estimated or actual departure time, when the feed gave one
    pub estimated: Option<ClockTime>,
    pub destination: String,
    pub platform: Option<String>,
    pub operator: Option<String>,
    pub status: DelayStatus,
    /// Subsequent stops, earliest first
    pub calling_points: Vec<CallingPoint>,
}

impl Service {
    /// Time the service is now expected to leave.
    pub fn due_time(&self) -> ClockTime {
        match self.status {
            DelayStatus::Delayed(Some(time)) => time,
            _ => self.scheduled,
        }
    }

    /// Minutes late against the timetable (zero when on time or unknown).
    pub fn delay_minutes(&self) -> i16 {
        self.due_time().minutes_since(self.scheduled)
    }

    /// Minutes from `now` until the due time; negative once it has passed.
    pub fn minutes_until_due(&self, now: ClockTime) -> i16 {
        self.due_time().minutes_since(now)
    }
}

/// A travel alert shown after the departures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub message: String,
    /// Set for the user-configured message, which supersedes live alerts
    pub is_override: bool,
}

impl Alert {
    pub fn live(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_override: false,
        }
    }

    pub fn custom(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_override: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Station {
    /// Three-letter station code, e.g. "EUS"
    pub code: String,
    pub name: String,
}

/// The departures kept for one screen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScreenDepartures {
    /// Platform this screen follows; `None` shows every platform
    pub platform: Option<String>,
    /// At most [`SERVICES_PER_SCREEN`] services, earliest first
    pub services: Vec<Service>,
}

impl ScreenDepartures {
    pub fn new(platform: Option<String>) -> Self {
        Self {
            platform,
            services: Vec::with_capacity(SERVICES_PER_SCREEN),
        }
    }

    /// Whether `service` belongs on this screen.
    pub fn accepts(&self, service: &Service) -> bool {
        match &self.platform {
            None => true,
            Some(platform) => service.platform.as_deref() == Some(platform.as_str()),
        }
    }
}

/// Everything the boards show for one refresh cycle.
///
/// Built in one piece by the extractor and replaced in one piece by the
/// scheduler; renderers only ever see a complete model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepartureModel {
    pub station: Station,
    /// One entry per configured screen, in screen order
    pub screens: Vec<ScreenDepartures>,
    pub alerts: Vec<Alert>,
}

impl DepartureModel {
    /// A model with no departures and no alerts.
    pub fn empty(station: Station, platforms: &[Option<String>]) -> Self {
        Self {
            station,
            screens: platforms.iter().cloned().map(ScreenDepartures::new).collect(),
            alerts: Vec::new(),
        }
    }

    pub fn screen(&self, index: usize) -> Option<&ScreenDepartures> {
        self.screens.get(index)
    }

    /// Departures for a screen; empty when the screen index is unknown.
    pub fn services(&self, screen: usize) -> &[Service] {
        self.screen(screen)
            .map(|s| s.services.as_slice())
            .unwrap_or_default()
    }

    pub fn has_departures(&self) -> bool {
        self.screens.iter().any(|s| !s.services.is_empty())
    }

    /// The alert a board should show: the custom override if any, else the first live one.
    pub fn active_alert(&self) -> Option<&Alert> {
        self.alerts
            .iter()
            .find(|a| a.is_override)
            .or_else(|| self.alerts.first())
    }

    /// Installs the user-configured alert ahead of any live ones.
    pub fn with_custom_alert(mut self, message: Option<&str>) -> Self {
        if let Some(message) = message.map(str::trim).filter(|m| !m.is_empty()) {
            self.alerts.retain(|a| !a.is_override);
            self.alerts.insert(0, Alert::custom(message));
        }
        self
    }

    /// One-line description of a screen's departures for the logs.
    pub fn summary(&self, screen: usize) -> String {
        let services = self.services(screen);
        if services.is_empty() {
            return "No departures".to_string();
        }
        services
            .iter()
            .map(|s| format!("{} ({})", s.destination, s.scheduled))
            .collect::<Vec<_>>()
            .join(" and ")
    }
}
