//! # Board Layout Rendering
//!
//! Turns the committed departure data and the clock into a [`Layout`] for one
//! screen. Rendering is pure: the same [`Feed`], screen and [`ClockState`] always
//! give an equal layout, and nothing here touches a display. Drawing the layout
//! is left to a [`crate::display::Screen`].
//!
//! ## Layout Rules
//!
//! - Up to two departures, each with position, scheduled time and destination
//! - A due-time annotation only when the first departure is late or cancelled
//! - Calling points only for the first departure
//! - One alert, the custom override ahead of live ones
//! - "No departures" when the screen's list is empty, "No data" when nothing
//!   was ever obtained
//! - Status indicators for stale data, offline data and an unsynchronised clock

use crate::clock::ClockState;
use crate::rail_data::Refresh;
use crate::{ClockTime, DelayStatus, DepartureModel, Service, SERVICES_PER_SCREEN};
use chrono::{DateTime, TimeDelta, Utc};
use std::rc::Rc;
use std::time::Duration;

/// Where the committed model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// Nothing fetched yet
    Loading,
    Live,
    /// Last live data kept after a failed refresh, or simply too old
    Stale,
    /// Offline dataset
    Offline,
}

/// The model slot the scheduler owns and the renderer reads.
#[derive(Debug, Clone)]
pub struct Feed {
    model: Option<Rc<DepartureModel>>,
    status: FeedStatus,
    updated_at: Option<DateTime<Utc>>,
}

impl Default for Feed {
    fn default() -> Self {
        Self::loading()
    }
}

impl Feed {
    pub fn loading() -> Self {
        Self {
            model: None,
            status: FeedStatus::Loading,
            updated_at: None,
        }
    }

    pub fn live(model: DepartureModel, at: DateTime<Utc>) -> Self {
        Self {
            model: Some(Rc::new(model)),
            status: FeedStatus::Live,
            updated_at: Some(at),
        }
    }

    pub fn offline(model: Rc<DepartureModel>) -> Self {
        Self {
            model: Some(model),
            status: FeedStatus::Offline,
            updated_at: None,
        }
    }

    /// Replaces the slot with the outcome of a refresh.
    ///
    /// Live data replaces whatever was there. A failed refresh keeps earlier live
    /// data as stale, otherwise the offline dataset is shown.
    pub fn commit(&mut self, refresh: Refresh, now: DateTime<Utc>) -> FeedStatus {
        let next = match refresh {
            Refresh::Live(model) => Feed::live(model, now),
            Refresh::Offline { dataset, .. } => match (self.status, self.model.take()) {
                (FeedStatus::Live | FeedStatus::Stale, Some(previous)) => Feed {
                    model: Some(previous),
                    status: FeedStatus::Stale,
                    updated_at: self.updated_at,
                },
                _ => Feed::offline(dataset),
            },
        };
        *self = next;
        self.status
    }

    pub fn model(&self) -> Option<&DepartureModel> {
        self.model.as_deref()
    }

    pub fn status(&self) -> FeedStatus {
        self.status
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Status with ageing applied: live data older than `stale_after` is stale.
    pub fn status_at(&self, now: DateTime<Utc>, stale_after: Duration) -> FeedStatus {
        let limit = TimeDelta::from_std(stale_after).unwrap_or_else(|_| TimeDelta::days(365));
        match (self.status, self.updated_at) {
            (FeedStatus::Live, Some(at)) if now - at > limit => FeedStatus::Stale,
            (status, _) => status,
        }
    }
}

/// Status flags shown next to the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Stale,
    Offline,
    Unsynced,
}

impl Indicator {
    pub fn label(self) -> &'static str {
        match self {
            Indicator::Stale => "STALE",
            Indicator::Offline => "OFFLINE",
            Indicator::Unsynced => "NO SYNC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepartureLine {
    /// 1 for the next departure, 2 for the one after
    pub position: usize,
    pub time: ClockTime,
    /// Destination wrapped to the destination column
    pub destination: Vec<String>,
    /// Minutes until the due time, for the next live departure
    pub minutes_away: Option<i16>,
}

impl DepartureLine {
    /// Single-row text, e.g. `1 Birmingham    10:00`.
    pub fn text(&self, columns: usize) -> String {
        let width = columns.saturating_sub(8);
        let destination = self.destination.first().map(String::as_str).unwrap_or("");
        format!("{} {:<width$} {}", self.position, truncate(destination, width), self.time)
    }
}

/// Everything one screen shows for one render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub screen: usize,
    pub title: String,
    pub departures: Vec<DepartureLine>,
    pub due: Option<String>,
    pub calling_at: Vec<String>,
    pub notice: Option<String>,
    pub alert: Vec<String>,
    pub clock: ClockTime,
    pub indicators: Vec<Indicator>,
    pub columns: usize,
}

impl Layout {
    /// Clock followed by any indicators.
    pub fn status_line(&self) -> String {
        let mut line = self.clock.to_string();
        for indicator in &self.indicators {
            line.push(' ');
            line.push_str(indicator.label());
        }
        truncate(&line, self.columns).to_string()
    }

    /// Three-row pages for a small screen, shown in turn.
    ///
    /// The first departure and the status line stay put. The middle row steps
    /// through the due annotation, the calling points, the second departure and
    /// then the alert. There is always at least one page.
    pub fn frames(&self) -> Vec<[String; 3]> {
        let columns = self.columns;
        let first = match (self.departures.first(), &self.notice) {
            (Some(line), _) => line.text(columns),
            (None, Some(notice)) => truncate(notice, columns).to_string(),
            (None, None) => String::new(),
        };
        let status = self.status_line();

        let mut middle: Vec<String> = self
            .due
            .iter()
            .chain(&self.calling_at)
            .map(|row| truncate(row, columns).to_string())
            .collect();
        middle.extend(self.departures.iter().skip(1).map(|line| line.text(columns)));
        middle.extend(self.alert.iter().map(|row| truncate(row, columns).to_string()));
        if middle.is_empty() {
            middle.push(String::new());
        }

        middle
            .into_iter()
            .map(|row| [first.clone(), row, status.clone()])
            .collect()
    }
}

/// Character geometry of a screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutStyle {
    pub columns: usize,
    pub destination_chars: usize,
    pub alert_chars: usize,
}

impl Default for LayoutStyle {
    fn default() -> Self {
        // 128 px at 6 px per glyph
        Self {
            columns: 21,
            destination_chars: 12,
            alert_chars: 19,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoardRenderer {
    style: LayoutStyle,
    stale_after: Duration,
}

impl BoardRenderer {
    pub fn new(style: LayoutStyle, stale_after: Duration) -> Self {
        Self { style, stale_after }
    }

    pub fn style(&self) -> &LayoutStyle {
        &self.style
    }

    pub fn render(&self, feed: &Feed, screen: usize, clock: &ClockState) -> Layout {
        let status = feed.status_at(clock.utc, self.stale_after);
        let now = clock.local_time();

        let mut indicators = Vec::new();
        match status {
            FeedStatus::Stale => indicators.push(Indicator::Stale),
            FeedStatus::Offline => indicators.push(Indicator::Offline),
            FeedStatus::Loading | FeedStatus::Live => {}
        }
        if !clock.is_synced() {
            indicators.push(Indicator::Unsynced);
        }

        let mut layout = Layout {
            screen,
            title: "Departures".to_string(),
            departures: Vec::new(),
            due: None,
            calling_at: Vec::new(),
            notice: None,
            alert: Vec::new(),
            clock: now,
            indicators,
            columns: self.style.columns,
        };

        let Some(model) = feed.model() else {
            layout.notice = Some(match status {
                FeedStatus::Loading => "Loading...".to_string(),
                _ => "No data".to_string(),
            });
            return layout;
        };

        layout.title = match model.screen(screen).and_then(|s| s.platform.as_deref()) {
            Some(platform) => format!("{} P{}", model.station.name, platform),
            None => model.station.name.clone(),
        };

        let services = model.services(screen);
        for (index, service) in services.iter().take(SERVICES_PER_SCREEN).enumerate() {
            let minutes_away =
                (index == 0 && status == FeedStatus::Live).then(|| service.minutes_until_due(now));
            layout.departures.push(DepartureLine {
                position: index + 1,
                time: service.scheduled,
                destination: wrap_text(&service.destination, self.style.destination_chars),
                minutes_away,
            });
        }

        match services.first() {
            Some(first) => {
                layout.due = due_annotation(first);
                layout.calling_at = wrap_text(&calling_at_text(first), self.style.columns);
            }
            None => layout.notice = Some("No departures".to_string()),
        }

        if let Some(alert) = model.active_alert() {
            layout.alert = wrap_text(&alert.message, self.style.alert_chars);
        }

        layout
    }
}

/// Due-time text for a departure that is not running to time.
pub fn due_annotation(service: &Service) -> Option<String> {
    match service.status {
        DelayStatus::OnTime => None,
        DelayStatus::Delayed(Some(_)) => Some(format!("Now due: {}", service.due_time())),
        DelayStatus::Delayed(None) => Some("Delayed".to_string()),
        DelayStatus::Cancelled => Some("Cancelled".to_string()),
    }
}

/// `Calling at: A 10:15, B 10:30 and C 10:45 (Operator)`.
pub fn calling_at_text(service: &Service) -> String {
    let operator = service
        .operator
        .as_deref()
        .map(|op| format!(" ({op})"))
        .unwrap_or_default();

    match service.calling_points.split_last() {
        None => format!("Calling at destination only{operator}"),
        Some((last, [])) => format!("Calling at: {} {}{operator}", last.name, last.time),
        Some((last, rest)) => {
            let head = rest
                .iter()
                .map(|p| format!("{} {}", p.name, p.time))
                .collect::<Vec<_>>()
                .join(", ");
            format!("Calling at: {head} and {} {}{operator}", last.name, last.time)
        }
    }
}

/// Greedy word wrap; words longer than a line are split.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let mut word = word;
        loop {
            let word_len = word.chars().count();
            let needed = if current_len == 0 { word_len } else { current_len + 1 + word_len };

            if needed <= width {
                if current_len > 0 {
                    current.push(' ');
                }
                current.push_str(word);
                current_len = needed;
                break;
            }
            if current_len > 0 {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
                continue;
            }
            // Word alone is too long for a line
            let head = truncate(word, width);
            lines.push(head.to_string());
            word = &word[head.len()..];
            if word.is_empty() {
                break;
            }
        }
    }
    if current_len > 0 {
        lines.push(current);
    }
    lines
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockSync;
    use crate::{CallingPoint, ScreenDepartures, Station};
    use chrono::TimeZone;

    fn t(s: &str) -> ClockTime {
        s.parse().unwrap()
    }

    fn service(sched: &str, dest: &str, status: DelayStatus) -> Service {
        Service {
            scheduled: t(sched),
            estimated: None,
            destination: dest.into(),
            platform: Some("1".into()),
            operator: Some("Avanti West Coast".into()),
            status,
            calling_points: vec![
                CallingPoint::new("Watford Junction", t("10:15")),
                CallingPoint::new("Milton Keynes", t("10:35")),
                CallingPoint::new("Birmingham", t("11:20")),
            ],
        }
    }

    fn model(services: Vec<Service>) -> DepartureModel {
        DepartureModel {
            station: Station {
                code: "EUS".into(),
                name: "Euston".into(),
            },
            screens: vec![ScreenDepartures {
                platform: Some("1".into()),
                services,
            }],
            alerts: vec![],
        }
    }

    fn utc_now() -> DateTime<Utc> {
        // 09:58 GMT
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 58, 0).unwrap()
    }

    fn synced_clock() -> ClockState {
        let mut state = *ClockSync::unsynced(utc_now()).state();
        state.last_sync = Some(utc_now());
        state
    }

    fn renderer() -> BoardRenderer {
        BoardRenderer::new(LayoutStyle::default(), Duration::from_secs(80))
    }

    #[test]
    fn two_departures_and_first_calling_points() {
        let feed = Feed::live(
            model(vec![
                service("10:00", "Birmingham New Street", DelayStatus::OnTime),
                service("10:20", "Crewe", DelayStatus::OnTime),
            ]),
            utc_now(),
        );
        let layout = renderer().render(&feed, 0, &synced_clock());

        assert_eq!(layout.title, "Euston P1");
        assert_eq!(layout.departures.len(), 2);
        assert_eq!(layout.departures[0].destination, vec!["Birmingham", "New Street"]);
        assert_eq!(layout.departures[0].minutes_away, Some(2));
        assert_eq!(layout.departures[1].minutes_away, None);
        assert_eq!(layout.due, None);
        assert_eq!(
            layout.calling_at.join(" "),
            "Calling at: Watford Junction 10:15, Milton Keynes 10:35 and Birmingham 11:20 (Avanti West Coast)"
        );
        assert!(layout.indicators.is_empty());

        let frames = layout.frames();
        let middles: Vec<&str> = frames.iter().map(|f| f[1].as_str()).collect();
        assert_eq!(
            middles,
            vec![
                "Calling at: Watford",
                "Junction 10:15,",
                "Milton Keynes 10:35",
                "and Birmingham 11:20",
                "(Avanti West Coast)",
                "2 Crewe         10:20",
            ]
        );
        assert!(frames.iter().all(|f| f[0] == "1 Birmingham    10:00" && f[2] == "09:58"));
    }

    #[test]
    fn due_annotation_only_for_first_departure() {
        let feed = Feed::live(
            model(vec![
                service("10:00", "Crewe", DelayStatus::Delayed(Some(t("10:05")))),
                service("10:20", "Rugby", DelayStatus::Cancelled),
            ]),
            utc_now(),
        );
        let layout = renderer().render(&feed, 0, &synced_clock());
        assert_eq!(layout.due.as_deref(), Some("Now due: 10:05"));
        assert_eq!(layout.departures[0].minutes_away, Some(7));
        let frames = layout.frames();
        assert_eq!(frames[0][1], "Now due: 10:05");
        // The second departure still gets its page after the calling points
        assert_eq!(frames.last().unwrap()[1], "2 Rugby         10:20");

        let feed = Feed::live(
            model(vec![service("10:00", "Crewe", DelayStatus::Cancelled)]),
            utc_now(),
        );
        let layout = renderer().render(&feed, 0, &synced_clock());
        assert_eq!(layout.due.as_deref(), Some("Cancelled"));
    }

    #[test]
    fn rendering_is_repeatable() {
        let feed = Feed::live(
            model(vec![service("10:00", "Crewe", DelayStatus::Delayed(None))]),
            utc_now(),
        );
        let clock = synced_clock();
        let renderer = renderer();
        assert_eq!(renderer.render(&feed, 0, &clock), renderer.render(&feed, 0, &clock));
    }

    #[test]
    fn empty_screen_says_no_departures() {
        let feed = Feed::live(model(vec![]), utc_now());
        let layout = renderer().render(&feed, 0, &synced_clock());
        assert!(layout.departures.is_empty());
        assert_eq!(layout.notice.as_deref(), Some("No departures"));
        assert_eq!(layout.frames(), vec![["No departures".to_string(), String::new(), "09:58".to_string()]]);

        // Unknown screens render the same way
        let layout = renderer().render(&feed, 3, &synced_clock());
        assert_eq!(layout.notice.as_deref(), Some("No departures"));
    }

    #[test]
    fn nothing_obtained_is_explicit() {
        let clock = synced_clock();
        let layout = renderer().render(&Feed::loading(), 0, &clock);
        assert_eq!(layout.notice.as_deref(), Some("Loading..."));

        let mut feed = Feed::loading();
        let empty = model(vec![]);
        feed.commit(
            Refresh::Offline {
                dataset: Rc::new(empty),
                reason: crate::rail_data::FailureReason::OfflineMode,
            },
            utc_now(),
        );
        let layout = renderer().render(&feed, 0, &clock);
        assert_eq!(layout.indicators, vec![Indicator::Offline]);
        assert_eq!(layout.status_line(), "09:58 OFFLINE");
    }

    #[test]
    fn failed_refresh_keeps_live_data_as_stale() {
        let mut feed = Feed::live(
            model(vec![service("10:00", "Crewe", DelayStatus::OnTime)]),
            utc_now(),
        );
        let status = feed.commit(
            Refresh::Offline {
                dataset: Rc::new(model(vec![])),
                reason: crate::rail_data::FailureReason::OfflineMode,
            },
            utc_now(),
        );
        assert_eq!(status, FeedStatus::Stale);

        let layout = renderer().render(&feed, 0, &synced_clock());
        assert_eq!(layout.departures[0].destination, vec!["Crewe"]);
        assert_eq!(layout.indicators, vec![Indicator::Stale]);
        assert_eq!(layout.departures[0].minutes_away, None);
    }

    #[test]
    fn old_live_data_turns_stale() {
        let feed = Feed::live(model(vec![]), utc_now());
        let mut clock = synced_clock();
        clock.utc = utc_now() + TimeDelta::seconds(80);
        assert_eq!(feed.status_at(clock.utc, Duration::from_secs(80)), FeedStatus::Live);
        clock.utc = utc_now() + TimeDelta::seconds(81);
        let layout = renderer().render(&feed, 0, &clock);
        assert_eq!(layout.indicators, vec![Indicator::Stale]);
    }

    #[test]
    fn unsynced_clock_is_flagged() {
        let feed = Feed::live(model(vec![]), utc_now());
        let clock = *ClockSync::unsynced(utc_now()).state();
        let layout = renderer().render(&feed, 0, &clock);
        assert_eq!(layout.indicators, vec![Indicator::Unsynced]);
        assert_eq!(layout.status_line(), "09:58 NO SYNC");
    }

    #[test]
    fn override_alert_is_shown() {
        let mut m = model(vec![]);
        m.alerts.push(crate::Alert::live("Disruption between Rugby and Crewe"));
        let m = m.with_custom_alert(Some("Happy holidays"));
        let layout = renderer().render(&Feed::live(m, utc_now()), 0, &synced_clock());
        assert_eq!(layout.alert, vec!["Happy holidays"]);
        assert_eq!(layout.frames()[0][1], "Happy holidays");
    }

    #[test]
    fn calling_at_formats() {
        let mut s = service("10:00", "Crewe", DelayStatus::OnTime);
        s.calling_points.truncate(1);
        assert_eq!(calling_at_text(&s), "Calling at: Watford Junction 10:15 (Avanti West Coast)");

        s.calling_points.clear();
        s.operator = None;
        assert_eq!(calling_at_text(&s), "Calling at destination only");
    }

    #[test]
    fn wrapping() {
        assert_eq!(wrap_text("Falmouth Docks", 12), vec!["Falmouth", "Docks"]);
        assert_eq!(wrap_text("Llanfairpwllgwyngyll", 8), vec!["Llanfair", "pwllgwyn", "gyll"]);
        assert_eq!(wrap_text("  ", 8), Vec::<String>::new());
        assert_eq!(wrap_text("a b c", 3), vec!["a b", "c"]);
    }
}
