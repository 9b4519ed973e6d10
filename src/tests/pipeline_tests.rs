//! # End-to-End Pipeline Tests
//!
//! These tests run the fetch → extract → commit → render pipeline with scripted
//! or in-process collaborators. Timing assertions use tokio's paused clock, so
//! backoff sleeps complete instantly but are still measured.

use crate::clock::ClockSync;
use crate::extractor::BoundedJsonExtractor;
use crate::fallback::OfflineDataset;
use crate::fetch_client::{Backend, FetchClient, Query, TransportError};
use crate::rail_data::{FailureReason, Refresh, ResilientFetcher, RetryPolicy};
use crate::renderer::{BoardRenderer, FeedStatus, Indicator, LayoutStyle};
use crate::scheduler::{Cadence, Scheduler};
use crate::tests::doubles::{BrokenScreen, FixedTime, RecordingScreen, ScriptedFetch};
use crate::tests::http_stub::{serve_once, StubResponse};
use crate::{CallingPoint, ClockTime, DelayStatus};
use chrono::{DateTime, TimeZone, Utc};
use std::cell::Cell;
use std::time::Duration;
use tokio::time::Instant;

const SCENARIO_1: &str = r#"{"station":"EUS","services":[{"sched":"10:00","est":"10:05","dest":"Birmingham","platform":"4","callingPoints":[{"name":"Watford","time":"10:15"}]}]}"#;

thread_local! {
    static NOW: Cell<DateTime<Utc>> = Cell::new(Utc.with_ymd_and_hms(2024, 1, 15, 9, 58, 0).unwrap());
}

fn fake_now() -> DateTime<Utc> {
    NOW.with(Cell::get)
}

fn set_now(time: DateTime<Utc>) {
    NOW.with(|now| now.set(time));
}

fn query() -> Query {
    Query {
        station: "EUS".into(),
        platforms: vec![],
        num_rows: 10,
    }
}

fn fetcher_with<F: crate::fetch_client::Fetch>(client: F, screens: Vec<Option<String>>) -> ResilientFetcher<F> {
    let extractor = BoundedJsonExtractor::new(screens);
    let offline = OfflineDataset::embedded(&extractor);
    ResilientFetcher::new(client, query(), RetryPolicy::default(), extractor, offline, None)
}

fn scheduler(
    responses: Vec<Result<&str, TransportError>>,
) -> Scheduler<ScriptedFetch, FixedTime, RecordingScreen> {
    let screens = vec![Some("4".to_string()), None];
    Scheduler::new(
        fetcher_with(ScriptedFetch::new(responses), screens),
        FixedTime::ok(fake_now()),
        ClockSync::unsynced(fake_now()),
        BoardRenderer::new(LayoutStyle::default(), Duration::from_secs(80)),
        vec![RecordingScreen::default(), RecordingScreen::default()],
        Cadence::default(),
    )
    .with_wall_clock(fake_now)
}

/// The compact example payload yields one delayed service with one calling point.
#[tokio::test(start_paused = true)]
async fn scenario_1_compact_payload() {
    let mut fetcher = fetcher_with(ScriptedFetch::new(vec![Ok(SCENARIO_1)]), vec![None]);

    let Refresh::Live(model) = fetcher.refresh().await else {
        panic!("expected live data");
    };

    let services = model.services(0);
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].destination, "Birmingham");
    assert_eq!(services[0].status.to_string(), "delayed to 10:05");
    assert_eq!(
        services[0].calling_points,
        vec![CallingPoint::new("Watford", "10:15".parse::<ClockTime>().unwrap())]
    );
}

/// A 404 from a real HTTP round-trip is not retried.
#[tokio::test]
async fn scenario_2_not_found_goes_offline_at_once() {
    let (base_url, _) = serve_once(StubResponse::status(404, "Not Found")).await;
    let client = FetchClient::new(
        Backend::Direct { base_url },
        None,
        64 * 1024,
        Duration::from_secs(2),
    )
    .unwrap();
    let mut fetcher = fetcher_with(client, vec![None]);

    let started = Instant::now();
    match fetcher.refresh().await {
        Refresh::Offline { dataset, reason } => {
            // A retry would have hit a closed listener and ended as RetriesExhausted
            assert_eq!(reason, FailureReason::Transport(TransportError::BadStatus(404)));
            assert_eq!(dataset.station.code, "PMW");
            assert!(dataset.has_departures());
        }
        other => panic!("expected offline, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(1));
}

/// Three timeouts use exactly three attempts and stay inside the window.
#[tokio::test(start_paused = true)]
async fn scenario_3_three_timeouts() {
    let mut fetcher = fetcher_with(
        ScriptedFetch::new(vec![
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Err(TransportError::Timeout),
            Ok(SCENARIO_1),
        ]),
        vec![None],
    );
    let policy = *fetcher.policy();
    let started = Instant::now();

    match fetcher.refresh().await {
        Refresh::Offline { reason, .. } => assert_eq!(
            reason,
            FailureReason::RetriesExhausted {
                attempts: 3,
                last: TransportError::Timeout
            }
        ),
        other => panic!("expected offline, got {other:?}"),
    }

    assert_eq!(fetcher.client().calls(), 3);
    // Delays of 1 s and 2 s, both under the cap
    assert_eq!(started.elapsed(), Duration::from_secs(3));
    assert!(started.elapsed() <= policy.retry_window);
}

/// An oversized live response is abandoned and the board goes offline.
#[tokio::test]
async fn oversized_response_falls_back() {
    let big = format!(
        r#"{{"station":"EUS","services":[],"padding":"{}"}}"#,
        "x".repeat(8 * 1024)
    );
    let (base_url, _) = serve_once(StubResponse::ok(&big).chunked()).await;
    let client = FetchClient::new(Backend::Direct { base_url }, None, 1024, Duration::from_secs(2)).unwrap();
    let mut fetcher = fetcher_with(client, vec![None]);

    match fetcher.refresh().await {
        Refresh::Offline { reason, .. } => assert_eq!(
            reason,
            FailureReason::Transport(TransportError::TooLarge { limit: 1024 })
        ),
        other => panic!("expected offline, got {other:?}"),
    }
}

/// Live data is committed and rendered on both screens with their own filters.
#[tokio::test(start_paused = true)]
async fn refresh_cycle_commits_and_renders() {
    set_now(Utc.with_ymd_and_hms(2024, 1, 15, 9, 58, 0).unwrap());
    let mut board = scheduler(vec![Ok(SCENARIO_1)]);

    let delay = board.refresh_cycle().await;
    assert_eq!(delay, Duration::from_secs(60));
    assert_eq!(board.feed().status(), FeedStatus::Live);
    assert_eq!(board.consecutive_failures(), 0);

    for screen in board.screens() {
        let layout = screen.layouts.last().unwrap();
        assert_eq!(layout.departures.len(), 1);
        assert_eq!(layout.due.as_deref(), Some("Now due: 10:05"));
        assert_eq!(layout.clock.to_string(), "09:58");
        assert_eq!(layout.indicators, vec![Indicator::Unsynced]);
    }
    assert_eq!(board.screens()[0].layouts.last().unwrap().title, "EUS P4");
}

/// After live data, a failed cycle keeps it as stale and backs off.
#[tokio::test(start_paused = true)]
async fn failed_cycle_keeps_previous_model_stale() {
    set_now(Utc.with_ymd_and_hms(2024, 1, 15, 9, 58, 0).unwrap());
    let mut board = scheduler(vec![Ok(SCENARIO_1), Err(TransportError::BadStatus(403))]);

    board.refresh_cycle().await;
    let delay = board.refresh_cycle().await;

    assert_eq!(delay, Duration::from_secs(5));
    assert_eq!(board.consecutive_failures(), 1);
    assert_eq!(board.feed().status(), FeedStatus::Stale);

    let layout = board.screens()[0].layouts.last().unwrap();
    assert_eq!(layout.departures[0].destination, vec!["Birmingham"]);
    assert!(layout.indicators.contains(&Indicator::Stale));

    // The exhausted script now refuses connections, so the back-off grows
    let delay = board.refresh_cycle().await;
    assert_eq!(delay, Duration::from_secs(10));
    assert_eq!(board.consecutive_failures(), 2);
}

/// With nothing ever fetched, the bundled dataset is shown flagged offline.
#[tokio::test(start_paused = true)]
async fn first_failure_shows_offline_dataset() {
    set_now(Utc.with_ymd_and_hms(2024, 1, 15, 9, 58, 0).unwrap());
    let mut board = scheduler(vec![Err(TransportError::BadStatus(401))]);

    board.refresh_cycle().await;
    assert_eq!(board.feed().status(), FeedStatus::Offline);

    let layout = board.screens()[1].layouts.last().unwrap();
    assert_eq!(layout.title, "Penmere");
    assert!(layout.indicators.contains(&Indicator::Offline));
    assert_eq!(layout.departures.len(), 2);
    // Screen one follows platform 4, which the bundled data does not use
    let layout = board.screens()[0].layouts.last().unwrap();
    assert_eq!(layout.notice.as_deref(), Some("No departures"));
}

/// Rendering the same committed state twice gives identical layouts.
#[tokio::test(start_paused = true)]
async fn repeated_renders_are_identical() {
    set_now(Utc.with_ymd_and_hms(2024, 1, 15, 9, 58, 0).unwrap());
    let mut board = scheduler(vec![Ok(SCENARIO_1)]);
    board.refresh_cycle().await;

    board.render_all();
    board.render_all();
    let layouts = &board.screens()[0].layouts;
    let n = layouts.len();
    assert_eq!(layouts[n - 1], layouts[n - 2]);
}

/// The DST offset flips on the first tick after the boundary, not before.
#[tokio::test(start_paused = true)]
async fn dst_changes_on_the_crossing_tick() {
    set_now(Utc.with_ymd_and_hms(2024, 3, 31, 0, 59, 0).unwrap());
    let mut board = scheduler(vec![Ok(SCENARIO_1)]);

    board.clock_cycle().await;
    assert!(!board.clock().is_bst());
    assert_eq!(board.screens()[0].layouts.last().unwrap().clock.to_string(), "00:59");

    // A refresh after the boundary advances time but leaves DST alone
    set_now(Utc.with_ymd_and_hms(2024, 3, 31, 1, 0, 30).unwrap());
    board.refresh_cycle().await;
    assert!(!board.clock().is_bst());

    board.clock_cycle().await;
    assert!(board.clock().is_bst());
    assert_eq!(board.screens()[0].layouts.last().unwrap().clock.to_string(), "02:00");

    // Further ticks do not change it again
    let evaluated = board.clock().last_dst_eval;
    set_now(Utc.with_ymd_and_hms(2024, 3, 31, 1, 1, 0).unwrap());
    board.clock_cycle().await;
    assert!(board.clock().is_bst());
    assert!(board.clock().last_dst_eval > evaluated);
}

/// A screen that fails to draw does not stop the other or the loop.
#[tokio::test(start_paused = true)]
async fn broken_screen_is_tolerated() {
    set_now(Utc.with_ymd_and_hms(2024, 1, 15, 9, 58, 0).unwrap());
    let screens: Vec<Box<dyn crate::display::Screen>> =
        vec![Box::new(BrokenScreen), Box::new(RecordingScreen::default())];
    let mut board = Scheduler::new(
        fetcher_with(ScriptedFetch::new(vec![Ok(SCENARIO_1)]), vec![None, None]),
        FixedTime::failing(),
        ClockSync::unsynced(fake_now()),
        BoardRenderer::new(LayoutStyle::default(), Duration::from_secs(80)),
        screens,
        Cadence::default(),
    )
    .with_wall_clock(fake_now);

    let delay = board.refresh_cycle().await;
    assert_eq!(delay, Duration::from_secs(60));
    assert_eq!(board.feed().status(), FeedStatus::Live);
}

/// Live data ages into stale between refreshes.
#[tokio::test(start_paused = true)]
async fn live_data_goes_stale_with_time() {
    set_now(Utc.with_ymd_and_hms(2024, 1, 15, 9, 58, 0).unwrap());
    let mut board = scheduler(vec![Ok(SCENARIO_1)]);
    board.refresh_cycle().await;

    set_now(Utc.with_ymd_and_hms(2024, 1, 15, 9, 59, 30).unwrap());
    board.clock_cycle().await;
    let layout = board.screens()[0].layouts.last().unwrap();
    assert!(layout.indicators.contains(&Indicator::Stale));
    assert_eq!(board.feed().status(), FeedStatus::Live);
}

/// A delayed first departure keeps its due time through the whole pipeline.
#[tokio::test(start_paused = true)]
async fn delayed_status_survives_pipeline() {
    let mut fetcher = fetcher_with(ScriptedFetch::new(vec![Ok(SCENARIO_1)]), vec![Some("4".into())]);
    let Refresh::Live(model) = fetcher.refresh().await else {
        panic!("expected live data");
    };
    let first = &model.services(0)[0];
    assert_eq!(first.status, DelayStatus::Delayed(Some("10:05".parse().unwrap())));
    assert_eq!(first.delay_minutes(), 5);
}

/// The loop refreshes on its interval, backs off after failures and ticks every minute.
#[tokio::test(start_paused = true)]
async fn main_loop_keeps_both_cadences() {
    set_now(Utc.with_ymd_and_hms(2024, 1, 15, 9, 58, 0).unwrap());
    let mut board = scheduler(vec![
        Ok(SCENARIO_1),
        Err(TransportError::BadStatus(403)),
        Err(TransportError::BadStatus(403)),
        Ok(SCENARIO_1),
        Ok(SCENARIO_1),
    ]);
    let started = Instant::now();

    let stopped = tokio::time::timeout(Duration::from_secs(190), board.run()).await;
    assert!(stopped.is_err());

    let offsets: Vec<u64> = board
        .fetcher()
        .client()
        .call_times
        .iter()
        .map(|at| (*at - started).as_secs())
        .collect();
    // Live at 0, failures back off 5 s then 10 s, then the normal interval resumes
    assert_eq!(offsets, vec![0, 60, 65, 75, 135]);
    assert_eq!(board.consecutive_failures(), 0);
    assert_eq!(board.feed().status(), FeedStatus::Live);

    // One initial render, five refreshes and ticks at 60, 120 and 180 s
    for screen in board.screens() {
        assert_eq!(screen.layouts.len(), 1 + 5 + 3);
    }
}

/// A slow refresh holds off the clock tick until it has committed.
#[tokio::test(start_paused = true)]
async fn tick_waits_for_a_running_refresh() {
    set_now(Utc.with_ymd_and_hms(2024, 1, 15, 9, 58, 0).unwrap());
    let mut client = ScriptedFetch::new(vec![]);
    client.hang = true;
    let cadence = Cadence {
        clock_tick: Duration::from_secs(10),
        ..Cadence::default()
    };
    let mut board = Scheduler::new(
        fetcher_with(client, vec![None]),
        FixedTime::ok(fake_now()),
        ClockSync::unsynced(fake_now()),
        BoardRenderer::new(LayoutStyle::default(), Duration::from_secs(80)),
        vec![RecordingScreen::default()],
        cadence,
    )
    .with_wall_clock(fake_now);

    // Three hung attempts keep the first refresh busy for 18 s, past the 10 s tick
    let stopped = tokio::time::timeout(Duration::from_secs(19), board.run()).await;
    assert!(stopped.is_err());
    assert_eq!(board.fetcher().client().calls(), 3);

    let layouts = &board.screens()[0].layouts;
    assert_eq!(layouts.len(), 3);
    assert_eq!(layouts[0].notice.as_deref(), Some("Loading..."));
    // The delayed tick renders only after the refresh committed the offline data
    assert!(layouts[1].indicators.contains(&Indicator::Offline));
    assert!(layouts[2].indicators.contains(&Indicator::Offline));
}
