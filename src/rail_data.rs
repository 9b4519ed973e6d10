//! # Resilient Departure Fetching
//!
//! Wraps a [`Fetch`] implementation with bounded retries and the offline fallback.
//! The scheduler calls [`ResilientFetcher::refresh`] once per refresh cycle and
//! always gets something displayable back.
//!
//! ## Retry Policy
//!
//! | Failure | Action |
//! |---|---|
//! | `Timeout`, `ConnectionRefused`, `BadStatus(5xx)` | retry with doubling delay |
//! | `BadStatus(4xx)`, `TooLarge`, `InvalidRequest` | offline at once |
//! | extractor `ParseError` | offline at once |
//!
//! Retries stop after `max_attempts` or when the next delay would overrun the
//! retry window, whichever comes first. Attempts before the last share what the
//! window leaves after the backoff delays, so a hung server still gets every
//! attempt. The last attempt is bounded by the request timeout alone, so one
//! refresh takes at most window plus one timeout.

use crate::extractor::{BoundedJsonExtractor, ParseError};
use crate::fallback::{OfflineDataset, OfflineHandle};
use crate::fetch_client::{Fetch, Query, TransportError};
use crate::DepartureModel;
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

/// Retry and timeout parameters for one refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total time a refresh may spend before giving up on retries
    pub retry_window: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            retry_window: Duration::from_secs(8),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Longest a single refresh can take.
    pub fn worst_case(&self) -> Duration {
        self.retry_window + self.request_timeout
    }

    /// Wait after failed attempt `attempt` (1-based) before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << exponent).min(self.max_delay)
    }

    /// Sum of every delay a refresh can sleep through.
    pub fn total_delay(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.delay_after(n)).sum()
    }
}

/// Attempt counter and delay schedule for one refresh.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Records that an attempt is starting and returns its number (1-based).
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once attempts or the window are spent.
    ///
    /// `elapsed` is the time since the first attempt started.
    pub fn next_delay(&self, elapsed: Duration) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_after(self.attempts);
        (elapsed.saturating_add(delay) <= self.policy.retry_window).then_some(delay)
    }

    /// Time the current attempt may take.
    ///
    /// Earlier attempts split the window left over after the remaining delays;
    /// the last one gets the full request timeout.
    pub fn attempt_timeout(&self, elapsed: Duration) -> Duration {
        let policy = &self.policy;
        if self.attempts >= policy.max_attempts {
            return policy.request_timeout;
        }
        let early_attempts = policy.max_attempts - self.attempts;
        let later_delays: Duration = (self.attempts..policy.max_attempts)
            .map(|n| policy.delay_after(n))
            .sum();
        let spare = policy
            .retry_window
            .saturating_sub(elapsed)
            .saturating_sub(later_delays);

        (spare / early_attempts).min(policy.request_timeout)
    }
}

/// Why a refresh ended on the offline dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Transport(TransportError),
    Parse(ParseError),
    RetriesExhausted { attempts: u32, last: TransportError },
    OfflineMode,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Transport(e) => write!(f, "{e}"),
            FailureReason::Parse(e) => write!(f, "{e}"),
            FailureReason::RetriesExhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            FailureReason::OfflineMode => f.write_str("offline mode"),
        }
    }
}

/// Result of one fetch attempt as seen by the retry loop.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(Vec<u8>),
    RetryableFailure(TransportError),
    FatalFailure(FailureReason),
    Offline(OfflineHandle),
}

impl FetchOutcome {
    pub fn classify(result: Result<Vec<u8>, TransportError>) -> Self {
        match result {
            Ok(bytes) => FetchOutcome::Success(bytes),
            Err(e) if e.is_retryable() => FetchOutcome::RetryableFailure(e),
            Err(e) => FetchOutcome::FatalFailure(FailureReason::Transport(e)),
        }
    }
}

/// What a refresh produced.
#[derive(Debug)]
pub enum Refresh {
    Live(DepartureModel),
    Offline {
        dataset: OfflineHandle,
        reason: FailureReason,
    },
}

pub struct ResilientFetcher<F> {
    client: F,
    query: Query,
    policy: RetryPolicy,
    extractor: BoundedJsonExtractor,
    offline: OfflineDataset,
    custom_alert: Option<String>,
    offline_only: bool,
}

impl<F: Fetch> ResilientFetcher<F> {
    pub fn new(
        client: F,
        query: Query,
        policy: RetryPolicy,
        extractor: BoundedJsonExtractor,
        offline: OfflineDataset,
        custom_alert: Option<String>,
    ) -> Self {
        let offline = offline.with_custom_alert(custom_alert.as_deref());
        Self {
            client,
            query,
            policy,
            extractor,
            offline,
            custom_alert,
            offline_only: false,
        }
    }

    /// Never touch the network; every refresh returns the offline dataset.
    pub fn offline_only(mut self, enabled: bool) -> Self {
        self.offline_only = enabled;
        self
    }

    pub fn client(&self) -> &F {
        &self.client
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn offline_dataset(&self) -> &OfflineDataset {
        &self.offline
    }

    /// Fetches and parses fresh departures, or explains why the offline data applies.
    pub async fn refresh(&mut self) -> Refresh {
        let started = Instant::now();
        let mut backoff = Backoff::new(self.policy);

        let bytes = loop {
            match self.attempt(&mut backoff, started.elapsed()).await {
                FetchOutcome::Success(bytes) => break bytes,
                FetchOutcome::RetryableFailure(error) => {
                    match backoff.next_delay(started.elapsed()) {
                        Some(delay) => {
                            warn!(
                                attempt = backoff.attempts(),
                                error = %error,
                                delay_ms = delay.as_millis() as u64,
                                "Fetch failed, retrying"
                            );
                            sleep(delay).await;
                        }
                        None => {
                            let attempts = backoff.attempts();
                            return self.fall_back(FailureReason::RetriesExhausted {
                                attempts,
                                last: error,
                            });
                        }
                    }
                }
                FetchOutcome::FatalFailure(reason) => return self.fall_back(reason),
                FetchOutcome::Offline(dataset) => {
                    return Refresh::Offline {
                        dataset,
                        reason: FailureReason::OfflineMode,
                    }
                }
            }
        };

        let parsed = self.extractor.extract(&bytes);
        let size = bytes.len();
        drop(bytes);

        match parsed {
            Ok(model) => {
                info!(
                    bytes = size,
                    station = %model.station.code,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Departures refreshed"
                );
                Refresh::Live(model.with_custom_alert(self.custom_alert.as_deref()))
            }
            Err(e) => self.fall_back(FailureReason::Parse(e)),
        }
    }

    async fn attempt(&mut self, backoff: &mut Backoff, elapsed: Duration) -> FetchOutcome {
        if self.offline_only {
            return FetchOutcome::Offline(self.offline.handle());
        }

        let attempt = backoff.begin_attempt();
        let limit = backoff.attempt_timeout(elapsed);
        let result = match timeout(limit, self.client.fetch(&self.query)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        };

        if let Err(e) = &result {
            warn!(attempt, error = %e, "Fetch attempt failed");
        }
        FetchOutcome::classify(result)
    }

    fn fall_back(&self, reason: FailureReason) -> Refresh {
        warn!(reason = %reason, "Using offline departures");
        Refresh::Offline {
            dataset: self.offline.handle(),
            reason,
        }
    }
}
