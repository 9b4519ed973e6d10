//! # Bounded JSON Extraction
//!
//! Departure payloads from the direct backend can run to hundreds of kilobytes,
//! far more than the board can afford to hold as a parsed tree. This module walks
//! the response once with `serde_json`'s streaming deserializer and copies out only
//! the fields a [`DepartureModel`] needs.
//!
//! ## Working Set
//!
//! - Unknown keys and their values are skipped with [`IgnoredAny`]
//! - Strings are truncated to [`ExtractLimits`] before they are copied
//! - At most [`SERVICES_PER_SCREEN`] services per screen survive the pass; the
//!   rest are validated and dropped straight away
//! - Calling points beyond the cap are skipped unread
//!
//! ## Accepted Shapes
//!
//! Two spellings of the same document are understood. The compact one:
//!
//! ```json
//! {"station":"EUS","services":[{"sched":"10:00","est":"10:05","dest":"Birmingham",
//!   "platform":"4","callingPoints":[{"name":"Watford","time":"10:15"}]}]}
//! ```
//!
//! and the live departure board one (`crs`, `trainServices`, `std`/`etd`,
//! `destination: [{locationName}]`, `subsequentCallingPoints`, `nrccMessages`).

use crate::{
    Alert, CallingPoint, ClockTime, DelayStatus, DepartureModel, ScreenDepartures, Service,
    Station, SERVICES_PER_SCREEN,
};
use serde::Deserialize;
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::error::Category;
use std::cell::{Cell, RefCell};
use std::fmt;
use thiserror::Error;

/// Why a payload could not be turned into a [`DepartureModel`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),

    #[error("field `{field}` has malformed value {value:?}")]
    MalformedValue { field: &'static str, value: String },

    #[error("field `{field}` has unexpected type: {detail}")]
    UnexpectedType { field: &'static str, detail: String },

    #[error("invalid JSON at line {line}, column {column}")]
    Syntax { line: usize, column: usize },
}

/// Caps on what a single extraction may copy out of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractLimits {
    /// Station names, destinations, operators, platforms
    pub max_text_chars: usize,
    pub max_alert_chars: usize,
    pub max_calling_points: usize,
    pub max_alerts: usize,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_text_chars: 48,
            max_alert_chars: 480,
            max_calling_points: 16,
            max_alerts: 3,
        }
    }
}

/// Longest raw estimate we bother reporting back in an error.
const MAX_ECHO_CHARS: usize = 24;

/// Single-pass extractor configured with the platform filter of each screen.
#[derive(Debug, Clone)]
pub struct BoundedJsonExtractor {
    screens: Vec<Option<String>>,
    limits: ExtractLimits,
    /// Name used when the feed gives none for this station
    known_station: Option<Station>,
}

impl BoundedJsonExtractor {
    /// One entry per screen; `None` accepts services from any platform.
    pub fn new(screens: Vec<Option<String>>) -> Self {
        Self {
            screens,
            limits: ExtractLimits::default(),
            known_station: None,
        }
    }

    /// Names `code` as `name` whenever a feed for that station omits its name.
    pub fn with_station_name(mut self, code: &str, name: &str) -> Self {
        self.known_station = Some(Station {
            code: code.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn with_limits(mut self, limits: ExtractLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn screens(&self) -> &[Option<String>] {
        &self.screens
    }

    /// Builds a model from a complete JSON document.
    pub fn extract(&self, bytes: &[u8]) -> Result<DepartureModel, ParseError> {
        let ctx = Ctx {
            screens: &self.screens,
            limits: self.limits,
            known_station: self.known_station.as_ref(),
            failure: RefCell::new(None),
            field: Cell::new("<document>"),
        };

        let mut de = serde_json::Deserializer::from_slice(bytes);
        let result = DocumentSeed { ctx: &ctx }
            .deserialize(&mut de)
            .and_then(|model| de.end().map(|()| model));

        result.map_err(|err| ctx.resolve(err))
    }
}

/// Shared state for one extraction pass.
///
/// Visitors can only return the deserializer's own error type, so the typed
/// [`ParseError`] travels out through `failure`; `field` names the key whose
/// value is being read when serde reports a type mismatch itself.
struct Ctx<'a> {
    screens: &'a [Option<String>],
    limits: ExtractLimits,
    known_station: Option<&'a Station>,
    failure: RefCell<Option<ParseError>>,
    field: Cell<&'static str>,
}

impl Ctx<'_> {
    fn enter(&self, field: &'static str) {
        self.field.set(field);
    }

    fn fail<E: de::Error>(&self, err: ParseError) -> E {
        let message = err.to_string();
        self.failure.borrow_mut().get_or_insert(err);
        E::custom(message)
    }

    fn resolve(&self, err: serde_json::Error) -> ParseError {
        if let Some(failure) = self.failure.borrow_mut().take() {
            return failure;
        }
        match err.classify() {
            Category::Data => ParseError::UnexpectedType {
                field: self.field.get(),
                detail: err.to_string(),
            },
            Category::Syntax | Category::Eof | Category::Io => ParseError::Syntax {
                line: err.line(),
                column: err.column(),
            },
        }
    }
}

/// Borrows at most `max` characters of `s`.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Strips markup from an alert and collapses runs of whitespace.
pub fn clean_alert_text(raw: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(raw.len().min(max_chars));
    let mut count = 0;
    let mut in_tag = false;
    let mut pending_space = false;

    for c in raw.chars() {
        if count >= max_chars {
            break;
        }
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if in_tag => {}
            c if c.is_whitespace() => pending_space = true,
            c => {
                if pending_space && count > 0 {
                    out.push(' ');
                    count += 1;
                    if count >= max_chars {
                        break;
                    }
                }
                pending_space = false;
                out.push(c);
                count += 1;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Maps an object key onto a small enum without allocating.
struct KeySeed<K>(fn(&str) -> K);

impl<'de, K> DeserializeSeed<'de> for KeySeed<K> {
    type Value = K;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<K, D::Error> {
        deserializer.deserialize_identifier(KeyVisitor(self.0))
    }
}

struct KeyVisitor<K>(fn(&str) -> K);

impl<'de, K> Visitor<'de> for KeyVisitor<K> {
    type Value = K;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an object key")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<K, E> {
        Ok((self.0)(v))
    }
}

enum DocumentKey {
    Station,
    StationName,
    Services,
    Alerts,
    Other,
}

fn document_key(key: &str) -> DocumentKey {
    match key {
        "station" | "crs" => DocumentKey::Station,
        "stationName" | "locationName" => DocumentKey::StationName,
        "services" | "trainServices" => DocumentKey::Services,
        "alerts" | "nrccMessages" => DocumentKey::Alerts,
        _ => DocumentKey::Other,
    }
}

enum ServiceKey {
    Scheduled,
    Estimated,
    Destination,
    Platform,
    Operator,
    Cancelled,
    CallingPoints,
    SubsequentCallingPoints,
    Other,
}

fn service_key(key: &str) -> ServiceKey {
    match key {
        "sched" | "std" => ServiceKey::Scheduled,
        "est" | "etd" => ServiceKey::Estimated,
        "dest" | "destination" => ServiceKey::Destination,
        "platform" => ServiceKey::Platform,
        "operator" => ServiceKey::Operator,
        "isCancelled" => ServiceKey::Cancelled,
        "callingPoints" => ServiceKey::CallingPoints,
        "subsequentCallingPoints" => ServiceKey::SubsequentCallingPoints,
        _ => ServiceKey::Other,
    }
}

enum PointKey {
    Name,
    Scheduled,
    Estimated,
    Other,
}

fn point_key(key: &str) -> PointKey {
    match key {
        "name" | "locationName" => PointKey::Name,
        "time" | "st" => PointKey::Scheduled,
        "et" => PointKey::Estimated,
        _ => PointKey::Other,
    }
}

fn calling_group_key(key: &str) -> bool {
    key == "callingPoint"
}

fn alert_text_key(key: &str) -> bool {
    matches!(key, "Value" | "value" | "message")
}

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

/// A string value, truncated before it is copied.
struct TextSeed {
    max_chars: usize,
}

impl<'de> DeserializeSeed<'de> for TextSeed {
    type Value = String;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<String, D::Error> {
        deserializer.deserialize_str(self)
    }
}

impl<'de> Visitor<'de> for TextSeed {
    type Value = String;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
        Ok(truncate_chars(v.trim(), self.max_chars).to_string())
    }
}

/// A string value that may be `null`; empty strings read as absent.
struct OptionalTextSeed {
    max_chars: usize,
}

impl<'de> DeserializeSeed<'de> for OptionalTextSeed {
    type Value = Option<String>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Option<String>, D::Error> {
        deserializer.deserialize_option(self)
    }
}

impl<'de> Visitor<'de> for OptionalTextSeed {
    type Value = Option<String>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string or null")
    }

    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        let text = TextSeed {
            max_chars: self.max_chars,
        }
        .deserialize(deserializer)?;
        Ok(Some(text).filter(|t| !t.is_empty()))
    }
}

/// A fixed-format `HH:MM` field.
struct TimeSeed<'c, 'a> {
    ctx: &'c Ctx<'a>,
    field: &'static str,
}

impl<'de> DeserializeSeed<'de> for TimeSeed<'_, '_> {
    type Value = ClockTime;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<ClockTime, D::Error> {
        deserializer.deserialize_str(self)
    }
}

impl<'de> Visitor<'de> for TimeSeed<'_, '_> {
    type Value = ClockTime;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an HH:MM time string")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ClockTime, E> {
        v.parse().map_err(|_| {
            self.ctx.fail(ParseError::MalformedValue {
                field: self.field,
                value: truncate_chars(v, MAX_ECHO_CHARS).to_string(),
            })
        })
    }
}

/// A boolean that may be `null` (read as false).
struct FlagSeed;

impl<'de> DeserializeSeed<'de> for FlagSeed {
    type Value = bool;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<bool, D::Error> {
        Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

struct DocumentSeed<'c, 'a> {
    ctx: &'c Ctx<'a>,
}

impl<'de> DeserializeSeed<'de> for DocumentSeed<'_, '_> {
    type Value = DepartureModel;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<DepartureModel, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for DocumentSeed<'_, '_> {
    type Value = DepartureModel;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a departures object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<DepartureModel, A::Error> {
        let ctx = self.ctx;
        let text = || TextSeed {
            max_chars: ctx.limits.max_text_chars,
        };

        let mut code: Option<String> = None;
        let mut name: Option<String> = None;
        let mut screens: Option<Vec<ScreenDepartures>> = None;
        let mut alerts = Vec::new();

        while let Some(key) = map.next_key_seed(KeySeed(document_key))? {
            match key {
                DocumentKey::Station => {
                    ctx.enter("station");
                    code = Some(map.next_value_seed(text())?);
                }
                DocumentKey::StationName => {
                    ctx.enter("stationName");
                    name = map.next_value_seed(OptionalTextSeed {
                        max_chars: ctx.limits.max_text_chars,
                    })?;
                }
                DocumentKey::Services => {
                    ctx.enter("services");
                    screens = Some(map.next_value_seed(ServicesSeed { ctx })?);
                }
                DocumentKey::Alerts => {
                    ctx.enter("alerts");
                    alerts = map.next_value_seed(AlertsSeed { ctx })?;
                }
                DocumentKey::Other => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        let code = code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ctx.fail::<A::Error>(ParseError::MissingField("station")))?;
        let screens = screens.ok_or_else(|| ctx.fail::<A::Error>(ParseError::MissingField("services")))?;
        let name = name
            .or_else(|| {
                ctx.known_station
                    .filter(|known| known.code.eq_ignore_ascii_case(&code))
                    .map(|known| known.name.clone())
            })
            .unwrap_or_else(|| code.clone());

        Ok(DepartureModel {
            station: Station { code, name },
            screens,
            alerts,
        })
    }
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

struct ServicesSeed<'c, 'a> {
    ctx: &'c Ctx<'a>,
}

impl<'de> DeserializeSeed<'de> for ServicesSeed<'_, '_> {
    type Value = Vec<ScreenDepartures>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_option(self)
    }
}

impl<'de> Visitor<'de> for ServicesSeed<'_, '_> {
    type Value = Vec<ScreenDepartures>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of services")
    }

    // The live feed sends `null` when nothing is departing
    fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(self.empty_screens())
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(self.empty_screens())
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut screens = self.empty_screens();
        let mut reference: Option<ClockTime> = None;

        while let Some(service) = seq.next_element_seed(ServiceSeed { ctx: self.ctx })? {
            let origin = *reference.get_or_insert(service.scheduled);
            for screen in screens.iter_mut().filter(|s| s.accepts(&service)) {
                keep_earliest(&mut screen.services, service.clone(), origin);
            }
            self.ctx.enter("services");
        }

        Ok(screens)
    }
}

impl ServicesSeed<'_, '_> {
    fn empty_screens(&self) -> Vec<ScreenDepartures> {
        self.ctx
            .screens
            .iter()
            .cloned()
            .map(ScreenDepartures::new)
            .collect()
    }
}

/// Inserts `service` if it is among the earliest [`SERVICES_PER_SCREEN`].
///
/// Times are ordered relative to the first service in the feed so a board
/// spanning midnight keeps `23:58` ahead of `00:03`.
fn keep_earliest(kept: &mut Vec<Service>, service: Service, origin: ClockTime) {
    let offset = service.scheduled.minutes_since(origin);
    let pos = kept
        .iter()
        .position(|s| s.scheduled.minutes_since(origin) > offset)
        .unwrap_or(kept.len());

    if pos < SERVICES_PER_SCREEN {
        kept.insert(pos, service);
        kept.truncate(SERVICES_PER_SCREEN);
    }
}

struct ServiceSeed<'c, 'a> {
    ctx: &'c Ctx<'a>,
}

impl<'de> DeserializeSeed<'de> for ServiceSeed<'_, '_> {
    type Value = Service;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Service, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ServiceSeed<'_, '_> {
    type Value = Service;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a service object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Service, A::Error> {
        let ctx = self.ctx;
        let optional_text = || OptionalTextSeed {
            max_chars: ctx.limits.max_text_chars,
        };

        let mut scheduled: Option<ClockTime> = None;
        let mut estimate: Option<String> = None;
        let mut destination: Option<String> = None;
        let mut platform: Option<String> = None;
        let mut operator: Option<String> = None;
        let mut cancelled = false;
        let mut calling_points = Vec::new();

        while let Some(key) = map.next_key_seed(KeySeed(service_key))? {
            match key {
                ServiceKey::Scheduled => {
                    ctx.enter("sched");
                    scheduled = Some(map.next_value_seed(TimeSeed { ctx, field: "sched" })?);
                }
                ServiceKey::Estimated => {
                    ctx.enter("est");
                    estimate = map.next_value_seed(OptionalTextSeed {
                        max_chars: MAX_ECHO_CHARS,
                    })?;
                }
                ServiceKey::Destination => {
                    ctx.enter("dest");
                    destination = map.next_value_seed(DestinationSeed { ctx })?;
                }
                ServiceKey::Platform => {
                    ctx.enter("platform");
                    platform = map.next_value_seed(optional_text())?;
                }
                ServiceKey::Operator => {
                    ctx.enter("operator");
                    operator = map.next_value_seed(optional_text())?;
                }
                ServiceKey::Cancelled => {
                    ctx.enter("isCancelled");
                    cancelled = map.next_value_seed(FlagSeed)?;
                }
                ServiceKey::CallingPoints => {
                    ctx.enter("callingPoints");
                    map.next_value_seed(CallingPointsSeed {
                        ctx,
                        out: &mut calling_points,
                    })?;
                }
                ServiceKey::SubsequentCallingPoints => {
                    ctx.enter("subsequentCallingPoints");
                    map.next_value_seed(SubsequentSeed {
                        ctx,
                        out: &mut calling_points,
                    })?;
                }
                ServiceKey::Other => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        let scheduled = scheduled.ok_or_else(|| ctx.fail::<A::Error>(ParseError::MissingField("sched")))?;
        let destination = destination
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ctx.fail::<A::Error>(ParseError::MissingField("dest")))?;

        let status = match estimate.as_deref() {
            _ if cancelled => DelayStatus::Cancelled,
            None => DelayStatus::OnTime,
            Some(raw) => DelayStatus::from_estimate(scheduled, raw).map_err(|_| {
                ctx.fail::<A::Error>(ParseError::MalformedValue {
                    field: "est",
                    value: raw.to_string(),
                })
            })?,
        };
        let estimated = estimate.and_then(|raw| raw.parse().ok());

        calling_points.sort_by_key(|p: &CallingPoint| p.time.minutes_since(scheduled));

        Ok(Service {
            scheduled,
            estimated,
            destination,
            platform,
            operator,
            status,
            calling_points,
        })
    }
}

/// `"Birmingham"`, `{"locationName": ...}` or `[{"locationName": ...}, ...]`.
struct DestinationSeed<'c, 'a> {
    ctx: &'c Ctx<'a>,
}

impl<'de> DeserializeSeed<'de> for DestinationSeed<'_, '_> {
    type Value = Option<String>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for DestinationSeed<'_, '_> {
    type Value = Option<String>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a destination name or list of locations")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(Some(
            truncate_chars(v.trim(), self.ctx.limits.max_text_chars).to_string(),
        ))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Self::Value, A::Error> {
        LocationSeed { ctx: self.ctx }.visit_map(map)
    }

    // Split trains list several destinations; the first is the one shown
    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let first = seq
            .next_element_seed(LocationSeed { ctx: self.ctx })?
            .flatten();
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(first)
    }
}

struct LocationSeed<'c, 'a> {
    ctx: &'c Ctx<'a>,
}

impl<'de> DeserializeSeed<'de> for LocationSeed<'_, '_> {
    type Value = Option<String>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for LocationSeed<'_, '_> {
    type Value = Option<String>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a location object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut name = None;
        while let Some(key) = map.next_key_seed(KeySeed(point_key))? {
            match key {
                PointKey::Name => {
                    name = map.next_value_seed(OptionalTextSeed {
                        max_chars: self.ctx.limits.max_text_chars,
                    })?;
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(name)
    }
}

// ---------------------------------------------------------------------------
// Calling points
// ---------------------------------------------------------------------------

/// A flat list of calling points appended to `out` up to the cap.
struct CallingPointsSeed<'c, 'a, 'o> {
    ctx: &'c Ctx<'a>,
    out: &'o mut Vec<CallingPoint>,
}

impl<'de> DeserializeSeed<'de> for CallingPointsSeed<'_, '_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_option(self)
    }
}

impl<'de> Visitor<'de> for CallingPointsSeed<'_, '_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of calling points")
    }

    fn visit_none<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        loop {
            if self.out.len() >= self.ctx.limits.max_calling_points {
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                return Ok(());
            }
            match seq.next_element_seed(CallingPointSeed { ctx: self.ctx })? {
                Some(point) => self.out.push(point),
                None => return Ok(()),
            }
        }
    }
}

/// `[{"callingPoint": [...]}, ...]`, flattened into `out`.
struct SubsequentSeed<'c, 'a, 'o> {
    ctx: &'c Ctx<'a>,
    out: &'o mut Vec<CallingPoint>,
}

impl<'de> DeserializeSeed<'de> for SubsequentSeed<'_, '_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_option(self)
    }
}

impl<'de> Visitor<'de> for SubsequentSeed<'_, '_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of calling point groups")
    }

    fn visit_none<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_unit<E: de::Error>(self) -> Result<(), E> {
        Ok(())
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while seq
            .next_element_seed(CallingGroupSeed {
                ctx: self.ctx,
                out: &mut *self.out,
            })?
            .is_some()
        {}
        Ok(())
    }
}

struct CallingGroupSeed<'c, 'a, 'o> {
    ctx: &'c Ctx<'a>,
    out: &'o mut Vec<CallingPoint>,
}

impl<'de> DeserializeSeed<'de> for CallingGroupSeed<'_, '_, '_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for CallingGroupSeed<'_, '_, '_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a calling point group")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(key) = map.next_key_seed(KeySeed(calling_group_key))? {
            if key {
                map.next_value_seed(CallingPointsSeed {
                    ctx: self.ctx,
                    out: &mut *self.out,
                })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

struct CallingPointSeed<'c, 'a> {
    ctx: &'c Ctx<'a>,
}

impl<'de> DeserializeSeed<'de> for CallingPointSeed<'_, '_> {
    type Value = CallingPoint;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<CallingPoint, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for CallingPointSeed<'_, '_> {
    type Value = CallingPoint;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a calling point object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<CallingPoint, A::Error> {
        let ctx = self.ctx;
        let mut name: Option<String> = None;
        let mut time: Option<ClockTime> = None;
        let mut expected: Option<String> = None;

        while let Some(key) = map.next_key_seed(KeySeed(point_key))? {
            match key {
                PointKey::Name => {
                    ctx.enter("callingPoints.name");
                    name = map.next_value_seed(OptionalTextSeed {
                        max_chars: ctx.limits.max_text_chars,
                    })?;
                }
                PointKey::Scheduled => {
                    ctx.enter("callingPoints.time");
                    time = Some(map.next_value_seed(TimeSeed {
                        ctx,
                        field: "callingPoints.time",
                    })?);
                }
                PointKey::Estimated => {
                    ctx.enter("callingPoints.et");
                    expected = map.next_value_seed(OptionalTextSeed {
                        max_chars: MAX_ECHO_CHARS,
                    })?;
                }
                PointKey::Other => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }

        let name = name.ok_or_else(|| ctx.fail::<A::Error>(ParseError::MissingField("callingPoints.name")))?;
        let scheduled = time.ok_or_else(|| ctx.fail::<A::Error>(ParseError::MissingField("callingPoints.time")))?;
        // "On time" / "Delayed" keep the timetabled time
        let time = expected
            .and_then(|et| et.parse::<ClockTime>().ok())
            .unwrap_or(scheduled);

        Ok(CallingPoint { name, time })
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

struct AlertsSeed<'c, 'a> {
    ctx: &'c Ctx<'a>,
}

impl<'de> DeserializeSeed<'de> for AlertsSeed<'_, '_> {
    type Value = Vec<Alert>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Vec<Alert>, D::Error> {
        deserializer.deserialize_option(self)
    }
}

impl<'de> Visitor<'de> for AlertsSeed<'_, '_> {
    type Value = Vec<Alert>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an array of alerts")
    }

    fn visit_none<E: de::Error>(self) -> Result<Vec<Alert>, E> {
        Ok(Vec::new())
    }

    fn visit_unit<E: de::Error>(self) -> Result<Vec<Alert>, E> {
        Ok(Vec::new())
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Vec<Alert>, D::Error> {
        deserializer.deserialize_seq(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<Alert>, A::Error> {
        let mut alerts = Vec::new();
        loop {
            if alerts.len() >= self.ctx.limits.max_alerts {
                while seq.next_element::<IgnoredAny>()?.is_some() {}
                return Ok(alerts);
            }
            match seq.next_element_seed(AlertSeed { ctx: self.ctx })? {
                Some(Some(message)) => alerts.push(Alert::live(message)),
                Some(None) => {}
                None => return Ok(alerts),
            }
        }
    }
}

/// `"text"` or `{"Value": "text"}`; blank alerts read as `None`.
struct AlertSeed<'c, 'a> {
    ctx: &'c Ctx<'a>,
}

impl<'de> DeserializeSeed<'de> for AlertSeed<'_, '_> {
    type Value = Option<String>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for AlertSeed<'_, '_> {
    type Value = Option<String>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an alert message")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        let message = clean_alert_text(v, self.ctx.limits.max_alert_chars);
        Ok(Some(message).filter(|m| !m.is_empty()))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut message = None;
        while let Some(is_text) = map.next_key_seed(KeySeed(alert_text_key))? {
            if is_text {
                message = map.next_value_seed(AlertSeed { ctx: self.ctx })?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(message)
    }
}
