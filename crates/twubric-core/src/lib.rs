//! Core record model and the pure filter / sort / delete stages for the twubric board.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "twubric-core";

/// Label rendered for join timestamps that do not parse to a calendar date.
pub const INVALID_DATE_LABEL: &str = "Invalid Date";

/// Opaque record identifier; the feed uses integers, older snapshots may carry strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// The four sub-scores a user can sort by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    Total,
    Friends,
    Influence,
    Chirpiness,
}

impl SortKey {
    pub const ALL: [SortKey; 4] = [
        SortKey::Total,
        SortKey::Friends,
        SortKey::Influence,
        SortKey::Chirpiness,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Friends => "friends",
            Self::Influence => "influence",
            Self::Chirpiness => "chirpiness",
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown sort key `{0}` (expected total, friends, influence or chirpiness)")]
pub struct ParseSortKeyError(pub String);

impl FromStr for SortKey {
    type Err = ParseSortKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "total" | "twubric" => Ok(Self::Total),
            "friends" => Ok(Self::Friends),
            "influence" => Ok(Self::Influence),
            "chirpiness" => Ok(Self::Chirpiness),
            _ => Err(ParseSortKeyError(s.to_string())),
        }
    }
}

/// Per-profile twubric sub-scores.
///
/// A sub-score that is missing or not numeric on the wire reads as `0.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Scores {
    #[serde(default, deserialize_with = "lenient_score")]
    pub total: f64,
    #[serde(default, deserialize_with = "lenient_score")]
    pub friends: f64,
    #[serde(default, deserialize_with = "lenient_score")]
    pub influence: f64,
    #[serde(default, deserialize_with = "lenient_score")]
    pub chirpiness: f64,
}

impl Scores {
    pub fn get(&self, key: SortKey) -> f64 {
        match key {
            SortKey::Total => self.total,
            SortKey::Friends => self.friends,
            SortKey::Influence => self.influence,
            SortKey::Chirpiness => self.chirpiness,
        }
    }
}

fn lenient_score<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Number(n) => n.as_f64().unwrap_or_default(),
        JsonValue::String(text) => text.trim().parse().unwrap_or_default(),
        _ => 0.0,
    })
}

fn lenient_scores<'de, D>(deserializer: D) -> Result<Scores, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

fn lenient_name<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(text) => text,
        JsonValue::Null => String::new(),
        other => other.to_string(),
    })
}

/// Join timestamp exactly as it arrived on the wire.
///
/// Values that are neither epoch seconds nor a string are kept verbatim and never
/// parse to a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinTimestamp {
    Epoch(i64),
    Text(String),
    Other(JsonValue),
}

impl JoinTimestamp {
    /// Calendar date (UTC) of the timestamp, `None` when it is malformed.
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            Self::Epoch(secs) => DateTime::from_timestamp(*secs, 0).map(|dt| dt.date_naive()),
            Self::Text(text) => parse_date_text(text),
            Self::Other(_) => None,
        }
    }
}

fn parse_date_text(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc).date_naive());
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return Some(date);
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| dt.date())
}

/// One profile score entry as served by the feed and stored in the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "uid", alias = "id")]
    pub id: RecordId,
    #[serde(rename = "username", default, deserialize_with = "lenient_name")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fullname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(rename = "twubric", default, deserialize_with = "lenient_scores")]
    pub scores: Scores,
    #[serde(rename = "join_date", default, skip_serializing_if = "Option::is_none")]
    pub join_timestamp: Option<JoinTimestamp>,
    /// Feed fields this crate does not interpret; round-tripped into the snapshot.
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl Record {
    pub fn join_date(&self) -> Option<NaiveDate> {
        self.join_timestamp.as_ref().and_then(JoinTimestamp::date)
    }

    /// Join date formatted for display, e.g. `Nov 08, 2009`.
    pub fn join_date_label(&self) -> String {
        self.join_date()
            .map(|date| date.format("%b %d, %Y").to_string())
            .unwrap_or_else(|| INVALID_DATE_LABEL.to_string())
    }

    pub fn score(&self, key: SortKey) -> f64 {
        self.scores.get(key)
    }
}

/// Inclusive join-date bounds. Filtering only applies when both ends are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn bounds(&self) -> Option<(NaiveDate, NaiveDate)> {
        self.start.zip(self.end)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        match self.bounds() {
            Some((start, end)) => start <= date && date <= end,
            None => true,
        }
    }
}

/// Order-preserving subset of `records` whose join date falls inside `range`.
///
/// Identity when either bound is missing. Records with an unparseable join date
/// never match a bounded range.
pub fn filter_by_join_date(records: &[Record], range: &DateRange) -> Vec<Record> {
    let Some((start, end)) = range.bounds() else {
        return records.to_vec();
    };
    records
        .iter()
        .filter(|r| r.join_date().is_some_and(|d| start <= d && d <= end))
        .cloned()
        .collect()
}

/// Stable descending sort on one sub-score; the input is left untouched.
///
/// Equal scores (including `0.0` against `-0.0`) keep their input order. NaN
/// falls back to IEEE total ordering so the comparison stays total.
pub fn sort_by_key(records: &[Record], key: SortKey) -> Vec<Record> {
    let mut sorted = records.to_vec();
    sorted.sort_by(|a, b| {
        let (a, b) = (a.score(key), b.score(key));
        b.partial_cmp(&a).unwrap_or_else(|| b.total_cmp(&a))
    });
    sorted
}

/// `records` without the entry carrying `id`; unchanged when no entry matches.
pub fn remove_record(records: &[Record], id: &RecordId) -> Vec<Record> {
    let mut out = records.to_vec();
    if let Some(pos) = out.iter().position(|r| &r.id == id) {
        out.remove(pos);
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOrigin {
    Snapshot,
    Network,
}

/// Bootstrap state machine: `Init -> CacheCheck -> {Cached, Fetching} -> {Ready, FetchFailed}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Init,
    CacheCheck,
    Cached,
    Fetching,
    Ready {
        origin: RecordOrigin,
    },
    FetchFailed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal phase transition {from} -> {to}")]
pub struct TransitionError {
    pub from: &'static str,
    pub to: &'static str,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::CacheCheck => "cache_check",
            Self::Cached => "cached",
            Self::Fetching => "fetching",
            Self::Ready { .. } => "ready",
            Self::FetchFailed { .. } => "fetch_failed",
        }
    }

    /// Bootstrap has finished, one way or the other.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::FetchFailed { .. })
    }

    /// Validate and perform a transition. A settled board may go back to
    /// `Fetching` for an explicit reload.
    pub fn advance(&self, next: Phase) -> Result<Phase, TransitionError> {
        let allowed = match (self, &next) {
            (Self::Init, Self::CacheCheck) => true,
            (Self::CacheCheck, Self::Cached | Self::Fetching) => true,
            (Self::Cached, Self::Ready { origin }) => *origin == RecordOrigin::Snapshot,
            (Self::Fetching, Self::Ready { origin }) => *origin == RecordOrigin::Network,
            (Self::Fetching, Self::FetchFailed { .. }) => true,
            (Self::Ready { .. } | Self::FetchFailed { .. }, Self::Fetching) => true,
            _ => false,
        };
        if allowed {
            Ok(next)
        } else {
            Err(TransitionError {
                from: self.name(),
                to: next.name(),
            })
        }
    }
}

/// Immutable view of the board: the full record store plus everything derived
/// from it. Every `apply_*` returns a fresh state.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct BoardState {
    phase: Phase,
    store: Vec<Record>,
    range: DateRange,
    sort_key: Option<SortKey>,
    displayed: Vec<Record>,
}

impl BoardState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Full record list, the one persisted to the snapshot.
    pub fn store(&self) -> &[Record] {
        &self.store
    }

    pub fn displayed(&self) -> &[Record] {
        &self.displayed
    }

    pub fn range(&self) -> DateRange {
        self.range
    }

    pub fn sort_key(&self) -> Option<SortKey> {
        self.sort_key
    }

    /// Failure reason when the last acquisition failed.
    pub fn failure(&self) -> Option<&str> {
        match &self.phase {
            Phase::FetchFailed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Look up a displayed record by the textual form of its id.
    pub fn resolve_id(&self, raw: &str) -> Option<RecordId> {
        self.displayed
            .iter()
            .map(|r| &r.id)
            .find(|id| id.to_string() == raw)
            .cloned()
    }

    pub fn with_phase(&self, next: Phase) -> Result<Self, TransitionError> {
        let phase = self.phase.advance(next)?;
        Ok(Self {
            phase,
            ..self.clone()
        })
    }

    /// Replace the record store wholesale, keeping the active range and sort key.
    pub fn apply_reload(
        &self,
        records: Vec<Record>,
        origin: RecordOrigin,
    ) -> Result<Self, TransitionError> {
        let phase = self.phase.advance(Phase::Ready { origin })?;
        let displayed = derive_displayed(&records, &self.range, self.sort_key);
        Ok(Self {
            phase,
            store: records,
            range: self.range,
            sort_key: self.sort_key,
            displayed,
        })
    }

    /// Record an acquisition failure. The store is left as it was.
    pub fn apply_failure(&self, reason: impl Into<String>) -> Result<Self, TransitionError> {
        let phase = self.phase.advance(Phase::FetchFailed {
            reason: reason.into(),
        })?;
        Ok(Self {
            phase,
            ..self.clone()
        })
    }

    /// Re-filter the full store with `range`, then re-apply the active sort key.
    pub fn apply_filter(&self, range: DateRange) -> Self {
        Self {
            range,
            displayed: derive_displayed(&self.store, &range, self.sort_key),
            ..self.clone()
        }
    }

    /// Sort the currently displayed list; filtered-out records stay out.
    pub fn apply_sort(&self, key: SortKey) -> Self {
        Self {
            sort_key: Some(key),
            displayed: sort_by_key(&self.displayed, key),
            ..self.clone()
        }
    }

    /// Delete `id` from the displayed list and make that list the new store.
    ///
    /// Returns `None` when the id is not displayed, in which case nothing changes.
    pub fn apply_delete(&self, id: &RecordId) -> Option<Self> {
        if !self.displayed.iter().any(|r| &r.id == id) {
            return None;
        }
        let displayed = remove_record(&self.displayed, id);
        Some(Self {
            store: displayed.clone(),
            displayed,
            ..self.clone()
        })
    }
}

fn derive_displayed(records: &[Record], range: &DateRange, sort_key: Option<SortKey>) -> Vec<Record> {
    let filtered = filter_by_join_date(records, range);
    match sort_key {
        Some(key) => sort_by_key(&filtered, key),
        None => filtered,
    }
}
