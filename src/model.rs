//! Core data model.
//!
//! An event is the unit of observed activity. It arrives from producers
//! possibly missing identity fields, is enriched exactly once before it is
//! published, and is immutable once persisted. Summaries are per-bucket
//! rollups maintained incrementally by the processor.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Event severity. The integer encoding is stable: it is what goes over the
/// wire and into the store (`events.severity SMALLINT`), and the partial
/// index on `severity >= 2` depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum Severity {
    Info = 0,
    Warn = 1,
    Err = 2,
    Critical = 3,
}

impl Severity {
    /// Case-insensitive parse. Ingest-side callers fall back to `Info` on
    /// error; the processor treats the error as a validation failure.
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "err" | "error" => Ok(Severity::Err),
            "fatal" | "critical" => Ok(Severity::Critical),
            other => Err(Error::InvalidField(format!("invalid severity '{other}'"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Err => "err",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, String> {
        match value {
            0 => Ok(Severity::Info),
            1 => Ok(Severity::Warn),
            2 => Ok(Severity::Err),
            3 => Ok(Severity::Critical),
            other => Err(format!("invalid severity value {other}")),
        }
    }
}

impl From<Severity> for u8 {
    fn from(value: Severity) -> u8 {
        value as u8
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

fn zero_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// A single observed event.
///
/// `id` and `timestamp` deserialize to zero values when absent so that a
/// record published without them can still be decoded and then enriched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,

    #[serde(default = "zero_time")]
    pub timestamp: DateTime<Utc>,

    pub source: String,

    pub severity: Severity,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Assign missing identity fields: a random 32-hex-char id and the
    /// current UTC instant. Idempotent on already-enriched events.
    pub fn enrich(&mut self) {
        if self.id.trim().is_empty() {
            self.id = random_hex(16);
        }
        if self.timestamp == zero_time() {
            self.timestamp = Utc::now();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(Error::InvalidField("source is a required field".to_string()));
        }
        if self.kind.trim().is_empty() {
            return Err(Error::InvalidField("type is a required field".to_string()));
        }
        Ok(())
    }

    /// Start of the summary bucket this event falls into.
    pub fn bucket_start(&self, width: Duration) -> DateTime<Utc> {
        truncate_to_bucket(self.timestamp, width)
    }
}

/// Truncate an instant down to the start of its bucket.
pub fn truncate_to_bucket(ts: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let w = width.num_seconds().max(1);
    let secs = ts.timestamp().div_euclid(w) * w;
    DateTime::from_timestamp(secs, 0).unwrap_or(ts)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// NewEvent
// ---------------------------------------------------------------------------

/// Producer-side event submission, before enrichment. Severity arrives as a
/// string here; unknown values fall back to `Info` rather than rejecting
/// the submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub source: String,

    #[serde(default)]
    pub severity: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl NewEvent {
    /// Convert into an enriched, validated [`Event`].
    pub fn into_event(self) -> Result<Event> {
        let severity = Severity::parse(&self.severity).unwrap_or(Severity::Info);
        let mut event = Event {
            id: String::new(),
            timestamp: zero_time(),
            source: self.source,
            severity,
            kind: self.kind,
            payload: self.payload,
        };
        event.enrich();
        event.validate()?;
        Ok(event)
    }
}

// ---------------------------------------------------------------------------
// EventSummary
// ---------------------------------------------------------------------------

/// Maximum sample events kept per bucket (first five by arrival order).
pub const MAX_SAMPLE_EVENTS: usize = 5;

/// Per-bucket rollup of persisted events. Exactly one row per bucket_start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub total_count: i64,
    pub by_severity: HashMap<String, i64>,
    pub by_type: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_events: Vec<Event>,
}

impl EventSummary {
    /// Summary for a bucket seeing its first event.
    pub fn seed(event: &Event, bucket_start: DateTime<Utc>, width: Duration) -> Self {
        let mut summary = EventSummary {
            bucket_start,
            bucket_end: bucket_start + width,
            total_count: 0,
            by_severity: HashMap::new(),
            by_type: HashMap::new(),
            sample_events: Vec::new(),
        };
        summary.absorb(event);
        summary
    }

    /// Fold one more persisted event into the rollup.
    pub fn absorb(&mut self, event: &Event) {
        self.total_count += 1;
        *self
            .by_severity
            .entry(event.severity.as_str().to_string())
            .or_insert(0) += 1;
        *self.by_type.entry(event.kind.clone()).or_insert(0) += 1;
        if self.sample_events.len() < MAX_SAMPLE_EVENTS {
            self.sample_events.push(event.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// TimeRange
// ---------------------------------------------------------------------------

/// A closed UTC time window. Immutable once validated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn validate(&self) -> Result<()> {
        if self.start == zero_time() || self.end == zero_time() {
            return Err(Error::InvalidField(
                "time range must include start and end".to_string(),
            ));
        }
        if self.start > self.end {
            return Err(Error::InvalidField(
                "start time must be before end time".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event(severity: Severity, kind: &str) -> Event {
        let mut event = Event {
            id: String::new(),
            timestamp: zero_time(),
            source: "firewall".to_string(),
            severity,
            kind: kind.to_string(),
            payload: serde_json::Map::new(),
        };
        event.enrich();
        event
    }

    #[test]
    fn severity_round_trips_through_name() {
        for sev in [Severity::Info, Severity::Warn, Severity::Err, Severity::Critical] {
            assert_eq!(Severity::parse(sev.as_str()).unwrap(), sev);
        }
    }

    #[test]
    fn severity_parse_aliases_and_case() {
        assert_eq!(Severity::parse("WARNING").unwrap(), Severity::Warn);
        assert_eq!(Severity::parse("Error").unwrap(), Severity::Err);
        assert_eq!(Severity::parse("fatal").unwrap(), Severity::Critical);
        assert!(Severity::parse("catastrophic").is_err());
    }

    #[test]
    fn severity_integer_encoding_is_stable() {
        assert_eq!(u8::from(Severity::Info), 0);
        assert_eq!(u8::from(Severity::Critical), 3);
        assert_eq!(Severity::try_from(2u8).unwrap(), Severity::Err);
        assert!(Severity::try_from(4u8).is_err());
    }

    #[test]
    fn enrich_assigns_id_and_timestamp_once() {
        let mut event = Event {
            id: String::new(),
            timestamp: zero_time(),
            source: "auth".to_string(),
            severity: Severity::Info,
            kind: "login".to_string(),
            payload: serde_json::Map::new(),
        };
        event.enrich();

        assert_eq!(event.id.len(), 32);
        assert!(event.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(event.timestamp, zero_time());

        let (id, ts) = (event.id.clone(), event.timestamp);
        event.enrich();
        assert_eq!(event.id, id);
        assert_eq!(event.timestamp, ts);
    }

    #[test]
    fn validate_rejects_blank_source_and_type() {
        let mut event = sample_event(Severity::Info, "login");
        event.source = "   ".to_string();
        assert!(matches!(event.validate(), Err(Error::InvalidField(_))));

        let mut event = sample_event(Severity::Info, "login");
        event.kind = String::new();
        assert!(matches!(event.validate(), Err(Error::InvalidField(_))));
    }

    #[test]
    fn event_decodes_with_missing_identity_fields() {
        let raw = json!({"source": "fw", "severity": 1, "type": "blocked"});
        let event: Event = serde_json::from_value(raw).unwrap();
        assert!(event.id.is_empty());
        assert_eq!(event.timestamp, zero_time());
        assert_eq!(event.severity, Severity::Warn);
    }

    #[test]
    fn new_event_falls_back_to_info_severity() {
        let new = NewEvent {
            source: "fw".to_string(),
            severity: "whatever".to_string(),
            kind: "blocked".to_string(),
            payload: serde_json::Map::new(),
        };
        let event = new.into_event().unwrap();
        assert_eq!(event.severity, Severity::Info);
        assert_eq!(event.id.len(), 32);
    }

    #[test]
    fn bucket_truncation_aligns_to_width() {
        let width = Duration::minutes(5);
        let ts = DateTime::parse_from_rfc3339("2026-01-01T00:07:31Z")
            .unwrap()
            .with_timezone(&Utc);
        let start = truncate_to_bucket(ts, width);
        assert_eq!(start.to_rfc3339(), "2026-01-01T00:05:00+00:00");
        // Already-aligned instants are fixed points.
        assert_eq!(truncate_to_bucket(start, width), start);
    }

    #[test]
    fn summary_absorb_keeps_counts_consistent() {
        let width = Duration::minutes(5);
        let first = sample_event(Severity::Err, "scan");
        let bucket = first.bucket_start(width);
        let mut summary = EventSummary::seed(&first, bucket, width);

        for i in 0..7 {
            let sev = if i % 2 == 0 { Severity::Info } else { Severity::Err };
            summary.absorb(&sample_event(sev, "scan"));
        }

        assert_eq!(summary.total_count, 8);
        assert_eq!(summary.by_severity.values().sum::<i64>(), 8);
        assert_eq!(summary.by_type.values().sum::<i64>(), 8);
        assert_eq!(summary.sample_events.len(), MAX_SAMPLE_EVENTS);
        assert_eq!(summary.bucket_end - summary.bucket_start, width);
    }

    #[test]
    fn time_range_rejects_zero_and_inverted() {
        let now = Utc::now();
        let range = TimeRange { start: zero_time(), end: now };
        assert!(range.validate().is_err());

        let range = TimeRange { start: now, end: now - Duration::hours(1) };
        assert!(range.validate().is_err());

        let range = TimeRange { start: now - Duration::hours(1), end: now };
        assert!(range.validate().is_ok());
    }
}
