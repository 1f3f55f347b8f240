//! Core listing model, change classification and the raw-record normalizer.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "hw-core";

/// Offset of the timestamps published by the upstream registry (Asia/Shanghai).
pub const DEFAULT_SOURCE_OFFSET_HOURS: i32 = 8;

/// Untyped record as handed over by a scraper collaborator.
pub type RawListing = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    OnMarket,
    Reserved,
    Sold,
    Withdrawn,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnMarket => "on_market",
            Self::Reserved => "reserved",
            Self::Sold => "sold",
            Self::Withdrawn => "withdrawn",
        }
    }

    /// Parses the status labels used by upstream sources. Unknown labels yield `None`.
    pub fn parse(input: &str) -> Option<Self> {
        let key = input.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "on_market" | "available" | "active" | "for_sale" => Some(Self::OnMarket),
            "reserved" | "pending" | "under_contract" => Some(Self::Reserved),
            "sold" | "closed" => Some(Self::Sold),
            "withdrawn" | "cancelled" | "canceled" | "expired" => Some(Self::Withdrawn),
            _ => None,
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical persisted listing. `identity` is unique across the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub identity: String,
    pub status: ListingStatus,
    pub number: i64,
    pub region: Option<String>,
    pub name: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|ends_at| ends_at > now)
    }

    /// `ends_at desc, starts_at desc, identity desc`; missing timestamps sort last.
    pub fn reporting_order(a: &Listing, b: &Listing) -> Ordering {
        b.ends_at
            .cmp(&a.ends_at)
            .then_with(|| b.starts_at.cmp(&a.starts_at))
            .then_with(|| b.identity.cmp(&a.identity))
    }
}

/// Notification recipient; `contact_id` is addressed by the messaging transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscriber {
    pub contact_id: String,
}

impl Subscriber {
    pub fn new(contact_id: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    New,
    Unchanged,
    StatusChanged,
}

/// Outcome of comparing a freshly normalized listing against its stored predecessor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRecord {
    pub listing: Listing,
    pub prior_status: Option<ListingStatus>,
    pub kind: ChangeKind,
}

impl ChangeRecord {
    pub fn from_prior(listing: Listing, prior: Option<&Listing>) -> Self {
        let prior_status = prior.map(|p| p.status);
        let kind = match prior_status {
            None => ChangeKind::New,
            Some(status) if status != listing.status => ChangeKind::StatusChanged,
            Some(_) => ChangeKind::Unchanged,
        };
        Self {
            listing,
            prior_status,
            kind,
        }
    }

    /// First sightings never notify; only transitions between two known statuses do.
    pub fn should_notify(&self) -> bool {
        self.kind == ChangeKind::StatusChanged
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("unknown status `{value}`")]
    UnknownStatus { value: String },
    #[error("field `{field}` has unparsable timestamp `{value}`")]
    InvalidTimestamp { field: &'static str, value: String },
}

/// Single trust boundary between scraper output and the typed [`Listing`].
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    offset: FixedOffset,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::from_offset_hours(DEFAULT_SOURCE_OFFSET_HOURS)
            .unwrap_or_else(|| Self::new(Utc.fix()))
    }
}

impl Normalizer {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn from_offset_hours(hours: i32) -> Option<Self> {
        FixedOffset::east_opt(hours.checked_mul(3600)?).map(Self::new)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn normalize(&self, raw: &RawListing) -> Result<Listing, MalformedRecord> {
        let identity = required_string(raw, &["uuid", "identity"], "identity")?;
        let status_label = required_string(raw, &["status"], "status")?;
        let status = ListingStatus::parse(&status_label)
            .ok_or(MalformedRecord::UnknownStatus { value: status_label })?;

        Ok(Listing {
            identity,
            status,
            number: number_field(raw, "number")?,
            region: optional_string(raw, "region")?,
            name: optional_string(raw, "name")?,
            starts_at: self.timestamp_field(raw, "starts_at")?,
            ends_at: self.timestamp_field(raw, "ends_at")?,
        })
    }

    fn timestamp_field(
        &self,
        raw: &RawListing,
        field: &'static str,
    ) -> Result<Option<DateTime<Utc>>, MalformedRecord> {
        let text = match raw.get(field) {
            None | Some(JsonValue::Null) => return Ok(None),
            Some(JsonValue::String(s)) => s.trim(),
            Some(_) => {
                return Err(MalformedRecord::WrongType {
                    field,
                    expected: "a timestamp string",
                })
            }
        };
        if text.is_empty() {
            return Ok(None);
        }

        if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
            .ok()
            .or_else(|| {
                NaiveDate::parse_from_str(text, "%Y-%m-%d")
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
            });
        naive
            .and_then(|n| self.offset.from_local_datetime(&n).single())
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .ok_or_else(|| MalformedRecord::InvalidTimestamp {
                field,
                value: text.to_string(),
            })
    }
}

/// Normalizes with the default source offset.
pub fn normalize(raw: &RawListing) -> Result<Listing, MalformedRecord> {
    Normalizer::default().normalize(raw)
}

fn required_string(
    raw: &RawListing,
    keys: &[&str],
    field: &'static str,
) -> Result<String, MalformedRecord> {
    let value = keys
        .iter()
        .filter_map(|key| raw.get(*key))
        .find(|v| !v.is_null())
        .ok_or(MalformedRecord::MissingField { field })?;
    let text = value.as_str().ok_or(MalformedRecord::WrongType {
        field,
        expected: "a string",
    })?;
    let text = text.trim();
    if text.is_empty() {
        return Err(MalformedRecord::MissingField { field });
    }
    Ok(text.to_string())
}

fn optional_string(raw: &RawListing, field: &'static str) -> Result<Option<String>, MalformedRecord> {
    match raw.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => {
            let s = s.trim();
            Ok((!s.is_empty()).then(|| s.to_string()))
        }
        Some(_) => Err(MalformedRecord::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn number_field(raw: &RawListing, field: &'static str) -> Result<i64, MalformedRecord> {
    let wrong_type = MalformedRecord::WrongType {
        field,
        expected: "a whole number or numeric string",
    };
    match raw.get(field) {
        None | Some(JsonValue::Null) => Ok(0),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(whole_number))
            .ok_or(wrong_type),
        Some(JsonValue::String(s)) if s.trim().is_empty() => Ok(0),
        Some(JsonValue::String(s)) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(whole_number))
                .ok_or(wrong_type)
        }
        Some(_) => Err(wrong_type),
    }
}

/// `120.0` counts as 120 units; `120.5` is not a unit count.
fn whole_number(value: f64) -> Option<i64> {
    let in_range = value >= i64::MIN as f64 && value < i64::MAX as f64;
    (value.is_finite() && value.fract() == 0.0 && in_range).then_some(value as i64)
}
