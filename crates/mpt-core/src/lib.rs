//! Core domain model for the menu price tracker: runs, pages, catalog entries and
//! price observations, plus the small pure helpers shared by every pipeline stage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "mpt-core";

/// Currency recorded on every observation; the pipeline tracks a single currency.
pub const DEFAULT_CURRENCY: &str = "EUR";
pub const DEFAULT_CURRENCY_SYMBOL: &str = "€";

/// Vendor name used when the source URL carries no usable path segment.
pub const UNKNOWN_VENDOR: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Failed,
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Failed => "failed",
            RunStatus::Partial => "partial",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown run status {0:?}")]
pub struct ParseRunStatusError(pub String);

impl FromStr for RunStatus {
    type Err = ParseRunStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(RunStatus::Ok),
            "failed" => Ok(RunStatus::Failed),
            "partial" => Ok(RunStatus::Partial),
            other => Err(ParseRunStatusError(other.to_string())),
        }
    }
}

/// One execution of the fetch loop. `finished_at == None` means the run never completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

impl ScrapeRun {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Immutable raw snapshot of one fetched URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub id: i64,
    pub run_id: i64,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(skip)]
    pub raw_content: Vec<u8>,
    pub http_status: u16,
    pub content_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MenuItem {
    pub id: i64,
    pub vendor: String,
    pub item_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub id: i64,
    pub menu_item_id: i64,
    pub page_id: i64,
    pub price: Price,
    pub currency: String,
    pub observed_at: DateTime<Utc>,
}

/// Monetary amount held as integer minor units (cents) of the pipeline currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price {
    minor_units: i64,
}

impl Price {
    pub const MINOR_PER_MAJOR: i64 = 100;

    pub const fn from_minor_units(minor_units: i64) -> Self {
        Self { minor_units }
    }

    pub const fn minor_units(&self) -> i64 {
        self.minor_units
    }

    /// Converts a major-unit amount, rounding half away from zero to the nearest minor unit.
    pub fn from_major(amount: f64) -> Option<Self> {
        if !amount.is_finite() {
            return None;
        }
        let scaled = (amount * Self::MINOR_PER_MAJOR as f64).round();
        if scaled.abs() > i64::MAX as f64 {
            return None;
        }
        Some(Self::from_minor_units(scaled as i64))
    }

    pub fn as_major(&self) -> f64 {
        self.minor_units as f64 / Self::MINOR_PER_MAJOR as f64
    }

    /// Parses an unsigned numeral with at most two decimal digits, accepting either `.` or `,`
    /// as the decimal separator (`3,50`, `3.5`, `12`). Parsing is exact; no float is involved.
    pub fn parse_numeral(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (int_part, frac_part) = match raw.find(['.', ',']) {
            Some(idx) => {
                let frac = &raw[idx + 1..];
                if frac.is_empty() {
                    return None;
                }
                (&raw[..idx], frac)
            }
            None => (raw, ""),
        };
        if int_part.is_empty()
            || frac_part.len() > 2
            || !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        let major: i64 = int_part.parse().ok()?;
        let minor = match frac_part.len() {
            0 => 0,
            1 => frac_part.parse::<i64>().ok()? * 10,
            _ => frac_part.parse::<i64>().ok()?,
        };
        major
            .checked_mul(Self::MINOR_PER_MAJOR)
            .and_then(|v| v.checked_add(minor))
            .map(Self::from_minor_units)
    }

    /// European presentation: thousands grouped with `.`, decimals after `,`, symbol last.
    pub fn format_european(&self, symbol: &str) -> String {
        let sign = if self.minor_units < 0 { "-" } else { "" };
        let abs = self.minor_units.unsigned_abs();
        let major = (abs / Self::MINOR_PER_MAJOR as u64).to_string();
        let minor = abs % Self::MINOR_PER_MAJOR as u64;

        let mut grouped = String::with_capacity(major.len() + major.len() / 3);
        for (i, ch) in major.chars().enumerate() {
            if i > 0 && (major.len() - i) % 3 == 0 {
                grouped.push('.');
            }
            grouped.push(ch);
        }
        format!("{sign}{grouped},{minor:02} {symbol}")
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.minor_units < 0 { "-" } else { "" };
        let abs = self.minor_units.unsigned_abs();
        let per = Self::MINOR_PER_MAJOR as u64;
        write!(f, "{sign}{}.{:02}", abs / per, abs % per)
    }
}

/// Timestamps are persisted as ISO-8601 UTC strings at full nanosecond precision.
///
/// The fraction always has nine digits so stored values sort lexically in time order.
pub fn iso_utc(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_iso_utc(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}

/// Derives a vendor name from the last path segment of a listing URL.
///
/// Query string and fragment are ignored. A trailing slash is skipped rather than read as an
/// empty last segment, so `.../souvlaki-bar/` yields `souvlaki bar`, not [`UNKNOWN_VENDOR`].
/// Hyphens become spaces and the result is trimmed. A URL without a usable segment yields
/// [`UNKNOWN_VENDOR`].
pub fn derive_vendor(source_url: &str) -> String {
    let without_fragment = source_url.split('#').next().unwrap_or_default();
    let without_query = without_fragment.split('?').next().unwrap_or_default();
    let path = match without_query.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map(|(_, path)| path).unwrap_or_default(),
        None => without_query,
    };

    let segment = path.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
    let vendor = segment.replace('-', " ").trim().to_string();
    if vendor.is_empty() {
        UNKNOWN_VENDOR.to_string()
    } else {
        vendor
    }
}
