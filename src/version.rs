//! Row versions and time-bucket arithmetic.
//!
//! Every row carries a [`Version`]: the microsecond replication/capture
//! timestamp assigned at write time. For a fixed business key, only the row
//! with the maximum version is current; ties on version fall back to the
//! per-table insertion sequence (see `reconcile`).
//!
//! [`Granularity`] provides the truncation used by rollup time buckets and
//! by the backfill driver's partitioning.

use chrono::{DateTime, Datelike, Months, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A row version: microseconds since the Unix epoch.
///
/// Versions are totally ordered and assigned by the writer (for replicated
/// rows, the capture timestamp). They are compared, never interpreted as
/// wall-clock truth.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version(pub i64);

impl Version {
    pub fn new(micros: i64) -> Self {
        Version(micros)
    }

    /// The current wall clock, as a version.
    pub fn now() -> Self {
        Version(Utc::now().timestamp_micros())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Version(dt.timestamp_micros())
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_micros(self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.0)
    }
}

// ── Time buckets ───────────────────────────────────────────────────────────

/// Truncation granularity for rollup buckets and backfill partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Hour,
    Day,
    /// ISO week, starting Monday.
    Week,
    Month,
}

impl Granularity {
    /// Truncate a microsecond timestamp down to its bucket start.
    ///
    /// Timestamps outside chrono's representable range clamp to zero.
    pub fn truncate(&self, micros: i64) -> i64 {
        let Some(dt) = DateTime::<Utc>::from_timestamp_micros(micros) else {
            return 0;
        };
        let date = dt.date_naive();
        let truncated: NaiveDate = match self {
            Granularity::Hour | Granularity::Day => date,
            Granularity::Week => {
                let back = date.weekday().num_days_from_monday() as u64;
                date - chrono::Days::new(back)
            }
            Granularity::Month => match date.with_day(1) {
                Some(d) => d,
                None => date,
            },
        };
        let hour = if matches!(self, Granularity::Hour) {
            dt.hour()
        } else {
            0
        };
        match truncated.and_hms_opt(hour, 0, 0) {
            Some(naive) => Utc.from_utc_datetime(&naive).timestamp_micros(),
            None => 0,
        }
    }

    /// The start of the bucket after the one containing `micros`.
    pub fn advance(&self, micros: i64) -> i64 {
        let start = self.truncate(micros);
        match self {
            Granularity::Hour => start + 3_600 * 1_000_000,
            Granularity::Day => start + 86_400 * 1_000_000,
            Granularity::Week => start + 7 * 86_400 * 1_000_000,
            Granularity::Month => {
                let Some(dt) = DateTime::<Utc>::from_timestamp_micros(start) else {
                    return start;
                };
                match dt.checked_add_months(Months::new(1)) {
                    Some(next) => next.timestamp_micros(),
                    None => start,
                }
            }
        }
    }
}

/// Microseconds for a UTC calendar date/time; test and fixture helper.
pub fn micros_at(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> i64 {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, min, sec))
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp_micros())
        .unwrap_or(0)
}
