//! Day bucketing

use chrono::{DateTime, Days, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest accepted offset from UTC, in minutes
pub const MAX_OFFSET_MINUTES: i32 = 24 * 60 - 1;

/// Calendar day in the deployment's local time, rendered as `YYYY-MM-DD`.
///
/// Ordering is chronological, which for this format is also lexicographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayKey(NaiveDate);

impl DayKey {
    /// The day `days` before this one, saturating at the calendar minimum
    pub fn days_before(&self, days: u64) -> Self {
        Self(self.0.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN))
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl std::str::FromStr for DayKey {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").map(Self)
    }
}

/// Maps timestamps to [`DayKey`]s using a fixed offset from UTC.
///
/// The offset is read once at startup. Changing it after data has accumulated
/// moves historical day boundaries.
#[derive(Debug, Clone, Copy)]
pub struct DayKeyResolver {
    offset: FixedOffset,
}

impl DayKeyResolver {
    /// Build a resolver for `offset_minutes` east of UTC.
    ///
    /// Returns `None` when the offset is outside ±[`MAX_OFFSET_MINUTES`].
    pub fn new(offset_minutes: i32) -> Option<Self> {
        if offset_minutes.abs() > MAX_OFFSET_MINUTES {
            return None;
        }
        FixedOffset::east_opt(offset_minutes * 60).map(|offset| Self { offset })
    }

    pub fn utc() -> Self {
        Self { offset: Utc.fix() }
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    pub fn resolve(&self, timestamp: DateTime<Utc>) -> DayKey {
        DayKey(timestamp.with_timezone(&self.offset).date_naive())
    }

    pub fn today(&self) -> DayKey {
        self.resolve(Utc::now())
    }
}

impl Default for DayKeyResolver {
    fn default() -> Self {
        Self::utc()
    }
}
