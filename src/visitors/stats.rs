//! Read-only projections over the aggregate

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use super::{DailyBucket, DayKey, VisitorAggregate};

pub const WEEK_DAYS: u64 = 7;
pub const MONTH_DAYS: u64 = 30;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DayCounts {
    pub views: u64,
    pub uniques: u64,
}

impl From<&DailyBucket> for DayCounts {
    fn from(bucket: &DailyBucket) -> Self {
        Self {
            views: bucket.views(),
            uniques: bucket.uniques(),
        }
    }
}

/// Views and distinct visitors over a window of days
pub type Rollup = DayCounts;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_views: u64,
    pub total_uniques: u64,
    pub today: DayCounts,
    pub daily_stats: BTreeMap<DayKey, DayCounts>,
    pub last_updated: DateTime<Utc>,
}

impl VisitorAggregate {
    pub fn current_snapshot(&self, today: DayKey) -> StatsSnapshot {
        let daily_stats = self
            .daily_stats()
            .iter()
            .map(|(day, bucket)| (*day, DayCounts::from(bucket)))
            .collect();

        StatsSnapshot {
            total_views: self.total_views(),
            total_uniques: self.total_uniques(),
            today: self.day(&today).map(DayCounts::from).unwrap_or_default(),
            daily_stats,
            last_updated: self.last_updated(),
        }
    }

    /// Sum the `window_days` days ending on `today` (inclusive).
    ///
    /// Uniques are the size of the union of the per-day identity sets, so a
    /// visitor seen on several days of the window counts once.
    pub fn rollup(&self, today: DayKey, window_days: u64) -> Rollup {
        if window_days == 0 {
            return Rollup::default();
        }
        let first = today.days_before(window_days - 1);

        let mut views = 0;
        let mut seen = HashSet::new();
        // Legacy counts have no ids to deduplicate against
        let mut uncounted = 0;
        for (day, bucket) in self.daily_stats() {
            if *day < first || *day > today {
                continue;
            }
            views += bucket.views();
            uncounted += bucket.legacy_uniques();
            seen.extend(bucket.unique_ids().iter().copied());
        }

        Rollup {
            views,
            uniques: seen.len() as u64 + uncounted,
        }
    }
}
