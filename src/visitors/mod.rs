//! Visitor state
//!
//! In-memory aggregate of page views: the all-time total, the set of every
//! identity ever seen, and a per-day breakdown with its own identity set.
//! All-time and per-day uniqueness are tracked independently, so a returning
//! visitor still counts as unique on each new day they show up.

pub mod day_key;
pub mod identity;
pub mod stats;

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

pub use day_key::{DayKey, DayKeyResolver};
pub use identity::Identity;
pub use stats::{DayCounts, Rollup, StatsSnapshot};

/// Views and unique visitors for one calendar day.
///
/// Records written before per-day ids were kept carry only a unique count.
/// That count is kept as `legacy_uniques`, separate from the id set, and
/// `uniques() == legacy_uniques + |unique_ids|` always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DailyBucket {
    views: u64,
    unique_ids: HashSet<Identity>,
    legacy_uniques: u64,
}

impl DailyBucket {
    /// Rebuild a bucket from persisted parts
    pub fn from_parts(views: u64, unique_ids: HashSet<Identity>, legacy_uniques: u64) -> Self {
        Self {
            views,
            unique_ids,
            legacy_uniques,
        }
    }

    pub fn views(&self) -> u64 {
        self.views
    }

    pub fn uniques(&self) -> u64 {
        self.legacy_uniques + self.unique_ids.len() as u64
    }

    pub fn unique_ids(&self) -> &HashSet<Identity> {
        &self.unique_ids
    }

    /// Uniques counted without ids
    pub fn legacy_uniques(&self) -> u64 {
        self.legacy_uniques
    }

    /// Visitors already inside the legacy count cannot be recognised, so a
    /// new id always adds one.
    fn record(&mut self, identity: Identity) -> bool {
        self.views += 1;
        self.unique_ids.insert(identity)
    }

    fn absorb(&mut self, other: &DailyBucket) {
        self.views += other.views;
        self.unique_ids.extend(other.unique_ids.iter().copied());
        self.legacy_uniques += other.legacy_uniques;
    }
}

/// What a single recorded view changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    pub day: DayKey,
    pub new_all_time: bool,
    pub new_today: bool,
}

/// The single persisted entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisitorAggregate {
    total_views: u64,
    all_time_unique_ids: HashSet<Identity>,
    daily_stats: HashMap<DayKey, DailyBucket>,
    last_updated: DateTime<Utc>,
}

impl Default for VisitorAggregate {
    fn default() -> Self {
        Self::new()
    }
}

impl VisitorAggregate {
    /// An empty aggregate, used when nothing has been persisted yet
    pub fn new() -> Self {
        Self {
            total_views: 0,
            all_time_unique_ids: HashSet::new(),
            daily_stats: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn from_parts(
        total_views: u64,
        all_time_unique_ids: HashSet<Identity>,
        daily_stats: HashMap<DayKey, DailyBucket>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            total_views,
            all_time_unique_ids,
            daily_stats,
            last_updated,
        }
    }

    /// Record one page view by `identity` at `timestamp`.
    ///
    /// Never fails. The caller is responsible for scheduling a save.
    pub fn record_view(
        &mut self,
        resolver: &DayKeyResolver,
        timestamp: DateTime<Utc>,
        identity: Identity,
    ) -> RecordOutcome {
        let day = resolver.resolve(timestamp);

        self.total_views += 1;
        let new_all_time = self.all_time_unique_ids.insert(identity);
        let new_today = self.daily_stats.entry(day).or_default().record(identity);
        self.last_updated = timestamp;

        RecordOutcome {
            day,
            new_all_time,
            new_today,
        }
    }

    pub fn total_views(&self) -> u64 {
        self.total_views
    }

    pub fn total_uniques(&self) -> u64 {
        self.all_time_unique_ids.len() as u64
    }

    pub fn all_time_unique_ids(&self) -> &HashSet<Identity> {
        &self.all_time_unique_ids
    }

    pub fn daily_stats(&self) -> &HashMap<DayKey, DailyBucket> {
        &self.daily_stats
    }

    pub fn day(&self, day: &DayKey) -> Option<&DailyBucket> {
        self.daily_stats.get(day)
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Add views recorded in `other` on top of this aggregate.
    ///
    /// Used when views were counted in memory before the stored snapshot
    /// could be read: `other` then holds only those views.
    pub fn merge(&mut self, other: &VisitorAggregate) {
        self.total_views += other.total_views;
        self.all_time_unique_ids
            .extend(other.all_time_unique_ids.iter().copied());
        for (day, bucket) in &other.daily_stats {
            self.daily_stats.entry(*day).or_default().absorb(bucket);
        }
        self.last_updated = self.last_updated.max(other.last_updated);
    }

    /// Bump `last_updated` after a successful persist
    pub fn mark_persisted(&mut self, at: DateTime<Utc>) {
        if at > self.last_updated {
            self.last_updated = at;
        }
    }
}
