//! Visitor counter engine
//!
//! Owns the aggregate for the life of the process: loaded at startup, mutated
//! by page views, flushed at shutdown. Cloning the counter clones the handle,
//! not the data.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::storage::{
    load_or_default, start_write_back, SharedBackend, StorageResult, WriteBackHandle,
    WriteBackSettings,
};
use crate::visitors::stats::{MONTH_DAYS, WEEK_DAYS};
use crate::visitors::{DayKeyResolver, Identity, RecordOutcome, Rollup, StatsSnapshot, VisitorAggregate};

/// The aggregate plus a revision bumped on every recorded view
#[derive(Debug)]
pub struct CounterState {
    aggregate: VisitorAggregate,
    revision: u64,
}

impl CounterState {
    pub fn new(aggregate: VisitorAggregate) -> Self {
        Self {
            aggregate,
            revision: 0,
        }
    }

    pub fn aggregate(&self) -> &VisitorAggregate {
        &self.aggregate
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn record_view(
        &mut self,
        resolver: &DayKeyResolver,
        timestamp: DateTime<Utc>,
        identity: Identity,
    ) -> RecordOutcome {
        self.revision += 1;
        self.aggregate.record_view(resolver, timestamp, identity)
    }

    pub fn mark_persisted(&mut self, at: DateTime<Utc>) {
        self.aggregate.mark_persisted(at);
    }

    /// Swap in a freshly loaded aggregate. The revision is unchanged since the
    /// new aggregate matches what is stored.
    pub fn replace(&mut self, aggregate: VisitorAggregate) {
        self.aggregate = aggregate;
    }
}

pub type SharedState = Arc<RwLock<CounterState>>;

/// Stats plus week and month rollups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSnapshot {
    pub stats: StatsSnapshot,
    pub weekly: Rollup,
    pub monthly: Rollup,
}

#[derive(Clone)]
pub struct VisitorCounter {
    state: SharedState,
    resolver: DayKeyResolver,
    write_back: WriteBackHandle,
    reload_before_read: bool,
}

impl VisitorCounter {
    /// Load the latest snapshot from `backend` and start write-back
    pub async fn start(
        backend: SharedBackend,
        resolver: DayKeyResolver,
        settings: WriteBackSettings,
    ) -> Self {
        let (aggregate, loaded) = match load_or_default(backend.as_ref()).await {
            Ok(aggregate) => (aggregate, true),
            Err(e) => {
                error!(
                    "Failed to load visitor data from {} backend, saves held until it can be read: {}",
                    backend.name(),
                    e
                );
                (VisitorAggregate::new(), false)
            }
        };
        let reload_before_read = backend.shared();
        let state = Arc::new(RwLock::new(CounterState::new(aggregate)));
        let write_back = start_write_back(state.clone(), backend, settings, loaded).await;

        info!(
            "Visitor counter ready (utc_offset={}min)",
            resolver.offset_minutes()
        );

        Self {
            state,
            resolver,
            write_back,
            reload_before_read,
        }
    }

    /// Count a page view from the given client, timestamped now
    pub async fn record_page_view(
        &self,
        address: Option<&str>,
        user_agent: Option<&str>,
    ) -> RecordOutcome {
        let identity = Identity::from_request(address, user_agent);
        self.record_view(Utc::now(), identity).await
    }

    pub async fn record_view(&self, timestamp: DateTime<Utc>, identity: Identity) -> RecordOutcome {
        let outcome = self
            .state
            .write()
            .await
            .record_view(&self.resolver, timestamp, identity);
        self.write_back.mark_dirty();

        debug!(
            day = %outcome.day,
            new_all_time = outcome.new_all_time,
            new_today = outcome.new_today,
            "Recorded page view"
        );
        outcome
    }

    pub async fn stats(&self) -> StatsSnapshot {
        self.refresh().await;
        let today = self.resolver.today();
        self.state.read().await.aggregate().current_snapshot(today)
    }

    pub async fn admin_stats(&self) -> AdminSnapshot {
        self.refresh().await;
        let today = self.resolver.today();
        let state = self.state.read().await;
        let aggregate = state.aggregate();

        AdminSnapshot {
            stats: aggregate.current_snapshot(today),
            weekly: aggregate.rollup(today, WEEK_DAYS),
            monthly: aggregate.rollup(today, MONTH_DAYS),
        }
    }

    /// Persist the current state immediately
    pub async fn flush(&self) -> StorageResult<()> {
        self.write_back.flush().await
    }

    async fn refresh(&self) {
        if self.reload_before_read {
            self.write_back.reload().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{sample_aggregate, MemoryBackend};
    use crate::storage::{FileBackend, StorageBackend};
    use std::time::Duration;
    use tempfile::TempDir;

    fn settings() -> WriteBackSettings {
        WriteBackSettings {
            debounce: Duration::from_millis(500),
            retry: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_fresh_counter_starts_empty() {
        let backend = Arc::new(MemoryBackend::default());
        let counter = VisitorCounter::start(backend, DayKeyResolver::utc(), settings()).await;

        let stats = counter.stats().await;
        assert_eq!(stats.total_views, 0);
        assert_eq!(stats.total_uniques, 0);
        assert!(stats.daily_stats.is_empty());
    }

    #[tokio::test]
    async fn test_page_views_show_up_in_today() {
        let backend = Arc::new(MemoryBackend::default());
        let counter = VisitorCounter::start(backend, DayKeyResolver::utc(), settings()).await;

        counter.record_page_view(Some("10.0.0.1"), Some("Firefox")).await;
        counter.record_page_view(Some("10.0.0.1"), Some("Firefox")).await;
        let outcome = counter.record_page_view(Some("10.0.0.2"), None).await;
        assert!(outcome.new_all_time);

        let stats = counter.stats().await;
        assert_eq!(stats.total_views, 3);
        assert_eq!(stats.total_uniques, 2);
        assert_eq!(stats.today.views, 3);
        assert_eq!(stats.today.uniques, 2);

        let admin = counter.admin_stats().await;
        assert_eq!(admin.weekly, Rollup { views: 3, uniques: 2 });
        assert_eq!(admin.monthly, Rollup { views: 3, uniques: 2 });
    }

    #[tokio::test]
    async fn test_flush_then_restart_restores_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("visitor-data.json");

        let counter = VisitorCounter::start(
            Arc::new(FileBackend::new(&path)),
            DayKeyResolver::utc(),
            settings(),
        )
        .await;
        counter.record_page_view(Some("10.0.0.1"), Some("Firefox")).await;
        counter.record_page_view(Some("10.0.0.2"), Some("Firefox")).await;
        counter.flush().await.unwrap();
        let before = counter.stats().await;

        let restarted = VisitorCounter::start(
            Arc::new(FileBackend::new(&path)),
            DayKeyResolver::utc(),
            settings(),
        )
        .await;
        let after = restarted.stats().await;

        assert_eq!(after, before);
    }

    #[tokio::test]
    async fn test_shared_backend_reloads_before_stats() {
        let backend = Arc::new(MemoryBackend::shared_store());
        let counter = VisitorCounter::start(backend.clone(), DayKeyResolver::utc(), settings()).await;

        backend.put(sample_aggregate());
        assert_eq!(counter.stats().await.total_views, 4);
    }

    #[tokio::test]
    async fn test_unreadable_store_is_not_overwritten_at_startup() {
        let backend = Arc::new(MemoryBackend::default());
        backend.put(sample_aggregate());
        backend.fail_next_loads(1);

        let counter = VisitorCounter::start(backend.clone(), DayKeyResolver::utc(), settings()).await;
        counter.record_page_view(Some("10.0.0.9"), Some("Firefox")).await;
        counter.flush().await.unwrap();

        let stored = backend.stored().unwrap();
        assert_eq!(stored.total_views(), 5);
        assert_eq!(stored.total_uniques(), 3);
        assert_eq!(counter.stats().await.total_views, 5);
    }

    #[tokio::test]
    async fn test_saves_held_while_store_stays_unreadable() {
        let backend = Arc::new(MemoryBackend::default());
        backend.put(sample_aggregate());
        backend.fail_next_loads(2);

        let counter = VisitorCounter::start(backend.clone(), DayKeyResolver::utc(), settings()).await;
        counter.record_page_view(Some("10.0.0.9"), Some("Firefox")).await;

        assert!(counter.flush().await.is_err());
        assert_eq!(backend.save_count(), 0);
        assert_eq!(backend.stored().unwrap().total_views(), 4);

        counter.flush().await.unwrap();
        assert_eq!(backend.stored().unwrap().total_views(), 5);
    }

    #[tokio::test]
    async fn test_failed_reload_serves_memory_state() {
        let backend = Arc::new(MemoryBackend::shared_store());
        let counter = VisitorCounter::start(backend.clone(), DayKeyResolver::utc(), settings()).await;
        counter.record_page_view(Some("10.0.0.1"), Some("Firefox")).await;
        counter.record_page_view(Some("10.0.0.2"), Some("Firefox")).await;
        counter.flush().await.unwrap();

        backend.fail_next_loads(1);
        let stats = counter.stats().await;
        assert_eq!(stats.total_views, 2);
        assert_eq!(stats.total_uniques, 2);
        assert_eq!(stats.today.views, 2);
    }

    #[tokio::test]
    async fn test_local_backend_does_not_reload() {
        let backend = Arc::new(MemoryBackend::default());
        let counter = VisitorCounter::start(backend.clone(), DayKeyResolver::utc(), settings()).await;

        backend.put(sample_aggregate());
        assert_eq!(counter.stats().await.total_views, 0);
        assert_eq!(backend.load().await.unwrap().unwrap().total_views(), 4);
    }
}
