//! Durable storage for the visitor aggregate
//!
//! Backends persist complete snapshots; there is no incremental update. The
//! wire format is the same JSON record for every backend.

mod document;
mod file;
mod schema;
mod write_back;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{StorageConfig, StorageKind};
use crate::visitors::{DailyBucket, DayKey, Identity, VisitorAggregate};

pub use document::DocumentBackend;
pub use file::FileBackend;
pub use write_back::{start_write_back, WriteBackHandle, WriteBackSettings};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    #[error("write-back task is not running")]
    Closed,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable load/save of full aggregate snapshots
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Most recent snapshot, or `None` when nothing has been saved yet
    async fn load(&self) -> StorageResult<Option<VisitorAggregate>>;

    /// Persist a snapshot, replacing any previous one
    async fn save(&self, aggregate: &VisitorAggregate) -> StorageResult<()>;

    /// Whether other processes may write the same record, so readers should
    /// reload before answering stats queries
    fn shared(&self) -> bool {
        false
    }
}

pub type SharedBackend = Arc<dyn StorageBackend>;

/// Per-day counts as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDay {
    #[serde(alias = "visits", default)]
    pub views: u64,
    #[serde(default)]
    pub uniques: u64,
}

/// Persisted record layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub total_visitors: u64,
    #[serde(default)]
    pub unique_visitors: Vec<Identity>,
    #[serde(default)]
    pub daily_stats: BTreeMap<DayKey, StoredDay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_unique_ids: Option<BTreeMap<DayKey, Vec<Identity>>>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl Snapshot {
    /// Capture an aggregate, with identity sets written in sorted order
    pub fn capture(aggregate: &VisitorAggregate) -> Self {
        let mut unique_visitors: Vec<_> = aggregate.all_time_unique_ids().iter().copied().collect();
        unique_visitors.sort_unstable();

        let mut daily_stats = BTreeMap::new();
        let mut daily_unique_ids = BTreeMap::new();
        for (day, bucket) in aggregate.daily_stats() {
            daily_stats.insert(
                *day,
                StoredDay {
                    views: bucket.views(),
                    uniques: bucket.uniques(),
                },
            );
            if !bucket.unique_ids().is_empty() {
                let mut ids: Vec<_> = bucket.unique_ids().iter().copied().collect();
                ids.sort_unstable();
                daily_unique_ids.insert(*day, ids);
            }
        }

        Self {
            total_visitors: aggregate.total_views(),
            unique_visitors,
            daily_stats,
            daily_unique_ids: Some(daily_unique_ids),
            last_updated: aggregate.last_updated(),
        }
    }

    pub fn into_aggregate(self) -> VisitorAggregate {
        let mut per_day_ids = self.daily_unique_ids;
        let daily_stats = self
            .daily_stats
            .into_iter()
            .map(|(day, stored)| {
                let ids: HashSet<_> = per_day_ids
                    .as_mut()
                    .and_then(|map| map.remove(&day))
                    .unwrap_or_default()
                    .into_iter()
                    .collect();
                // `uniques` stays authoritative; whatever the ids don't cover was
                // counted by a record that kept only the number
                let legacy_uniques = stored.uniques.saturating_sub(ids.len() as u64);
                (day, DailyBucket::from_parts(stored.views, ids, legacy_uniques))
            })
            .collect();

        VisitorAggregate::from_parts(
            self.total_visitors,
            self.unique_visitors.into_iter().collect(),
            daily_stats,
            self.last_updated,
        )
    }

    pub fn to_json(&self) -> StorageResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(raw: &str) -> StorageResult<Self> {
        serde_json::from_str(raw).map_err(|e| StorageError::Corrupt(e.to_string()))
    }
}

/// Open the backend chosen in configuration.
///
/// A document store that cannot be reached falls back to the local file.
pub async fn open_backend(config: &StorageConfig) -> SharedBackend {
    match config.backend {
        StorageKind::Document => {
            match DocumentBackend::connect(&config.database_url, &config.document_key).await {
                Ok(backend) => {
                    info!("Using document store backend (key={})", config.document_key);
                    return Arc::new(backend);
                }
                Err(e) => {
                    warn!("Document store unavailable ({}), falling back to file backend", e);
                }
            }
        }
        StorageKind::File => {}
    }

    info!("Using file backend at {}", config.file_path.display());
    Arc::new(FileBackend::new(&config.file_path))
}

/// Load the starting aggregate, treating absence and corruption as empty.
///
/// Any other error is returned: the stored snapshot may still be intact and
/// must not be overwritten by an empty one.
pub async fn load_or_default(backend: &dyn StorageBackend) -> StorageResult<VisitorAggregate> {
    match backend.load().await {
        Ok(Some(aggregate)) => {
            info!(
                "Loaded visitor data from {} backend ({} views, {} unique)",
                backend.name(),
                aggregate.total_views(),
                aggregate.total_uniques()
            );
            Ok(aggregate)
        }
        Ok(None) => {
            info!("No visitor data in {} backend, starting fresh", backend.name());
            Ok(VisitorAggregate::new())
        }
        Err(StorageError::Corrupt(reason)) => {
            warn!("Ignoring corrupt visitor snapshot: {}", reason);
            Ok(VisitorAggregate::new())
        }
        Err(e) => Err(e),
    }
}
