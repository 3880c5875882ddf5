//! Document store backend
//!
//! Keeps the snapshot as a single keyed record in a shared database, so several
//! server instances can point at the same counter.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use tracing::debug;

use super::{schema, Snapshot, StorageBackend, StorageResult};
use crate::visitors::VisitorAggregate;

const COLLECTION: &str = "counters";

#[derive(Clone)]
pub struct DocumentBackend {
    pool: Pool<Sqlite>,
    key: String,
}

impl DocumentBackend {
    /// Connect and make sure the documents table exists
    pub async fn connect(url: &str, key: &str) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let backend = Self {
            pool,
            key: key.to_string(),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    async fn run_migrations(&self) -> StorageResult<()> {
        sqlx::query(schema::CREATE_DOCUMENTS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for DocumentBackend {
    fn name(&self) -> &'static str {
        "document"
    }

    async fn load(&self) -> StorageResult<Option<VisitorAggregate>> {
        let row: Option<(String,)> = sqlx::query_as(schema::SELECT_DOCUMENT)
            .bind(COLLECTION)
            .bind(&self.key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((body,)) => Ok(Some(Snapshot::from_json(&body)?.into_aggregate())),
            None => Ok(None),
        }
    }

    async fn save(&self, aggregate: &VisitorAggregate) -> StorageResult<()> {
        let body = serde_json::to_string(&Snapshot::capture(aggregate))?;

        sqlx::query(schema::UPSERT_DOCUMENT)
            .bind(COLLECTION)
            .bind(&self.key)
            .bind(body)
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        debug!("Wrote visitor snapshot to document {}/{}", COLLECTION, self.key);
        Ok(())
    }

    fn shared(&self) -> bool {
        true
    }
}
