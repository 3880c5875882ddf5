//! HTTP routes for visitor statistics

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::AppState;
use crate::counter::AdminSnapshot;
use crate::visitors::{DayCounts, DayKey, StatsSnapshot};

/// Liveness check
pub async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorStatsResponse {
    pub total_visitors: u64,
    pub unique_visitors: u64,
    pub today_visitors: u64,
    pub today_unique_visitors: u64,
    pub daily_stats: BTreeMap<DayKey, DayCounts>,
    pub last_updated: DateTime<Utc>,
}

impl From<StatsSnapshot> for VisitorStatsResponse {
    fn from(snapshot: StatsSnapshot) -> Self {
        Self {
            total_visitors: snapshot.total_views,
            unique_visitors: snapshot.total_uniques,
            today_visitors: snapshot.today.views,
            today_unique_visitors: snapshot.today.uniques,
            daily_stats: snapshot.daily_stats,
            last_updated: snapshot.last_updated,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStatsResponse {
    #[serde(flatten)]
    pub stats: VisitorStatsResponse,
    pub weekly_visitors: u64,
    pub weekly_unique_visitors: u64,
    pub monthly_visitors: u64,
    pub monthly_unique_visitors: u64,
}

impl From<AdminSnapshot> for AdminStatsResponse {
    fn from(snapshot: AdminSnapshot) -> Self {
        Self {
            stats: snapshot.stats.into(),
            weekly_visitors: snapshot.weekly.views,
            weekly_unique_visitors: snapshot.weekly.uniques,
            monthly_visitors: snapshot.monthly.views,
            monthly_unique_visitors: snapshot.monthly.uniques,
        }
    }
}

/// API: Public visitor statistics
pub async fn visitor_stats(State(state): State<Arc<AppState>>) -> Json<VisitorStatsResponse> {
    Json(state.counter.stats().await.into())
}

/// API: Visitor statistics with weekly and monthly rollups
pub async fn admin_stats(State(state): State<Arc<AppState>>) -> Json<AdminStatsResponse> {
    Json(state.counter.admin_stats().await.into())
}
