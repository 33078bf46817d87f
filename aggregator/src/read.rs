use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use tracing::instrument;

use crate::api::{ApiError, EventsResponse, StatsResponse};
use crate::router;

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub topic: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// List processed events, newest first. Pure read on the pool, outside any
/// ingestion transaction.
#[instrument(skip_all, fields(topic))]
pub async fn list_events(
    state: State<router::State>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventsResponse>, ApiError> {
    if let Some(topic) = query.topic.as_deref() {
        tracing::Span::current().record("topic", topic);
    }

    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);

    let events = state
        .store
        .list_events(query.topic.as_deref(), limit, offset)
        .await?;

    Ok(Json(EventsResponse {
        count: events.len(),
        events,
        topic: query.topic,
    }))
}

/// Current counter snapshot. May observe a value mid-update from another
/// in-flight batch; good enough for reporting.
#[instrument(skip_all)]
pub async fn get_stats(state: State<router::State>) -> Result<Json<StatsResponse>, ApiError> {
    let (record, topics) = state.store.get_stats().await?;

    let uptime_seconds = (Utc::now() - record.started_at).num_milliseconds() as f64 / 1000.0;

    Ok(Json(StatsResponse {
        received: record.received,
        unique_processed: record.unique_processed,
        duplicate_dropped: record.duplicate_dropped,
        topics,
        uptime_seconds,
    }))
}
