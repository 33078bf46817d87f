use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{EventRecord, StoreError};

/// Request-level failures surfaced to callers. Validation failures of
/// individual events are not in here: those become per-event `Rejected`
/// receipts without failing the call.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request holds no event")]
    EmptyBatch,

    /// A storage-level fault aborted the whole batch. Nothing from the batch
    /// was persisted and the stats ledger is unchanged; the caller may retry.
    #[error("batch was not applied: {0}")]
    StorageFault(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::EmptyBatch => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::StorageFault(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        }
        .into_response()
    }
}

/// Classification of one submitted event. `Duplicate` is an expected,
/// successful outcome under at-least-once delivery, disjoint from `Rejected`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    Created,
    Duplicate,
    Rejected,
}

/// Per-event outcome report, keyed by the dedup key the caller submitted.
#[derive(Debug, Deserialize, Serialize)]
pub struct EventReceipt {
    pub topic: String,
    pub event_id: String,
    pub outcome: EventOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Batch-level response for the publish endpoints. `received` counts every
/// event in the call, including rejected ones; the stats ledger only ever
/// counts events that reached the ingestion engine.
#[derive(Debug, Deserialize, Serialize)]
pub struct PublishResponse {
    pub received: usize,
    pub created: usize,
    pub duplicates: usize,
    pub rejected: usize,
    pub results: Vec<EventReceipt>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<EventRecord>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatsResponse {
    pub received: i64,
    pub unique_processed: i64,
    pub duplicate_dropped: i64,
    pub topics: Vec<String>,
    pub uptime_seconds: f64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
}
