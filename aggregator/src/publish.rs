use axum::extract::State;
use axum::Json;
use metrics::counter;
use tracing::instrument;

use crate::api::{ApiError, EventOutcome, EventReceipt, PublishResponse};
use crate::event::{Event, EventBatch, RawEvent};
use crate::router;

/// Validate the submitted events, hand the valid ones to the ingestion engine
/// as a single batch, and stitch per-event receipts back in input order.
/// Rejected events never reach the engine and never touch the ledger.
async fn process_events(
    state: &router::State,
    raw_events: Vec<RawEvent>,
) -> Result<PublishResponse, ApiError> {
    counter!("aggregator_events_received_total").increment(raw_events.len() as u64);

    let received = raw_events.len();
    let mut receipts: Vec<EventReceipt> = Vec::with_capacity(received);
    let mut valid_events: Vec<Event> = Vec::with_capacity(received);
    let mut valid_slots: Vec<usize> = Vec::with_capacity(received);

    for (slot, raw) in raw_events.into_iter().enumerate() {
        match raw.validate() {
            Ok(event) => {
                receipts.push(EventReceipt {
                    topic: event.topic.clone(),
                    event_id: event.event_id.clone(),
                    // Placeholder, overwritten with the engine's classification
                    outcome: EventOutcome::Rejected,
                    error: None,
                });
                valid_slots.push(slot);
                valid_events.push(event);
            }
            Err(err) => {
                tracing::debug!("rejected invalid event: {}", err);
                receipts.push(EventReceipt {
                    topic: raw.topic.unwrap_or_default(),
                    event_id: raw.event_id.unwrap_or_default(),
                    outcome: EventOutcome::Rejected,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    let rejected = received - valid_events.len();
    counter!("aggregator_events_rejected_total").increment(rejected as u64);

    let outcomes = state.ingester.ingest(&valid_events).await?;
    for (slot, outcome) in valid_slots.into_iter().zip(outcomes) {
        receipts[slot].outcome = outcome;
    }

    let created = receipts
        .iter()
        .filter(|r| r.outcome == EventOutcome::Created)
        .count();
    let duplicates = receipts
        .iter()
        .filter(|r| r.outcome == EventOutcome::Duplicate)
        .count();

    Ok(PublishResponse {
        received,
        created,
        duplicates,
        rejected,
        results: receipts,
    })
}

#[instrument(skip_all)]
pub async fn publish_event(
    state: State<router::State>,
    Json(event): Json<RawEvent>,
) -> Result<Json<PublishResponse>, ApiError> {
    let response = process_events(&state, vec![event]).await?;
    Ok(Json(response))
}

#[instrument(skip_all, fields(batch_size))]
pub async fn publish_batch(
    state: State<router::State>,
    Json(batch): Json<EventBatch>,
) -> Result<Json<PublishResponse>, ApiError> {
    tracing::Span::current().record("batch_size", batch.events.len());

    if batch.events.is_empty() {
        return Err(ApiError::EmptyBatch);
    }

    let response = process_events(&state, batch.events).await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt; // for `collect`
    use sqlx::PgPool;
    use tower::ServiceExt; // for `oneshot`

    use crate::api::{EventOutcome, PublishResponse};
    use crate::event::RawEvent;
    use crate::ingest::Ingester;
    use crate::router;
    use crate::store::EventStore;
    use health::HealthRegistry;

    fn test_app(db: PgPool) -> Router {
        let store = EventStore::from_pool(db);
        let ingester = Arc::new(Ingester::new(store.clone()));
        let liveness = HealthRegistry::new("liveness");
        router::router(ingester, store, liveness, false)
    }

    fn raw_event(topic: &str, event_id: &str) -> RawEvent {
        RawEvent {
            topic: Some(topic.to_string()),
            event_id: Some(event_id.to_string()),
            timestamp: Some("2024-01-10T12:00:00Z".to_string()),
            source: Some("publisher-1".to_string()),
            payload: Some(serde_json::json!({"n": 1})),
        }
    }

    async fn post_json(app: Router, uri: &str, body: String) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(http::Method::POST)
                    .uri(uri)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn single_event_created_then_duplicate(db: PgPool) {
        let app = test_app(db);
        let body = serde_json::to_string(&raw_event("logs", "evt-1")).unwrap();

        let (status, response) = post_json(app.clone(), "/publish", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let response: PublishResponse = serde_json::from_slice(&response).unwrap();
        assert_eq!(response.received, 1);
        assert_eq!(response.created, 1);
        assert_eq!(response.results[0].outcome, EventOutcome::Created);

        let (status, response) = post_json(app, "/publish", body).await;
        assert_eq!(status, StatusCode::OK);
        let response: PublishResponse = serde_json::from_slice(&response).unwrap();
        assert_eq!(response.created, 0);
        assert_eq!(response.duplicates, 1);
        assert_eq!(response.results[0].outcome, EventOutcome::Duplicate);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn invalid_batch_member_rejected_without_failing_siblings(db: PgPool) {
        let app = test_app(db.clone());

        let mut invalid = raw_event("logs", "evt-bad");
        invalid.topic = None;
        let batch = serde_json::json!({
            "events": [invalid, raw_event("logs", "evt-2"), raw_event("logs", "evt-3")]
        });

        let (status, response) = post_json(app, "/publish/batch", batch.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        let response: PublishResponse = serde_json::from_slice(&response).unwrap();
        assert_eq!(response.received, 3);
        assert_eq!(response.created, 2);
        assert_eq!(response.rejected, 1);
        assert_eq!(response.results[0].outcome, EventOutcome::Rejected);
        assert!(response.results[0].error.is_some());

        // The rejected event never reached the ledger
        let received: i64 = sqlx::query_scalar("SELECT received FROM stats WHERE id = 1")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(received, 2);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn batch_outcomes_follow_input_order(db: PgPool) {
        let app = test_app(db);

        let seed = serde_json::json!({ "events": [raw_event("logs", "evt-1")] });
        let _seed_response = post_json(app.clone(), "/publish/batch", seed.to_string()).await;

        let batch = serde_json::json!({
            "events": [
                raw_event("logs", "evt-1"),
                raw_event("logs", "evt-2"),
                raw_event("logs", "evt-3"),
            ]
        });
        let (status, response) = post_json(app, "/publish/batch", batch.to_string()).await;
        assert_eq!(status, StatusCode::OK);
        let response: PublishResponse = serde_json::from_slice(&response).unwrap();
        let outcomes: Vec<_> = response.results.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                EventOutcome::Duplicate,
                EventOutcome::Created,
                EventOutcome::Created
            ]
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn storage_fault_fails_the_whole_batch(db: PgPool) {
        let app = test_app(db.clone());

        // Break the dedup store underneath the handler; the batch must come
        // back as one failure with no per-event outcome list and no ledger
        // change.
        sqlx::query("DROP TABLE processed_events")
            .execute(&db)
            .await
            .unwrap();

        let batch = serde_json::json!({
            "events": [raw_event("logs", "evt-1"), raw_event("logs", "evt-2")]
        });
        let (status, body) = post_json(app, "/publish/batch", batch.to_string()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("batch was not applied"));
        assert!(!body.contains("results"));

        let received: i64 = sqlx::query_scalar("SELECT received FROM stats WHERE id = 1")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(received, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn empty_batch_is_a_bad_request(db: PgPool) {
        let app = test_app(db);
        let (status, _) = post_json(app, "/publish/batch", r#"{"events": []}"#.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn undecodable_body_is_a_client_error(db: PgPool) {
        let app = test_app(db);
        let (status, _) = post_json(app, "/publish", "not json".to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
