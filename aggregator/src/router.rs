use std::future::ready;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Json, Router,
};
use tower_http::trace::TraceLayer;

use crate::api::HealthResponse;
use crate::ingest::Ingester;
use crate::metrics::{setup_metrics_recorder, track_metrics};
use crate::store::EventStore;
use crate::{publish, read};
use health::HealthRegistry;

#[derive(Clone)]
pub struct State {
    pub ingester: Arc<Ingester>,
    pub store: EventStore,
    pub liveness: HealthRegistry,
}

async fn index() -> &'static str {
    "aggregator"
}

/// Plain liveness answer for container orchestration. Deliberately does not
/// touch the database or any transactional path.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

pub fn router(
    ingester: Arc<Ingester>,
    store: EventStore,
    liveness: HealthRegistry,
    metrics: bool,
) -> Router {
    let status_registry = liveness.clone();
    let state = State {
        ingester,
        store,
        liveness,
    };

    let router = Router::new()
        .route("/", get(index))
        .route("/publish", post(publish::publish_event))
        .route("/publish/batch", post(publish::publish_batch))
        .route("/events", get(read::list_events))
        .route("/stats", get(read::get_stats))
        .route("/health", get(health))
        .route(
            "/_liveness",
            get(move || ready(status_registry.get_status())),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when the crate is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
