use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use health::{ComponentStatus, HealthRegistry};

use crate::config::{Config, IngestionMode};
use crate::consumer::QueueConsumer;
use crate::ingest::Ingester;
use crate::router;
use crate::store::EventStore;

pub async fn serve<F>(config: Config, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let mode = IngestionMode::from_str(&config.ingestion_mode)
        .unwrap_or_else(|err| panic!("invalid configuration: {}", err));

    let store = EventStore::new(&config.database_url, config.max_pg_connections)
        .expect("failed to create event store");
    let ingester = Arc::new(Ingester::new(store.clone()));

    let liveness = HealthRegistry::new("liveness");

    // Database connectivity probe, reported on the liveness registry. Kept off
    // the ingestion path, a stalled probe should not block batches.
    let database_health = liveness
        .register("database".to_string(), time::Duration::seconds(30))
        .await;
    let ping_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;
            match ping_store.ping().await {
                Ok(()) => database_health.report_healthy().await,
                Err(err) => {
                    tracing::warn!("database ping failed: {}", err);
                    database_health
                        .report_status(ComponentStatus::Unhealthy)
                        .await
                }
            }
        }
    });

    if mode == IngestionMode::Queued {
        let consumer_health = liveness
            .register("consumer".to_string(), time::Duration::seconds(30))
            .await;
        let consumer = QueueConsumer::new(
            &config.redis_url,
            &config.queue_name,
            ingester.clone(),
            consumer_health,
        )
        .expect("failed to create queue consumer");
        tokio::spawn(consumer.run());
    }

    let app = router::router(ingester, store, liveness, config.export_prometheus);

    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .expect("failed to bind server address");
    tracing::info!("listening on {:?}", listener.local_addr().unwrap());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .unwrap()
}
