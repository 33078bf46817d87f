use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use redis::AsyncCommands;
use thiserror::Error;

use crate::event::{Event, ValidationError};
use crate::ingest::Ingester;
use health::HealthHandle;

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("failed to decode queued event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("queued event failed validation: {0}")]
    Validation(#[from] ValidationError),
}

/// Decode one queue entry into a validated event. Queue producers serialize
/// the same JSON shape the publish endpoints accept.
pub fn decode_queued_event(payload: &str) -> Result<Event, ConsumeError> {
    let raw: crate::event::RawEvent = serde_json::from_str(payload)?;
    Ok(raw.validate()?)
}

/// Background worker draining the Redis queue buffer into the ingestion
/// engine, one event at a time. Only runs in queued ingestion mode; producers
/// enqueue on the other side, this end only consumes.
pub struct QueueConsumer {
    client: redis::Client,
    queue_name: String,
    ingester: Arc<Ingester>,
    liveness: HealthHandle,
}

impl QueueConsumer {
    pub fn new(
        redis_url: &str,
        queue_name: &str,
        ingester: Arc<Ingester>,
        liveness: HealthHandle,
    ) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;

        Ok(Self {
            client,
            queue_name: queue_name.to_owned(),
            ingester,
            liveness,
        })
    }

    /// Run until the process shuts down. Connection failures back off and
    /// reconnect; a bad message is logged and dropped, it cannot be reported
    /// back to its producer.
    pub async fn run(self) {
        loop {
            let mut conn = match self.client.get_async_connection().await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!("failed to connect to redis: {}", err);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            tracing::info!(queue = self.queue_name, "consuming from redis queue");

            loop {
                self.liveness.report_healthy().await;

                // BRPOP with a 1 second timeout, so the loop stays responsive
                // without busy-waiting on an empty queue.
                let popped: Option<(String, String)> =
                    match conn.brpop(&self.queue_name, 1.0).await {
                        Ok(popped) => popped,
                        Err(err) => {
                            tracing::error!("redis pop failed: {}", err);
                            break; // reconnect
                        }
                    };

                let Some((_, payload)) = popped else {
                    continue;
                };

                match decode_queued_event(&payload) {
                    Ok(event) => {
                        if let Err(err) = self.ingester.ingest(&[event]).await {
                            // The event was popped and not committed; upstream
                            // at-least-once redelivery covers the loss.
                            tracing::error!("failed to ingest queued event: {}", err);
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                    Err(err) => {
                        counter!("aggregator_queue_events_rejected_total").increment(1);
                        tracing::warn!("dropping bad queue message: {}", err);
                    }
                }
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}
