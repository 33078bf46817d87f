use metrics::counter;
use tracing::instrument;

use crate::api::EventOutcome;
use crate::event::Event;
use crate::store::{EventStore, StatsDelta, StoreResult};

/// The idempotent ingestion engine. Classifies each validated event as
/// created or duplicate by attempting a conditional insert, and applies the
/// resulting counter delta to the stats ledger, all inside one transaction
/// per batch.
pub struct Ingester {
    store: EventStore,
}

impl Ingester {
    pub fn new(store: EventStore) -> Self {
        Self { store }
    }

    /// Ingest a batch of validated events. Outcomes are returned in input
    /// order. Resubmitting any dedup key, in any batch, yields exactly one
    /// stored record over the lifetime of the system.
    ///
    /// All-or-nothing: if any write fails, the transaction is rolled back on
    /// drop, no record from this batch survives, and the ledger is unchanged.
    /// Retrying is the caller's decision.
    #[instrument(skip_all, fields(batch_size = events.len()))]
    pub async fn ingest(&self, events: &[Event]) -> StoreResult<Vec<EventOutcome>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.store.begin().await?;

        let mut outcomes = Vec::with_capacity(events.len());
        let mut created: i64 = 0;
        let mut duplicates: i64 = 0;

        for event in events {
            if self.store.insert_event_if_absent(&mut tx, event).await? {
                created += 1;
                outcomes.push(EventOutcome::Created);
            } else {
                duplicates += 1;
                outcomes.push(EventOutcome::Duplicate);
                tracing::debug!(
                    topic = %event.topic,
                    event_id = %event.event_id,
                    "dropped duplicate event"
                );
            }
        }

        self.store
            .apply_stats_delta(
                &mut tx,
                StatsDelta {
                    received: events.len() as i64,
                    unique_processed: created,
                    duplicate_dropped: duplicates,
                },
            )
            .await?;

        self.store.commit(tx).await?;

        counter!("aggregator_events_created_total").increment(created as u64);
        counter!("aggregator_events_duplicate_total").increment(duplicates as u64);
        tracing::info!(
            received = events.len(),
            created,
            duplicates,
            "committed batch"
        );

        Ok(outcomes)
    }
}
