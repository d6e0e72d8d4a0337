//! Transactional outbox: table, writer, and polling relay.
//!
//! Every service database carries the same `outbox_events` table. Handlers
//! insert the fully serialized envelope on their transactional connection;
//! the relay publishes pending rows and marks them `SENT`. Rows are never
//! deleted here.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::events::EventType;

pub type DbPool = Pool<AsyncPgConnection>;

pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_SENT: &str = "SENT";

const BATCH_SIZE: i64 = 100;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

diesel::table! {
    outbox_events (id) {
        id -> Int8,
        aggregate_type -> Varchar,
        aggregate_id -> Int8,
        event_type -> Varchar,
        payload -> Jsonb,
        status -> Varchar,
        created_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
    }
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = outbox_events)]
pub struct OutboxEvent {
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = outbox_events)]
struct NewOutboxEvent {
    aggregate_type: String,
    aggregate_id: i64,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
}

/// Inserts an outbox row on the caller's connection. Call this inside the
/// same transaction as the aggregate mutation the event describes.
pub async fn enqueue<T: Serialize>(
    conn: &mut AsyncPgConnection,
    aggregate_type: &str,
    aggregate_id: i64,
    event_type: EventType,
    event: &T,
) -> Result<()> {
    let payload = serde_json::to_value(event).context("failed to serialize event payload")?;

    let row = NewOutboxEvent {
        aggregate_type: aggregate_type.to_string(),
        aggregate_id,
        event_type: event_type.topic().to_string(),
        payload,
        status: STATUS_PENDING.to_string(),
        created_at: Utc::now(),
    };

    diesel::insert_into(outbox_events::table)
        .values(&row)
        .execute(conn)
        .await
        .context("failed to insert outbox event")?;

    Ok(())
}

/// Partition key for a publish: the order id as a decimal string, so every
/// event of one order lands on one partition. Falls back to the aggregate
/// id for payloads without an `orderId` field.
pub fn partition_key(payload: &serde_json::Value, aggregate_id: i64) -> String {
    payload
        .get("orderId")
        .and_then(serde_json::Value::as_i64)
        .unwrap_or(aggregate_id)
        .to_string()
}

/// Polls `outbox_events` for `PENDING` rows and publishes them, oldest
/// first. A failed publish leaves the row pending for the next tick.
pub struct OutboxRelay {
    pool: DbPool,
    producer: FutureProducer,
    interval: Duration,
}

impl OutboxRelay {
    pub fn new(pool: DbPool, producer: FutureProducer) -> Self {
        Self {
            pool,
            producer,
            interval: Duration::from_secs(1),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.interval);
        info!(interval_ms = self.interval.as_millis() as u64, "outbox relay started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("outbox relay stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.drain().await {
                        error!(error = %e, "failed to process outbox events");
                    }
                }
            }
        }
    }

    async fn drain(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let pending = outbox_events::table
            .filter(outbox_events::status.eq(STATUS_PENDING))
            .order(outbox_events::created_at.asc())
            .limit(BATCH_SIZE)
            .load::<OutboxEvent>(&mut conn)
            .await?;

        if pending.is_empty() {
            return Ok(());
        }
        debug!(count = pending.len(), "publishing pending outbox events");

        for event in pending {
            if let Err(e) = self.publish(&event).await {
                error!(
                    outbox_id = event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "failed to publish outbox event"
                );
                continue;
            }

            diesel::update(outbox_events::table.filter(outbox_events::id.eq(event.id)))
                .set((
                    outbox_events::status.eq(STATUS_SENT),
                    outbox_events::sent_at.eq(Some(Utc::now())),
                ))
                .execute(&mut conn)
                .await?;
        }

        Ok(())
    }

    async fn publish(&self, event: &OutboxEvent) -> Result<()> {
        let key = partition_key(&event.payload, event.aggregate_id);
        let json = serde_json::to_string(&event.payload)?;

        let record = FutureRecord::to(&event.event_type).payload(&json).key(&key);

        self.producer
            .send(record, PUBLISH_TIMEOUT)
            .await
            .map_err(|(e, _)| anyhow!("failed to publish event: {e}"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partition_key_uses_order_id() {
        let payload = json!({"orderId": 42, "eventType": "stock.reserved.v1"});
        assert_eq!(partition_key(&payload, 7), "42");
    }

    #[test]
    fn partition_key_falls_back_to_aggregate_id() {
        let payload = json!({"eventType": "stock.restored.v1"});
        assert_eq!(partition_key(&payload, 7), "7");
    }
}
