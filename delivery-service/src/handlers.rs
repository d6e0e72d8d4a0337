//! Delivery creation on `StockReserved`. The unique idempotency key means a
//! replayed event can never produce a second delivery.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use shared::consumer::EventDispatch;
use shared::error::{ErrorCode, SagaError};
use shared::events::*;
use shared::idempotency::{event_key, IdempotencyStore, PROCESSED_TTL};
use shared::outbox;
use shared::{is_unique_violation, DbPool};
use tracing::{info, warn};

use crate::models::{
    delivery_idempotency_key, tracking_number, Delivery, NewDelivery, DEFAULT_ADDRESS,
    DEFAULT_CARRIER, STATUS_PREPARING,
};
use crate::schema::deliveries;

const SERVICE: &str = "delivery-service";

pub struct EventHandler {
    pool: DbPool,
    gate: Arc<dyn IdempotencyStore>,
}

#[async_trait]
impl EventDispatch for EventHandler {
    async fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<()> {
        match EventType::from_topic(topic) {
            Some(EventType::StockReserved) => {
                let evt: StockReservedEvent = parse(payload)?;
                let key = event_key(SERVICE, evt.meta.event_id);
                if self.already_processed(&key).await {
                    return Ok(());
                }
                self.handle_stock_reserved(evt).await?;
                self.record_processed(&key).await;
                Ok(())
            }
            _ => {
                warn!(topic, "unexpected topic, ignoring");
                Ok(())
            }
        }
    }
}

impl EventHandler {
    pub fn new(pool: DbPool, gate: Arc<dyn IdempotencyStore>) -> Self {
        Self { pool, gate }
    }

    async fn already_processed(&self, key: &str) -> bool {
        match self.gate.is_processed(key).await {
            Ok(processed) => {
                if processed {
                    info!(key, "event already processed");
                }
                processed
            }
            Err(e) => {
                warn!(error = %e, "idempotency gate unavailable");
                false
            }
        }
    }

    async fn record_processed(&self, key: &str) {
        if let Err(e) = self.gate.reserve(key, PROCESSED_TTL).await {
            warn!(error = %e, "failed to record processed event");
        }
    }

    async fn handle_stock_reserved(&self, evt: StockReservedEvent) -> Result<()> {
        info!(
            order_id = evt.order_id,
            correlation_id = %evt.meta.correlation_id,
            "handling stock reserved event, starting delivery"
        );

        let mut conn = self.pool.get().await?;
        let idempotency_key = delivery_idempotency_key(evt.order_id, evt.meta.event_id);

        let existing = deliveries::table
            .filter(deliveries::idempotency_key.eq(&idempotency_key))
            .first::<Delivery>(&mut conn)
            .await
            .optional()?;
        if let Some(delivery) = existing {
            info!(delivery_id = delivery.id, "delivery already started");
            return Ok(());
        }

        let now = Utc::now();
        let new_delivery = NewDelivery {
            order_id: evt.order_id,
            address: DEFAULT_ADDRESS.to_string(),
            status: STATUS_PREPARING.to_string(),
            idempotency_key,
            tracking_number: tracking_number(evt.order_id, now),
            carrier: DEFAULT_CARRIER.to_string(),
            created_at: now,
            updated_at: now,
        };

        let order_id = evt.order_id;
        let correlation_id = evt.meta.correlation_id;

        let result = conn
            .transaction::<Delivery, anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    let delivery: Delivery = diesel::insert_into(deliveries::table)
                        .values(&new_delivery)
                        .get_result(conn)
                        .await?;

                    let event = DeliveryStartedEvent {
                        meta: EventMeta::new(EventType::DeliveryStarted, correlation_id),
                        order_id,
                        delivery_id: delivery.id,
                        address: delivery.address.clone(),
                    };
                    outbox::enqueue(
                        conn,
                        "delivery",
                        delivery.id,
                        EventType::DeliveryStarted,
                        &event,
                    )
                    .await?;

                    Ok(delivery)
                })
            })
            .await;

        match result {
            Ok(delivery) => {
                info!(
                    delivery_id = delivery.id,
                    order_id = evt.order_id,
                    tracking_number = %delivery.tracking_number,
                    "delivery started"
                );
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => {
                info!(order_id = evt.order_id, "duplicate delivery suppressed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn parse<E: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<E> {
    serde_json::from_slice(payload).map_err(|e| {
        anyhow!(SagaError::wrap(
            ErrorCode::SerializationError,
            "failed to deserialize event",
            e
        ))
    })
}
