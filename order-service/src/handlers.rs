//! Inbound event handling: every downstream event is folded into the order
//! through the transition table, guarded by the aggregate version.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::de::DeserializeOwned;
use shared::consumer::EventDispatch;
use shared::error::{ErrorCode, SagaError};
use shared::events::*;
use shared::idempotency::{event_key, IdempotencyStore, PROCESSED_TTL};
use shared::outbox;
use shared::DbPool;
use tracing::{info, warn};

use crate::models::Order;
use crate::schema::orders;
use crate::state::OrderStatus;

const SERVICE: &str = "order-service";

/// Attempts before giving the event back to the bus on version contention.
const MAX_TRANSITION_ATTEMPTS: u32 = 5;

pub struct EventHandler {
    pool: DbPool,
    gate: Arc<dyn IdempotencyStore>,
}

#[async_trait]
impl EventDispatch for EventHandler {
    async fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<()> {
        match EventType::from_topic(topic) {
            Some(EventType::PaymentCompleted) => {
                let evt: PaymentCompletedEvent = parse(payload)?;
                self.handle(evt.meta, evt.order_id, None).await
            }
            Some(EventType::PaymentFailed) => {
                let evt: PaymentFailedEvent = parse(payload)?;
                self.handle(evt.meta, evt.order_id, Some(evt.reason)).await
            }
            Some(EventType::StockReserved) => {
                let evt: StockReservedEvent = parse(payload)?;
                self.handle(evt.meta, evt.order_id, None).await
            }
            Some(EventType::StockReservationFailed) => {
                let evt: StockReservationFailedEvent = parse(payload)?;
                self.handle(evt.meta, evt.order_id, Some(evt.reason)).await
            }
            Some(EventType::DeliveryStarted) => {
                let evt: DeliveryStartedEvent = parse(payload)?;
                self.handle(evt.meta, evt.order_id, None).await
            }
            Some(EventType::DeliveryFailed) => {
                let evt: DeliveryFailedEvent = parse(payload)?;
                self.handle(evt.meta, evt.order_id, Some(evt.reason)).await
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

    async fn handle(&self, meta: EventMeta, order_id: i64, reason: Option<String>) -> Result<()> {
        info!(
            order_id,
            event_type = %meta.event_type,
            correlation_id = %meta.correlation_id,
            "handling event"
        );

        let key = event_key(SERVICE, meta.event_id);
        match self.gate.is_processed(&key).await {
            Ok(true) => {
                info!(event_id = %meta.event_id, "event already processed");
                return Ok(());
            }
            Ok(false) => {}
            // The gate is advisory; the transition no-ops on duplicates.
            Err(e) => warn!(error = %e, "idempotency gate unavailable"),
        }

        self.transition(order_id, &meta, reason.as_deref()).await?;

        if let Err(e) = self.gate.reserve(&key, PROCESSED_TTL).await {
            warn!(error = %e, "failed to record processed event");
        }
        Ok(())
    }

    /// Folds one event into the order. The version predicate makes the
    /// update conditional; a lost race re-reads and retries.
    async fn transition(&self, order_id: i64, meta: &EventMeta, reason: Option<&str>) -> Result<()> {
        let mut conn = self.pool.get().await?;

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let order = orders::table
                .find(order_id)
                .first::<Order>(&mut conn)
                .await
                .optional()?
                .ok_or_else(|| {
                    SagaError::new(
                        ErrorCode::OrderNotFound,
                        format!("order not found: {order_id}"),
                    )
                })?;

            let current = order.status().ok_or_else(|| {
                SagaError::new(
                    ErrorCode::SerializationError,
                    format!("unknown order status: {}", order.status),
                )
            })?;

            let Some(next) = current.transition_on(meta.event_type) else {
                // Duplicate or out-of-order delivery; acknowledge and move on.
                info!(
                    order_id,
                    status = %current,
                    event_type = %meta.event_type,
                    "event does not match current status, ignoring"
                );
                return Ok(());
            };

            let version = order.version;
            let correlation_id = meta.correlation_id;
            let reason = reason.unwrap_or_default().to_string();

            let advanced = conn
                .transaction::<bool, anyhow::Error, _>(|conn| {
                    Box::pin(async move {
                        let affected = diesel::update(
                            orders::table
                                .filter(orders::id.eq(order_id))
                                .filter(orders::version.eq(version)),
                        )
                        .set((
                            orders::status.eq(next.as_str()),
                            orders::version.eq(version + 1),
                            orders::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                        if affected == 0 {
                            return Ok(false);
                        }

                        publish_terminal(conn, order_id, next, correlation_id, &reason).await?;
                        Ok(true)
                    })
                })
                .await?;

            if advanced {
                info!(order_id, status = %next, "order status updated");
                return Ok(());
            }
        }

        // Contention exhausted; hand the event back for redelivery.
        Err(anyhow!(SagaError::new(
            ErrorCode::DatabaseError,
            format!("version conflict updating order {order_id}")
        )))
    }
}

/// Terminal transitions publish the order's own integration event in the
/// same transaction as the status update. Intermediate statuses have no
/// topic and publish nothing.
async fn publish_terminal(
    conn: &mut AsyncPgConnection,
    order_id: i64,
    status: OrderStatus,
    correlation_id: uuid::Uuid,
    reason: &str,
) -> Result<()> {
    match status {
        OrderStatus::Completed => {
            let event = OrderCompletedEvent {
                meta: EventMeta::new(EventType::OrderCompleted, correlation_id),
                order_id,
            };
            outbox::enqueue(conn, "order", order_id, EventType::OrderCompleted, &event).await
        }
        OrderStatus::Canceled => {
            let event = OrderCanceledEvent {
                meta: EventMeta::new(EventType::OrderCanceled, correlation_id),
                order_id,
                reason: reason.to_string(),
            };
            outbox::enqueue(conn, "order", order_id, EventType::OrderCanceled, &event).await
        }
        OrderStatus::Failed => {
            let event = OrderFailedEvent {
                meta: EventMeta::new(EventType::OrderFailed, correlation_id),
                order_id,
                reason: reason.to_string(),
            };
            outbox::enqueue(conn, "order", order_id, EventType::OrderFailed, &event).await
        }
        _ => Ok(()),
    }
}

fn parse<E: DeserializeOwned>(payload: &[u8]) -> Result<E> {
    serde_json::from_slice(payload).map_err(|e| {
        anyhow!(SagaError::wrap(
            ErrorCode::SerializationError,
            "failed to deserialize event",
            e
        ))
    })
}
