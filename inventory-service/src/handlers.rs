//! Stock reservation under optimistic concurrency, and its compensation.
//!
//! The inventory row is the only aggregate shared across sagas. Contenders
//! take a row lock for the length of one short transaction and guard the
//! write with the version column; the loser surfaces
//! `StockReservationFailed` and lets the SAGA compensate.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::consumer::EventDispatch;
use shared::error::{ErrorCode, SagaError};
use shared::events::*;
use shared::idempotency::{event_key, IdempotencyStore, PROCESSED_TTL};
use shared::outbox;
use shared::DbPool;
use tracing::{info, warn};

use crate::models::{
    reservation_expiry, reservation_idempotency_key, InventoryRow, NewStockReservation,
    StockReservation, RESERVATION_CANCELED, RESERVATION_RESERVED,
};
use crate::schema::{inventory, stock_reservations};

const SERVICE: &str = "inventory-service";

pub const REASON_PRODUCT_NOT_FOUND: &str = "product_not_found";
pub const REASON_INSUFFICIENT_STOCK: &str = "insufficient_stock";
pub const REASON_VERSION_CONFLICT: &str = "version_conflict";

enum ReserveOutcome {
    Reserved(i64),
    AlreadyReserved,
    Failed(&'static str),
}

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
                let key = event_key(SERVICE, evt.meta.event_id);
                if self.already_processed(&key).await {
                    return Ok(());
                }
                self.handle_payment_completed(evt).await?;
                self.record_processed(&key).await;
                Ok(())
            }
            Some(EventType::PaymentRefunded) => {
                let evt: PaymentRefundedEvent = parse(payload)?;
                let key = event_key(SERVICE, evt.meta.event_id);
                if self.already_processed(&key).await {
                    return Ok(());
                }
                self.handle_payment_refunded(evt).await?;
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

    async fn handle_payment_completed(&self, evt: PaymentCompletedEvent) -> Result<()> {
        info!(
            order_id = evt.order_id,
            product_id = evt.product_id,
            quantity = evt.quantity,
            "handling payment completed event, reserving stock"
        );

        let mut conn = self.pool.get().await?;

        let idempotency_key = reservation_idempotency_key(evt.order_id, evt.meta.event_id);
        let order_id = evt.order_id;
        let product_id = evt.product_id;
        let quantity = evt.quantity;
        let correlation_id = evt.meta.correlation_id;

        let outcome = conn
            .transaction::<ReserveOutcome, anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    // Re-check the durable token under the row lock so a
                    // concurrent duplicate exits instead of losing the
                    // version race and emitting a spurious failure.
                    let existing = stock_reservations::table
                        .filter(stock_reservations::idempotency_key.eq(&idempotency_key))
                        .first::<StockReservation>(conn)
                        .await
                        .optional()?;
                    if existing.is_some() {
                        return Ok(ReserveOutcome::AlreadyReserved);
                    }

                    let row = inventory::table
                        .filter(inventory::product_id.eq(product_id))
                        .for_update()
                        .first::<InventoryRow>(conn)
                        .await
                        .optional()?;

                    let Some(row) = row else {
                        publish_reservation_failed(
                            conn,
                            order_id,
                            quantity,
                            correlation_id,
                            REASON_PRODUCT_NOT_FOUND,
                        )
                        .await?;
                        return Ok(ReserveOutcome::Failed(REASON_PRODUCT_NOT_FOUND));
                    };

                    if row.available_quantity < quantity {
                        publish_reservation_failed(
                            conn,
                            order_id,
                            quantity,
                            correlation_id,
                            REASON_INSUFFICIENT_STOCK,
                        )
                        .await?;
                        return Ok(ReserveOutcome::Failed(REASON_INSUFFICIENT_STOCK));
                    }

                    let affected = diesel::update(
                        inventory::table
                            .filter(inventory::product_id.eq(product_id))
                            .filter(inventory::version.eq(row.version)),
                    )
                    .set((
                        inventory::available_quantity
                            .eq(inventory::available_quantity - quantity),
                        inventory::reserved_quantity.eq(inventory::reserved_quantity + quantity),
                        inventory::version.eq(row.version + 1),
                        inventory::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                    if affected == 0 {
                        publish_reservation_failed(
                            conn,
                            order_id,
                            quantity,
                            correlation_id,
                            REASON_VERSION_CONFLICT,
                        )
                        .await?;
                        return Ok(ReserveOutcome::Failed(REASON_VERSION_CONFLICT));
                    }

                    let now = Utc::now();
                    let reservation: StockReservation =
                        diesel::insert_into(stock_reservations::table)
                            .values(&NewStockReservation {
                                order_id,
                                product_id,
                                quantity,
                                status: RESERVATION_RESERVED.to_string(),
                                idempotency_key,
                                expires_at: reservation_expiry(now),
                                created_at: now,
                                updated_at: now,
                            })
                            .get_result(conn)
                            .await?;

                    let event = StockReservedEvent {
                        meta: EventMeta::new(EventType::StockReserved, correlation_id),
                        order_id,
                        reservation_id: reservation.id,
                        quantity,
                    };
                    outbox::enqueue(
                        conn,
                        "stock_reservation",
                        reservation.id,
                        EventType::StockReserved,
                        &event,
                    )
                    .await?;

                    Ok(ReserveOutcome::Reserved(reservation.id))
                })
            })
            .await?;

        match outcome {
            ReserveOutcome::Reserved(reservation_id) => {
                info!(reservation_id, order_id = evt.order_id, "stock reserved");
            }
            ReserveOutcome::AlreadyReserved => {
                info!(order_id = evt.order_id, "stock already reserved");
            }
            ReserveOutcome::Failed(reason) => {
                warn!(order_id = evt.order_id, reason, "stock reservation failed");
            }
        }
        Ok(())
    }

    /// Compensation: put the reserved quantity back and cancel the
    /// reservation. `available + reserved` ends where it was before the
    /// reservation was taken.
    async fn handle_payment_refunded(&self, evt: PaymentRefundedEvent) -> Result<()> {
        warn!(
            order_id = evt.order_id,
            "handling payment refunded event, restoring stock"
        );

        let mut conn = self.pool.get().await?;
        let order_id = evt.order_id;
        let correlation_id = evt.meta.correlation_id;

        let restored = conn
            .transaction::<Option<i64>, anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    let reservation = stock_reservations::table
                        .filter(stock_reservations::order_id.eq(order_id))
                        .filter(stock_reservations::status.eq(RESERVATION_RESERVED))
                        .for_update()
                        .first::<StockReservation>(conn)
                        .await
                        .optional()?;

                    // Already restored, or the reservation never happened.
                    let Some(reservation) = reservation else {
                        return Ok(None);
                    };

                    let row = inventory::table
                        .filter(inventory::product_id.eq(reservation.product_id))
                        .for_update()
                        .first::<InventoryRow>(conn)
                        .await?;

                    diesel::update(inventory::table.filter(inventory::id.eq(row.id)))
                        .set((
                            inventory::available_quantity
                                .eq(inventory::available_quantity + reservation.quantity),
                            inventory::reserved_quantity
                                .eq(inventory::reserved_quantity - reservation.quantity),
                            inventory::version.eq(row.version + 1),
                            inventory::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                    diesel::update(
                        stock_reservations::table
                            .filter(stock_reservations::id.eq(reservation.id)),
                    )
                    .set((
                        stock_reservations::status.eq(RESERVATION_CANCELED),
                        stock_reservations::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                    let event = StockRestoredEvent {
                        meta: EventMeta::new(EventType::StockRestored, correlation_id),
                        order_id,
                        reservation_id: reservation.id,
                        quantity: reservation.quantity,
                    };
                    outbox::enqueue(
                        conn,
                        "stock_reservation",
                        reservation.id,
                        EventType::StockRestored,
                        &event,
                    )
                    .await?;

                    Ok(Some(reservation.id))
                })
            })
            .await?;

        match restored {
            Some(reservation_id) => {
                info!(reservation_id, order_id = evt.order_id, "stock restored");
            }
            None => {
                info!(order_id = evt.order_id, "no active reservation to restore");
            }
        }
        Ok(())
    }
}

async fn publish_reservation_failed(
    conn: &mut AsyncPgConnection,
    order_id: i64,
    quantity: i32,
    correlation_id: uuid::Uuid,
    reason: &str,
) -> Result<()> {
    let event = StockReservationFailedEvent {
        meta: EventMeta::new(EventType::StockReservationFailed, correlation_id),
        order_id,
        quantity,
        reason: reason.to_string(),
    };
    outbox::enqueue(
        conn,
        "order",
        order_id,
        EventType::StockReservationFailed,
        &event,
    )
    .await
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
