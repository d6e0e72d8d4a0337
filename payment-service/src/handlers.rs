//! Payment on `OrderCreated`; refund compensation on
//! `StockReservationFailed`. The refund never rolls anything back — it is a
//! new forward state that semantically undoes the charge.

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

use crate::gateway::PaymentGateway;
use crate::models::{
    payment_idempotency_key, NewPayment, Payment, PAYMENT_TYPE_CARD, STATUS_COMPLETED,
    STATUS_REFUNDED,
};
use crate::schema::payments;

const SERVICE: &str = "payment-service";

pub struct EventHandler {
    pool: DbPool,
    gate: Arc<dyn IdempotencyStore>,
    gateway: PaymentGateway,
}

#[async_trait]
impl EventDispatch for EventHandler {
    async fn dispatch(&self, topic: &str, payload: &[u8]) -> Result<()> {
        match EventType::from_topic(topic) {
            Some(EventType::OrderCreated) => {
                let evt: OrderCreatedEvent = parse(payload)?;
                let key = event_key(SERVICE, evt.meta.event_id);
                if self.already_processed(&key).await {
                    return Ok(());
                }
                self.handle_order_created(evt).await?;
                self.record_processed(&key).await;
                Ok(())
            }
            Some(EventType::StockReservationFailed) => {
                let evt: StockReservationFailedEvent = parse(payload)?;
                let key = event_key(SERVICE, evt.meta.event_id);
                if self.already_processed(&key).await {
                    return Ok(());
                }
                self.handle_stock_reservation_failed(evt).await?;
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
    pub fn new(pool: DbPool, gate: Arc<dyn IdempotencyStore>, gateway: PaymentGateway) -> Self {
        Self {
            pool,
            gate,
            gateway,
        }
    }

    async fn already_processed(&self, key: &str) -> bool {
        match self.gate.is_processed(key).await {
            Ok(processed) => {
                if processed {
                    info!(key, "event already processed");
                }
                processed
            }
            // The gate is advisory; the unique idempotency key below still
            // suppresses a duplicate effect.
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

    async fn handle_order_created(&self, evt: OrderCreatedEvent) -> Result<()> {
        info!(
            order_id = evt.order_id,
            correlation_id = %evt.meta.correlation_id,
            "handling order created event"
        );

        let mut conn = self.pool.get().await?;
        let idempotency_key = payment_idempotency_key(evt.order_id, evt.meta.event_id);

        let existing = payments::table
            .filter(payments::idempotency_key.eq(&idempotency_key))
            .first::<Payment>(&mut conn)
            .await
            .optional()?;
        if let Some(payment) = existing {
            info!(payment_id = payment.id, "payment already processed");
            return Ok(());
        }

        match self.gateway.charge(evt.order_id, evt.amount).await {
            Ok(charge) => {
                let now = Utc::now();
                let new_payment = NewPayment {
                    order_id: evt.order_id,
                    amount: evt.amount,
                    payment_type: PAYMENT_TYPE_CARD.to_string(),
                    status: STATUS_COMPLETED.to_string(),
                    idempotency_key,
                    gateway_tx_id: Some(charge.tx_id),
                    created_at: now,
                    updated_at: now,
                };

                let correlation_id = evt.meta.correlation_id;
                let order_id = evt.order_id;
                let product_id = evt.product_id;
                let quantity = evt.quantity;

                let result = conn
                    .transaction::<i64, anyhow::Error, _>(|conn| {
                        Box::pin(async move {
                            let payment: Payment = diesel::insert_into(payments::table)
                                .values(&new_payment)
                                .get_result(conn)
                                .await?;

                            let event = PaymentCompletedEvent {
                                meta: EventMeta::new(EventType::PaymentCompleted, correlation_id),
                                order_id,
                                payment_id: payment.id,
                                amount: payment.amount,
                                payment_type: payment.payment_type.clone(),
                                product_id,
                                quantity,
                            };
                            outbox::enqueue(
                                conn,
                                "payment",
                                payment.id,
                                EventType::PaymentCompleted,
                                &event,
                            )
                            .await?;

                            Ok(payment.id)
                        })
                    })
                    .await;

                match result {
                    Ok(payment_id) => {
                        info!(payment_id, order_id = evt.order_id, "payment completed");
                        Ok(())
                    }
                    // A duplicate slipped past the gate and lost the insert
                    // race: already applied, nothing more to emit.
                    Err(e) if is_unique_violation(&e) => {
                        info!(order_id = evt.order_id, "duplicate payment suppressed");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(decline) if decline.is_business() => {
                warn!(
                    order_id = evt.order_id,
                    reason = %decline,
                    "payment declined"
                );
                self.publish_payment_failed(&evt, &decline.message).await
            }
            Err(e) => Err(anyhow!(e)),
        }
    }

    async fn handle_stock_reservation_failed(
        &self,
        evt: StockReservationFailedEvent,
    ) -> Result<()> {
        warn!(
            order_id = evt.order_id,
            reason = %evt.reason,
            "stock reservation failed, initiating refund"
        );

        let mut conn = self.pool.get().await?;

        let payment = payments::table
            .filter(payments::order_id.eq(evt.order_id))
            .order(payments::created_at.desc())
            .first::<Payment>(&mut conn)
            .await
            .optional()?;

        let Some(payment) = payment else {
            // Payment never landed (or already failed); nothing to undo.
            warn!(order_id = evt.order_id, "no payment to refund");
            return Ok(());
        };
        if payment.status == STATUS_REFUNDED {
            info!(payment_id = payment.id, "payment already refunded");
            return Ok(());
        }

        // The external call stays outside the transaction; the refund stub
        // is idempotent on the gateway side.
        self.gateway
            .refund(payment.gateway_tx_id.as_deref().unwrap_or_default())
            .await
            .map_err(|e| anyhow!(e))?;

        let payment_id = payment.id;
        let amount = payment.amount;
        let correlation_id = evt.meta.correlation_id;
        let order_id = evt.order_id;
        let reason = evt.reason.clone();

        conn.transaction::<(), anyhow::Error, _>(|conn| {
            Box::pin(async move {
                diesel::update(payments::table.filter(payments::id.eq(payment_id)))
                    .set((
                        payments::status.eq(STATUS_REFUNDED),
                        payments::reason.eq(Some(reason)),
                        payments::updated_at.eq(Utc::now()),
                    ))
                    .execute(conn)
                    .await?;

                let event = PaymentRefundedEvent {
                    meta: EventMeta::new(EventType::PaymentRefunded, correlation_id),
                    order_id,
                    payment_id,
                    amount,
                };
                outbox::enqueue(
                    conn,
                    "payment",
                    payment_id,
                    EventType::PaymentRefunded,
                    &event,
                )
                .await?;

                Ok(())
            })
        })
        .await?;

        info!(payment_id, order_id = evt.order_id, "payment refunded");
        Ok(())
    }

    async fn publish_payment_failed(&self, evt: &OrderCreatedEvent, reason: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let event = PaymentFailedEvent {
            meta: EventMeta::new(EventType::PaymentFailed, evt.meta.correlation_id),
            order_id: evt.order_id,
            reason: reason.to_string(),
        };
        outbox::enqueue(
            &mut conn,
            "payment",
            evt.order_id,
            EventType::PaymentFailed,
            &event,
        )
        .await?;

        Ok(())
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
