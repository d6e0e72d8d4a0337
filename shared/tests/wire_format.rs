//! Wire-format checks for every event kind: flat envelope, camelCase
//! fields, topic-valued `eventType`.

use chrono::Utc;
use serde_json::Value;
use shared::events::*;
use uuid::Uuid;

fn meta(event_type: EventType, correlation_id: Uuid) -> EventMeta {
    EventMeta {
        event_id: Uuid::new_v4(),
        event_type,
        schema_version: SCHEMA_VERSION,
        occurred_at: Utc::now(),
        correlation_id,
    }
}

fn assert_envelope(json: &Value, topic: &str, correlation_id: Uuid) {
    assert_eq!(json["eventType"], topic);
    assert_eq!(json["schemaVersion"], 1);
    assert_eq!(json["correlationId"], correlation_id.to_string());
    assert!(json["eventId"].is_string());
    assert!(json["occurredAt"].is_string());
    // Flattened: no nested envelope object.
    assert!(json.get("meta").is_none());
}

#[test]
fn every_event_kind_serializes_with_a_flat_envelope() {
    let saga = Uuid::new_v4();

    let cases: Vec<(Value, &str)> = vec![
        (
            serde_json::to_value(OrderCreatedEvent {
                meta: meta(EventType::OrderCreated, saga),
                order_id: 1,
                user_id: 1001,
                amount: 50_000,
                quantity: 1,
                product_id: 1,
            })
            .unwrap(),
            "order.created.v1",
        ),
        (
            serde_json::to_value(OrderCompletedEvent {
                meta: meta(EventType::OrderCompleted, saga),
                order_id: 1,
            })
            .unwrap(),
            "order.completed.v1",
        ),
        (
            serde_json::to_value(OrderCanceledEvent {
                meta: meta(EventType::OrderCanceled, saga),
                order_id: 1,
                reason: "payment declined".into(),
            })
            .unwrap(),
            "order.canceled.v1",
        ),
        (
            serde_json::to_value(OrderFailedEvent {
                meta: meta(EventType::OrderFailed, saga),
                order_id: 1,
                reason: "insufficient_stock".into(),
            })
            .unwrap(),
            "order.failed.v1",
        ),
        (
            serde_json::to_value(PaymentCompletedEvent {
                meta: meta(EventType::PaymentCompleted, saga),
                order_id: 1,
                payment_id: 2,
                amount: 50_000,
                payment_type: "CARD".into(),
                product_id: 1,
                quantity: 1,
            })
            .unwrap(),
            "payment.completed.v1",
        ),
        (
            serde_json::to_value(PaymentFailedEvent {
                meta: meta(EventType::PaymentFailed, saga),
                order_id: 1,
                reason: "payment declined by gateway".into(),
            })
            .unwrap(),
            "payment.failed.v1",
        ),
        (
            serde_json::to_value(PaymentRefundedEvent {
                meta: meta(EventType::PaymentRefunded, saga),
                order_id: 1,
                payment_id: 2,
                amount: 50_000,
            })
            .unwrap(),
            "payment.refunded.v1",
        ),
        (
            serde_json::to_value(StockReservedEvent {
                meta: meta(EventType::StockReserved, saga),
                order_id: 1,
                reservation_id: 3,
                quantity: 1,
            })
            .unwrap(),
            "stock.reserved.v1",
        ),
        (
            serde_json::to_value(StockReservationFailedEvent {
                meta: meta(EventType::StockReservationFailed, saga),
                order_id: 1,
                quantity: 1,
                reason: "version_conflict".into(),
            })
            .unwrap(),
            "stock.reservation_failed.v1",
        ),
        (
            serde_json::to_value(StockRestoredEvent {
                meta: meta(EventType::StockRestored, saga),
                order_id: 1,
                reservation_id: 3,
                quantity: 1,
            })
            .unwrap(),
            "stock.restored.v1",
        ),
        (
            serde_json::to_value(DeliveryStartedEvent {
                meta: meta(EventType::DeliveryStarted, saga),
                order_id: 1,
                delivery_id: 4,
                address: "1 Main St".into(),
            })
            .unwrap(),
            "delivery.started.v1",
        ),
        (
            serde_json::to_value(DeliveryFailedEvent {
                meta: meta(EventType::DeliveryFailed, saga),
                order_id: 1,
                reason: "carrier unavailable".into(),
            })
            .unwrap(),
            "delivery.failed.v1",
        ),
    ];

    assert_eq!(cases.len(), EventType::ALL.len());
    for (json, topic) in &cases {
        assert_envelope(json, topic, saga);
        assert_eq!(json["orderId"], 1, "orderId missing for {topic}");
    }
}
