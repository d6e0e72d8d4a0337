//! Event envelope and the typed events exchanged on the bus.
//!
//! The wire format is flat JSON: the envelope fields (`eventId`,
//! `eventType`, `schemaVersion`, `occurredAt`, `correlationId`) sit next to
//! the domain fields of each event. One event kind per topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const SCHEMA_VERSION: i32 = 1;

/// Every event kind, named by its bus topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "order.created.v1")]
    OrderCreated,
    #[serde(rename = "order.completed.v1")]
    OrderCompleted,
    #[serde(rename = "order.canceled.v1")]
    OrderCanceled,
    #[serde(rename = "order.failed.v1")]
    OrderFailed,
    #[serde(rename = "payment.completed.v1")]
    PaymentCompleted,
    #[serde(rename = "payment.failed.v1")]
    PaymentFailed,
    #[serde(rename = "payment.refunded.v1")]
    PaymentRefunded,
    #[serde(rename = "stock.reserved.v1")]
    StockReserved,
    #[serde(rename = "stock.reservation_failed.v1")]
    StockReservationFailed,
    #[serde(rename = "stock.restored.v1")]
    StockRestored,
    #[serde(rename = "delivery.started.v1")]
    DeliveryStarted,
    #[serde(rename = "delivery.failed.v1")]
    DeliveryFailed,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::OrderCreated,
        EventType::OrderCompleted,
        EventType::OrderCanceled,
        EventType::OrderFailed,
        EventType::PaymentCompleted,
        EventType::PaymentFailed,
        EventType::PaymentRefunded,
        EventType::StockReserved,
        EventType::StockReservationFailed,
        EventType::StockRestored,
        EventType::DeliveryStarted,
        EventType::DeliveryFailed,
    ];

    /// The bus topic this event kind is published to.
    pub fn topic(self) -> &'static str {
        match self {
            EventType::OrderCreated => "order.created.v1",
            EventType::OrderCompleted => "order.completed.v1",
            EventType::OrderCanceled => "order.canceled.v1",
            EventType::OrderFailed => "order.failed.v1",
            EventType::PaymentCompleted => "payment.completed.v1",
            EventType::PaymentFailed => "payment.failed.v1",
            EventType::PaymentRefunded => "payment.refunded.v1",
            EventType::StockReserved => "stock.reserved.v1",
            EventType::StockReservationFailed => "stock.reservation_failed.v1",
            EventType::StockRestored => "stock.restored.v1",
            EventType::DeliveryStarted => "delivery.started.v1",
            EventType::DeliveryFailed => "delivery.failed.v1",
        }
    }

    pub fn from_topic(topic: &str) -> Option<EventType> {
        EventType::ALL.iter().copied().find(|e| e.topic() == topic)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.topic())
    }
}

/// Envelope fields shared by every event. Flattened into the wire JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub schema_version: i32,
    pub occurred_at: DateTime<Utc>,
    /// The SAGA id. Minted once on order creation, copied verbatim into
    /// every downstream event.
    pub correlation_id: Uuid,
}

impl EventMeta {
    pub fn new(event_type: EventType, correlation_id: Uuid) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            schema_version: SCHEMA_VERSION,
            occurred_at: Utc::now(),
            correlation_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreatedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub quantity: i32,
    pub product_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCompletedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCanceledEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFailedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub reason: String,
}

/// Carries the order's product and quantity so the inventory service can
/// reserve the actual line item, not a fixed placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCompletedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub payment_id: i64,
    pub amount: i64,
    pub payment_type: String,
    pub product_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefundedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub payment_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub reservation_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservationFailedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub quantity: i32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockRestoredEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub reservation_id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStartedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub delivery_id: i64,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailedEvent {
    #[serde(flatten)]
    pub meta: EventMeta,
    pub order_id: i64,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_round_trip_covers_every_kind() {
        for kind in EventType::ALL {
            assert_eq!(EventType::from_topic(kind.topic()), Some(kind));
        }
        assert_eq!(EventType::from_topic("order.created.v2"), None);
    }

    #[test]
    fn envelope_is_flattened_camel_case() {
        let evt = PaymentCompletedEvent {
            meta: EventMeta::new(EventType::PaymentCompleted, Uuid::new_v4()),
            order_id: 42,
            payment_id: 7,
            amount: 50_000,
            payment_type: "CARD".to_string(),
            product_id: 1,
            quantity: 2,
        };

        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["eventType"], "payment.completed.v1");
        assert_eq!(json["schemaVersion"], 1);
        assert_eq!(json["orderId"], 42);
        assert_eq!(json["paymentId"], 7);
        assert_eq!(json["productId"], 1);
        assert!(json.get("meta").is_none());
        assert!(json.get("eventId").is_some());
        assert!(json.get("occurredAt").is_some());
        assert!(json.get("correlationId").is_some());
    }

    #[test]
    fn deserializes_raw_wire_json() {
        let raw = r#"{
            "eventId": "7f4df2c3-9a1b-4f7e-8f30-0a2a8d5d8e11",
            "eventType": "stock.reservation_failed.v1",
            "schemaVersion": 1,
            "occurredAt": "2025-06-01T12:00:00Z",
            "correlationId": "a52ab1f0-3a52-4a70-92ee-48a1d1e2b9c0",
            "orderId": 9,
            "quantity": 3,
            "reason": "insufficient_stock"
        }"#;

        let evt: StockReservationFailedEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(evt.meta.event_type, EventType::StockReservationFailed);
        assert_eq!(evt.order_id, 9);
        assert_eq!(evt.reason, "insufficient_stock");
    }

    #[test]
    fn correlation_id_is_propagated_verbatim() {
        let saga = Uuid::new_v4();
        let first = EventMeta::new(EventType::OrderCreated, saga);
        let second = EventMeta::new(EventType::PaymentCompleted, first.correlation_id);
        assert_eq!(second.correlation_id, saga);
        assert_ne!(first.event_id, second.event_id);
    }
}
