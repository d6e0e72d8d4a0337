use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::Serialize;
use uuid::Uuid;

pub const STATUS_COMPLETED: &str = "COMPLETED";
pub const STATUS_REFUNDED: &str = "REFUNDED";

pub const PAYMENT_TYPE_CARD: &str = "CARD";

/// Durable idempotency token: one payment attempt per causing event.
pub fn payment_idempotency_key(order_id: i64, event_id: Uuid) -> String {
    format!("payment-{order_id}-{event_id}")
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize)]
#[diesel(table_name = crate::schema::payments)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub amount: i64,
    pub payment_type: String,
    pub status: String,
    pub idempotency_key: String,
    pub gateway_tx_id: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::payments)]
pub struct NewPayment {
    pub order_id: i64,
    pub amount: i64,
    pub payment_type: String,
    pub status: String,
    pub idempotency_key: String,
    pub gateway_tx_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_is_deterministic() {
        let event_id = Uuid::new_v4();
        assert_eq!(
            payment_idempotency_key(42, event_id),
            payment_idempotency_key(42, event_id)
        );
        assert_eq!(
            payment_idempotency_key(42, event_id),
            format!("payment-42-{event_id}")
        );
    }
}
