use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

pub const STATUS_PREPARING: &str = "PREPARING";

/// The order carries no shipping address yet; every delivery goes to the
/// warehouse-configured default.
pub const DEFAULT_ADDRESS: &str = "123 Main Street, Springfield";
pub const DEFAULT_CARRIER: &str = "ACME Logistics";

/// Durable idempotency token: one delivery per causing event.
pub fn delivery_idempotency_key(order_id: i64, event_id: Uuid) -> String {
    format!("delivery-{order_id}-{event_id}")
}

pub fn tracking_number(order_id: i64, now: DateTime<Utc>) -> String {
    format!("TRK-{order_id}-{}", now.timestamp())
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::deliveries)]
pub struct Delivery {
    pub id: i64,
    pub order_id: i64,
    pub address: String,
    pub status: String,
    pub idempotency_key: String,
    pub tracking_number: String,
    pub carrier: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::deliveries)]
pub struct NewDelivery {
    pub order_id: i64,
    pub address: String,
    pub status: String,
    pub idempotency_key: String,
    pub tracking_number: String,
    pub carrier: String,
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
            delivery_idempotency_key(9, event_id),
            format!("delivery-9-{event_id}")
        );
    }

    #[test]
    fn tracking_number_embeds_the_order() {
        let now = Utc::now();
        assert!(tracking_number(9, now).starts_with("TRK-9-"));
    }
}
