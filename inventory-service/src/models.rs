use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use uuid::Uuid;

pub const RESERVATION_RESERVED: &str = "RESERVED";
pub const RESERVATION_CANCELED: &str = "CANCELED";

/// Anchor for a future reservation reaper; nothing expires reservations yet.
const RESERVATION_TTL_MINUTES: i64 = 30;

pub fn reservation_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::minutes(RESERVATION_TTL_MINUTES)
}

/// Durable idempotency token: one reservation attempt per causing event.
pub fn reservation_idempotency_key(order_id: i64, event_id: Uuid) -> String {
    format!("stock-reservation-{order_id}-{event_id}")
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::inventory)]
pub struct InventoryRow {
    pub id: i64,
    pub product_id: i64,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::stock_reservations)]
pub struct StockReservation {
    pub id: i64,
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub status: String,
    pub idempotency_key: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = crate::schema::stock_reservations)]
pub struct NewStockReservation {
    pub order_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub status: String,
    pub idempotency_key: String,
    pub expires_at: DateTime<Utc>,
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
            reservation_idempotency_key(7, event_id),
            format!("stock-reservation-7-{event_id}")
        );
    }

    #[test]
    fn reservations_expire_thirty_minutes_out() {
        let now = Utc::now();
        assert_eq!(reservation_expiry(now) - now, Duration::minutes(30));
    }
}
