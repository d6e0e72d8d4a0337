diesel::table! {
    payments (id) {
        id -> Int8,
        order_id -> Int8,
        amount -> Int8,
        payment_type -> Varchar,
        status -> Varchar,
        idempotency_key -> Varchar,
        gateway_tx_id -> Nullable<Varchar>,
        reason -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
