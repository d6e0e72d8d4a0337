diesel::table! {
    deliveries (id) {
        id -> Int8,
        order_id -> Int8,
        address -> Varchar,
        status -> Varchar,
        idempotency_key -> Varchar,
        tracking_number -> Varchar,
        carrier -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
