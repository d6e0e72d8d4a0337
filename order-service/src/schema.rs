diesel::table! {
    orders (id) {
        id -> Int8,
        user_id -> Int8,
        amount -> Int8,
        quantity -> Int4,
        product_id -> Int8,
        status -> Varchar,
        version -> Int8,
        idempotency_key -> Nullable<Varchar>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}
