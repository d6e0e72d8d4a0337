diesel::table! {
    inventory (id) {
        id -> Int8,
        product_id -> Int8,
        available_quantity -> Int4,
        reserved_quantity -> Int4,
        version -> Int8,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    stock_reservations (id) {
        id -> Int8,
        order_id -> Int8,
        product_id -> Int8,
        quantity -> Int4,
        status -> Varchar,
        idempotency_key -> Varchar,
        expires_at -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(inventory, stock_reservations);
