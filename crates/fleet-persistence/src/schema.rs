//! Esquema Diesel del key-value store. Reemplazable con `diesel print-schema`.

diesel::table! {
    kv_cells (subject, column_name, ts_micros) {
        subject -> Text,
        column_name -> Text,
        ts_micros -> BigInt,
        value -> Bytea,
    }
}

diesel::table! {
    kv_locks (subject) {
        subject -> Text,
        owner -> BigInt,
        expires_micros -> BigInt,
    }
}

diesel::allow_tables_to_appear_in_same_query!(kv_cells, kv_locks);
