//! Diesel schema for the report-query tables.

diesel::table! {
    use diesel::sql_types::*;

    report_history (id) {
        id -> Uuid,
        query_id -> Text,
        query_name -> Nullable<Text>,
        user_id -> Nullable<Text>,
        data_source -> Text,
        parameters -> Jsonb,
        status -> Text,
        row_count -> Nullable<Int8>,
        execution_time_ms -> Nullable<Int8>,
        result -> Nullable<Jsonb>,
        export_path -> Nullable<Text>,
        error -> Nullable<Text>,
        cached -> Bool,
        started_at -> Timestamptz,
        completed_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    use diesel::sql_types::*;

    custom_report_templates (id) {
        id -> Uuid,
        name -> Text,
        description -> Nullable<Text>,
        owner_id -> Text,
        data_source -> Text,
        query -> Jsonb,
        is_public -> Bool,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::pg::sql_types::Array;
    use diesel::sql_types::*;

    service_credentials (id) {
        id -> Uuid,
        user_id -> Nullable<Text>,
        service_type -> Text,
        tenant_id -> Nullable<Text>,
        client_id -> Nullable<Text>,
        username -> Nullable<Text>,
        encrypted_secret -> Bytea,
        endpoint -> Nullable<Text>,
        base_dn -> Nullable<Text>,
        scopes -> Nullable<Array<Text>>,
        is_default -> Bool,
        is_active -> Bool,
        created_at -> Timestamptz,
    }
}
