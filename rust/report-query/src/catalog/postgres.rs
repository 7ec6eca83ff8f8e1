use super::{EntitySchema, FieldMetadata, FieldType};

pub(super) fn entities() -> Vec<EntitySchema> {
    vec![report_history(), users(), custom_reports()]
}

fn report_history() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "reportHistory",
        "Report History",
        "report_history",
        &["queryId", "status", "rowCount", "executionTimeMs", "startedAt"],
        vec![
            FieldMetadata::new("id", "Execution ID", String, "identity", "id"),
            FieldMetadata::new("queryId", "Query", String, "identity", "query_id"),
            FieldMetadata::new("userId", "User", String, "identity", "user_id"),
            FieldMetadata::new("dataSource", "Data Source", String, "execution", "data_source"),
            FieldMetadata::new("status", "Status", String, "execution", "status"),
            FieldMetadata::new("rowCount", "Row Count", Integer, "execution", "row_count"),
            FieldMetadata::new(
                "executionTimeMs",
                "Execution Time (ms)",
                Integer,
                "execution",
                "execution_time_ms",
            ),
            FieldMetadata::new("error", "Error", String, "execution", "error_message"),
            FieldMetadata::new("startedAt", "Started", Datetime, "activity", "started_at"),
            FieldMetadata::new("completedAt", "Completed", Datetime, "activity", "completed_at"),
        ],
    )
}

fn users() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "users",
        "Application Users",
        "users",
        &["username", "email", "role", "lastLogin"],
        vec![
            FieldMetadata::new("id", "User ID", String, "identity", "id"),
            FieldMetadata::new("username", "Username", String, "identity", "username"),
            FieldMetadata::new("email", "Email", String, "identity", "email"),
            FieldMetadata::new("displayName", "Display Name", String, "identity", "display_name"),
            FieldMetadata::new("role", "Role", String, "access", "role"),
            FieldMetadata::new("isActive", "Active", Boolean, "access", "is_active"),
            FieldMetadata::new("createdAt", "Created", Datetime, "activity", "created_at"),
            FieldMetadata::new("lastLogin", "Last Login", Datetime, "activity", "last_login"),
        ],
    )
}

fn custom_reports() -> EntitySchema {
    use FieldType::*;
    EntitySchema::new(
        "customReports",
        "Custom Reports",
        "custom_report_templates",
        &["name", "source", "ownerId", "updatedAt"],
        vec![
            FieldMetadata::new("id", "Report ID", String, "identity", "id"),
            FieldMetadata::new("name", "Name", String, "identity", "name"),
            FieldMetadata::new("source", "Data Source", String, "identity", "source"),
            FieldMetadata::new("ownerId", "Owner", String, "access", "owner_id"),
            FieldMetadata::new("isPublic", "Public", Boolean, "access", "is_public"),
            FieldMetadata::new("isActive", "Active", Boolean, "access", "is_active"),
            FieldMetadata::new("createdAt", "Created", Datetime, "activity", "created_at"),
            FieldMetadata::new("updatedAt", "Updated", Datetime, "activity", "updated_at"),
        ],
    )
}
