//! Diesel row types for the report-query tables.

use crate::schema::{custom_report_templates, report_history};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = report_history)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct HistoryRow {
    pub id: Uuid,
    pub query_id: String,
    pub query_name: Option<String>,
    pub user_id: Option<String>,
    pub data_source: String,
    pub parameters: Value,
    pub status: String,
    pub row_count: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub result: Option<Value>,
    pub export_path: Option<String>,
    pub error: Option<String>,
    pub cached: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = report_history)]
pub struct NewHistoryRow<'a> {
    pub id: Uuid,
    pub query_id: &'a str,
    pub query_name: Option<&'a str>,
    pub user_id: Option<&'a str>,
    pub data_source: &'a str,
    pub parameters: &'a Value,
    pub status: &'a str,
    pub cached: bool,
    pub started_at: DateTime<Utc>,
}

/// `None` fields are left untouched.
#[derive(Debug, Default, AsChangeset)]
#[diesel(table_name = report_history)]
pub struct HistoryChangeset<'a> {
    pub status: Option<&'a str>,
    pub row_count: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub result: Option<&'a Value>,
    pub error: Option<&'a str>,
    pub cached: Option<bool>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = custom_report_templates)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(treat_none_as_null = true)]
pub struct CustomReportRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: String,
    pub data_source: String,
    pub query: Value,
    pub is_public: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
