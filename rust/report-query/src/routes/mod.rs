//! HTTP handlers. Every success body is `{success: true, data, metadata?}`.

pub mod graph;
pub mod query;
pub mod reports;

use crate::{catalog::DataSource, error::Result, state::AppState};
use axum::{extract::rejection::JsonRejection, routing::get, Json, Router};
use serde::Serialize;
use serde_json::json;

/// A JSON request body whose rejection is turned into a `ServiceError` with `?`.
type JsonBody<T> = std::result::Result<Json<T>, JsonRejection>;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T, M = ()> {
    pub success: bool,
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<M>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            metadata: None,
        })
    }
}

impl<T, M> ApiResponse<T, M> {
    pub fn with_metadata(data: T, metadata: M) -> Json<Self> {
        Json(Self {
            success: true,
            data,
            metadata: Some(metadata),
        })
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .nest("/api/query", query::router())
        .nest("/api/reports", reports::router())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Parses an optional `dataSource` query value.
fn parse_source(raw: Option<&str>) -> Result<Option<DataSource>> {
    raw.filter(|value| !value.trim().is_empty())
        .map(str::parse)
        .transpose()
}
