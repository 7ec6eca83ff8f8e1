//! Azure AD and Office 365 routes; definitions for other sources are invisible
//! here.

use super::{parse_source, ApiResponse, JsonBody};
use crate::{
    auth::AuthUser,
    definitions::QueryDefinition,
    error::{Result, ServiceError},
    history::{HistoryFilter, HistoryPage, HistoryQuery},
    service::{BatchItemResult, ExecuteRequest, ExecutionData, ExecutionMetadata, GRAPH_SOURCES},
    state::AppState,
};
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/execute", post(execute))
        .route("/batch", post(batch))
        .route("/definitions", get(definitions))
        .route("/history", get(history))
}

async fn execute(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    request: JsonBody<ExecuteRequest>,
) -> Result<Json<ApiResponse<ExecutionData, ExecutionMetadata>>> {
    let Json(request) = request?;
    let outcome = state
        .service
        .execute_scoped(Some(&caller), request, GRAPH_SOURCES)
        .await?;
    Ok(ApiResponse::with_metadata(outcome.data, outcome.metadata))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    queries: Vec<ExecuteRequest>,
}

#[derive(Debug, Serialize)]
struct BatchSummary {
    total: usize,
    succeeded: usize,
    failed: usize,
}

async fn batch(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    request: JsonBody<BatchRequest>,
) -> Result<Json<ApiResponse<Vec<BatchItemResult>, BatchSummary>>> {
    let Json(request) = request?;
    let results = state
        .service
        .execute_batch(Some(&caller), request.queries, GRAPH_SOURCES)
        .await?;
    let succeeded = results.iter().filter(|item| item.success).count();
    let summary = BatchSummary {
        total: results.len(),
        succeeded,
        failed: results.len() - succeeded,
    };
    Ok(ApiResponse::with_metadata(results, summary))
}

async fn definitions(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<ApiResponse<Vec<QueryDefinition>>>> {
    let definitions = state
        .service
        .list_definitions(Some(&caller), Some(GRAPH_SOURCES))
        .await?;
    Ok(ApiResponse::ok(definitions))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphHistoryQuery {
    #[serde(default)]
    query_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    data_source: Option<String>,
}

async fn history(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Query(params): Query<GraphHistoryQuery>,
) -> Result<Json<ApiResponse<HistoryPage>>> {
    let sources = match parse_source(params.data_source.as_deref())? {
        Some(source) if !GRAPH_SOURCES.contains(&source) => {
            return Err(ServiceError::validation(format!(
                "field 'dataSource' must be one of azure, o365; got '{source}'"
            )))
        }
        Some(source) => vec![source],
        None => GRAPH_SOURCES.to_vec(),
    };
    let owner = (!caller.is_admin()).then(|| caller.user_id.clone());
    let query = HistoryQuery {
        query_id: params.query_id,
        status: params.status,
        limit: params.limit,
        cursor: params.cursor,
    };
    let mut filter = HistoryFilter::from_query(&query, owner)?;
    filter.sources = Some(sources);
    let page = state.service.history().list(&filter).await?;
    Ok(ApiResponse::ok(page))
}
