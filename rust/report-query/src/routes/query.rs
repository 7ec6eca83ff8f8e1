use super::{parse_source, ApiResponse, JsonBody};
use crate::{
    auth::{AuthUser, OptionalAuthUser},
    cache::{CacheEntrySummary, CacheStats},
    catalog::FieldFilter,
    definitions::QueryDefinition,
    error::{Result, ServiceError},
    service::{
        BuildRequest, ConnectionTest, ExecuteRequest, ExecutionData, ExecutionMetadata,
        SchemaListing, TestConnectionRequest, ValidateRequest, ValidationReport,
    },
    state::AppState,
    stats::{QueryStats, StatsSummary},
};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::info;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/execute", post(execute))
        .route("/build", post(build))
        .route("/definitions", get(definitions))
        .route("/schema/:data_source", get(schema))
        .route("/validate", post(validate))
        .route("/cache", get(cache_overview).delete(clear_cache))
        .route("/cache/:query_id", get(cache_entries).delete(invalidate_query))
        .route("/stats", get(stats_summary))
        .route("/stats/:query_id", get(query_stats))
        .route("/test-connection", post(test_connection))
        .nest("/graph", super::graph::router())
}

type Execution = Json<ApiResponse<ExecutionData, ExecutionMetadata>>;

async fn execute(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    request: JsonBody<ExecuteRequest>,
) -> Result<Execution> {
    let Json(request) = request?;
    let outcome = state.service.execute_query(Some(&caller), request).await?;
    Ok(ApiResponse::with_metadata(outcome.data, outcome.metadata))
}

async fn build(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    request: JsonBody<BuildRequest>,
) -> Result<Execution> {
    let Json(request) = request?;
    let outcome = state.service.build_query(Some(&caller), request).await?;
    Ok(ApiResponse::with_metadata(outcome.data, outcome.metadata))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefinitionsQuery {
    #[serde(default)]
    data_source: Option<String>,
    #[serde(default)]
    category: Option<String>,
}

async fn definitions(
    State(state): State<AppState>,
    OptionalAuthUser(caller): OptionalAuthUser,
    Query(params): Query<DefinitionsQuery>,
) -> Result<Json<ApiResponse<Vec<QueryDefinition>>>> {
    let source = parse_source(params.data_source.as_deref())?;
    let sources = source.map(|source| vec![source]);
    let mut definitions = state
        .service
        .list_definitions(caller.as_ref(), sources.as_deref())
        .await?;
    if let Some(category) = params.category.as_deref() {
        definitions.retain(|def| def.category.eq_ignore_ascii_case(category));
    }
    Ok(ApiResponse::ok(definitions))
}

#[derive(Debug, Default, Deserialize)]
struct SchemaQuery {
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    search: Option<String>,
    #[serde(default)]
    entity: Option<String>,
    #[serde(default)]
    refresh: bool,
}

async fn schema(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(data_source): Path<String>,
    Query(params): Query<SchemaQuery>,
) -> Result<Json<ApiResponse<SchemaListing>>> {
    let filter = FieldFilter {
        category: params.category,
        search: params.search,
        entity: params.entity,
    };
    let listing = state
        .service
        .schema(&data_source, &filter, params.refresh)
        .await?;
    Ok(ApiResponse::ok(listing))
}

async fn validate(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    request: JsonBody<ValidateRequest>,
) -> Result<Json<ApiResponse<ValidationReport>>> {
    let Json(request) = request?;
    let report = state.service.validate_query(Some(&caller), request).await?;
    Ok(ApiResponse::ok(report))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheOverview {
    default_ttl_seconds: u64,
    stats: CacheStats,
    entries: Vec<CacheEntrySummary>,
}

async fn cache_overview(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
) -> Json<ApiResponse<CacheOverview>> {
    let cache = state.service.cache();
    cache.purge_expired();
    ApiResponse::ok(CacheOverview {
        default_ttl_seconds: cache.default_ttl().as_secs(),
        stats: cache.stats(),
        entries: cache.entries(None),
    })
}

async fn cache_entries(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(query_id): Path<String>,
) -> Json<ApiResponse<Vec<CacheEntrySummary>>> {
    ApiResponse::ok(state.service.cache().entries(Some(&query_id)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Invalidated {
    invalidated: usize,
}

async fn clear_cache(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Json<ApiResponse<Invalidated>> {
    let invalidated = state.service.invalidate(None);
    info!(user_id = %caller.user_id, invalidated, "cleared query cache");
    ApiResponse::ok(Invalidated { invalidated })
}

async fn invalidate_query(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(query_id): Path<String>,
) -> Json<ApiResponse<Invalidated>> {
    let invalidated = state.service.invalidate(Some(&query_id));
    info!(user_id = %caller.user_id, query_id = %query_id, invalidated, "invalidated cached results");
    ApiResponse::ok(Invalidated { invalidated })
}

async fn stats_summary(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
) -> Json<ApiResponse<StatsSummary>> {
    ApiResponse::ok(state.service.stats().summary())
}

async fn query_stats(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(query_id): Path<String>,
) -> Result<Json<ApiResponse<QueryStats>>> {
    state
        .service
        .stats()
        .get(&query_id)
        .map(ApiResponse::ok)
        .ok_or_else(|| ServiceError::NotFound(format!("statistics for '{query_id}'")))
}

async fn test_connection(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    request: JsonBody<TestConnectionRequest>,
) -> Result<Json<ApiResponse<ConnectionTest>>> {
    let Json(request) = request?;
    let report = state.service.test_connection(Some(&caller), request).await?;
    Ok(ApiResponse::ok(report))
}
