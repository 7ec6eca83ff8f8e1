use super::{ApiResponse, JsonBody};
use crate::{
    auth::AuthUser,
    definitions::CUSTOM_PREFIX,
    error::{Result, ServiceError},
    history::{get_visible, HistoryFilter, HistoryPage, HistoryQuery, ReportExecution},
    reports::{CustomReport, CustomReportInput, CustomReportPatch},
    service::{ExecuteOptions, ExecuteRequest, ExecutionData, ExecutionMetadata},
    state::AppState,
};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/custom", get(list_reports).post(create_report))
        .route(
            "/custom/:id",
            get(get_report).put(update_report).delete(delete_report),
        )
        .route("/custom/:id/execute", post(execute_report))
        .route("/history", get(list_history))
        .route("/history/:id", get(get_history))
}

async fn list_reports(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
) -> Result<Json<ApiResponse<Vec<CustomReport>>>> {
    let reports = state.service.reports().list(&caller).await?;
    Ok(ApiResponse::ok(reports))
}

async fn create_report(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    input: JsonBody<CustomReportInput>,
) -> Result<Json<ApiResponse<CustomReport>>> {
    let Json(input) = input?;
    let report = state.service.reports().create(&caller, input).await?;
    info!(report_id = %report.id, user_id = %caller.user_id, "created custom report");
    Ok(ApiResponse::ok(report))
}

async fn get_report(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<CustomReport>>> {
    let report = state.service.reports().get(&caller, &id).await?;
    Ok(ApiResponse::ok(report))
}

async fn update_report(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
    patch: JsonBody<CustomReportPatch>,
) -> Result<Json<ApiResponse<CustomReport>>> {
    let Json(patch) = patch?;
    let report = state.service.reports().update(&caller, &id, patch).await?;
    state.service.invalidate(Some(&report.definition_id()));
    Ok(ApiResponse::ok(report))
}

async fn delete_report(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<CustomReport>>> {
    let report = state.service.reports().delete(&caller, &id).await?;
    state.service.invalidate(Some(&report.definition_id()));
    info!(report_id = %report.id, user_id = %caller.user_id, "deactivated custom report");
    Ok(ApiResponse::ok(report))
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteBody {
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default)]
    options: ExecuteOptions,
}

async fn execute_report(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<ApiResponse<ExecutionData, ExecutionMetadata>>> {
    // The body is optional; an empty one runs with defaults.
    let body: ExecuteBody = if body.iter().all(u8::is_ascii_whitespace) {
        ExecuteBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ServiceError::validation(format!("invalid request body: {err}")))?
    };
    let query_id = if id.starts_with(CUSTOM_PREFIX) {
        id
    } else {
        format!("{CUSTOM_PREFIX}{id}")
    };
    let request = ExecuteRequest {
        query_id,
        parameters: body.parameters,
        options: body.options,
    };
    let outcome = state.service.execute_query(Some(&caller), request).await?;
    Ok(ApiResponse::with_metadata(outcome.data, outcome.metadata))
}

async fn list_history(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<HistoryPage>>> {
    let owner = (!caller.is_admin()).then(|| caller.user_id.clone());
    let filter = HistoryFilter::from_query(&params, owner)?;
    let page = state.service.history().list(&filter).await?;
    Ok(ApiResponse::ok(page))
}

async fn get_history(
    State(state): State<AppState>,
    AuthUser(caller): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ReportExecution>>> {
    let record = get_visible(
        state.service.history().as_ref(),
        &id,
        &caller.user_id,
        caller.is_admin(),
    )
    .await?;
    Ok(ApiResponse::ok(record))
}
