//! Execution orchestrator.
//!
//! Every query runs through [`QueryService`]: definition and credential
//! resolution, parameter normalization, the result cache, the backend call
//! under a timeout, result mapping, history and statistics.

use crate::{
    auth::Principal,
    backend::Backends,
    cache::{cache_key, QueryCache},
    catalog::{DataSource, Dialect, EntitySchema, FieldCatalog, FieldFilter, FieldMetadata},
    config::AppConfig,
    credentials::{Credential, CredentialService},
    definitions::{
        normalize_parameters, render, DefinitionRegistry, QueryDefinition, RenderContext,
        CUSTOM_PREFIX,
    },
    error::{Result, ServiceError},
    history::{HistoryStore, NewExecution, StatusUpdate},
    mapper::{map_rows, post_process, Row},
    query::{self, BackendQuery, BackendRequest, QueryLimits, QuerySpec},
    reports::CustomReports,
    stats::{ExecutionStats, Outcome},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sources reachable through the `/api/query/graph` routes.
pub const GRAPH_SOURCES: &[DataSource] = &[DataSource::Azure, DataSource::O365];

/// Cache parameter slot carrying the credential a result was fetched with.
const CREDENTIAL_KEY_PARAM: &str = "$credential";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOptions {
    #[serde(default)]
    pub skip_cache: bool,
    /// Milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub credential_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub query_id: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub options: ExecuteOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub data_source: String,
    #[serde(alias = "spec")]
    pub query: QuerySpec,
    #[serde(default)]
    pub preview: bool,
    #[serde(default)]
    pub options: ExecuteOptions,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    #[serde(default)]
    pub query_id: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default, alias = "spec")]
    pub query: Option<QuerySpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestConnectionRequest {
    pub data_source: String,
    #[serde(default)]
    pub credential_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionData {
    pub rows: Vec<Row>,
    pub row_count: usize,
    /// Milliseconds.
    pub execution_time: u64,
    pub data_source: DataSource,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub query_id: String,
    pub query_name: String,
    pub data_source: DataSource,
    pub execution_id: Option<Uuid>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub data: ExecutionData,
    pub metadata: ExecutionMetadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub query_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ExecutionData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ExecutionMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<BackendQuery>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTest {
    pub data_source: DataSource,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaListing {
    pub data_source: DataSource,
    pub entities: Vec<EntitySchema>,
    pub categories: Vec<String>,
    pub fields: Vec<FieldMetadata>,
}

pub struct QueryServiceParts {
    pub config: Arc<AppConfig>,
    pub catalog: Arc<FieldCatalog>,
    pub definitions: Arc<DefinitionRegistry>,
    pub reports: Arc<CustomReports>,
    pub credentials: Arc<dyn CredentialService>,
    pub backends: Backends,
    pub history: Arc<dyn HistoryStore>,
    pub cache: Arc<QueryCache>,
    pub stats: Arc<ExecutionStats>,
}

pub struct QueryService {
    config: Arc<AppConfig>,
    catalog: Arc<FieldCatalog>,
    definitions: Arc<DefinitionRegistry>,
    reports: Arc<CustomReports>,
    credentials: Arc<dyn CredentialService>,
    backends: Backends,
    history: Arc<dyn HistoryStore>,
    cache: Arc<QueryCache>,
    stats: Arc<ExecutionStats>,
}

/// What a single execution runs, independent of where it came from.
struct Plan<'a> {
    query_id: &'a str,
    query_name: &'a str,
    source: DataSource,
    parameters: Map<String, Value>,
    cache_ttl: Option<Option<Duration>>,
    record_history: bool,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl QueryService {
    pub fn new(parts: QueryServiceParts) -> Self {
        Self {
            config: parts.config,
            catalog: parts.catalog,
            definitions: parts.definitions,
            reports: parts.reports,
            credentials: parts.credentials,
            backends: parts.backends,
            history: parts.history,
            cache: parts.cache,
            stats: parts.stats,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn reports(&self) -> &CustomReports {
        &self.reports
    }

    fn limits(&self) -> QueryLimits {
        QueryLimits::from(self.config.as_ref())
    }

    async fn definition(&self, caller: Option<&Principal>, query_id: &str) -> Result<Arc<QueryDefinition>> {
        if query_id.starts_with(CUSTOM_PREFIX) {
            let caller = caller.ok_or(ServiceError::Unauthenticated)?;
            return self.reports.definition(caller, query_id).await.map(Arc::new);
        }
        self.definitions
            .get(query_id)
            .ok_or_else(|| ServiceError::NotFound(format!("query '{query_id}'")))
    }

    async fn credential(
        &self,
        caller: Option<&Principal>,
        source: DataSource,
        credential_id: Option<&str>,
    ) -> Result<Option<Credential>> {
        if source == DataSource::Postgres {
            return Ok(None);
        }
        let user_id = caller.map(|p| p.user_id.as_str());
        self.credentials
            .get_credential(user_id, source, credential_id)
            .await
            .map(Some)
    }

    /// Definitions the caller may run, optionally narrowed to one source.
    /// Anonymous callers only see definitions that do not require auth.
    pub async fn list_definitions(
        &self,
        caller: Option<&Principal>,
        sources: Option<&[DataSource]>,
    ) -> Result<Vec<QueryDefinition>> {
        let in_scope = |source: DataSource| sources.map_or(true, |wanted| wanted.contains(&source));
        let mut definitions: Vec<QueryDefinition> = self
            .definitions
            .list(None)
            .into_iter()
            .filter(|def| in_scope(def.data_source))
            .filter(|def| caller.is_some() || !def.requires_auth)
            .map(|def| def.as_ref().clone())
            .collect();

        if let Some(caller) = caller {
            definitions.extend(
                self.reports
                    .list(caller)
                    .await?
                    .iter()
                    .filter(|report| in_scope(report.data_source))
                    .map(|report| self.reports.to_definition(report)),
            );
        }
        Ok(definitions)
    }

    pub async fn schema(
        &self,
        source: &str,
        filter: &FieldFilter,
        refresh: bool,
    ) -> Result<SchemaListing> {
        let source: DataSource = source.parse()?;
        let fields = self.catalog.fields(source, filter, refresh).await?;
        Ok(SchemaListing {
            data_source: source,
            entities: self.catalog.entities(source).to_vec(),
            categories: self.catalog.categories(source),
            fields,
        })
    }

    pub async fn execute_query(
        &self,
        caller: Option<&Principal>,
        request: ExecuteRequest,
    ) -> Result<ExecutionOutcome> {
        self.execute_scoped(caller, request, &DataSource::ALL).await
    }

    /// Runs a definition whose source must be one of `sources`; others are
    /// reported as not found.
    pub async fn execute_scoped(
        &self,
        caller: Option<&Principal>,
        request: ExecuteRequest,
        sources: &[DataSource],
    ) -> Result<ExecutionOutcome> {
        let definition = self.definition(caller, &request.query_id).await?;
        if !sources.contains(&definition.data_source) {
            return Err(ServiceError::NotFound(format!("query '{}'", request.query_id)));
        }
        if definition.requires_auth && caller.is_none() {
            return Err(ServiceError::Unauthenticated);
        }

        let parameters = normalize_parameters(&definition.parameters, &request.parameters)?;
        let credential = self
            .credential(caller, definition.data_source, request.options.credential_id.as_deref())
            .await?;

        let plan = Plan {
            query_id: &definition.id,
            query_name: &definition.name,
            source: definition.data_source,
            parameters,
            cache_ttl: definition
                .cache
                .enabled
                .then(|| definition.cache.ttl_seconds.map(Duration::from_secs)),
            record_history: true,
        };
        let limits = self.limits();
        self.run(caller, plan, credential.as_ref(), &request.options, |parameters| {
            render(
                &definition,
                parameters,
                &RenderContext {
                    catalog: &self.catalog,
                    limits,
                    now: Utc::now(),
                },
            )
        })
        .await
    }

    /// Runs each item on its own; one failure never fails the batch.
    pub async fn execute_batch(
        &self,
        caller: Option<&Principal>,
        requests: Vec<ExecuteRequest>,
        sources: &[DataSource],
    ) -> Result<Vec<BatchItemResult>> {
        if requests.is_empty() {
            return Err(ServiceError::validation("field 'queries' must not be empty"));
        }
        if requests.len() > self.config.max_batch_size {
            return Err(ServiceError::validation(format!(
                "field 'queries' exceeds the batch limit of {}",
                self.config.max_batch_size
            )));
        }

        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let query_id = request.query_id.clone();
            let item = match self.execute_scoped(caller, request, sources).await {
                Ok(outcome) => BatchItemResult {
                    query_id,
                    success: true,
                    data: Some(outcome.data),
                    metadata: Some(outcome.metadata),
                    error: None,
                    code: None,
                },
                Err(err) => {
                    debug!(query_id = %query_id, error = %err.detail(), "batch item failed");
                    BatchItemResult {
                        query_id,
                        success: false,
                        data: None,
                        metadata: None,
                        error: Some(err.to_string()),
                        code: Some(err.code()),
                    }
                }
            };
            results.push(item);
        }
        Ok(results)
    }

    /// Executes an ad-hoc builder query. Previews cap the row count and skip
    /// history.
    pub async fn build_query(
        &self,
        caller: Option<&Principal>,
        request: BuildRequest,
    ) -> Result<ExecutionOutcome> {
        let source: DataSource = request.data_source.parse()?;
        let mut spec = request.query;
        if request.preview {
            let cap = self.config.preview_limit;
            spec.limit = Some(spec.limit.map_or(cap, |limit| limit.clamp(1, cap)));
        }
        let credential = self
            .credential(caller, source, request.options.credential_id.as_deref())
            .await?;

        let query_id = format!("builder:{source}");
        let query_name = if request.preview { "Query preview" } else { "Query builder" };
        let plan = Plan {
            query_id: &query_id,
            query_name,
            source,
            parameters: Map::new(),
            cache_ttl: None,
            record_history: !request.preview,
        };
        let limits = self.limits();
        self.run(caller, plan, credential.as_ref(), &request.options, |_| {
            query::translate(&self.catalog, source, &spec, limits)
        })
        .await
    }

    /// Steps 5-10: cache, backend call under timeout, mapping, history,
    /// cache population and statistics.
    async fn run<F>(
        &self,
        caller: Option<&Principal>,
        plan: Plan<'_>,
        credential: Option<&Credential>,
        options: &ExecuteOptions,
        prepare: F,
    ) -> Result<ExecutionOutcome>
    where
        F: FnOnce(&Map<String, Value>) -> Result<BackendQuery>,
    {
        let started = Instant::now();
        let key = plan.cache_ttl.and_then(|_| {
            let mut keyed = plan.parameters.clone();
            if let Some(credential) = credential {
                keyed.insert(CREDENTIAL_KEY_PARAM.into(), Value::String(credential.id.clone()));
            }
            cache_key(plan.source, plan.query_id, &keyed)
                .map_err(|err| warn!(query_id = %plan.query_id, error = %err, "cache key derivation failed"))
                .ok()
        });

        let execution_id = if plan.record_history {
            self.start_history(caller, &plan).await
        } else {
            None
        };

        if let (Some(key), false) = (key.as_deref(), options.skip_cache) {
            if let Some(hit) = self.cache.get(key) {
                let elapsed = elapsed_ms(started);
                debug!(query_id = %plan.query_id, "served from cache");
                return Ok(self.finish(&plan, execution_id, hit.rows, elapsed, true).await);
            }
        }

        let result = self.fetch(&plan, credential, options, prepare).await;
        let elapsed = elapsed_ms(started);

        match result {
            Ok(rows) => {
                if let (Some(key), Some(ttl)) = (key.as_deref(), plan.cache_ttl) {
                    if let Err(err) = self.cache.set(
                        key.to_string(),
                        plan.query_id,
                        plan.source,
                        rows.clone(),
                        ttl,
                    ) {
                        warn!(query_id = %plan.query_id, error = %err, "failed to cache result");
                    }
                }
                info!(
                    query_id = %plan.query_id,
                    data_source = %plan.source,
                    rows = rows.len(),
                    elapsed_ms = elapsed,
                    "query executed"
                );
                Ok(self.finish(&plan, execution_id, rows, elapsed, false).await)
            }
            Err(err) => {
                let detail = err.detail();
                warn!(
                    query_id = %plan.query_id,
                    data_source = %plan.source,
                    elapsed_ms = elapsed,
                    error = %detail,
                    "query failed"
                );
                if let Some(id) = execution_id {
                    self.update_history(id, StatusUpdate::failed(detail.clone(), elapsed))
                        .await;
                }
                self.stats
                    .record(plan.query_id, plan.source, Outcome::Failure, elapsed, Some(&detail));
                Err(err)
            }
        }
    }

    async fn fetch<F>(
        &self,
        plan: &Plan<'_>,
        credential: Option<&Credential>,
        options: &ExecuteOptions,
        prepare: F,
    ) -> Result<Vec<Row>>
    where
        F: FnOnce(&Map<String, Value>) -> Result<BackendQuery>,
    {
        let backend_query = prepare(&plan.parameters)?;
        let timeout = self.config.effective_timeout(options.timeout);
        let raw = self
            .dispatch(plan.source, credential, &backend_query.request, timeout)
            .await?;
        let rows = map_rows(raw, &backend_query.mapping);
        Ok(post_process(rows, &backend_query.post))
    }

    async fn dispatch(
        &self,
        source: DataSource,
        credential: Option<&Credential>,
        request: &BackendRequest,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let call = async {
            match (request, credential) {
                (BackendRequest::Sql(sql), _) => self.backends.sql.query(sql).await,
                (BackendRequest::Ldap(ldap), Some(credential)) => {
                    self.backends.directory.search(credential, ldap).await
                }
                (BackendRequest::Graph(graph), Some(credential)) => {
                    self.backends.graph.get(credential, graph).await
                }
                (_, None) => Err(anyhow::anyhow!("no credential resolved for {source}")),
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(err)) => Err(ServiceError::backend(source, format!("{err:#}"))),
            Err(_) => Err(ServiceError::BackendTimeout {
                data_source: source.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn finish(
        &self,
        plan: &Plan<'_>,
        execution_id: Option<Uuid>,
        rows: Vec<Row>,
        elapsed: u64,
        cached: bool,
    ) -> ExecutionOutcome {
        if let Some(id) = execution_id {
            let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());
            self.update_history(id, StatusUpdate::completed(payload, rows.len(), elapsed, cached))
                .await;
        }
        self.stats.record(
            plan.query_id,
            plan.source,
            Outcome::Success { cached },
            elapsed,
            None,
        );

        ExecutionOutcome {
            data: ExecutionData {
                row_count: rows.len(),
                rows,
                execution_time: elapsed,
                data_source: plan.source,
                cached,
            },
            metadata: ExecutionMetadata {
                query_id: plan.query_id.to_string(),
                query_name: plan.query_name.to_string(),
                data_source: plan.source,
                execution_id,
                executed_at: Utc::now(),
            },
        }
    }

    /// History is best effort: a failing store never fails the query.
    async fn start_history(&self, caller: Option<&Principal>, plan: &Plan<'_>) -> Option<Uuid> {
        let record = NewExecution {
            query_id: plan.query_id.to_string(),
            query_name: Some(plan.query_name.to_string()),
            user_id: caller.map(|p| p.user_id.clone()),
            data_source: plan.source,
            parameters: Value::Object(plan.parameters.clone()),
        };
        let id = match self.history.create(record).await {
            Ok(record) => record.id,
            Err(err) => {
                warn!(query_id = %plan.query_id, error = %err.detail(), "failed to record execution");
                return None;
            }
        };
        self.update_history(id, StatusUpdate::running()).await;
        Some(id)
    }

    async fn update_history(&self, id: Uuid, update: StatusUpdate) {
        let status = update.status;
        if let Err(err) = self.history.update_status(id, update).await {
            warn!(execution_id = %id, status = %status, error = %err.detail(), "failed to update execution history");
        }
    }

    /// Checks a definition call or builder spec without executing it.
    pub async fn validate_query(
        &self,
        caller: Option<&Principal>,
        request: ValidateRequest,
    ) -> Result<ValidationReport> {
        let limits = self.limits();
        let outcome = match (&request.query_id, &request.query) {
            (Some(query_id), _) => {
                let definition = self.definition(caller, query_id).await?;
                normalize_parameters(&definition.parameters, &request.parameters).and_then(
                    |parameters| {
                        render(
                            &definition,
                            &parameters,
                            &RenderContext {
                                catalog: &self.catalog,
                                limits,
                                now: Utc::now(),
                            },
                        )
                    },
                )
            }
            (None, Some(spec)) => {
                let raw = request.data_source.as_deref().ok_or_else(|| {
                    ServiceError::validation("field 'dataSource' is required with 'query'")
                })?;
                let source: DataSource = raw.parse()?;
                let field_errors = self.field_errors(source, spec);
                if !field_errors.is_empty() {
                    return Ok(ValidationReport {
                        valid: false,
                        errors: field_errors,
                        query: None,
                    });
                }
                query::translate(&self.catalog, source, spec, limits)
            }
            (None, None) => {
                return Err(ServiceError::validation(
                    "either 'queryId' or 'dataSource' with 'query' is required",
                ))
            }
        };

        Ok(match outcome {
            Ok(query) => ValidationReport {
                valid: true,
                errors: Vec::new(),
                query: Some(query),
            },
            Err(err @ (ServiceError::Validation(_) | ServiceError::UnsupportedSource(_))) => {
                ValidationReport {
                    valid: false,
                    errors: vec![err.to_string()],
                    query: None,
                }
            }
            Err(err) => return Err(err),
        })
    }

    /// Collects every unknown field so the builder can flag them all at once.
    fn field_errors(&self, source: DataSource, spec: &QuerySpec) -> Vec<String> {
        let entity = match self.catalog.entity(source, spec.entity.as_deref()) {
            Ok(entity) => entity,
            Err(err) => return vec![err.to_string()],
        };
        spec.select
            .iter()
            .chain(spec.filters.iter().map(|filter| &filter.field))
            .chain(spec.group_by.iter())
            .chain(spec.order_by.iter().map(|order| &order.field))
            .filter_map(|field| self.catalog.resolve(source, entity, field).err())
            .map(|err| err.to_string())
            .fold(Vec::new(), |mut errors, message| {
                if !errors.contains(&message) {
                    errors.push(message);
                }
                errors
            })
    }

    /// Minimal round trip against a backend; failures are reported in the
    /// body rather than as errors.
    pub async fn test_connection(
        &self,
        caller: Option<&Principal>,
        request: TestConnectionRequest,
    ) -> Result<ConnectionTest> {
        let source: DataSource = request.data_source.parse()?;
        let credential = self
            .credential(caller, source, request.credential_id.as_deref())
            .await?;
        let started = Instant::now();

        let call = async {
            match (source.dialect(), credential.as_ref()) {
                (Dialect::Sql, _) => self.backends.sql.ping().await,
                (Dialect::Ldap, Some(credential)) => {
                    self.backends.directory.ping(credential).await
                }
                (Dialect::Graph, Some(credential)) => {
                    self.backends.graph.ping(credential).await
                }
                (_, None) => Err(anyhow::anyhow!("no credential resolved for {source}")),
            }
        };
        let result = match tokio::time::timeout(self.config.query_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("timed out")),
        };

        let latency_ms = elapsed_ms(started);
        let error = result.err().map(|err| {
            warn!(data_source = %source, error = %format!("{err:#}"), "connection test failed");
            format!("{source} connection failed")
        });
        Ok(ConnectionTest {
            data_source: source,
            success: error.is_none(),
            latency_ms,
            credential_id: credential.map(|c| c.id),
            error,
        })
    }

    /// Drops cached results for a query; every entry when `query_id` is `None`.
    pub fn invalidate(&self, query_id: Option<&str>) -> usize {
        match query_id {
            Some(query_id) => self.cache.invalidate_query(query_id),
            None => self.cache.clear(),
        }
    }
}
