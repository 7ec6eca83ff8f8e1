//! Execution history: one record per execution, moved through
//! `pending -> running -> completed | failed | cancelled`.

use crate::{
    catalog::DataSource,
    db::{self, PgConn, PgPool},
    error::{Result, ServiceError},
    models::{HistoryChangeset, HistoryRow, NewHistoryRow},
    pagination::{decode_cursor, encode_cursor, HistoryCursor},
    schema::report_history::dsl,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

pub const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled)
                | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ServiceError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(ServiceError::validation(format!(
                "unknown execution status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportExecution {
    pub id: Uuid,
    pub query_id: String,
    pub query_name: Option<String>,
    pub user_id: Option<String>,
    pub data_source: DataSource,
    pub parameters: Value,
    pub status: ExecutionStatus,
    pub row_count: Option<i64>,
    pub execution_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub export_path: Option<String>,
    pub error: Option<String>,
    pub cached: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<HistoryRow> for ReportExecution {
    type Error = ServiceError;

    fn try_from(row: HistoryRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            query_id: row.query_id,
            query_name: row.query_name,
            user_id: row.user_id,
            data_source: row.data_source.parse()?,
            parameters: row.parameters,
            status: row.status.parse()?,
            row_count: row.row_count,
            execution_time_ms: row.execution_time_ms,
            result: row.result,
            export_path: row.export_path,
            error: row.error,
            cached: row.cached,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewExecution {
    pub query_id: String,
    pub query_name: Option<String>,
    pub user_id: Option<String>,
    pub data_source: DataSource,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: ExecutionStatus,
    pub row_count: Option<i64>,
    pub execution_time_ms: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub cached: Option<bool>,
}

impl StatusUpdate {
    pub fn running() -> Self {
        Self {
            status: ExecutionStatus::Running,
            row_count: None,
            execution_time_ms: None,
            result: None,
            error: None,
            cached: None,
        }
    }

    pub fn completed(rows: Value, row_count: usize, elapsed_ms: u64, cached: bool) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            row_count: i64::try_from(row_count).ok(),
            execution_time_ms: i64::try_from(elapsed_ms).ok(),
            result: Some(rows),
            error: None,
            cached: Some(cached),
        }
    }

    pub fn failed(error: String, elapsed_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            row_count: None,
            execution_time_ms: i64::try_from(elapsed_ms).ok(),
            result: None,
            error: Some(error),
            cached: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default)]
    pub query_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Normalized listing filter. `user_id: None` lists every user (admins).
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub user_id: Option<String>,
    pub query_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub sources: Option<Vec<DataSource>>,
    pub limit: i64,
    pub cursor: Option<HistoryCursor>,
}

impl HistoryFilter {
    pub fn from_query(query: &HistoryQuery, user_id: Option<String>) -> Result<Self> {
        Ok(Self {
            user_id,
            query_id: query.query_id.clone(),
            status: query.status.as_deref().map(str::parse).transpose()?,
            sources: None,
            limit: query.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE),
            cursor: query.cursor.as_deref().map(decode_cursor).transpose()?,
        })
    }

    fn matches(&self, record: &ReportExecution) -> bool {
        self.user_id
            .as_deref()
            .map_or(true, |user| record.user_id.as_deref() == Some(user))
            && self
                .query_id
                .as_deref()
                .map_or(true, |id| record.query_id == id)
            && self.status.map_or(true, |status| record.status == status)
            && self
                .sources
                .as_ref()
                .map_or(true, |sources| sources.contains(&record.data_source))
            && self
                .cursor
                .map_or(true, |cursor| cursor.precedes(record.started_at, record.id))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub items: Vec<ReportExecution>,
    pub next_cursor: Option<String>,
}

impl HistoryPage {
    /// `items` holds up to `limit + 1` records; the extra one signals another page.
    fn from_overfetch(mut items: Vec<ReportExecution>, limit: i64) -> Self {
        let limit = usize::try_from(limit).unwrap_or_default();
        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|last| {
                encode_cursor(&HistoryCursor {
                    started_at: last.started_at,
                    id: last.id,
                })
            })
        } else {
            None
        };
        Self { items, next_cursor }
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn create(&self, execution: NewExecution) -> Result<ReportExecution>;

    /// Fails with `Validation` when the transition is not allowed.
    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<ReportExecution>;

    async fn get(&self, id: Uuid) -> Result<Option<ReportExecution>>;

    async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage>;

    /// Deletes records started before `cutoff`; returns how many went.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

fn check_transition(id: Uuid, current: ExecutionStatus, next: ExecutionStatus) -> Result<()> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(ServiceError::validation(format!(
            "execution {id} cannot move from {current} to {next}"
        )))
    }
}

#[derive(Default)]
pub struct MemoryHistoryStore {
    records: RwLock<Vec<ReportExecution>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn create(&self, execution: NewExecution) -> Result<ReportExecution> {
        let record = ReportExecution {
            id: Uuid::new_v4(),
            query_id: execution.query_id,
            query_name: execution.query_name,
            user_id: execution.user_id,
            data_source: execution.data_source,
            parameters: execution.parameters,
            status: ExecutionStatus::Pending,
            row_count: None,
            execution_time_ms: None,
            result: None,
            export_path: None,
            error: None,
            cached: false,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.records.write().push(record.clone());
        Ok(record)
    }

    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<ReportExecution> {
        let mut records = self.records.write();
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| ServiceError::NotFound(format!("execution {id}")))?;
        check_transition(id, record.status, update.status)?;

        record.status = update.status;
        if update.row_count.is_some() {
            record.row_count = update.row_count;
        }
        if update.execution_time_ms.is_some() {
            record.execution_time_ms = update.execution_time_ms;
        }
        if update.result.is_some() {
            record.result = update.result;
        }
        if update.error.is_some() {
            record.error = update.error;
        }
        if let Some(cached) = update.cached {
            record.cached = cached;
        }
        if update.status.is_terminal() {
            record.completed_at = Some(Utc::now());
        }
        Ok(record.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ReportExecution>> {
        Ok(self.records.read().iter().find(|record| record.id == id).cloned())
    }

    async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        let mut items: Vec<ReportExecution> = self
            .records
            .read()
            .iter()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        items.truncate(usize::try_from(filter.limit + 1).unwrap_or(1));
        Ok(HistoryPage::from_overfetch(items, filter.limit))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|record| record.started_at >= cutoff);
        Ok((before - records.len()) as u64)
    }
}

pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conn(&self) -> Result<PgConn<'_>> {
        Ok(db::checkout(&self.pool).await?)
    }
}

fn db_error(err: diesel::result::Error) -> ServiceError {
    ServiceError::Internal(anyhow::Error::new(err).context("report_history query failed"))
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn create(&self, execution: NewExecution) -> Result<ReportExecution> {
        let mut conn = self.conn().await?;
        let row = NewHistoryRow {
            id: Uuid::new_v4(),
            query_id: &execution.query_id,
            query_name: execution.query_name.as_deref(),
            user_id: execution.user_id.as_deref(),
            data_source: execution.data_source.as_str(),
            parameters: &execution.parameters,
            status: ExecutionStatus::Pending.as_str(),
            cached: false,
            started_at: Utc::now(),
        };
        let inserted: HistoryRow = diesel::insert_into(dsl::report_history)
            .values(&row)
            .returning(HistoryRow::as_returning())
            .get_result(&mut *conn)
            .await
            .map_err(db_error)?;
        inserted.try_into()
    }

    async fn update_status(&self, id: Uuid, update: StatusUpdate) -> Result<ReportExecution> {
        let mut conn = self.conn().await?;
        let current: String = dsl::report_history
            .find(id)
            .select(dsl::status)
            .first(&mut *conn)
            .await
            .optional()
            .map_err(db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("execution {id}")))?;
        let current: ExecutionStatus = current.parse()?;
        check_transition(id, current, update.status)?;

        let changes = HistoryChangeset {
            status: Some(update.status.as_str()),
            row_count: update.row_count,
            execution_time_ms: update.execution_time_ms,
            result: update.result.as_ref(),
            error: update.error.as_deref(),
            cached: update.cached,
            completed_at: update.status.is_terminal().then(Utc::now),
        };
        // Guarding on the old status keeps concurrent transitions from racing.
        let updated: Option<HistoryRow> = diesel::update(
            dsl::report_history
                .filter(dsl::id.eq(id))
                .filter(dsl::status.eq(current.as_str())),
        )
        .set(&changes)
        .returning(HistoryRow::as_returning())
        .get_result(&mut *conn)
        .await
        .optional()
        .map_err(db_error)?;

        updated
            .ok_or_else(|| {
                ServiceError::validation(format!("execution {id} changed status concurrently"))
            })?
            .try_into()
    }

    async fn get(&self, id: Uuid) -> Result<Option<ReportExecution>> {
        let mut conn = self.conn().await?;
        let row: Option<HistoryRow> = dsl::report_history
            .find(id)
            .select(HistoryRow::as_select())
            .first(&mut *conn)
            .await
            .optional()
            .map_err(db_error)?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list(&self, filter: &HistoryFilter) -> Result<HistoryPage> {
        let mut conn = self.conn().await?;
        let mut query = dsl::report_history
            .select(HistoryRow::as_select())
            .into_boxed();

        if let Some(user) = &filter.user_id {
            query = query.filter(dsl::user_id.eq(user.clone()));
        }
        if let Some(query_id) = &filter.query_id {
            query = query.filter(dsl::query_id.eq(query_id.clone()));
        }
        if let Some(status) = filter.status {
            query = query.filter(dsl::status.eq(status.as_str()));
        }
        if let Some(sources) = &filter.sources {
            let names: Vec<&'static str> = sources.iter().map(DataSource::as_str).collect();
            query = query.filter(dsl::data_source.eq_any(names));
        }
        if let Some(cursor) = filter.cursor {
            query = query.filter(
                dsl::started_at.lt(cursor.started_at).or(dsl::started_at
                    .eq(cursor.started_at)
                    .and(dsl::id.lt(cursor.id))),
            );
        }

        let rows: Vec<HistoryRow> = query
            .order((dsl::started_at.desc(), dsl::id.desc()))
            .limit(filter.limit + 1)
            .load(&mut *conn)
            .await
            .map_err(db_error)?;
        let items = rows
            .into_iter()
            .map(ReportExecution::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(HistoryPage::from_overfetch(items, filter.limit))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn().await?;
        let deleted = diesel::delete(dsl::report_history.filter(dsl::started_at.lt(cutoff)))
            .execute(&mut *conn)
            .await
            .map_err(db_error)?;
        Ok(deleted as u64)
    }
}

/// Periodically deletes history older than `retention_days`.
pub fn spawn_retention(
    store: Arc<dyn HistoryStore>,
    retention_days: i64,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            let cutoff = crate::time::days_ago(Utc::now(), retention_days);
            match store.purge_before(cutoff).await {
                Ok(0) => {}
                Ok(purged) => info!(purged, retention_days, "purged expired report history"),
                Err(err) => warn!(error = %err.detail(), "history retention sweep failed"),
            }
        }
    })
}

/// Loads a record and checks that `user_id` may see it.
pub async fn get_visible(
    store: &dyn HistoryStore,
    id: &str,
    user_id: &str,
    is_admin: bool,
) -> Result<ReportExecution> {
    let id = Uuid::parse_str(id)
        .map_err(|_| ServiceError::validation(format!("invalid execution id '{id}'")))?;
    let record = store
        .get(id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("execution {id}")))?;
    if !is_admin && record.user_id.as_deref() != Some(user_id) {
        return Err(ServiceError::NotFound(format!("execution {id}")));
    }
    Ok(record)
}
