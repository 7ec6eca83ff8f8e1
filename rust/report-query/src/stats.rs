use crate::catalog::DataSource;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryStats {
    pub query_id: String,
    pub data_source: DataSource,
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub total_execution_ms: u64,
    pub avg_execution_ms: f64,
    pub max_execution_ms: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueryStats {
    fn new(query_id: &str, data_source: DataSource) -> Self {
        Self {
            query_id: query_id.to_string(),
            data_source,
            executions: 0,
            successes: 0,
            failures: 0,
            cache_hits: 0,
            total_execution_ms: 0,
            avg_execution_ms: 0.0,
            max_execution_ms: 0,
            last_executed_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub queries: usize,
    pub total_executions: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub avg_execution_ms: f64,
    pub by_query: Vec<QueryStats>,
}

#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Success { cached: bool },
    Failure,
}

#[derive(Default)]
pub struct ExecutionStats {
    inner: RwLock<HashMap<String, QueryStats>>,
}

impl ExecutionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        query_id: &str,
        data_source: DataSource,
        outcome: Outcome,
        elapsed_ms: u64,
        error: Option<&str>,
    ) {
        let mut inner = self.inner.write();
        let stats = inner
            .entry(query_id.to_string())
            .or_insert_with(|| QueryStats::new(query_id, data_source));

        stats.executions += 1;
        match outcome {
            Outcome::Success { cached } => {
                stats.successes += 1;
                if cached {
                    stats.cache_hits += 1;
                }
            }
            Outcome::Failure => {
                stats.failures += 1;
                stats.last_error = error.map(str::to_string);
            }
        }
        stats.total_execution_ms += elapsed_ms;
        stats.max_execution_ms = stats.max_execution_ms.max(elapsed_ms);
        stats.avg_execution_ms = stats.total_execution_ms as f64 / stats.executions as f64;
        stats.last_executed_at = Some(Utc::now());
    }

    pub fn get(&self, query_id: &str) -> Option<QueryStats> {
        self.inner.read().get(query_id).cloned()
    }

    pub fn summary(&self) -> StatsSummary {
        let mut by_query: Vec<QueryStats> = self.inner.read().values().cloned().collect();
        by_query.sort_by(|a, b| b.executions.cmp(&a.executions).then(a.query_id.cmp(&b.query_id)));

        let total_executions: u64 = by_query.iter().map(|s| s.executions).sum();
        let total_ms: u64 = by_query.iter().map(|s| s.total_execution_ms).sum();
        StatsSummary {
            queries: by_query.len(),
            total_executions,
            failures: by_query.iter().map(|s| s.failures).sum(),
            cache_hits: by_query.iter().map(|s| s.cache_hits).sum(),
            avg_execution_ms: if total_executions == 0 {
                0.0
            } else {
                total_ms as f64 / total_executions as f64
            },
            by_query,
        }
    }
}
