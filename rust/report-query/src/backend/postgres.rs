use super::SqlExecutor;
use crate::{
    db::{self, PgPool},
    query::{BindParam, SqlQuery},
};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::deserialize::QueryableByName;
use diesel::pg::Pg;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery as DieselSqlQuery};
use diesel::sql_query;
use diesel::sql_types::{Array, Bool, Float8, Int8, Jsonb, Nullable, Text, Timestamptz};
use diesel_async::{RunQueryDsl, SimpleAsyncConnection};
use serde_json::Value;

type BoxedQuery<'a> = BoxedSqlQuery<'a, Pg, DieselSqlQuery>;

pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Nullable<Jsonb>)]
    row: Option<Value>,
}

/// Wraps a statement so every row comes back as a single jsonb object.
fn wrap(sql: &str) -> String {
    format!("SELECT to_jsonb(report_row) AS row FROM ({sql}) AS report_row")
}

fn bind<'a>(query: BoxedQuery<'a>, param: &BindParam) -> anyhow::Result<BoxedQuery<'a>> {
    let query = match param {
        BindParam::Null => query.bind::<Nullable<Text>, _>(None::<String>),
        BindParam::Text(value) => query.bind::<Text, _>(value.clone()),
        BindParam::TextArray(values) => query.bind::<Array<Text>, _>(values.clone()),
        BindParam::IntArray(values) => query.bind::<Array<Int8>, _>(values.clone()),
        BindParam::Bool(value) => query.bind::<Bool, _>(*value),
        BindParam::Int(value) => query.bind::<Int8, _>(*value),
        BindParam::Float(value) => query.bind::<Float8, _>(*value),
        BindParam::Timestamptz(value) => {
            let ts = DateTime::parse_from_rfc3339(value)
                .with_context(|| format!("invalid timestamp bind value '{value}'"))?
                .with_timezone(&Utc);
            query.bind::<Timestamptz, _>(ts)
        }
    };
    Ok(query)
}

#[async_trait]
impl SqlExecutor for PgExecutor {
    async fn query(&self, query: &SqlQuery) -> anyhow::Result<Vec<Value>> {
        let mut conn = db::checkout(&self.pool).await?;

        let mut statement = sql_query(wrap(&query.sql)).into_boxed::<Pg>();
        for param in &query.params {
            statement = bind(statement, param)?;
        }

        let rows: Vec<JsonRow> = statement.load(&mut *conn).await?;
        Ok(rows.into_iter().filter_map(|row| row.row).collect())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = db::checkout(&self.pool).await?;
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_rows_as_jsonb() {
        assert_eq!(
            wrap("SELECT \"id\" FROM \"users\" LIMIT $1"),
            "SELECT to_jsonb(report_row) AS row FROM (SELECT \"id\" FROM \"users\" LIMIT $1) AS report_row"
        );
    }
}
