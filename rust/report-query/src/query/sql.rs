use super::{
    boolean_value, datetime_value, integer_value, resolve, rewrite_placeholders, scalar_text,
    BackendQuery, BackendRequest, BindParam, FilterOperator, OrderDirection, PostProcess,
    QueryLimits, QuerySpec, QueryTranslator, ResolvedFilter, ResolvedQuery, SqlQuery,
};
use crate::{
    catalog::{DataSource, FieldCatalog, FieldMetadata, FieldType},
    error::{Result, ServiceError},
};
use serde_json::Value;

pub struct SqlTranslator<'a> {
    catalog: &'a FieldCatalog,
    limits: QueryLimits,
}

impl<'a> SqlTranslator<'a> {
    pub fn new(catalog: &'a FieldCatalog, limits: QueryLimits) -> Self {
        Self { catalog, limits }
    }
}

impl QueryTranslator for SqlTranslator<'_> {
    fn translate(&self, spec: &QuerySpec) -> Result<BackendQuery> {
        let resolved = resolve(self.catalog, DataSource::Postgres, spec, self.limits)?;
        let sql = render(&resolved)?;
        Ok(BackendQuery {
            request: BackendRequest::Sql(sql),
            mapping: resolved.mapping(),
            post: PostProcess::default(),
        })
    }
}

fn render(query: &ResolvedQuery<'_>) -> Result<SqlQuery> {
    let mut params = Vec::new();
    let mut sql = String::from("SELECT ");

    if query.group_by.is_empty() {
        let columns: Vec<String> = query.select.iter().map(|f| ident(&f.backend_name)).collect();
        sql.push_str(&columns.join(", "));
    } else {
        let mut columns: Vec<String> =
            query.group_by.iter().map(|f| ident(&f.backend_name)).collect();
        columns.push("COUNT(*) AS count".to_string());
        sql.push_str(&columns.join(", "));
    }

    sql.push_str(" FROM ");
    sql.push_str(&ident(&query.entity.target));

    if !query.filters.is_empty() {
        let clauses = query
            .filters
            .iter()
            .map(|filter| render_filter(filter, &mut params))
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    if !query.group_by.is_empty() {
        let columns: Vec<String> = query.group_by.iter().map(|f| ident(&f.backend_name)).collect();
        sql.push_str(" GROUP BY ");
        sql.push_str(&columns.join(", "));
    }

    if !query.order_by.is_empty() {
        let orders: Vec<String> = query
            .order_by
            .iter()
            .map(|order| {
                let dir = match order.direction {
                    OrderDirection::Asc => "ASC",
                    OrderDirection::Desc => "DESC",
                };
                format!("{} {dir}", ident(&order.field.backend_name))
            })
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&orders.join(", "));
    }

    sql.push_str(" LIMIT ?");
    params.push(BindParam::Int(query.limit));

    Ok(SqlQuery {
        sql: rewrite_placeholders(&sql),
        params,
    })
}

fn render_filter(filter: &ResolvedFilter, params: &mut Vec<BindParam>) -> Result<String> {
    let field = &filter.field;
    let column = ident(&field.backend_name);
    // Text comparisons go through a cast so uuid and enum columns compare as strings.
    let text_column = format!("{column}::text");

    let clause = match filter.op {
        FilterOperator::IsEmpty => format!("({column} IS NULL OR {text_column} = '')"),
        FilterOperator::IsNotEmpty => format!("({column} IS NOT NULL AND {text_column} <> '')"),
        FilterOperator::Contains | FilterOperator::StartsWith | FilterOperator::EndsWith => {
            let raw = scalar_text(field, &filter.value)?;
            let escaped = escape_like(&raw);
            let pattern = match filter.op {
                FilterOperator::Contains => format!("%{escaped}%"),
                FilterOperator::StartsWith => format!("{escaped}%"),
                _ => format!("%{escaped}"),
            };
            params.push(BindParam::Text(pattern));
            format!("{text_column} ILIKE ?")
        }
        FilterOperator::In | FilterOperator::NotIn => {
            let (lhs, param) = list_param(field, &column, &text_column, &filter.value)?;
            params.push(param);
            if filter.op == FilterOperator::In {
                format!("{lhs} = ANY(?)")
            } else {
                format!("NOT ({lhs} = ANY(?))")
            }
        }
        op => {
            let symbol = match op {
                FilterOperator::Equals => "=",
                FilterOperator::NotEquals => "<>",
                FilterOperator::GreaterThan => ">",
                FilterOperator::GreaterOrEqual => ">=",
                FilterOperator::LessThan => "<",
                _ => "<=",
            };
            let (lhs, param) = scalar_param(field, &column, &text_column, &filter.value)?;
            params.push(param);
            format!("{lhs} {symbol} ?")
        }
    };

    Ok(clause)
}

fn scalar_param(
    field: &FieldMetadata,
    column: &str,
    text_column: &str,
    value: &Value,
) -> Result<(String, BindParam)> {
    let bound = match field.field_type {
        FieldType::Integer => (column.to_string(), BindParam::Int(integer_value(field, value)?)),
        FieldType::Boolean => (column.to_string(), BindParam::Bool(boolean_value(field, value)?)),
        FieldType::Datetime => (
            column.to_string(),
            BindParam::timestamptz(datetime_value(field, value)?),
        ),
        FieldType::String => (text_column.to_string(), BindParam::Text(scalar_text(field, value)?)),
        FieldType::Array => {
            return Err(ServiceError::validation(format!(
                "array field '{}' only supports in, not_in and emptiness checks",
                field.name
            )))
        }
    };
    Ok(bound)
}

fn list_param(
    field: &FieldMetadata,
    column: &str,
    text_column: &str,
    value: &Value,
) -> Result<(String, BindParam)> {
    let items = value.as_array().cloned().unwrap_or_default();
    match field.field_type {
        FieldType::Integer => {
            let values = items
                .iter()
                .map(|item| integer_value(field, item))
                .collect::<Result<Vec<_>>>()?;
            Ok((column.to_string(), BindParam::IntArray(values)))
        }
        FieldType::String | FieldType::Array => {
            let values = items
                .iter()
                .map(|item| scalar_text(field, item))
                .collect::<Result<Vec<_>>>()?;
            Ok((text_column.to_string(), BindParam::TextArray(values)))
        }
        FieldType::Boolean | FieldType::Datetime => Err(ServiceError::validation(format!(
            "list operators are not supported for {:?} field '{}'",
            field.field_type, field.name
        ))),
    }
}

/// Quotes an identifier; catalog names never carry quotes but they are doubled anyway.
fn ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::max_dollar_placeholder;
    use serde_json::json;

    fn translate(spec: serde_json::Value) -> Result<SqlQuery> {
        let catalog = FieldCatalog::new(None);
        let limits = QueryLimits {
            default_limit: 100,
            max_limit: 1000,
            ldap_size_limit: 1000,
        };
        let spec: QuerySpec = serde_json::from_value(spec).unwrap();
        match SqlTranslator::new(&catalog, limits).translate(&spec)?.request {
            BackendRequest::Sql(sql) => Ok(sql),
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn renders_select_where_order_limit() {
        let sql = translate(json!({
            "entity": "reportHistory",
            "select": ["queryId", "status", "rowCount"],
            "where": [
                { "field": "status", "operator": "equals", "value": "failed" },
                { "field": "rowCount", "operator": "greater_than", "value": 10 }
            ],
            "orderBy": [{ "field": "startedAt", "direction": "desc" }],
            "limit": 25
        }))
        .unwrap();

        assert_eq!(
            sql.sql,
            "SELECT \"query_id\", \"status\", \"row_count\" FROM \"report_history\" \
             WHERE \"status\"::text = $1 AND \"row_count\" > $2 \
             ORDER BY \"started_at\" DESC LIMIT $3"
        );
        assert_eq!(max_dollar_placeholder(&sql.sql), sql.params.len());
        assert!(matches!(sql.params.last(), Some(BindParam::Int(25))));
    }

    #[test]
    fn hostile_values_stay_in_bind_parameters() {
        let sql = translate(json!({
            "entity": "users",
            "where": [{ "field": "username", "operator": "equals", "value": "x'; DROP TABLE users; --" }]
        }))
        .unwrap();
        assert!(!sql.sql.contains("DROP"));
        assert!(matches!(&sql.params[0], BindParam::Text(v) if v.contains("DROP TABLE")));
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        let sql = translate(json!({
            "entity": "users",
            "where": [{ "field": "email", "operator": "starts_with", "value": "a_b%" }]
        }))
        .unwrap();
        assert!(sql.sql.contains("\"email\"::text ILIKE $1"));
        assert!(matches!(&sql.params[0], BindParam::Text(v) if v == "a\\_b\\%%"));
    }

    #[test]
    fn group_by_counts_rows() {
        let sql = translate(json!({
            "entity": "reportHistory",
            "groupBy": ["status"],
            "orderBy": [{ "field": "status" }]
        }))
        .unwrap();
        assert_eq!(
            sql.sql,
            "SELECT \"status\", COUNT(*) AS count FROM \"report_history\" \
             GROUP BY \"status\" ORDER BY \"status\" ASC LIMIT $1"
        );
    }

    #[test]
    fn list_and_emptiness_operators() {
        let sql = translate(json!({
            "entity": "users",
            "where": [
                { "field": "role", "operator": "in", "value": ["admin", "viewer"] },
                { "field": "lastLogin", "operator": "is_empty" }
            ]
        }))
        .unwrap();
        assert!(sql.sql.contains("\"role\"::text = ANY($1)"));
        assert!(sql.sql.contains("(\"last_login\" IS NULL OR \"last_login\"::text = '')"));
        assert!(matches!(&sql.params[0], BindParam::TextArray(v) if v.len() == 2));
    }

    #[test]
    fn datetime_filters_bind_timestamps() {
        let sql = translate(json!({
            "entity": "users",
            "where": [{ "field": "createdAt", "operator": "greater_or_equal", "value": "2024-01-01" }]
        }))
        .unwrap();
        assert!(sql.sql.contains("\"created_at\" >= $1"));
        assert!(
            matches!(&sql.params[0], BindParam::Timestamptz(v) if v.starts_with("2024-01-01T00:00:00"))
        );

        let err = translate(json!({
            "entity": "users",
            "where": [{ "field": "createdAt", "operator": "greater_than", "value": "yesterday-ish" }]
        }))
        .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }
}
