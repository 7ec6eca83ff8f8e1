//! Backend-neutral query specifications and their translation into SQL,
//! LDAP and Microsoft Graph requests.

mod graph;
mod ldap;
mod sql;

pub use graph::{GraphTranslator, GRAPH_MAX_PAGE_SIZE};
pub use ldap::LdapTranslator;
pub use sql::SqlTranslator;

pub(crate) use graph::quote as odata_quote;
pub(crate) use ldap::{dn_escape as ldap_dn_escape, escape as ldap_escape};

use crate::{
    catalog::{DataSource, Dialect, EntitySchema, FieldCatalog, FieldMetadata, FieldType},
    config::AppConfig,
    error::{Result, ServiceError},
    mapper::FieldMapping,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Generic query as produced by the visual report builder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub select: Vec<String>,
    #[serde(default, rename = "where", alias = "filters")]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderSpec>,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub field: String,
    #[serde(default)]
    pub direction: OrderDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    IsEmpty,
    IsNotEmpty,
}

impl FilterOperator {
    pub fn parse(raw: &str, field: &str) -> Result<Self> {
        let op = match raw.trim().to_ascii_lowercase().as_str() {
            "equals" | "eq" | "=" | "==" => FilterOperator::Equals,
            "not_equals" | "notequals" | "ne" | "!=" | "<>" => FilterOperator::NotEquals,
            "greater_than" | "greaterthan" | "gt" | ">" => FilterOperator::GreaterThan,
            "greater_or_equal" | "greaterthanorequal" | "gte" | "ge" | ">=" => {
                FilterOperator::GreaterOrEqual
            }
            "less_than" | "lessthan" | "lt" | "<" => FilterOperator::LessThan,
            "less_or_equal" | "lessthanorequal" | "lte" | "le" | "<=" => {
                FilterOperator::LessOrEqual
            }
            "contains" | "like" => FilterOperator::Contains,
            "starts_with" | "startswith" => FilterOperator::StartsWith,
            "ends_with" | "endswith" => FilterOperator::EndsWith,
            "in" => FilterOperator::In,
            "not_in" | "notin" => FilterOperator::NotIn,
            "is_empty" | "isempty" | "is_null" | "isnull" => FilterOperator::IsEmpty,
            "is_not_empty" | "isnotempty" | "is_not_null" | "isnotnull" => {
                FilterOperator::IsNotEmpty
            }
            _ => {
                return Err(ServiceError::validation(format!(
                    "unknown operator '{raw}' for field '{field}'"
                )))
            }
        };
        Ok(op)
    }

    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            FilterOperator::Contains | FilterOperator::StartsWith | FilterOperator::EndsWith
        )
    }

    pub fn is_list(&self) -> bool {
        matches!(self, FilterOperator::In | FilterOperator::NotIn)
    }

    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            FilterOperator::GreaterThan
                | FilterOperator::GreaterOrEqual
                | FilterOperator::LessThan
                | FilterOperator::LessOrEqual
        )
    }

    pub fn takes_value(&self) -> bool {
        !matches!(self, FilterOperator::IsEmpty | FilterOperator::IsNotEmpty)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedFilter {
    pub field: FieldMetadata,
    pub op: FilterOperator,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct ResolvedOrder {
    pub field: FieldMetadata,
    pub direction: OrderDirection,
}

/// A query spec whose entity, fields and operators have all been checked against
/// the catalog. Translators only ever see resolved queries.
#[derive(Debug, Clone)]
pub struct ResolvedQuery<'a> {
    pub source: DataSource,
    pub entity: &'a EntitySchema,
    pub select: Vec<FieldMetadata>,
    pub filters: Vec<ResolvedFilter>,
    pub group_by: Vec<FieldMetadata>,
    pub order_by: Vec<ResolvedOrder>,
    pub limit: i64,
}

impl ResolvedQuery<'_> {
    /// Mapping from backend names to logical names for the selected shape.
    pub fn mapping(&self) -> Vec<FieldMapping> {
        if self.group_by.is_empty() {
            self.select.iter().map(FieldMapping::from_field).collect()
        } else {
            let mut mapping: Vec<FieldMapping> =
                self.group_by.iter().map(FieldMapping::from_field).collect();
            mapping.push(FieldMapping::count());
            mapping
        }
    }

    /// Mapping covering every field client-side post-processing touches.
    pub fn fetch_mapping(&self) -> Vec<FieldMapping> {
        let mut mapping: Vec<FieldMapping> = Vec::new();
        let wanted = self
            .select
            .iter()
            .chain(self.group_by.iter())
            .chain(self.order_by.iter().map(|order| &order.field));
        for field in wanted {
            if !mapping.iter().any(|m| m.target == field.name) {
                mapping.push(FieldMapping::from_field(field));
            }
        }
        mapping
    }

    /// Result keys to narrow to when rows were fetched with extra sort-only
    /// fields. Grouped rows are already reduced to their keys and count.
    pub fn projection(&self) -> Vec<String> {
        if !self.group_by.is_empty() {
            return Vec::new();
        }
        let targets: Vec<String> = self.mapping().into_iter().map(|m| m.target).collect();
        if self.fetch_mapping().len() == targets.len() {
            Vec::new()
        } else {
            targets
        }
    }

    pub fn sort_keys(&self) -> Vec<(String, OrderDirection)> {
        self.order_by
            .iter()
            .map(|order| (order.field.name.clone(), order.direction))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub default_limit: i64,
    pub max_limit: i64,
    pub ldap_size_limit: i32,
}

impl From<&AppConfig> for QueryLimits {
    fn from(config: &AppConfig) -> Self {
        Self {
            default_limit: config.default_limit,
            max_limit: config.max_limit,
            ldap_size_limit: config.ldap_size_limit,
        }
    }
}

pub fn resolve<'a>(
    catalog: &'a FieldCatalog,
    source: DataSource,
    spec: &QuerySpec,
    limits: QueryLimits,
) -> Result<ResolvedQuery<'a>> {
    let entity = catalog.entity(source, spec.entity.as_deref())?;

    let select = if spec.select.is_empty() {
        entity
            .default_fields
            .iter()
            .map(|name| catalog.resolve(source, entity, name))
            .collect::<Result<Vec<_>>>()?
    } else {
        let mut seen = HashSet::new();
        spec.select
            .iter()
            .map(|name| catalog.resolve(source, entity, name))
            .filter(|field| match field {
                Ok(field) => seen.insert(field.name.clone()),
                Err(_) => true,
            })
            .collect::<Result<Vec<_>>>()?
    };

    let filters = spec
        .filters
        .iter()
        .map(|filter| {
            let field = catalog.resolve(source, entity, &filter.field)?;
            let op = FilterOperator::parse(&filter.operator, &filter.field)?;
            validate_filter_value(&field, op, &filter.value)?;
            Ok(ResolvedFilter {
                field,
                op,
                value: filter.value.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let group_by = spec
        .group_by
        .iter()
        .map(|name| catalog.resolve(source, entity, name))
        .collect::<Result<Vec<_>>>()?;

    let order_by = spec
        .order_by
        .iter()
        .map(|order| {
            let field = catalog.resolve(source, entity, &order.field)?;
            if !group_by.is_empty() && !group_by.iter().any(|g| g.name == field.name) {
                return Err(ServiceError::validation(format!(
                    "cannot order by '{}' when it is not part of groupBy",
                    order.field
                )));
            }
            Ok(ResolvedOrder {
                field,
                direction: order.direction,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let limit = match spec.limit {
        None => limits.default_limit.min(limits.max_limit),
        Some(limit) if (1..=limits.max_limit).contains(&limit) => limit,
        Some(limit) => {
            return Err(ServiceError::validation(format!(
                "limit {limit} must be between 1 and {}",
                limits.max_limit
            )))
        }
    };

    Ok(ResolvedQuery {
        source,
        entity,
        select,
        filters,
        group_by,
        order_by,
        limit,
    })
}

fn validate_filter_value(field: &FieldMetadata, op: FilterOperator, value: &Value) -> Result<()> {
    if !op.takes_value() {
        return Ok(());
    }

    if op.is_list() {
        let items = value.as_array().ok_or_else(|| {
            ServiceError::validation(format!(
                "operator '{op:?}' on field '{}' requires a list value",
                field.name
            ))
        })?;
        if items.is_empty() {
            return Err(ServiceError::validation(format!(
                "operator '{op:?}' on field '{}' requires at least one value",
                field.name
            )));
        }
        for item in items {
            scalar_text(field, item)?;
        }
        return Ok(());
    }

    if op.is_pattern() && field.field_type != FieldType::String {
        return Err(ServiceError::validation(format!(
            "operator '{op:?}' is only valid for text fields, '{}' is {:?}",
            field.name, field.field_type
        )));
    }

    if op.is_ordering() && matches!(field.field_type, FieldType::Boolean | FieldType::Array) {
        return Err(ServiceError::validation(format!(
            "operator '{op:?}' cannot compare {:?} field '{}'",
            field.field_type, field.name
        )));
    }

    match field.field_type {
        FieldType::Integer => integer_value(field, value).map(|_| ()),
        FieldType::Boolean => boolean_value(field, value).map(|_| ()),
        FieldType::Datetime => datetime_value(field, value).map(|_| ()),
        FieldType::String | FieldType::Array => scalar_text(field, value).map(|_| ()),
    }
}

/// Renders a scalar JSON value as text; objects, arrays and null are rejected.
pub(crate) fn scalar_text(field: &FieldMetadata, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(ServiceError::validation(format!(
            "field '{}' requires a scalar value",
            field.name
        ))),
    }
}

pub(crate) fn integer_value(field: &FieldMetadata, value: &Value) -> Result<i64> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ServiceError::validation(format!("field '{}' requires an integer value", field.name))
    })
}

pub(crate) fn boolean_value(field: &FieldMetadata, value: &Value) -> Result<bool> {
    let parsed = match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ServiceError::validation(format!("field '{}' requires a boolean value", field.name))
    })
}

pub(crate) fn datetime_value(field: &FieldMetadata, value: &Value) -> Result<DateTime<Utc>> {
    value
        .as_str()
        .and_then(crate::time::parse_datetime)
        .ok_or_else(|| {
            ServiceError::validation(format!(
                "field '{}' requires an ISO-8601 date value",
                field.name
            ))
        })
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum BindParam {
    Null,
    Text(String),
    TextArray(Vec<String>),
    IntArray(Vec<i64>),
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamptz(String),
}

impl BindParam {
    pub fn timestamptz(value: DateTime<Utc>) -> Self {
        Self::Timestamptz(value.to_rfc3339())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SqlQuery {
    pub sql: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub params: Vec<BindParam>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    Base,
    One,
    #[default]
    Sub,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LdapQuery {
    /// `None` means the credential's (or configured) base DN.
    pub base_dn: Option<String>,
    pub filter: String,
    pub attributes: Vec<String>,
    pub scope: SearchScope,
    pub size_limit: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQuery {
    pub path: String,
    pub params: Vec<(String, String)>,
    /// Advanced query capabilities need `ConsistencyLevel: eventual`.
    pub eventual_consistency: bool,
    /// Paging stops once this many rows have been collected.
    pub max_rows: usize,
}

impl GraphQuery {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "dialect", rename_all = "lowercase")]
pub enum BackendRequest {
    Sql(SqlQuery),
    Ldap(LdapQuery),
    Graph(GraphQuery),
}

/// Work done on mapped rows when the backend cannot do it natively.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostProcess {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<(String, OrderDirection)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Output keys to keep once sorting is done; empty keeps every mapped key.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub project: Vec<String>,
}

impl PostProcess {
    pub fn is_empty(&self) -> bool {
        self.sort.is_empty()
            && self.group_by.is_empty()
            && self.limit.is_none()
            && self.project.is_empty()
    }
}

/// Output of a translator: what to send, and how to shape what comes back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendQuery {
    pub request: BackendRequest,
    pub mapping: Vec<FieldMapping>,
    #[serde(skip_serializing_if = "PostProcess::is_empty")]
    pub post: PostProcess,
}

pub trait QueryTranslator {
    fn translate(&self, spec: &QuerySpec) -> Result<BackendQuery>;
}

/// Picks the translator for a data source and runs it.
pub fn translate(
    catalog: &FieldCatalog,
    source: DataSource,
    spec: &QuerySpec,
    limits: QueryLimits,
) -> Result<BackendQuery> {
    match source.dialect() {
        Dialect::Sql => SqlTranslator::new(catalog, limits).translate(spec),
        Dialect::Ldap => LdapTranslator::new(catalog, limits).translate(spec),
        Dialect::Graph => GraphTranslator::new(catalog, source, limits).translate(spec),
    }
}

/// Rewrites `?` markers into `$1..$n` positional placeholders.
pub(crate) fn rewrite_placeholders(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len() + 8);
    let mut index = 1;
    for ch in sql.chars() {
        if ch == '?' {
            result.push('$');
            result.push_str(&index.to_string());
            index += 1;
        } else {
            result.push(ch);
        }
    }
    result
}

#[cfg(test)]
pub(crate) fn max_dollar_placeholder(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }

        i += 1;
        let mut value = 0usize;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            value = value * 10 + (bytes[i] - b'0') as usize;
            i += 1;
        }
        max = max.max(value);
    }

    max
}
