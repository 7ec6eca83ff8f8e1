//! Renders a definition body plus normalized parameters into a backend request.

use super::{params::ParamType, QueryBody, QueryDefinition};
use crate::{
    catalog::FieldCatalog,
    error::{Result, ServiceError},
    query::{
        self, BackendQuery, BackendRequest, BindParam, GraphQuery, LdapQuery, PostProcess,
        QueryLimits, SqlQuery,
    },
    time::{days_ago, to_filetime},
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

pub struct RenderContext<'a> {
    pub catalog: &'a FieldCatalog,
    pub limits: QueryLimits,
    pub now: DateTime<Utc>,
}

pub fn render(
    definition: &QueryDefinition,
    params: &Map<String, Value>,
    ctx: &RenderContext<'_>,
) -> Result<BackendQuery> {
    let max_rows = definition
        .max_results
        .map(|max| max.min(ctx.limits.max_limit))
        .unwrap_or(ctx.limits.max_limit);
    let max_rows = usize::try_from(max_rows).unwrap_or_default();

    let request = match &definition.body {
        QueryBody::Builder { spec } => {
            return query::translate(ctx.catalog, definition.data_source, spec, ctx.limits);
        }
        QueryBody::Sql { text } => BackendRequest::Sql(render_sql(definition, text, params)?),
        QueryBody::Ldap {
            filter,
            attributes,
            scope,
            base_dn,
            size_limit,
        } => {
            let filter = render_template(filter, |name, transform| {
                ldap_value(definition, params, name, transform, ctx.now)
            })?;
            let base_dn = base_dn
                .as_deref()
                .map(|dn| {
                    render_template(dn, |name, transform| {
                        dn_value(definition, params, name, transform)
                    })
                })
                .transpose()?;
            BackendRequest::Ldap(LdapQuery {
                base_dn,
                filter,
                attributes: attributes.clone(),
                scope: *scope,
                size_limit: size_limit.unwrap_or(ctx.limits.ldap_size_limit),
            })
        }
        QueryBody::Graph {
            endpoint,
            select,
            filter,
            order_by,
            top,
            expand,
            advanced,
        } => {
            let render = |template: &str| {
                render_template(template, |name, transform| {
                    graph_value(definition, params, name, transform, ctx.now)
                })
            };

            let path = render(endpoint)?;
            let mut odata = Vec::new();
            if !select.is_empty() {
                odata.push(("$select".to_string(), select.join(",")));
            }
            if let Some(filter) = filter {
                odata.push(("$filter".to_string(), render(filter)?));
            }
            if let Some(order_by) = order_by {
                odata.push(("$orderby".to_string(), order_by.clone()));
            }
            if let Some(expand) = expand {
                odata.push(("$expand".to_string(), expand.clone()));
            }
            if path.starts_with("reports/") {
                odata.push(("$format".to_string(), "application/json".to_string()));
            } else {
                let page = top
                    .map(i64::from)
                    .unwrap_or(query::GRAPH_MAX_PAGE_SIZE)
                    .min(query::GRAPH_MAX_PAGE_SIZE)
                    .min(max_rows as i64)
                    .max(1);
                odata.push(("$top".to_string(), page.to_string()));
            }
            if *advanced {
                odata.push(("$count".to_string(), "true".to_string()));
            }

            BackendRequest::Graph(GraphQuery {
                path,
                params: odata,
                eventual_consistency: *advanced,
                max_rows,
            })
        }
    };

    Ok(BackendQuery {
        request,
        mapping: definition.field_mapping.clone(),
        post: PostProcess {
            limit: Some(max_rows),
            ..Default::default()
        },
    })
}

/// Expands `{{name}}` and `{{name|transform}}` markers.
pub(crate) fn render_template<F>(template: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str, Option<&str>) -> Result<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            ServiceError::Config(format!("unterminated placeholder in template '{template}'"))
        })?;
        let marker = after[..end].trim();
        let (name, transform) = match marker.split_once('|') {
            Some((name, transform)) => (name.trim(), Some(transform.trim())),
            None => (marker, None),
        };
        out.push_str(&resolve(name, transform)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Names referenced by a template, in order of appearance.
pub(crate) fn template_names(template: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    render_template(template, |name, _| {
        names.push(name.to_string());
        Ok(String::new())
    })?;
    Ok(names)
}

fn param<'a>(
    definition: &QueryDefinition,
    params: &'a Map<String, Value>,
    name: &str,
) -> Result<(&'a Value, ParamType)> {
    let declared = definition
        .parameters
        .iter()
        .find(|def| def.name == name)
        .ok_or_else(|| {
            ServiceError::Config(format!(
                "definition {} references undeclared parameter '{name}'",
                definition.id
            ))
        })?;
    let value = params.get(name).ok_or_else(|| {
        ServiceError::validation(format!("missing required parameter '{name}'"))
    })?;
    Ok((value, declared.kind.clone()))
}

fn days_param(name: &str, value: &Value) -> Result<i64> {
    value.as_i64().ok_or_else(|| {
        ServiceError::validation(format!("parameter '{name}' must be an integer number of days"))
    })
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn ldap_value(
    definition: &QueryDefinition,
    params: &Map<String, Value>,
    name: &str,
    transform: Option<&str>,
    now: DateTime<Utc>,
) -> Result<String> {
    let (value, kind) = param(definition, params, name)?;
    match transform {
        None => match (&kind, value) {
            (ParamType::Boolean, Value::Bool(b)) => Ok(if *b { "TRUE" } else { "FALSE" }.to_string()),
            (ParamType::StringList, _) => Err(ServiceError::Config(format!(
                "list parameter '{name}' cannot be embedded in an LDAP filter"
            ))),
            _ => Ok(query::ldap_escape(&text(value))),
        },
        Some("filetime_days_ago") => to_filetime(days_ago(now, days_param(name, value)?))
            .map(|ticks| ticks.to_string())
            .ok_or_else(|| {
                ServiceError::validation(format!("parameter '{name}' is out of range"))
            }),
        Some("generalized_days_ago") => Ok(days_ago(now, days_param(name, value)?)
            .format("%Y%m%d%H%M%S.0Z")
            .to_string()),
        Some(other) => Err(ServiceError::Config(format!(
            "unknown LDAP template transform '{other}'"
        ))),
    }
}

/// Base DN placeholders take plain values only, escaped as DN attribute values.
fn dn_value(
    definition: &QueryDefinition,
    params: &Map<String, Value>,
    name: &str,
    transform: Option<&str>,
) -> Result<String> {
    let (value, kind) = param(definition, params, name)?;
    match (transform, kind) {
        (Some(other), _) => Err(ServiceError::Config(format!(
            "transform '{other}' is not allowed in a base DN"
        ))),
        (None, ParamType::StringList) => Err(ServiceError::Config(format!(
            "list parameter '{name}' cannot be embedded in a base DN"
        ))),
        (None, _) => Ok(query::ldap_dn_escape(&text(value))),
    }
}

fn graph_value(
    definition: &QueryDefinition,
    params: &Map<String, Value>,
    name: &str,
    transform: Option<&str>,
    now: DateTime<Utc>,
) -> Result<String> {
    let (value, kind) = param(definition, params, name)?;
    match transform {
        None => match kind {
            ParamType::Integer { .. } | ParamType::Boolean | ParamType::Date => Ok(text(value)),
            ParamType::StringList => {
                let items = value.as_array().cloned().unwrap_or_default();
                Ok(items
                    .iter()
                    .map(|item| query::odata_quote(&text(item)))
                    .collect::<Vec<_>>()
                    .join(","))
            }
            _ => Ok(query::odata_quote(&text(value))),
        },
        // Bare value for path segments such as report periods.
        Some("raw") => match kind {
            ParamType::Enum { .. } | ParamType::Integer { .. } => Ok(text(value)),
            _ => Err(ServiceError::Config(format!(
                "parameter '{name}' cannot be embedded unquoted"
            ))),
        },
        Some("iso_days_ago") => Ok(days_ago(now, days_param(name, value)?)
            .to_rfc3339_opts(SecondsFormat::Secs, true)),
        Some(other) => Err(ServiceError::Config(format!(
            "unknown Graph template transform '{other}'"
        ))),
    }
}

/// Rewrites `:name` placeholders into `$n`, binding values in order of
/// appearance.
fn render_sql(
    definition: &QueryDefinition,
    text: &str,
    params: &Map<String, Value>,
) -> Result<SqlQuery> {
    let mut binds = Vec::new();
    let sql = scan_sql(text, |name| {
        binds.push(sql_bind(definition, params, name)?);
        Ok(format!("${}", binds.len()))
    })?;
    Ok(SqlQuery { sql, params: binds })
}

pub(crate) fn sql_placeholder_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    let _ = scan_sql(text, |name| {
        names.push(name.to_string());
        Ok(String::new())
    });
    names
}

/// Walks SQL text calling `replace` for each `:name`; `::type` casts and
/// quoted literals are left alone.
fn scan_sql<F>(text: &str, mut replace: F) -> Result<String>
where
    F: FnMut(&str) -> Result<String>,
{
    let mut sql = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut in_literal = false;

    while i < chars.len() {
        let ch = chars[i];
        if ch == '\'' {
            in_literal = !in_literal;
            sql.push(ch);
            i += 1;
            continue;
        }

        let starts_name = chars
            .get(i + 1)
            .is_some_and(|next| next.is_ascii_alphabetic() || *next == '_');
        let is_cast = i > 0 && chars[i - 1] == ':';
        if in_literal || ch != ':' || !starts_name || is_cast {
            sql.push(ch);
            i += 1;
            continue;
        }

        let mut end = i + 1;
        while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
            end += 1;
        }
        let name: String = chars[i + 1..end].iter().collect();
        sql.push_str(&replace(&name)?);
        i = end;
    }

    Ok(sql)
}

fn sql_bind(
    definition: &QueryDefinition,
    params: &Map<String, Value>,
    name: &str,
) -> Result<BindParam> {
    let declared = definition
        .parameters
        .iter()
        .find(|def| def.name == name)
        .ok_or_else(|| {
            ServiceError::Config(format!(
                "definition {} references undeclared parameter '{name}'",
                definition.id
            ))
        })?;

    let Some(value) = params.get(name) else {
        return Ok(BindParam::Null);
    };

    let bind = match (&declared.kind, value) {
        (ParamType::Integer { .. }, Value::Number(n)) => BindParam::Int(n.as_i64().unwrap_or_default()),
        (ParamType::Boolean, Value::Bool(b)) => BindParam::Bool(*b),
        (ParamType::Date, Value::String(s)) => BindParam::Timestamptz(s.clone()),
        (ParamType::StringList, Value::Array(items)) => {
            BindParam::TextArray(items.iter().map(text).collect())
        }
        (_, value) => BindParam::Text(text(value)),
    };
    Ok(bind)
}
