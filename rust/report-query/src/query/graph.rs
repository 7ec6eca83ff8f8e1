use super::{
    boolean_value, datetime_value, integer_value, resolve, scalar_text, BackendQuery,
    BackendRequest, FilterOperator, GraphQuery, OrderDirection, PostProcess, QueryLimits,
    QuerySpec, QueryTranslator, ResolvedFilter, ResolvedQuery,
};
use crate::{
    catalog::{DataSource, FieldCatalog, FieldMetadata, FieldType},
    error::{Result, ServiceError},
};
use chrono::SecondsFormat;
use serde_json::Value;
use uuid::Uuid;

/// Largest page Graph directory collections accept.
pub const GRAPH_MAX_PAGE_SIZE: i64 = 999;

pub struct GraphTranslator<'a> {
    catalog: &'a FieldCatalog,
    source: DataSource,
    limits: QueryLimits,
}

impl<'a> GraphTranslator<'a> {
    pub fn new(catalog: &'a FieldCatalog, source: DataSource, limits: QueryLimits) -> Self {
        Self {
            catalog,
            source,
            limits,
        }
    }
}

impl QueryTranslator for GraphTranslator<'_> {
    fn translate(&self, spec: &QuerySpec) -> Result<BackendQuery> {
        let resolved = resolve(self.catalog, self.source, spec, self.limits)?;
        let limit = usize::try_from(resolved.limit).unwrap_or_default();

        if is_report(&resolved) {
            return render_report(&resolved, limit);
        }

        // Grouped counts need every matching object; the limit caps groups.
        let grouped = !resolved.group_by.is_empty();
        let fetch_limit = if grouped {
            self.limits.max_limit.max(resolved.limit)
        } else {
            resolved.limit
        };
        let max_rows = usize::try_from(fetch_limit).unwrap_or_default();

        let mut rendered = Rendered::default();
        for filter in &resolved.filters {
            rendered.push(filter)?;
        }

        let mut params = vec![("$select".to_string(), select_list(&resolved))];
        if !rendered.filters.is_empty() {
            params.push(("$filter".to_string(), rendered.filters.join(" and ")));
        }
        if !rendered.search.is_empty() {
            params.push(("$search".to_string(), rendered.search.join(" AND ")));
        }

        // Graph cannot group; grouped queries are ordered client-side too.
        let server_side_order = !grouped && !resolved.order_by.is_empty();
        if server_side_order {
            let order = resolved
                .order_by
                .iter()
                .map(|order| {
                    let dir = match order.direction {
                        OrderDirection::Asc => "asc",
                        OrderDirection::Desc => "desc",
                    };
                    format!("{} {dir}", order.field.backend_name)
                })
                .collect::<Vec<_>>()
                .join(",");
            params.push(("$orderby".to_string(), order));
        }

        params.push((
            "$top".to_string(),
            fetch_limit.min(GRAPH_MAX_PAGE_SIZE).to_string(),
        ));

        let advanced = rendered.advanced || !rendered.search.is_empty() || server_side_order;
        if advanced {
            params.push(("$count".to_string(), "true".to_string()));
        }

        let post = if grouped {
            PostProcess {
                sort: resolved.sort_keys(),
                group_by: resolved.group_by.iter().map(|f| f.name.clone()).collect(),
                limit: Some(limit),
                project: Vec::new(),
            }
        } else {
            PostProcess {
                project: resolved.projection(),
                ..Default::default()
            }
        };

        Ok(BackendQuery {
            request: BackendRequest::Graph(GraphQuery {
                path: resolved.entity.target.clone(),
                params,
                eventual_consistency: advanced,
                max_rows,
            }),
            mapping: resolved.fetch_mapping(),
            post,
        })
    }
}

/// Usage reports are fixed shapes: no `$filter`, `$select` or `$orderby`.
fn is_report(query: &ResolvedQuery<'_>) -> bool {
    query.entity.target.starts_with("reports/")
}

fn render_report(query: &ResolvedQuery<'_>, max_rows: usize) -> Result<BackendQuery> {
    if !query.filters.is_empty() || !query.group_by.is_empty() {
        return Err(ServiceError::validation(format!(
            "{} is a usage report and only supports field selection and ordering",
            query.entity.name
        )));
    }

    Ok(BackendQuery {
        request: BackendRequest::Graph(GraphQuery {
            path: query.entity.target.clone(),
            params: vec![("$format".to_string(), "application/json".to_string())],
            eventual_consistency: false,
            max_rows,
        }),
        mapping: query.fetch_mapping(),
        post: PostProcess {
            sort: query.sort_keys(),
            group_by: Vec::new(),
            limit: Some(max_rows),
            project: query.projection(),
        },
    })
}

/// `$select` takes top-level properties; nested paths select their root.
fn select_list(query: &ResolvedQuery<'_>) -> String {
    let mut roots: Vec<&str> = Vec::new();
    let wanted = query
        .select
        .iter()
        .chain(query.group_by.iter())
        .chain(query.order_by.iter().map(|order| &order.field));
    for field in wanted {
        let root = field
            .backend_name
            .split('/')
            .next()
            .unwrap_or(field.backend_name.as_str());
        if !roots.contains(&root) {
            roots.push(root);
        }
    }
    roots.join(",")
}

#[derive(Default)]
struct Rendered {
    filters: Vec<String>,
    search: Vec<String>,
    advanced: bool,
}

impl Rendered {
    fn push(&mut self, filter: &ResolvedFilter) -> Result<()> {
        let field = &filter.field;
        let prop = field.backend_name.as_str();

        if field.field_type == FieldType::Array {
            return self.push_collection(filter);
        }

        if field.backend_name.contains('/') {
            // Nested properties such as signInActivity need advanced queries.
            self.advanced = true;
        }

        let clause = match filter.op {
            FilterOperator::Contains => {
                // Directory objects only support substring matching through $search.
                let value = scalar_text(field, &filter.value)?.replace('"', "\\\"");
                self.search.push(format!("\"{prop}:{value}\""));
                return Ok(());
            }
            FilterOperator::StartsWith => {
                format!("startswith({prop},{})", literal(field, &filter.value)?)
            }
            FilterOperator::EndsWith => {
                self.advanced = true;
                format!("endswith({prop},{})", literal(field, &filter.value)?)
            }
            FilterOperator::IsEmpty => {
                self.advanced = true;
                format!("{prop} eq null")
            }
            FilterOperator::IsNotEmpty => {
                self.advanced = true;
                format!("{prop} ne null")
            }
            FilterOperator::In | FilterOperator::NotIn => {
                let items = filter.value.as_array().cloned().unwrap_or_default();
                let alternatives = items
                    .iter()
                    .map(|item| Ok(format!("{prop} eq {}", literal(field, item)?)))
                    .collect::<Result<Vec<_>>>()?;
                let any = format!("({})", alternatives.join(" or "));
                if filter.op == FilterOperator::In {
                    any
                } else {
                    self.advanced = true;
                    format!("not {any}")
                }
            }
            FilterOperator::NotEquals => {
                self.advanced = true;
                format!("{prop} ne {}", literal(field, &filter.value)?)
            }
            op => {
                let symbol = match op {
                    FilterOperator::Equals => "eq",
                    FilterOperator::GreaterThan => "gt",
                    FilterOperator::GreaterOrEqual => "ge",
                    FilterOperator::LessThan => "lt",
                    _ => "le",
                };
                format!("{prop} {symbol} {}", literal(field, &filter.value)?)
            }
        };

        self.filters.push(clause);
        Ok(())
    }

    /// Collection properties filter through `any` lambdas.
    fn push_collection(&mut self, filter: &ResolvedFilter) -> Result<()> {
        let field = &filter.field;
        let prop = field.backend_name.as_str();
        let lambda = |value: &Value| -> Result<String> {
            let raw = scalar_text(field, value)?;
            if prop == "assignedLicenses" {
                // SKU ids are guids and compare unquoted.
                let sku = Uuid::parse_str(raw.trim()).map_err(|_| {
                    ServiceError::validation(format!(
                        "field '{}' requires a license SKU id (GUID)",
                        field.name
                    ))
                })?;
                Ok(format!("{prop}/any(x:x/skuId eq {sku})"))
            } else {
                Ok(format!("{prop}/any(x:x eq {})", quote(&raw)))
            }
        };

        let clause = match filter.op {
            FilterOperator::Equals => lambda(&filter.value)?,
            FilterOperator::NotEquals => {
                self.advanced = true;
                format!("not({})", lambda(&filter.value)?)
            }
            FilterOperator::In => {
                let items = filter.value.as_array().cloned().unwrap_or_default();
                let alternatives = items.iter().map(&lambda).collect::<Result<Vec<_>>>()?;
                format!("({})", alternatives.join(" or "))
            }
            FilterOperator::IsEmpty => {
                self.advanced = true;
                format!("{prop}/$count eq 0")
            }
            FilterOperator::IsNotEmpty => {
                self.advanced = true;
                format!("{prop}/$count ne 0")
            }
            op => {
                return Err(ServiceError::validation(format!(
                    "operator '{op:?}' is not supported for collection field '{}'",
                    field.name
                )))
            }
        };

        self.filters.push(clause);
        Ok(())
    }
}

/// Renders an OData literal for a field's type.
fn literal(field: &FieldMetadata, value: &Value) -> Result<String> {
    let rendered = match field.field_type {
        FieldType::Integer => integer_value(field, value)?.to_string(),
        FieldType::Boolean => boolean_value(field, value)?.to_string(),
        FieldType::Datetime => {
            datetime_value(field, value)?.to_rfc3339_opts(SecondsFormat::Secs, true)
        }
        FieldType::String | FieldType::Array => quote(&scalar_text(field, value)?),
    };
    Ok(rendered)
}

pub(crate) fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
