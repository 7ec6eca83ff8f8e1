use super::{
    boolean_value, datetime_value, integer_value, resolve, scalar_text, BackendQuery,
    BackendRequest, FilterOperator, LdapQuery, PostProcess, QueryLimits, QuerySpec,
    QueryTranslator, ResolvedFilter, ResolvedQuery, SearchScope,
};
use crate::{
    catalog::{DataSource, FieldCatalog, FieldMetadata, FieldType},
    error::{Result, ServiceError},
    time::to_filetime,
};
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Directory attributes stored as GeneralizedTime; every other datetime
/// attribute in the catalog is a FILETIME large integer.
const GENERALIZED_TIME_ATTRIBUTES: &[&str] = &[
    "whenCreated",
    "whenChanged",
    "createTimeStamp",
    "modifyTimeStamp",
];

pub struct LdapTranslator<'a> {
    catalog: &'a FieldCatalog,
    limits: QueryLimits,
}

impl<'a> LdapTranslator<'a> {
    pub fn new(catalog: &'a FieldCatalog, limits: QueryLimits) -> Self {
        Self { catalog, limits }
    }
}

impl QueryTranslator for LdapTranslator<'_> {
    fn translate(&self, spec: &QuerySpec) -> Result<BackendQuery> {
        let resolved = resolve(self.catalog, DataSource::Ad, spec, self.limits)?;
        let request = render(&resolved, self.limits.ldap_size_limit)?;

        // Directory searches return unordered entries; sorting, grouping and
        // the row limit are applied after mapping.
        let post = PostProcess {
            sort: resolved.sort_keys(),
            group_by: resolved.group_by.iter().map(|f| f.name.clone()).collect(),
            limit: usize::try_from(resolved.limit).ok(),
            project: resolved.projection(),
        };

        Ok(BackendQuery {
            request: BackendRequest::Ldap(request),
            mapping: resolved.fetch_mapping(),
            post,
        })
    }
}

fn render(query: &ResolvedQuery<'_>, size_limit: i32) -> Result<LdapQuery> {
    let base = query.entity.target.clone();
    let filter = if query.filters.is_empty() {
        base
    } else {
        let clauses = query
            .filters
            .iter()
            .map(render_filter)
            .collect::<Result<Vec<_>>>()?;
        format!("(&{base}{})", clauses.concat())
    };

    let mut attributes: Vec<String> = Vec::new();
    let wanted = query
        .select
        .iter()
        .chain(query.group_by.iter())
        .chain(query.order_by.iter().map(|order| &order.field));
    for field in wanted {
        if !attributes
            .iter()
            .any(|attr| attr.eq_ignore_ascii_case(&field.backend_name))
        {
            attributes.push(field.backend_name.clone());
        }
    }

    Ok(LdapQuery {
        base_dn: None,
        filter,
        attributes,
        scope: SearchScope::Sub,
        size_limit,
    })
}

fn render_filter(filter: &ResolvedFilter) -> Result<String> {
    let attr = filter.field.backend_name.as_str();
    let clause = match filter.op {
        FilterOperator::IsEmpty => format!("(!({attr}=*))"),
        FilterOperator::IsNotEmpty => format!("({attr}=*)"),
        FilterOperator::Contains => {
            let value = escape(&scalar_text(&filter.field, &filter.value)?);
            format!("({attr}=*{value}*)")
        }
        FilterOperator::StartsWith => {
            let value = escape(&scalar_text(&filter.field, &filter.value)?);
            format!("({attr}={value}*)")
        }
        FilterOperator::EndsWith => {
            let value = escape(&scalar_text(&filter.field, &filter.value)?);
            format!("({attr}=*{value})")
        }
        FilterOperator::In | FilterOperator::NotIn => {
            let items = filter.value.as_array().cloned().unwrap_or_default();
            let alternatives = items
                .iter()
                .map(|item| Ok(format!("({attr}={})", encode(&filter.field, item)?)))
                .collect::<Result<Vec<_>>>()?;
            let any = format!("(|{})", alternatives.concat());
            if filter.op == FilterOperator::In {
                any
            } else {
                format!("(!{any})")
            }
        }
        FilterOperator::Equals => format!("({attr}={})", encode(&filter.field, &filter.value)?),
        FilterOperator::NotEquals => {
            format!("(!({attr}={}))", encode(&filter.field, &filter.value)?)
        }
        FilterOperator::GreaterOrEqual => {
            format!("({attr}>={})", encode(&filter.field, &filter.value)?)
        }
        FilterOperator::LessOrEqual => {
            format!("({attr}<={})", encode(&filter.field, &filter.value)?)
        }
        // LDAP has no strict comparisons.
        FilterOperator::GreaterThan => {
            format!("(!({attr}<={}))", encode(&filter.field, &filter.value)?)
        }
        FilterOperator::LessThan => {
            format!("(!({attr}>={}))", encode(&filter.field, &filter.value)?)
        }
    };
    Ok(clause)
}

/// Encodes a filter value in the attribute's wire representation.
fn encode(field: &FieldMetadata, value: &Value) -> Result<String> {
    let encoded = match field.field_type {
        FieldType::Integer => integer_value(field, value)?.to_string(),
        FieldType::Boolean => {
            if boolean_value(field, value)? {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        FieldType::Datetime => encode_time(field, datetime_value(field, value)?)?,
        FieldType::String | FieldType::Array => escape(&scalar_text(field, value)?),
    };
    Ok(encoded)
}

fn encode_time(field: &FieldMetadata, value: DateTime<Utc>) -> Result<String> {
    if GENERALIZED_TIME_ATTRIBUTES
        .iter()
        .any(|name| name.eq_ignore_ascii_case(&field.backend_name))
    {
        return Ok(value.format("%Y%m%d%H%M%S.0Z").to_string());
    }
    to_filetime(value).map(|ticks| ticks.to_string()).ok_or_else(|| {
        ServiceError::validation(format!(
            "date for field '{}' is outside the directory timestamp range",
            field.name
        ))
    })
}

/// RFC 4515 assertion value escaping.
pub(crate) fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            _ => out.push(ch),
        }
    }
    out
}

/// RFC 4514 attribute value escaping for distinguished names.
pub(crate) fn dn_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let last = input.chars().count().saturating_sub(1);
    for (i, ch) in input.chars().enumerate() {
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                out.push('\\');
                out.push(ch);
            }
            '#' if i == 0 => out.push_str("\\#"),
            ' ' if i == 0 || i == last => out.push_str("\\ "),
            '\0' => out.push_str("\\00"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::OrderDirection;
    use serde_json::json;

    fn translate(spec: serde_json::Value) -> Result<BackendQuery> {
        let catalog = FieldCatalog::new(None);
        let limits = QueryLimits {
            default_limit: 100,
            max_limit: 1000,
            ldap_size_limit: 2000,
        };
        let spec: QuerySpec = serde_json::from_value(spec).unwrap();
        LdapTranslator::new(&catalog, limits).translate(&spec)
    }

    fn ldap(query: &BackendQuery) -> &LdapQuery {
        match &query.request {
            BackendRequest::Ldap(ldap) => ldap,
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn wraps_clauses_with_entity_filter() {
        let query = translate(json!({
            "select": ["username", "department"],
            "where": [
                { "field": "department", "operator": "equals", "value": "Finance" },
                { "field": "email", "operator": "ends_with", "value": "@corp.example" }
            ]
        }))
        .unwrap();
        let request = ldap(&query);
        assert_eq!(
            request.filter,
            "(&(&(objectCategory=person)(objectClass=user))(department=Finance)(mail=*@corp.example))"
        );
        assert_eq!(request.attributes, vec!["sAMAccountName", "department"]);
        assert_eq!(request.size_limit, 2000);
        assert_eq!(request.scope, SearchScope::Sub);
    }

    #[test]
    fn order_only_fields_are_fetched_then_projected_away() {
        let query = translate(json!({
            "select": ["username"],
            "orderBy": [{ "field": "department", "direction": "asc" }]
        }))
        .unwrap();
        assert_eq!(ldap(&query).attributes, vec!["sAMAccountName", "department"]);
        assert_eq!(query.post.project, vec!["username".to_string()]);

        let raw = vec![
            json!({ "sAMAccountName": ["jdoe"], "department": ["Finance"] }),
            json!({ "sAMAccountName": ["alee"], "department": ["Engineering"] }),
        ];
        let rows = crate::mapper::post_process(
            crate::mapper::map_rows(raw, &query.mapping),
            &query.post,
        );
        assert_eq!(
            rows.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![json!({ "username": "alee" }), json!({ "username": "jdoe" })]
        );
    }

    #[test]
    fn dn_values_use_distinguished_name_escaping() {
        assert_eq!(dn_escape("Sales, EU+\"North\""), "Sales\\, EU\\+\\\"North\\\"");
        assert_eq!(dn_escape("#ops "), "\\#ops\\ ");
        assert_eq!(dn_escape("a<b>;c\\d"), "a\\<b\\>\\;c\\\\d");
        assert_eq!(dn_escape("Finance (EU)*"), "Finance (EU)*");
    }

    #[test]
    fn escapes_filter_metacharacters() {
        let query = translate(json!({
            "where": [{ "field": "displayName", "operator": "contains", "value": "a*(b)\\c" }]
        }))
        .unwrap();
        assert!(ldap(&query)
            .filter
            .contains("(displayName=*a\\2a\\28b\\29\\5cc*)"));
    }

    #[test]
    fn strict_comparisons_are_negated() {
        let query = translate(json!({
            "where": [
                { "field": "badPasswordCount", "operator": "greater_than", "value": 3 },
                { "field": "logonCount", "operator": "less_than", "value": "10" }
            ]
        }))
        .unwrap();
        let filter = &ldap(&query).filter;
        assert!(filter.contains("(!(badPwdCount<=3))"));
        assert!(filter.contains("(!(logonCount>=10))"));
    }

    #[test]
    fn datetimes_use_attribute_encoding() {
        let query = translate(json!({
            "where": [
                { "field": "lastLogon", "operator": "less_than", "value": "2024-01-01T00:00:00Z" },
                { "field": "whenCreated", "operator": "greater_or_equal", "value": "2024-01-01" }
            ]
        }))
        .unwrap();
        let filter = &ldap(&query).filter;
        assert!(filter.contains("(!(lastLogonTimestamp>=133485408000000000))"));
        assert!(filter.contains("(whenCreated>=20240101000000.0Z)"));
    }

    #[test]
    fn out_of_range_dates_are_rejected() {
        let err = translate(json!({
            "where": [{ "field": "lastLogon", "operator": "greater_than", "value": "+100000-01-01" }]
        }))
        .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(message) if message.contains("lastLogon")));

        let err = translate(json!({
            "where": [{ "field": "lastLogon", "operator": "less_than", "value": "1500-06-01" }]
        }))
        .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn list_operators_become_disjunctions() {
        let query = translate(json!({
            "where": [
                { "field": "department", "operator": "in", "value": ["IT", "HR"] },
                { "field": "title", "operator": "not_in", "value": ["Intern"] }
            ]
        }))
        .unwrap();
        let filter = &ldap(&query).filter;
        assert!(filter.contains("(|(department=IT)(department=HR))"));
        assert!(filter.contains("(!(|(title=Intern)))"));
    }

    #[test]
    fn ordering_and_grouping_happen_after_the_search() {
        let query = translate(json!({
            "select": ["username"],
            "groupBy": ["department"],
            "orderBy": [{ "field": "department", "direction": "desc" }],
            "limit": 5
        }))
        .unwrap();
        assert_eq!(
            query.post.sort,
            vec![("department".to_string(), OrderDirection::Desc)]
        );
        assert_eq!(query.post.group_by, vec!["department".to_string()]);
        assert_eq!(query.post.limit, Some(5));
        assert!(ldap(&query)
            .attributes
            .iter()
            .any(|attr| attr == "department"));
    }
}
