//! Query definition store: named, parameterized report queries.

mod builtin;
pub mod params;
pub mod template;

pub use params::{normalize_parameters, ParamType, ParameterDef};
pub use template::{render, RenderContext};

use crate::{
    catalog::{DataSource, Dialect, FieldCatalog},
    error::{Result, ServiceError},
    mapper::FieldMapping,
    query::{QuerySpec, SearchScope},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

pub const CUSTOM_PREFIX: &str = "custom:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueryBody {
    Sql {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Ldap {
        filter: String,
        attributes: Vec<String>,
        #[serde(default)]
        scope: SearchScope,
        #[serde(default)]
        base_dn: Option<String>,
        #[serde(default)]
        size_limit: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    Graph {
        endpoint: String,
        #[serde(default)]
        select: Vec<String>,
        #[serde(default)]
        filter: Option<String>,
        #[serde(default)]
        order_by: Option<String>,
        #[serde(default)]
        top: Option<u32>,
        #[serde(default)]
        expand: Option<String>,
        /// Needs `ConsistencyLevel: eventual` and `$count=true`.
        #[serde(default)]
        advanced: bool,
    },
    /// Visual-builder spec, translated at execution time.
    Builder {
        spec: QuerySpec,
    },
}

impl QueryBody {
    fn dialect(&self) -> Option<Dialect> {
        match self {
            QueryBody::Sql { .. } => Some(Dialect::Sql),
            QueryBody::Ldap { .. } => Some(Dialect::Ldap),
            QueryBody::Graph { .. } => Some(Dialect::Graph),
            QueryBody::Builder { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    pub enabled: bool,
    /// `None` uses the service default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: String,
    pub data_source: DataSource,
    pub parameters: Vec<ParameterDef>,
    #[serde(skip)]
    pub body: QueryBody,
    #[serde(rename = "fields")]
    pub field_mapping: Vec<FieldMapping>,
    pub cache: CacheConfig,
    pub requires_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_results: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub is_public: bool,
}

/// Checks a definition against the catalog and fills mapping types from it.
pub fn prepare(catalog: &FieldCatalog, mut definition: QueryDefinition) -> Result<QueryDefinition> {
    let id = definition.id.clone();
    let fail = |message: String| ServiceError::Config(format!("definition {id}: {message}"));

    if let Some(dialect) = definition.body.dialect() {
        if dialect != definition.data_source.dialect() {
            return Err(fail(format!(
                "body does not match data source {}",
                definition.data_source
            )));
        }
    }

    for (index, param) in definition.parameters.iter().enumerate() {
        if definition.parameters[..index]
            .iter()
            .any(|other| other.name == param.name)
        {
            return Err(fail(format!("duplicate parameter '{}'", param.name)));
        }
    }

    let templates: Vec<&str> = match &definition.body {
        QueryBody::Ldap {
            filter, base_dn, ..
        } => std::iter::once(filter.as_str())
            .chain(base_dn.as_deref())
            .collect(),
        QueryBody::Graph {
            endpoint, filter, ..
        } => std::iter::once(endpoint.as_str())
            .chain(filter.as_deref())
            .collect(),
        QueryBody::Sql { .. } | QueryBody::Builder { .. } => Vec::new(),
    };
    for template in templates {
        for name in template::template_names(template)? {
            if !definition.parameters.iter().any(|param| param.name == name) {
                return Err(fail(format!("template references undeclared parameter '{name}'")));
            }
        }
    }
    if let QueryBody::Sql { text } = &definition.body {
        for name in template::sql_placeholder_names(text) {
            if !definition.parameters.iter().any(|param| param.name == name) {
                return Err(fail(format!("sql references undeclared parameter ':{name}'")));
            }
        }
    }

    if matches!(definition.body, QueryBody::Builder { .. }) {
        return Ok(definition);
    }

    if definition.field_mapping.is_empty() {
        return Err(fail("declares no result fields".to_string()));
    }
    for mapping in &mut definition.field_mapping {
        let field = catalog
            .lookup(definition.data_source, &mapping.target)
            .ok_or_else(|| {
                ServiceError::Config(format!(
                    "definition {}: result field '{}' is not in the {} catalog",
                    definition.id, mapping.target, definition.data_source
                ))
            })?;
        if mapping.field_type.is_none() {
            mapping.field_type = Some(field.field_type);
        }
    }

    Ok(definition)
}

pub struct DefinitionRegistry {
    definitions: Vec<Arc<QueryDefinition>>,
    by_id: HashMap<String, usize>,
}

impl DefinitionRegistry {
    pub fn builtin(catalog: &FieldCatalog) -> Result<Self> {
        Self::from_definitions(catalog, builtin::definitions())
    }

    pub fn from_definitions(
        catalog: &FieldCatalog,
        definitions: Vec<QueryDefinition>,
    ) -> Result<Self> {
        let mut registry = Self {
            definitions: Vec::with_capacity(definitions.len()),
            by_id: HashMap::new(),
        };
        for definition in definitions {
            let definition = prepare(catalog, definition)?;
            if registry.by_id.contains_key(&definition.id) {
                return Err(ServiceError::Config(format!(
                    "duplicate query definition '{}'",
                    definition.id
                )));
            }
            registry
                .by_id
                .insert(definition.id.clone(), registry.definitions.len());
            registry.definitions.push(Arc::new(definition));
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<QueryDefinition>> {
        self.by_id
            .get(id)
            .and_then(|index| self.definitions.get(*index))
            .cloned()
    }

    pub fn list(&self, source: Option<DataSource>) -> Vec<Arc<QueryDefinition>> {
        self.definitions
            .iter()
            .filter(|def| source.map_or(true, |source| def.data_source == source))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn builtin_result_fields_are_catalog_fields() {
        let catalog = FieldCatalog::new(None);
        let registry = DefinitionRegistry::builtin(&catalog).unwrap();
        assert!(!registry.is_empty());

        for definition in registry.list(None) {
            let entity_fields: HashSet<&str> = catalog
                .entities(definition.data_source)
                .iter()
                .flat_map(|entity| entity.fields.iter().map(|field| field.name.as_str()))
                .collect();
            for mapping in &definition.field_mapping {
                assert!(
                    entity_fields.contains(mapping.target.as_str()),
                    "{}: {} not in catalog",
                    definition.id,
                    mapping.target
                );
                assert!(mapping.field_type.is_some());
            }
        }
    }

    #[test]
    fn builtin_definitions_cover_every_source() {
        let catalog = FieldCatalog::new(None);
        let registry = DefinitionRegistry::builtin(&catalog).unwrap();
        for source in DataSource::ALL {
            assert!(!registry.list(Some(source)).is_empty(), "{source}");
        }
        let inactive = registry.get("inactive_users").unwrap();
        assert_eq!(inactive.data_source, DataSource::Ad);
        assert!(inactive.parameters.iter().any(|p| p.name == "days"));
        assert!(registry.get("graph_inactive_users").is_some());
        assert!(registry.get("invalid_query").is_none());
    }

    #[test]
    fn rejects_unknown_result_fields_and_mismatched_bodies() {
        let catalog = FieldCatalog::new(None);
        let mut definition = builtin::definitions()
            .into_iter()
            .find(|def| def.id == "inactive_users")
            .unwrap();
        definition.field_mapping.push(FieldMapping::new("secret", "homePhone"));
        let err = prepare(&catalog, definition.clone()).unwrap_err();
        assert!(err.to_string().contains("homePhone"));

        definition.data_source = DataSource::Postgres;
        assert!(prepare(&catalog, definition).is_err());
    }

    #[test]
    fn rejects_undeclared_template_parameters() {
        let catalog = FieldCatalog::new(None);
        let mut definition = builtin::definitions()
            .into_iter()
            .find(|def| def.id == "inactive_users")
            .unwrap();
        definition.parameters.clear();
        let err = prepare(&catalog, definition).unwrap_err();
        assert!(err.to_string().contains("days"));
    }
}
