//! Field catalog: the queryable fields of every data source.
//!
//! Each data source exposes one or more entities (a table, an LDAP object
//! class, a Graph collection). Every field has a logical name used by report
//! definitions and the visual builder, and a backend name (column, LDAP
//! attribute or Graph property path) used by the translators. The catalog is
//! the allow-list every requested field and filter is checked against.

mod directory;
mod graph;
mod postgres;

use crate::{
    backend::SchemaDiscovery,
    error::{Result, ServiceError},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Postgres,
    Ad,
    Azure,
    O365,
}

/// Query dialect a data source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sql,
    Ldap,
    Graph,
}

impl DataSource {
    pub const ALL: [DataSource; 4] = [
        DataSource::Postgres,
        DataSource::Ad,
        DataSource::Azure,
        DataSource::O365,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Postgres => "postgres",
            DataSource::Ad => "ad",
            DataSource::Azure => "azure",
            DataSource::O365 => "o365",
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            DataSource::Postgres => Dialect::Sql,
            DataSource::Ad => Dialect::Ldap,
            DataSource::Azure | DataSource::O365 => Dialect::Graph,
        }
    }

    pub fn is_graph(&self) -> bool {
        self.dialect() == Dialect::Graph
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = ServiceError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DataSource::Postgres),
            "ad" | "activedirectory" | "active_directory" => Ok(DataSource::Ad),
            "azure" | "azuread" | "azure_ad" | "entra" => Ok(DataSource::Azure),
            "o365" | "office365" => Ok(DataSource::O365),
            _ => Err(ServiceError::UnsupportedSource(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Boolean,
    Datetime,
    Array,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMetadata {
    pub name: String,
    pub display_name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub category: String,
    pub entity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Column, LDAP attribute or Graph property path.
    #[serde(skip)]
    pub backend_name: String,
}

impl FieldMetadata {
    pub(crate) fn new(
        name: &str,
        display_name: &str,
        field_type: FieldType,
        category: &str,
        backend_name: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            field_type,
            category: category.to_string(),
            entity: String::new(),
            description: None,
            backend_name: backend_name.to_string(),
        }
    }

    pub(crate) fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    fn matches_search(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
            || self.display_name.to_lowercase().contains(needle)
            || self.backend_name.to_lowercase().contains(needle)
            || self
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(needle))
    }
}

/// A queryable collection inside a data source.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    pub name: String,
    pub display_name: String,
    /// Table name, LDAP base filter or Graph endpoint path.
    #[serde(skip)]
    pub target: String,
    #[serde(skip)]
    pub default_fields: Vec<String>,
    #[serde(skip)]
    pub fields: Vec<FieldMetadata>,
}

impl EntitySchema {
    pub(crate) fn new(
        name: &str,
        display_name: &str,
        target: &str,
        default_fields: &[&str],
        fields: Vec<FieldMetadata>,
    ) -> Self {
        let fields = fields
            .into_iter()
            .map(|mut field| {
                field.entity = name.to_string();
                field
            })
            .collect();
        Self {
            name: name.to_string(),
            display_name: display_name.to_string(),
            target: target.to_string(),
            default_fields: default_fields.iter().map(|f| f.to_string()).collect(),
            fields,
        }
    }

    /// Looks a field up by logical name, falling back to its backend alias.
    pub fn field(&self, name: &str) -> Option<&FieldMetadata> {
        self.fields
            .iter()
            .find(|field| field.name.eq_ignore_ascii_case(name))
            .or_else(|| {
                self.fields
                    .iter()
                    .find(|field| field.backend_name.eq_ignore_ascii_case(name))
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldFilter {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
}

pub struct FieldCatalog {
    sources: HashMap<DataSource, Vec<EntitySchema>>,
    discovery: Option<Arc<dyn SchemaDiscovery>>,
    discovered: RwLock<Option<Vec<FieldMetadata>>>,
}

impl FieldCatalog {
    pub fn new(discovery: Option<Arc<dyn SchemaDiscovery>>) -> Self {
        let mut sources = HashMap::new();
        sources.insert(DataSource::Postgres, postgres::entities());
        sources.insert(DataSource::Ad, directory::entities());
        sources.insert(DataSource::Azure, graph::azure_entities());
        sources.insert(DataSource::O365, graph::o365_entities());

        Self {
            sources,
            discovery,
            discovered: RwLock::new(None),
        }
    }

    pub fn entities(&self, source: DataSource) -> &[EntitySchema] {
        self.sources
            .get(&source)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resolves an entity by name; `None` selects the source's primary entity.
    pub fn entity(&self, source: DataSource, name: Option<&str>) -> Result<&EntitySchema> {
        let entities = self.entities(source);
        match name {
            None => entities.first().ok_or_else(|| {
                ServiceError::Config(format!("no entities registered for {source}"))
            }),
            Some(name) => entities
                .iter()
                .find(|entity| entity.name.eq_ignore_ascii_case(name))
                .ok_or_else(|| {
                    ServiceError::validation(format!("unknown entity '{name}' for {source}"))
                }),
        }
    }

    /// Resolves a field of an entity, including discovered AD attributes.
    pub fn resolve(
        &self,
        source: DataSource,
        entity: &EntitySchema,
        field: &str,
    ) -> Result<FieldMetadata> {
        if let Some(found) = entity.field(field) {
            return Ok(found.clone());
        }

        if source == DataSource::Ad && entity.name == directory::USERS {
            if let Some(discovered) = self.discovered.read().as_ref() {
                if let Some(found) = discovered
                    .iter()
                    .find(|candidate| candidate.name.eq_ignore_ascii_case(field))
                {
                    return Ok(found.clone());
                }
            }
        }

        Err(ServiceError::validation(format!(
            "unknown field '{field}' for {source} {}",
            entity.name
        )))
    }

    /// Looks up a field by logical name across every entity of a source.
    pub fn lookup(&self, source: DataSource, name: &str) -> Option<&FieldMetadata> {
        self.entities(source)
            .iter()
            .find_map(|entity| entity.field(name))
    }

    pub fn contains(&self, source: DataSource, name: &str) -> bool {
        self.lookup(source, name).is_some()
    }

    /// Lists fields for the schema browser. For AD the first call (or any
    /// call with `refresh`) runs live schema discovery.
    pub async fn fields(
        &self,
        source: DataSource,
        filter: &FieldFilter,
        refresh: bool,
    ) -> Result<Vec<FieldMetadata>> {
        if source == DataSource::Ad {
            self.ensure_discovered(refresh).await;
        }

        let needle = filter.search.as_deref().map(str::to_lowercase);
        let mut fields: Vec<FieldMetadata> = self
            .entities(source)
            .iter()
            .filter(|entity| {
                filter
                    .entity
                    .as_deref()
                    .map_or(true, |wanted| entity.name.eq_ignore_ascii_case(wanted))
            })
            .flat_map(|entity| entity.fields.iter().cloned())
            .collect();

        if source == DataSource::Ad {
            if let Some(discovered) = self.discovered.read().as_ref() {
                let wants_users = filter
                    .entity
                    .as_deref()
                    .map_or(true, |wanted| wanted.eq_ignore_ascii_case(directory::USERS));
                if wants_users {
                    fields.extend(discovered.iter().cloned());
                }
            }
        }

        Ok(fields
            .into_iter()
            .filter(|field| {
                filter
                    .category
                    .as_deref()
                    .map_or(true, |category| field.category.eq_ignore_ascii_case(category))
            })
            .filter(|field| {
                needle
                    .as_deref()
                    .map_or(true, |needle| field.matches_search(needle))
            })
            .collect())
    }

    pub fn categories(&self, source: DataSource) -> Vec<String> {
        let mut categories: Vec<String> = self
            .entities(source)
            .iter()
            .flat_map(|entity| entity.fields.iter().map(|field| field.category.clone()))
            .collect();
        if source == DataSource::Ad && self.discovered.read().is_some() {
            categories.push(directory::DISCOVERED_CATEGORY.to_string());
        }
        categories.sort();
        categories.dedup();
        categories
    }

    async fn ensure_discovered(&self, refresh: bool) {
        let Some(discovery) = self.discovery.as_ref() else {
            return;
        };
        if !refresh && self.discovered.read().is_some() {
            return;
        }

        match discovery.discover_attributes().await {
            Ok(attributes) => {
                let users = self.entity(DataSource::Ad, Some(directory::USERS)).ok();
                let extra: Vec<FieldMetadata> = attributes
                    .into_iter()
                    .filter(|attr| {
                        users.map_or(true, |entity| entity.field(&attr.name).is_none())
                    })
                    .map(directory::discovered_field)
                    .collect();
                info!(count = extra.len(), "active directory schema discovery complete");
                *self.discovered.write() = Some(extra);
            }
            Err(err) => {
                warn!(error = %err, "active directory schema discovery failed; serving static catalog");
            }
        }
    }
}
