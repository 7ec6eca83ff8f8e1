//! Backend collaborators: the only code that talks to Postgres, the
//! directory or Microsoft Graph. The orchestrator depends on these traits.

pub mod graph;
pub mod ldap;
pub mod postgres;

use crate::{
    credentials::Credential,
    query::{GraphQuery, LdapQuery, SqlQuery},
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Runs a parameterized statement and returns each row as a JSON object.
    async fn query(&self, query: &SqlQuery) -> anyhow::Result<Vec<Value>>;

    async fn ping(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Returns one JSON object per entry; attribute values are string arrays.
    async fn search(&self, credential: &Credential, query: &LdapQuery) -> anyhow::Result<Vec<Value>>;

    /// Binds with the credential and unbinds.
    async fn ping(&self, credential: &Credential) -> anyhow::Result<()>;
}

#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Fetches a collection, following `@odata.nextLink` up to `max_rows`.
    async fn get(&self, credential: &Credential, query: &GraphQuery) -> anyhow::Result<Vec<Value>>;

    async fn ping(&self, credential: &Credential) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAttribute {
    pub name: String,
    /// attributeSyntax OID, e.g. `2.5.5.12` for Unicode strings.
    pub syntax: String,
    pub single_valued: bool,
}

#[async_trait]
pub trait SchemaDiscovery: Send + Sync {
    async fn discover_attributes(&self) -> anyhow::Result<Vec<DiscoveredAttribute>>;
}

#[derive(Clone)]
pub struct Backends {
    pub sql: Arc<dyn SqlExecutor>,
    pub directory: Arc<dyn DirectoryClient>,
    pub graph: Arc<dyn GraphClient>,
}
