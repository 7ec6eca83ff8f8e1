use super::{DirectoryClient, DiscoveredAttribute, SchemaDiscovery};
use crate::{
    credentials::Credential,
    query::{LdapQuery, SearchScope},
};
use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry, SearchOptions};
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use tracing::debug;

/// Active Directory caps responses at MaxPageSize (1000 by default).
const PAGE_SIZE: i32 = 500;
/// LDAP result code `sizeLimitExceeded`; the entries received are kept.
const SIZE_LIMIT_EXCEEDED: u32 = 4;

pub struct LdapDirectoryClient {
    connect_timeout: Duration,
}

impl LdapDirectoryClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn bind(&self, credential: &Credential) -> anyhow::Result<Ldap> {
        let url = credential
            .endpoint
            .as_deref()
            .context("directory credential has no LDAP URL")?;
        let settings = LdapConnSettings::new().set_conn_timeout(self.connect_timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        ldap3::drive!(conn);

        let bind_dn = credential.username.as_deref().unwrap_or_default();
        ldap.simple_bind(bind_dn, &credential.secret)
            .await?
            .success()
            .context("LDAP bind rejected")?;
        Ok(ldap)
    }
}

fn scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::One => Scope::OneLevel,
        SearchScope::Sub => Scope::Subtree,
    }
}

/// Attribute values stay arrays; binary values (objectSid, objectGUID) are
/// base64 encoded.
fn entry_to_json(entry: SearchEntry) -> Value {
    let mut row = Map::new();
    row.insert("dn".to_string(), Value::String(entry.dn));
    for (name, values) in entry.attrs {
        row.insert(
            name,
            Value::Array(values.into_iter().map(Value::String).collect()),
        );
    }
    for (name, values) in entry.bin_attrs {
        row.insert(
            name,
            Value::Array(
                values
                    .into_iter()
                    .map(|bytes| Value::String(STANDARD.encode(bytes)))
                    .collect(),
            ),
        );
    }
    Value::Object(row)
}

#[async_trait]
impl DirectoryClient for LdapDirectoryClient {
    async fn search(&self, credential: &Credential, query: &LdapQuery) -> anyhow::Result<Vec<Value>> {
        let base = query
            .base_dn
            .as_deref()
            .or(credential.base_dn.as_deref())
            .context("no base DN for directory search")?
            .to_string();

        let mut ldap = self.bind(credential).await?;
        ldap.with_search_options(SearchOptions::new().sizelimit(query.size_limit));

        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(PAGE_SIZE)),
        ];
        let mut stream = ldap
            .streaming_search_with(
                adapters,
                &base,
                scope(query.scope),
                &query.filter,
                query.attributes.clone(),
            )
            .await?;

        let mut rows = Vec::new();
        while let Some(entry) = stream.next().await? {
            rows.push(entry_to_json(SearchEntry::construct(entry)));
        }
        let result = stream.finish().await;
        let _ = ldap.unbind().await;

        if result.rc != 0 && result.rc != SIZE_LIMIT_EXCEEDED {
            bail!("LDAP search failed ({}): {}", result.rc, result.text);
        }
        debug!(base = %base, rows = rows.len(), "ldap search complete");
        Ok(rows)
    }

    async fn ping(&self, credential: &Credential) -> anyhow::Result<()> {
        let mut ldap = self.bind(credential).await?;
        ldap.unbind().await?;
        Ok(())
    }
}

/// Reads attributeSchema objects from the schema naming context.
pub struct DirectoryDiscovery {
    client: Arc<dyn DirectoryClient>,
    credential: Credential,
    size_limit: i32,
}

impl DirectoryDiscovery {
    pub fn new(client: Arc<dyn DirectoryClient>, credential: Credential, size_limit: i32) -> Self {
        Self {
            client,
            credential,
            size_limit,
        }
    }
}

fn first(row: &Value, attribute: &str) -> Option<String> {
    row.get(attribute)
        .and_then(Value::as_array)
        .and_then(|values| values.first())
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl SchemaDiscovery for DirectoryDiscovery {
    async fn discover_attributes(&self) -> anyhow::Result<Vec<DiscoveredAttribute>> {
        let base_dn = self
            .credential
            .base_dn
            .as_deref()
            .context("directory credential has no base DN")?;
        let query = LdapQuery {
            base_dn: Some(format!("CN=Schema,CN=Configuration,{base_dn}")),
            filter: "(&(objectClass=attributeSchema)(!(isDefunct=TRUE))(systemOnly=FALSE))"
                .to_string(),
            attributes: vec![
                "lDAPDisplayName".to_string(),
                "attributeSyntax".to_string(),
                "isSingleValued".to_string(),
            ],
            scope: SearchScope::One,
            size_limit: self.size_limit,
        };

        let rows = self.client.search(&self.credential, &query).await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(DiscoveredAttribute {
                    name: first(row, "lDAPDisplayName")?,
                    syntax: first(row, "attributeSyntax").unwrap_or_default(),
                    single_valued: first(row, "isSingleValued")
                        .is_some_and(|value| value.eq_ignore_ascii_case("TRUE")),
                })
            })
            .collect())
    }
}
