//! Backend credentials: stored per user in `service_credentials` with the
//! secret encrypted by pgcrypto, falling back to the environment defaults.

use crate::{
    catalog::DataSource,
    config::AppConfig,
    db::{self, PgPool},
    error::{Result, ServiceError},
};
use async_trait::async_trait;
use diesel::sql_query;
use diesel::sql_types::{Array, Bool, Nullable, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl;
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: String,
    pub user_id: Option<String>,
    pub data_source: DataSource,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    /// LDAP bind DN.
    pub username: Option<String>,
    #[serde(skip)]
    pub secret: String,
    /// LDAP URL or Graph base URL.
    pub endpoint: Option<String>,
    pub base_dn: Option<String>,
    pub scopes: Vec<String>,
    pub is_default: bool,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("data_source", &self.data_source)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .field("endpoint", &self.endpoint)
            .field("base_dn", &self.base_dn)
            .finish()
    }
}

#[async_trait]
pub trait CredentialService: Send + Sync {
    /// Resolves an explicit credential or the default for `source`.
    ///
    /// Explicit ids must belong to `user_id` or be shared defaults.
    async fn get_credential(
        &self,
        user_id: Option<&str>,
        source: DataSource,
        credential_id: Option<&str>,
    ) -> Result<Credential>;
}

fn missing(source: DataSource, credential_id: Option<&str>) -> ServiceError {
    match credential_id {
        Some(id) => ServiceError::Authorization(format!("credential '{id}' is not available")),
        None => ServiceError::Authorization(format!("no {source} credential configured")),
    }
}

/// Credentials assembled from `REPORTQ_LDAP_*` and `REPORTQ_GRAPH_*`.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credentials: Vec<Credential>,
}

impl StaticCredentials {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let mut credentials = Vec::new();

        if let Some(ldap) = &config.ldap {
            credentials.push(Credential {
                id: format!("env:{}", DataSource::Ad),
                user_id: None,
                data_source: DataSource::Ad,
                tenant_id: None,
                client_id: None,
                username: Some(ldap.bind_dn.clone()),
                secret: ldap.bind_password.clone(),
                endpoint: Some(ldap.url.clone()),
                base_dn: Some(ldap.base_dn.clone()),
                scopes: Vec::new(),
                is_default: true,
            });
        }

        if let Some(graph) = &config.graph {
            for source in [DataSource::Azure, DataSource::O365] {
                credentials.push(Credential {
                    id: format!("env:{source}"),
                    user_id: None,
                    data_source: source,
                    tenant_id: Some(graph.tenant_id.clone()),
                    client_id: Some(graph.client_id.clone()),
                    username: None,
                    secret: graph.client_secret.clone(),
                    endpoint: Some(graph.base_url.clone()),
                    base_dn: None,
                    scopes: Vec::new(),
                    is_default: true,
                });
            }
        }

        Self { credentials }
    }

    fn find(&self, user_id: Option<&str>, source: DataSource, credential_id: Option<&str>) -> Option<Credential> {
        let visible = |cred: &&Credential| {
            cred.data_source == source
                && (cred.user_id.is_none() || cred.user_id.as_deref() == user_id)
        };
        match credential_id {
            Some(id) => self
                .credentials
                .iter()
                .filter(visible)
                .find(|cred| cred.id == id)
                .cloned(),
            None => self
                .credentials
                .iter()
                .filter(visible)
                .filter(|cred| cred.is_default)
                // A user's own default wins over the shared one.
                .max_by_key(|cred| cred.user_id.is_some())
                .cloned(),
        }
    }
}

#[async_trait]
impl CredentialService for StaticCredentials {
    async fn get_credential(
        &self,
        user_id: Option<&str>,
        source: DataSource,
        credential_id: Option<&str>,
    ) -> Result<Credential> {
        self.find(user_id, source, credential_id)
            .ok_or_else(|| missing(source, credential_id))
    }
}

#[derive(Debug, QueryableByName)]
struct CredentialRow {
    #[diesel(sql_type = Text)]
    id: String,
    #[diesel(sql_type = Nullable<Text>)]
    user_id: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    tenant_id: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    client_id: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    username: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    secret: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    endpoint: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    base_dn: Option<String>,
    #[diesel(sql_type = Nullable<Array<Text>>)]
    scopes: Option<Vec<String>>,
    #[diesel(sql_type = Bool)]
    is_default: bool,
}

const CREDENTIAL_SQL: &str = "\
SELECT id::text AS id, user_id, tenant_id, client_id, username, \
       pgp_sym_decrypt(encrypted_secret, $1) AS secret, \
       endpoint, base_dn, scopes, is_default \
FROM service_credentials \
WHERE service_type = $2 AND is_active \
  AND (user_id IS NULL OR user_id = $3) \
  AND (($4::text IS NOT NULL AND id::text = $4) OR ($4::text IS NULL AND is_default)) \
ORDER BY user_id NULLS LAST \
LIMIT 1";

/// Reads `service_credentials`, decrypting with the configured key, and
/// falls back to the environment credentials when no row matches.
pub struct PgCredentialStore {
    pool: PgPool,
    key: String,
    fallback: StaticCredentials,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool, key: String, fallback: StaticCredentials) -> Self {
        Self {
            pool,
            key,
            fallback,
        }
    }

    async fn load(
        &self,
        user_id: Option<&str>,
        source: DataSource,
        credential_id: Option<&str>,
    ) -> anyhow::Result<Option<Credential>> {
        let mut conn = db::checkout(&self.pool).await?;

        let rows: Vec<CredentialRow> = sql_query(CREDENTIAL_SQL)
            .bind::<Text, _>(&self.key)
            .bind::<Text, _>(source.as_str())
            .bind::<Nullable<Text>, _>(user_id)
            .bind::<Nullable<Text>, _>(credential_id)
            .load(&mut *conn)
            .await?;

        Ok(rows.into_iter().next().map(|row| Credential {
            id: row.id,
            user_id: row.user_id,
            data_source: source,
            tenant_id: row.tenant_id,
            client_id: row.client_id,
            username: row.username,
            secret: row.secret.unwrap_or_default(),
            endpoint: row.endpoint,
            base_dn: row.base_dn,
            scopes: row.scopes.unwrap_or_default(),
            is_default: row.is_default,
        }))
    }
}

#[async_trait]
impl CredentialService for PgCredentialStore {
    async fn get_credential(
        &self,
        user_id: Option<&str>,
        source: DataSource,
        credential_id: Option<&str>,
    ) -> Result<Credential> {
        if let Some(credential) = self.load(user_id, source, credential_id).await? {
            return Ok(credential);
        }
        debug!(data_source = %source, "no stored credential, using environment default");
        self.fallback.get_credential(user_id, source, credential_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(id: &str, user: Option<&str>, source: DataSource, is_default: bool) -> Credential {
        Credential {
            id: id.to_string(),
            user_id: user.map(str::to_string),
            data_source: source,
            tenant_id: None,
            client_id: None,
            username: None,
            secret: "hunter2".to_string(),
            endpoint: None,
            base_dn: None,
            scopes: Vec::new(),
            is_default,
        }
    }

    #[tokio::test]
    async fn prefers_user_default_and_hides_other_users() {
        let store = StaticCredentials::new(vec![
            credential("shared", None, DataSource::Ad, true),
            credential("alice-ad", Some("alice"), DataSource::Ad, true),
            credential("bob-ad", Some("bob"), DataSource::Ad, false),
        ]);

        let cred = store.get_credential(Some("alice"), DataSource::Ad, None).await.unwrap();
        assert_eq!(cred.id, "alice-ad");
        let cred = store.get_credential(Some("carol"), DataSource::Ad, None).await.unwrap();
        assert_eq!(cred.id, "shared");

        let err = store
            .get_credential(Some("alice"), DataSource::Ad, Some("bob-ad"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Authorization(_)));
        let err = store.get_credential(None, DataSource::Azure, None).await.unwrap_err();
        assert!(matches!(err, ServiceError::Authorization(_)));
    }

    #[test]
    fn debug_redacts_secret() {
        let cred = credential("shared", None, DataSource::Ad, true);
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
