use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env,
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_GRAPH_AUTHORITY: &str = "https://login.microsoftonline.com";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub database_url: String,
    pub max_pool_size: u32,
    pub pg_ssl_root_cert: Option<String>,
    pub pg_ssl_cert: Option<String>,
    pub pg_ssl_key: Option<String>,
    pub jwt_secret: String,
    pub allowed_origins: Option<Vec<String>>,
    pub default_limit: i64,
    pub max_limit: i64,
    pub preview_limit: i64,
    pub query_timeout: Duration,
    pub max_query_timeout: Duration,
    pub request_timeout: Duration,
    pub cache_ttl: Duration,
    pub history_retention_days: i64,
    pub max_batch_size: usize,
    pub credential_key: Option<String>,
    pub ldap_size_limit: i32,
    pub ldap: Option<LdapSettings>,
    pub graph: Option<GraphSettings>,
}

/// Default Active Directory connection used when no stored credential exists.
#[derive(Clone)]
pub struct LdapSettings {
    pub url: String,
    pub bind_dn: String,
    pub bind_password: String,
    pub base_dn: String,
}

impl std::fmt::Debug for LdapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapSettings")
            .field("url", &self.url)
            .field("bind_dn", &self.bind_dn)
            .field("bind_password", &"[REDACTED]")
            .field("base_dn", &self.base_dn)
            .finish()
    }
}

/// Default app registration used for Azure AD and Office 365 queries.
#[derive(Clone)]
pub struct GraphSettings {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
    pub authority: String,
}

impl std::fmt::Debug for GraphSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSettings")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("authority", &self.authority)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    reportq_listen_addr: Option<String>,
    #[serde(default)]
    reportq_listen_host: Option<String>,
    #[serde(default)]
    reportq_listen_port: Option<u16>,
    #[serde(default)]
    reportq_database_url: Option<String>,
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default = "default_pool_size")]
    reportq_max_pool_size: u32,
    #[serde(default)]
    pgsslrootcert: Option<String>,
    #[serde(default)]
    pgsslcert: Option<String>,
    #[serde(default)]
    pgsslkey: Option<String>,
    #[serde(default)]
    reportq_jwt_secret: Option<String>,
    #[serde(default)]
    reportq_allowed_origins: Option<String>,
    #[serde(default = "default_limit")]
    reportq_default_limit: i64,
    #[serde(default = "default_max_limit")]
    reportq_max_limit: i64,
    #[serde(default = "default_preview_limit")]
    reportq_preview_limit: i64,
    #[serde(default = "default_query_timeout_secs")]
    reportq_query_timeout_secs: u64,
    #[serde(default = "default_max_query_timeout_secs")]
    reportq_max_query_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    reportq_request_timeout_secs: u64,
    #[serde(default = "default_cache_ttl_secs")]
    reportq_cache_ttl_secs: u64,
    #[serde(default = "default_retention_days")]
    reportq_history_retention_days: i64,
    #[serde(default = "default_max_batch_size")]
    reportq_max_batch_size: usize,
    #[serde(default)]
    reportq_credential_key: Option<String>,
    #[serde(default)]
    reportq_ldap_url: Option<String>,
    #[serde(default)]
    reportq_ldap_bind_dn: Option<String>,
    #[serde(default)]
    reportq_ldap_bind_password: Option<String>,
    #[serde(default)]
    reportq_ldap_base_dn: Option<String>,
    #[serde(default = "default_ldap_size_limit")]
    reportq_ldap_size_limit: i32,
    #[serde(default)]
    reportq_graph_tenant_id: Option<String>,
    #[serde(default)]
    reportq_graph_client_id: Option<String>,
    #[serde(default)]
    reportq_graph_client_secret: Option<String>,
    #[serde(default)]
    reportq_graph_base_url: Option<String>,
    #[serde(default)]
    reportq_graph_authority: Option<String>,
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_limit() -> i64 {
    1000
}

const fn default_max_limit() -> i64 {
    5000
}

const fn default_preview_limit() -> i64 {
    10
}

const fn default_query_timeout_secs() -> u64 {
    30
}

const fn default_max_query_timeout_secs() -> u64 {
    120
}

const fn default_request_timeout_secs() -> u64 {
    150
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

const fn default_retention_days() -> i64 {
    90
}

const fn default_max_batch_size() -> usize {
    10
}

const fn default_ldap_size_limit() -> i32 {
    5000
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let raw: RawConfig =
            envy::from_env().context("failed to parse REPORTQ_* environment variables")?;

        let listen_addr = resolve_addr(
            raw.reportq_listen_addr,
            raw.reportq_listen_host,
            raw.reportq_listen_port,
        )?;

        let database_url = raw
            .reportq_database_url
            .or(raw.database_url)
            .or_else(|| env::var("DATABASE_URL").ok())
            .context("REPORTQ_DATABASE_URL or DATABASE_URL must be set")?;

        let jwt_secret = raw
            .reportq_jwt_secret
            .filter(|secret| !secret.trim().is_empty())
            .context("REPORTQ_JWT_SECRET must be set")?;

        let allowed_origins = raw.reportq_allowed_origins.and_then(|csv| {
            let trimmed: Vec<_> = csv
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect();
            (!trimmed.is_empty()).then_some(trimmed)
        });

        let ldap = match (
            raw.reportq_ldap_url,
            raw.reportq_ldap_bind_dn,
            raw.reportq_ldap_bind_password,
            raw.reportq_ldap_base_dn,
        ) {
            (Some(url), Some(bind_dn), Some(bind_password), Some(base_dn)) => Some(LdapSettings {
                url,
                bind_dn,
                bind_password,
                base_dn,
            }),
            (None, None, None, None) => None,
            _ => anyhow::bail!(
                "REPORTQ_LDAP_URL, REPORTQ_LDAP_BIND_DN, REPORTQ_LDAP_BIND_PASSWORD and REPORTQ_LDAP_BASE_DN must be set together"
            ),
        };

        let graph = match (
            raw.reportq_graph_tenant_id,
            raw.reportq_graph_client_id,
            raw.reportq_graph_client_secret,
        ) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => Some(GraphSettings {
                tenant_id,
                client_id,
                client_secret,
                base_url: raw
                    .reportq_graph_base_url
                    .unwrap_or_else(|| DEFAULT_GRAPH_BASE_URL.to_string()),
                authority: raw
                    .reportq_graph_authority
                    .unwrap_or_else(|| DEFAULT_GRAPH_AUTHORITY.to_string()),
            }),
            (None, None, None) => None,
            _ => anyhow::bail!(
                "REPORTQ_GRAPH_TENANT_ID, REPORTQ_GRAPH_CLIENT_ID and REPORTQ_GRAPH_CLIENT_SECRET must be set together"
            ),
        };

        let default_limit = raw.reportq_default_limit.max(1);
        let max_limit = raw.reportq_max_limit.max(default_limit);
        let query_timeout = Duration::from_secs(raw.reportq_query_timeout_secs.max(1));
        let max_query_timeout =
            Duration::from_secs(raw.reportq_max_query_timeout_secs).max(query_timeout);

        Ok(Self {
            listen_addr,
            database_url,
            max_pool_size: raw.reportq_max_pool_size,
            pg_ssl_root_cert: raw.pgsslrootcert,
            pg_ssl_cert: raw.pgsslcert,
            pg_ssl_key: raw.pgsslkey,
            jwt_secret,
            allowed_origins,
            default_limit,
            max_limit,
            preview_limit: raw.reportq_preview_limit.clamp(1, max_limit),
            query_timeout,
            max_query_timeout,
            request_timeout: Duration::from_secs(raw.reportq_request_timeout_secs.max(1)),
            cache_ttl: Duration::from_secs(raw.reportq_cache_ttl_secs),
            history_retention_days: raw.reportq_history_retention_days.max(1),
            max_batch_size: raw.reportq_max_batch_size.max(1),
            credential_key: raw.reportq_credential_key,
            ldap_size_limit: raw.reportq_ldap_size_limit.max(1),
            ldap,
            graph,
        })
    }

    /// Configuration with defaults and no directory backends, used by tests and
    /// local tooling.
    pub fn embedded(database_url: String) -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            database_url,
            max_pool_size: 1,
            pg_ssl_root_cert: None,
            pg_ssl_cert: None,
            pg_ssl_key: None,
            jwt_secret: "embedded-secret".to_string(),
            allowed_origins: None,
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            preview_limit: default_preview_limit(),
            query_timeout: Duration::from_secs(default_query_timeout_secs()),
            max_query_timeout: Duration::from_secs(default_max_query_timeout_secs()),
            request_timeout: Duration::from_secs(default_request_timeout_secs()),
            cache_ttl: Duration::from_secs(default_cache_ttl_secs()),
            history_retention_days: default_retention_days(),
            max_batch_size: default_max_batch_size(),
            credential_key: None,
            ldap_size_limit: default_ldap_size_limit(),
            ldap: None,
            graph: None,
        }
    }

    /// Clamps a caller-supplied timeout (milliseconds) to the configured bounds.
    pub fn effective_timeout(&self, requested_ms: Option<u64>) -> Duration {
        match requested_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.max_query_timeout),
            _ => self.query_timeout,
        }
    }
}

fn resolve_addr(
    addr: Option<String>,
    host: Option<String>,
    port: Option<u16>,
) -> Result<SocketAddr> {
    if let Some(addr) = addr {
        return addr
            .to_socket_addrs()
            .context("invalid REPORTQ_LISTEN_ADDR value")?
            .next()
            .context("REPORTQ_LISTEN_ADDR resolved to no addresses");
    }

    let host = host.unwrap_or_else(|| "0.0.0.0".to_string());
    let port = port.unwrap_or(8090);
    format!("{host}:{port}")
        .to_socket_addrs()
        .context("invalid listen host/port combination")?
        .next()
        .context("listen address resolved to no targets")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn effective_timeout_clamps_to_maximum() {
        let config = AppConfig::embedded("postgres://unused/db".to_string());
        assert_eq!(config.effective_timeout(None), config.query_timeout);
        assert_eq!(config.effective_timeout(Some(0)), config.query_timeout);
        assert_eq!(
            config.effective_timeout(Some(5_000)),
            Duration::from_millis(5_000)
        );
        assert_eq!(
            config.effective_timeout(Some(10_000_000)),
            config.max_query_timeout
        );
    }

    fn reset_env(vars: &[(&str, &str)]) {
        for (key, _) in env::vars() {
            if key.starts_with("REPORTQ_") || key == "DATABASE_URL" {
                env::remove_var(key);
            }
        }
        for (key, value) in vars {
            env::set_var(key, value);
        }
    }

    #[test]
    #[serial]
    fn from_env_normalizes_limits_and_origins() {
        reset_env(&[
            ("REPORTQ_DATABASE_URL", "postgres://reports@db/reports"),
            ("REPORTQ_JWT_SECRET", "s3cret"),
            ("REPORTQ_ALLOWED_ORIGINS", "https://a.example, ,https://b.example"),
            ("REPORTQ_DEFAULT_LIMIT", "500"),
            ("REPORTQ_MAX_LIMIT", "100"),
            ("REPORTQ_LISTEN_PORT", "9100"),
        ]);
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.max_limit, 500);
        assert_eq!(
            config.allowed_origins,
            Some(vec!["https://a.example".to_string(), "https://b.example".to_string()])
        );
        assert_eq!(config.listen_addr.port(), 9100);
        assert!(config.ldap.is_none());
        assert!(config.graph.is_none());
    }

    #[test]
    #[serial]
    fn from_env_rejects_partial_backend_settings() {
        reset_env(&[
            ("DATABASE_URL", "postgres://reports@db/reports"),
            ("REPORTQ_JWT_SECRET", "s3cret"),
            ("REPORTQ_LDAP_URL", "ldaps://dc1.corp.example"),
        ]);
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("REPORTQ_LDAP_BIND_DN"));

        reset_env(&[
            ("DATABASE_URL", "postgres://reports@db/reports"),
            ("REPORTQ_JWT_SECRET", "s3cret"),
            ("REPORTQ_GRAPH_TENANT_ID", "tenant"),
            ("REPORTQ_GRAPH_CLIENT_ID", "client"),
            ("REPORTQ_GRAPH_CLIENT_SECRET", "secret"),
        ]);
        let graph = AppConfig::from_env().unwrap().graph.unwrap();
        assert_eq!(graph.base_url, DEFAULT_GRAPH_BASE_URL);
        assert_eq!(graph.authority, DEFAULT_GRAPH_AUTHORITY);
    }

    #[test]
    #[serial]
    fn from_env_requires_jwt_secret() {
        reset_env(&[("REPORTQ_DATABASE_URL", "postgres://reports@db/reports")]);
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("REPORTQ_JWT_SECRET"));
    }

    #[test]
    fn resolves_host_and_port() {
        let addr = resolve_addr(None, Some("127.0.0.1".into()), Some(9000)).unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 9000)));
    }
}
