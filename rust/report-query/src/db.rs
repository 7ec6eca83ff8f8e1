//! PostgreSQL pool for report history, custom templates, credentials and the
//! `postgres` data source itself.

use crate::config::AppConfig;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, Pool, PooledConnection};
use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use std::{fs::File, io::BufReader};
use tokio_postgres::{Config as PgConfig, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{error, info};

pub type PgPool = Pool<PgConnectionManager>;
pub type PgConn<'a> = PooledConnection<'a, PgConnectionManager>;

pub async fn connect_pool(config: &AppConfig) -> Result<PgPool> {
    let tls = TlsFiles::from_config(config).connector()?;
    let manager = PgConnectionManager::new(&config.database_url, tls)?;
    let pool = Pool::builder()
        .max_size(config.max_pool_size)
        .build(manager)
        .await
        .context("failed to build PostgreSQL connection pool")?;

    if let Err(err) = checkout(&pool).await {
        error!(error = %err, "initial database connectivity check failed");
    } else {
        info!(max_pool_size = config.max_pool_size, "connected to PostgreSQL");
    }

    Ok(pool)
}

pub async fn checkout(pool: &PgPool) -> Result<PgConn<'_>> {
    pool.get()
        .await
        .map_err(|err| match err {
            bb8::RunError::User(err) => anyhow!("failed to acquire database connection: {err}"),
            bb8::RunError::TimedOut => {
                anyhow!("failed to acquire database connection: Timed out in bb8")
            }
        })
}

const SCHEMA_DDL: &str = r#"
CREATE EXTENSION IF NOT EXISTS pgcrypto;

CREATE TABLE IF NOT EXISTS report_history (
    id UUID PRIMARY KEY,
    query_id TEXT NOT NULL,
    query_name TEXT,
    user_id TEXT,
    data_source TEXT NOT NULL,
    parameters JSONB NOT NULL DEFAULT '{}'::jsonb,
    status TEXT NOT NULL,
    row_count BIGINT,
    execution_time_ms BIGINT,
    result JSONB,
    export_path TEXT,
    error TEXT,
    cached BOOLEAN NOT NULL DEFAULT FALSE,
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS report_history_started_idx ON report_history (started_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS report_history_user_idx ON report_history (user_id, started_at DESC);

CREATE TABLE IF NOT EXISTS custom_report_templates (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    owner_id TEXT NOT NULL,
    data_source TEXT NOT NULL,
    query JSONB NOT NULL,
    is_public BOOLEAN NOT NULL DEFAULT FALSE,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS service_credentials (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    user_id TEXT,
    service_type TEXT NOT NULL,
    tenant_id TEXT,
    client_id TEXT,
    username TEXT,
    encrypted_secret BYTEA NOT NULL,
    endpoint TEXT,
    base_dn TEXT,
    scopes TEXT[],
    is_default BOOLEAN NOT NULL DEFAULT FALSE,
    is_active BOOLEAN NOT NULL DEFAULT TRUE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// Creates the history, custom report and credential tables when missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let mut conn = checkout(pool).await?;
    conn.batch_execute(SCHEMA_DDL)
        .await
        .context("failed to create report-query tables")?;
    info!("report-query schema ready");
    Ok(())
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
    tls: Option<MakeRustlsConnect>,
}

impl PgConnectionManager {
    fn new(database_url: &str, tls: Option<MakeRustlsConnect>) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .context("invalid REPORTQ_DATABASE_URL")?;
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ManageConnection for PgConnectionManager {
    type Connection = AsyncPgConnection;
    type Error = anyhow::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = match &self.tls {
            Some(tls) => {
                let (client, connection) = self.config.connect(tls.clone()).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
            None => {
                let (client, connection) = self.config.connect(NoTls).await?;
                AsyncPgConnection::try_from_client_and_connection(client, connection).await
            }
        };
        conn.map_err(|err| anyhow!("failed to set up PostgreSQL connection: {err}"))
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await?;
        Ok(())
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}

/// `PGSSLROOTCERT` enables TLS; `PGSSLCERT`/`PGSSLKEY` add client auth and
/// must be set together.
struct TlsFiles<'a> {
    root: Option<&'a str>,
    cert: Option<&'a str>,
    key: Option<&'a str>,
}

impl<'a> TlsFiles<'a> {
    fn from_config(config: &'a AppConfig) -> Self {
        Self {
            root: config.pg_ssl_root_cert.as_deref(),
            cert: config.pg_ssl_cert.as_deref(),
            key: config.pg_ssl_key.as_deref(),
        }
    }

    fn connector(&self) -> Result<Option<MakeRustlsConnect>> {
        let Some(root) = self.root else {
            return Ok(None);
        };

        let mut roots = RootCertStore::empty();
        for cert in read_certs(root, "PGSSLROOTCERT")? {
            roots
                .add(cert)
                .map_err(|err| anyhow!("PGSSLROOTCERT holds an unusable certificate: {err}"))?;
        }
        let builder = ClientConfig::builder().with_root_certificates(roots);

        let tls = match (self.cert, self.key) {
            (None, None) => builder.with_no_client_auth(),
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(read_certs(cert, "PGSSLCERT")?, read_key(key)?)
                .context("PGSSLCERT and PGSSLKEY do not form a usable client identity")?,
            _ => bail!("PGSSLCERT and PGSSLKEY must be set together"),
        };
        Ok(Some(MakeRustlsConnect::new(tls)))
    }
}

fn open_pem(path: &str, var: &str) -> Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("cannot open {var} file '{path}'"))?;
    Ok(BufReader::new(file))
}

fn read_certs(path: &str, var: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open_pem(path, var)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("cannot parse {var} file '{path}'"))?;
    if certs.is_empty() {
        bail!("{var} file '{path}' holds no certificates");
    }
    Ok(certs)
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open_pem(path, "PGSSLKEY")?;
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("cannot parse PGSSLKEY file '{path}'"))?
        .with_context(|| format!("PGSSLKEY file '{path}' holds no private key"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_is_off_without_root_cert() {
        let config = AppConfig::embedded("postgres://localhost/reports".into());
        assert!(TlsFiles::from_config(&config).connector().unwrap().is_none());
    }

    #[test]
    fn unreadable_root_cert_names_the_variable() {
        let files = TlsFiles {
            root: Some("/nonexistent/root.pem"),
            cert: None,
            key: None,
        };
        match files.connector() {
            Err(err) => assert!(err.to_string().contains("PGSSLROOTCERT")),
            Ok(_) => panic!("missing root certificate should fail"),
        }
    }
}
