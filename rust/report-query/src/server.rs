use crate::{
    backend::{
        graph::GraphHttpClient,
        ldap::{DirectoryDiscovery, LdapDirectoryClient},
        postgres::PgExecutor,
        Backends, SchemaDiscovery,
    },
    cache::QueryCache,
    catalog::{DataSource, FieldCatalog},
    config::AppConfig,
    credentials::{CredentialService, PgCredentialStore, StaticCredentials},
    db,
    definitions::DefinitionRegistry,
    history::{spawn_retention, PgHistoryStore},
    query::QueryLimits,
    reports::{CustomReports, PgReportStore},
    routes,
    service::{QueryService, QueryServiceParts},
    state::AppState,
    stats::ExecutionStats,
};
use anyhow::Context;
use axum::{
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    Router,
};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let pool = db::connect_pool(&config).await?;
        db::ensure_schema(&pool).await?;
        let config = Arc::new(config);

        let env_credentials = StaticCredentials::from_config(&config);
        let credentials: Arc<dyn CredentialService> = match config.credential_key.clone() {
            Some(key) => Arc::new(PgCredentialStore::new(pool.clone(), key, env_credentials.clone())),
            None => {
                warn!("REPORTQ_CREDENTIAL_KEY unset; only environment credentials are available");
                Arc::new(env_credentials.clone())
            }
        };

        let directory = Arc::new(LdapDirectoryClient::new(config.query_timeout));
        let graph = match &config.graph {
            Some(settings) => {
                GraphHttpClient::with_endpoints(config.query_timeout, &settings.base_url, &settings.authority)
            }
            None => GraphHttpClient::new(config.query_timeout),
        }
        .context("failed to build Microsoft Graph client")?;
        let backends = Backends {
            sql: Arc::new(PgExecutor::new(pool.clone())),
            directory: directory.clone(),
            graph: Arc::new(graph),
        };

        let discovery: Option<Arc<dyn SchemaDiscovery>> = match env_credentials
            .get_credential(None, DataSource::Ad, None)
            .await
        {
            Ok(credential) => Some(Arc::new(DirectoryDiscovery::new(
                directory,
                credential,
                config.ldap_size_limit,
            ))),
            Err(_) => None,
        };
        let catalog = Arc::new(FieldCatalog::new(discovery));
        let definitions = Arc::new(
            DefinitionRegistry::builtin(&catalog).context("built-in query definitions are invalid")?,
        );

        let reports = Arc::new(CustomReports::new(
            Arc::new(PgReportStore::new(pool.clone())),
            Arc::clone(&catalog),
            QueryLimits::from(config.as_ref()),
        ));
        let history = Arc::new(PgHistoryStore::new(pool));
        spawn_retention(history.clone(), config.history_retention_days, RETENTION_SWEEP_INTERVAL);

        let service = QueryService::new(QueryServiceParts {
            config: Arc::clone(&config),
            catalog,
            definitions: Arc::clone(&definitions),
            reports,
            credentials,
            backends,
            history,
            cache: Arc::new(QueryCache::new(config.cache_ttl)),
            stats: Arc::new(ExecutionStats::new()),
        });
        info!(definitions = definitions.len(), "report query service initialised");

        let state = AppState::new(Arc::clone(&config), Arc::new(service));
        Ok(Self { config, state })
    }

    pub fn from_state(state: AppState) -> Self {
        Self {
            config: Arc::clone(&state.config),
            state,
        }
    }

    pub fn router(&self) -> Router {
        let router = routes::router()
            .with_state(self.state.clone())
            .layer(TimeoutLayer::new(self.config.request_timeout))
            .layer(TraceLayer::new_for_http());

        match cors_layer(&self.config) {
            Some(cors) => router.layer(cors),
            None => router,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, "report query service listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

fn cors_layer(config: &AppConfig) -> Option<CorsLayer> {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .as_deref()?
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE]),
    )
}
