use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use parking_lot::Mutex;
use report_query::{
    auth::{JwtKeys, Principal, Role},
    backend::{Backends, DirectoryClient, GraphClient, SqlExecutor},
    cache::QueryCache,
    catalog::{DataSource, FieldCatalog},
    config::AppConfig,
    credentials::{Credential, StaticCredentials},
    definitions::DefinitionRegistry,
    history::MemoryHistoryStore,
    query::{GraphQuery, LdapQuery, QueryLimits, SqlQuery},
    reports::{CustomReports, MemoryReportStore},
    server::Server,
    service::{QueryService, QueryServiceParts},
    state::AppState,
    stats::ExecutionStats,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Once,
    },
    time::Duration,
};
use tower::ServiceExt;

static TRACING_INIT: Once = Once::new();

/// Error text the failing directory fake reports; it must never reach a client.
pub const DIRECTORY_FAILURE: &str = "bind rejected for CN=svc-reports: 52e invalid credentials";

/// Backend call counters, the last requests each fake saw, and switches that
/// make the directory fake misbehave.
#[derive(Default)]
pub struct Calls {
    pub sql: AtomicUsize,
    pub ldap: AtomicUsize,
    pub graph: AtomicUsize,
    pub last_ldap: Mutex<Option<LdapQuery>>,
    pub last_graph: Mutex<Option<GraphQuery>>,
    pub fail_directory: AtomicBool,
    pub directory_delay_ms: AtomicU64,
}

impl Calls {
    pub fn ldap(&self) -> usize {
        self.ldap.load(Ordering::SeqCst)
    }

    pub fn graph(&self) -> usize {
        self.graph.load(Ordering::SeqCst)
    }

    pub fn sql(&self) -> usize {
        self.sql.load(Ordering::SeqCst)
    }

    pub fn fail_directory(&self, fail: bool) {
        self.fail_directory.store(fail, Ordering::SeqCst);
    }

    pub fn delay_directory(&self, delay: Duration) {
        self.directory_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

struct FakeSql {
    calls: Arc<Calls>,
}

#[async_trait]
impl SqlExecutor for FakeSql {
    async fn query(&self, _query: &SqlQuery) -> anyhow::Result<Vec<Value>> {
        self.calls.sql.fetch_add(1, Ordering::SeqCst);
        Ok(vec![json!({
            "id": "2f1d7c36-1f55-4bb8-9d43-7d5b1b0c6a10",
            "query_id": "inactive_users",
            "user_id": "alice",
            "data_source": "ad",
            "status": "completed",
            "row_count": "2",
            "execution_time_ms": 15,
            "started_at": "2026-10-01T08:00:00Z"
        })])
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct FakeDirectory {
    calls: Arc<Calls>,
}

#[async_trait]
impl DirectoryClient for FakeDirectory {
    async fn search(&self, _credential: &Credential, query: &LdapQuery) -> anyhow::Result<Vec<Value>> {
        self.calls.ldap.fetch_add(1, Ordering::SeqCst);
        *self.calls.last_ldap.lock() = Some(query.clone());
        let delay = self.calls.directory_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.calls.fail_directory.load(Ordering::SeqCst) {
            anyhow::bail!(DIRECTORY_FAILURE);
        }
        Ok(vec![
            json!({
                "dn": "CN=John Doe,OU=Staff,DC=corp,DC=example",
                "sAMAccountName": ["jdoe"],
                "displayName": ["John Doe"],
                "mail": ["jdoe@corp.example"],
                "department": ["Finance"],
                "lastLogonTimestamp": ["132223104000000000"]
            }),
            json!({
                "dn": "CN=Ann Lee,OU=Staff,DC=corp,DC=example",
                "samaccountname": ["alee"],
                "displayName": ["Ann Lee"],
                "department": ["Engineering"]
            }),
        ])
    }

    async fn ping(&self, _credential: &Credential) -> anyhow::Result<()> {
        Ok(())
    }
}

struct FakeGraph {
    calls: Arc<Calls>,
}

#[async_trait]
impl GraphClient for FakeGraph {
    async fn get(&self, _credential: &Credential, query: &GraphQuery) -> anyhow::Result<Vec<Value>> {
        self.calls.graph.fetch_add(1, Ordering::SeqCst);
        *self.calls.last_graph.lock() = Some(query.clone());
        Ok(vec![json!({
            "displayName": "Guest One",
            "userPrincipalName": "guest_one#EXT#@corp.onmicrosoft.com",
            "mail": "guest@partner.example",
            "userType": "Guest",
            "accountEnabled": true,
            "createdDateTime": "2026-09-12T10:15:00Z"
        })])
    }

    async fn ping(&self, _credential: &Credential) -> anyhow::Result<()> {
        anyhow::bail!("tenant unreachable")
    }
}

fn credential(id: &str, source: DataSource) -> Credential {
    Credential {
        id: id.to_string(),
        user_id: None,
        data_source: source,
        tenant_id: Some("tenant".into()),
        client_id: Some("client".into()),
        username: Some("CN=svc-reports,DC=corp,DC=example".into()),
        secret: "secret".into(),
        endpoint: None,
        base_dn: Some("DC=corp,DC=example".into()),
        scopes: Vec::new(),
        is_default: true,
    }
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::embedded("postgres://localhost/report_query_test".into());
    config.max_batch_size = 5;
    config
}

/// Runs a test closure against the full router over in-memory stores and
/// fake backends.
pub async fn with_report_harness<F, Fut>(test: F)
where
    F: FnOnce(ReportTestHarness) -> Fut,
    Fut: Future<Output = ()>,
{
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });

    let config = Arc::new(test_config());
    let calls = Arc::new(Calls::default());
    let catalog = Arc::new(FieldCatalog::new(None));
    let definitions =
        Arc::new(DefinitionRegistry::builtin(&catalog).expect("built-in definitions should load"));
    let reports = Arc::new(CustomReports::new(
        Arc::new(MemoryReportStore::new()),
        Arc::clone(&catalog),
        QueryLimits::from(config.as_ref()),
    ));
    let credentials = StaticCredentials::new(vec![
        credential("env:ad", DataSource::Ad),
        credential("env:azure", DataSource::Azure),
        credential("env:o365", DataSource::O365),
    ]);

    let service = QueryService::new(QueryServiceParts {
        config: Arc::clone(&config),
        catalog,
        definitions,
        reports,
        credentials: Arc::new(credentials),
        backends: Backends {
            sql: Arc::new(FakeSql {
                calls: Arc::clone(&calls),
            }),
            directory: Arc::new(FakeDirectory {
                calls: Arc::clone(&calls),
            }),
            graph: Arc::new(FakeGraph {
                calls: Arc::clone(&calls),
            }),
        },
        history: Arc::new(MemoryHistoryStore::new()),
        cache: Arc::new(QueryCache::new(config.cache_ttl)),
        stats: Arc::new(ExecutionStats::new()),
    });

    let keys = JwtKeys::new(&config.jwt_secret);
    let state = AppState::new(config, Arc::new(service));
    let harness = ReportTestHarness {
        router: Server::from_state(state).router(),
        keys,
        calls,
    };
    test(harness).await;
}

pub struct ReportTestHarness {
    router: Router,
    keys: JwtKeys,
    pub calls: Arc<Calls>,
}

impl ReportTestHarness {
    pub fn token(&self, user_id: &str, role: Role) -> String {
        let principal = Principal {
            user_id: user_id.to_string(),
            role,
        };
        self.keys
            .issue(&principal, Duration::from_secs(300))
            .expect("token should sign")
    }

    pub async fn post<T: Serialize>(
        &self,
        path: &str,
        token: Option<&str>,
        payload: &T,
    ) -> http::Response<Body> {
        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        self.send("POST", path, token, Body::from(body)).await
    }

    pub async fn put<T: Serialize>(
        &self,
        path: &str,
        token: Option<&str>,
        payload: &T,
    ) -> http::Response<Body> {
        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        self.send("PUT", path, token, Body::from(body)).await
    }

    /// Sends a body verbatim, for payloads that are not valid JSON.
    pub async fn post_raw(&self, path: &str, token: Option<&str>, body: &str) -> http::Response<Body> {
        self.send("POST", path, token, Body::from(body.to_string()))
            .await
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> http::Response<Body> {
        self.send("GET", path, token, Body::empty()).await
    }

    pub async fn delete(&self, path: &str, token: Option<&str>) -> http::Response<Body> {
        self.send("DELETE", path, token, Body::empty()).await
    }

    async fn send(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Body,
    ) -> http::Response<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let request = builder.body(body).expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
