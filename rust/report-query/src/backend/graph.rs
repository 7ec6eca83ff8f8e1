use super::GraphClient;
use crate::{
    config::{DEFAULT_GRAPH_AUTHORITY, DEFAULT_GRAPH_BASE_URL},
    credentials::Credential,
    query::GraphQuery,
};
use anyhow::{bail, Context};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tracing::debug;

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct GraphErrorResponse {
    error: GraphErrorDetails,
}

#[derive(Debug, Deserialize)]
struct GraphErrorDetails {
    code: String,
    message: String,
}

/// Microsoft Graph over HTTPS with the OAuth2 client-credentials flow.
pub struct GraphHttpClient {
    client: Client,
    base_url: String,
    authority: String,
    tokens: RwLock<HashMap<String, CachedToken>>,
}

impl GraphHttpClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Self::with_endpoints(timeout, DEFAULT_GRAPH_BASE_URL, DEFAULT_GRAPH_AUTHORITY)
    }

    pub fn with_endpoints(timeout: Duration, base_url: &str, authority: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build Graph HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            authority: authority.trim_end_matches('/').to_string(),
            tokens: RwLock::new(HashMap::new()),
        })
    }

    fn base_url<'a>(&'a self, credential: &'a Credential) -> &'a str {
        credential
            .endpoint
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .unwrap_or(&self.base_url)
    }

    async fn access_token(&self, credential: &Credential) -> anyhow::Result<String> {
        let tenant = credential
            .tenant_id
            .as_deref()
            .context("graph credential has no tenant id")?;
        let client_id = credential
            .client_id
            .as_deref()
            .context("graph credential has no client id")?;
        let cache_key = format!("{tenant}/{client_id}");

        if let Some(token) = self.tokens.read().get(&cache_key) {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.access_token.clone());
            }
        }

        let scope = if credential.scopes.is_empty() {
            format!("{}/.default", resource_root(self.base_url(credential)))
        } else {
            credential.scopes.join(" ")
        };
        let url = format!("{}/{tenant}/oauth2/v2.0/token", self.authority);
        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id),
                ("client_secret", credential.secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await
            .context("token request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("token request returned {status}: {body}");
        }

        let token: TokenResponse = response.json().await.context("invalid token response")?;
        self.tokens.write().insert(
            cache_key,
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at: Instant::now() + Duration::from_secs(token.expires_in),
            },
        );
        debug!(tenant = %tenant, "acquired graph access token");
        Ok(token.access_token)
    }

    async fn send(&self, token: &str, url: &str, params: &[(String, String)], eventual: bool) -> anyhow::Result<Value> {
        let mut request = self.client.get(url).bearer_auth(token);
        if !params.is_empty() {
            request = request.query(params);
        }
        if eventual {
            request = request.header("ConsistencyLevel", "eventual");
        }
        let response = request.send().await.context("graph request failed")?;
        read_body(response).await
    }
}

async fn read_body(response: Response) -> anyhow::Result<Value> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("invalid graph response body");
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<GraphErrorResponse>(&body) {
        Ok(parsed) => bail!(
            "graph returned {status}: {} ({})",
            parsed.error.message,
            parsed.error.code
        ),
        Err(_) => bail!("graph returned {status}: {body}"),
    }
}

fn resource_root(base_url: &str) -> &str {
    let host_start = base_url.find("://").map_or(0, |idx| idx + 3);
    match base_url[host_start..].find('/') {
        Some(path) => &base_url[..host_start + path],
        None => base_url,
    }
}

#[async_trait]
impl GraphClient for GraphHttpClient {
    async fn get(&self, credential: &Credential, query: &GraphQuery) -> anyhow::Result<Vec<Value>> {
        let token = self.access_token(credential).await?;
        let mut url = format!(
            "{}/{}",
            self.base_url(credential),
            query.path.trim_start_matches('/')
        );
        let mut params = query.params.as_slice();
        let mut rows = Vec::new();

        loop {
            let body = self
                .send(&token, &url, params, query.eventual_consistency)
                .await?;
            let next = body
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);

            match body {
                Value::Object(mut object) => match object.remove("value") {
                    Some(Value::Array(page)) => rows.extend(page),
                    _ => rows.push(Value::Object(object)),
                },
                other => bail!("unexpected graph response: {other}"),
            }

            if rows.len() >= query.max_rows {
                rows.truncate(query.max_rows);
                break;
            }
            match next {
                // nextLink already carries the original query options.
                Some(link) => {
                    url = link;
                    params = &[];
                }
                None => break,
            }
        }

        debug!(path = %query.path, rows = rows.len(), "graph query complete");
        Ok(rows)
    }

    async fn ping(&self, credential: &Credential) -> anyhow::Result<()> {
        let token = self.access_token(credential).await?;
        let url = format!("{}/organization", self.base_url(credential));
        let params = [
            ("$select".to_string(), "id".to_string()),
            ("$top".to_string(), "1".to_string()),
        ];
        self.send(&token, &url, &params, false).await?;
        Ok(())
    }
}
