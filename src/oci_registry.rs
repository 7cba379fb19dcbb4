//! Registry transport: opening a client for a registry and listing repository tags

#[cfg(test)]
use mockall::automock;

use crate::config::Config;
use crate::secret::{Credentials, SecretString};
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, HeaderMap, LINK, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const DOCKER_HUB_URL: &str = "https://registry-1.docker.io";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{url} returned unexpected status {status}")]
    UnexpectedStatus { url: String, status: StatusCode },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Opens registry clients. Empty username and password request anonymous access.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn open(
        &self,
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn RegistryClient>, RegistryError>;
}

/// A client bound to one registry
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Lists every tag of a repository path such as `library/nginx`
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError>;
}

pub fn create_client(config: &Config) -> anyhow::Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder()
        .user_agent(concat!("kube-image-freshness/", env!("CARGO_PKG_VERSION")))
        .timeout(config.registry.timeout());

    for file_path in &config.registry.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

/// Registry transport speaking the OCI distribution API over HTTP
pub struct HttpRegistryTransport {
    http: Client,
}

impl HttpRegistryTransport {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl RegistryTransport for HttpRegistryTransport {
    async fn open(
        &self,
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn RegistryClient>, RegistryError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let credentials = Credentials::new(username, password);

        // 401 means the registry is up and wants a token, which list_tags negotiates
        let url = format!("{}/v2/", base_url);
        debug!("Pinging registry {}", url);
        let response = credentials.apply(self.http.get(&url)).send().await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::UNAUTHORIZED {
            return Err(RegistryError::UnexpectedStatus { url, status });
        }

        info!("Connected to registry {}", base_url);
        Ok(Arc::new(HttpRegistryClient {
            http: self.http.clone(),
            base_url,
            credentials,
            tokens: RwLock::new(HashMap::new()),
        }))
    }
}

#[derive(Debug)]
pub struct HttpRegistryClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
    /// Bearer tokens are scoped to a repository, so they are kept per repository path
    tokens: RwLock<HashMap<String, SecretString>>,
}

#[derive(Debug, Deserialize)]
struct TagList {
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        let mut url = format!("{}/v2/{}/tags/list", self.base_url, repository);
        let mut tags = Vec::new();

        loop {
            debug!("Fetching tags from {}", url);
            let response = self.authenticated_get(&url, repository).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(RegistryError::UnexpectedStatus { url, status });
            }

            let next = next_page_url(&self.base_url, response.headers())?;
            let page: TagList = response
                .json()
                .await
                .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;
            tags.extend(page.tags.unwrap_or_default());

            match next {
                Some(next) if next != url => url = next,
                _ => break,
            }
        }

        debug!("Found {} tags for {}", tags.len(), repository);
        Ok(tags)
    }
}

impl HttpRegistryClient {
    async fn send(&self, url: &str, token: Option<&SecretString>) -> Result<Response, RegistryError> {
        let request = self.http.get(url).header(ACCEPT, "application/json");
        let request = match token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => self.credentials.apply(request),
        };
        Ok(request.send().await?)
    }

    /// Sends a GET with the repository's token and, on a bearer challenge, fetches a
    /// new token for that repository and retries once with it
    async fn authenticated_get(&self, url: &str, repository: &str) -> Result<Response, RegistryError> {
        let cached = self.tokens.read().await.get(repository).cloned();
        let response = self.send(url, cached.as_ref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let header = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| RegistryError::Unauthorized(url.to_string()))?;
        let challenge = BearerChallenge::parse(header)?
            .ok_or_else(|| RegistryError::Unauthorized(url.to_string()))?;

        let token = self.fetch_token(&challenge).await?;
        self.tokens
            .write()
            .await
            .insert(repository.to_string(), token.clone());

        let response = self.send(url, Some(&token)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(RegistryError::Unauthorized(url.to_string()));
        }
        Ok(response)
    }

    async fn fetch_token(&self, challenge: &BearerChallenge) -> Result<SecretString, RegistryError> {
        debug!("Requesting registry token from {}", challenge.realm);
        let mut query = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &challenge.scope {
            query.push(("scope", scope.as_str()));
        }

        let request = self.http.get(&challenge.realm).query(&query);
        let response = self.credentials.apply(request).send().await?;
        if !response.status().is_success() {
            return Err(RegistryError::Unauthorized(format!(
                "token endpoint {} returned {}",
                challenge.realm,
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;
        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .map(SecretString::new)
            .ok_or_else(|| RegistryError::InvalidResponse("token response without token".into()))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    /// Parses `Bearer realm="..",service="..",scope=".."`. Other schemes yield `None`.
    fn parse(header: &str) -> Result<Option<Self>, RegistryError> {
        let Some(params) = header.strip_prefix("Bearer ") else {
            return Ok(None);
        };
        let re = Regex::new(r#"(\w+)="([^"]*)""#)
            .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for caps in re.captures_iter(params) {
            let value = caps[2].to_string();
            match &caps[1] {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Ok(realm.map(|realm| Self {
            realm,
            service,
            scope,
        }))
    }
}

/// Resolves the `rel="next"` target of a `Link` header against the registry base URL
fn next_page_url(base_url: &str, headers: &HeaderMap) -> Result<Option<String>, RegistryError> {
    let Some(link) = headers.get(LINK).and_then(|value| value.to_str().ok()) else {
        return Ok(None);
    };
    let re = Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#)
        .map_err(|e| RegistryError::InvalidResponse(e.to_string()))?;

    Ok(re.captures(link).map(|caps| {
        let target = &caps[1];
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            format!("{}{}", base_url, target)
        }
    }))
}
