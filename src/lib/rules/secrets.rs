use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::{
    config::{Config, GcpConfig},
    error::{Result, StoreError},
    gcp::{self, TokenSource},
};

/// Resolves the reference part of a `secret:` action target.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolves a reference such as `webhook-url` or
    /// `projects/p/secrets/webhook-url/versions/3` to its plaintext value.
    async fn resolve(&self, reference: &str) -> Result<String>;
}

/// Secrets listed in `[rules.secrets]`, keyed by the reference as written.
#[derive(Debug, Clone, Default)]
pub struct StaticSecrets {
    values: BTreeMap<String, String>,
}

impl StaticSecrets {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    fn lookup(&self, reference: &str) -> Option<&String> {
        self.values.get(reference)
    }
}

#[async_trait]
impl SecretResolver for StaticSecrets {
    async fn resolve(&self, reference: &str) -> Result<String> {
        self.lookup(reference)
            .cloned()
            .ok_or_else(|| StoreError::Secret(format!("secret '{reference}' is not configured")))
    }
}

#[derive(Deserialize)]
struct AccessResponse {
    payload: SecretPayload,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: String,
}

/// Reads secret versions through the Secret Manager REST API.
pub struct GcpSecretManager {
    client: Client,
    endpoint: String,
    project: Option<String>,
    tokens: Arc<TokenSource>,
}

impl GcpSecretManager {
    pub fn new(gcp: &GcpConfig, tokens: Arc<TokenSource>) -> Result<Self> {
        Ok(Self {
            client: gcp::http_client(gcp)?,
            endpoint: gcp::secret_manager_endpoint(gcp),
            project: gcp.project.clone(),
            tokens,
        })
    }

    /// Expands a short name with the configured project and `latest`.
    pub fn version_name(&self, reference: &str) -> Result<String> {
        expand_reference(reference, self.project.as_deref())
    }
}

pub fn expand_reference(reference: &str, project: Option<&str>) -> Result<String> {
    let reference = reference.trim().trim_matches('/');
    if reference.is_empty() {
        return Err(StoreError::Secret("secret reference is empty".into()));
    }
    if reference.starts_with("projects/") {
        let parts: Vec<&str> = reference.split('/').collect();
        return match parts.as_slice() {
            ["projects", _, "secrets", _] => Ok(format!("{reference}/versions/latest")),
            ["projects", _, "secrets", _, "versions", _] => Ok(reference.to_string()),
            _ => Err(StoreError::Secret(format!(
                "'{reference}' is not a secret version name"
            ))),
        };
    }
    if reference.contains('/') {
        return Err(StoreError::Secret(format!(
            "'{reference}' is neither a short secret name nor a full resource name"
        )));
    }
    let project = project.ok_or_else(|| {
        StoreError::Secret(format!(
            "secret '{reference}' needs gcp.project to be configured"
        ))
    })?;
    Ok(format!("projects/{project}/secrets/{reference}/versions/latest"))
}

#[async_trait]
impl SecretResolver for GcpSecretManager {
    async fn resolve(&self, reference: &str) -> Result<String> {
        let name = self.version_name(reference)?;
        let url = format!("{}/v1/{name}:access", self.endpoint);
        let mut request = self.client.get(&url);
        if let Some(token) = self.tokens.token().await? {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| StoreError::Secret(format!("accessing {name} failed: {err}")))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::Secret(format!("secret {name} does not exist")));
        }
        if !status.is_success() {
            return Err(StoreError::Secret(format!(
                "secret manager returned {status} for {name}"
            )));
        }
        let body: AccessResponse = response
            .json()
            .await
            .map_err(|err| StoreError::Secret(format!("invalid response for {name}: {err}")))?;
        let bytes = STANDARD
            .decode(body.payload.data.trim())
            .map_err(|err| StoreError::Secret(format!("payload of {name} is not base64: {err}")))?;
        debug!(secret = %name, "resolved secret");
        String::from_utf8(bytes)
            .map_err(|_| StoreError::Secret(format!("payload of {name} is not utf-8")))
    }
}

/// Local table first, Secret Manager for anything it does not name.
pub struct LayeredSecrets {
    local: StaticSecrets,
    remote: Option<GcpSecretManager>,
}

impl LayeredSecrets {
    pub fn new(local: StaticSecrets, remote: Option<GcpSecretManager>) -> Self {
        Self { local, remote }
    }
}

#[async_trait]
impl SecretResolver for LayeredSecrets {
    async fn resolve(&self, reference: &str) -> Result<String> {
        if let Some(value) = self.local.lookup(reference) {
            return Ok(value.clone());
        }
        match &self.remote {
            Some(remote) => remote.resolve(reference).await,
            None => self.local.resolve(reference).await,
        }
    }
}

/// Builds the resolver for a service: the static table, backed by Secret
/// Manager whenever a project or endpoint is configured.
pub fn from_config(config: &Config) -> Result<Arc<dyn SecretResolver>> {
    let local = StaticSecrets::new(config.rules.secrets.clone());
    let gcp = &config.gcp;
    let remote = if gcp.project.is_some() || gcp.secret_manager_endpoint.is_some() {
        let tokens = Arc::new(TokenSource::from_config(gcp));
        Some(GcpSecretManager::new(gcp, tokens)?)
    } else {
        None
    };
    Ok(Arc::new(LayeredSecrets::new(local, remote)))
}
