use std::{env, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::{
    config::GcpConfig,
    error::{Result, StoreError},
};

const DEFAULT_STORAGE_ENDPOINT: &str = "https://storage.googleapis.com";
const DEFAULT_SECRET_MANAGER_ENDPOINT: &str = "https://secretmanager.googleapis.com";
const DEFAULT_METADATA_ENDPOINT: &str = "http://metadata.google.internal";
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";
// Refresh this long before the metadata server says the token expires.
const EXPIRY_SLACK_SECS: i64 = 60;

pub fn storage_endpoint(gcp: &GcpConfig) -> String {
    if let Some(endpoint) = gcp.storage_endpoint.as_deref() {
        return with_scheme(endpoint);
    }
    match env::var("STORAGE_EMULATOR_HOST") {
        Ok(host) if !host.trim().is_empty() => with_scheme(host.trim()),
        _ => DEFAULT_STORAGE_ENDPOINT.to_string(),
    }
}

/// Emulators speak plain HTTP and accept unauthenticated requests.
pub fn storage_is_emulated(gcp: &GcpConfig) -> bool {
    storage_endpoint(gcp).starts_with("http://")
}

pub fn secret_manager_endpoint(gcp: &GcpConfig) -> String {
    gcp.secret_manager_endpoint
        .as_deref()
        .map(with_scheme)
        .unwrap_or_else(|| DEFAULT_SECRET_MANAGER_ENDPOINT.to_string())
}

pub fn http_client(gcp: &GcpConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(gcp.request_timeout_secs.max(1)))
        .build()
        .map_err(|err| StoreError::Config(format!("failed to build http client: {err}")))
}

fn with_scheme(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

enum TokenMode {
    Anonymous,
    Fixed(String),
    Metadata { client: Client, endpoint: String },
}

struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: i64,
}

/// Supplies bearer tokens for Google APIs. Metadata-server tokens are cached
/// until shortly before they expire.
pub struct TokenSource {
    mode: TokenMode,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenSource {
    pub fn anonymous() -> Self {
        Self::with_mode(TokenMode::Anonymous)
    }

    pub fn fixed(token: impl Into<String>) -> Self {
        Self::with_mode(TokenMode::Fixed(token.into()))
    }

    pub fn metadata(client: Client, endpoint: impl Into<String>) -> Self {
        Self::with_mode(TokenMode::Metadata {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// `GOOGLE_OAUTH_ACCESS_TOKEN` wins; emulated storage needs no token;
    /// otherwise tokens come from the metadata server (`GCE_METADATA_HOST`
    /// overrides its address).
    pub fn from_config(gcp: &GcpConfig) -> Self {
        if let Ok(token) = env::var("GOOGLE_OAUTH_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                return Self::fixed(token.trim());
            }
        }
        if storage_is_emulated(gcp) {
            return Self::anonymous();
        }
        let endpoint = gcp
            .metadata_endpoint
            .clone()
            .or_else(|| env::var("GCE_METADATA_HOST").ok())
            .map(|host| with_scheme(&host))
            .unwrap_or_else(|| DEFAULT_METADATA_ENDPOINT.to_string());
        match http_client(gcp) {
            Ok(client) => Self::metadata(client, endpoint),
            Err(_) => Self::anonymous(),
        }
    }

    fn with_mode(mode: TokenMode) -> Self {
        Self {
            mode,
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<Option<String>> {
        let (client, endpoint) = match &self.mode {
            TokenMode::Anonymous => return Ok(None),
            TokenMode::Fixed(token) => return Ok(Some(token.clone())),
            TokenMode::Metadata { client, endpoint } => (client, endpoint),
        };

        if let Some(cached) = self.cached.lock().as_ref() {
            if cached.expires_at > Utc::now() {
                return Ok(Some(cached.value.clone()));
            }
        }

        let url = format!("{endpoint}{TOKEN_PATH}");
        let response = client
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| StoreError::Storage(format!("metadata token request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(StoreError::Storage(format!(
                "metadata server returned {} for token request",
                response.status()
            )));
        }
        let token: MetadataToken = response
            .json()
            .await
            .map_err(|err| StoreError::Storage(format!("invalid metadata token: {err}")))?;
        let lifetime = (token.expires_in - EXPIRY_SLACK_SECS).max(0);
        let expires_at = Utc::now() + chrono::Duration::seconds(lifetime);
        debug!(expires_at = %expires_at, "refreshed metadata access token");

        *self.cached.lock() = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at,
        });
        Ok(Some(token.access_token))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use axum::{Json, Router, http::HeaderMap, routing::get};
    use serde_json::json;

    use super::*;

    #[test]
    fn explicit_endpoints_get_a_scheme() {
        let gcp = GcpConfig {
            storage_endpoint: Some("localhost:4443/".into()),
            secret_manager_endpoint: Some("https://sm.example.test".into()),
            ..GcpConfig::default()
        };
        assert_eq!(storage_endpoint(&gcp), "http://localhost:4443");
        assert!(storage_is_emulated(&gcp));
        assert_eq!(secret_manager_endpoint(&gcp), "https://sm.example.test");
    }

    #[tokio::test]
    async fn fixed_and_anonymous_sources() {
        assert_eq!(
            TokenSource::fixed("abc").token().await.unwrap(),
            Some("abc".to_string())
        );
        assert_eq!(TokenSource::anonymous().token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn metadata_tokens_are_cached() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            TOKEN_PATH,
            get(move |headers: HeaderMap| {
                let counter = Arc::clone(&counter);
                async move {
                    assert_eq!(
                        headers.get("Metadata-Flavor").and_then(|v| v.to_str().ok()),
                        Some("Google")
                    );
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "access_token": "ya29.test",
                        "expires_in": 3599,
                        "token_type": "Bearer"
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let source = TokenSource::metadata(Client::new(), format!("http://{addr}"));
        for _ in 0..3 {
            assert_eq!(
                source.token().await.unwrap().as_deref(),
                Some("ya29.test")
            );
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
