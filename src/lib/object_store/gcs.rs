use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use crate::{
    config::GcpConfig,
    error::{Result, StoreError},
    gcp::{self, TokenSource},
};

use super::{ObjectMeta, ObjectStore, Precondition, PutOptions, StoredObject};

/// Google Cloud Storage through the JSON API.
pub struct GcsStore {
    bucket: String,
    endpoint: String,
    client: Client,
    tokens: Arc<TokenSource>,
}

/// Object resource as returned by the JSON API; 64-bit fields arrive as
/// strings.
#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
    generation: String,
    metageneration: String,
    #[serde(default)]
    size: Option<String>,
    updated: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    items: Vec<ObjectResource>,
    next_page_token: Option<String>,
}

impl ObjectResource {
    fn into_meta(self) -> Result<ObjectMeta> {
        let parse = |field: &str, value: &str| {
            value.parse::<i64>().map_err(|_| {
                StoreError::Storage(format!("gcs returned non-numeric {field} '{value}'"))
            })
        };
        Ok(ObjectMeta {
            generation: parse("generation", &self.generation)?,
            metageneration: parse("metageneration", &self.metageneration)?,
            size: self
                .size
                .as_deref()
                .and_then(|size| size.parse().ok())
                .unwrap_or(0),
            updated: self.updated,
            name: self.name,
        })
    }
}

impl GcsStore {
    pub fn new(bucket: &str, gcp: &GcpConfig, tokens: Arc<TokenSource>) -> Result<Self> {
        if bucket.is_empty() {
            return Err(StoreError::Config("gcs bucket name cannot be empty".into()));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            endpoint: gcp::storage_endpoint(gcp),
            client: gcp::http_client(gcp)?,
            tokens,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|err| StoreError::Config(format!("invalid storage endpoint: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Config("storage endpoint cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, path: &str) -> Result<Url> {
        self.url(&["storage", "v1", "b", &self.bucket, "o", path])
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        Ok(match self.tokens.token().await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }

    async fn send(&self, request: RequestBuilder, operation: &str, path: &str) -> Result<Response> {
        self.authorized(request)
            .await?
            .send()
            .await
            .map_err(|err| StoreError::Storage(format!("gcs {operation} {path} failed: {err}")))
    }

    async fn stat_inner(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let url = self.object_url(path)?;
        let response = self.send(self.client.get(url), "stat", path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check(response, "stat", path).await?;
        let resource: ObjectResource = decode(response, "stat", path).await?;
        resource.into_meta().map(Some)
    }
}

async fn check(response: Response, operation: &str, path: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::PRECONDITION_FAILED {
        return Err(StoreError::PreconditionFailed {
            path: path.to_string(),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Storage(format!(
        "gcs {operation} {path} returned {status}: {}",
        body.trim()
    )))
}

async fn decode<T: for<'de> Deserialize<'de>>(
    response: Response,
    operation: &str,
    path: &str,
) -> Result<T> {
    response.json().await.map_err(|err| {
        StoreError::Storage(format!("gcs {operation} {path} returned invalid json: {err}"))
    })
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn name(&self) -> &'static str {
        "gcs"
    }

    fn bucket(&self) -> Option<&str> {
        Some(&self.bucket)
    }

    async fn get(&self, path: &str) -> Result<Option<StoredObject>> {
        // Metadata first, then the media of exactly that generation, so the
        // body and version fields always describe the same object.
        let Some(meta) = self.stat_inner(path).await? else {
            return Ok(None);
        };
        let mut url = self.object_url(path)?;
        url.query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("generation", &meta.generation.to_string());
        let response = self.send(self.client.get(url), "read", path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(path, generation = meta.generation, "object replaced during read");
            return Err(StoreError::PreconditionFailed {
                path: path.to_string(),
            });
        }
        let response = check(response, "read", path).await?;
        let body = response
            .bytes()
            .await
            .map_err(|err| StoreError::Storage(format!("gcs read {path} failed: {err}")))?;
        Ok(Some(StoredObject {
            meta,
            body: body.to_vec(),
        }))
    }

    async fn put(&self, path: &str, body: Vec<u8>, options: PutOptions) -> Result<ObjectMeta> {
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("uploadType", "media").append_pair("name", path);
            match options.precondition {
                Some(Precondition::DoesNotExist) => {
                    query.append_pair("ifGenerationMatch", "0");
                }
                Some(Precondition::GenerationMatch(generation)) => {
                    query.append_pair("ifGenerationMatch", &generation.to_string());
                }
                Some(Precondition::MetagenerationMatch(metageneration)) => {
                    query.append_pair("ifMetagenerationMatch", &metageneration.to_string());
                }
                None => {}
            }
        }
        let request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, options.content_type)
            .body(body);
        let response = self.send(request, "write", path).await?;
        let response = check(response, "write", path).await?;
        let resource: ObjectResource = decode(response, "write", path).await?;
        resource.into_meta()
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut listed = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.url(&["storage", "v1", "b", &self.bucket, "o"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                query.append_pair(
                    "fields",
                    "items(name,generation,metageneration,size,updated),nextPageToken",
                );
                if let Some(token) = page_token.as_deref() {
                    query.append_pair("pageToken", token);
                }
            }
            let response = self.send(self.client.get(url), "list", prefix).await?;
            let response = check(response, "list", prefix).await?;
            let page: ListPage = decode(response, "list", prefix).await?;
            for item in page.items {
                listed.push(item.into_meta()?);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        listed.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listed)
    }

    async fn delete(&self, path: &str) -> Result<bool> {
        let url = self.object_url(path)?;
        let response = self.send(self.client.delete(url), "delete", path).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response, "delete", path).await?;
        Ok(true)
    }

    async fn stat(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.stat_inner(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GcsStore {
        let gcp = GcpConfig {
            storage_endpoint: Some("http://127.0.0.1:4443".into()),
            ..GcpConfig::default()
        };
        GcsStore::new("ventures-dev", &gcp, Arc::new(TokenSource::anonymous())).unwrap()
    }

    #[test]
    fn object_names_are_a_single_encoded_segment() {
        let url = store()
            .object_url("env/dev/snapshots/ideas/I 1.json")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:4443/storage/v1/b/ventures-dev/o/env%2Fdev%2Fsnapshots%2Fideas%2FI%201.json"
        );
    }

    #[test]
    fn resources_parse_string_encoded_versions() {
        let resource: ObjectResource = serde_json::from_value(serde_json::json!({
            "name": "a.json",
            "generation": "1712345678901234",
            "metageneration": "1",
            "size": "42",
            "updated": "2025-01-01T00:00:00.000Z"
        }))
        .unwrap();
        let meta = resource.into_meta().unwrap();
        assert_eq!(meta.generation, 1_712_345_678_901_234);
        assert_eq!(meta.metageneration, 1);
        assert_eq!(meta.size, 42);
    }
}
