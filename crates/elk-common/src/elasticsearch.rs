//! Elasticsearch client for the appmetrics ELK connector.
//!
//! `DatastoreClient` is the seam the connector talks through; the
//! reqwest-backed `ElasticsearchClient` is the production implementation.
//! Requests carry an optional mapping type so the same calls serve every
//! datastore epoch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::debug;

use crate::DatastoreVersion;

/// Error type reported by Elasticsearch for a missing index.
pub const INDEX_NOT_FOUND: &str = "index_not_found_exception";

/// Errors that can occur during Elasticsearch operations.
#[derive(Debug, Error)]
pub enum ElasticsearchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Elasticsearch error: status {status}, {error_type}: {reason}")]
    Api {
        status: u16,
        error_type: String,
        reason: String,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ElasticsearchError {
    pub fn api(status: u16, error_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Api {
            status,
            error_type: error_type.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the target index does not exist.
    pub fn is_index_not_found(&self) -> bool {
        matches!(self, Self::Api { error_type, .. } if error_type == INDEX_NOT_FOUND)
    }
}

/// Configuration for the Elasticsearch client.
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    /// Base URL (e.g., "http://localhost:9200").
    pub url: String,
    /// Username for basic auth (optional).
    pub user: Option<String>,
    /// Password for basic auth (optional).
    pub password: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9200".to_string(),
            user: None,
            password: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Response of the root info endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClusterInfo {
    #[serde(default)]
    pub cluster_name: String,
    pub version: VersionInfo,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VersionInfo {
    pub number: String,
}

impl ClusterInfo {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            cluster_name: String::new(),
            version: VersionInfo {
                number: number.into(),
            },
        }
    }

    /// Major version epoch of the cluster.
    pub fn datastore_version(&self) -> Result<DatastoreVersion, ElasticsearchError> {
        DatastoreVersion::parse(&self.version.number).ok_or_else(|| {
            ElasticsearchError::InvalidResponse(format!(
                "unparseable version number '{}'",
                self.version.number
            ))
        })
    }
}

/// Put-mapping request.
#[derive(Debug, Clone, PartialEq)]
pub struct PutMapping {
    pub index: String,
    /// Mapping type; `None` targets the typeless endpoint.
    pub doc_type: Option<String>,
    pub body: Value,
}

/// Single document index/upsert request.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub index: String,
    pub doc_type: Option<String>,
    pub id: Option<String>,
    pub body: Value,
}

/// One action/document pair of a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOperation {
    pub action: Value,
    pub source: Value,
}

/// Ordered sequence of bulk operations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BulkRequest {
    pub operations: Vec<BulkOperation>,
}

impl BulkRequest {
    pub fn new(operations: Vec<BulkOperation>) -> Self {
        Self { operations }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Renders the newline-delimited body expected by `/_bulk`.
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut body = String::new();
        for op in &self.operations {
            body.push_str(&serde_json::to_string(&op.action)?);
            body.push('\n');
            body.push_str(&serde_json::to_string(&op.source)?);
            body.push('\n');
        }
        Ok(body)
    }
}

/// Summary of a bulk response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BulkResponse {
    pub took: u64,
    /// Number of items acknowledged.
    pub items: usize,
    /// Number of items the datastore rejected.
    pub failed: usize,
}

/// Zero-hit probe: does `index` hold any document matching `query`?
#[derive(Debug, Clone, PartialEq)]
pub struct SearchProbe {
    pub index: String,
    pub doc_type: Option<String>,
    pub query: Value,
}

/// Operations the connector needs from the datastore.
#[async_trait]
pub trait DatastoreClient: Send + Sync {
    /// Queries cluster info, including the dotted version string.
    async fn info(&self) -> Result<ClusterInfo, ElasticsearchError>;

    async fn index_exists(&self, index: &str) -> Result<bool, ElasticsearchError>;

    async fn create_index(&self, index: &str) -> Result<(), ElasticsearchError>;

    async fn put_mapping(&self, request: &PutMapping) -> Result<(), ElasticsearchError>;

    async fn index_document(&self, request: &IndexDocument) -> Result<(), ElasticsearchError>;

    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse, ElasticsearchError>;

    /// Returns the number of hits for the probe, stopping after the first.
    async fn count_hits(&self, probe: &SearchProbe) -> Result<u64, ElasticsearchError>;
}

/// reqwest-backed Elasticsearch client.
#[derive(Debug, Clone)]
pub struct ElasticsearchClient {
    http: Client,
    config: ElasticsearchConfig,
}

impl ElasticsearchClient {
    /// Creates a new client with the given configuration.
    pub fn new(config: ElasticsearchConfig) -> Result<Self, ElasticsearchError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { http, config })
    }

    /// Creates a client with default configuration.
    pub fn with_defaults() -> Result<Self, ElasticsearchError> {
        Self::new(ElasticsearchConfig::default())
    }

    pub fn config(&self) -> &ElasticsearchConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match self.config.user {
            Some(ref user) => builder.basic_auth(user, self.config.password.as_deref()),
            None => builder,
        }
    }

    /// Maps non-success responses to `ElasticsearchError::Api`.
    async fn check(response: Response) -> Result<Response, ElasticsearchError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(api_error(status, &body))
    }
}

/// Extracts the error type and reason from an Elasticsearch error body.
fn api_error(status: StatusCode, body: &str) -> ElasticsearchError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let (error_type, reason) = match error {
        Some(Value::Object(err)) => (
            err.get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            err.get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        // 1.x clusters report errors as plain strings
        Some(Value::String(reason)) => ("unknown".to_string(), reason.clone()),
        _ => ("unknown".to_string(), body.to_string()),
    };

    ElasticsearchError::api(status.as_u16(), error_type, reason)
}

fn document_path(request: &IndexDocument) -> (Method, String) {
    let doc_type = request.doc_type.as_deref().unwrap_or("_doc");
    match request.id {
        Some(ref id) => (Method::PUT, format!("{}/{}/{}", request.index, doc_type, id)),
        None => (Method::POST, format!("{}/{}", request.index, doc_type)),
    }
}

fn mapping_path(request: &PutMapping) -> String {
    match request.doc_type {
        Some(ref doc_type) => format!("{}/_mapping/{}", request.index, doc_type),
        None => format!("{}/_mapping", request.index),
    }
}

fn search_path(probe: &SearchProbe) -> String {
    match probe.doc_type {
        Some(ref doc_type) => format!("{}/{}/_search", probe.index, doc_type),
        None => format!("{}/_search", probe.index),
    }
}

#[derive(Debug, Deserialize)]
struct RawBulkResponse {
    #[serde(default)]
    took: u64,
    #[serde(default)]
    items: Vec<Map<String, Value>>,
}

impl From<RawBulkResponse> for BulkResponse {
    fn from(raw: RawBulkResponse) -> Self {
        let failed = raw
            .items
            .iter()
            .filter(|item| item.values().any(item_failed))
            .count();

        Self {
            took: raw.took,
            items: raw.items.len(),
            failed,
        }
    }
}

fn item_failed(result: &Value) -> bool {
    result.get("error").is_some()
        || result
            .get("status")
            .and_then(Value::as_u64)
            .is_some_and(|status| status >= 300)
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    total: HitsTotal,
}

/// `hits.total` is a number before 7.x and an object afterwards.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HitsTotal {
    Count(u64),
    Object { value: u64 },
}

impl HitsTotal {
    fn value(&self) -> u64 {
        match self {
            HitsTotal::Count(n) => *n,
            HitsTotal::Object { value } => *value,
        }
    }
}

#[async_trait]
impl DatastoreClient for ElasticsearchClient {
    async fn info(&self) -> Result<ClusterInfo, ElasticsearchError> {
        let response = self.request(Method::GET, "").send().await?;
        let info = Self::check(response).await?.json::<ClusterInfo>().await?;
        debug!(version = %info.version.number, "Fetched cluster info");
        Ok(info)
    }

    async fn index_exists(&self, index: &str) -> Result<bool, ElasticsearchError> {
        let response = self.request(Method::HEAD, index).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(ElasticsearchError::api(
                status.as_u16(),
                "unknown",
                format!("unexpected status checking index '{index}'"),
            )),
        }
    }

    async fn create_index(&self, index: &str) -> Result<(), ElasticsearchError> {
        let response = self.request(Method::PUT, index).send().await?;
        Self::check(response).await?;
        debug!(index = %index, "Created index");
        Ok(())
    }

    async fn put_mapping(&self, request: &PutMapping) -> Result<(), ElasticsearchError> {
        let response = self
            .request(Method::PUT, &mapping_path(request))
            .json(&request.body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn index_document(&self, request: &IndexDocument) -> Result<(), ElasticsearchError> {
        let (method, path) = document_path(request);
        let response = self
            .request(method, &path)
            .json(&request.body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn bulk(&self, request: &BulkRequest) -> Result<BulkResponse, ElasticsearchError> {
        let body = request.to_ndjson()?;
        let response = self
            .request(Method::POST, "_bulk")
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let raw = Self::check(response)
            .await?
            .json::<RawBulkResponse>()
            .await?;
        Ok(raw.into())
    }

    async fn count_hits(&self, probe: &SearchProbe) -> Result<u64, ElasticsearchError> {
        let response = self
            .request(Method::POST, &search_path(probe))
            .query(&[("size", "0"), ("terminate_after", "1")])
            .json(&json!({ "query": probe.query }))
            .send()
            .await?;
        let search = Self::check(response)
            .await?
            .json::<SearchResponse>()
            .await?;
        Ok(search.hits.total.value())
    }
}
