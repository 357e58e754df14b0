use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;
use user_pipeline::error::SinkError;
use user_pipeline::{BulkSink, Record, User};

use crate::config::ElasticConfig;
use crate::mapping;

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("no elasticsearch hosts configured")]
    NoHosts,
    #[error("invalid elasticsearch host {host}: {error}")]
    InvalidHost {
        host: String,
        #[source]
        error: url::ParseError,
    },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{action} failed with {status}: {body}")]
    UnexpectedStatus {
        action: &'static str,
        status: StatusCode,
        body: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSetup {
    Existing,
    Created,
}

/// Per-host URLs, resolved once so requests never fail on URL building.
struct Endpoint {
    index: Url,
    bulk: Url,
}

/// Bulk-indexes users into one Elasticsearch index, spreading requests over
/// the configured hosts.
pub struct ElasticSink {
    http: Client,
    endpoints: Vec<Endpoint>,
    next_endpoint: AtomicUsize,
    credentials: Option<(String, Option<String>)>,
    index: String,
}

impl ElasticSink {
    pub fn new(config: &ElasticConfig) -> Result<Self, SetupError> {
        let index = config.elasticsearch_index.clone();
        let endpoints = config
            .hosts()
            .into_iter()
            .map(|host| endpoint(host, &index))
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(SetupError::NoHosts);
        }

        let http = Client::builder()
            .timeout(config.elasticsearch_timeout_ms.0)
            .danger_accept_invalid_certs(config.elasticsearch_accept_invalid_certs)
            .build()?;

        let credentials = config
            .elasticsearch_user
            .clone()
            .map(|user| (user, config.elasticsearch_password.clone()));

        Ok(Self {
            http,
            endpoints,
            next_endpoint: AtomicUsize::new(0),
            credentials,
            index,
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    /// Creates the index with the users mapping unless it already exists.
    /// Losing a creation race to another consumer counts as existing.
    pub async fn ensure_index(&self) -> Result<IndexSetup, SetupError> {
        let endpoint = self.endpoint();
        let exists = self.authorize(self.http.head(endpoint.index.clone())).send().await?;
        match exists.status() {
            StatusCode::OK => {
                info!(index = %self.index, "search index already exists");
                return Ok(IndexSetup::Existing);
            }
            StatusCode::NOT_FOUND => {}
            status => {
                return Err(SetupError::UnexpectedStatus {
                    action: "checking index",
                    status,
                    body: exists.text().await.unwrap_or_default(),
                })
            }
        }

        let created = self
            .authorize(self.http.put(endpoint.index.clone()))
            .json(&mapping::users_index())
            .send()
            .await?;
        let status = created.status();
        if status.is_success() {
            info!(index = %self.index, "created search index");
            return Ok(IndexSetup::Created);
        }

        let body = created.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            info!(index = %self.index, "search index was created concurrently");
            return Ok(IndexSetup::Existing);
        }
        Err(SetupError::UnexpectedStatus {
            action: "creating index",
            status,
            body,
        })
    }

    fn endpoint(&self) -> &Endpoint {
        let next = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        &self.endpoints[next % self.endpoints.len()]
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, password.as_ref()),
            None => request,
        }
    }
}

fn endpoint(host: &str, index: &str) -> Result<Endpoint, SetupError> {
    let invalid = |error| SetupError::InvalidHost {
        host: host.to_owned(),
        error,
    };
    // Without a trailing slash, join would replace the last path segment
    let base = match host.ends_with('/') {
        true => Url::parse(host),
        false => Url::parse(&format!("{host}/")),
    }
    .map_err(invalid)?;

    Ok(Endpoint {
        index: base.join(index).map_err(invalid)?,
        bulk: base.join("_bulk").map_err(invalid)?,
    })
}

/// NDJSON body with one index action per record. Documents are keyed by user
/// id, so a redelivered record replaces its earlier version.
pub fn bulk_body(index: &str, records: &[Record<User>]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for record in records {
        let action = json!({ "index": { "_index": index, "_id": record.key().to_string() } });
        // Writing into a String can't fail
        _ = writeln!(body, "{}", action);
        _ = writeln!(body, "{}", serde_json::to_string(record.payload())?);
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn status_error(status: StatusCode, body: &str) -> SinkError {
    let message = format!("bulk request failed with {status}: {body}");
    match is_retryable_status(status) {
        true => SinkError::Retryable(message),
        false => SinkError::Fatal(message),
    }
}

/// A bulk call can succeed as a whole while individual items fail. The batch
/// is only worth retrying if every failure is transient.
fn item_errors(response: BulkResponse) -> Result<(), SinkError> {
    if !response.errors {
        return Ok(());
    }

    let total = response.items.len();
    let failed: Vec<BulkItem> = response
        .items
        .into_iter()
        .flat_map(HashMap::into_values)
        .filter(|item| item.status >= 300)
        .collect();

    let permanent = failed.iter().find(|item| {
        StatusCode::from_u16(item.status).map_or(true, |status| !is_retryable_status(status))
    });
    match permanent {
        Some(item) => Err(SinkError::Fatal(format!(
            "{} of {} bulk items failed, first permanent failure {}: {}",
            failed.len(),
            total,
            item.status,
            item.error.clone().unwrap_or(Value::Null)
        ))),
        None => Err(SinkError::Retryable(format!(
            "{} of {} bulk items were rejected temporarily",
            failed.len(),
            total
        ))),
    }
}

#[async_trait]
impl BulkSink<User> for ElasticSink {
    fn name(&self) -> &str {
        "elasticsearch"
    }

    async fn write_batch(&self, records: &[Record<User>]) -> Result<(), SinkError> {
        let body = bulk_body(&self.index, records)
            .map_err(|e| SinkError::Fatal(format!("failed to serialize users: {e}")))?;

        let endpoint = self.endpoint();
        let response = self
            .authorize(self.http.post(endpoint.bulk.clone()))
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Retryable(format!("bulk request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(index = %self.index, status = status.as_u16(), "bulk request rejected");
            return Err(status_error(status, &body));
        }

        let parsed: BulkResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Retryable(format!("unreadable bulk response: {e}")))?;
        item_errors(parsed)?;

        debug!(index = %self.index, batch_size = records.len(), "bulk indexed users");
        Ok(())
    }
}
