use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, header};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{BulkOutcome, Document, RejectedDocument, Sink, SinkQuery, severities_from};
use crate::config::SinkConfig;
use crate::error::SinkError;

#[derive(Debug, Clone)]
enum Auth {
    None,
    ApiKey(String),
    Basic { user: String, password: String },
}

/// Elasticsearch-compatible store speaking the `_bulk` and `_search` APIs.
#[derive(Clone)]
pub struct ElasticSink {
    client: Client,
    base_url: String,
    auth: Auth,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(rename = "_index", default)]
    index: String,
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: SearchHits,
}

#[derive(Debug, Deserialize)]
struct SearchHits {
    #[serde(default)]
    hits: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    #[serde(rename = "_source")]
    source: serde_json::Value,
}

impl ElasticSink {
    pub fn from_config(config: &SinkConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build sink HTTP client")?;

        // API key wins; basic auth needs both halves.
        let auth = match (&config.api_key, &config.user, &config.password) {
            (Some(key), _, _) => Auth::ApiKey(key.clone()),
            (None, Some(user), Some(password)) => Auth::Basic {
                user: user.clone(),
                password: password.clone(),
            },
            _ => Auth::None,
        };

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => request,
            Auth::ApiKey(key) => request.header(header::AUTHORIZATION, format!("ApiKey {key}")),
            Auth::Basic { user, password } => request.basic_auth(user, Some(password)),
        }
    }
}

#[async_trait]
impl Sink for ElasticSink {
    fn name(&self) -> &str {
        "elastic"
    }

    async fn bulk(&self, docs: &[Document]) -> Result<BulkOutcome, SinkError> {
        if docs.is_empty() {
            return Ok(BulkOutcome::default());
        }

        let payload = encode_bulk(docs)?;
        let request = self
            .client
            .post(format!("{}/_bulk", self.base_url))
            .header(header::CONTENT_TYPE, "application/x-ndjson")
            .body(payload);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| SinkError::Unreachable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Refused(format!("status {status}: {body}")));
        }

        let body: BulkResponse = response
            .json()
            .await
            .map_err(|err| SinkError::Refused(format!("invalid bulk response: {err}")))?;

        let outcome = parse_bulk_response(docs, body);
        debug!(
            accepted = outcome.accepted,
            rejected = outcome.rejected.len(),
            "bulk request completed"
        );
        Ok(outcome)
    }

    async fn query(&self, query: &SinkQuery) -> Result<Vec<serde_json::Value>, SinkError> {
        let request = self
            .client
            .post(format!("{}/{}/_search", self.base_url, query.index))
            .json(&search_body(query));

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| SinkError::Unreachable(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(SinkError::Refused(format!("status {status}")));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|err| SinkError::Refused(format!("invalid search response: {err}")))?;
        Ok(body.hits.hits.into_iter().map(|hit| hit.source).collect())
    }
}

/// NDJSON body of `index` actions, each followed by its document.
fn encode_bulk(docs: &[Document]) -> Result<String, SinkError> {
    let mut payload = String::new();
    for doc in docs {
        let action = json!({"index": {"_index": doc.index, "_id": doc.id}});
        let line = |value: &serde_json::Value| {
            serde_json::to_string(value).map_err(|err| SinkError::Refused(err.to_string()))
        };
        payload.push_str(&line(&action)?);
        payload.push('\n');
        payload.push_str(&line(&doc.body)?);
        payload.push('\n');
    }
    Ok(payload)
}

fn parse_bulk_response(docs: &[Document], body: BulkResponse) -> BulkOutcome {
    if !body.errors {
        return BulkOutcome {
            accepted: docs.len(),
            rejected: Vec::new(),
        };
    }

    let mut outcome = BulkOutcome::default();
    for (position, entry) in body.items.into_iter().enumerate() {
        let Some(raw) = entry.into_iter().next().map(|(_, item)| item) else {
            continue;
        };
        let item: BulkItem = match serde_json::from_value(raw) {
            Ok(item) => item,
            Err(err) => {
                warn!(error = %err, "unreadable bulk item");
                continue;
            }
        };
        if item.status < 300 {
            outcome.accepted += 1;
            continue;
        }

        let fallback = docs.get(position);
        let reason = item
            .error
            .as_ref()
            .and_then(|err| err.get("reason").and_then(|r| r.as_str()).map(str::to_string))
            .unwrap_or_else(|| format!("status {}", item.status));
        outcome.rejected.push(RejectedDocument {
            id: if item.id.is_empty() {
                fallback.map(|doc| doc.id.clone()).unwrap_or_default()
            } else {
                item.id
            },
            index: if item.index.is_empty() {
                fallback.map(|doc| doc.index.clone()).unwrap_or_default()
            } else {
                item.index
            },
            reason,
            retryable: item.status == 429 || item.status >= 500,
        });
    }
    outcome
}

fn search_body(query: &SinkQuery) -> serde_json::Value {
    let mut filters = vec![json!({
        "range": {
            "@timestamp": {
                "gte": query.from.to_rfc3339(),
                "lte": query.to.to_rfc3339(),
            }
        }
    })];
    if let Some(kind) = query.kind {
        filters.push(json!({"term": {"kind": kind.as_str()}}));
    }
    if let Some(minimum) = query.severity {
        filters.push(json!({"terms": {"severity": severities_from(minimum)}}));
    }

    json!({
        "size": query.limit,
        "sort": [{"@timestamp": {"order": "desc"}}],
        "query": {"bool": {"filter": filters}},
    })
}
