use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BulkOutcome, Document, Sink, SinkQuery, severities_from};
use crate::error::SinkError;

/// In-process store: idempotent upsert by id, range queries by timestamp.
#[derive(Debug, Default)]
pub struct MemorySink {
    indices: RwLock<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, index: &str) -> usize {
        self.indices
            .read()
            .await
            .get(index)
            .map_or(0, BTreeMap::len)
    }

    pub async fn documents(&self, index: &str) -> Vec<Document> {
        self.indices
            .read()
            .await
            .get(index)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn bulk(&self, docs: &[Document]) -> Result<BulkOutcome, SinkError> {
        let mut guard = self.indices.write().await;
        for doc in docs {
            guard
                .entry(doc.index.clone())
                .or_default()
                .insert(doc.id.clone(), doc.clone());
        }
        Ok(BulkOutcome {
            accepted: docs.len(),
            rejected: Vec::new(),
        })
    }

    async fn query(&self, query: &SinkQuery) -> Result<Vec<serde_json::Value>, SinkError> {
        let guard = self.indices.read().await;
        let Some(docs) = guard.get(&query.index) else {
            return Ok(Vec::new());
        };

        let severities = query.severity.map(severities_from);
        let mut matching: Vec<&Document> = docs
            .values()
            .filter(|doc| doc.timestamp >= query.from && doc.timestamp <= query.to)
            .filter(|doc| {
                query
                    .kind
                    .is_none_or(|kind| doc.body["kind"].as_str() == Some(kind.as_str()))
            })
            .filter(|doc| {
                severities.as_ref().is_none_or(|allowed| {
                    doc.body["severity"]
                        .as_str()
                        .is_some_and(|severity| allowed.contains(&severity))
                })
            })
            .collect();

        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(matching
            .into_iter()
            .take(query.limit)
            .map(|doc| doc.body.clone())
            .collect())
    }
}
