use crate::error::{Result, RagchatError};
use crate::retrieval::{Filter, SourceDocument, VectorStore};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

const API_VERSION: &str = "2024-07";

/// Metadata key holding the chunk text, as written by the ingestion pipeline.
const TEXT_KEY: &str = "text";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryBody<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl From<QueryMatch> for SourceDocument {
    fn from(m: QueryMatch) -> Self {
        let mut metadata = m.metadata;
        let page_content = match metadata.remove(TEXT_KEY) {
            Some(Value::String(text)) => text,
            _ => String::new(),
        };
        SourceDocument {
            id: m.id,
            page_content,
            score: m.score,
            metadata,
        }
    }
}

/// Hosted Pinecone index queried over its data-plane REST API.
pub struct PineconeStore {
    client: Client,
    host: String,
    index_name: String,
    api_key: String,
    namespace: Option<String>,
}

impl PineconeStore {
    pub fn new(host: &str, index_name: impl Into<String>, api_key: String, namespace: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|e| RagchatError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", host.trim_end_matches('/'))
        };

        Ok(Self {
            client,
            host,
            index_name: index_name.into(),
            api_key,
            namespace,
        })
    }

    fn classify(&self, status: StatusCode, body: &str) -> RagchatError {
        let lowered = body.to_lowercase();
        if status == StatusCode::NOT_FOUND || lowered.contains("index not found") {
            RagchatError::IndexNotFound(self.index_name.clone())
        } else if status == StatusCode::TOO_MANY_REQUESTS || lowered.contains("resource_exhausted") {
            RagchatError::QuotaExceeded(format!("pinecone: {}", body.chars().take(300).collect::<String>()))
        } else {
            RagchatError::VectorStore(format!("pinecone error {}: {}", status, body.chars().take(300).collect::<String>()))
        }
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    async fn query(&self, vector: &[f32], top_k: usize, filter: Option<&Filter>) -> Result<Vec<SourceDocument>> {
        let body = QueryBody {
            vector,
            top_k,
            include_metadata: true,
            filter: filter.map(Filter::to_pinecone_json),
            namespace: self.namespace.as_deref(),
        };

        let response = self
            .client
            .post(format!("{}/query", self.host))
            .header("Api-Key", &self.api_key)
            .header("X-Pinecone-API-Version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagchatError::VectorStore(format!("Network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.classify(status, &text));
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| RagchatError::VectorStore(format!("Failed to parse query response: {}", e)))?;

        Ok(parsed.matches.into_iter().map(SourceDocument::from).collect())
    }

    fn describe(&self) -> String {
        format!("pinecone index '{}'", self.index_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> PineconeStore {
        PineconeStore::new("my-index-abc.svc.pinecone.io/", "my-index", "key".into(), Some("ns".into())).unwrap()
    }

    #[test]
    fn test_host_normalized() {
        assert_eq!(store().host, "https://my-index-abc.svc.pinecone.io");
    }

    #[test]
    fn test_query_body_shape() {
        let filter = Filter::Eq("library".into(), "Talks".into());
        let body = QueryBody {
            vector: &[0.5],
            top_k: 4,
            include_metadata: true,
            filter: Some(filter.to_pinecone_json()),
            namespace: Some("ns"),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "vector": [0.5],
                "topK": 4,
                "includeMetadata": true,
                "filter": {"library": {"$eq": "Talks"}},
                "namespace": "ns"
            })
        );
    }

    #[test]
    fn test_match_moves_text_out_of_metadata() {
        let response: QueryResponse = serde_json::from_value(json!({
            "matches": [{"id": "c1", "score": 0.8, "metadata": {"text": "Hello", "title": "T"}}]
        }))
        .unwrap();
        let doc: SourceDocument = response.matches.into_iter().next().unwrap().into();

        assert_eq!(doc.page_content, "Hello");
        assert!(!doc.metadata.contains_key("text"));
        assert_eq!(doc.title(), "T");
    }

    #[test]
    fn test_error_classification() {
        let store = store();
        assert!(matches!(store.classify(StatusCode::NOT_FOUND, ""), RagchatError::IndexNotFound(_)));
        assert!(matches!(
            store.classify(StatusCode::TOO_MANY_REQUESTS, "{}"),
            RagchatError::QuotaExceeded(_)
        ));
        assert!(matches!(
            store.classify(StatusCode::INTERNAL_SERVER_ERROR, "oops"),
            RagchatError::VectorStore(_)
        ));
    }
}
