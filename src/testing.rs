//! In-process fakes for the external services, shared by unit tests.

use crate::embeddings::Embedder;
use crate::error::{RagchatError, Result};
use crate::llm::{ChatModel, CompletionRequest};
use crate::retrieval::{Filter, SourceDocument, VectorStore};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;
use tokio::sync::mpsc;

pub struct FakeEmbedder;

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }

    fn dimensions(&self) -> usize {
        2
    }
}

pub enum StoreBehaviour {
    Docs(Vec<SourceDocument>),
    IndexMissing,
}

/// Vector store that returns canned documents and remembers the last filter.
pub struct FakeStore {
    behaviour: StoreBehaviour,
    pub last_filter: Mutex<Option<Filter>>,
}

impl FakeStore {
    pub fn with_docs(docs: Vec<SourceDocument>) -> Self {
        Self { behaviour: StoreBehaviour::Docs(docs), last_filter: Mutex::new(None) }
    }

    pub fn missing_index() -> Self {
        Self { behaviour: StoreBehaviour::IndexMissing, last_filter: Mutex::new(None) }
    }
}

#[async_trait]
impl VectorStore for FakeStore {
    async fn query(&self, _vector: &[f32], top_k: usize, filter: Option<&Filter>) -> Result<Vec<SourceDocument>> {
        *self.last_filter.lock().unwrap() = filter.cloned();
        match &self.behaviour {
            StoreBehaviour::Docs(docs) => Ok(docs.iter().take(top_k).cloned().collect()),
            StoreBehaviour::IndexMissing => Err(RagchatError::IndexNotFound("fake".into())),
        }
    }

    fn describe(&self) -> String {
        "fake store".to_string()
    }
}

/// Chat model that streams `"<model>:"` followed by its scripted tokens.
pub struct FakeChatModel {
    pub tokens: Vec<String>,
    pub condensed: String,
    pub quota_exhausted: bool,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl FakeChatModel {
    pub fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            condensed: "standalone question".to_string(),
            quota_exhausted: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn out_of_quota() -> Self {
        Self { quota_exhausted: true, ..Self::new(&[]) }
    }
}

#[async_trait]
impl ChatModel for FakeChatModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.condensed.clone())
    }

    async fn stream(&self, request: &CompletionRequest, tokens: mpsc::Sender<String>) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        if self.quota_exhausted {
            return Err(RagchatError::QuotaExceeded("fake".into()));
        }
        let mut full = String::new();
        let prefix = format!("{}:", request.model);
        for token in std::iter::once(&prefix).chain(self.tokens.iter()) {
            full.push_str(token);
            if tokens.send(token.clone()).await.is_err() {
                break;
            }
        }
        Ok(full)
    }
}

pub fn sample_docs() -> Vec<SourceDocument> {
    vec![
        SourceDocument {
            id: "c1".into(),
            page_content: "Sit quietly.".into(),
            score: 0.92,
            metadata: json!({"title": "Talk 1", "library": "Talks", "type": "audio"})
                .as_object()
                .cloned()
                .unwrap(),
        },
        SourceDocument {
            id: "c2".into(),
            page_content: "Watch the breath.".into(),
            score: 0.81,
            metadata: json!({"title": "Book 2", "library": "Books", "type": "text"})
                .as_object()
                .cloned()
                .unwrap(),
        },
    ]
}
