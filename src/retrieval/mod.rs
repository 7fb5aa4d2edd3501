//! Retrieval: metadata filters, vector stores and the query-side retriever.

pub mod document;
pub mod filter;
pub mod pinecone;
pub mod sqlite_store;

use crate::embeddings::Embedder;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use document::SourceDocument;
pub use filter::{build_filter, ContentAccess, Filter, LIBRARY_FIELD};
pub use pinecone::PineconeStore;
pub use sqlite_store::SqliteVectorStore;

/// A nearest-neighbour index over document chunks.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Return up to `top_k` chunks closest to `vector` that satisfy `filter`, best first.
    async fn query(&self, vector: &[f32], top_k: usize, filter: Option<&Filter>) -> Result<Vec<SourceDocument>>;

    /// Human-readable identifier used in logs.
    fn describe(&self) -> String;
}

/// Embeds a question and looks it up in a vector store.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    pub async fn retrieve(&self, query: &str, top_k: usize, filter: Option<&Filter>) -> Result<Vec<SourceDocument>> {
        let start = std::time::Instant::now();
        let vector = self.embedder.embed_query(query).await?;
        let docs = self.store.query(&vector, top_k, filter).await?;
        log::info!(
            "Retrieved {} documents from {} in {:?}",
            docs.len(),
            self.store.describe(),
            start.elapsed()
        );
        Ok(docs)
    }
}
