pub mod openai;

use crate::error::Result;
use async_trait::async_trait;

pub use openai::OpenAIEmbedder;

/// Turns query text into a vector for the retriever.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;

    /// Number of dimensions every returned vector has.
    fn dimensions(&self) -> usize;
}
