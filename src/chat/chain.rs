//! Question-answering chain: condense the follow-up, retrieve, stream the answer.

use crate::chat::prompt;
use crate::chat::validate::ModelChoice;
use crate::config::SiteConfig;
use crate::error::Result;
use crate::llm::{ChatMessage, ChatModel, CompletionRequest};
use crate::retrieval::{Filter, Retriever, SourceDocument};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Buffer between the model's token stream and whoever consumes it.
const TOKEN_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub answer: String,
    pub sources: Vec<SourceDocument>,
    pub standalone_question: String,
}

#[derive(Clone)]
pub struct QaChain {
    model: Arc<dyn ChatModel>,
    retriever: Retriever,
    /// Model used to rephrase follow-up questions.
    condense_model: String,
}

impl QaChain {
    pub fn new(model: Arc<dyn ChatModel>, retriever: Retriever, condense_model: impl Into<String>) -> Self {
        Self {
            model,
            retriever,
            condense_model: condense_model.into(),
        }
    }

    /// Rewrite a follow-up as a standalone question. Without history the question is returned as is.
    pub async fn condense_question(&self, history: &[ChatMessage], question: &str) -> Result<String> {
        if history.is_empty() {
            return Ok(question.to_string());
        }
        let request = CompletionRequest {
            model: self.condense_model.clone(),
            messages: prompt::condense_messages(history, question),
            temperature: 0.0,
        };
        let standalone = self.model.complete(&request).await?;
        let standalone = standalone.trim();
        if standalone.is_empty() {
            Ok(question.to_string())
        } else {
            log::debug!("Condensed follow-up into: {}", standalone);
            Ok(standalone.to_string())
        }
    }

    pub async fn retrieve(&self, question: &str, top_k: usize, filter: Option<&Filter>) -> Result<Vec<SourceDocument>> {
        self.retriever.retrieve(question, top_k, filter).await
    }

    /// Stream an answer grounded in `docs`. Every token is handed to `on_token`
    /// as it arrives; the full answer is returned when the model finishes.
    pub async fn stream_answer<F, Fut>(
        &self,
        choice: &ModelChoice,
        site: &SiteConfig,
        docs: &[SourceDocument],
        question: &str,
        history: &[ChatMessage],
        mut on_token: F,
    ) -> Result<String>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let request = CompletionRequest {
            model: choice.model.clone(),
            messages: prompt::answer_messages(site, docs, question, history),
            temperature: choice.temperature,
        };

        let (tx, mut rx) = mpsc::channel::<String>(TOKEN_BUFFER);
        let forward = async move {
            while let Some(token) = rx.recv().await {
                if !on_token(token).await {
                    // Consumer is gone; dropping rx stops the model stream
                    break;
                }
            }
        };

        let (answer, ()) = tokio::join!(self.model.stream(&request, tx), forward);
        answer
    }

    /// Condense, retrieve, then stream. `on_sources` fires once retrieval is done,
    /// before the first token; like `on_token` it returns false once the consumer
    /// is gone, and the model is then never called.
    #[allow(clippy::too_many_arguments)]
    pub async fn run<S, SFut, F, Fut>(
        &self,
        choice: &ModelChoice,
        site: &SiteConfig,
        question: &str,
        history: &[ChatMessage],
        top_k: usize,
        filter: Option<&Filter>,
        on_sources: S,
        on_token: F,
    ) -> Result<ChainOutput>
    where
        S: FnOnce(Vec<SourceDocument>) -> SFut,
        SFut: std::future::Future<Output = bool>,
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let standalone_question = self.condense_question(history, question).await?;
        let sources = self.retrieve(&standalone_question, top_k, filter).await?;
        if !on_sources(sources.clone()).await {
            return Ok(ChainOutput {
                answer: String::new(),
                sources,
                standalone_question,
            });
        }
        let answer = self
            .stream_answer(choice, site, &sources, question, history, on_token)
            .await?;

        Ok(ChainOutput {
            answer,
            sources,
            standalone_question,
        })
    }
}
