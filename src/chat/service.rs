//! Chat orchestration: runs the chain for one request and turns everything it
//! produces into a sequence of [`ChatEvent`]s for the event stream.

use crate::answers::{AnswerStore, NewAnswer};
use crate::chat::chain::QaChain;
use crate::chat::validate::{ChatMode, ModelChoice, ValidatedChat};
use crate::config::{Config, SiteConfig};
use crate::error::{ErrorKind, Result};
use crate::retrieval::{Filter, SourceDocument, LIBRARY_FIELD};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Which side of a comparison an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTag {
    A,
    B,
}

impl ModelTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTag::A => "A",
            ModelTag::B => "B",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChatEvent {
    Token {
        model: Option<ModelTag>,
        token: String,
    },
    SourceDocs {
        model: Option<ModelTag>,
        docs: Vec<SourceDocument>,
    },
    Done {
        model: Option<ModelTag>,
        doc_id: Option<String>,
    },
    Error {
        model: Option<ModelTag>,
        message: String,
        kind: ErrorKind,
    },
}

impl ChatEvent {
    fn error(model: Option<ModelTag>, err: &crate::error::RagchatError) -> Self {
        ChatEvent::Error {
            model,
            message: err.public_message(),
            kind: err.kind(),
        }
    }

    /// JSON payload carried in the `data:` field of the event.
    pub fn to_json(&self) -> Value {
        let (mut body, model) = match self {
            ChatEvent::Token { model, token } => (json!({ "token": token }), model),
            ChatEvent::SourceDocs { model, docs } => (json!({ "sourceDocs": docs }), model),
            ChatEvent::Done { model, doc_id } => {
                let mut body = json!({ "done": true });
                if let Some(id) = doc_id {
                    body["docId"] = json!(id);
                }
                (body, model)
            }
            ChatEvent::Error { model, message, kind } => {
                (json!({ "error": message, "kind": kind.as_str() }), model)
            }
        };
        if let Some(tag) = model {
            body["model"] = json!(tag.as_str());
        }
        body
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Done { model: None, .. } | ChatEvent::Error { model: None, .. })
    }
}

/// True when the answer was asked of, or drew on, a private library.
fn draws_on_private(site: &SiteConfig, collection: Option<&str>, sources: &[SourceDocument]) -> bool {
    let is_private = |library: &str| site.private_libraries.iter().any(|l| l == library);
    collection.is_some_and(is_private)
        || sources
            .iter()
            .filter_map(|doc| doc.metadata.get(LIBRARY_FIELD).and_then(Value::as_str))
            .any(is_private)
}

/// Who asked, for persistence and logging.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_ip: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Clone)]
pub struct ChatService {
    config: Arc<Config>,
    chain: QaChain,
    answers: AnswerStore,
}

impl ChatService {
    pub fn new(config: Arc<Config>, chain: QaChain, answers: AnswerStore) -> Self {
        Self { config, chain, answers }
    }

    /// Answer one validated request, writing events into `events` until the
    /// answer is complete, something fails, or the receiver goes away.
    pub async fn run(&self, chat: ValidatedChat, filter: Option<Filter>, ctx: RequestContext, events: mpsc::Sender<ChatEvent>) {
        let outcome = match chat.mode.clone() {
            ChatMode::Single(choice) => self.answer_single(&chat, &choice, filter.as_ref(), &ctx, &events).await,
            ChatMode::Compare(a, b) => self.answer_compare(&chat, &a, &b, filter.as_ref(), &events).await,
        };

        if let Err(e) = outcome {
            log::error!("Chat request failed: {}", e);
            let _ = events.send(ChatEvent::error(None, &e)).await;
        }
    }

    async fn answer_single(
        &self,
        chat: &ValidatedChat,
        choice: &ModelChoice,
        filter: Option<&Filter>,
        ctx: &RequestContext,
        events: &mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        let output = self
            .chain
            .run(
                choice,
                &self.config.site,
                &chat.question,
                &chat.history,
                chat.source_count,
                filter,
                |docs| {
                    let events = events.clone();
                    async move { events.send(ChatEvent::SourceDocs { model: None, docs }).await.is_ok() }
                },
                |token| {
                    let events = events.clone();
                    async move { events.send(ChatEvent::Token { model: None, token }).await.is_ok() }
                },
            )
            .await?;

        if events.is_closed() {
            log::info!("Client disconnected before the answer finished; not saving it");
            return Ok(());
        }

        let doc_id = if chat.private_session {
            None
        } else {
            let restricted = draws_on_private(&self.config.site, chat.collection.as_deref(), &output.sources);
            let saved = self
                .answers
                .save(NewAnswer {
                    question: chat.question.clone(),
                    answer: output.answer,
                    sources: output.sources,
                    history: chat.history.clone(),
                    collection: chat.collection.clone(),
                    model: choice.model.clone(),
                    client_ip: ctx.client_ip.clone(),
                    user_id: ctx.user_id.clone(),
                    restricted,
                })
                .await;
            match saved {
                Ok(id) => Some(id),
                Err(e) => {
                    // The reader already has the answer, so finish the stream without an id
                    log::error!("Failed to save answer: {}", e);
                    None
                }
            }
        };

        let _ = events.send(ChatEvent::Done { model: None, doc_id }).await;
        Ok(())
    }

    async fn answer_compare(
        &self,
        chat: &ValidatedChat,
        choice_a: &ModelChoice,
        choice_b: &ModelChoice,
        filter: Option<&Filter>,
        events: &mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        log::info!("Comparing {} against {}", choice_a.model, choice_b.model);
        let standalone = self.chain.condense_question(&chat.history, &chat.question).await?;
        let sources = self.chain.retrieve(&standalone, chat.source_count, filter).await?;

        for tag in [ModelTag::A, ModelTag::B] {
            let event = ChatEvent::SourceDocs { model: Some(tag), docs: sources.clone() };
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }

        tokio::join!(
            self.stream_tagged(ModelTag::A, choice_a, chat, &sources, events),
            self.stream_tagged(ModelTag::B, choice_b, chat, &sources, events),
        );

        let _ = events.send(ChatEvent::Done { model: None, doc_id: None }).await;
        Ok(())
    }

    /// One side of a comparison. Failures are reported on that side only.
    async fn stream_tagged(
        &self,
        tag: ModelTag,
        choice: &ModelChoice,
        chat: &ValidatedChat,
        sources: &[SourceDocument],
        events: &mpsc::Sender<ChatEvent>,
    ) {
        let result = self
            .chain
            .stream_answer(choice, &self.config.site, sources, &chat.question, &chat.history, |token| {
                let events = events.clone();
                async move { events.send(ChatEvent::Token { model: Some(tag), token }).await.is_ok() }
            })
            .await;

        let event = match result {
            Ok(_) => ChatEvent::Done { model: Some(tag), doc_id: None },
            Err(e) => {
                log::error!("Model {} ({}) failed: {}", tag.as_str(), choice.model, e);
                ChatEvent::error(Some(tag), &e)
            }
        };
        let _ = events.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::db::tests::migrated_db;
    use crate::retrieval::Retriever;
    use crate::testing::{sample_docs, FakeChatModel, FakeEmbedder, FakeStore};
    use tempfile::TempDir;

    async fn service(model: FakeChatModel, store: FakeStore) -> (TempDir, ChatService) {
        let (dir, db) = migrated_db().await;
        let config = Arc::new(sample_config("./test.db"));
        let retriever = Retriever::new(Arc::new(FakeEmbedder), Arc::new(store));
        let chain = QaChain::new(Arc::new(model), retriever, "gpt-4o-mini");
        (dir, ChatService::new(config, chain, AnswerStore::new(db)))
    }

    fn chat(mode: ChatMode, private_session: bool) -> ValidatedChat {
        ValidatedChat {
            question: "How do I sit?".into(),
            history: vec![],
            collection: Some("Talks".into()),
            media_types: vec![],
            source_count: 2,
            private_session,
            mode,
        }
    }

    fn single() -> ChatMode {
        ChatMode::Single(ModelChoice { model: "gpt-4o-mini".into(), temperature: 0.2 })
    }

    async fn collect(service: &ChatService, chat: ValidatedChat) -> Vec<ChatEvent> {
        let (tx, mut rx) = mpsc::channel(64);
        service.run(chat, None, RequestContext::default(), tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn tokens(events: &[ChatEvent], tag: Option<ModelTag>) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::Token { model, token } if *model == tag => Some(token.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_answer_is_streamed_and_saved() {
        let (_dir, service) = service(FakeChatModel::new(&["Sit", " still."]), FakeStore::with_docs(sample_docs())).await;
        let events = collect(&service, chat(single(), false)).await;

        assert!(matches!(&events[0], ChatEvent::SourceDocs { model: None, docs } if docs.len() == 2));
        assert_eq!(tokens(&events, None), "gpt-4o-mini:Sit still.");

        let doc_id = match events.last().unwrap() {
            ChatEvent::Done { model: None, doc_id: Some(id) } => id.clone(),
            other => panic!("unexpected last event {:?}", other),
        };
        let saved = service.answers.get(&doc_id, false).await.unwrap();
        assert_eq!(saved.answer, "gpt-4o-mini:Sit still.");
        assert_eq!(saved.question, "How do I sit?");
        assert_eq!(saved.collection.as_deref(), Some("Talks"));
        assert_eq!(saved.sources.len(), 2);
        assert_eq!(saved.like_count, 0);
    }

    #[tokio::test]
    async fn test_private_session_not_saved() {
        let (_dir, service) = service(FakeChatModel::new(&["ok"]), FakeStore::with_docs(sample_docs())).await;
        let events = collect(&service, chat(single(), true)).await;

        assert!(matches!(events.last().unwrap(), ChatEvent::Done { doc_id: None, .. }));
        assert!(service.answers.recent(10, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_comparison_runs_both_models() {
        let (_dir, service) = service(FakeChatModel::new(&["hi"]), FakeStore::with_docs(sample_docs())).await;
        let mode = ChatMode::Compare(
            ModelChoice { model: "gpt-4o-mini".into(), temperature: 0.2 },
            ModelChoice { model: "gpt-4o".into(), temperature: 0.7 },
        );
        let events = collect(&service, chat(mode, true)).await;

        assert_eq!(tokens(&events, Some(ModelTag::A)), "gpt-4o-mini:hi");
        assert_eq!(tokens(&events, Some(ModelTag::B)), "gpt-4o:hi");
        let sources = events.iter().filter(|e| matches!(e, ChatEvent::SourceDocs { .. })).count();
        assert_eq!(sources, 2);
        assert!(matches!(events.last().unwrap(), ChatEvent::Done { model: None, doc_id: None }));
        assert!(service.answers.recent(10, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_index_reported_as_error_event() {
        let (_dir, service) = service(FakeChatModel::new(&["x"]), FakeStore::missing_index()).await;
        let events = collect(&service, chat(single(), false)).await;

        assert_eq!(events.len(), 1);
        let json = events[0].to_json();
        assert_eq!(json["kind"], "index_not_found");
        assert!(json.get("model").is_none());
    }

    #[tokio::test]
    async fn test_quota_error_tagged_in_comparison() {
        let (_dir, service) = service(FakeChatModel::out_of_quota(), FakeStore::with_docs(sample_docs())).await;
        let mode = ChatMode::Compare(
            ModelChoice { model: "gpt-4o-mini".into(), temperature: 0.2 },
            ModelChoice { model: "gpt-4o".into(), temperature: 0.2 },
        );
        let events = collect(&service, chat(mode, true)).await;

        let errors: Vec<Value> = events
            .iter()
            .filter(|e| matches!(e, ChatEvent::Error { .. }))
            .map(ChatEvent::to_json)
            .collect();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e["kind"] == "quota_exceeded"));
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_disconnect_mid_stream_skips_saving() {
        let (_dir, service) = service(FakeChatModel::new(&["Sit", " still", "."]), FakeStore::with_docs(sample_docs())).await;
        // Room for one event, so the service blocks on every token until read
        let (tx, mut rx) = mpsc::channel(1);
        let task = {
            let service = service.clone();
            tokio::spawn(async move { service.run(chat(single(), false), None, RequestContext::default(), tx).await })
        };

        assert!(matches!(rx.recv().await, Some(ChatEvent::SourceDocs { .. })));
        drop(rx);
        task.await.unwrap();

        assert!(service.answers.recent(10, true).await.unwrap().is_empty());
    }

    #[test]
    fn test_answers_touching_private_libraries_are_flagged() {
        let site = sample_config("./test.db").site;
        let docs = sample_docs();

        assert!(!draws_on_private(&site, Some("Talks"), &docs));
        assert!(draws_on_private(&site, Some("Members"), &docs));

        let mut member_doc = docs[0].clone();
        member_doc.metadata.insert("library".into(), json!("Members"));
        assert!(draws_on_private(&site, None, &[docs[1].clone(), member_doc]));
    }

    #[test]
    fn test_event_json_shapes() {
        let token = ChatEvent::Token { model: Some(ModelTag::B), token: "x".into() }.to_json();
        assert_eq!(token, json!({"token": "x", "model": "B"}));

        let done = ChatEvent::Done { model: None, doc_id: Some("42".into()) }.to_json();
        assert_eq!(done, json!({"done": true, "docId": "42"}));

        let done_private = ChatEvent::Done { model: None, doc_id: None }.to_json();
        assert_eq!(done_private, json!({"done": true}));
    }
}
