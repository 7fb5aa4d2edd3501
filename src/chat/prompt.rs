//! Prompt text for the question-answering chain.

use crate::config::SiteConfig;
use crate::llm::{ChatMessage, MessageRole};
use crate::retrieval::SourceDocument;

const CONDENSE_INSTRUCTIONS: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question, in its original language. \
Reply with the standalone question only.";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant for {site}. \
Answer the question using only the numbered context passages below. \
If the context does not contain the answer, say that you don't know; do not make up an answer. \
Keep answers concise and refer to sources by their titles where helpful.";

/// Messages asking the model to rewrite a follow-up as a standalone question.
pub fn condense_messages(history: &[ChatMessage], question: &str) -> Vec<ChatMessage> {
    let transcript = history
        .iter()
        .map(|turn| {
            let speaker = match turn.role {
                MessageRole::Assistant => "Assistant",
                _ => "Human",
            };
            format!("{}: {}", speaker, turn.content)
        })
        .collect::<Vec<_>>()
        .join("\n");

    vec![
        ChatMessage::system(CONDENSE_INSTRUCTIONS),
        ChatMessage::user(format!(
            "Chat History:\n{}\nFollow Up Input: {}\nStandalone question:",
            transcript, question
        )),
    ]
}

/// Numbered context blocks: `[1] Title (Library)\ntext`.
pub fn format_context(docs: &[SourceDocument]) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, doc)| {
            let heading = match doc.library() {
                Some(library) => format!("[{}] {} ({})", i + 1, doc.title(), library),
                None => format!("[{}] {}", i + 1, doc.title()),
            };
            format!("{}\n{}", heading, doc.page_content.trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Full message list for the answering call: system prompt with context, prior turns, question.
pub fn answer_messages(
    site: &SiteConfig,
    docs: &[SourceDocument],
    question: &str,
    history: &[ChatMessage],
) -> Vec<ChatMessage> {
    let instructions = site
        .system_prompt
        .as_deref()
        .unwrap_or(DEFAULT_SYSTEM_PROMPT)
        .replace("{site}", &site.name);
    let context = if docs.is_empty() {
        "(no relevant passages were found)".to_string()
    } else {
        format_context(docs)
    };

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(format!("{}\n\nContext:\n{}", instructions, context)));
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::user(question));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use serde_json::json;

    fn doc(title: &str, library: Option<&str>, text: &str) -> SourceDocument {
        let mut metadata = json!({ "title": title }).as_object().cloned().unwrap();
        if let Some(library) = library {
            metadata.insert("library".into(), library.into());
        }
        SourceDocument { id: title.into(), page_content: text.into(), score: 1.0, metadata }
    }

    #[test]
    fn test_condense_transcript() {
        let messages = condense_messages(
            &[ChatMessage::user("Who taught him?"), ChatMessage::assistant("His teacher.")],
            "Where?",
        );
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("Human: Who taught him?\nAssistant: His teacher."));
        assert!(messages[1].content.contains("Follow Up Input: Where?"));
    }

    #[test]
    fn test_context_numbering() {
        let context = format_context(&[doc("A", Some("Talks"), " one "), doc("B", None, "two")]);
        assert_eq!(context, "[1] A (Talks)\none\n\n[2] B\ntwo");
    }

    #[test]
    fn test_answer_messages_layout() {
        let site = sample_config("./test.db").site;
        let history = vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")];
        let messages = answer_messages(&site, &[], "why?", &history);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, MessageRole::System);
        assert!(messages[0].content.contains("Test Library"));
        assert!(messages[0].content.contains("no relevant passages"));
        assert_eq!(messages[3], ChatMessage::user("why?"));
    }
}
