//! Chat request validation and sanitization.

use crate::config::{Config, KNOWN_MEDIA_TYPES};
use crate::error::{RagchatError, Result};
use crate::llm::{ChatMessage, MessageRole};
use crate::retrieval::filter::ALL_COLLECTIONS;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub const MIN_SOURCE_COUNT: usize = 1;
pub const MAX_SOURCE_COUNT: usize = 20;

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonRequest {
    pub model_a: String,
    pub model_b: String,
    #[serde(default)]
    pub temperature_a: Option<f32>,
    #[serde(default)]
    pub temperature_b: Option<f32>,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub question: String,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
    #[serde(default)]
    pub collection: Option<String>,
    /// e.g. `{"text": true, "audio": false}`
    #[serde(default)]
    pub media_types: Option<BTreeMap<String, bool>>,
    #[serde(default)]
    pub source_count: Option<usize>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub private_session: bool,
    #[serde(default)]
    pub comparison: Option<ComparisonRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelChoice {
    pub model: String,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatMode {
    Single(ModelChoice),
    Compare(ModelChoice, ModelChoice),
}

#[derive(Debug, Clone)]
pub struct ValidatedChat {
    pub question: String,
    pub history: Vec<ChatMessage>,
    pub collection: Option<String>,
    /// Requested media types, already restricted to known names. May be empty.
    pub media_types: Vec<String>,
    pub source_count: usize,
    pub private_session: bool,
    pub mode: ChatMode,
}

fn tag_regex() -> &'static Regex {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    TAGS.get_or_init(|| Regex::new(r"<[^>]*>").expect("static regex"))
}

fn spaces_regex() -> &'static Regex {
    static SPACES: OnceLock<Regex> = OnceLock::new();
    SPACES.get_or_init(|| Regex::new(r"[ \t]+").expect("static regex"))
}

/// Strip markup and control characters (newlines and tabs survive), collapse
/// runs of spaces, and trim.
pub fn sanitize(text: &str) -> String {
    let without_tags = tag_regex().replace_all(text, "");
    let cleaned: String = without_tags
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    spaces_regex()
        .replace_all(&cleaned, " ")
        .lines()
        .map(str::trim)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn clamp_temperature(value: Option<f32>, default: f32) -> f32 {
    match value {
        Some(t) if t.is_finite() => t.clamp(0.0, 1.0),
        _ => default,
    }
}

fn checked_model(config: &Config, requested: Option<&str>) -> Result<String> {
    match requested.map(str::trim).filter(|m| !m.is_empty()) {
        None => Ok(config.llm.default_model.clone()),
        Some(model) if config.llm.is_model_allowed(model) => Ok(model.to_string()),
        Some(model) => Err(RagchatError::InvalidInput(format!("Model '{}' is not available", model))),
    }
}

pub fn validate(request: ChatRequest, config: &Config) -> Result<ValidatedChat> {
    let site = &config.site;

    let raw = request.question.trim();
    if raw.is_empty() {
        return Err(RagchatError::InvalidInput("Question is required".to_string()));
    }
    if raw.chars().count() > site.max_question_length {
        return Err(RagchatError::InvalidInput(format!(
            "Question is too long (max {} characters)",
            site.max_question_length
        )));
    }
    let question = sanitize(raw);
    if question.is_empty() {
        return Err(RagchatError::InvalidInput("Question is empty after removing markup".to_string()));
    }

    let skip = request.history.len().saturating_sub(site.max_history_turns);
    let history = request
        .history
        .into_iter()
        .skip(skip)
        .map(|turn| {
            let role = match turn.role.as_str() {
                "user" => MessageRole::User,
                "assistant" => MessageRole::Assistant,
                other => {
                    return Err(RagchatError::InvalidInput(format!("Invalid history role '{}'", other)));
                }
            };
            Ok(ChatMessage { role, content: sanitize(&turn.content) })
        })
        .filter(|turn| !matches!(turn, Ok(msg) if msg.content.is_empty()))
        .collect::<Result<Vec<_>>>()?;

    let collection = match request.collection.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(ALL_COLLECTIONS) => Some(ALL_COLLECTIONS.to_string()),
        Some(name) if config.known_libraries().contains(&name) || site.excluded_libraries.iter().any(|l| l == name) => {
            Some(name.to_string())
        }
        Some(name) => return Err(RagchatError::InvalidInput(format!("Unknown collection '{}'", name))),
    };

    let media_types = request
        .media_types
        .unwrap_or_default()
        .into_iter()
        .filter(|(name, enabled)| *enabled && KNOWN_MEDIA_TYPES.contains(&name.as_str()))
        .map(|(name, _)| name)
        .collect();

    let source_count = request
        .source_count
        .unwrap_or(config.vector_store.top_k)
        .clamp(MIN_SOURCE_COUNT, MAX_SOURCE_COUNT);

    let mode = match request.comparison {
        Some(cmp) => {
            if !site.allow_model_comparison {
                return Err(RagchatError::InvalidInput("Model comparison is not enabled".to_string()));
            }
            ChatMode::Compare(
                ModelChoice {
                    model: checked_model(config, Some(&cmp.model_a))?,
                    temperature: clamp_temperature(cmp.temperature_a, config.llm.temperature),
                },
                ModelChoice {
                    model: checked_model(config, Some(&cmp.model_b))?,
                    temperature: clamp_temperature(cmp.temperature_b, config.llm.temperature),
                },
            )
        }
        None => ChatMode::Single(ModelChoice {
            model: checked_model(config, request.model.as_deref())?,
            temperature: clamp_temperature(request.temperature, config.llm.temperature),
        }),
    };

    Ok(ValidatedChat {
        question,
        history,
        collection,
        media_types,
        source_count,
        // Comparison runs are never stored
        private_session: request.private_session || matches!(mode, ChatMode::Compare(..)),
        mode,
    })
}
