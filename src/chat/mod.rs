//! Question answering: request validation, prompts, the retrieval chain and
//! the streaming service built on top of it.

pub mod chain;
pub mod prompt;
pub mod service;
pub mod validate;

pub use chain::{ChainOutput, QaChain};
pub use service::{ChatEvent, ChatService, ModelTag, RequestContext};
pub use validate::{validate, ChatMode, ChatRequest, ModelChoice, ValidatedChat};
