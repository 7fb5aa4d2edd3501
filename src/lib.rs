pub mod answers;
pub mod audit;
pub mod auth;
pub mod cache;
pub mod chat;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod http;
pub mod llm;
pub mod ratelimit;
pub mod retrieval;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{RagchatError, Result};
