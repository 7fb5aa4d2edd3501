//! Metadata filters for the vector index.
//!
//! Filters are built per request from the site settings, the requested
//! collection and media types, and what the caller is allowed to see. They
//! render to the Pinecone query language and can also be evaluated locally
//! against a chunk's metadata map.

use crate::config::{SiteConfig, KNOWN_MEDIA_TYPES};
use crate::error::{RagchatError, Result};
use serde_json::{json, Map, Value};

pub const LIBRARY_FIELD: &str = "library";
pub const MEDIA_TYPE_FIELD: &str = "type";

/// Collection name meaning "every library the site exposes".
pub const ALL_COLLECTIONS: &str = "all";

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, String),
    In(String, Vec<String>),
    Nin(String, Vec<String>),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    /// `{"field": {"$eq": v}}`, `{"$and": [...]}` and friends.
    pub fn to_pinecone_json(&self) -> Value {
        match self {
            Filter::Eq(field, value) => json!({ field: { "$eq": value } }),
            Filter::In(field, values) => json!({ field: { "$in": values } }),
            Filter::Nin(field, values) => json!({ field: { "$nin": values } }),
            Filter::And(clauses) => {
                json!({ "$and": clauses.iter().map(Filter::to_pinecone_json).collect::<Vec<_>>() })
            }
            Filter::Or(clauses) => {
                json!({ "$or": clauses.iter().map(Filter::to_pinecone_json).collect::<Vec<_>>() })
            }
        }
    }

    /// Evaluate against chunk metadata. A missing field fails `Eq`/`In` and passes `Nin`.
    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        let field_value = |field: &str| metadata.get(field).and_then(Value::as_str);
        match self {
            Filter::Eq(field, value) => field_value(field) == Some(value.as_str()),
            Filter::In(field, values) => field_value(field).is_some_and(|v| values.iter().any(|x| x == v)),
            Filter::Nin(field, values) => field_value(field).map_or(true, |v| !values.iter().any(|x| x == v)),
            Filter::And(clauses) => clauses.iter().all(|c| c.matches(metadata)),
            Filter::Or(clauses) => clauses.iter().any(|c| c.matches(metadata)),
        }
    }

    fn and(mut clauses: Vec<Filter>) -> Option<Filter> {
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(Filter::And(clauses)),
        }
    }
}

/// What restricted content the caller may retrieve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentAccess {
    pub private_libraries: bool,
}

/// Media types to search: the requested ones the site enables, or every enabled
/// type when the request selects none of them.
pub fn effective_media_types(site: &SiteConfig, requested: &[String]) -> Vec<String> {
    let selected: Vec<String> = site
        .enabled_media_types
        .iter()
        .filter(|t| requested.contains(t))
        .cloned()
        .collect();
    if selected.is_empty() {
        site.enabled_media_types.clone()
    } else {
        selected
    }
}

/// Build the vector-store filter for one chat request.
///
/// Returns `Ok(None)` when no restriction applies.
pub fn build_filter(
    site: &SiteConfig,
    collection: Option<&str>,
    requested_media_types: &[String],
    access: ContentAccess,
) -> Result<Option<Filter>> {
    let mut clauses = Vec::new();

    let media_types = effective_media_types(site, requested_media_types);
    let covers_all = KNOWN_MEDIA_TYPES
        .iter()
        .all(|known| media_types.iter().any(|t| t == known));
    if !covers_all {
        clauses.push(Filter::In(MEDIA_TYPE_FIELD.to_string(), media_types));
    }

    let hidden: Vec<String> = site
        .excluded_libraries
        .iter()
        .chain(site.private_libraries.iter().filter(|_| !access.private_libraries))
        .cloned()
        .collect();

    match collection {
        Some(name) if name != ALL_COLLECTIONS => {
            if site.excluded_libraries.iter().any(|l| l == name) {
                return Err(RagchatError::InvalidInput(format!("Collection '{}' is not available", name)));
            }
            if hidden.iter().any(|l| l == name) {
                return Err(RagchatError::Forbidden(format!(
                    "Collection '{}' requires a signed-in account with access",
                    name
                )));
            }
            clauses.push(Filter::Eq(LIBRARY_FIELD.to_string(), name.to_string()));
        }
        _ if !site.included_libraries.is_empty() => {
            let visible: Vec<String> = site
                .included_libraries
                .iter()
                .filter(|l| !hidden.contains(l))
                .cloned()
                .collect();
            if visible.is_empty() {
                return Err(RagchatError::Forbidden("No libraries are available to this account".to_string()));
            }
            clauses.push(Filter::In(LIBRARY_FIELD.to_string(), visible));
        }
        _ => {
            if !hidden.is_empty() {
                clauses.push(Filter::Nin(LIBRARY_FIELD.to_string(), hidden));
            }
        }
    }

    Ok(Filter::and(clauses))
}
