use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A retrieved chunk together with the metadata of the document it came from.
///
/// Serialised to clients as `{"id", "pageContent", "score", "metadata"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDocument {
    pub id: String,
    pub page_content: String,
    #[serde(default)]
    pub score: f32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SourceDocument {
    fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn title(&self) -> &str {
        self.meta_str("title").unwrap_or("Untitled")
    }

    pub fn library(&self) -> Option<&str> {
        self.meta_str("library")
    }

    pub fn url(&self) -> Option<&str> {
        self.meta_str("url")
    }

    pub fn media_type(&self) -> &str {
        self.meta_str("type").unwrap_or("text")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accessors_and_wire_shape() {
        let doc = SourceDocument {
            id: "c1".into(),
            page_content: "Breathe in.".into(),
            score: 0.9,
            metadata: json!({"title": "Talk 1", "library": "Talks", "type": "audio"})
                .as_object()
                .cloned()
                .unwrap(),
        };

        assert_eq!(doc.title(), "Talk 1");
        assert_eq!(doc.library(), Some("Talks"));
        assert_eq!(doc.media_type(), "audio");
        assert_eq!(doc.url(), None);

        let wire = serde_json::to_value(&doc).unwrap();
        assert_eq!(wire["pageContent"], "Breathe in.");
    }

    #[test]
    fn test_defaults_for_missing_metadata() {
        let doc: SourceDocument = serde_json::from_str(r#"{"id":"x","pageContent":"t"}"#).unwrap();
        assert_eq!(doc.title(), "Untitled");
        assert_eq!(doc.media_type(), "text");
    }
}
