use crate::db::Db;
use crate::error::{Result, RagchatError};
use crate::retrieval::{Filter, SourceDocument, VectorStore};
use async_trait::async_trait;
use rusqlite::params;
use serde_json::{Map, Value};

/// Parse a little-endian f32 blob. Returns None when the length is not a multiple of 4.
fn parse_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Cosine similarity; 0.0 for mismatched lengths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// A document to add to the local index.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub doc_id: String,
    pub title: String,
    pub library: String,
    pub media_type: String,
    pub url: Option<String>,
    pub metadata: Map<String, Value>,
    /// Chunk text and its embedding, in document order.
    pub chunks: Vec<(String, Vec<f32>)>,
}

/// Vector index kept in the local SQLite database (`documents` + `chunks`).
///
/// Chunks are scanned and scored in Rust; the filter is evaluated against each
/// chunk's merged metadata. An index with no documents counts as missing.
pub struct SqliteVectorStore {
    db: Db,
    index_name: String,
}

impl SqliteVectorStore {
    pub fn new(db: Db, index_name: impl Into<String>) -> Self {
        Self {
            db,
            index_name: index_name.into(),
        }
    }

    /// Insert or replace a document and its chunks.
    pub async fn upsert_document(&self, doc: NewDocument) -> Result<()> {
        let index_name = self.index_name.clone();
        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM documents WHERE doc_id = ?1", params![doc.doc_id])?;
                tx.execute(
                    "INSERT INTO documents (doc_id, index_name, title, library, media_type, url, metadata_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        doc.doc_id,
                        index_name,
                        doc.title,
                        doc.library,
                        doc.media_type,
                        doc.url,
                        Value::Object(doc.metadata).to_string(),
                        chrono::Utc::now().timestamp(),
                    ],
                )?;
                for (i, (text, embedding)) in doc.chunks.iter().enumerate() {
                    tx.execute(
                        "INSERT INTO chunks (chunk_id, doc_id, chunk_index, chunk_text, embedding)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            format!("{}#{}", doc.doc_id, i),
                            doc.doc_id,
                            i as i64,
                            text,
                            encode_embedding(embedding),
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
    }
}

struct ChunkRow {
    chunk_id: String,
    text: String,
    embedding: Vec<u8>,
    metadata: Map<String, Value>,
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn query(&self, vector: &[f32], top_k: usize, filter: Option<&Filter>) -> Result<Vec<SourceDocument>> {
        let index_name = self.index_name.clone();

        let rows = self
            .db
            .with_connection(move |conn| {
                let documents: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM documents WHERE index_name = ?1",
                    params![index_name],
                    |row| row.get(0),
                )?;
                if documents == 0 {
                    return Err(RagchatError::IndexNotFound(index_name));
                }

                let mut stmt = conn.prepare(
                    r#"
                    SELECT c.chunk_id, c.chunk_text, c.embedding, c.metadata_json,
                           d.doc_id, d.title, d.library, d.media_type, d.url, d.metadata_json
                    FROM chunks c
                    JOIN documents d ON c.doc_id = d.doc_id
                    WHERE d.index_name = ?1 AND c.embedding IS NOT NULL
                    "#,
                )?;
                let mut rows = stmt.query(params![index_name])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let chunk_meta: String = row.get(3)?;
                    let doc_meta: String = row.get(9)?;

                    let mut metadata = serde_json::from_str::<Map<String, Value>>(&doc_meta).unwrap_or_default();
                    metadata.extend(serde_json::from_str::<Map<String, Value>>(&chunk_meta).unwrap_or_default());
                    metadata.insert("docId".into(), Value::String(row.get(4)?));
                    metadata.insert("title".into(), Value::String(row.get(5)?));
                    metadata.insert("library".into(), Value::String(row.get(6)?));
                    metadata.insert("type".into(), Value::String(row.get(7)?));
                    if let Some(url) = row.get::<_, Option<String>>(8)? {
                        metadata.insert("url".into(), Value::String(url));
                    }

                    out.push(ChunkRow {
                        chunk_id: row.get(0)?,
                        text: row.get(1)?,
                        embedding: row.get(2)?,
                        metadata,
                    });
                }
                Ok(out)
            })
            .await?;

        let mut scored: Vec<SourceDocument> = rows
            .into_iter()
            .filter(|row| filter.map_or(true, |f| f.matches(&row.metadata)))
            .filter_map(|row| {
                let embedding = parse_embedding(&row.embedding)?;
                Some(SourceDocument {
                    score: cosine_similarity(vector, &embedding),
                    id: row.chunk_id,
                    page_content: row.text,
                    metadata: row.metadata,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    fn describe(&self) -> String {
        format!("sqlite index '{}'", self.index_name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::migrated_db;

    pub(crate) fn doc(id: &str, library: &str, media_type: &str, chunks: Vec<(&str, Vec<f32>)>) -> NewDocument {
        NewDocument {
            doc_id: id.to_string(),
            title: format!("Title {}", id),
            library: library.to_string(),
            media_type: media_type.to_string(),
            url: Some(format!("https://example.org/{}", id)),
            metadata: Map::new(),
            chunks: chunks.into_iter().map(|(t, e)| (t.to_string(), e)).collect(),
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[2.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_parse_embedding_rejects_ragged_blob() {
        assert!(parse_embedding(&[0, 0, 0]).is_none());
        assert_eq!(parse_embedding(&encode_embedding(&[1.5, -2.0])).unwrap(), vec![1.5, -2.0]);
    }

    #[tokio::test]
    async fn test_empty_index_is_not_found() {
        let (_dir, db) = migrated_db().await;
        let store = SqliteVectorStore::new(db, "missing");

        let err = store.query(&[1.0, 0.0], 3, None).await.unwrap_err();
        assert!(matches!(err, RagchatError::IndexNotFound(ref name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_query_ranks_and_filters() {
        let (_dir, db) = migrated_db().await;
        let store = SqliteVectorStore::new(db, "library");
        store
            .upsert_document(doc("a", "Talks", "audio", vec![("close", vec![1.0, 0.1]), ("far", vec![0.0, 1.0])]))
            .await
            .unwrap();
        store
            .upsert_document(doc("b", "Books", "text", vec![("closest", vec![1.0, 0.0])]))
            .await
            .unwrap();

        let all = store.query(&[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].page_content, "closest");
        assert_eq!(all[1].page_content, "close");
        assert_eq!(all[0].library(), Some("Books"));

        let talks_only = Filter::Eq("library".into(), "Talks".into());
        let filtered = store.query(&[1.0, 0.0], 5, Some(&talks_only)).await.unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|d| d.library() == Some("Talks")));
        assert_eq!(filtered[0].url(), Some("https://example.org/a"));
    }

    #[tokio::test]
    async fn test_upsert_replaces_chunks() {
        let (_dir, db) = migrated_db().await;
        let store = SqliteVectorStore::new(db, "library");
        store.upsert_document(doc("a", "Talks", "text", vec![("old", vec![1.0])])).await.unwrap();
        store.upsert_document(doc("a", "Talks", "text", vec![("new", vec![1.0])])).await.unwrap();

        let results = store.query(&[1.0], 5, None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].page_content, "new");
    }
}
