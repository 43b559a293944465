//! Semantic Index: append-only `(content, embedding, source)` records per
//! user with brute-force cosine search.

use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mneme_core::SourceTag;

use crate::database::Database;
use crate::error::StoreError;
use crate::similarity::{blob_to_f64_vec, cosine_similarity, f64_slice_to_blob};
use crate::timestamp::now_timestamp;

/// A stored semantic record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SemanticRecord {
    pub id: i64,
    pub user_id: String,
    pub content: String,
    pub embedding: Vec<f64>,
    pub source_tag: SourceTag,
    pub created_at: String,
}

/// A search hit with its cosine score.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScoredRecord {
    pub record: SemanticRecord,
    pub score: f64,
}

/// Options for [`SemanticIndex::search`].
#[derive(Clone, Debug)]
pub struct SearchOptions {
    pub top_k: usize,
    pub min_score: f64,
    /// Records carrying this tag are filtered out in the query itself.
    pub exclude_source: Option<SourceTag>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_score: 0.75,
            exclude_source: None,
        }
    }
}

pub struct SemanticIndex {
    db: Database,
}

impl SemanticIndex {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn add(
        &self,
        user_id: &str,
        content: &str,
        embedding: &[f64],
        source_tag: &SourceTag,
    ) -> Result<i64, StoreError> {
        let blob = f64_slice_to_blob(embedding);
        let created_at = now_timestamp();
        self.db.with_conn(|conn| {
            let _ = conn.execute(
                "INSERT INTO semantic_memory (user_id, content, embedding, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![user_id, content, blob, source_tag.as_str(), created_at],
            )?;
            let id = conn.last_insert_rowid();
            debug!(user_id, id, source = %source_tag, dims = embedding.len(), "semantic record added");
            Ok(id)
        })
    }

    /// Up to `top_k` records scoring at least `min_score`, best first.
    ///
    /// Equal scores keep the most recent record first.
    pub fn search(
        &self,
        user_id: &str,
        query: &[f64],
        opts: &SearchOptions,
    ) -> Result<Vec<ScoredRecord>, StoreError> {
        if opts.top_k == 0 {
            return Ok(Vec::new());
        }
        let records = self.load_records(user_id, opts.exclude_source.as_ref())?;
        Ok(rank_results(query, records, opts.top_k, opts.min_score))
    }

    pub fn count(&self, user_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM semantic_memory WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(n).unwrap_or_default())
        })
    }

    pub fn clear(&self, user_id: &str) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM semantic_memory WHERE user_id = ?1", [user_id])?)
        })
    }

    /// Newest first, so the stable sort in [`rank_results`] breaks ties by recency.
    fn load_records(
        &self,
        user_id: &str,
        exclude: Option<&SourceTag>,
    ) -> Result<Vec<SemanticRecord>, StoreError> {
        let labels = exclude.map(stored_labels).unwrap_or_default();
        let mut sql = String::from(
            "SELECT id, content, embedding, source, created_at FROM semantic_memory WHERE user_id = ?1",
        );
        if !labels.is_empty() {
            let placeholders: Vec<String> = (0..labels.len()).map(|i| format!("?{}", i + 2)).collect();
            sql.push_str(&format!(
                " AND (source IS NULL OR source NOT IN ({}))",
                placeholders.join(", ")
            ));
        }
        sql.push_str(" ORDER BY id DESC");

        let mut bind: Vec<&str> = Vec::with_capacity(labels.len() + 1);
        bind.push(user_id);
        bind.extend(labels.iter().copied());

        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(bind.iter()))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                match decode_record(user_id, row) {
                    Ok(record) => out.push(record),
                    Err(e) => warn!(user_id, error = %e, "skipping unreadable semantic record"),
                }
            }
            Ok(out)
        })
    }
}

/// Labels under which a tag may have been persisted.
fn stored_labels(tag: &SourceTag) -> Vec<&str> {
    match tag {
        SourceTag::Agent => vec!["agent", "assistant"],
        other => vec![other.as_str()],
    }
}

fn decode_record(user_id: &str, row: &Row<'_>) -> Result<SemanticRecord, StoreError> {
    let id: i64 = row.get(0)?;
    let embedding = match row.get_ref(2)? {
        ValueRef::Blob(bytes) => blob_to_f64_vec(bytes),
        // Older files stored the vector as a JSON array.
        ValueRef::Text(text) => serde_json::from_slice(text).map_err(|e| StoreError::CorruptRow {
            table: "semantic_memory",
            column: "embedding",
            detail: format!("record {id}: {e}"),
        })?,
        other => {
            return Err(StoreError::CorruptRow {
                table: "semantic_memory",
                column: "embedding",
                detail: format!("record {id}: unexpected {:?}", other.data_type()),
            })
        }
    };
    let source: Option<String> = row.get(3)?;
    Ok(SemanticRecord {
        id,
        user_id: user_id.to_string(),
        content: row.get(1)?,
        embedding,
        source_tag: SourceTag::from(source.as_deref().unwrap_or("chat")),
        created_at: row.get(4)?,
    })
}

fn rank_results(
    query: &[f64],
    records: Vec<SemanticRecord>,
    top_k: usize,
    min_score: f64,
) -> Vec<ScoredRecord> {
    let mut results: Vec<ScoredRecord> = records
        .into_iter()
        .filter_map(|record| {
            let score = cosine_similarity(query, &record.embedding);
            (score >= min_score).then_some(ScoredRecord { record, score })
        })
        .collect();

    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results.truncate(top_k);
    results
}
