//! Persistent embedding cache keyed by content hash and model identifier.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use crate::clip::Embedding;
use crate::error::FilerError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS embeddings (
    content_hash TEXT NOT NULL,
    model_id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    embedding_dim INTEGER NOT NULL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (content_hash, model_id)
);
"#;

/// SQLite-backed cache with an in-memory memo in front of it.
///
/// Lookups from worker threads mostly hit the memo under a read lock; the
/// connection is only locked for misses and writes.
pub struct EmbeddingCache {
    conn: Mutex<Connection>,
    model_id: String,
    memo: RwLock<HashMap<String, Embedding>>,
}

impl EmbeddingCache {
    /// Open (or create) the cache at `path` for `model_id`. Vectors stored
    /// by any other model are purged.
    pub fn open(path: &Path, model_id: &str) -> Result<Self, FilerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FilerError::filesystem(parent, e))?;
        }
        let conn = Connection::open(path)?;
        let cache = Self::with_connection(conn, model_id)?;
        tracing::debug!(path = ?path, model = model_id, "Embedding cache opened");
        Ok(cache)
    }

    /// Cache that lives only for this process.
    pub fn in_memory(model_id: &str) -> Result<Self, FilerError> {
        Self::with_connection(Connection::open_in_memory()?, model_id)
    }

    fn with_connection(conn: Connection, model_id: &str) -> Result<Self, FilerError> {
        conn.execute_batch(SCHEMA)?;

        let purged = conn.execute("DELETE FROM embeddings WHERE model_id != ?", [model_id])?;
        if purged > 0 {
            tracing::info!(purged, model = model_id, "Dropped embeddings from another model");
        }

        Ok(Self {
            conn: Mutex::new(conn),
            model_id: model_id.to_string(),
            memo: RwLock::new(HashMap::new()),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn get(&self, content_hash: &str) -> Result<Option<Embedding>, FilerError> {
        if let Some(hit) = self.memo.read().map_err(lock_poisoned)?.get(content_hash) {
            return Ok(Some(hit.clone()));
        }

        let row: Option<(Vec<u8>, i64)> = {
            let conn = self.conn.lock().map_err(lock_poisoned)?;
            conn.query_row(
                "SELECT embedding, embedding_dim FROM embeddings WHERE content_hash = ? AND model_id = ?",
                params![content_hash, self.model_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
        };

        let Some((bytes, dim)) = row else {
            return Ok(None);
        };
        let embedding = bytes_to_embedding(&bytes);
        if embedding.len() as i64 != dim {
            tracing::warn!(hash = content_hash, "Ignoring truncated cached embedding");
            return Ok(None);
        }

        self.memo
            .write()
            .map_err(lock_poisoned)?
            .insert(content_hash.to_string(), embedding.clone());
        Ok(Some(embedding))
    }

    pub fn put(&self, content_hash: &str, embedding: &[f32]) -> Result<(), FilerError> {
        {
            let conn = self.conn.lock().map_err(lock_poisoned)?;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO embeddings (content_hash, model_id, embedding, embedding_dim, created_at)
                VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
                "#,
                params![
                    content_hash,
                    self.model_id,
                    embedding_to_bytes(embedding),
                    embedding.len() as i64
                ],
            )?;
        }

        self.memo
            .write()
            .map_err(lock_poisoned)?
            .insert(content_hash.to_string(), embedding.to_vec());
        Ok(())
    }

    /// Number of vectors stored for the current model.
    pub fn len(&self) -> Result<usize, FilerError> {
        let conn = self.conn.lock().map_err(lock_poisoned)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM embeddings WHERE model_id = ?",
            [&self.model_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, FilerError> {
        Ok(self.len()? == 0)
    }
}

fn lock_poisoned<E: std::fmt::Display>(e: E) -> FilerError {
    FilerError::Cache(format!("lock poisoned: {}", e))
}

/// Convert f32 slice to bytes for storage
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding(bytes: &[u8]) -> Embedding {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
