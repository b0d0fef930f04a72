//! Knowledge corpus loading and caching.
//!
//! The corpus is a directory of JSON documents listed by an `index.json`.
//! Each document is flattened to searchable text once at load time and
//! cached for the process lifetime; only an explicit force reload
//! invalidates the cache. Listed files that cannot be read or parsed are
//! logged and skipped so a single bad file never takes the corpus down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::util::normalize;

#[derive(Debug, Deserialize)]
struct KnowledgeIndex {
    files: Vec<String>,
    #[allow(dead_code)]
    #[serde(default)]
    last_updated: Option<String>,
}

/// One loaded document. `content` is the flattened text; `normalized` is
/// its NFKC-casefolded form, precomputed so search scoring stays stable
/// and cheap for one cache lifetime.
#[derive(Debug, Clone)]
pub struct Document {
    pub source: String,
    pub content: String,
    pub normalized: String,
    pub raw: serde_json::Value,
}

pub struct KnowledgeStore {
    dir: PathBuf,
    cache: RwLock<Option<Arc<Vec<Document>>>>,
}

impl KnowledgeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of cached documents, if the corpus has been loaded.
    pub async fn cached_count(&self) -> Option<usize> {
        self.cache.read().await.as_ref().map(|docs| docs.len())
    }

    /// Load the corpus, returning the cached list unless `force` is set.
    /// An unreadable index is an error; unreadable or unparseable listed
    /// files are skipped with a warning.
    pub async fn load(&self, force: bool) -> Result<Arc<Vec<Document>>> {
        if !force {
            if let Some(docs) = self.cache.read().await.as_ref() {
                return Ok(docs.clone());
            }
        }

        let index_path = self.dir.join("index.json");
        let index_raw = tokio::fs::read_to_string(&index_path)
            .await
            .with_context(|| format!("failed to read corpus index {}", index_path.display()))?;
        let index: KnowledgeIndex = serde_json::from_str(&index_raw)
            .with_context(|| format!("failed to parse corpus index {}", index_path.display()))?;

        let mut docs = Vec::with_capacity(index.files.len());
        for file in &index.files {
            let path = self.dir.join(file);
            let raw_text = match tokio::fs::read_to_string(&path).await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "skipping unreadable knowledge file");
                    continue;
                }
            };
            let raw: serde_json::Value = match serde_json::from_str(&raw_text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(file = %file, error = %e, "skipping unparseable knowledge file");
                    continue;
                }
            };
            let content = flatten(&raw);
            let normalized = normalize(&content);
            docs.push(Document {
                source: file.clone(),
                content,
                normalized,
                raw,
            });
        }
        tracing::info!(count = docs.len(), dir = %self.dir.display(), "knowledge corpus loaded");

        let docs = Arc::new(docs);
        *self.cache.write().await = Some(docs.clone());
        Ok(docs)
    }
}

/// Flatten arbitrary JSON into human-readable text. Scalars stringify,
/// arrays join with newlines, objects render each key as a 【key】 header
/// followed by the flattened value. Deterministic for a given input.
pub fn flatten(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(flatten)
            .collect::<Vec<_>>()
            .join("\n"),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("【{}】\n{}", k, flatten(v)))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
