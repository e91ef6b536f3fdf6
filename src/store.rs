use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};

/// Where a retrieved item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Local,
    Online,
    Chain,
}

impl Provenance {
    pub fn label(&self) -> &'static str {
        match self {
            Provenance::Local => "local",
            Provenance::Online => "online",
            Provenance::Chain => "chain",
        }
    }
}

/// One ranked snippet of evidence. Items are content-addressed by a
/// stable hash of `text` for deduplication.
#[derive(Debug, Clone)]
pub struct RetrievedItem {
    pub source_id: String,
    pub title: String,
    /// URL for online items, project-relative path for local ones.
    pub reference: String,
    pub text: String,
    pub score: f64,
    pub provenance: Provenance,
    pub metadata: HashMap<String, String>,
}

impl RetrievedItem {
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.text.hash(&mut hasher);
        hasher.finish()
    }

    /// Placeholder item recording a failed or unavailable source.
    pub fn placeholder(title: &str, detail: &str, provenance: Provenance) -> Self {
        Self {
            source_id: String::new(),
            title: title.to_string(),
            reference: String::new(),
            text: detail.to_string(),
            score: 0.0,
            provenance,
            metadata: HashMap::new(),
        }
    }
}

/// Remove items whose text hash has already been seen, preserving
/// first-seen order. Idempotent: running it twice yields the same
/// sequence.
pub fn dedup(items: Vec<RetrievedItem>) -> Vec<RetrievedItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.content_hash()))
        .collect()
}

pub trait EvidenceStore: Send + Sync {
    /// Dense-vector search in one collection.
    fn search(
        &self,
        collection: &str,
        vector: &[f32],
        query_text: &str,
        top_k: usize,
    ) -> impl std::future::Future<Output = Result<Vec<RetrievedItem>>> + Send;
}

pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str)
    -> impl std::future::Future<Output = Result<Vec<f32>>> + Send;
}

// ---------------------------------------------------------------------------
// HTTP backends
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IndexHit {
    text: String,
    score: f64,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct IndexResponse {
    #[serde(default)]
    results: Vec<IndexHit>,
}

/// Client for a vector-index HTTP service exposing
/// `POST /collections/<name>/search`.
#[derive(Clone)]
pub struct HttpEvidenceStore {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpEvidenceStore {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn search_blocking(
        &self,
        collection: &str,
        vector: &[f32],
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedItem>> {
        let url = format!("{}/collections/{collection}/search", self.base_url);
        let body = serde_json::json!({
            "vector": vector,
            "query_text": query_text,
            "top_k": top_k,
        });

        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(&body)
            .map_err(|e| Error::Retriever(format!("index search failed: {e}")))?;

        let parsed: IndexResponse = response
            .into_json()
            .map_err(|e| Error::Retriever(format!("failed to parse index response: {e}")))?;

        let items = parsed
            .results
            .into_iter()
            .map(|hit| {
                let title = hit
                    .metadata
                    .get("title")
                    .cloned()
                    .unwrap_or_else(|| "untitled".to_string());
                let reference = hit
                    .metadata
                    .get("url")
                    .or_else(|| hit.metadata.get("file_path"))
                    .cloned()
                    .unwrap_or_default();
                RetrievedItem {
                    source_id: format!("{collection}:{}", short_hash(&hit.text)),
                    title,
                    reference,
                    text: hit.text,
                    score: hit.score,
                    provenance: Provenance::Local,
                    metadata: hit.metadata,
                }
            })
            .collect();
        Ok(items)
    }
}

impl EvidenceStore for HttpEvidenceStore {
    async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        query_text: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievedItem>> {
        let client = self.clone();
        let collection = collection.to_string();
        let vector = vector.to_vec();
        let query_text = query_text.to_string();
        tokio::task::spawn_blocking(move || {
            client.search_blocking(&collection, &vector, &query_text, top_k)
        })
        .await
        .map_err(|e| Error::Retriever(format!("search task failed: {e}")))?
    }
}

fn short_hash(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
#[derive(Clone)]
pub struct HttpEmbedder {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpEmbedder {
    pub fn new(base_url: &str, api_key: &str, model: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn embed_blocking(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let response = self
            .agent
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("Content-Type", "application/json")
            .send_json(&body)
            .map_err(|e| Error::Retriever(format!("embedding request failed: {e}")))?;

        let json: serde_json::Value = response
            .into_json()
            .map_err(|e| Error::Retriever(format!("failed to parse embedding response: {e}")))?;

        let vector = json["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| Error::Retriever("embedding response missing vector".to_string()))?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Vec<f32>>();

        if vector.is_empty() {
            warn!("embedding backend returned an empty vector");
        }
        Ok(vector)
    }
}

impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let client = self.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || client.embed_blocking(&text))
            .await
            .map_err(|e| Error::Retriever(format!("embedding task failed: {e}")))?
    }
}
