use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, ChatReply, LlmClient};
use crate::scraper::{OnlineScraper, ScrapeOptions, ScrapePage};
use crate::store::{Embedder, EvidenceStore, Provenance, RetrievedItem};

/// Scripted LLM: pops canned replies in order; errs when exhausted.
pub struct FakeLlm {
    replies: Mutex<Vec<Result<ChatReply>>>,
    pub prompts_seen: Mutex<Vec<String>>,
}

impl FakeLlm {
    pub fn new(replies: Vec<Result<ChatReply>>) -> Self {
        Self {
            replies: Mutex::new(replies),
            prompts_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(content: &str) -> Result<ChatReply> {
        Ok(ChatReply {
            content: content.to_string(),
            total_tokens: 10,
        })
    }

    pub fn failure(detail: &str) -> Result<ChatReply> {
        Err(Error::Llm(detail.to_string()))
    }
}

impl LlmClient for FakeLlm {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<ChatReply> {
        if let Some(last) = messages.last() {
            self.prompts_seen.lock().unwrap().push(last.content.clone());
        }
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            return Err(Error::Llm("fake llm exhausted".to_string()));
        }
        replies.remove(0)
    }
}

/// Evidence store returning a fixed item list per search call, or an
/// error when constructed with `failing()`.
pub struct FakeStore {
    batches: Mutex<Vec<Vec<RetrievedItem>>>,
    failing: bool,
}

impl FakeStore {
    pub fn new(batches: Vec<Vec<RetrievedItem>>) -> Self {
        Self {
            batches: Mutex::new(batches),
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            failing: true,
        }
    }
}

impl EvidenceStore for FakeStore {
    async fn search(
        &self,
        _collection: &str,
        _vector: &[f32],
        _query_text: &str,
        _top_k: usize,
    ) -> Result<Vec<RetrievedItem>> {
        if self.failing {
            return Err(Error::Retriever("index unavailable".to_string()));
        }
        let mut batches = self.batches.lock().unwrap();
        if batches.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(batches.remove(0))
        }
    }
}

pub struct FakeEmbedder;

impl Embedder for FakeEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![0.1, 0.2, 0.3])
    }
}

/// Scraper returning a fixed result set, or failing when empty-armed.
pub struct FakeScraper {
    results: Vec<RetrievedItem>,
    failing: bool,
}

impl FakeScraper {
    pub fn new(results: Vec<RetrievedItem>) -> Self {
        Self {
            results,
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            results: Vec::new(),
            failing: true,
        }
    }
}

impl OnlineScraper for FakeScraper {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<RetrievedItem>> {
        if self.failing {
            return Err(Error::Scraper("scrape api unavailable".to_string()));
        }
        Ok(self.results.iter().take(limit).cloned().collect())
    }

    async fn scrape(&self, url: &str, _options: &ScrapeOptions) -> Result<ScrapePage> {
        if self.failing {
            return Err(Error::Scraper("scrape api unavailable".to_string()));
        }
        Ok(ScrapePage {
            url: url.to_string(),
            title: "page".to_string(),
            markdown: "content".to_string(),
        })
    }
}

/// A local-provenance item with the given text.
pub fn local_item(text: &str) -> RetrievedItem {
    RetrievedItem {
        source_id: format!("local:{text}"),
        title: format!("doc {text}"),
        reference: format!("docs/{text}.md"),
        text: text.to_string(),
        score: 0.9,
        provenance: Provenance::Local,
        metadata: HashMap::new(),
    }
}

/// An online-provenance item with the given text.
pub fn online_item(text: &str) -> RetrievedItem {
    RetrievedItem {
        source_id: format!("web:{text}"),
        title: format!("page {text}"),
        reference: format!("https://example.com/{text}"),
        text: text.to_string(),
        score: 1.0,
        provenance: Provenance::Online,
        metadata: HashMap::new(),
    }
}
