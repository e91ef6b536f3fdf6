use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::store::{Provenance, RetrievedItem};

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

/// One step of a dynamic-page interaction sequence, executed in order
/// by the scraping backend before content extraction.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScrapeAction {
    Wait { milliseconds: u64 },
    Scroll { direction: String },
    Click { selector: String, optional: bool },
}

/// Options for a single-page scrape.
#[derive(Debug, Clone, Default)]
pub struct ScrapeOptions {
    pub formats: Vec<String>,
    pub include_selectors: Vec<String>,
    pub exclude_selectors: Vec<String>,
    pub wait_for_ms: u64,
    pub timeout_ms: u64,
    pub actions: Vec<ScrapeAction>,
}

#[derive(Debug, Clone)]
pub struct ScrapePage {
    pub url: String,
    pub title: String,
    pub markdown: String,
}

pub trait OnlineScraper: Send + Sync {
    /// Web search returning ranked snippets.
    fn search(
        &self,
        query: &str,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<RetrievedItem>>> + Send;

    /// Fetch one page with the given scrape options.
    fn scrape(
        &self,
        url: &str,
        options: &ScrapeOptions,
    ) -> impl std::future::Future<Output = Result<ScrapePage>> + Send;
}

/// Firecrawl-style scraping API client (`/v1/search`, `/v1/scrape`).
#[derive(Clone)]
pub struct FirecrawlScraper {
    agent: ureq::Agent,
    base_url: String,
    api_key: String,
}

impl FirecrawlScraper {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}{path}", self.base_url);
        let mut backoff_ms = INITIAL_BACKOFF_MS;
        for attempt in 1..=MAX_RETRIES {
            match self
                .agent
                .post(&url)
                .set("Authorization", &format!("Bearer {}", self.api_key))
                .set("Content-Type", "application/json")
                .send_json(body)
            {
                Ok(response) => {
                    return response
                        .into_json()
                        .map_err(|e| Error::Scraper(format!("failed to parse response: {e}")));
                }
                Err(ref e) if attempt < MAX_RETRIES && is_retryable(e) => {
                    warn!(attempt, error = %e, backoff_ms, "scrape request failed, retrying");
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                    backoff_ms *= 2;
                }
                Err(e) => return Err(Error::Scraper(format!("request to {path} failed: {e}"))),
            }
        }
        unreachable!("retry loop returns on final attempt")
    }

    fn search_blocking(&self, query: &str, limit: usize) -> Result<Vec<RetrievedItem>> {
        let body = serde_json::json!({
            "query": query,
            "limit": limit,
            "scrapeOptions": {"formats": ["markdown"]},
        });
        let json = self.post_json("/v1/search", &body)?;

        let hits = json["data"]
            .as_array()
            .ok_or_else(|| Error::Scraper("search response missing data".to_string()))?;

        let items = hits
            .iter()
            .take(limit)
            .map(|hit| {
                let title = hit["title"].as_str().unwrap_or("untitled").to_string();
                let url = hit["url"].as_str().unwrap_or_default().to_string();
                let text = hit["description"]
                    .as_str()
                    .or_else(|| hit["content"].as_str())
                    .or_else(|| hit["markdown"].as_str())
                    .unwrap_or_default()
                    .to_string();
                let mut metadata = HashMap::new();
                metadata.insert("url".to_string(), url.clone());
                RetrievedItem {
                    source_id: format!("web:{url}"),
                    title,
                    reference: url,
                    text,
                    score: 1.0,
                    provenance: Provenance::Online,
                    metadata,
                }
            })
            .collect();
        Ok(items)
    }

    fn scrape_blocking(&self, url: &str, options: &ScrapeOptions) -> Result<ScrapePage> {
        let mut body = serde_json::json!({
            "url": url,
            "formats": if options.formats.is_empty() {
                vec!["markdown".to_string()]
            } else {
                options.formats.clone()
            },
        });
        if !options.include_selectors.is_empty() {
            body["includeTags"] = serde_json::json!(options.include_selectors);
        }
        if !options.exclude_selectors.is_empty() {
            body["excludeTags"] = serde_json::json!(options.exclude_selectors);
        }
        if options.wait_for_ms > 0 {
            body["waitFor"] = serde_json::json!(options.wait_for_ms);
        }
        if options.timeout_ms > 0 {
            body["timeout"] = serde_json::json!(options.timeout_ms);
        }
        if !options.actions.is_empty() {
            body["actions"] = serde_json::to_value(&options.actions)
                .map_err(|e| Error::Scraper(format!("failed to serialize actions: {e}")))?;
        }

        let json = self.post_json("/v1/scrape", &body)?;
        let data = &json["data"];
        Ok(ScrapePage {
            url: url.to_string(),
            title: data["metadata"]["title"].as_str().unwrap_or("").to_string(),
            markdown: data["markdown"].as_str().unwrap_or("").to_string(),
        })
    }
}

impl OnlineScraper for FirecrawlScraper {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RetrievedItem>> {
        let client = self.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || client.search_blocking(&query, limit))
            .await
            .map_err(|e| Error::Scraper(format!("search task failed: {e}")))?
    }

    async fn scrape(&self, url: &str, options: &ScrapeOptions) -> Result<ScrapePage> {
        let client = self.clone();
        let url = url.to_string();
        let options = options.clone();
        tokio::task::spawn_blocking(move || client.scrape_blocking(&url, &options))
            .await
            .map_err(|e| Error::Scraper(format!("scrape task failed: {e}")))?
    }
}

fn is_retryable(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
        ureq::Error::Transport(_) => true,
    }
}

/// Scrape options tuned for developer-documentation portals: main
/// content only, generous waits for client-side rendering.
pub fn doc_portal_options() -> ScrapeOptions {
    ScrapeOptions {
        formats: vec!["markdown".to_string(), "links".to_string()],
        include_selectors: vec![
            ".doc-content".to_string(),
            ".markdown-body".to_string(),
            "main".to_string(),
            "article".to_string(),
        ],
        exclude_selectors: vec![
            ".navigation".to_string(),
            ".sidebar".to_string(),
            ".footer".to_string(),
            ".advertisement".to_string(),
        ],
        wait_for_ms: 3000,
        timeout_ms: 45_000,
        actions: vec![
            ScrapeAction::Wait { milliseconds: 3000 },
            ScrapeAction::Scroll {
                direction: "down".to_string(),
            },
            ScrapeAction::Click {
                selector: ".expand-content".to_string(),
                optional: true,
            },
        ],
    }
}
