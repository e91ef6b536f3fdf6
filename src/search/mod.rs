pub mod context;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::chain::ChainRetriever;
use crate::error::Result;
use crate::llm::{ChatMessage, LlmClient, strip_reasoning};
use crate::prompts::PromptEngine;
use crate::scraper::{OnlineScraper, doc_portal_options};
use crate::store::{Embedder, EvidenceStore, Provenance, RetrievedItem};
use self::context::{SearchTurn, SessionStore};

/// Queries containing any of these ask for code, not documentation;
/// adaptive mode hands them to the generation pipeline instead of a
/// search backend.
const CODE_TRIGGER_KEYWORDS: &[&str] = &[
    "generate code",
    "code example",
    "write code",
    "生成代码",
    "代码示例",
    "写代码",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    LocalOnly,
    OnlineOnly,
    Hybrid,
    ChainOfSearch,
    Adaptive,
    CodeGeneration,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local_only" => Some(SearchMode::LocalOnly),
            "online_only" => Some(SearchMode::OnlineOnly),
            "hybrid" => Some(SearchMode::Hybrid),
            "chain_of_search" => Some(SearchMode::ChainOfSearch),
            "adaptive" => Some(SearchMode::Adaptive),
            "code_generation" => Some(SearchMode::CodeGeneration),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SearchMode::LocalOnly => "local_only",
            SearchMode::OnlineOnly => "online_only",
            SearchMode::Hybrid => "hybrid",
            SearchMode::ChainOfSearch => "chain_of_search",
            SearchMode::Adaptive => "adaptive",
            SearchMode::CodeGeneration => "code_generation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Factual,
    Procedural,
    Conceptual,
    Troubleshooting,
    CodeExample,
    General,
}

impl QueryType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "factual" => Some(QueryType::Factual),
            "procedural" => Some(QueryType::Procedural),
            "conceptual" => Some(QueryType::Conceptual),
            "troubleshooting" => Some(QueryType::Troubleshooting),
            "code_example" => Some(QueryType::CodeExample),
            "general" => Some(QueryType::General),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QueryType::Factual => "factual",
            QueryType::Procedural => "procedural",
            QueryType::Conceptual => "conceptual",
            QueryType::Troubleshooting => "troubleshooting",
            QueryType::CodeExample => "code_example",
            QueryType::General => "general",
        }
    }
}

#[derive(Debug)]
pub struct SearchResult {
    pub query: String,
    pub answer: String,
    pub sources: Vec<RetrievedItem>,
    pub mode_used: SearchMode,
    pub query_type: QueryType,
    pub confidence: f64,
    pub elapsed: Duration,
    pub token_usage: u64,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub default_mode: SearchMode,
    pub max_context_length: usize,
    pub top_k: usize,
    /// Iteration cap for retrieve-only research during fix rounds.
    pub fix_max_iter: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            default_mode: SearchMode::Adaptive,
            max_context_length: 10,
            top_k: 5,
            fix_max_iter: 2,
        }
    }
}

/// Multi-source search orchestrator: dispatches a query to the local
/// chain engine, the online scraper, or both, with adaptive mode
/// selection and per-session context.
pub struct SearchOrchestrator<L, E, M, S> {
    llm: Arc<L>,
    chain: Option<ChainRetriever<L, E, M>>,
    scraper: Option<Arc<S>>,
    sessions: SessionStore,
    prompts: Arc<PromptEngine>,
    settings: SearchSettings,
    mode_usage: Mutex<HashMap<&'static str, u64>>,
}

impl<L, E, M, S> SearchOrchestrator<L, E, M, S>
where
    L: LlmClient,
    E: EvidenceStore,
    M: Embedder,
    S: OnlineScraper,
{
    pub fn new(
        llm: Arc<L>,
        chain: Option<ChainRetriever<L, E, M>>,
        scraper: Option<Arc<S>>,
        prompts: Arc<PromptEngine>,
        settings: SearchSettings,
    ) -> Self {
        Self {
            llm,
            chain,
            scraper,
            sessions: SessionStore::new(),
            prompts,
            settings,
            mode_usage: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Per-mode dispatch counts since construction.
    pub fn mode_usage(&self) -> HashMap<&'static str, u64> {
        self.mode_usage.lock().expect("stats lock poisoned").clone()
    }

    /// Execute a search. Branch failures inside a mode degrade to
    /// placeholder sources; LLM failures abort the call.
    pub async fn search(
        &self,
        query: &str,
        mode: SearchMode,
        session_id: Option<&str>,
    ) -> Result<SearchResult> {
        let started = Instant::now();

        if query.trim().is_empty() {
            return Ok(SearchResult {
                query: query.to_string(),
                answer: String::new(),
                sources: Vec::new(),
                mode_used: mode,
                query_type: QueryType::General,
                confidence: 0.5,
                elapsed: started.elapsed(),
                token_usage: 0,
                metadata: HashMap::new(),
            });
        }

        let (query_type, classify_tokens) = self.classify_query(query).await;
        let resolved = if mode == SearchMode::Adaptive {
            self.select_mode(query, query_type)
        } else {
            mode
        };
        info!(
            query,
            requested = mode.label(),
            resolved = resolved.label(),
            query_type = query_type.label(),
            "executing search"
        );
        *self
            .mode_usage
            .lock()
            .expect("stats lock poisoned")
            .entry(resolved.label())
            .or_insert(0) += 1;

        let (answer, sources, mode_used, tokens) = match resolved {
            SearchMode::LocalOnly => {
                let (a, s, t) = self.local_search(query).await?;
                (a, s, SearchMode::LocalOnly, t)
            }
            SearchMode::OnlineOnly => {
                let (a, s, t) = self.online_search(query).await?;
                (a, s, SearchMode::OnlineOnly, t)
            }
            SearchMode::Hybrid => {
                let (a, s, t) = self.hybrid_search(query).await?;
                (a, s, SearchMode::Hybrid, t)
            }
            SearchMode::ChainOfSearch => {
                if self.chain.is_some() {
                    let (a, s, t) = self.chain_search(query).await?;
                    (a, s, SearchMode::ChainOfSearch, t)
                } else {
                    warn!("chain engine unavailable, degrading to hybrid");
                    let (a, s, t) = self.hybrid_search(query).await?;
                    (a, s, SearchMode::Hybrid, t)
                }
            }
            SearchMode::CodeGeneration => {
                // Generation is driven by the control loop; the search
                // layer only reports the routing decision.
                (String::new(), Vec::new(), SearchMode::CodeGeneration, 0)
            }
            SearchMode::Adaptive => unreachable!("adaptive resolved above"),
        };

        let confidence = confidence_score(&answer, sources.len(), mode_used);
        let token_usage = classify_tokens + tokens;

        if let Some(id) = session_id.filter(|id| !id.is_empty()) {
            self.sessions
                .record(
                    id,
                    SearchTurn {
                        query: query.to_string(),
                        answer: answer.clone(),
                        items: sources.clone(),
                    },
                    self.settings.max_context_length,
                )
                .await;
        }

        let mut metadata = HashMap::new();
        metadata.insert("query_type".to_string(), query_type.label().to_string());
        if let Some(id) = session_id {
            metadata.insert("session_id".to_string(), id.to_string());
        }

        Ok(SearchResult {
            query: query.to_string(),
            answer,
            sources,
            mode_used,
            query_type,
            confidence,
            elapsed: started.elapsed(),
            token_usage,
            metadata,
        })
    }

    /// Retrieve reference material for an error-fix round: chain
    /// engine in retrieve-only form, hybrid search as the fallback.
    pub async fn research(&self, query: &str) -> Result<(Vec<RetrievedItem>, u64)> {
        if let Some(ref chain) = self.chain {
            match chain.retrieve(query, Some(self.settings.fix_max_iter)).await {
                Ok(outcome) => return Ok((outcome.items, outcome.token_usage)),
                Err(e) => {
                    warn!(error = %e, "chain research failed, degrading to hybrid");
                }
            }
        }
        let (_, sources, tokens) = self.hybrid_search(query).await?;
        Ok((sources, tokens))
    }

    async fn classify_query(&self, query: &str) -> (QueryType, u64) {
        let mut vars = HashMap::new();
        vars.insert("query".to_string(), query.to_string());
        let prompt = match self.prompts.render_phase("classify-query", &vars) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "classification prompt failed");
                return (QueryType::General, 0);
            }
        };

        match self.llm.chat(&[ChatMessage::user(prompt)]).await {
            Ok(reply) => {
                let token = strip_reasoning(&reply.content).trim().to_lowercase();
                let query_type = QueryType::parse(&token).unwrap_or(QueryType::General);
                (query_type, reply.total_tokens)
            }
            Err(e) => {
                warn!(error = %e, "query classification failed, defaulting to general");
                (QueryType::General, 0)
            }
        }
    }

    fn select_mode(&self, query: &str, query_type: QueryType) -> SearchMode {
        let lowered = query.to_lowercase();
        if CODE_TRIGGER_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
            return SearchMode::CodeGeneration;
        }
        match query_type {
            QueryType::CodeExample => SearchMode::CodeGeneration,
            QueryType::Troubleshooting => SearchMode::OnlineOnly,
            QueryType::Factual => SearchMode::Hybrid,
            QueryType::Procedural | QueryType::Conceptual => SearchMode::ChainOfSearch,
            QueryType::General => SearchMode::Hybrid,
        }
    }

    async fn local_search(&self, query: &str) -> Result<(String, Vec<RetrievedItem>, u64)> {
        let Some(ref chain) = self.chain else {
            return Ok((
                "Local knowledge base is not configured.".to_string(),
                vec![RetrievedItem::placeholder(
                    "local search",
                    "vector index unavailable",
                    Provenance::Local,
                )],
                0,
            ));
        };

        let result = chain.query(query).await?;
        let sources: Vec<RetrievedItem> =
            result.items.into_iter().take(self.settings.top_k).collect();
        Ok((result.answer, sources, result.token_usage))
    }

    async fn online_search(&self, query: &str) -> Result<(String, Vec<RetrievedItem>, u64)> {
        let Some(ref scraper) = self.scraper else {
            return Ok((
                "Online search is not configured.".to_string(),
                vec![RetrievedItem::placeholder(
                    "online search",
                    "scraping api unavailable",
                    Provenance::Online,
                )],
                0,
            ));
        };

        let scoped = format!("{query} HarmonyOS ArkTS");
        let mut items = match scraper.search(&scoped, self.settings.top_k).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "online search failed");
                return Ok((
                    format!("Online search failed: {e}"),
                    vec![RetrievedItem::placeholder(
                        "online search",
                        &e.to_string(),
                        Provenance::Online,
                    )],
                    0,
                ));
            }
        };

        if items.is_empty() {
            return Ok(("No relevant online resources found.".to_string(), items, 0));
        }

        // Thin snippets from the search API get a full-page scrape of
        // the top hit; a scrape failure only costs the enrichment.
        if let Some(top) = items.first_mut()
            && top.text.chars().count() < 200
            && !top.reference.is_empty()
        {
            match scraper.scrape(&top.reference, &doc_portal_options()).await {
                Ok(page) if !page.markdown.is_empty() => {
                    top.text = page.markdown;
                }
                Ok(_) => {}
                Err(e) => warn!(url = %top.reference, error = %e, "scrape enrichment failed"),
            }
        }

        let context = items
            .iter()
            .map(|item| format!("Title: {}\nContent: {}", item.title, item.text))
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut vars = HashMap::new();
        vars.insert("query".to_string(), query.to_string());
        vars.insert("search_context".to_string(), context);
        let prompt = self.prompts.render_phase("synthesize-online", &vars)?;

        let reply = self.llm.chat(&[ChatMessage::user(prompt)]).await?;
        Ok((
            strip_reasoning(&reply.content).to_string(),
            items,
            reply.total_tokens,
        ))
    }

    /// Run the local and online branches concurrently. A failed branch
    /// becomes a textual placeholder in the merged answer, never a
    /// propagated error; synthesis only runs when both branches held.
    async fn hybrid_search(&self, query: &str) -> Result<(String, Vec<RetrievedItem>, u64)> {
        let (local, online) = tokio::join!(self.local_search(query), self.online_search(query));

        let mut sources = Vec::new();
        let mut tokens = 0;
        let mut branch_failed = false;

        let local_answer = match local {
            Ok((answer, items, t)) => {
                sources.extend(items);
                tokens += t;
                answer
            }
            Err(e) => {
                warn!(error = %e, "local branch failed in hybrid search");
                branch_failed = true;
                format!("[local search failed: {e}]")
            }
        };
        let online_answer = match online {
            Ok((answer, items, t)) => {
                sources.extend(items);
                tokens += t;
                answer
            }
            Err(e) => {
                warn!(error = %e, "online branch failed in hybrid search");
                branch_failed = true;
                format!("[online search failed: {e}]")
            }
        };

        if branch_failed {
            let answer = format!("Local search: {local_answer}\n\nOnline search: {online_answer}");
            return Ok((answer, sources, tokens));
        }

        let mut vars = HashMap::new();
        vars.insert("query".to_string(), query.to_string());
        vars.insert("local_answer".to_string(), local_answer);
        vars.insert("online_answer".to_string(), online_answer);
        let prompt = self.prompts.render_phase("synthesize-hybrid", &vars)?;

        let reply = self.llm.chat(&[ChatMessage::user(prompt)]).await?;
        tokens += reply.total_tokens;
        Ok((strip_reasoning(&reply.content).to_string(), sources, tokens))
    }

    async fn chain_search(&self, query: &str) -> Result<(String, Vec<RetrievedItem>, u64)> {
        let chain = self
            .chain
            .as_ref()
            .expect("chain_search called without chain engine");
        let result = chain.query(query).await?;
        let sources: Vec<RetrievedItem> =
            result.items.into_iter().take(self.settings.top_k).collect();
        Ok((result.answer, sources, result.token_usage))
    }
}

/// Heuristic confidence in a search result. Constants preserved from
/// the tuning of the source system.
fn confidence_score(answer: &str, source_count: usize, mode: SearchMode) -> f64 {
    let mut confidence = 0.5;
    confidence += (0.1 * source_count as f64).min(0.3);
    confidence += match mode {
        SearchMode::Hybrid => 0.2,
        SearchMode::ChainOfSearch => 0.15,
        SearchMode::LocalOnly | SearchMode::OnlineOnly => 0.1,
        SearchMode::Adaptive | SearchMode::CodeGeneration => 0.0,
    };
    let len = answer.chars().count();
    if (100..=2000).contains(&len) {
        confidence += 0.1;
    }
    confidence.min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainSettings;
    use crate::router::CollectionRouter;
    use crate::test_helpers::{FakeEmbedder, FakeLlm, FakeScraper, FakeStore, online_item};

    type Orchestrator = SearchOrchestrator<FakeLlm, FakeStore, FakeEmbedder, FakeScraper>;

    fn orchestrator_with(
        llm_replies: Vec<Result<crate::llm::ChatReply>>,
        chain_batches: Option<Vec<Vec<RetrievedItem>>>,
        scraper: Option<FakeScraper>,
    ) -> Orchestrator {
        let llm = Arc::new(FakeLlm::new(llm_replies));
        let prompts = Arc::new(PromptEngine::new(None));
        let chain = chain_batches.map(|batches| {
            let router = CollectionRouter::new(
                llm.clone(),
                prompts.clone(),
                vec!["docs".to_string()],
                false,
            );
            ChainRetriever::new(
                llm.clone(),
                Arc::new(FakeStore::new(batches)),
                Arc::new(FakeEmbedder),
                router,
                prompts.clone(),
                ChainSettings {
                    max_iter: 1,
                    ..Default::default()
                },
            )
        });
        SearchOrchestrator::new(
            llm,
            chain,
            scraper.map(Arc::new),
            prompts,
            SearchSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_query_returns_empty_result() {
        let orchestrator = orchestrator_with(vec![], None, None);
        let result = orchestrator
            .search("   ", SearchMode::Hybrid, None)
            .await
            .unwrap();
        assert!(result.sources.is_empty());
        assert!(result.answer.is_empty());
        assert!(result.confidence <= 0.5);
        assert_eq!(result.mode_used, SearchMode::Hybrid);
    }

    #[tokio::test]
    async fn test_code_trigger_keyword_selects_code_generation() {
        // Classification reply is consumed but the keyword wins.
        let orchestrator = orchestrator_with(vec![FakeLlm::reply("general")], None, None);
        let result = orchestrator
            .search("please write code for a login page", SearchMode::Adaptive, None)
            .await
            .unwrap();
        assert_eq!(result.mode_used, SearchMode::CodeGeneration);
        assert!(result.sources.is_empty());
    }

    #[tokio::test]
    async fn test_adaptive_troubleshooting_goes_online() {
        let scraper = FakeScraper::new(vec![online_item("fix steps")]);
        let orchestrator = orchestrator_with(
            vec![
                FakeLlm::reply("troubleshooting"),
                FakeLlm::reply("try reinstalling the SDK"),
            ],
            None,
            Some(scraper),
        );
        let result = orchestrator
            .search("app crashes on startup", SearchMode::Adaptive, None)
            .await
            .unwrap();
        assert_eq!(result.mode_used, SearchMode::OnlineOnly);
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.answer, "try reinstalling the SDK");
    }

    #[tokio::test]
    async fn test_adaptive_conceptual_uses_chain() {
        // classify, then chain: followup, intermediate, supporting, final.
        let orchestrator = orchestrator_with(
            vec![
                FakeLlm::reply("conceptual"),
                FakeLlm::reply("sub q"),
                FakeLlm::reply("partial"),
                FakeLlm::reply("[0]"),
                FakeLlm::reply("the architecture works like this"),
            ],
            Some(vec![vec![crate::test_helpers::local_item("doc")]]),
            None,
        );
        let result = orchestrator
            .search("how does state management work", SearchMode::Adaptive, None)
            .await
            .unwrap();
        assert_eq!(result.mode_used, SearchMode::ChainOfSearch);
        assert_eq!(result.answer, "the architecture works like this");
        assert_eq!(result.sources.len(), 1);
    }

    #[tokio::test]
    async fn test_hybrid_branch_failure_is_isolated() {
        // classify, then the local branch's first chain call fails;
        // the online branch then synthesizes "A".
        let scraper = FakeScraper::new(vec![
            online_item("s1"),
            online_item("s2"),
            online_item("s3"),
        ]);
        let orchestrator = orchestrator_with(
            vec![
                FakeLlm::reply("general"),
                FakeLlm::failure("llm refused the local branch"),
                FakeLlm::reply("A"),
            ],
            Some(vec![vec![]]),
            Some(scraper),
        );
        let result = orchestrator
            .search("anything at all", SearchMode::Hybrid, None)
            .await
            .unwrap();

        assert!(result.answer.contains("local search failed"));
        assert!(result.answer.contains("A"));
        assert_eq!(result.sources.len(), 3);
        assert!(
            result
                .sources
                .iter()
                .all(|s| s.provenance == Provenance::Online)
        );
    }

    #[tokio::test]
    async fn test_chain_mode_degrades_to_hybrid_without_chain() {
        let scraper = FakeScraper::new(vec![online_item("w")]);
        let orchestrator = orchestrator_with(
            vec![
                FakeLlm::reply("general"),
                FakeLlm::reply("online synthesis"),
                FakeLlm::reply("merged"),
            ],
            None,
            Some(scraper),
        );
        let result = orchestrator
            .search("something", SearchMode::ChainOfSearch, None)
            .await
            .unwrap();
        assert_eq!(result.mode_used, SearchMode::Hybrid);
    }

    #[tokio::test]
    async fn test_session_histories_updated_in_lockstep() {
        let scraper = FakeScraper::new(vec![online_item("w")]);
        let orchestrator = orchestrator_with(
            vec![
                FakeLlm::reply("troubleshooting"),
                FakeLlm::reply("answer one"),
                FakeLlm::reply("troubleshooting"),
                FakeLlm::reply("answer two"),
            ],
            None,
            Some(scraper),
        );
        for q in ["q one", "q two"] {
            orchestrator
                .search(q, SearchMode::Adaptive, Some("sess"))
                .await
                .unwrap();
        }
        let context = orchestrator.sessions().snapshot("sess").await.unwrap();
        assert_eq!(context.query_history.len(), 2);
        assert_eq!(context.search_history.len(), 2);
    }

    #[tokio::test]
    async fn test_classification_failure_defaults_to_general() {
        let scraper = FakeScraper::new(vec![online_item("w")]);
        let orchestrator = orchestrator_with(
            vec![
                FakeLlm::failure("classifier down"),
                FakeLlm::reply("local unavailable is fine"),
                FakeLlm::reply("merged"),
            ],
            None,
            Some(scraper),
        );
        let result = orchestrator
            .search("a general question", SearchMode::Adaptive, None)
            .await
            .unwrap();
        assert_eq!(result.query_type, QueryType::General);
        assert_eq!(result.mode_used, SearchMode::Hybrid);
    }

    #[test]
    fn test_confidence_formula_constants() {
        // 0.5 base + 0.3 source cap + 0.2 hybrid + 0.1 length, capped at 1.0.
        let long_answer = "x".repeat(150);
        assert_eq!(confidence_score(&long_answer, 5, SearchMode::Hybrid), 1.0);
        // 0.5 + 0.1 + 0.15 = 0.75 (short answer, one source, chain).
        let c = confidence_score("short", 1, SearchMode::ChainOfSearch);
        assert!((c - 0.75).abs() < 1e-9);
        // Answer over 2000 chars gets no length bonus.
        let too_long = "x".repeat(2500);
        let c = confidence_score(&too_long, 0, SearchMode::LocalOnly);
        assert!((c - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_mode_and_type_parsing() {
        assert_eq!(SearchMode::parse("hybrid"), Some(SearchMode::Hybrid));
        assert_eq!(SearchMode::parse("bogus"), None);
        assert_eq!(QueryType::parse("factual"), Some(QueryType::Factual));
        assert_eq!(QueryType::parse("nonsense"), None);
    }
}
