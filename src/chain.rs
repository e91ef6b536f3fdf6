use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, LlmClient, parse_index_list, strip_reasoning};
use crate::prompts::PromptEngine;
use crate::router::CollectionRouter;
use crate::store::{Embedder, EvidenceStore, RetrievedItem, dedup};

/// The literal an LLM is instructed to return when retrieved documents
/// do not answer the sub-query. Seeing it skips the supporting-document
/// call for that iteration.
const NO_RELEVANT_INFO: &str = "No relevant information found";

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub max_iter: usize,
    pub early_stopping: bool,
    pub text_window_splitter: bool,
    pub top_k: usize,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            max_iter: 4,
            early_stopping: false,
            text_window_splitter: true,
            top_k: 5,
        }
    }
}

/// One completed iteration of the chain: the follow-up question, the
/// answer derived from retrieval, and the items judged to support it.
#[derive(Debug, Clone)]
pub struct IntermediateStep {
    pub sub_query: String,
    pub answer: String,
    pub supporting: Vec<RetrievedItem>,
}

/// Result of a retrieval-only chain run.
#[derive(Debug)]
pub struct ChainOutcome {
    pub items: Vec<RetrievedItem>,
    pub steps: Vec<IntermediateStep>,
    pub token_usage: u64,
}

/// Result of a full chain run including final-answer synthesis.
#[derive(Debug)]
pub struct ChainAnswer {
    pub answer: String,
    pub items: Vec<RetrievedItem>,
    pub steps: Vec<IntermediateStep>,
    pub token_usage: u64,
}

/// Iterative retrieval engine: decomposes the main query into simple
/// follow-up questions, retrieves evidence for each, filters it to the
/// items that support the intermediate answer, and finally combines
/// everything into one answer.
pub struct ChainRetriever<L, E, M> {
    llm: Arc<L>,
    store: Arc<E>,
    embedder: Arc<M>,
    router: CollectionRouter<L>,
    prompts: Arc<PromptEngine>,
    settings: ChainSettings,
}

impl<L, E, M> ChainRetriever<L, E, M>
where
    L: LlmClient,
    E: EvidenceStore,
    M: Embedder,
{
    pub fn new(
        llm: Arc<L>,
        store: Arc<E>,
        embedder: Arc<M>,
        router: CollectionRouter<L>,
        prompts: Arc<PromptEngine>,
        settings: ChainSettings,
    ) -> Self {
        Self {
            llm,
            store,
            embedder,
            router,
            prompts,
            settings,
        }
    }

    /// Run the iterative retrieval loop without final-answer synthesis.
    /// `max_iter` overrides the configured cap when given (fix-round
    /// research uses 2).
    pub async fn retrieve(&self, query: &str, max_iter: Option<usize>) -> Result<ChainOutcome> {
        let max_iter = max_iter.unwrap_or(self.settings.max_iter);
        let mut steps: Vec<IntermediateStep> = Vec::new();
        let mut pool: Vec<RetrievedItem> = Vec::new();
        let mut token_usage: u64 = 0;

        for iter in 0..max_iter {
            info!(iteration = iter + 1, max_iter, "chain iteration");

            let (sub_query, n0) = self.next_sub_query(query, &steps).await?;
            debug!(%sub_query, "follow-up question");

            let (answer, retrieved, n1) = self.retrieve_and_answer(&sub_query).await?;
            let (supporting, n2) = self
                .supporting_documents(&retrieved, &sub_query, &answer)
                .await;

            pool.extend(supporting.iter().cloned());
            steps.push(IntermediateStep {
                sub_query,
                answer,
                supporting,
            });
            token_usage += n0 + n1 + n2;

            if self.settings.early_stopping {
                let (enough, n3) = self.has_enough_info(query, &steps).await?;
                token_usage += n3;
                if enough {
                    info!(iteration = iter + 1, "early stop: enough information");
                    break;
                }
            }
        }

        Ok(ChainOutcome {
            items: dedup(pool),
            steps,
            token_usage,
        })
    }

    /// Full run: retrieve, then synthesize a final answer over the
    /// complete evidence pool and intermediate context.
    pub async fn query(&self, query: &str) -> Result<ChainAnswer> {
        let outcome = self.retrieve(query, None).await?;
        info!(
            items = outcome.items.len(),
            steps = outcome.steps.len(),
            "synthesizing final answer"
        );

        let mut vars = HashMap::new();
        vars.insert(
            "retrieved_documents".to_string(),
            self.format_documents(&outcome.items),
        );
        vars.insert(
            "intermediate_context".to_string(),
            format_context(&outcome.steps),
        );
        vars.insert("query".to_string(), query.to_string());
        let prompt = self.prompts.render_phase("final-answer", &vars)?;

        let reply = self.llm.chat(&[ChatMessage::user(prompt)]).await?;
        Ok(ChainAnswer {
            answer: strip_reasoning(&reply.content).to_string(),
            items: outcome.items,
            steps: outcome.steps,
            token_usage: outcome.token_usage + reply.total_tokens,
        })
    }

    async fn next_sub_query(
        &self,
        query: &str,
        steps: &[IntermediateStep],
    ) -> Result<(String, u64)> {
        let mut vars = HashMap::new();
        vars.insert("query".to_string(), query.to_string());
        vars.insert("intermediate_context".to_string(), format_context(steps));
        let prompt = self.prompts.render_phase("followup", &vars)?;

        let reply = self.llm.chat(&[ChatMessage::user(prompt)]).await?;
        Ok((
            strip_reasoning(&reply.content).to_string(),
            reply.total_tokens,
        ))
    }

    /// Route, embed, fan out a search per selected collection, then ask
    /// the LLM for an intermediate answer over the deduplicated union.
    /// Index failures degrade to an empty batch for that collection.
    async fn retrieve_and_answer(
        &self,
        sub_query: &str,
    ) -> Result<(String, Vec<RetrievedItem>, u64)> {
        let (collections, route_tokens) = self.router.route(sub_query).await?;

        let vector = match self.embedder.embed(sub_query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "embedding failed, skipping retrieval for sub-query");
                Vec::new()
            }
        };

        let retrieved = if vector.is_empty() {
            Vec::new()
        } else {
            let searches = collections.iter().map(|collection| {
                let vector = &vector;
                async move {
                    info!(%collection, sub_query, "searching collection");
                    match self
                        .store
                        .search(collection, vector, sub_query, self.settings.top_k)
                        .await
                    {
                        Ok(items) => items,
                        Err(e) => {
                            warn!(%collection, error = %e, "collection search failed");
                            Vec::new()
                        }
                    }
                }
            });
            dedup(join_all(searches).await.into_iter().flatten().collect())
        };

        let mut vars = HashMap::new();
        vars.insert(
            "retrieved_documents".to_string(),
            self.format_documents(&retrieved),
        );
        vars.insert("sub_query".to_string(), sub_query.to_string());
        let prompt = self.prompts.render_phase("intermediate-answer", &vars)?;

        let reply = self.llm.chat(&[ChatMessage::user(prompt)]).await?;
        Ok((
            strip_reasoning(&reply.content).to_string(),
            retrieved,
            route_tokens + reply.total_tokens,
        ))
    }

    /// Ask the LLM which retrieved items support the Q-A pair. A
    /// negative intermediate answer skips the call entirely. Any parse
    /// or transport failure keeps the full retrieved set, an error-safe
    /// superset.
    async fn supporting_documents(
        &self,
        retrieved: &[RetrievedItem],
        sub_query: &str,
        answer: &str,
    ) -> (Vec<RetrievedItem>, u64) {
        if answer.contains(NO_RELEVANT_INFO) || retrieved.is_empty() {
            return (Vec::new(), 0);
        }

        let mut vars = HashMap::new();
        vars.insert(
            "retrieved_documents".to_string(),
            self.format_documents(retrieved),
        );
        vars.insert("sub_query".to_string(), sub_query.to_string());
        vars.insert("answer".to_string(), answer.to_string());
        let prompt = match self.prompts.render_phase("supported-docs", &vars) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "supported-docs prompt failed, keeping all items");
                return (retrieved.to_vec(), 0);
            }
        };

        let reply = match self.llm.chat(&[ChatMessage::user(prompt)]).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "supported-docs call failed, keeping all items");
                return (retrieved.to_vec(), 0);
            }
        };

        match parse_index_list(&reply.content) {
            Ok(indices) => {
                let supporting = indices
                    .into_iter()
                    .filter_map(|i| retrieved.get(i).cloned())
                    .collect();
                (supporting, reply.total_tokens)
            }
            Err(e) => {
                warn!(error = %e, reply = %reply.content, "could not parse supporting indices, keeping all items");
                (retrieved.to_vec(), reply.total_tokens)
            }
        }
    }

    async fn has_enough_info(
        &self,
        query: &str,
        steps: &[IntermediateStep],
    ) -> Result<(bool, u64)> {
        if steps.is_empty() {
            return Ok((false, 0));
        }

        let mut vars = HashMap::new();
        vars.insert("query".to_string(), query.to_string());
        vars.insert("intermediate_context".to_string(), format_context(steps));
        let prompt = self.prompts.render_phase("reflection", &vars)?;

        let reply = self.llm.chat(&[ChatMessage::user(prompt)]).await?;
        let enough = strip_reasoning(&reply.content).trim().to_lowercase() == "yes";
        Ok((enough, reply.total_tokens))
    }

    fn format_documents(&self, items: &[RetrievedItem]) -> String {
        format_documents(items, self.settings.text_window_splitter)
    }
}

/// Render the running context as numbered query/answer pairs, in
/// iteration order.
pub fn format_context(steps: &[IntermediateStep]) -> String {
    steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            format!(
                "Intermediate query{n}: {q}\nIntermediate answer{n}: {a}",
                n = i + 1,
                q = step.sub_query,
                a = step.answer
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render items as `<Document i>` blocks. When windowed context is
/// enabled and an item carries `wider_text`, the wider window is used.
pub fn format_documents(items: &[RetrievedItem], text_window_splitter: bool) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let text = if text_window_splitter {
                item.metadata
                    .get("wider_text")
                    .map(String::as_str)
                    .unwrap_or(&item.text)
            } else {
                &item.text
            };
            format!("<Document {i}>\n{text}\n</Document {i}>")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
