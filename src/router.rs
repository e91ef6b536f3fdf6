use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::llm::{ChatMessage, LlmClient, parse_index_list, strip_reasoning};
use crate::prompts::PromptEngine;

/// Chooses which vector-index collections to query for a given
/// question. Disabled routing and routing failures both degrade to
/// querying every known collection.
pub struct CollectionRouter<L> {
    llm: Arc<L>,
    prompts: Arc<PromptEngine>,
    collections: Vec<String>,
    enabled: bool,
}

impl<L: LlmClient> CollectionRouter<L> {
    pub fn new(
        llm: Arc<L>,
        prompts: Arc<PromptEngine>,
        collections: Vec<String>,
        enabled: bool,
    ) -> Self {
        Self {
            llm,
            prompts,
            collections,
            enabled,
        }
    }

    pub fn all_collections(&self) -> &[String] {
        &self.collections
    }

    /// Select the collections to search for `query`. Returns the
    /// selection plus the token usage of the routing call.
    pub async fn route(&self, query: &str) -> Result<(Vec<String>, u64)> {
        if !self.enabled || self.collections.len() <= 1 {
            return Ok((self.collections.clone(), 0));
        }

        let listing = self
            .collections
            .iter()
            .enumerate()
            .map(|(i, name)| format!("{i}: {name}"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut vars = HashMap::new();
        vars.insert("query".to_string(), query.to_string());
        vars.insert("collections".to_string(), listing);
        let prompt = self.prompts.render_phase("route-collections", &vars)?;

        let reply = match self.llm.chat(&[ChatMessage::user(prompt)]).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "collection routing failed, searching all collections");
                return Ok((self.collections.clone(), 0));
            }
        };

        let selected = match parse_index_list(strip_reasoning(&reply.content)) {
            Ok(indices) => {
                let picked: Vec<String> = indices
                    .into_iter()
                    .filter_map(|i| self.collections.get(i).cloned())
                    .collect();
                if picked.is_empty() {
                    self.collections.clone()
                } else {
                    picked
                }
            }
            Err(e) => {
                warn!(error = %e, "could not parse routing reply, searching all collections");
                self.collections.clone()
            }
        };

        debug!(?selected, "routed query to collections");
        Ok((selected, reply.total_tokens))
    }
}
