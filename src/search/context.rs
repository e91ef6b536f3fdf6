use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::store::RetrievedItem;

/// One completed search in a session's history.
#[derive(Debug, Clone)]
pub struct SearchTurn {
    pub query: String,
    pub answer: String,
    pub items: Vec<RetrievedItem>,
}

/// Per-session search history, bounded to `max_len` entries. Both
/// histories always have the same length: one entry each per search.
#[derive(Debug, Clone)]
pub struct SearchContext {
    pub session_id: String,
    pub query_history: Vec<String>,
    pub search_history: Vec<SearchTurn>,
    pub user_preferences: HashMap<String, String>,
    pub domain_focus: String,
}

impl SearchContext {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            query_history: Vec::new(),
            search_history: Vec::new(),
            user_preferences: HashMap::new(),
            domain_focus: "harmonyos".to_string(),
        }
    }

    /// Record one search, dropping the oldest entries when either
    /// history exceeds `max_len`.
    pub fn record(&mut self, turn: SearchTurn, max_len: usize) {
        self.query_history.push(turn.query.clone());
        self.search_history.push(turn);
        while self.query_history.len() > max_len {
            self.query_history.remove(0);
        }
        while self.search_history.len() > max_len {
            self.search_history.remove(0);
        }
    }
}

/// Registry of per-session contexts. The outer lock only guards the
/// map; each session has its own async lock so concurrent searches
/// serialize per session key, not globally.
#[derive(Default)]
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<tokio::sync::Mutex<SearchContext>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the context handle for a session key.
    pub fn handle(&self, session_id: &str) -> Arc<tokio::sync::Mutex<SearchContext>> {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(SearchContext::new(session_id))))
            .clone()
    }

    /// Record one search into a session's history.
    pub async fn record(&self, session_id: &str, turn: SearchTurn, max_len: usize) {
        let handle = self.handle(session_id);
        let mut context = handle.lock().await;
        context.record(turn, max_len);
    }

    /// Snapshot a session's context, if it exists.
    pub async fn snapshot(&self, session_id: &str) -> Option<SearchContext> {
        let handle = {
            let sessions = self.sessions.lock().expect("session registry poisoned");
            sessions.get(session_id).cloned()
        }?;
        let context = handle.lock().await;
        Some(context.clone())
    }

    /// Drop one session, or all sessions when `session_id` is `None`.
    pub fn clear(&self, session_id: Option<&str>) {
        let mut sessions = self.sessions.lock().expect("session registry poisoned");
        match session_id {
            Some(id) => {
                sessions.remove(id);
            }
            None => sessions.clear(),
        }
    }
}
