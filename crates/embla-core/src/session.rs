// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use embla_model::Message;
use tokio::sync::Mutex;

use crate::budget::TokenBudget;
use crate::mutex::SessionMutex;

/// In-memory state of one conversation.
///
/// Mutated only while the session's [`SessionMutex`] is held.  The message
/// list is append-only during a run; compaction replaces it wholesale.
#[derive(Debug)]
pub struct SessionState {
    pub id: String,
    pub messages: Vec<Message>,
    /// Running summary of messages no longer sent to the model.
    pub summary: Option<String>,
    pub budget: TokenBudget,
    /// How many messages of the dropped prefix have already been flushed to
    /// memory and folded into the summary.  Avoids re-flushing the same
    /// prefix on every turn of a long session.
    pub flushed_upto: usize,
    /// Whether persisted history was already loaded for this session.
    pub loaded_from_store: bool,
}

impl SessionState {
    pub fn new(id: impl Into<String>, context_length: usize) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            summary: None,
            budget: TokenBudget::new(context_length),
            flushed_upto: 0,
            loaded_from_store: false,
        }
    }
}

/// One session's lock plus its state.  The gate serializes runs; the state
/// mutex is only ever locked by the current gate holder, so it is never
/// contended.
pub struct SessionHandle {
    pub gate: SessionMutex,
    pub state: Mutex<SessionState>,
}

/// Shared map of live sessions, keyed by opaque session id
/// (`cli:default`, `channel:<id>`, ...).  Sessions are created lazily on
/// first message and removed only by an explicit delete.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: StdMutex<HashMap<String, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, id: &str, context_length: usize) -> Arc<SessionHandle> {
        let mut sessions = self.sessions.lock().unwrap();
        Arc::clone(sessions.entry(id.to_string()).or_insert_with(|| {
            Arc::new(SessionHandle {
                gate: SessionMutex::new(),
                state: Mutex::new(SessionState::new(id, context_length)),
            })
        }))
    }

    /// Remove a session from the registry.  Returns whether it existed.
    /// A run still holding the handle finishes on the detached state.
    pub fn remove(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().remove(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_returns_same_handle() {
        let reg = SessionRegistry::new();
        let a = reg.get_or_create("cli:default", 8192);
        let b = reg.get_or_create("cli:default", 8192);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_ids_get_distinct_handles() {
        let reg = SessionRegistry::new();
        let a = reg.get_or_create("one", 8192);
        let b = reg.get_or_create("two", 8192);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn remove_deletes_session() {
        let reg = SessionRegistry::new();
        reg.get_or_create("gone", 8192);
        assert!(reg.remove("gone"));
        assert!(!reg.remove("gone"));
        assert!(reg.is_empty());
    }

    #[test]
    fn ids_are_sorted() {
        let reg = SessionRegistry::new();
        reg.get_or_create("beta", 1);
        reg.get_or_create("alpha", 1);
        assert_eq!(reg.ids(), vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn new_session_state_is_empty() {
        let reg = SessionRegistry::new();
        let h = reg.get_or_create("s", 8192);
        let state = h.state.lock().await;
        assert!(state.messages.is_empty());
        assert!(state.summary.is_none());
        assert!(!state.loaded_from_store);
    }
}
