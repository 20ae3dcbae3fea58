// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use embla_model::Message;

/// Category of a durable memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryCategory {
    Fact,
    Preference,
    Decision,
    Project,
    Entity,
}

impl std::str::FromStr for MemoryCategory {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(Self::Fact),
            "preference" => Ok(Self::Preference),
            "decision" => Ok(Self::Decision),
            "project" => Ok(Self::Project),
            "entity" => Ok(Self::Entity),
            _ => Err(()),
        }
    }
}

/// One durable fact extracted from a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: String,
    pub category: MemoryCategory,
}

/// Long-term memory collaborator.  Both operations are best-effort; the
/// agent core tolerates absence of a store entirely.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Return concatenated snippets relevant to `query`, or an empty string
    /// when nothing clears the threshold.
    async fn recall(&self, query: &str, limit: usize, threshold: f32) -> String;

    /// Persist one entry.
    async fn store(&self, entry: MemoryEntry) -> anyhow::Result<()>;
}

/// Conversation history collaborator.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Append messages to a session's history.  The write is atomic per
    /// call: either all messages land or none do.
    async fn append(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()>;

    async fn load(&self, session_id: &str) -> anyhow::Result<Vec<Message>>;

    async fn delete(&self, session_id: &str) -> anyhow::Result<()>;

    /// Prune stored history; returns the number of messages removed.
    async fn compact(&self, policy: CompactionPolicy) -> anyhow::Result<usize>;
}

/// Retention policy for [`ConversationStore::compact`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CompactionPolicy {
    /// Drop messages older than this many days.
    pub max_age_days: Option<u32>,
    /// Keep at most this many trailing messages per session.
    pub max_messages: Option<usize>,
}

// ─── In-memory implementations ────────────────────────────────────────────────

/// Keyword-overlap memory store.  Not a vector database — recall scores an
/// entry by the fraction of query words appearing in its key or value.
/// Good enough for tests and small local setups.
#[derive(Default)]
pub struct InMemoryMemoryStore {
    entries: Mutex<Vec<MemoryEntry>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.entries.lock().unwrap().clone()
    }
}

fn score(query_words: &[String], entry: &MemoryEntry) -> f32 {
    if query_words.is_empty() {
        return 0.0;
    }
    let haystack = format!("{} {}", entry.key, entry.value).to_lowercase();
    let hits = query_words.iter().filter(|w| haystack.contains(w.as_str())).count();
    hits as f32 / query_words.len() as f32
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn recall(&self, query: &str, limit: usize, threshold: f32) -> String {
        let query_words: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .map(str::to_string)
            .collect();
        let entries = self.entries.lock().unwrap();
        let mut scored: Vec<(f32, &MemoryEntry)> = entries
            .iter()
            .map(|e| (score(&query_words, e), e))
            .filter(|(s, _)| *s >= threshold && *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, e)| format!("- {}: {}", e.key, e.value))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn store(&self, entry: MemoryEntry) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().unwrap();
        // Same key overwrites — a flushed fact supersedes its older version.
        if let Some(existing) = entries.iter_mut().find(|e| e.key == entry.key) {
            *existing = entry;
        } else {
            entries.push(entry);
        }
        Ok(())
    }
}

/// Conversation store backed by a process-local map.  Used by tests and by
/// callers that want history continuity without persistence.
#[derive(Default)]
pub struct InMemoryConversationStore {
    sessions: Mutex<std::collections::HashMap<String, Vec<Message>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        self.sessions
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .extend(messages.iter().cloned());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete(&self, session_id: &str) -> anyhow::Result<()> {
        self.sessions.lock().unwrap().remove(session_id);
        Ok(())
    }

    async fn compact(&self, policy: CompactionPolicy) -> anyhow::Result<usize> {
        let mut removed = 0;
        if let Some(max) = policy.max_messages {
            let mut sessions = self.sessions.lock().unwrap();
            for msgs in sessions.values_mut() {
                if msgs.len() > max {
                    removed += msgs.len() - max;
                    let keep = msgs.split_off(msgs.len() - max);
                    *msgs = keep;
                }
            }
        }
        Ok(removed)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str) -> MemoryEntry {
        MemoryEntry { key: key.into(), value: value.into(), category: MemoryCategory::Fact }
    }

    // ── MemoryCategory ────────────────────────────────────────────────────────

    #[test]
    fn category_parses_all_known_values() {
        for (s, c) in [
            ("fact", MemoryCategory::Fact),
            ("preference", MemoryCategory::Preference),
            ("decision", MemoryCategory::Decision),
            ("project", MemoryCategory::Project),
            ("entity", MemoryCategory::Entity),
        ] {
            assert_eq!(s.parse::<MemoryCategory>().unwrap(), c);
        }
    }

    #[test]
    fn category_rejects_unknown_value() {
        assert!("opinion".parse::<MemoryCategory>().is_err());
    }

    // ── InMemoryMemoryStore ───────────────────────────────────────────────────

    #[tokio::test]
    async fn store_and_recall_by_keyword() {
        let m = InMemoryMemoryStore::new();
        m.store(entry("favourite_editor", "The user prefers helix over vim."))
            .await
            .unwrap();
        let hits = m.recall("which editor does the user like", 5, 0.1).await;
        assert!(hits.contains("favourite_editor"));
    }

    #[tokio::test]
    async fn recall_unrelated_query_returns_empty() {
        let m = InMemoryMemoryStore::new();
        m.store(entry("deploy_target", "Production runs on fly.io.")).await.unwrap();
        let hits = m.recall("weather tomorrow zurich", 5, 0.3).await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn recall_respects_limit() {
        let m = InMemoryMemoryStore::new();
        for i in 0..10 {
            m.store(entry(&format!("build_fact_{i}"), "the build uses cargo"))
                .await
                .unwrap();
        }
        let hits = m.recall("cargo build", 3, 0.1).await;
        assert_eq!(hits.lines().count(), 3);
    }

    #[tokio::test]
    async fn same_key_overwrites() {
        let m = InMemoryMemoryStore::new();
        m.store(entry("k", "old")).await.unwrap();
        m.store(entry("k", "new")).await.unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.entries()[0].value, "new");
    }

    // ── InMemoryConversationStore ─────────────────────────────────────────────

    #[tokio::test]
    async fn append_load_round_trip() {
        use embla_model::Message;
        let s = InMemoryConversationStore::new();
        s.append("cli:default", &[Message::user("hi"), Message::assistant("hello")])
            .await
            .unwrap();
        let loaded = s.load("cli:default").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].as_text(), Some("hi"));
    }

    #[tokio::test]
    async fn load_unknown_session_is_empty() {
        let s = InMemoryConversationStore::new();
        assert!(s.load("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_session() {
        use embla_model::Message;
        let s = InMemoryConversationStore::new();
        s.append("x", &[Message::user("hi")]).await.unwrap();
        s.delete("x").await.unwrap();
        assert!(s.load("x").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn compact_caps_message_count() {
        use embla_model::Message;
        let s = InMemoryConversationStore::new();
        let msgs: Vec<Message> = (0..10).map(|i| Message::user(format!("m{i}"))).collect();
        s.append("x", &msgs).await.unwrap();
        let removed = s
            .compact(CompactionPolicy { max_messages: Some(4), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(removed, 6);
        let remaining = s.load("x").await.unwrap();
        assert_eq!(remaining.len(), 4);
        assert_eq!(remaining[0].as_text(), Some("m6"));
    }
}
