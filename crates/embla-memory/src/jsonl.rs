// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! File-backed conversation store: one JSONL file per session.
//!
//! Each line is a self-contained record with a timestamp and the message,
//! so a session file survives partial writes (a torn trailing line is
//! skipped on load) and can be inspected with standard shell tools.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use embla_model::Message;

use crate::store::{CompactionPolicy, ConversationStore};

#[derive(Serialize, Deserialize)]
struct StoredLine {
    ts: DateTime<Utc>,
    msg: Message,
}

pub struct JsonlConversationStore {
    dir: PathBuf,
}

impl JsonlConversationStore {
    /// Open (creating the directory if needed).
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        // Session ids contain separators like `channel:1234`; keep filenames
        // portable.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    fn read_lines(path: &Path) -> anyhow::Result<Vec<StoredLine>> {
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(path)?;
        let mut out = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredLine>(line) {
                Ok(l) => out.push(l),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping corrupt line"),
            }
        }
        Ok(out)
    }

    fn write_lines(path: &Path, lines: &[StoredLine]) -> anyhow::Result<()> {
        let mut text = String::new();
        for l in lines {
            text.push_str(&serde_json::to_string(l)?);
            text.push('\n');
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonlConversationStore {
    async fn append(&self, session_id: &str, messages: &[Message]) -> anyhow::Result<()> {
        use std::io::Write;
        // Build the full payload first so the append is all-or-nothing.
        let now = Utc::now();
        let mut payload = String::new();
        for msg in messages {
            let line = StoredLine { ts: now, msg: msg.clone() };
            payload.push_str(&serde_json::to_string(&line)?);
            payload.push('\n');
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_path(session_id))?;
        file.write_all(payload.as_bytes())?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> anyhow::Result<Vec<Message>> {
        let lines = Self::read_lines(&self.session_path(session_id))?;
        Ok(lines.into_iter().map(|l| l.msg).collect())
    }

    async fn delete(&self, session_id: &str) -> anyhow::Result<()> {
        let path = self.session_path(session_id);
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn compact(&self, policy: CompactionPolicy) -> anyhow::Result<usize> {
        let cutoff = policy
            .max_age_days
            .map(|days| Utc::now() - Duration::days(days as i64));
        let mut removed = 0usize;

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let lines = Self::read_lines(&path)?;
            let before = lines.len();
            let mut kept: Vec<StoredLine> = match cutoff {
                Some(cutoff) => lines.into_iter().filter(|l| l.ts >= cutoff).collect(),
                None => lines,
            };
            if let Some(max) = policy.max_messages {
                if kept.len() > max {
                    kept = kept.split_off(kept.len() - max);
                }
            }
            removed += before - kept.len();
            if kept.is_empty() {
                std::fs::remove_file(&path)?;
            } else if kept.len() != before {
                Self::write_lines(&path, &kept)?;
            }
        }
        Ok(removed)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
