// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Conversation compression.
//!
//! Two distinct operations run when context fitting drops messages, in a
//! fixed order: first the *memory flush* extracts durable structured facts
//! (literal values: paths, ids, error strings) into the memory store, then
//! the *summarizer* compresses the dropped prefix into a running textual
//! summary.  Flush before summarize, never the other way around — the
//! summary compresses away exactly the literals the flush preserves.

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use embla_memory::{MemoryCategory, MemoryEntry};
use embla_model::{
    CompletionRequest, Message, MessageContent, ModelProvider, ResponseEvent, Role,
};

const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     as a concise bullet list. Preserve technical details, decisions, file names, and tool \
     outputs that may matter for future turns. The summary will replace the original \
     history to free up context space. Reply with the bullet list only.";

const FLUSH_PROMPT: &str = "\
Extract durable facts from the conversation below. Reply with ONLY a JSON array, no prose. \
Each element must be an object {\"key\": snake_case_identifier, \"value\": \"1-3 sentences\", \
\"category\": one of \"fact\", \"preference\", \"decision\", \"project\", \"entity\"}. \
Prefer literal values: file paths, identifiers, error messages, names. \
Reply with [] if nothing is worth keeping.";

/// Drive a single non-streaming completion and accumulate its text.
async fn collect_text(
    provider: &dyn ModelProvider,
    messages: Vec<Message>,
) -> anyhow::Result<String> {
    let req = CompletionRequest { messages, stream: true, ..Default::default() };
    let mut stream = provider.complete(req).await?;
    let mut text = String::new();
    while let Some(ev) = stream.next().await {
        match ev? {
            ResponseEvent::TextDelta(t) => text.push_str(&t),
            ResponseEvent::Done => break,
            _ => {}
        }
    }
    Ok(text)
}

/// Serialise a message list into plain text for inclusion in a prompt.
///
/// System messages are skipped, except memory-recall notices — those often
/// carry exactly the facts worth re-extracting.  Tool results are kept: they
/// hold the concrete values (paths, ids, outputs) worth preserving.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| {
            m.role != Role::System
                || m.as_text()
                    .is_some_and(|t| t.starts_with("[Recalled memories"))
        })
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = match &m.content {
                MessageContent::ToolCall { function, .. } => {
                    format!("[tool_call: {}({})]", function.name, function.arguments)
                }
                MessageContent::ToolResult { content, .. } => {
                    format!("[tool_result: {content}]")
                }
                _ => m.flat_text(),
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Conversation summarizer ──────────────────────────────────────────────────

/// Compress `dropped` (plus an optional prior running summary) into a new
/// running summary.  Never fails: any provider problem degrades to an
/// extractive summary assembled from user messages and tool-call names.
pub async fn summarize_conversation(
    provider: &dyn ModelProvider,
    dropped: &[Message],
    prior_summary: Option<&str>,
) -> String {
    let mut history = String::new();
    if let Some(prior) = prior_summary {
        history.push_str("Previous summary:\n");
        history.push_str(prior);
        history.push_str("\n\n");
    }
    history.push_str(&serialize_history(dropped));

    let request = vec![Message::user(format!("{SUMMARIZE_PROMPT}\n\n---\n\n{history}"))];
    match collect_text(provider, request).await {
        Ok(reply) if !reply.trim().is_empty() => reply.trim().to_string(),
        Ok(_) | Err(_) => {
            debug!("summarizer unavailable; falling back to extractive summary");
            extractive_summary(dropped, prior_summary)
        }
    }
}

/// Deterministic fallback: user messages (clipped) and tool-call names.
fn extractive_summary(dropped: &[Message], prior_summary: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();
    if let Some(prior) = prior_summary {
        lines.push(prior.to_string());
    }
    for m in dropped {
        match (&m.role, &m.content) {
            (Role::User, MessageContent::Text(t)) => {
                let clipped: String = t.chars().take(120).collect();
                lines.push(format!("- user asked: {clipped}"));
            }
            (_, MessageContent::ToolCall { function, .. }) => {
                lines.push(format!("- ran tool: {}", function.name));
            }
            _ => {}
        }
    }
    lines.join("\n")
}

// ─── Pre-compaction memory flush ──────────────────────────────────────────────

/// Extract durable facts from messages about to be dropped.
///
/// Strict by design: any upstream failure or unparseable reply yields an
/// empty list — the flush never invents memories.
pub async fn flush_facts(
    provider: &dyn ModelProvider,
    dropped: &[Message],
    max_entries: usize,
) -> Vec<MemoryEntry> {
    let transcript = serialize_history(dropped);
    if transcript.trim().is_empty() {
        return Vec::new();
    }
    let request = vec![Message::user(format!("{FLUSH_PROMPT}\n\n---\n\n{transcript}"))];
    match collect_text(provider, request).await {
        Ok(reply) => parse_flush_reply(&reply, max_entries),
        Err(e) => {
            warn!(error = %e, "memory flush provider call failed; keeping nothing");
            Vec::new()
        }
    }
}

/// Parse the extraction reply into validated entries.
pub fn parse_flush_reply(reply: &str, max_entries: usize) -> Vec<MemoryEntry> {
    let stripped = strip_code_fences(reply);
    let parsed: Option<Value> = serde_json::from_str(stripped.trim()).ok().or_else(|| {
        // Fall back to the first bracketed array in the reply.
        let start = stripped.find('[')?;
        let end = stripped.rfind(']')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&stripped[start..=end]).ok()
    });

    let Some(Value::Array(items)) = parsed else {
        return Vec::new();
    };

    items
        .into_iter()
        .filter_map(|item| {
            let key = sanitize_key(item.get("key")?.as_str()?);
            let value = item.get("value")?.as_str()?.trim().to_string();
            let category: MemoryCategory = item.get("category")?.as_str()?.parse().ok()?;
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some(MemoryEntry { key, value, category })
        })
        .take(max_entries)
        .collect()
}

/// Markdown code fences around the payload are a model habit, not an error.
fn strip_code_fences(reply: &str) -> String {
    let trimmed = reply.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop an optional language tag on the fence line.
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
        return body.trim_end_matches('`').trim().to_string();
    }
    trimmed.to_string()
}

/// Normalise a memory key: lowercase, `[a-z0-9_]` only, runs collapsed,
/// trimmed, capped at 100 characters.
pub fn sanitize_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(100));
    let mut last_underscore = false;
    for c in raw.to_lowercase().chars() {
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            c
        } else {
            '_'
        };
        if mapped == '_' {
            if last_underscore {
                continue;
            }
            last_underscore = true;
        } else {
            last_underscore = false;
        }
        out.push(mapped);
        if out.len() >= 100 {
            break;
        }
    }
    out.trim_matches('_').to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
