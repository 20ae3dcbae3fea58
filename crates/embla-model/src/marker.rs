// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-call marker protocol for the local backend.
//!
//! Local models without native tool-use support emit tool calls inline in
//! free text as `<tool_call>{"name": ..., "arguments": {...}}</tool_call>`
//! blocks, and expect tool results to come back wrapped in
//! `<tool_response>...</tool_response>` tags.  This module owns both
//! directions of that convention:
//!
//! - [`parse_tool_calls`] extracts the calls from a completed response,
//!   repairing a missing close tag when generation was cut off mid-call.
//! - [`StreamGuard`] filters a live token stream so the user never sees a
//!   half-printed tag: characters that could be the prefix of an open tag
//!   are held back until disambiguated.
//! - [`render_tool_call`] / [`wrap_tool_response`] rebuild the markers when
//!   prior turns are serialized back into a request.

use serde_json::Value;
use tracing::warn;

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";
pub const TOOL_RESPONSE_OPEN: &str = "<tool_response>";
pub const TOOL_RESPONSE_CLOSE: &str = "</tool_response>";

/// A tool call extracted from marker-protocol text.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    /// Parsed JSON argument object.
    pub arguments: Value,
}

/// Extract all `<tool_call>` blocks from `text`.
///
/// Returns the text with the blocks removed plus the parsed calls in
/// emission order.  An unterminated final block (the model hit its output
/// limit mid-call) is repaired by treating end-of-text as the close tag.
/// Blocks whose payload is not a JSON object with a string `name` are
/// dropped with a warning — a garbled call is worse than no call.
pub fn parse_tool_calls(text: &str) -> (String, Vec<ParsedToolCall>) {
    let mut clean = String::with_capacity(text.len());
    let mut calls = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find(TOOL_CALL_OPEN) {
        clean.push_str(&rest[..open]);
        let body_start = open + TOOL_CALL_OPEN.len();
        let (body, consumed) = match rest[body_start..].find(TOOL_CALL_CLOSE) {
            Some(close) => (
                &rest[body_start..body_start + close],
                body_start + close + TOOL_CALL_CLOSE.len(),
            ),
            // Cut-off recovery: no close tag before end of generation.
            None => (&rest[body_start..], rest.len()),
        };
        match parse_call_body(body) {
            Some(call) => calls.push(call),
            None => warn!(body = %body.trim(), "dropping unparseable tool_call block"),
        }
        rest = &rest[consumed..];
    }
    clean.push_str(rest);
    (clean.trim().to_string(), calls)
}

fn parse_call_body(body: &str) -> Option<ParsedToolCall> {
    let v: Value = serde_json::from_str(body.trim()).ok()?;
    let name = v.get("name")?.as_str()?.to_string();
    if name.is_empty() {
        return None;
    }
    let arguments = v.get("arguments").cloned().unwrap_or_else(|| Value::Object(Default::default()));
    Some(ParsedToolCall { name, arguments })
}

/// Serialize a tool call back into marker form so the model sees its own
/// prior calls when the conversation is replayed.
pub fn render_tool_call(name: &str, arguments: &str) -> String {
    let args: Value = serde_json::from_str(arguments).unwrap_or(Value::Object(Default::default()));
    let payload = serde_json::json!({ "name": name, "arguments": args });
    format!("{TOOL_CALL_OPEN}{payload}{TOOL_CALL_CLOSE}")
}

/// Wrap one tool result for inclusion in a synthetic user turn.
pub fn wrap_tool_response(content: &str) -> String {
    format!("{TOOL_RESPONSE_OPEN}\n{content}\n{TOOL_RESPONSE_CLOSE}")
}

// ─── Streaming boundary guard ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    /// Emitting text verbatim.
    Plain,
    /// The trailing characters are a prefix of the open tag; held back until
    /// they resolve into the full tag or diverge.
    PossibleOpen,
    /// Between the open and close tags; nothing is emitted.
    InsideTag,
}

/// Filters a streamed token sequence so that `<tool_call>` blocks are
/// suppressed from user-visible output without ever leaking a partial tag.
///
/// The guard only decides *visibility*; extraction of the calls themselves
/// happens once on the accumulated full text via [`parse_tool_calls`].
#[derive(Debug)]
pub struct StreamGuard {
    state: GuardState,
    /// Unresolved text: in `PossibleOpen` a prefix of the open tag, in
    /// `InsideTag` the trailing window that may start the close tag.
    held: String,
}

impl Default for StreamGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamGuard {
    pub fn new() -> Self {
        Self { state: GuardState::Plain, held: String::new() }
    }

    /// Feed a chunk of streamed text; returns the part that is safe to show.
    pub fn push(&mut self, chunk: &str) -> String {
        self.held.push_str(chunk);
        let mut visible = String::new();

        loop {
            match self.state {
                GuardState::Plain | GuardState::PossibleOpen => {
                    if let Some(pos) = self.held.find(TOOL_CALL_OPEN) {
                        // Complete open tag: emit what precedes it, swallow
                        // the tag, and switch to suppression.
                        visible.push_str(&self.held[..pos]);
                        self.held.drain(..pos + TOOL_CALL_OPEN.len());
                        self.state = GuardState::InsideTag;
                        continue;
                    }
                    // No full tag.  Hold back the longest trailing substring
                    // that is still a prefix of the open tag; flush the rest.
                    let keep = trailing_prefix_len(&self.held, TOOL_CALL_OPEN);
                    let safe = self.held.len() - keep;
                    visible.push_str(&self.held[..safe]);
                    self.held.drain(..safe);
                    self.state = if keep > 0 {
                        GuardState::PossibleOpen
                    } else {
                        GuardState::Plain
                    };
                    break;
                }
                GuardState::InsideTag => {
                    if let Some(pos) = self.held.find(TOOL_CALL_CLOSE) {
                        // Close tag found: drop the suppressed body and resume.
                        self.held.drain(..pos + TOOL_CALL_CLOSE.len());
                        self.state = GuardState::Plain;
                        continue;
                    }
                    // Keep only a window large enough to detect a close tag
                    // split across chunks; the body itself is never shown.
                    let window = TOOL_CALL_CLOSE.len() - 1;
                    if self.held.len() > window {
                        let mut drop_to = self.held.len() - window;
                        while !self.held.is_char_boundary(drop_to) {
                            drop_to -= 1;
                        }
                        self.held.drain(..drop_to);
                    }
                    break;
                }
            }
        }
        visible
    }

    /// End of stream: release anything still held back.
    ///
    /// A pending open-tag prefix turned out not to be a tag, so it becomes
    /// visible.  Text still inside an unterminated tag stays suppressed —
    /// the cut-off call is recovered by [`parse_tool_calls`], not shown.
    pub fn finish(&mut self) -> String {
        let out = match self.state {
            GuardState::InsideTag => String::new(),
            _ => std::mem::take(&mut self.held),
        };
        self.state = GuardState::Plain;
        self.held.clear();
        out
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
fn trailing_prefix_len(text: &str, tag: &str) -> usize {
    let max = tag.len().min(text.len());
    for len in (1..=max).rev() {
        if text.is_char_boundary(text.len() - len) && tag.starts_with(&text[text.len() - len..]) {
            return len;
        }
    }
    0
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── parse_tool_calls ──────────────────────────────────────────────────────

    #[test]
    fn parses_single_call_with_arguments() {
        let text = r#"<tool_call>{"name": "read_file", "arguments": {"path": "/etc/hosts"}}</tool_call>"#;
        let (clean, calls) = parse_tool_calls(text);
        assert!(clean.is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], "/etc/hosts");
    }

    #[test]
    fn preserves_surrounding_text() {
        let text = "Let me check. <tool_call>{\"name\":\"shell\",\"arguments\":{}}</tool_call> One moment.";
        let (clean, calls) = parse_tool_calls(text);
        assert_eq!(clean, "Let me check.  One moment.");
        assert_eq!(calls.len(), 1);
    }

    #[test]
    fn parses_multiple_calls_in_order() {
        let text = concat!(
            r#"<tool_call>{"name":"glob","arguments":{"pattern":"*.rs"}}</tool_call>"#,
            r#"<tool_call>{"name":"grep","arguments":{"pattern":"fn main"}}</tool_call>"#,
        );
        let (_, calls) = parse_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "glob");
        assert_eq!(calls[1].name, "grep");
    }

    #[test]
    fn recovers_cut_off_call_without_close_tag() {
        let text = r#"<tool_call>{"name":"shell","arguments":{"command":"ls"}}"#;
        let (clean, calls) = parse_tool_calls(text);
        assert!(clean.is_empty());
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "shell");
    }

    #[test]
    fn missing_arguments_defaults_to_empty_object() {
        let text = r#"<tool_call>{"name":"list_dir"}</tool_call>"#;
        let (_, calls) = parse_tool_calls(text);
        assert_eq!(calls[0].arguments, json!({}));
    }

    #[test]
    fn garbled_json_block_is_dropped() {
        let text = "<tool_call>not json at all</tool_call>after";
        let (clean, calls) = parse_tool_calls(text);
        assert!(calls.is_empty());
        assert_eq!(clean, "after");
    }

    #[test]
    fn block_without_name_is_dropped() {
        let text = r#"<tool_call>{"arguments":{}}</tool_call>"#;
        let (_, calls) = parse_tool_calls(text);
        assert!(calls.is_empty());
    }

    #[test]
    fn plain_text_passes_through_unchanged() {
        let (clean, calls) = parse_tool_calls("nothing to see here");
        assert_eq!(clean, "nothing to see here");
        assert!(calls.is_empty());
    }

    // ── render / wrap round-trip ──────────────────────────────────────────────

    #[test]
    fn rendered_call_parses_back_to_same_call() {
        let rendered = render_tool_call("read_file", r#"{"path":"/tmp/x"}"#);
        let (_, calls) = parse_tool_calls(&rendered);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(calls[0].arguments["path"], "/tmp/x");
    }

    #[test]
    fn render_with_invalid_arguments_uses_empty_object() {
        let rendered = render_tool_call("shell", "not-json");
        let (_, calls) = parse_tool_calls(&rendered);
        assert_eq!(calls[0].arguments, json!({}));
    }

    #[test]
    fn wrap_tool_response_adds_tags() {
        let wrapped = wrap_tool_response("output line");
        assert!(wrapped.starts_with(TOOL_RESPONSE_OPEN));
        assert!(wrapped.ends_with(TOOL_RESPONSE_CLOSE));
        assert!(wrapped.contains("output line"));
    }

    // ── StreamGuard ───────────────────────────────────────────────────────────

    fn feed(guard: &mut StreamGuard, chunks: &[&str]) -> String {
        let mut out = String::new();
        for c in chunks {
            out.push_str(&guard.push(c));
        }
        out.push_str(&guard.finish());
        out
    }

    #[test]
    fn plain_text_streams_through() {
        let mut g = StreamGuard::new();
        assert_eq!(feed(&mut g, &["hello ", "world"]), "hello world");
    }

    #[test]
    fn complete_tag_in_one_chunk_is_suppressed() {
        let mut g = StreamGuard::new();
        let out = feed(
            &mut g,
            &["before <tool_call>{\"name\":\"x\"}</tool_call> after"],
        );
        assert_eq!(out, "before  after");
    }

    #[test]
    fn partial_open_tag_is_not_leaked() {
        let mut g = StreamGuard::new();
        // The tag arrives split mid-way: "<tool_cal" must never reach output.
        let first = g.push("text <tool_cal");
        assert_eq!(first, "text ");
        let second = g.push("l>{\"name\":\"x\"}</tool_call> done");
        assert_eq!(second, " done");
    }

    #[test]
    fn open_tag_split_one_char_at_a_time() {
        let mut g = StreamGuard::new();
        let mut out = String::new();
        for ch in "a<tool_call>{}</tool_call>b".chars() {
            out.push_str(&g.push(&ch.to_string()));
        }
        out.push_str(&g.finish());
        assert_eq!(out, "ab");
    }

    #[test]
    fn false_prefix_is_flushed_on_divergence() {
        let mut g = StreamGuard::new();
        // "<tool" looks like a tag start until 'b' arrives.
        let a = g.push("see <tool");
        assert_eq!(a, "see ");
        let b = g.push("box> etc");
        assert_eq!(b, "<toolbox> etc");
    }

    #[test]
    fn lone_angle_bracket_eventually_emitted() {
        let mut g = StreamGuard::new();
        let a = g.push("a < b");
        // '<' followed by ' ' diverges from the tag immediately.
        assert_eq!(a, "a < b");
    }

    #[test]
    fn trailing_possible_prefix_emitted_at_finish() {
        let mut g = StreamGuard::new();
        let a = g.push("end <tool_c");
        assert_eq!(a, "end ");
        assert_eq!(g.finish(), "<tool_c");
    }

    #[test]
    fn unterminated_tag_body_stays_suppressed_at_finish() {
        let mut g = StreamGuard::new();
        let a = g.push("ok <tool_call>{\"name\":\"shell\"");
        assert_eq!(a, "ok ");
        assert_eq!(g.finish(), "", "cut-off call body must not leak");
    }

    #[test]
    fn close_tag_split_across_chunks() {
        let mut g = StreamGuard::new();
        let mut out = String::new();
        out.push_str(&g.push("x<tool_call>{\"name\":\"t\"}</tool_"));
        out.push_str(&g.push("call>y"));
        out.push_str(&g.finish());
        assert_eq!(out, "xy");
    }

    #[test]
    fn two_tags_with_text_between() {
        let mut g = StreamGuard::new();
        let out = feed(
            &mut g,
            &[
                "a<tool_call>{\"name\":\"p\"}</tool_call>",
                "b<tool_call>{\"name\":\"q\"}</tool_call>c",
            ],
        );
        assert_eq!(out, "abc");
    }

    // ── trailing_prefix_len ───────────────────────────────────────────────────

    #[test]
    fn trailing_prefix_detects_partial_tag() {
        assert_eq!(trailing_prefix_len("abc<tool", TOOL_CALL_OPEN), 5);
        assert_eq!(trailing_prefix_len("abc<", TOOL_CALL_OPEN), 1);
        assert_eq!(trailing_prefix_len("abc", TOOL_CALL_OPEN), 0);
    }

    #[test]
    fn trailing_prefix_ignores_non_prefix_bracket_text() {
        assert_eq!(trailing_prefix_len("a<xyz", TOOL_CALL_OPEN), 0);
    }
}
