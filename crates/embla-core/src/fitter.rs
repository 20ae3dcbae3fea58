// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context-window fitting.
//!
//! Produces the request slice for one model call: the newest suffix of the
//! conversation whose estimated cost, together with the system prompt, the
//! tool definitions, and the running summary, fits inside the window minus
//! the output reserve.  The persisted history is never modified — fitting
//! clones and replaces, so trimming and truncation apply to this turn's
//! request only.
//!
//! Two structural rules hold unconditionally:
//! - An assistant tool-call run and its trailing tool results form an
//!   atomic group: the model must never see a call without its result or
//!   vice versa.
//! - The newest user message is always kept, even when nothing else fits.

use embla_model::{
    ContentPart, Message, MessageContent, Role, ToolContentPart, ToolResultContent, ToolSchema,
};

/// Characters per token used by the whole fitting path.
const CHARS_PER_TOKEN: f64 = 3.5;
/// Flat overhead per message (role framing, separators).
const MESSAGE_OVERHEAD: usize = 4;
/// Flat cost of an image content part.
const IMAGE_TOKENS: usize = 1000;
/// Framing cost of a tool call beyond its name and arguments.
const TOOL_CALL_OVERHEAD: usize = 15;
/// Cost of carrying a tool_call_id field.
const TOOL_CALL_ID_TOKENS: usize = 5;

#[derive(Debug, Clone)]
pub struct FitConfig {
    pub context_length: usize,
    pub reserve_for_output: usize,
    pub max_tool_result_tokens: usize,
}

#[derive(Debug)]
pub struct FitOutcome {
    /// The request slice: optional summary system message, optional trimming
    /// notice, then the kept conversation suffix.  The caller prepends the
    /// main system message.
    pub messages: Vec<Message>,
    /// Messages dropped from this request, oldest first.  Fed to the
    /// pre-compaction memory flush and the summarizer.
    pub dropped: Vec<Message>,
    /// Estimated total request tokens (baseline + kept messages).
    pub estimated_tokens: usize,
}

impl FitOutcome {
    pub fn dropped_any(&self) -> bool {
        !self.dropped.is_empty()
    }
}

/// Estimated tokens for a plain text string.
pub fn estimate_text_tokens(text: &str) -> usize {
    (text.len() as f64 / CHARS_PER_TOKEN).ceil() as usize
}

/// Estimated tokens for one message, including per-message overhead.
pub fn estimate_message_tokens(m: &Message) -> usize {
    let content = match &m.content {
        MessageContent::Text(t) => estimate_text_tokens(t),
        MessageContent::ContentParts(parts) => parts
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => estimate_text_tokens(text),
                ContentPart::Image { .. } => IMAGE_TOKENS,
            })
            .sum(),
        MessageContent::ToolCall { function, .. } => {
            TOOL_CALL_OVERHEAD
                + estimate_text_tokens(&function.name)
                + estimate_text_tokens(&function.arguments)
                + TOOL_CALL_ID_TOKENS
        }
        MessageContent::ToolResult { content, .. } => {
            let body = match content {
                ToolResultContent::Text(t) => estimate_text_tokens(t),
                ToolResultContent::Parts(parts) => parts
                    .iter()
                    .map(|p| match p {
                        ToolContentPart::Text { text } => estimate_text_tokens(text),
                        ToolContentPart::Image { .. } => IMAGE_TOKENS,
                    })
                    .sum(),
            };
            body + TOOL_CALL_ID_TOKENS
        }
    };
    MESSAGE_OVERHEAD + content
}

/// Estimated tokens for the serialized tool definitions.
pub fn estimate_tools_tokens(tools: &[ToolSchema]) -> usize {
    tools
        .iter()
        .map(|t| {
            estimate_text_tokens(&t.name)
                + estimate_text_tokens(&t.description)
                + estimate_text_tokens(&t.parameters.to_string())
                + MESSAGE_OVERHEAD
        })
        .sum()
}

/// The synthetic notice prepended when older turns were dropped.
pub fn trimming_notice(omitted: usize) -> Message {
    Message::user(format!(
        "[Earlier conversation trimmed to fit context window — {omitted} messages omitted]"
    ))
}

/// Label for the running-summary system message.
pub const SUMMARY_LABEL: &str = "Conversation summary — earlier messages were compacted";

fn summary_message(summary: &str) -> Message {
    Message::system(format!("[{SUMMARY_LABEL}]\n{summary}"))
}

/// Cap an oversize tool-result body, marking the removed amount.
fn truncate_text(text: &str, cap_chars: usize) -> String {
    if text.len() <= cap_chars {
        return text.to_string();
    }
    let mut cut = cap_chars;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let omitted = text.len() - cut;
    format!("{}\n[Output truncated: {omitted} bytes omitted]", &text[..cut])
}

/// Apply per-result truncation to a cloned message.  Non-tool messages and
/// results under the cap pass through unchanged.
fn truncate_tool_result(m: &Message, max_tool_result_tokens: usize) -> Message {
    if max_tool_result_tokens == 0 {
        return m.clone();
    }
    let cap_chars = (max_tool_result_tokens as f64 * CHARS_PER_TOKEN) as usize;
    let MessageContent::ToolResult { tool_call_id, content } = &m.content else {
        return m.clone();
    };
    let new_content = match content {
        ToolResultContent::Text(t) if t.len() > cap_chars => {
            ToolResultContent::Text(truncate_text(t, cap_chars))
        }
        ToolResultContent::Parts(parts) => ToolResultContent::Parts(
            parts
                .iter()
                .map(|p| match p {
                    ToolContentPart::Text { text } if text.len() > cap_chars => {
                        ToolContentPart::Text { text: truncate_text(text, cap_chars) }
                    }
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    };
    Message {
        role: m.role,
        content: MessageContent::ToolResult {
            tool_call_id: tool_call_id.clone(),
            content: new_content,
        },
    }
}

/// Index range of one atomic group (inclusive start, exclusive end).
pub(crate) fn group_ranges(messages: &[Message]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut i = 0;
    while i < messages.len() {
        if matches!(messages[i].content, MessageContent::ToolCall { .. }) {
            let start = i;
            while i < messages.len()
                && matches!(messages[i].content, MessageContent::ToolCall { .. })
            {
                i += 1;
            }
            while i < messages.len()
                && matches!(messages[i].content, MessageContent::ToolResult { .. })
            {
                i += 1;
            }
            ranges.push((start, i));
        } else {
            ranges.push((i, i + 1));
            i += 1;
        }
    }
    ranges
}

/// Index of the newest plain user message (the one this run answers).
fn newest_user_index(messages: &[Message]) -> Option<usize> {
    messages.iter().rposition(|m| {
        m.role == Role::User
            && matches!(
                m.content,
                MessageContent::Text(_) | MessageContent::ContentParts(_)
            )
    })
}

/// Fit the conversation into the window.
///
/// `system_prompt` and `summary` are costed but not included in the output;
/// the caller owns their placement at the head of the request.
pub fn fit_messages(
    system_prompt: &str,
    summary: Option<&str>,
    messages: &[Message],
    tools: &[ToolSchema],
    cfg: &FitConfig,
) -> FitOutcome {
    // Step 1–2: baseline and budget.
    let summary_msg = summary.map(summary_message);
    let mut baseline = estimate_text_tokens(system_prompt) + estimate_tools_tokens(tools);
    if let Some(sm) = &summary_msg {
        baseline += estimate_message_tokens(sm);
    }
    let window = cfg.context_length.saturating_sub(cfg.reserve_for_output);
    let budget = window.saturating_sub(baseline);

    // Step 3: per-result truncation on a cloned slice.
    let truncated: Vec<Message> = messages
        .iter()
        .map(|m| truncate_tool_result(m, cfg.max_tool_result_tokens))
        .collect();

    let newest_user = newest_user_index(&truncated);

    if budget == 0 {
        // Emergency: nothing fits beyond the newest user message.
        let kept: Vec<Message> = newest_user
            .map(|i| vec![truncated[i].clone()])
            .unwrap_or_default();
        let dropped: Vec<Message> = truncated
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != newest_user)
            .map(|(_, m)| m.clone())
            .collect();
        let omitted = dropped.len();
        let mut out = Vec::new();
        if let Some(sm) = summary_msg {
            out.push(sm);
        }
        if omitted > 0 {
            out.push(trimming_notice(omitted));
        }
        let estimated = baseline + kept.iter().map(estimate_message_tokens).sum::<usize>();
        out.extend(kept);
        return FitOutcome { messages: out, dropped, estimated_tokens: estimated };
    }

    // Step 4–5: accept whole groups from newest to oldest.
    let ranges = group_ranges(&truncated);
    let mut spent = 0usize;
    let mut first_kept_group = ranges.len();
    for (gi, (start, end)) in ranges.iter().enumerate().rev() {
        let cost: usize = truncated[*start..*end]
            .iter()
            .map(estimate_message_tokens)
            .sum();
        if spent + cost > budget {
            break;
        }
        spent += cost;
        first_kept_group = gi;
    }

    let first_kept_msg = ranges
        .get(first_kept_group)
        .map(|(s, _)| *s)
        .unwrap_or(truncated.len());

    let mut kept: Vec<Message> = truncated[first_kept_msg..].to_vec();
    let mut dropped: Vec<Message> = truncated[..first_kept_msg].to_vec();

    // Emergency rule: the newest user message survives even when its group
    // did not fit.
    if let Some(ui) = newest_user {
        if ui < first_kept_msg {
            let user_msg = truncated[ui].clone();
            dropped = truncated[..first_kept_msg]
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != ui)
                .map(|(_, m)| m.clone())
                .collect();
            spent += estimate_message_tokens(&user_msg);
            kept.insert(0, user_msg);
        }
    }

    // Step 6: assemble, with a notice when anything was dropped.
    let omitted = dropped.len();
    let mut out = Vec::new();
    if let Some(sm) = summary_msg {
        out.push(sm);
    }
    if omitted > 0 {
        out.push(trimming_notice(omitted));
    }
    out.extend(kept);

    FitOutcome {
        messages: out,
        dropped,
        estimated_tokens: baseline + spent,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(context_length: usize, reserve: usize) -> FitConfig {
        FitConfig {
            context_length,
            reserve_for_output: reserve,
            max_tool_result_tokens: 4000,
        }
    }

    /// A message of roughly `tokens` estimated tokens (text content).
    fn user_of(tokens: usize) -> Message {
        // content cost = ceil(len/3.5); overhead 4
        let len = ((tokens.saturating_sub(MESSAGE_OVERHEAD)) as f64 * CHARS_PER_TOKEN) as usize;
        Message::user("x".repeat(len))
    }

    fn assistant_of(tokens: usize) -> Message {
        let len = ((tokens.saturating_sub(MESSAGE_OVERHEAD)) as f64 * CHARS_PER_TOKEN) as usize;
        Message::assistant("y".repeat(len))
    }

    // ── Estimates ─────────────────────────────────────────────────────────────

    #[test]
    fn text_estimate_uses_char_ratio() {
        // 35 chars / 3.5 = 10
        assert_eq!(estimate_text_tokens(&"a".repeat(35)), 10);
    }

    #[test]
    fn message_estimate_adds_overhead() {
        let m = Message::user("a".repeat(35));
        assert_eq!(estimate_message_tokens(&m), 10 + MESSAGE_OVERHEAD);
    }

    #[test]
    fn image_part_costs_flat_thousand() {
        let m = Message::user_with_parts(vec![
            ContentPart::text(""),
            ContentPart::image("data:image/png;base64,A"),
        ]);
        assert_eq!(estimate_message_tokens(&m), MESSAGE_OVERHEAD + IMAGE_TOKENS);
    }

    #[test]
    fn tool_call_estimate_includes_framing_and_id() {
        let m = Message::tool_call("c1", "shell", "{}");
        let expected = MESSAGE_OVERHEAD
            + TOOL_CALL_OVERHEAD
            + estimate_text_tokens("shell")
            + estimate_text_tokens("{}")
            + TOOL_CALL_ID_TOKENS;
        assert_eq!(estimate_message_tokens(&m), expected);
    }

    #[test]
    fn tool_result_estimate_includes_id() {
        let m = Message::tool_result("c1", "a".repeat(35));
        assert_eq!(
            estimate_message_tokens(&m),
            MESSAGE_OVERHEAD + 10 + TOOL_CALL_ID_TOKENS
        );
    }

    // ── No trimming needed ────────────────────────────────────────────────────

    #[test]
    fn small_conversation_passes_through() {
        let msgs = vec![Message::user("hello"), Message::assistant("hi"), Message::user("more")];
        let out = fit_messages("sys", None, &msgs, &[], &cfg(10_000, 100));
        assert_eq!(out.messages.len(), 3);
        assert!(out.dropped.is_empty());
    }

    #[test]
    fn no_notice_when_nothing_dropped() {
        let msgs = vec![Message::user("hello")];
        let out = fit_messages("sys", None, &msgs, &[], &cfg(10_000, 100));
        assert_eq!(out.messages[0].as_text(), Some("hello"));
    }

    // ── Trimming ──────────────────────────────────────────────────────────────

    #[test]
    fn trims_oldest_messages_first() {
        // 20 alternating ~40-token messages plus the final user message, in a
        // 200-token window with 50 reserved.
        let mut msgs = Vec::new();
        for i in 0..20 {
            if i % 2 == 0 {
                msgs.push(user_of(40));
            } else {
                msgs.push(assistant_of(40));
            }
        }
        msgs.push(Message::user("final"));
        let out = fit_messages("", None, &msgs, &[], &cfg(200, 50));

        assert!(out.dropped_any());
        // Notice heads the list.
        assert!(out.messages[0]
            .as_text()
            .unwrap()
            .contains("trimmed to fit context window"));
        // The final user message survives at the tail.
        assert_eq!(out.messages.last().unwrap().as_text(), Some("final"));
        // Kept suffix fits the 150-token budget.
        let kept_cost: usize = out.messages[1..]
            .iter()
            .map(estimate_message_tokens)
            .sum();
        assert!(kept_cost <= 150, "kept cost {kept_cost} exceeds budget");
    }

    #[test]
    fn notice_counts_omitted_messages() {
        let mut msgs: Vec<Message> = (0..10).map(|_| user_of(50)).collect();
        msgs.push(Message::user("latest"));
        let out = fit_messages("", None, &msgs, &[], &cfg(200, 50));
        let notice = out.messages[0].as_text().unwrap().to_string();
        assert!(notice.contains(&format!("{} messages omitted", out.dropped.len())));
    }

    #[test]
    fn dropped_preserves_original_order() {
        let msgs = vec![user_of(80), assistant_of(80), user_of(80), Message::user("tail")];
        let out = fit_messages("", None, &msgs, &[], &cfg(120, 20));
        for pair in out.dropped.windows(2) {
            // Order check by content length pattern: all dropped came from the
            // prefix in original order; verify first dropped is the oldest.
            let _ = pair;
        }
        assert!(out.dropped.len() >= 2);
        assert_eq!(out.dropped[0].as_text(), msgs[0].as_text());
    }

    // ── Atomic groups ─────────────────────────────────────────────────────────

    #[test]
    fn group_ranges_glue_calls_to_results() {
        let msgs = vec![
            Message::user("q"),
            Message::tool_call("c1", "a", "{}"),
            Message::tool_call("c2", "b", "{}"),
            Message::tool_result("c1", "r1"),
            Message::tool_result("c2", "r2"),
            Message::assistant("done"),
        ];
        let ranges = group_ranges(&msgs);
        assert_eq!(ranges, vec![(0, 1), (1, 5), (5, 6)]);
    }

    #[test]
    fn tool_group_is_kept_or_dropped_whole() {
        // A big tool group that cannot fit must vanish entirely, never be
        // split.
        let big_result = "r".repeat(600); // ~170 tokens
        let msgs = vec![
            Message::user("old question"),
            Message::tool_call("c1", "read_file", r#"{"path":"/x"}"#),
            Message::tool_result("c1", big_result),
            Message::assistant("answer from tool"),
            Message::user("new question"),
        ];
        let out = fit_messages("", None, &msgs, &[], &cfg(100, 20));
        let has_call = out
            .messages
            .iter()
            .any(|m| matches!(m.content, MessageContent::ToolCall { .. }));
        let has_result = out
            .messages
            .iter()
            .any(|m| matches!(m.content, MessageContent::ToolResult { .. }));
        assert_eq!(has_call, has_result, "tool call and result must travel together");
    }

    #[test]
    fn kept_tool_group_stays_complete() {
        let msgs = vec![
            Message::user("q"),
            Message::tool_call("c1", "shell", "{}"),
            Message::tool_result("c1", "ok"),
            Message::assistant("done"),
            Message::user("next"),
        ];
        let out = fit_messages("", None, &msgs, &[], &cfg(10_000, 100));
        let calls = out
            .messages
            .iter()
            .filter(|m| matches!(m.content, MessageContent::ToolCall { .. }))
            .count();
        let results = out
            .messages
            .iter()
            .filter(|m| matches!(m.content, MessageContent::ToolResult { .. }))
            .count();
        assert_eq!(calls, 1);
        assert_eq!(results, 1);
    }

    // ── Emergency rules ───────────────────────────────────────────────────────

    #[test]
    fn zero_budget_keeps_only_newest_user_message() {
        let msgs = vec![user_of(50), assistant_of(50), Message::user("last words")];
        // Baseline alone exceeds the window.
        let big_sys = "s".repeat(4000);
        let out = fit_messages(&big_sys, None, &msgs, &[], &cfg(500, 100));
        let texts: Vec<_> = out.messages.iter().filter_map(|m| m.as_text()).collect();
        assert!(texts.iter().any(|t| *t == "last words"));
        // Notice plus the user message, nothing else from the conversation.
        assert!(out.messages.len() <= 2);
    }

    #[test]
    fn newest_user_message_survives_tight_budget() {
        let msgs = vec![Message::user("u".repeat(2000))];
        let out = fit_messages("", None, &msgs, &[], &cfg(100, 50));
        assert!(
            out.messages
                .iter()
                .any(|m| m.role == Role::User && m.as_text().is_some()),
            "the newest user message must always be present"
        );
    }

    // ── Tool-result truncation ────────────────────────────────────────────────

    #[test]
    fn oversize_tool_result_is_truncated_with_marker() {
        let msgs = vec![
            Message::user("q"),
            Message::tool_call("c1", "shell", "{}"),
            Message::tool_result("c1", "z".repeat(10_000)),
        ];
        let fit = FitConfig {
            context_length: 100_000,
            reserve_for_output: 100,
            max_tool_result_tokens: 100, // cap ≈ 350 chars
        };
        let out = fit_messages("", None, &msgs, &[], &fit);
        let result = out
            .messages
            .iter()
            .find_map(|m| match &m.content {
                MessageContent::ToolResult { content, .. } => content.as_text(),
                _ => None,
            })
            .unwrap();
        assert!(result.len() < 500);
        assert!(result.contains("Output truncated"));
        assert!(result.contains("bytes omitted"));
    }

    #[test]
    fn truncation_does_not_touch_original_messages() {
        let original = Message::tool_result("c1", "z".repeat(10_000));
        let msgs = vec![Message::user("q"), Message::tool_call("c1", "s", "{}"), original.clone()];
        let fit = FitConfig {
            context_length: 100_000,
            reserve_for_output: 100,
            max_tool_result_tokens: 10,
        };
        let _ = fit_messages("", None, &msgs, &[], &fit);
        // The input slice is untouched.
        match &msgs[2].content {
            MessageContent::ToolResult { content, .. } => {
                assert_eq!(content.as_text().unwrap().len(), 10_000);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn under_cap_tool_result_unchanged() {
        let msgs = vec![Message::tool_result("c1", "short"), Message::user("q")];
        let out = fit_messages("", None, &msgs, &[], &cfg(10_000, 100));
        let result = out
            .messages
            .iter()
            .find_map(|m| match &m.content {
                MessageContent::ToolResult { content, .. } => content.as_text(),
                _ => None,
            })
            .unwrap();
        assert_eq!(result, "short");
    }

    // ── Summary placement ─────────────────────────────────────────────────────

    #[test]
    fn summary_leads_the_fitted_slice() {
        let msgs = vec![Message::user("hello")];
        let out = fit_messages("sys", Some("earlier: user set up the repo"), &msgs, &[], &cfg(10_000, 100));
        let head = out.messages[0].as_text().unwrap();
        assert!(head.contains(SUMMARY_LABEL));
        assert!(head.contains("set up the repo"));
        assert_eq!(out.messages[0].role, Role::System);
    }

    #[test]
    fn summary_cost_reduces_budget() {
        let msgs = vec![user_of(60), Message::user("tail")];
        let summary = "s".repeat(350); // ~100 tokens
        let without = fit_messages("", None, &msgs, &[], &cfg(120, 0));
        let with = fit_messages("", Some(&summary), &msgs, &[], &cfg(120, 0));
        assert!(with.dropped.len() >= without.dropped.len());
    }

    // ── Ordering ──────────────────────────────────────────────────────────────

    #[test]
    fn fitter_never_reorders_messages() {
        let msgs: Vec<Message> = (0..6).map(|i| Message::user(format!("m{i}"))).collect();
        let out = fit_messages("", None, &msgs, &[], &cfg(10_000, 100));
        let texts: Vec<_> = out.messages.iter().filter_map(|m| m.as_text()).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4", "m5"]);
    }
}
