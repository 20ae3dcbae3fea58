// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local-response quality check.
//!
//! After a turn completes on the local model, this analyzer decides whether
//! the reply is weak enough to warrant one retry against the remote
//! provider.  All pattern matching runs over *prose* — text inside fenced
//! blocks and inline code spans is stripped first, so an error message the
//! model is quoting never counts against the model itself.

use std::sync::OnceLock;

use regex::Regex;

/// A recommendation to retry the turn on the remote provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Escalation {
    pub reason: &'static str,
    pub confidence: f32,
}

fn uncertainty_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)i'?m not sure",
            r"(?i)i don'?t know",
            r"(?i)i cannot",
            r"(?i)i'?m unable",
            r"(?i)this is beyond",
            r"(?i)i would need more",
            r"(?i)this requires",
            r"(?i)i'?m having trouble",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("uncertainty pattern"))
        .collect()
    })
}

fn error_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(error:|failed to|cannot parse|invalid|syntax error)")
            .expect("error pattern")
    })
}

fn fence_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // (?s) so a fence spans lines; non-greedy so adjacent fences stay apart.
    PATTERN.get_or_init(|| Regex::new(r"(?s)```.*?```").expect("fence pattern"))
}

fn inline_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"`[^`\n]+`").expect("inline code pattern"))
}

/// Remove fenced blocks and inline code spans, leaving prose.
fn strip_code(content: &str) -> String {
    let without_fences = fence_pattern().replace_all(content, " ");
    inline_code_pattern()
        .replace_all(&without_fences, " ")
        .into_owned()
}

/// Decide whether a local reply should be retried remotely.
///
/// `confidence` is the model's own self-reported confidence when the
/// backend provides one; `threshold` comes from config.
pub fn assess(
    content: &str,
    has_tool_calls: bool,
    confidence: Option<f32>,
    threshold: f32,
) -> Option<Escalation> {
    if let Some(c) = confidence {
        if c < threshold {
            return Some(Escalation { reason: "low_confidence", confidence: c });
        }
    }

    let prose = strip_code(content);

    let uncertainty_hits: usize = uncertainty_patterns()
        .iter()
        .map(|re| re.find_iter(&prose).count())
        .sum();
    if uncertainty_hits >= 2 || (uncertainty_hits >= 1 && content.len() < 200) {
        return Some(Escalation { reason: "uncertainty_detected", confidence: 0.3 });
    }

    if error_pattern().is_match(&prose) {
        return Some(Escalation { reason: "potential_code_errors", confidence: 0.4 });
    }

    if content.len() < 50 && !has_tool_calls {
        return Some(Escalation { reason: "insufficient_response", confidence: 0.5 });
    }

    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_PAD: &str = " Here is a longer elaboration that pushes the reply well past the \
                            short-response threshold so only the pattern counts matter in this \
                            particular scenario, nothing else.";

    // ── Explicit confidence ───────────────────────────────────────────────────

    #[test]
    fn low_self_confidence_escalates() {
        let e = assess("a perfectly fine answer", false, Some(0.2), 0.5).unwrap();
        assert_eq!(e.reason, "low_confidence");
        assert!((e.confidence - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn high_self_confidence_does_not_escalate_alone() {
        let text = format!("A thorough and complete answer.{LONG_PAD}");
        assert!(assess(&text, false, Some(0.9), 0.5).is_none());
    }

    // ── Uncertainty ───────────────────────────────────────────────────────────

    #[test]
    fn two_uncertainty_matches_escalate() {
        let text = format!("I'm not sure about this. I don't know the details.{LONG_PAD}");
        let e = assess(&text, false, None, 0.5).unwrap();
        assert_eq!(e.reason, "uncertainty_detected");
        assert!((e.confidence - 0.3).abs() < f32::EPSILON);
    }

    #[test]
    fn one_uncertainty_match_in_short_reply_escalates() {
        let e = assess("I'm not sure, sorry.", false, None, 0.5).unwrap();
        assert_eq!(e.reason, "uncertainty_detected");
    }

    #[test]
    fn one_uncertainty_match_in_long_reply_passes() {
        let text = format!(
            "I'm not sure about the edge case, but the main path works like this.{LONG_PAD}"
        );
        assert!(assess(&text, false, None, 0.5).is_none());
    }

    #[test]
    fn apostrophe_variants_both_match() {
        let text = format!("Im not sure. I dont know.{LONG_PAD}");
        assert!(assess(&text, false, None, 0.5).is_some());
    }

    // ── Error patterns ────────────────────────────────────────────────────────

    #[test]
    fn error_pattern_in_prose_escalates() {
        let text = format!("The build failed to link against openssl.{LONG_PAD}");
        let e = assess(&text, false, None, 0.5).unwrap();
        assert_eq!(e.reason, "potential_code_errors");
        assert!((e.confidence - 0.4).abs() < f32::EPSILON);
    }

    #[test]
    fn error_text_inside_fence_is_ignored() {
        let text = format!(
            "Run it and you will see the output below.\n```\nerror: cannot parse input\ninvalid token\n```\nThat output is expected.{LONG_PAD}"
        );
        assert!(
            assess(&text, false, None, 0.5).is_none(),
            "code-fence content must not trigger escalation"
        );
    }

    #[test]
    fn error_text_inside_inline_code_is_ignored() {
        let text = format!(
            "The compiler prints `error: mismatched types` when that happens, which is the point.{LONG_PAD}"
        );
        assert!(assess(&text, false, None, 0.5).is_none());
    }

    #[test]
    fn uncertainty_inside_fence_is_ignored() {
        let text = format!(
            "Sample dialogue:\n```\nI'm not sure\nI don't know\n```\nThat is the test fixture.{LONG_PAD}"
        );
        assert!(assess(&text, false, None, 0.5).is_none());
    }

    // ── Insufficient response ─────────────────────────────────────────────────

    #[test]
    fn short_reply_without_tool_calls_escalates() {
        let e = assess("Yes.", false, None, 0.5).unwrap();
        assert_eq!(e.reason, "insufficient_response");
        assert!((e.confidence - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn short_reply_with_tool_calls_is_fine() {
        assert!(assess("", true, None, 0.5).is_none());
    }

    #[test]
    fn adequate_reply_passes() {
        let text = format!("Reykjavik uses UTC year-round without daylight saving.{LONG_PAD}");
        assert!(assess(&text, false, None, 0.5).is_none());
    }

    // ── strip_code ────────────────────────────────────────────────────────────

    #[test]
    fn strip_removes_fences_and_inline_spans() {
        let stripped = strip_code("keep ```drop this``` and `this too` keep");
        assert!(stripped.contains("keep"));
        assert!(!stripped.contains("drop this"));
        assert!(!stripped.contains("this too"));
    }

    #[test]
    fn adjacent_fences_do_not_swallow_prose_between() {
        let stripped = strip_code("```a``` middle ```b```");
        assert!(stripped.contains("middle"));
    }
}
