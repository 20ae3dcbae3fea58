// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local/remote request routing.
//!
//! Pure, synchronous decision logic — no HTTP, no async.  The pipeline:
//! message heuristics establish a first guess, prioritized config rules set
//! the baseline, a confident heuristic escalation overrides the rules,
//! matched skills may pin a target, and an availability check at the end
//! guarantees the decision names a provider that actually exists.

use embla_config::{RouteTarget, RouterConfig};

use crate::fitter::estimate_message_tokens;
use crate::skills::{matched_skills, Skill};
use embla_model::Message;

/// The result of a routing decision.
#[derive(Debug, Clone)]
pub struct RouterDecision {
    pub target: RouteTarget,
    /// `<provider>/<model>` of the resolved backend.
    pub provider: String,
    pub reason: &'static str,
    pub confidence: f32,
}

/// A heuristic classification of the latest user message.
#[derive(Debug, Clone, Copy)]
struct Heuristic {
    target: RouteTarget,
    reason: &'static str,
    confidence: f32,
}

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "yo", "sup", "howdy", "thanks", "thank", "ok", "okay", "bye",
    "goodbye", "morning", "evening", "night",
];

const STRONG_CODE_PHRASES: &[&str] = &[
    "write code",
    "write a function",
    "create a function",
    "write a class",
    "create a class",
    "write tests",
    "write a test",
    "code review",
    "review this code",
    "write a script",
    "fix this bug",
];

const WEAK_CODE_KEYWORDS: &[&str] = &["implement", "refactor", "debug", "optimize", "optimise"];

const REASONING_PHRASES: &[&str] = &[
    "explain in detail",
    "compare and contrast",
    "walk me through",
    "step by step",
    "pros and cons",
    "trade-offs",
    "tradeoffs",
    "think through",
];

const TOOL_USE_PHRASES: &[&str] = &[
    "read the file",
    "read file",
    "list files",
    "list the files",
    "show me the file",
    "run the command",
    "run command",
    "search for",
    "find the file",
    "delete the file",
    "create a file",
    "grep",
];

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Heuristic analysis of the latest user message.
fn analyze(text: &str) -> Heuristic {
    let lower = text.to_lowercase();
    let words = word_count(&lower);

    if words <= 3 && words > 0 {
        let all_greeting_ish = lower
            .split_whitespace()
            .all(|w| GREETINGS.contains(&w.trim_matches(|c: char| !c.is_alphanumeric())));
        if all_greeting_ish {
            return Heuristic {
                target: RouteTarget::Local,
                reason: "simple_greeting",
                confidence: 0.95,
            };
        }
    }

    if STRONG_CODE_PHRASES.iter().any(|p| lower.contains(p)) {
        return Heuristic {
            target: RouteTarget::Remote,
            reason: "code_generation",
            confidence: 0.80,
        };
    }

    if words > 5 && WEAK_CODE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Heuristic {
            target: RouteTarget::Remote,
            reason: "code_generation",
            confidence: 0.75,
        };
    }

    if words > 10 && REASONING_PHRASES.iter().any(|p| lower.contains(p)) {
        return Heuristic {
            target: RouteTarget::Remote,
            reason: "complex_reasoning",
            confidence: 0.70,
        };
    }

    if TOOL_USE_PHRASES.iter().any(|p| lower.contains(p)) {
        return Heuristic {
            target: RouteTarget::Local,
            reason: "tool_use",
            confidence: 0.60,
        };
    }

    if text.contains("```") {
        return Heuristic {
            target: RouteTarget::Remote,
            reason: "code_discussion",
            confidence: 0.75,
        };
    }

    if words > 100 {
        return Heuristic {
            target: RouteTarget::Remote,
            reason: "long_context",
            confidence: 0.60,
        };
    }

    Heuristic { target: RouteTarget::Local, reason: "default", confidence: 0.5 }
}

/// Outcome of the prioritized rule pass.
struct RuleMatch {
    target: RouteTarget,
    reason: &'static str,
    priority: i32,
}

/// Apply the configured rules; the highest-priority match wins, and the
/// priority-0 default rule always matches.
fn apply_rules(
    text: &str,
    estimated_tokens: usize,
    local_context_length: usize,
    config: &RouterConfig,
) -> RuleMatch {
    let lower = text.to_lowercase();
    let mut best = RuleMatch {
        target: config.default_target,
        reason: "default_rule",
        priority: 0,
    };

    let mut consider = |m: RuleMatch| {
        if m.priority > best.priority {
            best = m;
        }
    };

    if config
        .always_remote
        .iter()
        .any(|p| !p.is_empty() && lower.contains(&p.to_lowercase()))
    {
        consider(RuleMatch { target: RouteTarget::Remote, reason: "always_remote", priority: 100 });
    }
    if config
        .always_local
        .iter()
        .any(|p| !p.is_empty() && lower.contains(&p.to_lowercase()))
    {
        consider(RuleMatch { target: RouteTarget::Local, reason: "always_local", priority: 100 });
    }

    // Large requests overflow the local window long before the remote one.
    if local_context_length > 0
        && estimated_tokens as f32 > config.large_context_fraction * local_context_length as f32
    {
        consider(RuleMatch { target: RouteTarget::Remote, reason: "large_context", priority: 50 });
    }

    // Complexity buckets: trivially short messages stay local, very long
    // prose goes remote.
    let words = word_count(&lower);
    if words > 0 && words <= 3 {
        consider(RuleMatch { target: RouteTarget::Local, reason: "trivial_message", priority: 10 });
    } else if words > 150 {
        consider(RuleMatch { target: RouteTarget::Remote, reason: "complex_message", priority: 10 });
    }

    best
}

pub struct Router {
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Decide where the current turn should run.
    ///
    /// `local_ref` / `remote_ref` are the `<provider>/<model>` strings of
    /// the configured backends; `remote_ref = None` means no remote provider
    /// exists and every decision degrades to local.
    #[allow(clippy::too_many_arguments)]
    pub fn decide(
        &self,
        messages: &[Message],
        skills: &[Skill],
        local_context_length: usize,
        local_ref: &str,
        remote_ref: Option<&str>,
    ) -> RouterDecision {
        let text = messages
            .iter()
            .rev()
            .find(|m| m.role == embla_model::Role::User)
            .map(|m| m.flat_text())
            .unwrap_or_default();
        let estimated_tokens: usize = messages.iter().map(estimate_message_tokens).sum();

        // 1. Heuristics over the latest user message.
        let heuristic = analyze(&text);

        // 2. Prioritized rules establish the baseline.
        let rule = apply_rules(&text, estimated_tokens, local_context_length, &self.config);
        let mut target = rule.target;
        let mut reason = rule.reason;
        let mut confidence = 0.5;

        // 3. A confident heuristic escalation overrides the rule baseline.
        if heuristic.target == RouteTarget::Remote && heuristic.confidence > 0.70 {
            target = RouteTarget::Remote;
            reason = heuristic.reason;
            confidence = heuristic.confidence;
        } else if heuristic.target == target {
            reason = heuristic.reason;
            confidence = heuristic.confidence;
        }

        // 4. Skill override: the first matched skill with a pin wins.
        for skill in matched_skills(skills, &text) {
            if let Some(pinned) = skill.complexity {
                target = pinned;
                reason = "skill_override";
                confidence = 0.9;
                break;
            }
        }

        // 5. Availability: remote without a remote provider degrades to local.
        if target == RouteTarget::Remote && remote_ref.is_none() {
            return RouterDecision {
                target: RouteTarget::Local,
                provider: local_ref.to_string(),
                reason: "no_remote_provider",
                confidence: 0.5,
            };
        }

        // 6. Attach the resolved provider name.
        let provider = match target {
            RouteTarget::Local => local_ref.to_string(),
            RouteTarget::Remote => remote_ref.expect("checked above").to_string(),
        };
        RouterDecision { target, provider, reason, confidence }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
