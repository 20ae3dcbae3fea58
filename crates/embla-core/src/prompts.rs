// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use embla_tools::ToolSchema;

use crate::skills::Skill;

const IDENTITY: &str = "\
You are embla, a local-first assistant. You run primarily on a local model \
and escalate to a remote model only when a task demands it. Be direct and \
concrete. When a task requires reading files, running commands, or looking \
things up, use the available tools rather than guessing. When you have \
gathered enough to answer, answer plainly.";

/// Assemble the system prompt for one run.
///
/// `override_identity` replaces the built-in identity paragraph (from
/// config); the tool and skill catalogs and the caller's extra context are
/// appended either way so the model always knows its capabilities.
pub fn system_prompt(
    override_identity: Option<&str>,
    tools: &[ToolSchema],
    skills: &[Skill],
    extra_context: Option<&str>,
) -> String {
    let mut prompt = String::from(override_identity.unwrap_or(IDENTITY));

    if !tools.is_empty() {
        prompt.push_str("\n\n## Tools\n");
        for t in tools {
            prompt.push_str(&format!("- {}: {}\n", t.name, t.description));
        }
    }

    if !skills.is_empty() {
        prompt.push_str("\n## Skills\n");
        for s in skills {
            prompt.push_str(&format!("- {}: {}\n", s.name, s.description));
        }
    }

    if let Some(extra) = extra_context {
        if !extra.trim().is_empty() {
            prompt.push_str("\n## Context\n");
            prompt.push_str(extra);
            prompt.push('\n');
        }
    }

    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
