// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use embla_config::RouteTarget;

/// A skill: a named instruction bundle surfaced in the system prompt and
/// consulted by the router.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Markdown body injected into the system prompt when the skill matches.
    pub content: String,
    /// Optional routing pin: a skill that declares itself local or remote
    /// forces that target when it matches the user message.
    pub complexity: Option<RouteTarget>,
}

impl Skill {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            content: content.into(),
            complexity: None,
        }
    }

    pub fn with_complexity(mut self, target: RouteTarget) -> Self {
        self.complexity = Some(target);
        self
    }

    /// A skill matches when its name (underscores treated as spaces) appears
    /// in the message text.
    pub fn matches(&self, text: &str) -> bool {
        let needle = self.name.replace('_', " ").to_lowercase();
        !needle.is_empty() && text.to_lowercase().contains(&needle)
    }
}

/// Skills matching the given user text, in registration order.
pub fn matched_skills<'a>(skills: &'a [Skill], text: &str) -> Vec<&'a Skill> {
    skills.iter().filter(|s| s.matches(text)).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skill_matches_by_name_substring() {
        let s = Skill::new("code_review", "review code", "...");
        assert!(s.matches("please do a code review of this"));
        assert!(!s.matches("write a poem"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let s = Skill::new("deploy", "deploys", "...");
        assert!(s.matches("DEPLOY the service"));
    }

    #[test]
    fn matched_skills_preserves_order() {
        let skills = vec![
            Skill::new("alpha", "", ""),
            Skill::new("beta", "", ""),
        ];
        let hits = matched_skills(&skills, "alpha then beta");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].name, "alpha");
    }

    #[test]
    fn complexity_pin_is_carried() {
        let s = Skill::new("heavy_analysis", "", "").with_complexity(RouteTarget::Remote);
        assert_eq!(s.complexity, Some(RouteTarget::Remote));
    }
}
