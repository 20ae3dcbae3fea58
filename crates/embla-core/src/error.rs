// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// Error surface exposed to producers (channels, HTTP handlers, the CLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentErrorKind {
    /// No provider could be selected (recovered internally in most cases).
    Routing,
    /// The model backend failed after retries and key rotation.
    Provider,
    /// Tool infrastructure failure (not an individual tool error result).
    Tool,
    /// The request could not be made to fit the context window.
    Context,
    /// The caller cancelled the run.
    Cancelled,
    /// The per-run deadline expired while waiting for or holding the
    /// session lock.
    MutexTimeout,
    Internal,
}

#[derive(Debug, thiserror::Error)]
#[error("{kind:?} error: {message}")]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
    #[source]
    pub cause: Option<anyhow::Error>,
}

impl AgentError {
    pub fn new(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), cause: None }
    }

    pub fn with_cause(
        kind: AgentErrorKind,
        message: impl Into<String>,
        cause: anyhow::Error,
    ) -> Self {
        Self { kind, message: message.into(), cause: Some(cause) }
    }

    pub fn provider(cause: anyhow::Error) -> Self {
        Self::with_cause(AgentErrorKind::Provider, cause.to_string(), cause)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = AgentError::new(AgentErrorKind::Provider, "backend down");
        let text = e.to_string();
        assert!(text.contains("Provider"));
        assert!(text.contains("backend down"));
    }

    #[test]
    fn cause_is_preserved_as_source() {
        use std::error::Error;
        let cause = anyhow::anyhow!("root cause");
        let e = AgentError::with_cause(AgentErrorKind::Tool, "wrapper", cause);
        assert!(e.source().is_some());
    }
}
