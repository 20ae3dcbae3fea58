// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// The local inference backend (OpenAI-compatible server such as
    /// llama.cpp, vLLM, or Ollama).  Always present — embla is local-first.
    #[serde(default)]
    pub local: ModelConfig,
    /// Optional remote hosted provider used for escalation and for requests
    /// the router classifies as too heavy for the local model.
    #[serde(default)]
    pub remote: Option<ModelConfig>,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "local" (OpenAI-compatible wire format) or
    /// "anthropic" (native tool-use wire format).
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Base URL override.  Required for the local backend; for hosted
    /// providers the canonical default is used when unset.
    pub base_url: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Additional credentials for the same provider.  When more than one key
    /// is available the provider is wrapped in a rotating key pool with
    /// per-key cooldowns.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Environment variable holding a comma-separated list of extra keys.
    pub api_keys_env: Option<String>,
    /// Context window in tokens.  The fitter and the token budget are homed
    /// on this value.
    #[serde(default = "default_context_length")]
    pub context_length: usize,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
    /// Per-request HTTP timeout in seconds (0 = reqwest default).
    #[serde(default)]
    pub request_timeout_secs: u64,
}

fn default_context_length() -> usize {
    8192
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "local".into(),
            name: "qwen2.5-7b-instruct".into(),
            base_url: Some("http://localhost:8080/v1".into()),
            api_key: None,
            api_key_env: None,
            api_keys: Vec::new(),
            api_keys_env: None,
            context_length: default_context_length(),
            max_tokens: Some(4096),
            temperature: Some(0.2),
            request_timeout_secs: 0,
        }
    }
}

impl ModelConfig {
    /// Resolve the full credential list for this provider: explicit key,
    /// env-var key, explicit list, and comma-separated env list, in that
    /// order, de-duplicated.  An empty result is valid for local servers
    /// that require no authentication.
    pub fn resolve_api_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        if let Some(k) = &self.api_key {
            keys.push(k.clone());
        }
        if let Some(var) = &self.api_key_env {
            if let Ok(k) = std::env::var(var) {
                if !k.is_empty() {
                    keys.push(k);
                }
            }
        }
        keys.extend(self.api_keys.iter().cloned());
        if let Some(var) = &self.api_keys_env {
            if let Ok(list) = std::env::var(var) {
                keys.extend(
                    list.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty()),
                );
            }
        }
        keys.dedup();
        keys
    }
}

fn default_max_turns() -> u32 {
    10
}
fn default_reserve_for_output() -> usize {
    2048
}
fn default_max_tool_result_tokens() -> usize {
    4000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_escalation_threshold() -> f32 {
    0.5
}
fn default_flush_max_entries() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model↔tool iterations per user turn before the loop stops
    /// and returns the last assistant content with the truncated flag set.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Tokens reserved for the model's reply when fitting the request into
    /// the context window.
    #[serde(default = "default_reserve_for_output")]
    pub reserve_for_output: usize,
    /// Token cap for a single tool result before the fitter truncates it
    /// in the request slice (the persisted message is never modified).
    #[serde(default = "default_max_tool_result_tokens")]
    pub max_tool_result_tokens: usize,
    /// Retry attempts for retryable provider errors within one turn.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Confidence threshold below which a local reply is escalated to the
    /// remote provider.
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f32,
    /// Per-run wall-clock deadline while holding the session lock, in
    /// seconds (0 = no limit).
    #[serde(default)]
    pub run_timeout_secs: u64,
    /// Maximum number of facts extracted by one pre-compaction memory flush.
    #[serde(default = "default_flush_max_entries")]
    pub flush_max_entries: usize,
    /// System prompt override; leave None to use the built-in prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            reserve_for_output: default_reserve_for_output(),
            max_tool_result_tokens: default_max_tool_result_tokens(),
            retry_attempts: default_retry_attempts(),
            escalation_threshold: default_escalation_threshold(),
            run_timeout_secs: 0,
            flush_max_entries: default_flush_max_entries(),
            system_prompt: None,
        }
    }
}

/// Where a request should be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RouteTarget {
    #[default]
    Local,
    Remote,
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteTarget::Local => write!(f, "local"),
            RouteTarget::Remote => write!(f, "remote"),
        }
    }
}

fn default_large_context_fraction() -> f32 {
    0.8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Target used when no rule or heuristic produces a stronger signal.
    #[serde(default)]
    pub default_target: RouteTarget,
    /// Messages containing any of these phrases are always served locally.
    #[serde(default)]
    pub always_local: Vec<String>,
    /// Messages containing any of these phrases always go to the remote
    /// provider (subject to remote availability).
    #[serde(default)]
    pub always_remote: Vec<String>,
    /// When the estimated request size exceeds this fraction of the local
    /// context window, route to the remote provider.
    #[serde(default = "default_large_context_fraction")]
    pub large_context_fraction: f32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_target: RouteTarget::Local,
            always_local: Vec::new(),
            always_remote: Vec::new(),
            large_context_fraction: default_large_context_fraction(),
        }
    }
}

fn default_recall_limit() -> usize {
    5
}
fn default_recall_threshold() -> f32 {
    0.35
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of memory snippets recalled per user turn.
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,
    /// Minimum relevance score for a recalled snippet.
    #[serde(default = "default_recall_threshold")]
    pub recall_threshold: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            recall_limit: default_recall_limit(),
            recall_threshold: default_recall_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for persisted conversations.  Defaults to
    /// `~/.local/share/embla/sessions` when unset.
    #[serde(default)]
    pub data_dir: Option<String>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
