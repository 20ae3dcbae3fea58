// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod classify;
pub mod keypool;
mod local;
pub mod marker;
pub mod mock;
mod pooled;
mod provider;
mod remote;
pub mod tokenizer;
mod types;

use std::sync::Arc;

pub use local::LocalProvider;
pub use pooled::{AdapterFactory, PooledProvider};
pub use provider::{ModelProvider, ResponseStream};
pub use remote::RemoteProvider;
pub use types::{
    parse_data_url_parts, CompletionRequest, ContentPart, ContextSizeError, FunctionCall,
    Message, MessageContent, ResponseEvent, Role, ToolContentPart, ToolResultContent, ToolSchema,
    Usage,
};

/// Build a provider from its config section.
///
/// A config with more than one resolved credential is wrapped in a
/// [`PooledProvider`] so rotation and cooldowns apply transparently.
pub fn from_config(cfg: &embla_config::ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    let keys = cfg.resolve_api_keys();

    match cfg.provider.as_str() {
        "local" => {
            let base_url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:8080/v1".into());
            if keys.len() > 1 {
                let name = cfg.name.clone();
                let context_length = cfg.context_length;
                let adapter_cfg = cfg.clone();
                let factory: AdapterFactory = Box::new(move |key| {
                    Arc::new(LocalProvider::new(
                        adapter_cfg.name.clone(),
                        Some(key),
                        adapter_cfg
                            .base_url
                            .as_deref()
                            .unwrap_or("http://localhost:8080/v1"),
                        adapter_cfg.context_length,
                        adapter_cfg.max_tokens,
                        adapter_cfg.temperature,
                        adapter_cfg.request_timeout_secs,
                    ))
                });
                Ok(Arc::new(PooledProvider::new(
                    "local",
                    name,
                    context_length,
                    keys,
                    factory,
                )))
            } else {
                Ok(Arc::new(LocalProvider::new(
                    cfg.name.clone(),
                    keys.into_iter().next(),
                    &base_url,
                    cfg.context_length,
                    cfg.max_tokens,
                    cfg.temperature,
                    cfg.request_timeout_secs,
                )))
            }
        }
        "anthropic" => {
            if keys.is_empty() {
                anyhow::bail!(
                    "remote provider '{}' requires an API key (api_key, api_key_env, or api_keys)",
                    cfg.provider
                );
            }
            if keys.len() > 1 {
                let name = cfg.name.clone();
                let context_length = cfg.context_length;
                let adapter_cfg = cfg.clone();
                let factory: AdapterFactory = Box::new(move |key| {
                    Arc::new(RemoteProvider::new(
                        adapter_cfg.name.clone(),
                        key,
                        adapter_cfg.base_url.clone(),
                        adapter_cfg.context_length,
                        adapter_cfg.max_tokens,
                        adapter_cfg.temperature,
                        adapter_cfg.request_timeout_secs,
                    ))
                });
                Ok(Arc::new(PooledProvider::new(
                    "anthropic",
                    name,
                    context_length,
                    keys,
                    factory,
                )))
            } else {
                Ok(Arc::new(RemoteProvider::new(
                    cfg.name.clone(),
                    keys.into_iter().next().unwrap(),
                    cfg.base_url.clone(),
                    cfg.context_length,
                    cfg.max_tokens,
                    cfg.temperature,
                    cfg.request_timeout_secs,
                )))
            }
        }
        other => anyhow::bail!("unknown provider '{other}' (expected \"local\" or \"anthropic\")"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
