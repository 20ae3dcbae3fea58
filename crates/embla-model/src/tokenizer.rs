// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token counting against the local backend's `/tokenize` endpoint.
//!
//! The same system prompt and the unchanged head of the conversation are
//! re-counted on every turn, so the remote tokenizer keeps a bounded cache
//! keyed by the full input string.  Any failure — network, timeout, non-2xx,
//! unparseable body — silently degrades to the character-ratio estimate:
//! token counting must never fail a turn.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde_json::Value;
use tracing::debug;

/// Entries beyond this size are counted but not cached; a single huge tool
/// result would otherwise evict the whole working set.
const MAX_CACHEABLE_CHARS: usize = 100_000;

const CACHE_CAPACITY: usize = 2048;

/// Estimated tokens for a text using the house character ratio.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() as f64 / 3.5).ceil() as usize
}

#[async_trait]
pub trait Tokenizer: Send + Sync {
    async fn count_tokens(&self, text: &str) -> usize;
}

/// Pure estimator — used when no backend tokenizer endpoint is configured.
#[derive(Default)]
pub struct EstimateTokenizer;

#[async_trait]
impl Tokenizer for EstimateTokenizer {
    async fn count_tokens(&self, text: &str) -> usize {
        estimate_tokens(text)
    }
}

/// Client for the backend `POST /tokenize` endpoint (llama.cpp wire format:
/// request `{"content": ...}`, response `{"tokens": [...]}`).
pub struct RemoteTokenizer {
    url: String,
    client: reqwest::Client,
    cache: Mutex<LruCache<String, usize>>,
}

impl RemoteTokenizer {
    pub fn new(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        // The tokenize endpoint lives next to /v1, not under it.
        let root = base.strip_suffix("/v1").unwrap_or(base);
        Self {
            url: format!("{root}/tokenize"),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero cache capacity"),
            )),
        }
    }

    async fn count_remote(&self, text: &str) -> Option<usize> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "content": text }))
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: Value = resp.json().await.ok()?;
        Some(body.get("tokens")?.as_array()?.len())
    }
}

#[async_trait]
impl Tokenizer for RemoteTokenizer {
    async fn count_tokens(&self, text: &str) -> usize {
        let cacheable = text.len() <= MAX_CACHEABLE_CHARS;
        if cacheable {
            if let Some(&count) = self.cache.lock().unwrap().get(&text.to_string()) {
                return count;
            }
        }
        match self.count_remote(text).await {
            Some(count) => {
                if cacheable {
                    self.cache.lock().unwrap().put(text.to_string(), count);
                }
                count
            }
            None => {
                debug!(url = %self.url, "tokenize endpoint unavailable; using estimate");
                estimate_tokens(text)
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
