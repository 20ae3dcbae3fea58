// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Key-rotating provider wrapper.
//!
//! A [`PooledProvider`] is an ordinary [`ModelProvider`] that owns a
//! [`KeyPool`] and a factory closure producing a concrete adapter for a
//! given credential.  Adapter construction must be cheap (no network in
//! constructors) because a fresh adapter is built per call.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    classify::{classify, is_retryable},
    keypool::KeyPool,
    provider::ResponseStream,
    CompletionRequest, ContextSizeError,
};

pub type AdapterFactory = Box<dyn Fn(String) -> Arc<dyn crate::ModelProvider> + Send + Sync>;

pub struct PooledProvider {
    name: String,
    model: String,
    context_length: usize,
    pool: KeyPool,
    factory: AdapterFactory,
}

impl PooledProvider {
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        context_length: usize,
        credentials: Vec<String>,
        factory: AdapterFactory,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            context_length,
            pool: KeyPool::new(credentials),
            factory,
        }
    }

    /// Access the underlying pool for status displays.
    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }
}

#[async_trait]
impl crate::ModelProvider for PooledProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_length
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let key = self.pool.get();
        let adapter = (self.factory)(key);

        match adapter.complete(req.clone()).await {
            Ok(stream) => {
                self.pool.report_success();
                Ok(stream)
            }
            Err(e) => {
                // A context overflow is a property of the request, not the
                // credential — pass it through without penalising the key so
                // the caller can refit.
                if e.downcast_ref::<ContextSizeError>().is_some() {
                    return Err(e);
                }
                let kind = classify(&e.to_string());
                self.pool.report_error(kind);
                if is_retryable(kind) && self.pool.available_count() > 0 {
                    let next_key = self.pool.get();
                    debug!(provider = %self.name, ?kind, "retrying with next pool key");
                    let retry_adapter = (self.factory)(next_key);
                    match retry_adapter.complete(req).await {
                        Ok(stream) => {
                            self.pool.report_success();
                            Ok(stream)
                        }
                        Err(e2) => {
                            if e2.downcast_ref::<ContextSizeError>().is_none() {
                                self.pool.report_error(classify(&e2.to_string()));
                            }
                            Err(e2)
                        }
                    }
                } else {
                    warn!(provider = %self.name, ?kind, "pooled provider call failed");
                    Err(e)
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::{mock::ScriptedMockProvider, Message, ModelProvider, ResponseEvent};

    fn req() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("hi")],
            stream: true,
            ..Default::default()
        }
    }

    /// Adapter that fails with the given message for the first `fail_n`
    /// constructed instances and then succeeds.
    struct FlakyAdapter {
        key: String,
        fail: bool,
        error: String,
    }

    #[async_trait]
    impl crate::ModelProvider for FlakyAdapter {
        fn name(&self) -> &str {
            "flaky"
        }
        fn model_name(&self) -> &str {
            "flaky-model"
        }
        fn context_window(&self) -> usize {
            4096
        }
        async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
            if self.fail {
                anyhow::bail!("{} (key {})", self.error, self.key);
            }
            let events: Vec<anyhow::Result<ResponseEvent>> = vec![
                Ok(ResponseEvent::TextDelta(format!("ok from {}", self.key))),
                Ok(ResponseEvent::Done),
            ];
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    fn flaky_pool(fail_first_n: usize, error: &str) -> (PooledProvider, Arc<Mutex<Vec<String>>>) {
        let used: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let used2 = Arc::clone(&used);
        let calls = AtomicUsize::new(0);
        let error = error.to_string();
        let provider = PooledProvider::new(
            "flaky",
            "flaky-model",
            4096,
            vec!["kA".into(), "kB".into(), "kC".into()],
            Box::new(move |key| {
                used2.lock().unwrap().push(key.clone());
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Arc::new(FlakyAdapter { key, fail: n < fail_first_n, error: error.clone() })
            }),
        );
        (provider, used)
    }

    #[tokio::test]
    async fn first_key_success_does_not_rotate() {
        let (p, used) = flaky_pool(0, "");
        p.complete(req()).await.unwrap();
        assert_eq!(*used.lock().unwrap(), vec!["kA"]);
        assert_eq!(p.pool().available_count(), 3);
    }

    #[tokio::test]
    async fn rate_limited_key_rotates_and_retries_once() {
        let (p, used) = flaky_pool(1, "429 too many requests");
        let stream = p.complete(req()).await.unwrap();
        drop(stream);
        assert_eq!(*used.lock().unwrap(), vec!["kA", "kB"]);
        // kA is cooling down, kB and kC remain available.
        assert_eq!(p.pool().available_count(), 2);
        assert!(p.pool().cooldown_remaining(0).is_some());
    }

    #[tokio::test]
    async fn auth_error_does_not_retry() {
        let (p, used) = flaky_pool(3, "401 unauthorized");
        let result = p.complete(req()).await;
        assert!(result.is_err());
        // No retry for a non-retryable kind — only one adapter constructed.
        assert_eq!(*used.lock().unwrap(), vec!["kA"]);
    }

    #[tokio::test]
    async fn both_attempts_failing_reports_both_keys() {
        let (p, used) = flaky_pool(3, "503 service unavailable");
        let result = p.complete(req()).await;
        assert!(result.is_err());
        assert_eq!(*used.lock().unwrap(), vec!["kA", "kB"]);
        assert_eq!(p.pool().available_count(), 1);
    }

    #[tokio::test]
    async fn context_size_error_passes_through_without_cooldown() {
        let provider = PooledProvider::new(
            "p",
            "m",
            4096,
            vec!["kA".into()],
            Box::new(|_key| {
                struct Overflowing;
                #[async_trait]
                impl crate::ModelProvider for Overflowing {
                    fn name(&self) -> &str {
                        "o"
                    }
                    fn model_name(&self) -> &str {
                        "o"
                    }
                    fn context_window(&self) -> usize {
                        4096
                    }
                    async fn complete(
                        &self,
                        _req: CompletionRequest,
                    ) -> anyhow::Result<ResponseStream> {
                        Err(anyhow::Error::new(ContextSizeError {
                            prompt_tokens: 5000,
                            context_size: 4096,
                        }))
                    }
                }
                Arc::new(Overflowing)
            }),
        );
        let err = match provider.complete(req()).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(err.downcast_ref::<ContextSizeError>().is_some());
        assert_eq!(provider.pool().available_count(), 1, "key must not be penalised");
    }

    #[tokio::test]
    async fn pooled_provider_delegates_metadata() {
        let p = PooledProvider::new(
            "anthropic",
            "claude-sonnet-4",
            200_000,
            vec!["k".into()],
            Box::new(|_| Arc::new(ScriptedMockProvider::always_text("x"))),
        );
        assert_eq!(p.name(), "anthropic");
        assert_eq!(p.model_ref(), "anthropic/claude-sonnet-4");
        assert_eq!(p.context_window(), 200_000);
    }
}
