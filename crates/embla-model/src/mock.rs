// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent};

/// One scripted provider turn: either a sequence of events or a failure.
#[derive(Debug, Clone)]
pub enum Script {
    Events(Vec<ResponseEvent>),
    Fail(String),
}

/// A pre-scripted mock provider.  Each call to `complete` pops the next
/// script from the front of the queue.  This lets tests specify exact event
/// sequences – including tool calls and provider failures – without network
/// access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Script>>>,
    name: String,
    context_length: usize,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `complete()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Total number of `complete()` calls.
    pub calls: Arc<Mutex<usize>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of scripts.  The outer `Vec` is the
    /// ordered list of calls; each entry describes one call's outcome.
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            context_length: 8192,
            last_request: Arc::new(Mutex::new(None)),
            calls: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_context_window(mut self, n: usize) -> Self {
        self.context_length = n;
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![Script::Events(vec![
            ResponseEvent::TextDelta(r),
            ResponseEvent::Usage { input_tokens: 12, output_tokens: 4 },
            ResponseEvent::Done,
        ])])
    }

    /// Convenience: provider that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            // Round 1 – model emits a tool call
            Script::Events(vec![
                ResponseEvent::ToolCall {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                ResponseEvent::Usage { input_tokens: 20, output_tokens: 8 },
                ResponseEvent::Done,
            ]),
            // Round 2 – model responds after the tool result
            Script::Events(vec![
                ResponseEvent::TextDelta(final_text.into()),
                ResponseEvent::Usage { input_tokens: 30, output_tokens: 6 },
                ResponseEvent::Done,
            ]),
        ])
    }

    /// Scripts remaining in the queue.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn context_window(&self) -> usize {
        self.context_length
    }

    fn supports_images(&self) -> bool {
        true
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.calls.lock().unwrap() += 1;
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed
                Script::Events(vec![
                    ResponseEvent::TextDelta("[no more scripts]".into()),
                    ResponseEvent::Done,
                ])
            } else {
                scripts.remove(0)
            }
        };
        match script {
            Script::Fail(msg) => anyhow::bail!(msg),
            Script::Events(events) => {
                let wrapped: Vec<anyhow::Result<ResponseEvent>> =
                    events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
