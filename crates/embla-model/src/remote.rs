// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapter for the hosted remote provider (Anthropic messages API).
//!
//! Unlike the local backend, the remote API has native tool-use semantics:
//! tool calls are typed `tool_use` content blocks and results are `tool_result`
//! blocks.  The conversation shape differs from embla's internal one in two
//! ways that this adapter owns: the system prompt moves to a top-level field,
//! and runs of consecutive tool-call / tool-result messages collapse into
//! single turns with multiple blocks (the API rejects back-to-back messages
//! of the same role).

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    classify::{classify, ErrorKind},
    provider::ResponseStream,
    CompletionRequest, ContextSizeError, ContentPart, Message, MessageContent, ResponseEvent,
    Role, ToolContentPart, ToolResultContent,
};

pub struct RemoteProvider {
    model: String,
    api_key: String,
    base_url: String,
    context_length: usize,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl RemoteProvider {
    pub fn new(
        model: String,
        api_key: String,
        base_url: Option<String>,
        context_length: usize,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        request_timeout_secs: u64,
    ) -> Self {
        let mut builder = reqwest::Client::builder();
        if request_timeout_secs > 0 {
            builder = builder.timeout(std::time::Duration::from_secs(request_timeout_secs));
        }
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            context_length,
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: builder.build().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for RemoteProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_length
    }

    fn supports_images(&self) -> bool {
        true
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let (system_text, messages) = build_remote_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": req.temperature.unwrap_or(self.temperature),
            "stream": req.stream,
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            model = %self.model,
            message_count = req.messages.len(),
            tool_count = tools.len(),
            "sending remote completion request"
        );

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("remote provider request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let message = format!("remote provider error {status}: {text}");
            if classify(&message) == ErrorKind::ContextOverflow
                || text.contains("prompt is too long")
            {
                return Err(anyhow::Error::new(ContextSizeError {
                    prompt_tokens: 0,
                    context_size: self.context_length,
                }));
            }
            bail!(message);
        }

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so we carry a remainder
        // buffer forward.  Only complete lines (terminated by '\n') are
        // parsed; anything left over is prepended to the next chunk.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(anyhow::anyhow!(e))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        let data = data.trim();
                        if let Ok(v) = serde_json::from_str::<Value>(data) {
                            events.push(parse_remote_event(&v));
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

pub(crate) fn parse_remote_event(v: &Value) -> anyhow::Result<ResponseEvent> {
    let event_type = v["type"].as_str().unwrap_or("");
    match event_type {
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("").to_string();
                    Ok(ResponseEvent::TextDelta(text))
                }
                "input_json_delta" => {
                    let partial = delta["partial_json"].as_str().unwrap_or("").to_string();
                    Ok(ResponseEvent::ToolCall {
                        index,
                        id: String::new(),
                        name: String::new(),
                        arguments: partial,
                    })
                }
                // Extended thinking streams the chain-of-thought as a separate
                // delta type; surface it without mixing it into the answer.
                "thinking_delta" => {
                    let thinking = delta["thinking"].as_str().unwrap_or("").to_string();
                    if thinking.is_empty() {
                        Ok(ResponseEvent::TextDelta(String::new()))
                    } else {
                        Ok(ResponseEvent::ThinkingDelta(thinking))
                    }
                }
                _ => Ok(ResponseEvent::TextDelta(String::new())),
            }
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as u32;
            let block = &v["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                let id = block["id"].as_str().unwrap_or("").to_string();
                let name = block["name"].as_str().unwrap_or("").to_string();
                Ok(ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments: String::new(),
                })
            } else {
                Ok(ResponseEvent::TextDelta(String::new()))
            }
        }
        "message_delta" => {
            // The final stop_reason arrives here.  max_tokens means any
            // in-flight tool-call arguments were truncated.
            if v["delta"]["stop_reason"].as_str() == Some("max_tokens") {
                return Ok(ResponseEvent::MaxTokens);
            }
            if let Some(usage) = v.get("usage") {
                return Ok(ResponseEvent::Usage {
                    input_tokens: 0,
                    output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                });
            }
            Ok(ResponseEvent::TextDelta(String::new()))
        }
        "message_start" => {
            if let Some(usage) = v["message"].get("usage") {
                return Ok(ResponseEvent::Usage {
                    input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    output_tokens: 0,
                });
            }
            Ok(ResponseEvent::TextDelta(String::new()))
        }
        "message_stop" => Ok(ResponseEvent::Done),
        _ => Ok(ResponseEvent::TextDelta(String::new())),
    }
}

fn image_block(image_url: &str) -> Value {
    if let Ok((mime, data)) = crate::types::parse_data_url_parts(image_url) {
        json!({
            "type": "image",
            "source": { "type": "base64", "media_type": mime, "data": data }
        })
    } else {
        json!({
            "type": "image",
            "source": { "type": "url", "url": image_url }
        })
    }
}

fn tool_result_blocks(tool_call_id: &str, content: &ToolResultContent) -> Value {
    let wire_content: Value = match content {
        ToolResultContent::Text(t) => json!(t),
        ToolResultContent::Parts(parts) if !parts.is_empty() => {
            let arr: Vec<Value> = parts
                .iter()
                .map(|p| match p {
                    ToolContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ToolContentPart::Image { image_url } => image_block(image_url),
                })
                .collect();
            json!(arr)
        }
        ToolResultContent::Parts(_) => json!(""),
    };
    json!({
        "type": "tool_result",
        "tool_use_id": tool_call_id,
        "content": wire_content,
    })
}

/// Convert a slice of [`Message`]s into the remote wire format.
///
/// Returns `(system_text, conversation_messages)`.  The system message is
/// separated out because the API expects it as a top-level `system` field,
/// not as a conversation turn.  Runs of consecutive tool calls become one
/// assistant message of `tool_use` blocks; runs of tool results become one
/// user message of `tool_result` blocks in the same order.
pub(crate) fn build_remote_messages(messages: &[Message]) -> (String, Vec<Value>) {
    let mut system_text = String::new();
    let mut out: Vec<Value> = Vec::new();
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        if m.role == Role::System {
            // Multiple system messages (base prompt + recall + notices)
            // concatenate into one system field.
            if let Some(t) = m.as_text() {
                if !system_text.is_empty() {
                    system_text.push_str("\n\n");
                }
                system_text.push_str(t);
            }
            i += 1;
            continue;
        }

        if let MessageContent::ToolCall { tool_call_id, function } = &m.content {
            let mut blocks = vec![tool_use_block(tool_call_id, function)];
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall { tool_call_id, function } = &messages[i].content {
                    blocks.push(tool_use_block(tool_call_id, function));
                    i += 1;
                } else {
                    break;
                }
            }
            out.push(json!({ "role": "assistant", "content": blocks }));
            continue;
        }

        if matches!(m.content, MessageContent::ToolResult { .. }) {
            let mut blocks: Vec<Value> = Vec::new();
            while i < messages.len() {
                let MessageContent::ToolResult { tool_call_id, content } = &messages[i].content
                else {
                    break;
                };
                blocks.push(tool_result_blocks(tool_call_id, content));
                i += 1;
            }
            out.push(json!({ "role": "user", "content": blocks }));
            continue;
        }

        let role = match m.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool | Role::System => unreachable!("handled above"),
        };
        match &m.content {
            MessageContent::Text(t) => {
                out.push(json!({ "role": role, "content": t }));
            }
            MessageContent::ContentParts(parts) if !parts.is_empty() => {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::Image { image_url } => image_block(image_url),
                    })
                    .collect();
                out.push(json!({ "role": role, "content": content }));
            }
            MessageContent::ContentParts(_) => {
                out.push(json!({ "role": role, "content": "" }));
            }
            MessageContent::ToolCall { .. } | MessageContent::ToolResult { .. } => {
                unreachable!("handled above")
            }
        }
        i += 1;
    }
    (system_text, out)
}

fn tool_use_block(tool_call_id: &str, function: &crate::FunctionCall) -> Value {
    // The API requires tool_use.id to match `^[a-zA-Z0-9_-]+$`.  An empty id
    // can arise when a content_block_start event was missing from the
    // stream; substitute a stable fallback rather than sending an invalid
    // request.
    let safe_id = if tool_call_id.is_empty() {
        warn!(
            tool_name = %function.name,
            "tool call message has empty id when building remote request; \
             substituting fallback id"
        );
        "tc_fallback".to_string()
    } else {
        tool_call_id.to_string()
    };
    json!({
        "type": "tool_use",
        "id": safe_id,
        "name": function.name,
        "input": serde_json::from_str::<Value>(&function.arguments).unwrap_or(json!({})),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
