// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapter for the local OpenAI-compatible inference server.
//!
//! Speaks `/v1/chat/completions` with SSE streaming.  Local models mostly
//! lack native tool-use support, so tool calls travel inline in the text as
//! `<tool_call>` marker blocks (see [`crate::marker`]):
//!
//! - Outbound: prior assistant tool calls are re-rendered as markers and
//!   consecutive tool results are merged into one synthetic user turn of
//!   `<tool_response>` blocks, so the model sees the conversation in the
//!   protocol it was trained on.
//! - Inbound: streamed text runs through a [`StreamGuard`] so partial tags
//!   never reach the user; when the stream ends the accumulated raw text is
//!   parsed for calls, repairing a close tag lost to an output-limit cutoff.
//!
//! Servers that do grammar-constrained native tool calls emit regular
//! OpenAI-style `tool_calls` deltas; those are forwarded unchanged.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    classify::{classify, ErrorKind},
    marker::{self, StreamGuard},
    provider::ResponseStream,
    CompletionRequest, ContextSizeError, ContentPart, Message, MessageContent, ResponseEvent,
    Role, ToolContentPart, ToolResultContent,
};

pub struct LocalProvider {
    model: String,
    /// API key is optional — local servers usually run unauthenticated.
    api_key: Option<String>,
    chat_url: String,
    context_length: usize,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl LocalProvider {
    pub fn new(
        model: String,
        api_key: Option<String>,
        base_url: &str,
        context_length: usize,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
        request_timeout_secs: u64,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        let mut builder = reqwest::Client::builder();
        if request_timeout_secs > 0 {
            builder = builder.timeout(std::time::Duration::from_secs(request_timeout_secs));
        }
        Self {
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            context_length,
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: builder.build().unwrap_or_default(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_length
    }

    fn supports_images(&self) -> bool {
        // The marker protocol carries image tool results as multimodal parts;
        // whether the loaded model understands them is the server's concern.
        true
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let messages = build_local_messages(&req.messages);

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": req.max_tokens.unwrap_or(self.max_tokens),
            "temperature": req.temperature.unwrap_or(self.temperature),
            "stream_options": { "include_usage": true },
        });
        // Native tool schemas are still attached: grammar-capable servers use
        // them directly, others fold them into the chat template.
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        debug!(
            model = %self.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending local completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req.send().await.context("local backend request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            let message = format!("local backend error {status}: {text}");
            if classify(&message) == ErrorKind::ContextOverflow {
                return Err(anyhow::Error::new(ContextSizeError {
                    prompt_tokens: extract_token_count(&text).unwrap_or(0),
                    context_size: self.context_length,
                }));
            }
            bail!(message);
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across TCP packets.  Maintain a line buffer
        // across chunks; emit events only for complete lines.  The marker
        // filter rides on top: raw deltas accumulate for end-of-stream call
        // extraction while only guard-approved text is emitted.
        let state = LocalStreamState {
            line_buf: String::new(),
            guard: StreamGuard::new(),
            raw: String::new(),
            finished: false,
        };
        let event_stream = byte_stream
            .scan(state, |st, chunk| {
                let mut out: Vec<anyhow::Result<ResponseEvent>> = Vec::new();
                match chunk {
                    Ok(b) => {
                        st.line_buf.push_str(&String::from_utf8_lossy(&b));
                        for ev in drain_complete_sse_lines(&mut st.line_buf) {
                            st.apply(ev, &mut out);
                        }
                    }
                    Err(e) => out.push(Err(anyhow::anyhow!(e))),
                }
                std::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

struct LocalStreamState {
    line_buf: String,
    guard: StreamGuard,
    /// Full unfiltered text, parsed for marker calls when the stream ends.
    raw: String,
    finished: bool,
}

impl LocalStreamState {
    fn apply(
        &mut self,
        ev: anyhow::Result<ResponseEvent>,
        out: &mut Vec<anyhow::Result<ResponseEvent>>,
    ) {
        match ev {
            Ok(ResponseEvent::TextDelta(t)) => {
                self.raw.push_str(&t);
                let visible = self.guard.push(&t);
                if !visible.is_empty() {
                    out.push(Ok(ResponseEvent::TextDelta(visible)));
                }
            }
            Ok(ResponseEvent::Done) => {
                if self.finished {
                    return;
                }
                self.finished = true;
                let tail = self.guard.finish();
                if !tail.is_empty() {
                    out.push(Ok(ResponseEvent::TextDelta(tail)));
                }
                // Marker extraction runs on the raw accumulated text; a
                // cut-off block is repaired inside parse_tool_calls.
                let (_, calls) = marker::parse_tool_calls(&self.raw);
                for (i, call) in calls.into_iter().enumerate() {
                    out.push(Ok(ResponseEvent::ToolCall {
                        index: i as u32,
                        id: format!("tc_{i}"),
                        name: call.name,
                        arguments: call.arguments.to_string(),
                    }));
                }
                out.push(Ok(ResponseEvent::Done));
            }
            other => out.push(other),
        }
    }
}

/// Best-effort extraction of the prompt token count from an overflow error
/// body, e.g. `"requested 9732 tokens"`.
fn extract_token_count(text: &str) -> Option<usize> {
    let re = regex::Regex::new(r"(\d{2,}) tokens").ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    Some(parse_sse_chunk(&v))
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line (bytes not yet terminated by `\n`) is left
/// in `buf` so it can be extended by the next TCP chunk.
pub(crate) fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

fn parse_sse_chunk(v: &Value) -> anyhow::Result<ResponseEvent> {
    // Usage-only chunk (emitted when stream_options.include_usage = true)
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return Ok(ResponseEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        });
    }

    let choice = &v["choices"][0];

    // finish_reason=length means the model hit its output-token limit.  Any
    // in-flight marker block is truncated; the [DONE] handler repairs it.
    if choice["finish_reason"].as_str() == Some("length") {
        return Ok(ResponseEvent::MaxTokens);
    }

    let delta = &choice["delta"];

    // Native tool call delta from grammar-capable servers.
    if let Some(tool_calls) = delta.get("tool_calls") {
        if let Some(tc) = tool_calls.get(0) {
            let index = tc["index"].as_u64().unwrap_or(0) as u32;
            let id = tc["id"].as_str().unwrap_or("").to_string();
            let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
            let args = tc["function"]["arguments"].as_str().unwrap_or("").to_string();
            return Ok(ResponseEvent::ToolCall { index, id, name, arguments: args });
        }
    }

    // Thinking delta — llama.cpp and friends expose chain-of-thought via
    // `reasoning_content` on the delta.
    if let Some(thinking) = delta.get("reasoning_content").and_then(|c| c.as_str()) {
        if !thinking.is_empty() {
            return Ok(ResponseEvent::ThinkingDelta(thinking.to_string()));
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        return Ok(ResponseEvent::TextDelta(text.to_string()));
    }

    Ok(ResponseEvent::TextDelta(String::new()))
}

/// Convert the conversation into the local backend's wire format.
///
/// Assistant tool calls become marker text; a run of consecutive tool
/// results collapses into one user turn of `<tool_response>` blocks.  Tool
/// results carrying images become multimodal user content so vision models
/// can see screenshots produced by tools.
pub(crate) fn build_local_messages(messages: &[Message]) -> Vec<Value> {
    fn role_str(r: &Role) -> &'static str {
        match r {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    let mut result: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;

    while i < messages.len() {
        let m = &messages[i];

        // A run of assistant tool-call messages is re-rendered as one
        // assistant turn of marker blocks.
        if let MessageContent::ToolCall { function, .. } = &m.content {
            let mut text = marker::render_tool_call(&function.name, &function.arguments);
            i += 1;
            while i < messages.len() {
                if let MessageContent::ToolCall { function, .. } = &messages[i].content {
                    text.push('\n');
                    text.push_str(&marker::render_tool_call(
                        &function.name,
                        &function.arguments,
                    ));
                    i += 1;
                } else {
                    break;
                }
            }
            result.push(json!({ "role": "assistant", "content": text }));
            continue;
        }

        // A run of tool results becomes one synthetic user turn.  Text
        // results are wrapped in <tool_response> tags; image parts ride
        // alongside as multimodal content.
        if matches!(m.content, MessageContent::ToolResult { .. }) {
            let mut parts: Vec<Value> = Vec::new();
            while i < messages.len() {
                let MessageContent::ToolResult { content, .. } = &messages[i].content else {
                    break;
                };
                match content {
                    ToolResultContent::Text(t) => {
                        parts.push(json!({
                            "type": "text",
                            "text": marker::wrap_tool_response(t),
                        }));
                    }
                    ToolResultContent::Parts(tool_parts) => {
                        for p in tool_parts {
                            match p {
                                ToolContentPart::Text { text } => parts.push(json!({
                                    "type": "text",
                                    "text": marker::wrap_tool_response(text),
                                })),
                                ToolContentPart::Image { image_url } => parts.push(json!({
                                    "type": "image_url",
                                    "image_url": { "url": image_url },
                                })),
                            }
                        }
                    }
                }
                i += 1;
            }
            // Collapse the all-text case to a plain string for servers with
            // strict single-string content handling.
            let all_text = parts.iter().all(|p| p["type"] == "text");
            let content: Value = if all_text {
                let joined = parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
                json!(joined)
            } else {
                json!(parts)
            };
            result.push(json!({ "role": "user", "content": content }));
            continue;
        }

        let v = match &m.content {
            MessageContent::Text(t) => json!({
                "role": role_str(&m.role),
                "content": t,
            }),
            MessageContent::ContentParts(parts) if !parts.is_empty() => {
                let content: Vec<Value> = parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                        ContentPart::Image { image_url } => json!({
                            "type": "image_url",
                            "image_url": { "url": image_url },
                        }),
                    })
                    .collect();
                json!({ "role": role_str(&m.role), "content": content })
            }
            MessageContent::ContentParts(_) => {
                json!({ "role": role_str(&m.role), "content": "" })
            }
            MessageContent::ToolCall { .. } | MessageContent::ToolResult { .. } => {
                unreachable!("handled above")
            }
        };
        result.push(v);
        i += 1;
    }

    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
