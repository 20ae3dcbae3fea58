// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use embla_config::RouteTarget;
use embla_tools::ToolCall;

use crate::budget::BudgetLevel;

/// Events emitted by the agent during a single run.
/// Consumers (CLI, channels, HTTP handlers) subscribe to these to drive
/// their output.  Send failures are ignored: a slow or departed consumer
/// never affects the loop.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// The router picked a target for this run
    RoutingDecision {
        target: RouteTarget,
        provider: String,
        reason: &'static str,
        confidence: f32,
    },
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A thinking/reasoning chunk from the model
    ThinkingDelta(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// A weak local reply is being retried against the remote provider
    Escalated { reason: &'static str },
    /// Context fitting dropped older messages from this request
    ContextTrimmed { dropped_messages: usize },
    /// The token budget crossed a warning threshold
    BudgetWarning { level: BudgetLevel, utilization: f32 },
    /// The session history was compacted into a summary
    ContextCompacted {
        messages_before: usize,
        messages_after: usize,
    },
    /// The agent has finished processing the current user turn
    ResponseComplete,
    /// A recoverable error occurred
    Error(String),
}

/// Pre-execution hook for tool calls.  Returning `false` skips the call;
/// the model sees a skipped-result message instead.
pub trait ToolGate: Send + Sync {
    fn allow(&self, call: &ToolCall) -> bool;
}

/// Gate that allows everything; used when the producer installs no policy.
pub struct AllowAll;

impl ToolGate for AllowAll {
    fn allow(&self, _call: &ToolCall) -> bool {
        true
    }
}
