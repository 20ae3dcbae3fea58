// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The turn orchestrator.
//!
//! [`Agent::run`] is the single entry point every producer uses: it takes
//! the session lock, composes the request (system prompt, memory recalls,
//! the new user message), routes to a provider, and drives the model↔tool
//! loop until the model answers in plain text or the iteration budget runs
//! out.  A weak local answer gets one retry against the remote provider.
//! Only then are the new messages persisted.
//!
//! Cancellation is structural: dropping the returned future releases the
//! session lock at the next suspension point and nothing is persisted for
//! the interrupted turn.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use embla_config::{Config, RouteTarget};
use embla_memory::{ConversationStore, MemoryStore};
use embla_model::{
    classify::{classify, is_retryable, retry_delay, ErrorKind},
    CompletionRequest, ContextSizeError, Message, ModelProvider, ResponseEvent, Usage,
};
use embla_tools::{ToolCall, ToolOutput, ToolRegistry};

use crate::{
    budget::BudgetLevel,
    error::{AgentError, AgentErrorKind},
    escalate,
    events::{AgentEvent, ToolGate},
    fitter::{self, fit_messages, FitConfig},
    prompts,
    router::Router,
    session::{SessionHandle, SessionRegistry, SessionState},
    skills::Skill,
    summarize,
};

/// Options for one run.  All fields optional; defaults give a silent,
/// ungated run with no extra context.
#[derive(Default)]
pub struct RunOptions {
    /// Event sink.  Send failures are ignored — a gone consumer never
    /// affects the loop.
    pub events: Option<mpsc::Sender<AgentEvent>>,
    /// Pre-execution approval hook for tool calls.
    pub gate: Option<Arc<dyn ToolGate>>,
    /// Producer-supplied context appended to the system prompt (channel
    /// names, standup notes, ...).
    pub extra_context: Option<String>,
}

/// The final result of one run.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub content: String,
    pub target: RouteTarget,
    /// `<provider>/<model>` that produced the final answer.
    pub provider: String,
    pub usage: Usage,
    pub escalated: bool,
    /// Model↔tool iterations consumed (across escalation reruns).
    pub turns: u32,
    /// True when the iteration budget ran out before a tool-free answer.
    pub truncated: bool,
}

/// The agent runtime shared by all sessions.
pub struct Agent {
    local: Arc<dyn ModelProvider>,
    remote: Option<Arc<dyn ModelProvider>>,
    tools: Arc<ToolRegistry>,
    router: Router,
    memory: Option<Arc<dyn MemoryStore>>,
    conversations: Option<Arc<dyn ConversationStore>>,
    skills: Vec<Skill>,
    config: Arc<Config>,
    sessions: SessionRegistry,
}

/// Result of one model↔tool loop (stage 3).
struct LoopOutcome {
    content: String,
    usage: Usage,
    turns: u32,
    truncated: bool,
    final_had_tool_calls: bool,
}

/// One collected provider response.
struct StreamedTurn {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Usage,
}

impl Agent {
    pub fn new(local: Arc<dyn ModelProvider>, config: Arc<Config>) -> Self {
        let router = Router::new(config.router.clone());
        Self {
            local,
            remote: None,
            tools: Arc::new(ToolRegistry::new()),
            router,
            memory: None,
            conversations: None,
            skills: Vec::new(),
            config,
            sessions: SessionRegistry::new(),
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn ModelProvider>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_conversations(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    pub fn with_skills(mut self, skills: Vec<Skill>) -> Self {
        self.skills = skills;
        self
    }

    /// Delete a session: registry entry and persisted history.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), AgentError> {
        self.sessions.remove(session_id);
        if let Some(store) = &self.conversations {
            store.delete(session_id).await.map_err(|e| {
                AgentError::with_cause(AgentErrorKind::Internal, "deleting session history", e)
            })?;
        }
        Ok(())
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.ids()
    }

    /// Process one user message in the given session.
    ///
    /// Runs are serialized per session (FIFO) and parallel across sessions.
    /// With `agent.run_timeout_secs` configured, the whole run races a
    /// deadline and fails with [`AgentErrorKind::MutexTimeout`] on expiry.
    pub async fn run(
        &self,
        session_id: &str,
        user_text: &str,
        opts: RunOptions,
    ) -> Result<AgentResponse, AgentError> {
        let handle = self
            .sessions
            .get_or_create(session_id, self.local.context_window());
        let deadline = (self.config.agent.run_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.agent.run_timeout_secs));

        let result = handle
            .gate
            .run(deadline, || {
                self.run_locked(&handle, session_id, user_text, &opts)
            })
            .await;

        match result {
            Ok(inner) => inner,
            Err(timeout) => {
                emit(&opts.events, AgentEvent::Error(timeout.to_string())).await;
                Err(AgentError::new(AgentErrorKind::MutexTimeout, timeout.to_string()))
            }
        }
    }

    async fn run_locked(
        &self,
        handle: &SessionHandle,
        session_id: &str,
        user_text: &str,
        opts: &RunOptions,
    ) -> Result<AgentResponse, AgentError> {
        let mut state = handle.state.lock().await;

        // Lazy history load on the session's first touch.
        if !state.loaded_from_store {
            state.loaded_from_store = true;
            if let Some(store) = &self.conversations {
                match store.load(session_id).await {
                    Ok(history) if !history.is_empty() => {
                        debug!(session = session_id, messages = history.len(), "restored history");
                        state.messages = history;
                    }
                    Ok(_) => {}
                    Err(e) => warn!(session = session_id, error = %e, "history load failed"),
                }
            }
        }

        // ── 1. Compose ───────────────────────────────────────────────────────
        let tool_schemas: Vec<embla_model::ToolSchema> = self
            .tools
            .schemas()
            .into_iter()
            .map(|s| embla_model::ToolSchema {
                name: s.name,
                description: s.description,
                parameters: s.parameters,
            })
            .collect();
        let system_prompt = prompts::system_prompt(
            self.config.agent.system_prompt.as_deref(),
            &self.tools.schemas(),
            &self.skills,
            opts.extra_context.as_deref(),
        );

        if let Some(memory) = &self.memory {
            let recalled = memory
                .recall(
                    user_text,
                    self.config.memory.recall_limit,
                    self.config.memory.recall_threshold,
                )
                .await;
            if !recalled.is_empty() {
                state.messages.push(Message::system(format!(
                    "[Recalled memories relevant to this message: {recalled}]"
                )));
            }
        }

        let persist_from = state.messages.len();
        state.messages.push(Message::user(user_text));

        // ── 2. Route ─────────────────────────────────────────────────────────
        let local_ref = self.local.model_ref();
        let remote_ref = self.remote.as_ref().map(|r| r.model_ref());
        let decision = self.router.decide(
            &state.messages,
            &self.skills,
            self.local.context_window(),
            &local_ref,
            remote_ref.as_deref(),
        );
        emit(
            &opts.events,
            AgentEvent::RoutingDecision {
                target: decision.target,
                provider: decision.provider.clone(),
                reason: decision.reason,
                confidence: decision.confidence,
            },
        )
        .await;

        let mut target = decision.target;
        let mut provider: Arc<dyn ModelProvider> = match target {
            RouteTarget::Local => Arc::clone(&self.local),
            RouteTarget::Remote => Arc::clone(self.remote.as_ref().expect("router checked")),
        };
        let mut provider_ref = decision.provider.clone();

        // ── 3. Turn loop ─────────────────────────────────────────────────────
        state.budget.set_context_length(provider.context_window());
        let mut outcome = self
            .turn_loop(&mut state, provider.as_ref(), &system_prompt, &tool_schemas, opts)
            .await?;

        // ── 4. Escalation ────────────────────────────────────────────────────
        let mut escalated = false;
        if target == RouteTarget::Local {
            let verdict = escalate::assess(
                &outcome.content,
                outcome.final_had_tool_calls,
                None,
                self.config.agent.escalation_threshold,
            );
            if let (Some(esc), Some(remote)) = (verdict, &self.remote) {
                debug!(reason = esc.reason, "escalating weak local reply to remote");
                emit(&opts.events, AgentEvent::Escalated { reason: esc.reason }).await;
                escalated = true;
                target = RouteTarget::Remote;
                provider = Arc::clone(remote);
                provider_ref = provider.model_ref();
                state.budget.set_context_length(provider.context_window());
                let rerun = self
                    .turn_loop(&mut state, provider.as_ref(), &system_prompt, &tool_schemas, opts)
                    .await?;
                outcome = LoopOutcome {
                    content: rerun.content,
                    usage: {
                        let mut u = outcome.usage;
                        u.add(rerun.usage);
                        u
                    },
                    turns: outcome.turns + rerun.turns,
                    truncated: rerun.truncated,
                    final_had_tool_calls: rerun.final_had_tool_calls,
                };
            }
        }

        // ── 5. Persist ───────────────────────────────────────────────────────
        if let Some(store) = &self.conversations {
            let new_messages = &state.messages[persist_from..];
            if let Err(e) = store.append(session_id, new_messages).await {
                warn!(session = session_id, error = %e, "conversation append failed");
            }
        }
        emit(&opts.events, AgentEvent::ResponseComplete).await;

        Ok(AgentResponse {
            content: outcome.content,
            target,
            provider: provider_ref,
            usage: outcome.usage,
            escalated,
            turns: outcome.turns,
            truncated: outcome.truncated,
        })
    }

    /// Stage 3: fit, call, execute tools, repeat.
    async fn turn_loop(
        &self,
        state: &mut SessionState,
        provider: &dyn ModelProvider,
        system_prompt: &str,
        tool_schemas: &[embla_model::ToolSchema],
        opts: &RunOptions,
    ) -> Result<LoopOutcome, AgentError> {
        let cfg = &self.config.agent;
        let mut usage_total = Usage::default();
        let mut turns = 0u32;
        let mut last_text = String::new();
        let mut reserve = cfg.reserve_for_output;

        loop {
            turns += 1;
            if turns > cfg.max_turns {
                // Budget exhausted: return the last assistant content and
                // flag the truncation rather than erroring out.
                return Ok(LoopOutcome {
                    content: last_text,
                    usage: usage_total,
                    turns: turns - 1,
                    truncated: true,
                    final_had_tool_calls: true,
                });
            }

            // a. Fit, with one reserve-tightening refit on overflow.
            let mut refitted = false;
            let turn = loop {
                let fit_cfg = FitConfig {
                    context_length: provider.context_window(),
                    reserve_for_output: reserve,
                    max_tool_result_tokens: cfg.max_tool_result_tokens,
                };
                let fitted = fit_messages(
                    system_prompt,
                    state.summary.as_deref(),
                    &state.messages,
                    tool_schemas,
                    &fit_cfg,
                );
                if fitted.dropped_any() {
                    emit(
                        &opts.events,
                        AgentEvent::ContextTrimmed { dropped_messages: fitted.dropped.len() },
                    )
                    .await;
                    self.absorb_dropped(state, &fitted.dropped).await;
                }

                let mut request_messages = Vec::with_capacity(fitted.messages.len() + 1);
                request_messages.push(Message::system(system_prompt));
                request_messages.extend(fitted.messages);

                // b/c. Call with bounded retries for retryable kinds.
                match self
                    .call_with_retries(provider, request_messages, tool_schemas, opts)
                    .await
                {
                    Ok(turn) => break turn,
                    Err(e) => {
                        if let Some(cse) = e.downcast_ref::<ContextSizeError>() {
                            if !refitted {
                                refitted = true;
                                let overflow =
                                    cse.prompt_tokens.saturating_sub(cse.context_size).max(512);
                                debug!(overflow, "context overflow; tightening output reserve");
                                reserve += overflow;
                                continue;
                            }
                            emit(&opts.events, AgentEvent::Error(e.to_string())).await;
                            return Err(AgentError::with_cause(
                                AgentErrorKind::Context,
                                "request does not fit the context window after refit",
                                e,
                            ));
                        }
                        emit(&opts.events, AgentEvent::Error(e.to_string())).await;
                        return Err(AgentError::provider(e));
                    }
                }
            };

            // d. Budget accounting and hysteretic warnings.
            usage_total.add(turn.usage);
            state
                .budget
                .record(turn.usage.input_tokens, turn.usage.output_tokens);
            let status = state.budget.status();
            if state.budget.should_warn_high() {
                emit(
                    &opts.events,
                    AgentEvent::BudgetWarning {
                        level: BudgetLevel::High,
                        utilization: status.utilization,
                    },
                )
                .await;
                state.messages.push(Message::system(
                    "[Context usage is above 75% of the window. Prefer concise replies and \
                     avoid re-reading large files.]",
                ));
            }
            if state.budget.should_warn_critical() {
                emit(
                    &opts.events,
                    AgentEvent::BudgetWarning {
                        level: BudgetLevel::Critical,
                        utilization: status.utilization,
                    },
                )
                .await;
                state.messages.push(Message::system(
                    "[Context usage is above 90% of the window. Older conversation will be \
                     summarized.]",
                ));
                self.compact_oldest_half(state, opts).await;
            }

            // e. Plain answer: done.
            if turn.tool_calls.is_empty() {
                if !turn.text.is_empty() {
                    state.messages.push(Message::assistant(&turn.text));
                }
                return Ok(LoopOutcome {
                    content: turn.text,
                    usage: usage_total,
                    turns,
                    truncated: false,
                    final_had_tool_calls: false,
                });
            }

            // f. Tool calls: append the assistant turn, execute, append
            // results, iterate.
            if !turn.text.is_empty() {
                last_text = turn.text.clone();
                state.messages.push(Message::assistant(&turn.text));
            }
            for call in &turn.tool_calls {
                emit(&opts.events, AgentEvent::ToolCallStarted(call.clone())).await;
                state
                    .messages
                    .push(Message::tool_call(&call.id, &call.name, call.args.to_string()));
            }

            let outputs = self.execute_tools(&turn.tool_calls, opts).await;

            for (call, output) in turn.tool_calls.iter().zip(outputs.iter()) {
                emit(
                    &opts.events,
                    AgentEvent::ToolCallFinished {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        output: output.content.clone(),
                        is_error: output.is_error,
                    },
                )
                .await;
                state.messages.push(tool_result_message(call, output));
            }
        }
    }

    /// Execute one round of tool calls in parallel, preserving order.
    /// A denied gate check or a panicking tool becomes an error *result*;
    /// the turn continues either way.
    async fn execute_tools(&self, calls: &[ToolCall], opts: &RunOptions) -> Vec<ToolOutput> {
        enum Pending {
            Skipped(ToolOutput),
            Running(tokio::task::JoinHandle<ToolOutput>),
        }

        let mut pending = Vec::with_capacity(calls.len());
        for call in calls {
            let allowed = opts.gate.as_ref().map(|g| g.allow(call)).unwrap_or(true);
            if !allowed {
                pending.push(Pending::Skipped(ToolOutput::err(
                    &call.id,
                    "[Tool call skipped: denied by the operator]",
                )));
                continue;
            }
            let registry = Arc::clone(&self.tools);
            let call = call.clone();
            pending.push(Pending::Running(tokio::spawn(async move {
                registry.execute(&call).await
            })));
        }

        let mut outputs = Vec::with_capacity(calls.len());
        for (i, p) in pending.into_iter().enumerate() {
            let output = match p {
                Pending::Skipped(out) => out,
                Pending::Running(task) => match task.await {
                    Ok(out) => out,
                    Err(e) => {
                        ToolOutput::err(&calls[i].id, format!("tool execution panicked: {e}"))
                    }
                },
            };
            outputs.push(output);
        }
        outputs
    }

    /// One provider call with classification-driven retries.
    async fn call_with_retries(
        &self,
        provider: &dyn ModelProvider,
        messages: Vec<Message>,
        tool_schemas: &[embla_model::ToolSchema],
        opts: &RunOptions,
    ) -> anyhow::Result<StreamedTurn> {
        let attempts = self.config.agent.retry_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match self
                .stream_turn(provider, messages.clone(), tool_schemas, opts)
                .await
            {
                Ok(turn) => return Ok(turn),
                Err(e) => {
                    if e.downcast_ref::<ContextSizeError>().is_some() {
                        return Err(e);
                    }
                    let kind = classify(&format!("{e:#}"));
                    if kind == ErrorKind::ContextOverflow {
                        // Lexically detected overflow without the typed error
                        // still must reach the refit path.
                        warn!(error = %e, "provider reported context overflow in-band");
                        return Err(anyhow::Error::new(ContextSizeError {
                            prompt_tokens: 0,
                            context_size: provider.context_window(),
                        }));
                    }
                    if is_retryable(kind) && attempt + 1 < attempts {
                        let delay = retry_delay(kind, attempt);
                        warn!(?kind, attempt, delay_ms = delay.as_millis() as u64, "provider retry");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Drive one streamed completion, forwarding deltas to the event sink
    /// and accumulating fragmented tool calls by slot index.
    async fn stream_turn(
        &self,
        provider: &dyn ModelProvider,
        messages: Vec<Message>,
        tool_schemas: &[embla_model::ToolSchema],
        opts: &RunOptions,
    ) -> anyhow::Result<StreamedTurn> {
        let req = CompletionRequest {
            messages,
            tools: tool_schemas.to_vec(),
            stream: true,
            ..Default::default()
        };
        let mut stream = provider.complete(req).await?;

        #[derive(Default)]
        struct PendingCall {
            id: String,
            name: String,
            arguments: String,
        }

        let mut text = String::new();
        let mut usage = Usage::default();
        let mut pending: BTreeMap<u32, PendingCall> = BTreeMap::new();
        let mut cut_off = false;

        while let Some(ev) = stream.next().await {
            match ev? {
                ResponseEvent::TextDelta(t) => {
                    if !t.is_empty() {
                        emit(&opts.events, AgentEvent::TextDelta(t.clone())).await;
                        text.push_str(&t);
                    }
                }
                ResponseEvent::ThinkingDelta(t) => {
                    emit(&opts.events, AgentEvent::ThinkingDelta(t)).await;
                }
                ResponseEvent::ToolCall { index, id, name, arguments } => {
                    let slot = pending.entry(index).or_default();
                    if !id.is_empty() {
                        slot.id = id;
                    }
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.arguments.push_str(&arguments);
                }
                ResponseEvent::Usage { input_tokens, output_tokens } => {
                    usage = Usage { input_tokens, output_tokens };
                }
                ResponseEvent::MaxTokens => {
                    debug!("output token limit reached mid-turn");
                    cut_off = true;
                }
                ResponseEvent::Error(msg) => {
                    emit(&opts.events, AgentEvent::Error(msg)).await;
                }
                ResponseEvent::Done => break,
            }
        }

        // A cut-off argument stream leaves broken JSON behind; an empty
        // object lets the model retry rather than poisoning the history.
        let tool_calls: Vec<ToolCall> = pending
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let args = serde_json::from_str(&c.arguments).unwrap_or_else(|e| {
                    if !cut_off {
                        warn!(name = %c.name, error = %e, "unparseable tool arguments");
                    }
                    serde_json::json!({})
                });
                ToolCall { id: c.id, name: c.name, args }
            })
            .collect();

        Ok(StreamedTurn { text, tool_calls, usage })
    }

    /// Flush durable facts from a newly dropped prefix into memory, then
    /// fold the prefix into the running summary.  Flush first, always:
    /// summarization compresses away exactly the literals the flush keeps.
    async fn absorb_dropped(&self, state: &mut SessionState, dropped: &[Message]) {
        if dropped.len() <= state.flushed_upto {
            return;
        }
        let newly = &dropped[state.flushed_upto..];
        state.flushed_upto = dropped.len();

        if let Some(memory) = &self.memory {
            let facts = summarize::flush_facts(
                self.local.as_ref(),
                newly,
                self.config.agent.flush_max_entries,
            )
            .await;
            for entry in facts {
                if let Err(e) = memory.store(entry).await {
                    warn!(error = %e, "memory store failed during flush");
                }
            }
        }

        let summary =
            summarize::summarize_conversation(self.local.as_ref(), newly, state.summary.as_deref())
                .await;
        if !summary.is_empty() {
            state.summary = Some(summary);
        }
    }

    /// Critical-budget compaction: replace the oldest half of the session
    /// with a single summary, respecting tool-group atomicity.
    async fn compact_oldest_half(&self, state: &mut SessionState, opts: &RunOptions) {
        let before = state.messages.len();
        let ranges = fitter::group_ranges(&state.messages);
        if ranges.len() < 2 {
            return;
        }
        let half = before / 2;
        let mut split = 0usize;
        for (start, end) in &ranges {
            if *end > half {
                split = *start;
                break;
            }
            split = *end;
        }
        if split == 0 || split >= before {
            return;
        }

        let oldest: Vec<Message> = state.messages[..split].to_vec();

        if let Some(memory) = &self.memory {
            let facts = summarize::flush_facts(
                self.local.as_ref(),
                &oldest,
                self.config.agent.flush_max_entries,
            )
            .await;
            for entry in facts {
                let _ = memory.store(entry).await;
            }
        }
        let summary =
            summarize::summarize_conversation(self.local.as_ref(), &oldest, state.summary.as_deref())
                .await;
        state.summary = Some(summary);
        state.messages.drain(..split);
        state.flushed_upto = 0;

        emit(
            &opts.events,
            AgentEvent::ContextCompacted {
                messages_before: before,
                messages_after: state.messages.len(),
            },
        )
        .await;
    }
}

fn tool_result_message(call: &ToolCall, output: &ToolOutput) -> Message {
    use embla_model::ToolContentPart;
    use embla_tools::ToolOutputPart;

    if output.has_images() {
        let parts: Vec<ToolContentPart> = output
            .parts
            .iter()
            .map(|p| match p {
                ToolOutputPart::Text(t) => ToolContentPart::Text { text: t.clone() },
                ToolOutputPart::Image(url) => ToolContentPart::Image { image_url: url.clone() },
            })
            .collect();
        Message::tool_result_with_parts(&call.id, parts)
    } else {
        Message::tool_result(&call.id, &output.content)
    }
}

/// Best-effort event emission: a full or closed channel never fails a run.
async fn emit(tx: &Option<mpsc::Sender<AgentEvent>>, ev: AgentEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(ev).await;
    }
}
