//! The agent loop: user text → model → tool calls → results → model, until
//! the model answers without calling a tool.
//!
//! States follow [`LoopState`]. A `submit` always leaves the loop in
//! `AwaitingUserInput` (or `Terminated`), and never with a tool call that
//! has no result.

use chrono::Utc;
use nanocode_core::{
    AppConfig, ChatRequest, ErrorKind, EventEnvelope, EventKind, LlmResponse, LoopState,
    ParsedToolCall, ParserMode, ToolHost, ToolOutcome, ToolStatus, Turn,
    is_valid_loop_transition,
};
use nanocode_llm::ModelClient;
use nanocode_observe::Observer;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::conversation::{ConversationError, ConversationState};
use crate::parser::{ToolCallParser, parse_native_calls};
use crate::prompts::build_system_prompt;

/// Default maximum model requests per submitted message.
pub const DEFAULT_MAX_MODEL_REQUESTS: u32 = 50;

const PREVIEW_CHARS: usize = 100;
/// How often a pending model request checks the interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("model request failed: {0}")]
    Transport(String),
    #[error("interrupted")]
    Interrupted,
    #[error("session has been terminated")]
    Terminated,
    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

/// Record of a single tool call made during a submit.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    pub args_summary: String,
    pub status: ToolStatus,
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
}

/// Result of one `submit`.
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    /// Text of the last assistant turn.
    pub final_text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub model_requests: u32,
    /// The request cap stopped the loop before the model finished.
    pub hit_request_limit: bool,
}

#[derive(Debug, Clone)]
pub enum LoopEvent {
    StateChanged { from: LoopState, to: LoopState },
    AssistantText(String),
    ToolStarted {
        call_id: String,
        name: String,
        args_summary: String,
    },
    ToolFinished {
        record: ToolCallRecord,
        /// First line of the result.
        preview: String,
    },
    ModelRequestFailed(String),
}

enum ModelReply {
    Response(LlmResponse),
    Failed(String),
    Interrupted,
}

/// Callback for loop events (rendering, logging).
pub type EventCallback = Box<dyn FnMut(&LoopEvent) + Send>;

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub parser: ParserMode,
    pub max_model_requests: u32,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            parser: ParserMode::Native,
            max_model_requests: DEFAULT_MAX_MODEL_REQUESTS,
            model: None,
            max_tokens: 8192,
            system_prompt: "Concise coding assistant.".to_string(),
        }
    }
}

impl LoopConfig {
    pub fn from_app_config(cfg: &AppConfig, workspace: &Path) -> Self {
        Self {
            parser: cfg.agent.parser,
            max_model_requests: cfg.agent.max_model_requests.max(1),
            model: cfg.llm.model.clone(),
            max_tokens: cfg.llm.max_tokens,
            system_prompt: build_system_prompt(workspace, cfg.agent.parser),
        }
    }
}

pub struct AgentLoop {
    model: Arc<dyn ModelClient + Send + Sync>,
    tools: Arc<dyn ToolHost + Send + Sync>,
    cfg: LoopConfig,
    conversation: ConversationState,
    state: LoopState,
    interrupt: Arc<AtomicBool>,
    observer: Option<Observer>,
    on_event: Option<EventCallback>,
    session_id: Uuid,
    seq_no: u64,
}

impl AgentLoop {
    pub fn new(
        model: Arc<dyn ModelClient + Send + Sync>,
        tools: Arc<dyn ToolHost + Send + Sync>,
        cfg: LoopConfig,
    ) -> Self {
        Self {
            model,
            tools,
            cfg,
            conversation: ConversationState::new(),
            state: LoopState::AwaitingUserInput,
            interrupt: Arc::new(AtomicBool::new(false)),
            observer: None,
            on_event: None,
            session_id: Uuid::now_v7(),
            seq_no: 0,
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Shares the interrupt flag, typically with the SIGINT handler and the
    /// tool host.
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn set_event_callback(&mut self, cb: EventCallback) {
        self.on_event = Some(cb);
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn turns(&self) -> &[Turn] {
        self.conversation.turns()
    }

    /// Clears the conversation. The session stays usable.
    pub fn reset(&mut self) {
        self.conversation.clear();
        self.log_verbose("conversation cleared");
    }

    pub fn terminate(&mut self) {
        if self.state != LoopState::Terminated {
            self.transition(LoopState::Terminated);
        }
    }

    /// Appends `text` as a user turn and runs the loop until the model
    /// replies without tool calls.
    pub fn submit(&mut self, text: &str) -> Result<TurnReport, AgentError> {
        if self.state == LoopState::Terminated {
            return Err(AgentError::Terminated);
        }
        self.interrupt.store(false, Ordering::SeqCst);
        self.conversation.push_user(text)?;
        self.record_last_turn();
        self.transition(LoopState::RequestingModel);

        let mut report = TurnReport::default();
        loop {
            if self.interrupted() {
                self.transition(LoopState::AwaitingUserInput);
                return Err(AgentError::Interrupted);
            }
            if report.model_requests >= self.cfg.max_model_requests {
                self.warn(&format!(
                    "stopping after {} model requests without a final answer",
                    report.model_requests
                ));
                report.hit_request_limit = true;
                self.transition(LoopState::AwaitingUserInput);
                return Ok(report);
            }

            let request = self.build_request()?;
            report.model_requests += 1;
            self.log_verbose(&format!(
                "model request {} ({} messages)",
                report.model_requests,
                request.messages.len()
            ));
            let response = match self.request_model(request) {
                ModelReply::Response(response) if !self.interrupted() => response,
                ModelReply::Response(_) | ModelReply::Interrupted => {
                    self.log_verbose("model request abandoned after interrupt");
                    self.transition(LoopState::AwaitingUserInput);
                    return Err(AgentError::Interrupted);
                }
                ModelReply::Failed(msg) => {
                    self.emit(&LoopEvent::ModelRequestFailed(msg.clone()));
                    self.record(EventKind::ModelRequestFailedV1 { error: msg.clone() });
                    self.transition(LoopState::AwaitingUserInput);
                    return Err(AgentError::Transport(msg));
                }
            };

            let parsed = self.cfg.parser.parse(&response.text);
            let calls = if response.tool_calls.is_empty() {
                parsed.calls
            } else {
                parse_native_calls(&response.tool_calls)
            };
            self.conversation.push_assistant(&parsed.plain_text)?;
            self.record_last_turn();
            if !parsed.plain_text.is_empty() {
                self.emit(&LoopEvent::AssistantText(parsed.plain_text.clone()));
            }

            if calls.is_empty() {
                report.final_text = parsed.plain_text;
                self.transition(LoopState::AwaitingUserInput);
                return Ok(report);
            }

            self.transition(LoopState::ExecutingTools);
            let interrupted = self.execute_batch(calls, &mut report)?;
            if interrupted {
                self.transition(LoopState::AwaitingUserInput);
                return Err(AgentError::Interrupted);
            }
            self.transition(LoopState::RequestingModel);
        }
    }

    /// Runs the batch in order. Returns whether the user interrupted it; the
    /// calls after that point are answered with an `Interrupted` error.
    fn execute_batch(
        &mut self,
        calls: Vec<ParsedToolCall>,
        report: &mut TurnReport,
    ) -> Result<bool, AgentError> {
        let mut interrupted = false;
        for call in calls {
            let call_id = self.conversation.allocate_call_id(call.id.as_deref());
            self.conversation
                .push_tool_call(&call_id, &call.name, call.arguments.clone())?;
            self.record_last_turn();

            let args_summary = summarize_args(&call.arguments);
            self.emit(&LoopEvent::ToolStarted {
                call_id: call_id.clone(),
                name: call.name.clone(),
                args_summary: args_summary.clone(),
            });

            interrupted = interrupted || self.interrupted();
            let started = Instant::now();
            let outcome = if interrupted {
                ToolOutcome::error(ErrorKind::Interrupted, "not run: interrupted by user")
            } else {
                self.tools.execute(&call)
            };
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            if outcome.error_kind == Some(ErrorKind::Interrupted) {
                interrupted = true;
            }
            if outcome.error_kind == Some(ErrorKind::Internal) {
                self.warn(&format!("{} failed internally: {}", call.name, outcome.content));
            }

            self.conversation.push_tool_result(&call_id, &outcome)?;
            self.record_last_turn();

            let record = ToolCallRecord {
                call_id: call_id.clone(),
                tool_name: call.name.clone(),
                args_summary,
                status: outcome.status,
                error_kind: outcome.error_kind,
                duration_ms,
            };
            self.record(EventKind::ToolFinishedV1 {
                call_id,
                tool: call.name.clone(),
                status: outcome.status,
                error_kind: outcome.error_kind,
                duration_ms,
            });
            self.emit(&LoopEvent::ToolFinished {
                record: record.clone(),
                preview: first_line_preview(&outcome.content),
            });
            report.tool_calls.push(record);
        }
        Ok(interrupted)
    }

    /// Runs the request on a worker thread so an interrupt can abandon it.
    /// An abandoned request finishes in the background and its reply is
    /// dropped.
    fn request_model(&self, request: ChatRequest) -> ModelReply {
        let (tx, rx) = mpsc::channel();
        let model = Arc::clone(&self.model);
        thread::spawn(move || {
            let _ = tx.send(model.complete(&request));
        });
        loop {
            match rx.recv_timeout(INTERRUPT_POLL) {
                Ok(Ok(response)) => return ModelReply::Response(response),
                Ok(Err(err)) => return ModelReply::Failed(format!("{err:#}")),
                Err(RecvTimeoutError::Timeout) => {
                    if self.interrupted() {
                        return ModelReply::Interrupted;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return ModelReply::Failed("model request worker exited".to_string());
                }
            }
        }
    }

    fn build_request(&self) -> Result<ChatRequest, AgentError> {
        Ok(ChatRequest {
            model: self.cfg.model.clone(),
            messages: self.conversation.to_messages(&self.cfg.system_prompt)?,
            tools: self.tools.definitions(),
            max_tokens: self.cfg.max_tokens,
        })
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn transition(&mut self, to: LoopState) {
        let from = self.state;
        debug_assert!(
            is_valid_loop_transition(from, to),
            "invalid loop transition {from:?} -> {to:?}"
        );
        self.state = to;
        self.emit(&LoopEvent::StateChanged { from, to });
        self.record(EventKind::LoopStateChangedV1 { from, to });
    }

    fn emit(&mut self, event: &LoopEvent) {
        if let Some(cb) = self.on_event.as_mut() {
            cb(event);
        }
    }

    fn record_last_turn(&mut self) {
        let index = self.conversation.len().saturating_sub(1);
        if let Some(turn) = self.conversation.turns().last().cloned() {
            self.record(EventKind::TurnAppendedV1 { index, turn });
        }
    }

    fn record(&mut self, kind: EventKind) {
        self.seq_no += 1;
        let Some(observer) = &self.observer else {
            return;
        };
        let envelope = EventEnvelope {
            seq_no: self.seq_no,
            at: Utc::now(),
            session_id: self.session_id,
            kind,
        };
        if let Err(err) = observer.record_event(&envelope) {
            observer.warn_log(&format!("failed to write event log: {err}"));
        }
    }

    fn log_verbose(&self, msg: &str) {
        if let Some(observer) = &self.observer {
            observer.verbose_log(msg);
        }
    }

    fn warn(&self, msg: &str) {
        if let Some(observer) = &self.observer {
            observer.warn_log(msg);
        }
    }
}

/// `key="value", key=3` summary of call arguments for display.
pub fn summarize_args(args: &Map<String, Value>) -> String {
    let parts: Vec<String> = args
        .iter()
        .map(|(key, val)| match val {
            Value::String(s) if s.chars().count() > 60 => {
                let head: String = s.chars().take(57).collect();
                format!("{key}=\"{}...\"", head.replace('\n', "\\n"))
            }
            Value::String(s) => format!("{key}=\"{}\"", s.replace('\n', "\\n")),
            Value::Number(n) => format!("{key}={n}"),
            Value::Bool(b) => format!("{key}={b}"),
            _ => format!("{key}=..."),
        })
        .collect();
    if parts.is_empty() {
        return "()".to_string();
    }
    parts.join(", ")
}

fn first_line_preview(content: &str) -> String {
    let mut lines = content.lines();
    let first = lines.next().unwrap_or_default();
    let mut preview: String = first.chars().take(PREVIEW_CHARS).collect();
    if first.chars().count() > PREVIEW_CHARS {
        preview.push_str("...");
    }
    let more = lines.count();
    if more > 0 {
        preview.push_str(&format!(" (+{more} lines)"));
    }
    preview
}
