//! Ordered turn history with tool call/result bookkeeping.
//!
//! Every `ToolCall` id is unique, every `ToolResult` answers exactly one
//! earlier `ToolCall`, and no model request may be built while a call is
//! still unanswered.

use nanocode_core::{ChatMessage, ErrorKind, LlmToolCall, ToolOutcome, ToolStatus, Turn};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Text the model sees in place of an internal fault.
pub const HIDDEN_ERROR_MESSAGE: &str =
    "the tool failed unexpectedly; try a different approach or ask the user";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("tool call id '{0}' is already in use")]
    DuplicateCallId(String),
    #[error("tool result references unknown call id '{0}'")]
    UnknownCallId(String),
    #[error("tool call '{0}' already has a result")]
    DuplicateResult(String),
    #[error("tool calls without results: {}", .0.join(", "))]
    PendingToolCalls(Vec<String>),
}

#[derive(Debug, Default, Clone)]
pub struct ConversationState {
    turns: Vec<Turn>,
    call_ids: HashSet<String>,
    /// Calls awaiting a result, in the order they were appended.
    open_calls: Vec<String>,
    next_call_seq: u64,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn open_calls(&self) -> &[String] {
        &self.open_calls
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn push_user(&mut self, content: &str) -> Result<&Turn, ConversationError> {
        self.ensure_no_open_calls()?;
        Ok(self.push(Turn::UserText {
            content: content.to_string(),
        }))
    }

    pub fn push_assistant(&mut self, content: &str) -> Result<&Turn, ConversationError> {
        self.ensure_no_open_calls()?;
        Ok(self.push(Turn::AssistantText {
            content: content.to_string(),
        }))
    }

    pub fn push_tool_call(
        &mut self,
        id: &str,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<&Turn, ConversationError> {
        if !self.call_ids.insert(id.to_string()) {
            return Err(ConversationError::DuplicateCallId(id.to_string()));
        }
        self.open_calls.push(id.to_string());
        Ok(self.push(Turn::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }))
    }

    /// Records the outcome for `call_id`. Internal faults are kept in the
    /// history but hidden from the model.
    pub fn push_tool_result(
        &mut self,
        call_id: &str,
        outcome: &ToolOutcome,
    ) -> Result<&Turn, ConversationError> {
        let Some(pos) = self.open_calls.iter().position(|id| id == call_id) else {
            if self.call_ids.contains(call_id) {
                return Err(ConversationError::DuplicateResult(call_id.to_string()));
            }
            return Err(ConversationError::UnknownCallId(call_id.to_string()));
        };
        self.open_calls.remove(pos);
        Ok(self.push(Turn::ToolResult {
            call_id: call_id.to_string(),
            status: outcome.status,
            content: outcome.content.clone(),
            is_error_visible_to_model: outcome.error_kind != Some(ErrorKind::Internal),
        }))
    }

    /// Picks an id for a new call: the provider's id when it is free,
    /// otherwise the next `call_N`.
    pub fn allocate_call_id(&mut self, preferred: Option<&str>) -> String {
        if let Some(id) = preferred.map(str::trim).filter(|id| !id.is_empty())
            && !self.call_ids.contains(id)
        {
            return id.to_string();
        }
        loop {
            self.next_call_seq += 1;
            let id = format!("call_{}", self.next_call_seq);
            if !self.call_ids.contains(&id) {
                return id;
            }
        }
    }

    pub fn ensure_no_open_calls(&self) -> Result<(), ConversationError> {
        if self.open_calls.is_empty() {
            Ok(())
        } else {
            Err(ConversationError::PendingToolCalls(self.open_calls.clone()))
        }
    }

    /// Renders the history as chat messages. An assistant text turn and every
    /// call of the batch that follows it form one assistant message; the
    /// results come after it in call order.
    pub fn to_messages(&self, system_prompt: &str) -> Result<Vec<ChatMessage>, ConversationError> {
        self.ensure_no_open_calls()?;
        let mut messages = vec![ChatMessage::System {
            content: system_prompt.to_string(),
        }];
        let mut batch_owner: Option<usize> = None;
        for turn in &self.turns {
            match turn {
                Turn::UserText { content } => {
                    batch_owner = None;
                    messages.push(ChatMessage::User {
                        content: content.clone(),
                    });
                }
                Turn::AssistantText { content } => {
                    batch_owner = Some(messages.len());
                    messages.push(ChatMessage::Assistant {
                        content: Some(content.clone()),
                        tool_calls: Vec::new(),
                    });
                }
                Turn::ToolCall {
                    id,
                    name,
                    arguments,
                } => {
                    let call = LlmToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: Value::Object(arguments.clone()).to_string(),
                    };
                    match batch_owner.and_then(|idx| messages.get_mut(idx)) {
                        Some(ChatMessage::Assistant { tool_calls, .. }) => tool_calls.push(call),
                        _ => {
                            batch_owner = Some(messages.len());
                            messages.push(ChatMessage::Assistant {
                                content: None,
                                tool_calls: vec![call],
                            });
                        }
                    }
                }
                Turn::ToolResult {
                    call_id,
                    status,
                    content,
                    is_error_visible_to_model,
                } => messages.push(ChatMessage::Tool {
                    tool_call_id: call_id.clone(),
                    content: render_result(*status, content, *is_error_visible_to_model),
                }),
            }
        }
        for message in &mut messages {
            if let ChatMessage::Assistant {
                content,
                tool_calls,
            } = message
                && !tool_calls.is_empty()
                && content.as_deref().is_some_and(str::is_empty)
            {
                *content = None;
            }
        }
        Ok(messages)
    }

    fn push(&mut self, turn: Turn) -> &Turn {
        self.turns.push(turn);
        &self.turns[self.turns.len() - 1]
    }
}

fn render_result(status: ToolStatus, content: &str, visible: bool) -> String {
    match (status, visible) {
        (ToolStatus::Ok, _) => content.to_string(),
        (ToolStatus::Error, true) => format!("error: {content}"),
        (ToolStatus::Error, false) => format!("error: {HIDDEN_ERROR_MESSAGE}"),
    }
}
