//! Helpers for driving the agent loop without a model endpoint.

use anyhow::{Result, anyhow};
use nanocode_core::{ChatRequest, LlmResponse, LlmToolCall};
use nanocode_llm::ModelClient;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tempfile::TempDir;

enum Scripted {
    Reply(LlmResponse),
    Fail(String),
}

/// A `ModelClient` that replays canned responses in order and records every
/// request it receives. Running past the end of the script is an error.
#[derive(Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Scripted::Reply).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queues a plain text reply.
    #[must_use]
    pub fn then_text(self, text: &str) -> Self {
        self.push(Scripted::Reply(LlmResponse::text(text)))
    }

    #[must_use]
    pub fn then_response(self, response: LlmResponse) -> Self {
        self.push(Scripted::Reply(response))
    }

    /// Queues a transport failure.
    #[must_use]
    pub fn then_error(self, message: &str) -> Self {
        self.push(Scripted::Fail(message.to_string()))
    }

    fn push(self, item: Scripted) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(item);
        }
        self
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or_default()
    }
}

impl ModelClient for ScriptedModel {
    fn complete(&self, req: &ChatRequest) -> Result<LlmResponse> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("scripted model lock poisoned"))?
            .push(req.clone());
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("scripted model lock poisoned"))?
            .pop_front();
        match next {
            Some(Scripted::Reply(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted model has no more responses")),
        }
    }
}

/// A response carrying provider-native function calls.
pub fn native_calls_response(text: &str, calls: &[(&str, &str, Value)]) -> LlmResponse {
    LlmResponse {
        text: text.to_string(),
        finish_reason: "tool_calls".to_string(),
        tool_calls: calls
            .iter()
            .map(|(id, name, args)| LlmToolCall {
                id: (*id).to_string(),
                name: (*name).to_string(),
                arguments: args.to_string(),
            })
            .collect(),
        raw: String::new(),
    }
}

/// Renders one call in the GLM tagged-block grammar.
pub fn glm_call(name: &str, args: &[(&str, &str)]) -> String {
    let mut out = format!("<tool_call>{name}\n");
    for (key, value) in args {
        out.push_str(&format!("<arg_key>{key}</arg_key>\n<arg_value>{value}</arg_value>\n"));
    }
    out.push_str("</tool_call>");
    out
}

/// Renders one call as a fenced `tool_call` JSON block.
pub fn json_fence_call(name: &str, args: &Value) -> String {
    let body = serde_json::json!({ "name": name, "arguments": args });
    format!("```tool_call\n{body}\n```")
}

/// Creates a temporary workspace populated with `files` (relative path, content).
pub fn temp_workspace(files: &[(&str, &str)]) -> Result<TempDir> {
    let dir = TempDir::new()?;
    for (rel, content) in files {
        write_file(dir.path(), rel, content)?;
    }
    Ok(dir)
}

fn write_file(root: &Path, rel: &str, content: &str) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}
