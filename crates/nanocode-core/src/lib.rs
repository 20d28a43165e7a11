use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

pub type Result<T> = anyhow::Result<T>;

pub const DEFAULT_API_BASE: &str = "http://localhost:8080/v1";

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".nanocode")
}

// ── Tools ──────────────────────────────────────────────────────────────

/// Closed set of built-in tools. Unknown names never make it past parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolName {
    Read,
    Write,
    Edit,
    Glob,
    Grep,
    Bash,
}

impl ToolName {
    pub const ALL: [ToolName; 6] = [
        Self::Read,
        Self::Write,
        Self::Edit,
        Self::Glob,
        Self::Grep,
        Self::Bash,
    ];

    #[must_use]
    pub fn from_api_name(s: &str) -> Option<Self> {
        Some(match s {
            "read" => Self::Read,
            "write" => Self::Write,
            "edit" => Self::Edit,
            "glob" => Self::Glob,
            "grep" => Self::Grep,
            "bash" => Self::Bash,
            _ => return None,
        })
    }

    #[must_use]
    pub fn as_api_name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Edit => "edit",
            Self::Glob => "glob",
            Self::Grep => "grep",
            Self::Bash => "bash",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_api_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
}

/// Classification of a failed tool call. Every variant is recoverable: the
/// model sees the error text and may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parse,
    InvalidArgument,
    Environment,
    Timeout,
    Interrupted,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::InvalidArgument => "invalid_argument",
            Self::Environment => "environment",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub status: ToolStatus,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ToolOutcome {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Ok,
            content: content.into(),
            error_kind: None,
        }
    }

    pub fn error(kind: ErrorKind, content: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Error,
            content: content.into(),
            error_kind: Some(kind),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }
}

/// A tool invocation extracted from one model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedToolCall {
    pub name: String,
    pub arguments: Map<String, Value>,
    /// Byte range of the encoding in the model text. Native calls have no
    /// textual encoding and use `(0, 0)`.
    pub raw_span: (usize, usize),
    /// Provider-assigned id for native function calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Set when the call could not be decoded or names an unknown tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl ParsedToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>, raw_span: (usize, usize)) -> Self {
        Self {
            name: name.into(),
            arguments,
            raw_span,
            id: None,
            parse_error: None,
        }
    }

    pub fn malformed(name: impl Into<String>, raw_span: (usize, usize), error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: Map::new(),
            raw_span,
            id: None,
            parse_error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn tool_name(&self) -> Option<ToolName> {
        ToolName::from_api_name(&self.name)
    }
}

/// Executes parsed tool calls. Implementations must convert every failure,
/// including panics, into an error outcome.
pub trait ToolHost {
    fn definitions(&self) -> Vec<ToolDefinition>;
    fn execute(&self, call: &ParsedToolCall) -> ToolOutcome;
}

// ── Conversation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Turn {
    UserText {
        content: String,
    },
    AssistantText {
        content: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Map<String, Value>,
    },
    ToolResult {
        call_id: String,
        status: ToolStatus,
        content: String,
        is_error_visible_to_model: bool,
    },
}

impl Turn {
    pub fn label(&self) -> &'static str {
        match self {
            Self::UserText { .. } => "user_text",
            Self::AssistantText { .. } => "assistant_text",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    AwaitingUserInput,
    RequestingModel,
    ExecutingTools,
    Terminated,
}

pub fn is_valid_loop_transition(from: LoopState, to: LoopState) -> bool {
    match from {
        LoopState::AwaitingUserInput => {
            matches!(to, LoopState::RequestingModel | LoopState::Terminated)
        }
        LoopState::RequestingModel => matches!(
            to,
            LoopState::ExecutingTools | LoopState::AwaitingUserInput | LoopState::Terminated
        ),
        LoopState::ExecutingTools => matches!(
            to,
            LoopState::RequestingModel | LoopState::AwaitingUserInput | LoopState::Terminated
        ),
        LoopState::Terminated => false,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub session_id: Uuid,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    TurnAppendedV1 {
        index: usize,
        turn: Turn,
    },
    ToolFinishedV1 {
        call_id: String,
        tool: String,
        status: ToolStatus,
        error_kind: Option<ErrorKind>,
        duration_ms: u64,
    },
    ModelRequestFailedV1 {
        error: String,
    },
    LoopStateChangedV1 {
        from: LoopState,
        to: LoopState,
    },
}

// ── Chat wire types (OpenAI-compatible function calling) ───────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded argument object, as sent over the wire.
    pub arguments: String,
}

fn default_finish_reason() -> String {
    "stop".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    #[serde(default = "default_finish_reason")]
    pub finish_reason: String,
    #[serde(default)]
    pub tool_calls: Vec<LlmToolCall>,
    /// Unmodified response body.
    #[serde(default)]
    pub raw: String,
}

impl LlmResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: default_finish_reason(),
            tool_calls: Vec::new(),
            raw: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role")]
pub enum ChatMessage {
    #[serde(rename = "system")]
    System { content: String },
    #[serde(rename = "user")]
    User { content: String },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        tool_calls: Vec<LlmToolCall>,
    },
    #[serde(rename = "tool")]
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

// ── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown tool call parser '{0}' (expected native, glm or json_fence)")]
    UnknownParser(String),
}

/// Grammar used to pull tool calls out of model output. Fixed for the
/// lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParserMode {
    #[default]
    Native,
    Glm,
    JsonFence,
}

impl ParserMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Glm => "glm",
            Self::JsonFence => "json_fence",
        }
    }
}

impl FromStr for ParserMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "native" | "none" | "openai" => Ok(Self::Native),
            "glm" | "glm4" | "glm-4" | "glm45" | "glm-4.5" => Ok(Self::Glm),
            "json" | "json_fence" | "json-fence" | "fence" => Ok(Self::JsonFence),
            other => Err(ConfigError::UnknownParser(other.to_string())),
        }
    }
}

impl fmt::Display for ParserMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    /// Environment variable consulted for the key at startup.
    pub api_key_env: String,
    pub model: Option<String>,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub max_retries: u8,
    pub retry_base_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            api_key_env: "API_KEY".to_string(),
            model: None,
            max_tokens: 8192,
            timeout_seconds: 120,
            max_retries: 3,
            retry_base_ms: 400,
        }
    }
}

impl LlmConfig {
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub parser: ParserMode,
    /// Upper bound on model requests per user message.
    pub max_model_requests: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            parser: ParserMode::Native,
            max_model_requests: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub bash_timeout_seconds: u64,
    pub max_output_chars: usize,
    pub grep_max_results: usize,
    pub glob_max_results: usize,
    pub respect_gitignore: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bash_timeout_seconds: 30,
            max_output_chars: 30_000,
            grep_max_results: 50,
            glob_max_results: 200,
            respect_gitignore: true,
        }
    }
}

impl AppConfig {
    pub fn user_settings_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".nanocode/settings.json"))
    }

    pub fn project_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.json")
    }

    pub fn project_local_settings_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("settings.local.json")
    }

    pub fn toml_path(workspace: &Path) -> PathBuf {
        runtime_dir(workspace).join("config.toml")
    }

    /// Loads every config layer and then applies process environment
    /// overrides.
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut cfg = Self::load_files(workspace, Self::user_settings_path())?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn load_files(workspace: &Path, user_settings: Option<PathBuf>) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        let toml_path = Self::toml_path(workspace);
        if toml_path.exists() {
            let raw = fs::read_to_string(&toml_path)?;
            let layer: toml::Table = toml::from_str(&raw)
                .map_err(|err| anyhow::anyhow!("{}: {err}", toml_path.display()))?;
            merge_json_value(&mut merged, &serde_json::to_value(layer)?);
        }

        let mut paths = Vec::new();
        if let Some(user) = user_settings {
            paths.push(user);
        }
        paths.push(Self::project_settings_path(workspace));
        paths.push(Self::project_local_settings_path(workspace));

        for path in paths {
            if !path.exists() {
                continue;
            }
            let raw = fs::read_to_string(&path)?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|err| anyhow::anyhow!("{}: {err}", path.display()))?;
            merge_json_value(&mut merged, &value);
        }

        Ok(serde_json::from_value(merged)?)
    }

    /// `API_BASE`, `MODEL`, `TOOL_CALL_PARSER` and the configured key variable.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        if let Some(base) = non_empty("API_BASE") {
            self.llm.api_base = base;
        }
        if let Some(key) = non_empty(&self.llm.api_key_env) {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = non_empty("MODEL") {
            self.llm.model = Some(model);
        }
        if let Some(parser) = non_empty("TOOL_CALL_PARSER") {
            self.agent.parser = parser.parse()?;
        }
        self.llm.api_base = self.llm.api_base.trim_end_matches('/').to_string();
        Ok(())
    }
}

fn merge_json_value(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_obj), Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                if let Some(base_value) = base_obj.get_mut(key) {
                    merge_json_value(base_value, overlay_value);
                } else {
                    base_obj.insert(key.clone(), overlay_value.clone());
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}
