mod fs;
pub mod registry;
mod search;
pub mod shell;
pub mod validation;

pub use registry::{ToolSpec, lookup, tool_definitions};
pub use shell::{PlatformShellRunner, ShellRunResult, ShellRunner};
pub use validation::validate_tool_args;

use nanocode_core::{
    ErrorKind, ParsedToolCall, ToolDefinition, ToolHost, ToolName, ToolOutcome, ToolsConfig,
};
use search::SearchOptions;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Receives each line of `bash` output as it is produced.
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Environment(String),
    #[error("command timed out after {seconds}s")]
    Timeout { seconds: u64, output: String },
    #[error("interrupted by user")]
    Interrupted { output: String },
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Environment(_) => ErrorKind::Environment,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Interrupted { .. } => ErrorKind::Interrupted,
        }
    }

    /// Text shown to the model; partial command output is kept.
    fn render(&self) -> String {
        match self {
            Self::Timeout { output, .. } | Self::Interrupted { output } => {
                format!("{output}\n({self})")
            }
            _ => self.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ReadArgs {
    path: String,
    offset: Option<i64>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct WriteArgs {
    path: String,
    content: String,
}

#[derive(Deserialize)]
struct EditArgs {
    path: String,
    old_string: String,
    new_string: String,
}

#[derive(Deserialize)]
struct GlobArgs {
    pattern: String,
    path: Option<String>,
}

#[derive(Deserialize)]
struct GrepArgs {
    pattern: String,
    path: Option<String>,
    include: Option<String>,
}

#[derive(Deserialize)]
struct BashArgs {
    command: String,
    timeout: Option<u64>,
}

/// Executes the built-in tools against a workspace directory.
pub struct LocalToolHost {
    workspace: PathBuf,
    cfg: ToolsConfig,
    runner: Arc<dyn ShellRunner + Send + Sync>,
    interrupt: Arc<AtomicBool>,
    output_sink: Option<OutputSink>,
}

impl LocalToolHost {
    pub fn new(workspace: &Path, cfg: ToolsConfig) -> Self {
        Self::with_runner(workspace, cfg, Arc::new(PlatformShellRunner))
    }

    pub fn with_runner(
        workspace: &Path,
        cfg: ToolsConfig,
        runner: Arc<dyn ShellRunner + Send + Sync>,
    ) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            cfg,
            runner,
            interrupt: Arc::new(AtomicBool::new(false)),
            output_sink: None,
        }
    }

    /// Shares the flag that aborts a running `bash` command.
    #[must_use]
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    #[must_use]
    pub fn with_output_sink(mut self, sink: OutputSink) -> Self {
        self.output_sink = Some(sink);
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Runs one tool with arguments that already passed validation.
    pub fn run_tool(&self, tool: ToolName, args: Map<String, Value>) -> Result<String, ToolError> {
        match tool {
            ToolName::Read => {
                let args: ReadArgs = decode(args)?;
                fs::read_file(&self.resolve(&args.path), &args.path, args.offset, args.limit)
            }
            ToolName::Write => {
                let args: WriteArgs = decode(args)?;
                fs::write_file(&self.resolve(&args.path), &args.path, &args.content)
            }
            ToolName::Edit => {
                let args: EditArgs = decode(args)?;
                fs::edit_file(
                    &self.resolve(&args.path),
                    &args.path,
                    &args.old_string,
                    &args.new_string,
                )
            }
            ToolName::Glob => {
                let args: GlobArgs = decode(args)?;
                let display = args.path.unwrap_or_else(|| ".".to_string());
                let opts = self.search_options(self.cfg.glob_max_results);
                search::glob_paths(&self.resolve(&display), &display, &args.pattern, &opts)
            }
            ToolName::Grep => {
                let args: GrepArgs = decode(args)?;
                let display = args.path.unwrap_or_else(|| ".".to_string());
                let opts = self.search_options(self.cfg.grep_max_results);
                search::grep_files(
                    &self.resolve(&display),
                    &display,
                    &args.pattern,
                    args.include.as_deref().filter(|s| !s.is_empty()),
                    &opts,
                )
            }
            ToolName::Bash => {
                let args: BashArgs = decode(args)?;
                self.run_bash(&args.command, args.timeout)
            }
        }
    }

    fn run_bash(&self, command: &str, timeout: Option<u64>) -> Result<String, ToolError> {
        let seconds = timeout.unwrap_or(self.cfg.bash_timeout_seconds).max(1);
        let mut on_line = |line: &str| {
            if let Some(sink) = &self.output_sink {
                sink(line);
            }
        };
        let result = self
            .runner
            .run(
                command,
                &self.workspace,
                Duration::from_secs(seconds),
                &self.interrupt,
                &mut on_line,
            )
            .map_err(|err| ToolError::Environment(err.to_string()))?;

        let budget = self.cfg.max_output_chars.saturating_sub(200).max(1);
        let trimmed = result.output.trim_end();
        let output = if trimmed.is_empty() {
            "(no output)".to_string()
        } else {
            truncate_output(trimmed, budget)
        };
        if result.timed_out {
            return Err(ToolError::Timeout { seconds, output });
        }
        if result.interrupted {
            return Err(ToolError::Interrupted { output });
        }
        let status = result
            .status
            .map_or_else(|| "killed by signal".to_string(), |code| code.to_string());
        Ok(format!("{output}\n[exit status: {status}]"))
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    fn search_options(&self, max_results: usize) -> SearchOptions {
        SearchOptions {
            respect_gitignore: self.cfg.respect_gitignore,
            max_results: max_results.max(1),
        }
    }
}

impl ToolHost for LocalToolHost {
    fn definitions(&self) -> Vec<ToolDefinition> {
        tool_definitions()
    }

    fn execute(&self, call: &ParsedToolCall) -> ToolOutcome {
        if let Some(err) = &call.parse_error {
            return ToolOutcome::error(ErrorKind::Parse, err.clone());
        }
        let Some(tool) = call.tool_name() else {
            return ToolOutcome::error(
                ErrorKind::Parse,
                format!(
                    "unknown tool '{}' (available: {})",
                    call.name,
                    registry::tool_names().join(", ")
                ),
            );
        };
        let args = match validate_tool_args(tool, &call.arguments) {
            Ok(args) => args,
            Err(msg) => return ToolOutcome::error(ErrorKind::InvalidArgument, msg),
        };

        let max_chars = self.cfg.max_output_chars;
        match panic::catch_unwind(AssertUnwindSafe(|| self.run_tool(tool, args))) {
            Ok(Ok(output)) => ToolOutcome::ok(truncate_output(&output, max_chars)),
            Ok(Err(err)) => ToolOutcome::error(err.kind(), truncate_output(&err.render(), max_chars)),
            Err(payload) => ToolOutcome::error(
                ErrorKind::Internal,
                format!("internal error in {tool}: {}", panic_message(payload.as_ref())),
            ),
        }
    }
}

fn decode<T: DeserializeOwned>(args: Map<String, Value>) -> Result<T, ToolError> {
    serde_json::from_value(Value::Object(args))
        .map_err(|err| ToolError::InvalidArgument(err.to_string()))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Cuts `text` to at most `max_chars` characters on a char boundary and
/// appends a notice with the original size.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(120);
    let boundary = text
        .char_indices()
        .nth(keep)
        .map_or(text.len(), |(idx, _)| idx);
    format!(
        "{}\n\n[output truncated: showing {keep}/{total} chars, narrow the request to see more]",
        &text[..boundary]
    )
}
