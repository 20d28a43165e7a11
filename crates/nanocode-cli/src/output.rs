use anyhow::Result;
use crossterm::style::Stylize;
use nanocode_agent::LoopEvent;
use nanocode_core::{AppConfig, ToolStatus};
use serde::Serialize;
use serde_json::json;
use std::io::IsTerminal;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn redact_config_for_display(cfg: &AppConfig) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(cfg)?;
    if let Some(llm) = value.get_mut("llm").and_then(|entry| entry.as_object_mut())
        && llm.get("api_key").is_some_and(|key| !key.is_null())
    {
        llm.insert("api_key".to_string(), json!("***REDACTED***"));
    }
    Ok(value)
}

/// Applies terminal colors only when writing to a terminal.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Painter {
    color: bool,
}

impl Painter {
    pub fn stdout() -> Self {
        Self {
            color: std::io::stdout().is_terminal(),
        }
    }

    pub fn stderr() -> Self {
        Self {
            color: std::io::stderr().is_terminal(),
        }
    }

    #[cfg(test)]
    pub fn plain() -> Self {
        Self { color: false }
    }

    pub fn dim(self, text: &str) -> String {
        self.paint(text, |s| s.dark_grey().to_string())
    }

    pub fn accent(self, text: &str) -> String {
        self.paint(text, |s| s.cyan().bold().to_string())
    }

    pub fn error(self, text: &str) -> String {
        self.paint(text, |s| s.red().to_string())
    }

    /// Bold for `**text**` and highlighted `code` spans; other markup passes
    /// through untouched.
    pub fn inline_markdown(self, text: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len() + 32);
        let mut i = 0;
        while i < chars.len() {
            if chars[i..].starts_with(&['*', '*'])
                && let Some(end) = find_closing(&chars, i + 2, &['*', '*'])
                && end > i + 2
            {
                let inner: String = chars[i + 2..end].iter().collect();
                out.push_str(&inner.as_str().bold().to_string());
                i = end + 2;
                continue;
            }
            if chars[i] == '`'
                && let Some(end) = find_closing(&chars, i + 1, &['`'])
            {
                let inner: String = chars[i + 1..end].iter().collect();
                out.push_str(&inner.as_str().yellow().to_string());
                i = end + 1;
                continue;
            }
            out.push(chars[i]);
            i += 1;
        }
        out
    }

    fn paint(self, text: &str, style: impl Fn(&str) -> String) -> String {
        if self.color { style(text) } else { text.to_string() }
    }
}

fn find_closing(chars: &[char], start: usize, delim: &[char]) -> Option<usize> {
    if chars.len() < start + delim.len() {
        return None;
    }
    (start..=chars.len() - delim.len()).find(|&i| chars[i..i + delim.len()] == *delim)
}

/// One display line per event, or `None` for events that are not shown.
pub(crate) fn render_event(event: &LoopEvent, painter: Painter) -> Option<String> {
    match event {
        LoopEvent::AssistantText(text) => Some(format!(
            "{} {}",
            painter.accent("⏺"),
            painter.inline_markdown(text)
        )),
        LoopEvent::ToolStarted {
            name, args_summary, ..
        } => Some(format!(
            "{} {}",
            painter.accent(&format!("● {name}")),
            painter.dim(&format!("({args_summary})"))
        )),
        LoopEvent::ToolFinished { record, preview } => {
            let timing = format!("{}ms", record.duration_ms);
            let body = match (record.status, record.error_kind) {
                (ToolStatus::Ok, _) => painter.dim(preview),
                (ToolStatus::Error, Some(kind)) => {
                    painter.error(&format!("{} error: {preview}", kind.as_str()))
                }
                (ToolStatus::Error, None) => painter.error(&format!("error: {preview}")),
            };
            Some(format!("  ⎿ {body} {}", painter.dim(&timing)))
        }
        LoopEvent::StateChanged { .. } | LoopEvent::ModelRequestFailed(_) => None,
    }
}

pub(crate) const HELP_TEXT: &str = "Commands:
  /c, /clear     clear the conversation
  /q, /quit      quit (also: exit)
  /help          show this help
Ctrl-C interrupts a running turn; press it twice at the prompt to quit.";

#[cfg(test)]
mod tests {
    use super::*;
    use nanocode_agent::ToolCallRecord;
    use nanocode_core::ErrorKind;

    fn record(status: ToolStatus, error_kind: Option<ErrorKind>) -> ToolCallRecord {
        ToolCallRecord {
            call_id: "call_1".to_string(),
            tool_name: "bash".to_string(),
            args_summary: "command=\"ls\"".to_string(),
            status,
            error_kind,
            duration_ms: 12,
        }
    }

    #[test]
    fn redacts_only_present_keys() {
        let mut cfg = AppConfig::default();
        let shown = redact_config_for_display(&cfg).expect("redact");
        assert!(shown["llm"]["api_key"].is_null());

        cfg.llm.api_key = Some("sk-live-123".to_string());
        let shown = redact_config_for_display(&cfg).expect("redact");
        assert_eq!(shown["llm"]["api_key"], "***REDACTED***");
        assert!(!shown.to_string().contains("sk-live-123"));
    }

    #[test]
    fn renders_tool_lines_without_color() {
        let painter = Painter::plain();
        let started = LoopEvent::ToolStarted {
            call_id: "call_1".to_string(),
            name: "bash".to_string(),
            args_summary: "command=\"ls\"".to_string(),
        };
        assert_eq!(
            render_event(&started, painter).as_deref(),
            Some("● bash (command=\"ls\")")
        );

        let ok = LoopEvent::ToolFinished {
            record: record(ToolStatus::Ok, None),
            preview: "a.txt (+2 lines)".to_string(),
        };
        assert_eq!(
            render_event(&ok, painter).as_deref(),
            Some("  ⎿ a.txt (+2 lines) 12ms")
        );

        let failed = LoopEvent::ToolFinished {
            record: record(ToolStatus::Error, Some(ErrorKind::Timeout)),
            preview: "command timed out after 1s".to_string(),
        };
        assert_eq!(
            render_event(&failed, painter).as_deref(),
            Some("  ⎿ timeout error: command timed out after 1s 12ms")
        );
    }

    #[test]
    fn assistant_text_renders_bold_and_code_spans() {
        let event = LoopEvent::AssistantText("Run **all** tests with `cargo test`".to_string());
        assert_eq!(
            render_event(&event, Painter::plain()).as_deref(),
            Some("⏺ Run **all** tests with `cargo test`")
        );

        let colored = Painter { color: true }.inline_markdown("a **b** `c` **unclosed");
        assert!(colored.contains("\u{1b}[1mb"), "{colored:?}");
        assert!(colored.contains("\u{1b}[38;5;11mc") || colored.contains("\u{1b}[33mc"), "{colored:?}");
        assert!(colored.ends_with("**unclosed"));
        assert!(!colored.contains("`"));
    }

    #[test]
    fn state_changes_are_not_rendered() {
        let event = LoopEvent::StateChanged {
            from: nanocode_core::LoopState::AwaitingUserInput,
            to: nanocode_core::LoopState::RequestingModel,
        };
        assert!(render_event(&event, Painter::plain()).is_none());
    }
}
