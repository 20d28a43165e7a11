//! Extraction of tool calls from model output.
//!
//! Three grammars are supported, selected once per session by
//! [`ParserMode`]:
//!
//! - `Glm`: `<tool_call>NAME<arg_key>K</arg_key><arg_value>V</arg_value></tool_call>`
//! - `JsonFence`: a fenced `tool_call` or `json` block holding
//!   `{"name": ..., "arguments": {...}}` or an array of such objects
//! - `Native`: the provider's structured `tool_calls` field
//!
//! Parsing is pure. A call that cannot be decoded, or that names an unknown
//! tool, is still returned, with `parse_error` set, so the model can be told
//! what went wrong.

use nanocode_core::{LlmToolCall, ParsedToolCall, ParserMode};
use nanocode_tools::registry::{self, ParamType};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

const GLM_OPEN: &str = "<tool_call>";
const GLM_CLOSE: &str = "</tool_call>";
const KEY_OPEN: &str = "<arg_key>";
const KEY_CLOSE: &str = "</arg_key>";
const VALUE_OPEN: &str = "<arg_value>";
const VALUE_CLOSE: &str = "</arg_value>";

static FENCE_OPEN_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"```(tool_call|json)[ \t]*\r?\n"));

/// A line holding nothing but the closing backticks.
static FENCE_CLOSE_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*```[ \t]*\r?$"));

static TOOL_NAME_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$"));

/// Model text with call encodings removed, plus the calls in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutput {
    pub plain_text: String,
    pub calls: Vec<ParsedToolCall>,
}

pub trait ToolCallParser {
    fn parse(&self, text: &str) -> ParseOutput;
}

impl ToolCallParser for ParserMode {
    fn parse(&self, text: &str) -> ParseOutput {
        match self {
            ParserMode::Native => ParseOutput {
                plain_text: text.trim().to_string(),
                calls: Vec::new(),
            },
            ParserMode::Glm => parse_glm(text),
            ParserMode::JsonFence => parse_json_fence(text),
        }
    }
}

/// Converts provider-native function calls. Arguments arrive as a JSON
/// string; an empty string means no arguments.
pub fn parse_native_calls(calls: &[LlmToolCall]) -> Vec<ParsedToolCall> {
    calls
        .iter()
        .map(|call| {
            let raw = call.arguments.trim();
            let parsed = if raw.is_empty() {
                Ok(Map::new())
            } else {
                arguments_from_json_str(raw)
            };
            let parsed = match parsed {
                Ok(arguments) => checked_call(&call.name, arguments, (0, 0)),
                Err(err) => ParsedToolCall::malformed(&call.name, (0, 0), err),
            };
            parsed.with_id(&call.id)
        })
        .collect()
}

fn parse_glm(text: &str) -> ParseOutput {
    let mut calls = Vec::new();
    let mut spans = Vec::new();
    let mut cursor = 0;

    while let Some(found) = text[cursor..].find(GLM_OPEN) {
        let start = cursor + found;
        let body_start = start + GLM_OPEN.len();
        let Some(close) = text[body_start..].find(GLM_CLOSE) else {
            let body = &text[body_start..];
            let name = body.split('<').next().unwrap_or_default().trim();
            calls.push(ParsedToolCall::malformed(
                name,
                (start, text.len()),
                format!("unterminated {GLM_OPEN} block, expected {GLM_CLOSE}"),
            ));
            spans.push((start, text.len()));
            break;
        };
        let body_end = body_start + close;
        let end = body_end + GLM_CLOSE.len();
        calls.push(parse_glm_block(&text[body_start..body_end], (start, end)));
        spans.push((start, end));
        cursor = end;
    }

    ParseOutput {
        plain_text: strip_spans(text, &spans),
        calls,
    }
}

fn parse_glm_block(body: &str, span: (usize, usize)) -> ParsedToolCall {
    let name_end = body.find('<').unwrap_or(body.len());
    let head = body[..name_end].trim();
    let (name, stray) = head
        .split_once(char::is_whitespace)
        .map_or((head, ""), |(name, stray)| (name, stray.trim()));
    if name.is_empty() {
        return ParsedToolCall::malformed(name, span, "tool call is missing a tool name");
    }
    if !stray.is_empty() {
        return ParsedToolCall::malformed(
            name,
            span,
            format!("unexpected text inside tool call: '{stray}'"),
        );
    }
    if !is_valid_tool_name(name) {
        return ParsedToolCall::malformed(name, span, format!("invalid tool name '{name}'"));
    }

    let mut arguments = Map::new();
    let mut rest = &body[name_end..];
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let Some(after_key_open) = rest.strip_prefix(KEY_OPEN) else {
            let stray: String = rest.chars().take(40).collect();
            return ParsedToolCall::malformed(
                name,
                span,
                format!("unexpected text inside tool call: '{stray}'"),
            );
        };
        let Some(key_len) = after_key_open.find(KEY_CLOSE) else {
            return ParsedToolCall::malformed(name, span, format!("missing {KEY_CLOSE}"));
        };
        let key = after_key_open[..key_len].trim();
        if key.is_empty() {
            return ParsedToolCall::malformed(name, span, "empty argument name");
        }
        rest = after_key_open[key_len + KEY_CLOSE.len()..].trim_start();

        let Some(after_value_open) = rest.strip_prefix(VALUE_OPEN) else {
            return ParsedToolCall::malformed(
                name,
                span,
                format!("argument '{key}' has no {VALUE_OPEN}"),
            );
        };
        let Some(value_len) = after_value_open.find(VALUE_CLOSE) else {
            return ParsedToolCall::malformed(name, span, format!("missing {VALUE_CLOSE}"));
        };
        let raw_value = &after_value_open[..value_len];
        rest = &after_value_open[value_len + VALUE_CLOSE.len()..];

        if arguments.contains_key(key) {
            return ParsedToolCall::malformed(name, span, format!("duplicate argument '{key}'"));
        }
        arguments.insert(key.to_string(), decode_glm_value(name, key, raw_value));
    }

    checked_call(name, arguments, span)
}

/// String parameters keep the raw text. Anything else is decoded as JSON
/// when it parses, so `10` becomes a number and `true` a boolean.
fn decode_glm_value(tool: &str, key: &str, raw: &str) -> Value {
    let declared = registry::lookup(tool)
        .and_then(|spec| spec.param(key))
        .map(|param| param.kind);
    if declared == Some(ParamType::String) {
        return Value::String(raw.to_string());
    }
    serde_json::from_str(raw.trim()).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_json_fence(text: &str) -> ParseOutput {
    let mut calls = Vec::new();
    let mut spans = Vec::new();
    let mut cursor = 0;

    if let Ok(open_re) = FENCE_OPEN_RE.as_ref() {
        while let Some(caps) = open_re.captures_at(text, cursor) {
            let (Some(open), Some(lang)) = (caps.get(0), caps.get(1)) else {
                break;
            };
            let start = open.start();
            let strict = lang.as_str() == "tool_call";
            let Some((body_end, end)) = fence_end(text, open.end()) else {
                if strict {
                    calls.push(ParsedToolCall::malformed(
                        guess_name(&text[open.end()..]),
                        (start, text.len()),
                        "unterminated tool_call fence, expected closing ```",
                    ));
                    spans.push((start, text.len()));
                    break;
                }
                cursor = open.end();
                continue;
            };
            let span = (start, end);
            let body = &text[open.end()..body_end];
            match decode_fence_body(body, span) {
                Ok(found) => {
                    calls.extend(found);
                    spans.push(span);
                }
                // A json fence that is not a call stays in the text.
                Err(_) if !strict => {}
                Err(err) => {
                    calls.push(ParsedToolCall::malformed(guess_name(body), span, err));
                    spans.push(span);
                }
            }
            cursor = end;
        }
    }

    ParseOutput {
        plain_text: strip_spans(text, &spans),
        calls,
    }
}

/// Returns the end of the fence body and the end of its closing backticks.
/// A body that decodes as JSON is measured by the decoder, so backticks
/// inside string values never close the fence. Anything else closes at the
/// next line that holds only backticks.
fn fence_end(text: &str, body_start: usize) -> Option<(usize, usize)> {
    let rest = &text[body_start..];
    let mut values = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
    if let Some(Ok(_)) = values.next() {
        let body_len = values.byte_offset();
        let after = &rest[body_len..];
        let gap = after.len() - after.trim_start().len();
        if after[gap..].starts_with("```") {
            return Some((body_start + body_len, body_start + body_len + gap + 3));
        }
    }
    let close = FENCE_CLOSE_RE.as_ref().ok()?.find(rest)?;
    Some((body_start + close.start(), body_start + close.end()))
}

fn decode_fence_body(body: &str, span: (usize, usize)) -> Result<Vec<ParsedToolCall>, String> {
    let value: Value =
        serde_json::from_str(body.trim()).map_err(|err| format!("invalid tool call JSON: {err}"))?;
    match value {
        Value::Object(obj) => Ok(vec![decode_call_object(&obj, span)?]),
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| match item {
                Value::Object(obj) => decode_call_object(obj, span),
                _ => Err("tool call array entries must be objects".to_string()),
            })
            .collect(),
        _ => Err("expected a tool call object or array of objects".to_string()),
    }
}

fn decode_call_object(obj: &Map<String, Value>, span: (usize, usize)) -> Result<ParsedToolCall, String> {
    let name = ["name", "tool"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .ok_or_else(|| "tool call object is missing \"name\"".to_string())?;
    let raw_args = ["arguments", "parameters", "args"]
        .iter()
        .find_map(|key| obj.get(*key));
    let arguments = match raw_args {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(Map::new()),
        Some(Value::String(s)) => arguments_from_json_str(s),
        Some(other) => Err(format!("arguments must be an object, got {other}")),
    };
    Ok(match arguments {
        Ok(arguments) => checked_call(name, arguments, span),
        Err(err) => ParsedToolCall::malformed(name, span, err),
    })
}

fn arguments_from_json_str(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("arguments must be a JSON object, got {other}")),
        Err(err) => Err(format!("arguments are not valid JSON: {err}")),
    }
}

/// Attaches a parse error when `name` is not a registered tool.
fn checked_call(name: &str, arguments: Map<String, Value>, span: (usize, usize)) -> ParsedToolCall {
    if registry::lookup(name).is_none() {
        return ParsedToolCall::malformed(
            name,
            span,
            format!(
                "unknown tool '{name}' (available: {})",
                registry::tool_names().join(", ")
            ),
        );
    }
    ParsedToolCall::new(name, arguments, span)
}

fn is_valid_tool_name(name: &str) -> bool {
    TOOL_NAME_RE
        .as_ref()
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

fn guess_name(body: &str) -> String {
    let Some(idx) = body.find("\"name\"") else {
        return String::new();
    };
    body[idx + 6..]
        .trim_start()
        .trim_start_matches(':')
        .trim_start()
        .strip_prefix('"')
        .and_then(|rest| rest.split('"').next())
        .unwrap_or_default()
        .to_string()
}

fn strip_spans(text: &str, spans: &[(usize, usize)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for &(start, end) in spans {
        out.push_str(&text[cursor..start]);
        cursor = end;
    }
    out.push_str(&text[cursor..]);
    out.trim().to_string()
}
