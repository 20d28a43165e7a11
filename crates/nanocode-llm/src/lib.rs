use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use nanocode_core::{ChatMessage, ChatRequest, LlmConfig, LlmResponse, LlmToolCall};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::thread;
use std::time::Duration;

/// Base delay for transport error retries (1s, 2s, 4s exponential backoff).
const NETWORK_RETRY_BASE_MS: u64 = 1000;

/// One blocking round trip to the model endpoint.
pub trait ModelClient {
    fn complete(&self, req: &ChatRequest) -> Result<LlmResponse>;
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    cfg: LlmConfig,
    endpoint: String,
    client: Client,
}

impl OpenAiCompatClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            endpoint: cfg.chat_completions_url(),
            cfg,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_chat_payload(&self, req: &ChatRequest) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(message_to_wire).collect();
        let mut payload = json!({
            "messages": messages,
            "max_tokens": req.max_tokens,
        });
        if let Some(model) = req.model.as_ref().filter(|m| !m.trim().is_empty()) {
            payload["model"] = json!(model);
        }
        if !req.tools.is_empty() {
            payload["tools"] = serde_json::to_value(&req.tools).unwrap_or_else(|_| json!([]));
            payload["tool_choice"] = json!("auto");
        }
        payload
    }

    fn complete_chat_inner(&self, req: &ChatRequest) -> Result<LlmResponse> {
        let payload = self.build_chat_payload(req);

        let mut last_err: Option<anyhow::Error> = None;
        let mut attempt: u8 = 0;
        while attempt <= self.cfg.max_retries {
            let mut request = self.client.post(&self.endpoint).json(&payload);
            if let Some(key) = self.api_key() {
                request = request.bearer_auth(key);
            }

            match request.send() {
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                    let body = resp.text()?;
                    if status.is_success() {
                        return parse_chat_payload(&body);
                    }
                    last_err = Some(format_api_error(
                        status,
                        &body,
                        &self.cfg.api_key_env,
                        attempt,
                        self.cfg.max_retries,
                    ));
                    if should_retry_status(status) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(self.cfg.retry_base_ms, attempt, retry_after));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
                Err(e) => {
                    last_err = Some(format_transport_error(&e, &self.endpoint));
                    if should_retry_transport_error(&e) && attempt < self.cfg.max_retries {
                        thread::sleep(retry_delay_ms(NETWORK_RETRY_BASE_MS, attempt, None));
                        attempt = attempt.saturating_add(1);
                        continue;
                    }
                    break;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("chat request failed")))
    }

    fn api_key(&self) -> Option<&str> {
        self.cfg
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }
}

impl ModelClient for OpenAiCompatClient {
    fn complete(&self, req: &ChatRequest) -> Result<LlmResponse> {
        self.complete_chat_inner(req)
    }
}

fn message_to_wire(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::System { content } => json!({"role": "system", "content": content}),
        ChatMessage::User { content } => json!({"role": "user", "content": content}),
        ChatMessage::Assistant {
            content,
            tool_calls,
        } => {
            let mut msg = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                let tc: Vec<Value> = tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(tc);
            }
            msg
        }
        ChatMessage::Tool {
            tool_call_id,
            content,
        } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
    }
}

fn format_api_error(
    status: StatusCode,
    body: &str,
    api_key_env: &str,
    attempt: u8,
    max_retries: u8,
) -> anyhow::Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => anyhow!(
            "Invalid or missing API key (HTTP {}).\n\
             Set the {api_key_env} environment variable or llm.api_key in .nanocode/settings.json.",
            status.as_u16()
        ),
        StatusCode::NOT_FOUND => anyhow!(
            "Endpoint not found (HTTP 404). Check API_BASE; it should end with the API version, e.g. http://localhost:8080/v1. Detail: {detail}"
        ),
        StatusCode::TOO_MANY_REQUESTS => anyhow!(
            "Rate limited (HTTP 429). Exhausted {}/{} retries. Detail: {}",
            attempt + 1,
            max_retries + 1,
            detail
        ),
        s if should_retry_status(s) => anyhow!(
            "Model server error (HTTP {}). Exhausted {}/{} retries. Detail: {}",
            s.as_u16(),
            attempt + 1,
            max_retries + 1,
            detail
        ),
        _ => anyhow!("Model API error (HTTP {}): {}", status.as_u16(), detail),
    }
}

fn format_transport_error(err: &reqwest::Error, endpoint: &str) -> anyhow::Error {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host")
        || inner_msg.contains("getaddrinfo");

    if err.is_timeout() {
        anyhow!(
            "Request timed out waiting for {endpoint}. \
             Increase llm.timeout_seconds if the model is slow to respond."
        )
    } else if is_dns {
        anyhow!("DNS resolution failed for {endpoint}. Check API_BASE and your network.")
    } else if err.is_connect() {
        anyhow!("Could not connect to {endpoint}. Is the model server running? Check API_BASE.")
    } else {
        anyhow!("Network error talking to {endpoint}: {err}")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

/// Upper bound on any single retry wait, including a server's `Retry-After`.
const MAX_RETRY_DELAY_MS: u64 = 60_000;

fn retry_delay_ms(base_ms: u64, attempt: u8, retry_after_seconds: Option<u64>) -> Duration {
    let delay = match retry_after_seconds {
        Some(seconds) => seconds.saturating_mul(1000),
        None => base_ms
            .saturating_mul(2_u64.saturating_pow(u32::from(attempt)))
            .max(base_ms),
    };
    Duration::from_millis(delay.min(MAX_RETRY_DELAY_MS))
}

/// Parses `choices[0].message`. An empty answer is valid; a body without a
/// message is not.
fn parse_chat_payload(body: &str) -> Result<LlmResponse> {
    let value: Value = serde_json::from_str(body)
        .map_err(|err| anyhow!("malformed response body from model endpoint: {err}"))?;
    let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    else {
        return Err(anyhow!("unexpected response payload: missing choices[0]"));
    };
    let Some(message) = choice.get("message") else {
        return Err(anyhow!("unexpected response payload: missing choices[0].message"));
    };
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .unwrap_or("stop")
        .to_string();
    let text = message
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .map(parse_tool_calls_array)
        .unwrap_or_default();
    Ok(LlmResponse {
        text,
        finish_reason,
        tool_calls,
        raw: body.to_string(),
    })
}

fn parse_tool_calls_array(value: &Value) -> Vec<LlmToolCall> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let function = item.get("function")?;
            let name = function
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if name.trim().is_empty() {
                return None;
            }
            let arguments = match function.get("arguments") {
                Some(Value::String(raw)) => raw.clone(),
                Some(Value::Null) | None => "{}".to_string(),
                Some(other) => other.to_string(),
            };
            let id = item
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|id| !id.trim().is_empty())
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("call_{idx}"));
            Some(LlmToolCall {
                id,
                name,
                arguments,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanocode_core::{FunctionDefinition, ToolDefinition};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, mpsc};

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model: None,
            messages,
            tools: Vec::new(),
            max_tokens: 64,
        }
    }

    fn client_for(endpoint_base: &str, max_retries: u8) -> OpenAiCompatClient {
        OpenAiCompatClient::new(LlmConfig {
            api_base: endpoint_base.to_string(),
            api_key: Some("test-key".to_string()),
            max_retries,
            retry_base_ms: 1,
            ..LlmConfig::default()
        })
        .expect("client")
    }

    #[test]
    fn parses_plain_content() {
        let body = r#"{"choices":[{"message":{"content":"hello"},"finish_reason":"stop"}]}"#;
        let out = parse_chat_payload(body).expect("parse");
        assert_eq!(out.text, "hello");
        assert!(out.tool_calls.is_empty());
        assert_eq!(out.raw, body);
    }

    #[test]
    fn parses_native_tool_calls_and_fills_missing_ids() {
        let body = r#"{"choices":[{"message":{"content":null,"tool_calls":[
            {"id":"abc","type":"function","function":{"name":"read","arguments":"{\"path\":\"a.rs\"}"}},
            {"type":"function","function":{"name":"glob","arguments":{"pattern":"*.rs"}}},
            {"type":"function","function":{"name":"","arguments":"{}"}}
        ]},"finish_reason":"tool_calls"}]}"#;
        let out = parse_chat_payload(body).expect("parse");
        assert_eq!(out.text, "");
        assert_eq!(out.finish_reason, "tool_calls");
        assert_eq!(out.tool_calls.len(), 2);
        assert_eq!(out.tool_calls[0].id, "abc");
        assert_eq!(out.tool_calls[1].id, "call_1");
        let args: Value = serde_json::from_str(&out.tool_calls[1].arguments).expect("json");
        assert_eq!(args["pattern"], "*.rs");
    }

    #[test]
    fn empty_message_content_is_not_an_error() {
        let out = parse_chat_payload(r#"{"choices":[{"message":{}}]}"#).expect("parse");
        assert_eq!(out.text, "");
    }

    #[test]
    fn missing_choices_is_malformed() {
        let err = parse_chat_payload(r#"{"error":"nope"}"#).expect_err("malformed");
        assert!(err.to_string().contains("choices[0]"), "{err}");
        let err = parse_chat_payload("<html>").expect_err("not json");
        assert!(err.to_string().contains("malformed"), "{err}");
    }

    #[test]
    fn payload_omits_unset_model_and_serializes_tool_history() {
        let client = client_for("http://localhost:1/v1/", 0);
        assert_eq!(client.endpoint(), "http://localhost:1/v1/chat/completions");
        let mut req = request(vec![
            ChatMessage::System {
                content: "sys".to_string(),
            },
            ChatMessage::Assistant {
                content: Some(String::new()),
                tool_calls: vec![LlmToolCall {
                    id: "call_0".to_string(),
                    name: "read".to_string(),
                    arguments: r#"{"path":"x"}"#.to_string(),
                }],
            },
            ChatMessage::Tool {
                tool_call_id: "call_0".to_string(),
                content: "   1| x".to_string(),
            },
        ]);
        req.tools = vec![ToolDefinition {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: "read".to_string(),
                description: "Read file".to_string(),
                parameters: json!({"type": "object"}),
            },
        }];
        let payload = client.build_chat_payload(&req);
        assert!(payload.get("model").is_none());
        assert_eq!(payload["max_tokens"], 64);
        assert_eq!(payload["tool_choice"], "auto");
        assert_eq!(payload["tools"][0]["function"]["name"], "read");
        let assistant = &payload["messages"][1];
        assert_eq!(assistant["tool_calls"][0]["type"], "function");
        assert_eq!(assistant["tool_calls"][0]["function"]["arguments"], r#"{"path":"x"}"#);
        assert_eq!(payload["messages"][2]["tool_call_id"], "call_0");

        req.model = Some("glm-4.6".to_string());
        assert_eq!(client.build_chat_payload(&req)["model"], "glm-4.6");
    }

    #[test]
    fn retry_status_classification() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::BAD_GATEWAY));
        assert!(!should_retry_status(StatusCode::UNAUTHORIZED));
        assert!(!should_retry_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn retry_delay_grows_exponentially_and_honours_retry_after() {
        assert_eq!(retry_delay_ms(400, 0, None), Duration::from_millis(400));
        assert_eq!(retry_delay_ms(400, 2, None), Duration::from_millis(1600));
        assert_eq!(retry_delay_ms(400, 2, Some(3)), Duration::from_secs(3));
        assert_eq!(retry_delay_ms(400, 0, Some(86_400)), Duration::from_secs(60));
        assert_eq!(retry_delay_ms(400, 40, None), Duration::from_secs(60));
    }

    #[test]
    fn retry_after_parses_seconds_and_http_date() {
        let seconds_header = reqwest::header::HeaderValue::from_static("7");
        assert_eq!(parse_retry_after_seconds(Some(&seconds_header)), Some(7));

        let future = Utc::now() + chrono::Duration::seconds(5);
        let http_date = future.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let date_header = reqwest::header::HeaderValue::from_str(&http_date).expect("header");
        let parsed = parse_retry_after_seconds(Some(&date_header)).expect("parsed");
        assert!(parsed <= 10);
    }

    #[test]
    fn complete_retries_transient_status_then_succeeds() {
        let server = start_mock_server(vec![
            MockHttpResponse {
                status: 503,
                body: r#"{"error":"temporarily_unavailable"}"#.to_string(),
                retry_after: Some("0".to_string()),
            },
            MockHttpResponse {
                status: 200,
                body: r#"{"choices":[{"message":{"content":"ok-after-retry"}}]}"#.to_string(),
                retry_after: None,
            },
        ]);
        let client = client_for(&server.base_url, 3);

        let out = client
            .complete(&request(vec![ChatMessage::User {
                content: "hi".to_string(),
            }]))
            .expect("response should eventually succeed");
        assert_eq!(out.text, "ok-after-retry");
        assert_eq!(server.request_count(), 2);
        let first = server.first_request();
        assert!(first.contains("POST /v1/chat/completions"), "{first}");
        assert!(
            first.to_ascii_lowercase().contains("authorization: bearer test-key"),
            "{first}"
        );
    }

    #[test]
    fn complete_stops_after_bounded_retries() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 429,
            body: r#"{"error":{"message":"rate_limited"}}"#.to_string(),
            retry_after: Some("0".to_string()),
        }]);
        let client = client_for(&server.base_url, 2);

        let err = client
            .complete(&request(vec![ChatMessage::User {
                content: "hi".to_string(),
            }]))
            .expect_err("request should fail after retries are exhausted");
        assert!(err.to_string().contains("Rate limited (HTTP 429)"), "{err}");
        assert!(err.to_string().contains("rate_limited"), "{err}");
        assert_eq!(server.request_count(), 3);
    }

    #[test]
    fn unauthorized_is_not_retried() {
        let server = start_mock_server(vec![MockHttpResponse {
            status: 401,
            body: r#"{"error":{"message":"invalid_api_key"}}"#.to_string(),
            retry_after: None,
        }]);
        let client = client_for(&server.base_url, 3);

        let err = client
            .complete(&request(Vec::new()))
            .expect_err("401 should fail");
        let msg = err.to_string();
        assert!(msg.contains("Invalid or missing API key"), "{msg}");
        assert!(msg.contains("API_KEY"), "{msg}");
        assert_eq!(server.request_count(), 1);
    }

    #[test]
    fn connection_refused_surfaces_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let client = client_for(&format!("http://{addr}/v1"), 0);
        let err = client
            .complete(&request(Vec::new()))
            .expect_err("nothing is listening");
        assert!(err.to_string().contains(&addr.to_string()), "{err}");
    }

    #[derive(Clone)]
    struct MockHttpResponse {
        status: u16,
        body: String,
        retry_after: Option<String>,
    }

    struct MockServer {
        base_url: String,
        request_count: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<String>>>,
        stop_tx: Option<mpsc::Sender<()>>,
        handle: Option<thread::JoinHandle<()>>,
    }

    impl MockServer {
        fn request_count(&self) -> usize {
            self.request_count.load(Ordering::SeqCst)
        }

        fn first_request(&self) -> String {
            self.requests
                .lock()
                .expect("requests lock")
                .first()
                .cloned()
                .unwrap_or_default()
        }
    }

    impl Drop for MockServer {
        fn drop(&mut self) {
            if let Some(tx) = self.stop_tx.take() {
                let _ = tx.send(());
            }
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    fn start_mock_server(scripted: Vec<MockHttpResponse>) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        listener
            .set_nonblocking(true)
            .expect("set nonblocking listener");
        let addr = listener.local_addr().expect("addr");
        let request_count = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let count_thread = Arc::clone(&request_count);
        let requests_thread = Arc::clone(&requests);
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                if rx.try_recv().is_ok() {
                    break;
                }
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        let raw = read_http_request(&mut stream).unwrap_or_default();
                        requests_thread.lock().expect("requests lock").push(raw);
                        let idx = count_thread.fetch_add(1, Ordering::SeqCst);
                        let selected = scripted
                            .get(idx)
                            .or_else(|| scripted.last())
                            .cloned()
                            .expect("scripted response");
                        let mut headers = format!(
                            "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                            selected.status,
                            selected.body.len()
                        );
                        if let Some(retry_after) = selected.retry_after {
                            headers.push_str(&format!("Retry-After: {retry_after}\r\n"));
                        }
                        headers.push_str("\r\n");
                        let _ = stream.write_all(format!("{headers}{}", selected.body).as_bytes());
                        let _ = stream.flush();
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(2));
                    }
                    Err(_) => break,
                }
            }
        });
        MockServer {
            base_url: format!("http://{addr}/v1"),
            request_count,
            requests,
            stop_tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn read_http_request(stream: &mut std::net::TcpStream) -> std::io::Result<String> {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 1024];
        let mut header_end = None;
        while header_end.is_none() {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
            header_end = find_subsequence(&buffer, b"\r\n\r\n").map(|idx| idx + 4);
        }
        let header_len = header_end.unwrap_or(buffer.len());
        let content_length = parse_content_length(&buffer[..header_len]);
        while buffer.len() < header_len + content_length {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn parse_content_length(headers: &[u8]) -> usize {
        let raw = String::from_utf8_lossy(headers);
        for line in raw.lines() {
            let mut parts = line.splitn(2, ':');
            let key = parts.next().unwrap_or_default().trim();
            if key.eq_ignore_ascii_case("content-length")
                && let Some(value) = parts.next()
                && let Ok(parsed) = value.trim().parse::<usize>()
            {
                return parsed;
            }
        }
        0
    }

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || haystack.len() < needle.len() {
            return None;
        }
        haystack
            .windows(needle.len())
            .position(|window| window == needle)
    }
}
