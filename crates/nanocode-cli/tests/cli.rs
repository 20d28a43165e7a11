use assert_cmd::Command;
use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread;
use tempfile::TempDir;

fn nanocode(workspace: &Path, home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("nanocode"));
    cmd.current_dir(workspace)
        .env("HOME", home)
        .env_remove("API_KEY")
        .env_remove("API_BASE")
        .env_remove("MODEL")
        .env_remove("TOOL_CALL_PARSER");
    cmd
}

fn write_local_settings(workspace: &Path, body: &str) {
    let runtime = workspace.join(".nanocode");
    fs::create_dir_all(&runtime).expect("runtime dir");
    fs::write(runtime.join("settings.local.json"), body).expect("settings override");
}

/// Serves exactly one chat completion and hands back the request body.
fn serve_one_completion(answer: &str) -> (String, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let base = format!("http://{}", listener.local_addr().expect("addr"));
    let reply = serde_json::json!({
        "choices": [{
            "message": {"role": "assistant", "content": answer},
            "finish_reason": "stop"
        }]
    })
    .to_string();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut raw = Vec::new();
        let mut buf = [0_u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut buf).expect("read");
            assert!(n > 0, "client closed before sending headers");
            raw.extend_from_slice(&buf[..n]);
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let headers = String::from_utf8_lossy(&raw[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while raw.len() < header_end + content_length {
            let n = stream.read(&mut buf).expect("read body");
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }
        let body = String::from_utf8_lossy(&raw[header_end..]).to_string();

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            reply.len(),
            reply
        );
        stream.write_all(response.as_bytes()).expect("write");
        body
    });
    (base, handle)
}

#[test]
fn config_json_redacts_api_key() {
    let workspace = TempDir::new().expect("workspace");
    let home = TempDir::new().expect("home");
    write_local_settings(
        workspace.path(),
        r#"{"llm":{"api_key":"sk-secret-value","model":"glm-4.6"}}"#,
    );

    let output = nanocode(workspace.path(), home.path())
        .args(["config", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let shown: Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(shown["llm"]["api_key"], "***REDACTED***");
    assert_eq!(shown["llm"]["model"], "glm-4.6");
    assert!(!String::from_utf8_lossy(&output).contains("sk-secret-value"));
}

#[test]
fn flags_and_env_feed_the_effective_config() {
    let workspace = TempDir::new().expect("workspace");
    let home = TempDir::new().expect("home");

    let output = nanocode(workspace.path(), home.path())
        .env("MODEL", "from-env")
        .args(["--parser", "glm", "--max-model-requests", "3", "config", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let shown: Value = serde_json::from_slice(&output).expect("json output");
    assert_eq!(shown["llm"]["model"], "from-env");
    assert_eq!(shown["agent"]["parser"], "glm");
    assert_eq!(shown["agent"]["max_model_requests"], 3);
}

#[test]
fn unknown_parser_is_rejected() {
    let workspace = TempDir::new().expect("workspace");
    let home = TempDir::new().expect("home");

    let out = nanocode(workspace.path(), home.path())
        .args(["--parser", "yaml", "config"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&out).contains("unknown tool call parser"));

    nanocode(workspace.path(), home.path())
        .env("TOOL_CALL_PARSER", "xml")
        .args(["config"])
        .assert()
        .failure();
}

#[test]
fn print_mode_reports_unreachable_endpoint() {
    let workspace = TempDir::new().expect("workspace");
    let home = TempDir::new().expect("home");
    write_local_settings(workspace.path(), r#"{"llm":{"max_retries":0}}"#);

    let out = nanocode(workspace.path(), home.path())
        .args(["--api-base", "http://127.0.0.1:9", "-p", "hi"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(
        String::from_utf8_lossy(&out).contains("model request failed"),
        "{}",
        String::from_utf8_lossy(&out)
    );
}

#[test]
fn print_mode_prints_the_final_answer() {
    let workspace = TempDir::new().expect("workspace");
    let home = TempDir::new().expect("home");
    let (base, server) = serve_one_completion("all tests pass");

    let out = nanocode(workspace.path(), home.path())
        .args(["--api-base", &base, "--model", "local", "-p", "are", "the", "tests", "green?"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8_lossy(&out).trim(), "all tests pass");

    let body: Value = serde_json::from_str(&server.join().expect("server")).expect("request json");
    assert_eq!(body["model"], "local");
    assert!(body["tools"].as_array().is_some_and(|tools| tools.len() == 6));
    let messages = body["messages"].as_array().expect("messages");
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[1]["content"], "are the tests green?");

    let log = fs::read_to_string(workspace.path().join(".nanocode/observe.log")).expect("log");
    assert!(log.contains("EVENT"));
}

#[test]
fn print_mode_without_prompt_fails() {
    let workspace = TempDir::new().expect("workspace");
    let home = TempDir::new().expect("home");

    nanocode(workspace.path(), home.path())
        .args(["-p"])
        .write_stdin("   \n")
        .assert()
        .failure();
}

#[test]
fn help_lists_flags() {
    let workspace = TempDir::new().expect("workspace");
    let home = TempDir::new().expect("home");

    let out = nanocode(workspace.path(), home.path())
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("--parser"));
    assert!(text.contains("--max-model-requests"));
}
