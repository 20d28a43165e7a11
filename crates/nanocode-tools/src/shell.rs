use anyhow::{Result, anyhow};
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// How often the runner wakes up to check the interrupt flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Output beyond this is discarded while the command runs.
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellRunResult {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    /// stdout and stderr, interleaved in arrival order.
    pub output: String,
    pub timed_out: bool,
    pub interrupted: bool,
}

pub trait ShellRunner {
    fn run(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
        interrupt: &AtomicBool,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<ShellRunResult>;
}

#[derive(Debug, Default)]
pub struct PlatformShellRunner;

impl ShellRunner for PlatformShellRunner {
    fn run(
        &self,
        cmd: &str,
        cwd: &Path,
        timeout: Duration,
        interrupt: &AtomicBool,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<ShellRunResult> {
        let mut child = spawn_command(cmd, cwd)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("child stdout was not captured"))?;

        let (tx, rx) = mpsc::channel::<String>();
        let reader = thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let deadline = Instant::now() + timeout;
        let mut result = ShellRunResult::default();
        let mut push_line = |result: &mut ShellRunResult, line: String| {
            on_line(line.trim_end_matches(['\n', '\r']));
            if result.output.len() < MAX_CAPTURE_BYTES {
                result.output.push_str(&line);
            }
        };

        let mut exited = None;
        loop {
            if interrupt.load(Ordering::SeqCst) {
                result.interrupted = true;
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                result.timed_out = true;
                break;
            }
            match rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok(line) => push_line(&mut result, line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if let Some(status) = child.try_wait()? {
                exited = Some(status);
                break;
            }
        }

        if let Some(status) = exited {
            // The shell is done but a background job may still hold the pipe.
            let mut pipe_open = true;
            while Instant::now() < deadline {
                match rx.recv_timeout(POLL_INTERVAL) {
                    Ok(line) => push_line(&mut result, line),
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        pipe_open = false;
                        break;
                    }
                }
            }
            if pipe_open {
                kill_process_group(&child);
            } else {
                let _ = reader.join();
            }
            result.status = status.code();
            return Ok(result);
        }

        if !result.timed_out && !result.interrupted {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match child.wait_timeout(remaining)? {
                Some(status) => {
                    let _ = reader.join();
                    result.status = status.code();
                    return Ok(result);
                }
                None => result.timed_out = true,
            }
        }

        kill_process_group(&child);
        let _ = child.kill();
        result.status = child.wait()?.code();
        while let Ok(line) = rx.try_recv() {
            push_line(&mut result, line);
        }
        Ok(result)
    }
}

fn spawn_command(cmd: &str, cwd: &Path) -> Result<Child> {
    let cwd = if cwd.exists() {
        std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf())
    } else {
        cwd.to_path_buf()
    };
    let mut errors = Vec::new();
    for mut command in candidate_commands(cmd) {
        command.current_dir(&cwd);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::null());
        command.stdin(Stdio::null());
        isolate_process_group(&mut command);
        let program = command.get_program().to_string_lossy().to_string();
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(err) => errors.push(format!("{program}: {err}")),
        }
    }
    Err(anyhow!(
        "failed to spawn command '{cmd}' in '{}': {}",
        cwd.display(),
        errors.join(" | ")
    ))
}

#[cfg(unix)]
fn candidate_commands(cmd: &str) -> Vec<Command> {
    // stderr is folded into the stdout pipe by the shell itself so that the
    // two streams keep their relative order.
    let script = format!("exec 2>&1\n{cmd}");
    ["sh", "bash"]
        .into_iter()
        .map(|shell| {
            let mut command = Command::new(shell);
            command.arg("-c").arg(&script);
            command
        })
        .collect()
}

#[cfg(windows)]
fn candidate_commands(cmd: &str) -> Vec<Command> {
    let mut cmd_shell = Command::new("cmd");
    cmd_shell.arg("/C").arg(format!("({cmd}) 2>&1"));
    let mut powershell = Command::new("powershell");
    powershell
        .arg("-NoProfile")
        .arg("-Command")
        .arg(format!("& {{ {cmd} }} 2>&1"));
    vec![cmd_shell, powershell]
}

#[cfg(unix)]
fn isolate_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_command: &mut Command) {}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    if let Ok(pid) = i32::try_from(child.id()) {
        // SAFETY: signalling our own child's process group; the group id is
        // the child pid because it was spawned with process_group(0).
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}
