use anyhow::{Result, anyhow};
use nanocode_agent::{AgentError, LoopEvent};
use nanocode_core::AppConfig;
use nanocode_tools::OutputSink;
use std::io::{BufRead, IsTerminal, Read, Write, stdin, stdout};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::Cli;
use crate::context::{Session, build_session};
use crate::output::{HELP_TEXT, Painter, render_event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionCommand<'a> {
    Clear,
    Quit,
    Help,
    Empty,
    Prompt(&'a str),
}

pub(crate) fn parse_session_command(line: &str) -> SessionCommand<'_> {
    let trimmed = line.trim();
    match trimmed {
        "" => SessionCommand::Empty,
        "/c" | "/clear" => SessionCommand::Clear,
        "/q" | "/quit" | "exit" => SessionCommand::Quit,
        "/help" => SessionCommand::Help,
        _ => SessionCommand::Prompt(trimmed),
    }
}

pub(crate) fn run_chat(workspace: &Path, cfg: &AppConfig, cli: &Cli) -> Result<()> {
    let painter = Painter::stdout();
    let sink: OutputSink = Arc::new(move |line: &str| {
        println!("{}", painter.dim(&format!("  │ {line}")));
    });
    let Session {
        mut agent,
        interrupt,
        observer,
    } = build_session(
        workspace,
        cfg,
        cli.verbose,
        Some(sink),
        Box::new(move |event: &LoopEvent| {
            if let Some(line) = render_event(event, painter) {
                println!("{line}");
            }
        }),
    )?;

    #[cfg(unix)]
    {
        // A second Ctrl-C while the flag is still set exits the process.
        signal_hook::flag::register_conditional_shutdown(
            signal_hook::consts::SIGINT,
            1,
            Arc::clone(&interrupt),
        )?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&interrupt))?;
    }

    println!(
        "{} {}",
        painter.accent("nanocode"),
        painter.dim(&format!(
            "{} | {} | /help for commands",
            cfg.llm.model.as_deref().unwrap_or("(server default)"),
            workspace.display()
        ))
    );

    let mut input = stdin().lock();
    loop {
        print!("\n{} ", painter.accent("❯"));
        stdout().flush()?;

        let mut line = String::new();
        if input.read_line(&mut line)? == 0 {
            println!();
            break;
        }

        match parse_session_command(&line) {
            SessionCommand::Empty => continue,
            SessionCommand::Quit => break,
            SessionCommand::Help => println!("{HELP_TEXT}"),
            SessionCommand::Clear => {
                agent.reset();
                println!("{}", painter.dim("conversation cleared"));
            }
            SessionCommand::Prompt(prompt) => {
                let outcome = agent.submit(prompt);
                // A Ctrl-C that lands as the turn finishes must not arm the
                // second-press quit.
                interrupt.store(false, Ordering::SeqCst);
                match outcome {
                    Ok(report) => {
                        if report.hit_request_limit {
                            println!(
                                "{}",
                                painter.error(&format!(
                                    "stopped after {} model requests; send another message to continue",
                                    report.model_requests
                                ))
                            );
                        }
                    }
                    Err(AgentError::Interrupted) => println!("{}", painter.dim("interrupted")),
                    Err(err @ AgentError::Transport(_)) => {
                        println!("{}", painter.error(&err.to_string()));
                    }
                    Err(err) => {
                        observer.warn_log(&format!("turn failed: {err}"));
                        return Err(err.into());
                    }
                }
            }
        }
    }

    agent.terminate();
    Ok(())
}

pub(crate) fn run_print_mode(workspace: &Path, cfg: &AppConfig, cli: &Cli) -> Result<()> {
    let prompt = if !cli.prompt_args.is_empty() {
        cli.prompt_args.join(" ")
    } else if !stdin().is_terminal() {
        let mut buf = String::new();
        stdin().read_to_string(&mut buf)?;
        buf.trim().to_string()
    } else {
        return Err(anyhow!(
            "-p/--print requires a prompt argument or stdin input"
        ));
    };
    if prompt.trim().is_empty() {
        return Err(anyhow!("empty prompt"));
    }

    // Progress goes to stderr so stdout carries only the answer.
    let painter = Painter::stderr();
    let Session { mut agent, .. } = build_session(
        workspace,
        cfg,
        cli.verbose,
        None,
        Box::new(move |event: &LoopEvent| {
            if matches!(event, LoopEvent::AssistantText(_)) {
                return;
            }
            if let Some(line) = render_event(event, painter) {
                eprintln!("{line}");
            }
        }),
    )?;

    let report = agent.submit(&prompt)?;
    agent.terminate();
    if report.hit_request_limit {
        return Err(anyhow!(
            "stopped after {} model requests without a final answer",
            report.model_requests
        ));
    }
    println!("{}", report.final_text);
    Ok(())
}
