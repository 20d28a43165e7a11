use anyhow::{Result, anyhow};
use nanocode_agent::{AgentLoop, EventCallback, LoopConfig};
use nanocode_core::{AppConfig, ParserMode};
use nanocode_llm::OpenAiCompatClient;
use nanocode_observe::Observer;
use nanocode_tools::{LocalToolHost, OutputSink};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use crate::Cli;

/// Config files, then environment, then command-line flags.
pub(crate) fn load_config(workspace: &Path, cli: &Cli) -> Result<AppConfig> {
    let mut cfg = AppConfig::load(workspace)?;
    apply_cli_flags(&mut cfg, cli)?;
    Ok(cfg)
}

fn apply_cli_flags(cfg: &mut AppConfig, cli: &Cli) -> Result<()> {
    if let Some(base) = cli.api_base.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        cfg.llm.api_base = base.trim_end_matches('/').to_string();
    }
    if let Some(model) = cli.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        cfg.llm.model = Some(model.to_string());
    }
    if let Some(parser) = &cli.parser {
        cfg.agent.parser = parser.parse::<ParserMode>()?;
    }
    if let Some(max) = cli.max_model_requests {
        if max == 0 {
            return Err(anyhow!("--max-model-requests must be at least 1"));
        }
        cfg.agent.max_model_requests = max;
    }
    Ok(())
}

pub(crate) struct Session {
    pub agent: AgentLoop,
    pub interrupt: Arc<AtomicBool>,
    pub observer: Observer,
}

/// Wires the model client, tool host, observer and interrupt flag into an
/// agent loop.
pub(crate) fn build_session(
    workspace: &Path,
    cfg: &AppConfig,
    verbose: bool,
    output_sink: Option<OutputSink>,
    on_event: EventCallback,
) -> Result<Session> {
    let interrupt = Arc::new(AtomicBool::new(false));
    let client = OpenAiCompatClient::new(cfg.llm.clone())?;

    let mut tools =
        LocalToolHost::new(workspace, cfg.tools.clone()).with_interrupt(Arc::clone(&interrupt));
    if let Some(sink) = output_sink {
        tools = tools.with_output_sink(sink);
    }

    let mut observer = Observer::new(workspace)?;
    observer.set_verbose(verbose);
    observer.verbose_log(&format!(
        "endpoint={} model={} parser={}",
        client.endpoint(),
        cfg.llm.model.as_deref().unwrap_or("(server default)"),
        cfg.agent.parser
    ));
    if cfg.llm.api_key.is_none() {
        observer.verbose_log(&format!(
            "no API key set ({} is empty), sending requests without authorization",
            cfg.llm.api_key_env
        ));
    }

    let mut agent_observer = Observer::new(workspace)?;
    agent_observer.set_verbose(verbose);
    let mut agent = AgentLoop::new(
        Arc::new(client),
        Arc::new(tools),
        LoopConfig::from_app_config(cfg, workspace),
    )
    .with_interrupt(Arc::clone(&interrupt))
    .with_observer(agent_observer);
    agent.set_event_callback(on_event);

    Ok(Session {
        agent,
        interrupt,
        observer,
    })
}
