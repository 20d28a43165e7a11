use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod context;
mod output;

use commands::chat::{run_chat, run_print_mode};
use commands::config::run_config;

#[derive(Parser)]
#[command(name = "nanocode")]
#[command(about = "Minimal terminal coding agent", long_about = None)]
pub(crate) struct Cli {
    /// Base URL of the OpenAI-compatible endpoint (overrides API_BASE).
    #[arg(long = "api-base", global = true)]
    api_base: Option<String>,

    /// Model id sent with each request (overrides MODEL).
    #[arg(long, global = true)]
    model: Option<String>,

    /// Tool call grammar: native, glm or json_fence (overrides TOOL_CALL_PARSER).
    #[arg(long, global = true)]
    parser: Option<String>,

    /// Maximum model requests per message.
    #[arg(long = "max-model-requests", global = true)]
    max_model_requests: Option<u32>,

    /// Workspace directory (defaults to the current directory).
    #[arg(short = 'C', long = "workspace", global = true)]
    workspace: Option<PathBuf>,

    /// Enable verbose logging to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Non-interactive mode: run the prompt, print the answer, then exit.
    /// Accepts the prompt as positional args or on stdin.
    #[arg(short = 'p', long = "print")]
    print_mode: bool,

    #[arg(trailing_var_arg = true)]
    prompt_args: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the effective configuration.
    Config(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Print compact JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = match &cli.workspace {
        Some(dir) => std::fs::canonicalize(dir)
            .map_err(|err| anyhow::anyhow!("workspace {}: {err}", dir.display()))?,
        None => std::env::current_dir()?,
    };
    let cfg = context::load_config(&workspace, &cli)?;

    match cli.command {
        Some(Commands::Config(ref args)) => run_config(&cfg, args.json),
        None if cli.print_mode => run_print_mode(&workspace, &cfg, &cli),
        None => run_chat(&workspace, &cfg, &cli),
    }
}
