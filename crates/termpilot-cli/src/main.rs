//! CLI entry point for termpilot.
//!
//! Exit codes: 0 on success, 1 on any error, 130 when interrupted.

mod cli;
mod commands;
mod helpers;
mod repl;
mod tools;
mod ui;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use termpilot_agent::AgentError;

use crate::cli::{Cli, Commands, joined};
use crate::helpers::{Runtime, init_tracing, load_config, load_env};
use crate::ui::{EXIT_INTERRUPTED, Interrupts};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_interrupted(&e) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            error!(error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let env = load_env()?;
    init_tracing(cli.log_json, env.verbose());

    let command = cli.command.unwrap_or(Commands::Chat);

    // Commands that work without a usable model configuration.
    match &command {
        Commands::Login { provider } => return commands::cmd_login(provider).await,
        Commands::Logout { provider } => return commands::cmd_logout(provider).await,
        Commands::Providers => return commands::cmd_providers().await,
        Commands::ConfigCheck => return commands::cmd_config_check(cli.config.as_deref(), &env),
        _ => {}
    }

    let loaded = load_config(cli.config.as_deref(), &env)?;
    let runtime = Runtime::build(loaded.config, env, cli.yes).await?;
    let interrupts = Interrupts::install();

    let result = match command {
        Commands::Chat => repl::cmd_chat(&runtime, &interrupts).await,
        Commands::Ask { text } => commands::cmd_ask(&runtime, &interrupts, &joined(&text)).await,
        Commands::Pipeline { text } => commands::cmd_pipeline(&runtime, &interrupts, &joined(&text)).await,
        Commands::Debate(args) => commands::cmd_debate(&runtime, &interrupts, args).await,
        Commands::Interview => commands::cmd_interview(&runtime, &interrupts).await,
        Commands::Login { .. } | Commands::Logout { .. } | Commands::Providers | Commands::ConfigCheck => Ok(()),
    };
    runtime.shutdown().await;
    result
}

/// Whether the failure is a user cancellation.
fn is_interrupted(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<AgentError>().is_some_and(AgentError::is_canceled))
}
