//! Subcommand: `termpilot chat` -- interactive REPL.
//!
//! Reads one line at a time, answers through the agent (or the pipeline
//! when enabled) and streams the reply as it arrives.

use std::io::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use termpilot_agent::{Agent, BrainFileSink, Pipeline, PipelineConfig};

use crate::helpers::Runtime;
use crate::ui::{ConsoleObserver, Interrupts};

/// What a slash command asks the loop to do.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Reset,
    Pipeline(bool),
    Model(String),
    Provider { id: String, model: Option<String> },
    Quit,
    Help,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let rest = line.strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.collect::<Vec<_>>().join(" ");
    Some(match (name, arg.as_str()) {
        ("reset", _) => Command::Reset,
        ("pipeline", "on") => Command::Pipeline(true),
        ("pipeline", "off") => Command::Pipeline(false),
        ("model", m) if !m.is_empty() => Command::Model(m.to_owned()),
        ("provider", p) if !p.is_empty() => {
            let (id, model) = match p.split_once(' ') {
                Some((id, model)) => (id, Some(model.trim().to_owned())),
                None => (p, None),
            };
            Command::Provider {
                id: id.to_owned(),
                model,
            }
        }
        ("quit" | "exit", _) => Command::Quit,
        ("help", _) => Command::Help,
        _ => Command::Unknown(line.to_owned()),
    })
}

/// Run the interactive REPL.
pub async fn cmd_chat(runtime: &Runtime, interrupts: &Interrupts) -> Result<()> {
    let agent = runtime.agent("termpilot", Arc::new(ConsoleObserver::default())).await?;
    let pipeline = Pipeline::new(PipelineConfig::default())
        .with_sink(Arc::new(BrainFileSink::new(runtime.config.workplace())));

    println!();
    println!("  termpilot v{}  ({})", env!("CARGO_PKG_VERSION"), agent.model_id());
    println!("  Type a message, /help for commands, /quit to exit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush().context("failed to flush stdout")?;

        let Some(line) = lines.next_line().await.context("failed to read input")? else {
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(command) = parse_command(trimmed) {
            if let Command::Pipeline(on) = command {
                // Role outputs are intermediate; only the final answer is printed.
                let observer = if on {
                    ConsoleObserver::quiet()
                } else {
                    ConsoleObserver::default()
                };
                agent.set_observer(Arc::new(observer));
            }
            if !apply_command(runtime, &agent, command) {
                break;
            }
            continue;
        }

        let cancel = interrupts.begin();
        match agent.respond(&pipeline, trimmed, &cancel).await {
            Ok(answer) => {
                if agent.pipeline_enabled() {
                    print!("{answer}");
                }
                println!("\n");
            }
            Err(e) if e.is_canceled() => println!("\n  [canceled]\n"),
            Err(e) => eprintln!("\n  Error: {e}\n"),
        }
    }

    info!(usage = ?agent.usage(), "chat session ended");
    Ok(())
}

/// Apply a slash command. Returns false when the loop should end.
fn apply_command(runtime: &Runtime, agent: &Agent, command: Command) -> bool {
    match command {
        Command::Reset => {
            agent.reset();
            println!("  Conversation cleared.\n");
        }
        Command::Pipeline(on) => {
            agent.set_pipeline_enabled(on);
            println!("  Pipeline {}.\n", if on { "enabled" } else { "disabled" });
        }
        Command::Model(model) => {
            agent.set_model(model.clone());
            println!("  Model set to {model}.\n");
        }
        Command::Provider { id, model } => {
            let switched = runtime
                .config
                .switched_to(&id, model.as_deref(), &runtime.env)
                .and_then(|config| agent.switch_provider(&config.llm_client_config()));
            match switched {
                Ok(()) => println!("  Provider set to {id} ({}).\n", agent.model_id()),
                Err(e) => println!("  Cannot switch to {id}: {e}\n"),
            }
        }
        Command::Quit => return false,
        Command::Help => {
            println!("  /reset            clear the conversation");
            println!("  /pipeline on|off  route messages through planner, researcher, executor and critic");
            println!("  /model <id>       switch model");
            println!("  /provider <id> [model]  switch provider (see `termpilot providers`)");
            println!("  /quit             exit\n");
        }
        Command::Unknown(line) => println!("  Unknown command: {line} (try /help)\n"),
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands_parse() {
        assert_eq!(parse_command("/reset"), Some(Command::Reset));
        assert_eq!(parse_command("/pipeline on"), Some(Command::Pipeline(true)));
        assert_eq!(parse_command("/pipeline off"), Some(Command::Pipeline(false)));
        assert_eq!(parse_command("/model gpt-4o"), Some(Command::Model("gpt-4o".into())));
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
        assert_eq!(parse_command("/model"), Some(Command::Unknown("/model".into())));
        assert_eq!(
            parse_command("/provider ollama"),
            Some(Command::Provider {
                id: "ollama".into(),
                model: None
            })
        );
        assert_eq!(
            parse_command("/provider anthropic  claude-3-5-haiku-latest"),
            Some(Command::Provider {
                id: "anthropic".into(),
                model: Some("claude-3-5-haiku-latest".into())
            })
        );
        assert_eq!(parse_command("/provider"), Some(Command::Unknown("/provider".into())));
        assert_eq!(parse_command("hello"), None);
    }
}
