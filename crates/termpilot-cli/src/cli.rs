//! CLI argument definitions for termpilot.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// termpilot -- a coding assistant for your terminal.
#[derive(Parser)]
#[command(
    name = "termpilot",
    version,
    about = "termpilot -- a coding assistant for your terminal",
    long_about = "Chat with an LLM that can read and edit files and run commands in the \
                  current directory. Supports API keys and OAuth subscriptions for several providers."
)]
pub struct Cli {
    /// Configuration file to load instead of the default search path.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Approve every tool call without asking.
    #[arg(long, short = 'y', global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the interactive chat REPL (the default).
    Chat,

    /// Ask a single question and print the answer.
    Ask {
        /// The question; multiple words are joined with spaces.
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Log in to an OAuth provider.
    Login {
        /// OAuth provider id (`anthropic`, `openai-codex`).
        provider: String,
    },

    /// Remove stored OAuth credentials for a provider.
    Logout {
        provider: String,
    },

    /// Answer one request through the planner, researcher, executor and critic roles.
    Pipeline {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Let two agents debate a topic.
    Debate(DebateArgs),

    /// Ask the configured model for its preferred sampling settings.
    Interview,

    /// List the providers termpilot can talk to.
    Providers,

    /// Load and validate the configuration, then print a summary.
    ConfigCheck,
}

#[derive(Args)]
pub struct DebateArgs {
    /// The topic or opening prompt.
    #[arg(required = true, num_args = 1..)]
    pub topic: Vec<String>,

    /// Maximum number of turns across both sides.
    #[arg(long, default_value_t = 10)]
    pub turns: usize,

    #[arg(long, default_value = "Advocate")]
    pub role_a: String,

    #[arg(long, default_value = "Take the position in favour and defend it with concrete arguments.")]
    pub prompt_a: String,

    #[arg(long, default_value = "Critic")]
    pub role_b: String,

    #[arg(long, default_value = "Challenge the other side's arguments and point out risks and gaps.")]
    pub prompt_b: String,
}

/// Join positional words into one message.
pub fn joined(words: &[String]) -> String {
    words.join(" ")
}
