//! Terminal presentation: streaming output, tool notices, approval
//! prompts and Ctrl-C handling.

use std::io::{self, BufRead as _, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use termpilot_agent::tools::Approver;
use termpilot_agent::{AgentObserver, DualMessage, DualObserver, StreamChunk, ToolCall, ToolResult};

/// Exit status after a second Ctrl-C.
pub const EXIT_INTERRUPTED: u8 = 130;

// ---------------------------------------------------------------------------
// Agent output
// ---------------------------------------------------------------------------

/// Streams answer text to stdout and tool activity to stderr.
#[derive(Debug, Default)]
pub struct ConsoleObserver {
    quiet: bool,
}

impl ConsoleObserver {
    /// Observer that prints nothing; used for pipeline roles and debaters
    /// whose output is printed elsewhere.
    pub fn quiet() -> Self {
        Self { quiet: true }
    }
}

impl AgentObserver for ConsoleObserver {
    fn on_status(&self, status: &str) {
        eprintln!("  [{status}]");
    }

    fn on_chunk(&self, chunk: &StreamChunk) {
        if self.quiet {
            return;
        }
        if let StreamChunk::Text(text) = chunk {
            let mut out = io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }

    fn on_tool_start(&self, call: &ToolCall) {
        eprintln!("  > {} {}", call.name, preview(&call.arguments.to_string(), 80));
    }

    fn on_tool_complete(&self, call: &ToolCall, result: &ToolResult) {
        if !result.success {
            eprintln!("  ! {} failed: {}", call.name, result.error.as_deref().unwrap_or("unknown error"));
        }
    }

    fn on_tool_error(&self, call: &ToolCall, error: &str) {
        eprintln!("  ! {} failed: {error}", call.name);
    }
}

/// Prints each debate message as it lands.
#[derive(Debug, Default)]
pub struct DebatePrinter;

impl DualObserver for DebatePrinter {
    fn on_message(&self, message: &DualMessage) {
        println!("\n── Turn {}: {} ──\n{}", message.turn, message.role_name, message.content.trim());
    }

    fn on_status(&self, status: &str) {
        eprintln!("  [{status}]");
    }
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_owned();
    }
    let head: String = text.chars().take(max).collect();
    format!("{head}…")
}

// ---------------------------------------------------------------------------
// Approval
// ---------------------------------------------------------------------------

/// Asks on the terminal before a gated tool runs. Anything but `y`/`yes`
/// denies.
#[derive(Debug, Default)]
pub struct PromptApprover;

#[async_trait]
impl Approver for PromptApprover {
    async fn approve(&self, tool: &str, arguments: &Value) -> bool {
        let question = format!("  Allow {tool} {}? [y/N] ", preview(&arguments.to_string(), 120));
        let answer = tokio::task::spawn_blocking(move || {
            eprint!("{question}");
            let _ = io::stderr().flush();
            let mut line = String::new();
            io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

/// Ctrl-C routing: the first press cancels the operation in flight, a
/// second press before the next operation starts exits with 130.
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    inner: Arc<InterruptState>,
}

#[derive(Debug, Default)]
struct InterruptState {
    current: Mutex<CancellationToken>,
    armed: AtomicBool,
}

impl Interrupts {
    /// Install the Ctrl-C listener.
    pub fn install() -> Self {
        let interrupts = Self::default();
        let state = interrupts.inner.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if state.armed.swap(true, Ordering::SeqCst) {
                    eprintln!();
                    std::process::exit(i32::from(EXIT_INTERRUPTED));
                }
                state.current.lock().unwrap_or_else(PoisonError::into_inner).cancel();
                eprintln!("\n  [interrupted; press Ctrl-C again to exit]");
            }
        });
        interrupts
    }

    /// A fresh token for the next operation; disarms the exit.
    pub fn begin(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.inner.current.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
        self.inner.armed.store(false, Ordering::SeqCst);
        token
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
