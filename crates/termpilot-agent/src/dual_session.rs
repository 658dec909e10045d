//! Two agents debating one topic in alternating turns.
//!
//! [`DualSession::start`] spawns a background task that owns the turn
//! loop. Each reply becomes the next prompt for the other agent. The loop
//! ends on `max_turns`, a terminator phrase, [`DualSession::stop`] or a
//! turn that keeps failing; in every case a Markdown transcript is written
//! under `<workplace>/debates/`.
//!
//! Nothing escapes the task: errors and panics are logged, recorded in the
//! global error log and reported through [`DualObserver::on_status`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::TurnAgent;
use crate::error::{AgentError, ErrorKind, Result};
use crate::recovery::{error_log, sleep_or_cancel};

/// Phrases that end a debate, matched case-insensitively.
pub const TERMINATOR_PHRASES: [&str; 5] = [
    "goodbye",
    "end conversation",
    "nothing more to discuss",
    "we've covered everything",
    "let's end here",
];

pub const TURN_FAILED_NOTE: &str = "turn failed after 3 retries";

const ROLLING_LOG_FILE: &str = "debate_history.log";
const TRANSCRIPT_DIR: &str = "debates";
const CONTEXT_TRUNCATION_MARKER: &str = "[earlier discussion truncated]\n";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DualSessionConfig {
    /// Directory for the rolling log and transcripts.
    pub workplace: PathBuf,
    /// Pause after each successful turn.
    pub turn_gap: Duration,
    /// Attempts per turn before giving up.
    pub max_attempts: usize,
    /// Wait after the n-th failed attempt; the last entry repeats.
    pub retry_backoffs: Vec<Duration>,
    /// Wait after a rate limit without a retry hint.
    pub rate_limit_wait: Duration,
    pub liveness_tick: Duration,
    pub stuck_after: Duration,
    /// Characters of the prompt kept after a context-length error.
    pub context_keep_chars: usize,
}

impl DualSessionConfig {
    pub fn new(workplace: impl Into<PathBuf>) -> Self {
        Self {
            workplace: workplace.into(),
            turn_gap: Duration::from_millis(1500),
            max_attempts: 3,
            retry_backoffs: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
            ],
            rate_limit_wait: Duration::from_secs(30),
            liveness_tick: Duration::from_secs(30),
            stuck_after: Duration::from_secs(180),
            context_keep_chars: 4000,
        }
    }

    fn backoff(&self, failed_attempts: usize) -> Duration {
        let idx = failed_attempts.saturating_sub(1);
        self.retry_backoffs
            .get(idx)
            .or_else(|| self.retry_backoffs.last())
            .copied()
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    A,
    B,
    System,
}

impl Speaker {
    /// A speaks on odd turns, B on even ones.
    pub fn for_turn(turn: usize) -> Self {
        if turn % 2 == 1 { Self::A } else { Self::B }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DualMessage {
    pub turn: usize,
    pub speaker: Speaker,
    pub role_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    MaxTurns,
    Terminator,
    Stopped,
    TurnFailed,
    Panicked,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MaxTurns => "reached max turns",
            Self::Terminator => "terminator phrase",
            Self::Stopped => "stopped",
            Self::TurnFailed => "turn failed",
            Self::Panicked => "panicked",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DualStats {
    pub running: bool,
    pub current_turn: usize,
    pub max_turns: usize,
    pub messages: usize,
    /// Failed attempts that were retried.
    pub retries: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
    pub transcript_path: Option<PathBuf>,
}

/// What a debate is about and who takes part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebateSetup {
    pub initial_prompt: String,
    pub role_a: String,
    pub prompt_a: String,
    pub role_b: String,
    pub prompt_b: String,
    pub max_turns: usize,
}

/// UI hooks for a running debate.
pub trait DualObserver: Send + Sync {
    fn on_message(&self, _message: &DualMessage) {}
    fn on_status(&self, _status: &str) {}
}

struct SilentObserver;

impl DualObserver for SilentObserver {}

/// Whether `text` contains one of the terminator phrases.
pub fn contains_terminator(text: &str) -> bool {
    let lower = text.to_lowercase().replace('\u{2019}', "'");
    TERMINATOR_PHRASES.iter().any(|p| lower.contains(p))
}

fn keep_last_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_owned();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("{CONTEXT_TRUNCATION_MARKER}{tail}")
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DebateState {
    log: Vec<DualMessage>,
    stats: DualStats,
    speaker: Option<(Speaker, String)>,
}

struct Shared {
    agent_a: Arc<dyn TurnAgent>,
    agent_b: Arc<dyn TurnAgent>,
    config: DualSessionConfig,
    observer: Arc<dyn DualObserver>,
    state: Mutex<DebateState>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct DualSession {
    shared: Arc<Shared>,
    enabled: AtomicBool,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for DualSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DualSession")
            .field("agent_a", &self.shared.agent_a.name())
            .field("agent_b", &self.shared.agent_b.name())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl DualSession {
    pub fn new(agent_a: Arc<dyn TurnAgent>, agent_b: Arc<dyn TurnAgent>, config: DualSessionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                agent_a,
                agent_b,
                config,
                observer: Arc::new(SilentObserver),
                state: Mutex::new(DebateState::default()),
            }),
            enabled: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    /// Set the UI observer. Only valid before the first `start`.
    pub fn with_observer(mut self, observer: Arc<dyn DualObserver>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.observer = observer;
        }
        self
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    /// Disable the session and stop any running debate.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.stop();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Start a debate in the background.
    pub fn start(&self, setup: DebateSetup) -> Result<()> {
        if !self.is_enabled() {
            return Err(AgentError::DualSession {
                reason: "dual session is disabled".into(),
            });
        }
        if setup.initial_prompt.trim().is_empty() {
            return Err(AgentError::ValidationError {
                field: "initial_prompt".into(),
                reason: "must not be empty".into(),
            });
        }
        if setup.max_turns == 0 {
            return Err(AgentError::ValidationError {
                field: "max_turns".into(),
                reason: "must be at least 1".into(),
            });
        }

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(AgentError::DualSession {
                reason: "a debate is already running".into(),
            });
        }

        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            *state = DebateState::default();
            state.stats.running = true;
            state.stats.max_turns = setup.max_turns;
            state.stats.started_at = Some(Utc::now());
        }

        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let token = cancel.clone();
        tracing::info!(
            role_a = %setup.role_a,
            role_b = %setup.role_b,
            max_turns = setup.max_turns,
            "debate started"
        );
        let handle = tokio::spawn(async move { shared.supervise(setup, token).await });
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Ask the running debate to stop. The transcript is still written.
    pub fn stop(&self) {
        if let Some(r) = self.running.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            r.cancel.cancel();
        }
    }

    /// Wait for the background task to finish.
    pub async fn wait(&self) {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(r) = running
            && let Err(e) = r.handle.await
        {
            tracing::error!(error = %e, "debate task failed to join");
        }
    }

    /// One-line progress summary for status bars.
    pub fn progress(&self) -> String {
        let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = &state.stats;
        match (&state.speaker, stats.running) {
            (Some((_, role)), true) => format!("turn {}/{}: {role} speaking", stats.current_turn, stats.max_turns),
            _ => match stats.end_reason {
                Some(reason) => format!("debate ended after {} turns ({reason})", stats.current_turn),
                None => "idle".to_owned(),
            },
        }
    }

    pub fn log(&self) -> Vec<DualMessage> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner).log.clone()
    }

    pub fn stats(&self) -> DualStats {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner).stats.clone()
    }
}

enum TurnOutcome {
    Reply(String),
    Canceled,
    Failed(AgentError),
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, DebateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the debate, turning a panic into a logged end state.
    async fn supervise(self: Arc<Self>, setup: DebateSetup, cancel: CancellationToken) {
        let reason = match AssertUnwindSafe(self.run(&setup, &cancel)).catch_unwind().await {
            Ok(reason) => reason,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                tracing::error!(panic = %msg, "debate task panicked");
                error_log::global().record(&msg, "dual session", "dual_session.run", true);
                self.system_message(&format!("debate aborted: {msg}")).await;
                EndReason::Panicked
            }
        };

        let path = self.write_transcript(&setup, reason).await;
        let mut state = self.lock();
        state.stats.running = false;
        state.stats.ended_at = Some(Utc::now());
        state.stats.end_reason = Some(reason);
        state.stats.transcript_path = path;
        state.speaker = None;
        tracing::info!(turns = state.stats.current_turn, reason = %reason, "debate finished");
    }

    async fn run(&self, setup: &DebateSetup, cancel: &CancellationToken) -> EndReason {
        let mut message = setup.initial_prompt.clone();
        let mut introduced = [false, false];

        loop {
            if cancel.is_cancelled() {
                return EndReason::Stopped;
            }
            let turn = {
                let mut state = self.lock();
                if state.stats.current_turn >= setup.max_turns {
                    return EndReason::MaxTurns;
                }
                state.stats.current_turn += 1;
                state.stats.current_turn
            };

            let speaker = Speaker::for_turn(turn);
            let (agent, role, persona, slot) = match speaker {
                Speaker::A => (&self.agent_a, &setup.role_a, &setup.prompt_a, 0),
                _ => (&self.agent_b, &setup.role_b, &setup.prompt_b, 1),
            };
            self.lock().speaker = Some((speaker, role.clone()));

            // Each agent hears its role brief once, with its first prompt.
            let prompt = if introduced[slot] || persona.trim().is_empty() {
                message.clone()
            } else {
                format!("[Your role: {role}]\n{}\n\n{message}", persona.trim())
            };
            introduced[slot] = true;

            match self.take_turn(agent.as_ref(), role, prompt, cancel).await {
                TurnOutcome::Reply(reply) => {
                    let entry = DualMessage {
                        turn,
                        speaker,
                        role_name: role.clone(),
                        content: reply.clone(),
                        timestamp: Utc::now(),
                    };
                    self.push(entry).await;
                    if contains_terminator(&reply) {
                        tracing::info!(turn, role = %role, "terminator phrase detected");
                        return EndReason::Terminator;
                    }
                    message = reply;
                }
                TurnOutcome::Canceled => return EndReason::Stopped,
                TurnOutcome::Failed(e) => {
                    tracing::error!(turn, role = %role, error = %e, "debate turn failed");
                    error_log::global().record(&e, &format!("debate turn {turn}"), "dual_session.turn", false);
                    self.system_message(TURN_FAILED_NOTE).await;
                    return EndReason::TurnFailed;
                }
            }

            if sleep_or_cancel(self.config.turn_gap, cancel).await.is_err() {
                return EndReason::Stopped;
            }
        }
    }

    /// One turn with retries.
    async fn take_turn(
        &self,
        agent: &dyn TurnAgent,
        role: &str,
        mut prompt: String,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = AgentError::DualSession {
            reason: TURN_FAILED_NOTE.into(),
        };

        for attempt in 1..=attempts {
            let result = match self.watch(agent, role, &prompt, cancel).await {
                Ok(reply) if reply.trim().is_empty() => Err(AgentError::DualSession {
                    reason: format!("{role} returned an empty reply"),
                }),
                other => other,
            };
            let err = match result {
                Ok(reply) => return TurnOutcome::Reply(reply),
                Err(e) if e.is_canceled() => return TurnOutcome::Canceled,
                Err(e) => e,
            };
            // The retry re-sends the prompt; the failed exchange must not stay behind.
            agent.discard_last_turn();

            tracing::warn!(role = %role, attempt, max = attempts, error = %err, "debate turn attempt failed");
            let wait = match err.kind() {
                ErrorKind::RateLimit => err.retry_after().unwrap_or(self.config.rate_limit_wait),
                ErrorKind::ContextLength => {
                    prompt = keep_last_chars(&prompt, self.config.context_keep_chars);
                    Duration::ZERO
                }
                _ => self.config.backoff(attempt),
            };
            last_error = err;
            if attempt == attempts {
                break;
            }

            self.lock().stats.retries += 1;
            if sleep_or_cancel(wait, cancel).await.is_err() {
                return TurnOutcome::Canceled;
            }
        }
        TurnOutcome::Failed(last_error)
    }

    /// Run one chat while a ticker watches the agent's activity clock.
    /// A quiet agent is reported, never interrupted.
    async fn watch(
        &self,
        agent: &dyn TurnAgent,
        role: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let chat = AssertUnwindSafe(agent.chat(prompt, cancel)).catch_unwind();
        tokio::pin!(chat);

        let tick = self.config.liveness_tick.max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        let mut warned = false;

        loop {
            tokio::select! {
                biased;
                outcome = &mut chat => {
                    return outcome.unwrap_or_else(|panic| {
                        let msg = panic
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_owned())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_owned());
                        tracing::error!(role = %role, panic = %msg, "agent panicked during debate turn");
                        error_log::global().record(&msg, role, "dual_session.chat", true);
                        Err(AgentError::Internal(format!("agent panicked: {msg}")))
                    });
                }
                _ = cancel.cancelled() => return Err(AgentError::Canceled),
                _ = ticker.tick() => {
                    let idle = agent.last_activity().elapsed();
                    if idle >= self.config.stuck_after && !warned {
                        warned = true;
                        let note = format!("{role} seems stuck");
                        tracing::warn!(role = %role, idle_secs = idle.as_secs(), "{note}");
                        self.observer.on_status(&note);
                    } else if idle < self.config.stuck_after {
                        warned = false;
                    }
                }
            }
        }
    }

    async fn push(&self, entry: DualMessage) {
        {
            let mut state = self.lock();
            state.log.push(entry.clone());
            state.stats.messages = state.log.len();
        }
        self.observer.on_message(&entry);
        if let Err(e) = self.append_rolling_log(&entry).await {
            tracing::warn!(error = %e, "failed to append debate log");
        }
    }

    async fn system_message(&self, text: &str) {
        let turn = self.lock().stats.current_turn;
        self.observer.on_status(text);
        self.push(DualMessage {
            turn,
            speaker: Speaker::System,
            role_name: "system".into(),
            content: text.to_owned(),
            timestamp: Utc::now(),
        })
        .await;
    }

    async fn append_rolling_log(&self, entry: &DualMessage) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.config.workplace).await?;
        let line = format!(
            "[{}] turn {} {}: {}\n",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.turn,
            entry.role_name,
            entry.content.replace('\n', "\n    ")
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.config.workplace.join(ROLLING_LOG_FILE))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    async fn write_transcript(&self, setup: &DebateSetup, reason: EndReason) -> Option<PathBuf> {
        let (log, stats) = {
            let state = self.lock();
            (state.log.clone(), state.stats.clone())
        };
        let started = stats.started_at.unwrap_or_else(Utc::now);
        let dir = self.config.workplace.join(TRANSCRIPT_DIR);
        let path = dir.join(format!("debate_{}.md", started.format("%Y%m%d_%H%M%S")));
        let text = render_transcript(setup, &log, &stats, reason);

        let written = async {
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(&path, text).await
        }
        .await;
        match written {
            Ok(()) => {
                tracing::info!(path = %path.display(), "debate transcript written");
                Some(path)
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to write debate transcript");
                error_log::global().record(&e, "debate transcript", "dual_session.transcript", false);
                None
            }
        }
    }
}

fn render_transcript(setup: &DebateSetup, log: &[DualMessage], stats: &DualStats, reason: EndReason) -> String {
    let mut out = format!(
        "# Debate\n\n**Topic:** {}\n\n- {}: {}\n- {}: {}\n- Turns: {}/{}\n- Outcome: {reason}\n",
        setup.initial_prompt.trim(),
        setup.role_a,
        setup.prompt_a.trim(),
        setup.role_b,
        setup.prompt_b.trim(),
        stats.current_turn,
        stats.max_turns,
    );
    if let Some(started) = stats.started_at {
        out.push_str(&format!("- Started: {}\n", started.to_rfc3339()));
    }
    out.push_str(&format!("- Ended: {}\n", Utc::now().to_rfc3339()));

    for m in log {
        match m.speaker {
            Speaker::System => out.push_str(&format!("\n> **System:** {}\n", m.content.trim())),
            _ => out.push_str(&format!("\n## Turn {}: {}\n\n{}\n", m.turn, m.role_name, m.content.trim())),
        }
    }
    out
}

/// Path of the rolling debate log under `workplace`.
pub fn rolling_log_path(workplace: &Path) -> PathBuf {
    workplace.join(ROLLING_LOG_FILE)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
