//! Two scripted agents debating in alternating turns.

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use termpilot_agent::dual_session::{EndReason, Speaker, TURN_FAILED_NOTE, rolling_log_path};
use termpilot_agent::tools::ToolFilter;
use common::{Outcome, ScriptedModel, agent_with, http_error, transcript};
use termpilot_agent::{
    AgentConfig, AgentError, DebateSetup, MemoryConfig, ToolRegistry, DualMessage, DualObserver, DualSession, DualSessionConfig, Result, TurnAgent,
};

/// Replies from a script; an exhausted script waits for cancellation.
struct Debater {
    name: String,
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl Debater {
    fn new(name: &str, replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TurnAgent for Debater {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn chat(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        self.prompts.lock().unwrap().push(text.to_owned());
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(reply) => Ok(reply),
            None => {
                cancel.cancelled().await;
                Err(AgentError::Canceled)
            }
        }
    }

    async fn run_role(&self, _: &str, _: &str, _: ToolFilter, _: &CancellationToken) -> Result<String> {
        Err(AgentError::Internal("not used in debates".into()))
    }

    fn last_activity(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }
}

#[derive(Default)]
struct Collector {
    messages: Mutex<Vec<DualMessage>>,
    statuses: Mutex<Vec<String>>,
}

impl DualObserver for Collector {
    fn on_message(&self, message: &DualMessage) {
        self.messages.lock().unwrap().push(message.clone());
    }
    fn on_status(&self, status: &str) {
        self.statuses.lock().unwrap().push(status.to_owned());
    }
}

fn fast_config(dir: &std::path::Path) -> DualSessionConfig {
    DualSessionConfig {
        turn_gap: Duration::from_millis(1),
        retry_backoffs: vec![Duration::ZERO],
        ..DualSessionConfig::new(dir)
    }
}

fn setup(max_turns: usize) -> DebateSetup {
    DebateSetup {
        initial_prompt: "Should we rewrite the parser?".into(),
        role_a: "Optimist".into(),
        prompt_a: "Argue for the rewrite.".into(),
        role_b: "Skeptic".into(),
        prompt_b: "Argue against it.".into(),
        max_turns,
    }
}

#[tokio::test]
async fn terminator_phrase_ends_the_debate() {
    let dir = tempfile::tempdir().unwrap();
    let a = Debater::new("a", &["rewrite it", "the tests will catch regressions"]);
    let b = Debater::new("b", &["too risky", "fine, let's end here"]);
    let collector = Arc::new(Collector::default());
    let session = DualSession::new(a.clone(), b.clone(), fast_config(dir.path())).with_observer(collector.clone());

    session.enable();
    session.start(setup(10)).unwrap();
    session.wait().await;

    let stats = session.stats();
    assert!(!stats.running);
    assert_eq!(stats.current_turn, 4);
    assert_eq!(stats.messages, 4);
    assert_eq!(stats.end_reason, Some(EndReason::Terminator));

    let speakers: Vec<Speaker> = session.log().iter().map(|m| m.speaker).collect();
    assert_eq!(speakers, vec![Speaker::A, Speaker::B, Speaker::A, Speaker::B]);
    assert_eq!(collector.messages.lock().unwrap().len(), 4);

    // Each side hears its role brief only on its first turn, then the other side's reply.
    let a_prompts = a.prompts.lock().unwrap().clone();
    assert!(a_prompts[0].starts_with("[Your role: Optimist]\nArgue for the rewrite."));
    assert!(a_prompts[0].ends_with("Should we rewrite the parser?"));
    assert_eq!(a_prompts[1], "too risky");
    let b_prompts = b.prompts.lock().unwrap().clone();
    assert!(b_prompts[0].starts_with("[Your role: Skeptic]"));
    assert!(b_prompts[0].ends_with("rewrite it"));

    let transcript_path = stats.transcript_path.expect("transcript written");
    assert!(transcript_path.starts_with(dir.path().join("debates")));
    let transcript = std::fs::read_to_string(transcript_path).unwrap();
    assert!(transcript.starts_with("# Debate"));
    assert_eq!(transcript.matches("\n## Turn ").count(), 4);
    assert!(transcript.contains("## Turn 4: Skeptic"));

    let rolling = std::fs::read_to_string(rolling_log_path(dir.path())).unwrap();
    assert_eq!(rolling.lines().filter(|l| l.contains(" turn ")).count(), 4);
}

#[tokio::test]
async fn max_turns_bounds_the_debate() {
    let dir = tempfile::tempdir().unwrap();
    let a = Debater::new("a", &["one", "three"]);
    let b = Debater::new("b", &["two"]);
    let session = DualSession::new(a, b, fast_config(dir.path()));

    session.enable();
    session.start(setup(3)).unwrap();
    session.wait().await;

    let stats = session.stats();
    assert_eq!(stats.current_turn, 3);
    assert_eq!(stats.end_reason, Some(EndReason::MaxTurns));
    assert!(session.progress().contains("after 3 turns"));
}

#[tokio::test]
async fn empty_replies_fail_the_turn_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let a = Debater::new("a", &["", "  ", ""]);
    let b = Debater::new("b", &[]);
    let collector = Arc::new(Collector::default());
    let session = DualSession::new(a.clone(), b, fast_config(dir.path())).with_observer(collector.clone());

    session.enable();
    session.start(setup(6)).unwrap();
    session.wait().await;

    let stats = session.stats();
    assert_eq!(stats.end_reason, Some(EndReason::TurnFailed));
    assert_eq!(stats.retries, 2);
    assert_eq!(a.prompts.lock().unwrap().len(), 3);

    let log = session.log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].speaker, Speaker::System);
    assert_eq!(log[0].content, TURN_FAILED_NOTE);
    assert!(collector.statuses.lock().unwrap().iter().any(|s| s == TURN_FAILED_NOTE));

    let transcript = std::fs::read_to_string(stats.transcript_path.unwrap()).unwrap();
    assert!(transcript.contains(&format!("> **System:** {TURN_FAILED_NOTE}")));
}

#[tokio::test]
async fn stop_interrupts_a_waiting_turn_and_keeps_the_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let a = Debater::new("a", &["opening statement"]);
    let b = Debater::new("b", &[]);
    let session = DualSession::new(a, b.clone(), fast_config(dir.path()));

    session.enable();
    session.start(setup(10)).unwrap();
    while b.prompts.lock().unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(session.is_running());
    assert!(session.progress().contains("Skeptic speaking"));

    session.stop();
    session.wait().await;

    let stats = session.stats();
    assert_eq!(stats.end_reason, Some(EndReason::Stopped));
    assert_eq!(stats.messages, 1);
    assert!(stats.transcript_path.unwrap().exists());
    assert!(!session.is_running());
}

#[tokio::test]
async fn start_is_rejected_when_disabled_or_busy() {
    let dir = tempfile::tempdir().unwrap();
    let session = DualSession::new(Debater::new("a", &[]), Debater::new("b", &[]), fast_config(dir.path()));

    assert!(session.start(setup(4)).is_err());

    session.enable();
    assert!(session.start(setup(0)).is_err());
    let mut blank = setup(4);
    blank.initial_prompt = "   ".into();
    assert!(session.start(blank).is_err());

    session.start(setup(4)).unwrap();
    assert!(session.start(setup(4)).is_err());

    session.disable();
    session.wait().await;
    assert_eq!(session.stats().end_reason, Some(EndReason::Stopped));
}

#[tokio::test]
async fn retried_turn_leaves_a_single_exchange_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let model = Arc::new(
        ScriptedModel::new()
            .then(Outcome::Fail(http_error(429, "rate limit reached, retry after 0 seconds")))
            .then(Outcome::Fail(http_error(429, "rate limit reached, retry after 0 seconds")))
            .then(Outcome::text("rewrite it")),
    );
    let a = Arc::new(agent_with(
        AgentConfig::new("m"),
        MemoryConfig::default(),
        model.clone(),
        ToolRegistry::new(),
    ));
    let b = Debater::new("b", &["goodbye"]);
    let session = DualSession::new(a.clone(), b, fast_config(dir.path()));

    session.enable();
    session.start(setup(10)).unwrap();
    session.wait().await;

    let stats = session.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.current_turn, 2);
    assert_eq!(stats.end_reason, Some(EndReason::Terminator));
    assert_eq!(model.request_count(), 3);

    let history = transcript(&a);
    assert_eq!(history.len(), 2, "history: {history:?}");
    assert_eq!(history[0].0, "user");
    assert!(history[0].1.ends_with("Should we rewrite the parser?"));
    assert_eq!(history[1], ("assistant".to_owned(), "rewrite it".to_owned()));
}
