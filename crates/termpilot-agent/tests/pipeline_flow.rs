//! Planner → researcher → executor → critic runs against scripted agents.

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use termpilot_agent::llm::types::Role;
use termpilot_agent::pipeline::{CRITIC_FEEDBACK_HEADER, MAX_RETRIES_PREFIX};
use termpilot_agent::tools::ToolFilter;
use termpilot_agent::{
    AgentConfig, AgentError, BrainFileSink, MemoryConfig, Pipeline, PipelineConfig, PipelineRole, Result,
    ToolRegistry, TurnAgent,
};

use common::{Outcome, ScriptedModel, agent_with, transcript};

/// Answers each role with a fixed line; critic replies are scripted.
struct RoleAgent {
    critic: Mutex<VecDeque<String>>,
    calls: Mutex<Vec<(String, String, ToolFilter)>>,
}

impl RoleAgent {
    fn new(critic_replies: &[&str]) -> Self {
        Self {
            critic: Mutex::new(critic_replies.iter().map(|s| s.to_string()).collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn roles_called(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(role, _, _)| role.clone()).collect()
    }

    fn inputs_for(&self, role: PipelineRole) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _, _)| r == role.label())
            .map(|(_, input, _)| input.clone())
            .collect()
    }
}

#[async_trait]
impl TurnAgent for RoleAgent {
    fn name(&self) -> String {
        "role-agent".into()
    }

    async fn chat(&self, _text: &str, _cancel: &CancellationToken) -> Result<String> {
        Err(AgentError::Internal("chat is not used by the pipeline".into()))
    }

    async fn run_role(
        &self,
        system_prompt: &str,
        input: &str,
        tools: ToolFilter,
        _cancel: &CancellationToken,
    ) -> Result<String> {
        let role = PipelineRole::ALL
            .into_iter()
            .find(|r| r.system_prompt() == system_prompt)
            .ok_or_else(|| AgentError::Internal("unknown role prompt".into()))?;
        self.calls
            .lock()
            .unwrap()
            .push((role.label().to_owned(), input.to_owned(), tools));
        Ok(match role {
            PipelineRole::Planner => "1. write the function".into(),
            PipelineRole::Researcher => "- src/lib.rs holds the module".into(),
            PipelineRole::Executor => "added the function".into(),
            PipelineRole::Critic => self.critic.lock().unwrap().pop_front().unwrap_or_default(),
        })
    }

    fn last_activity(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }
}

#[tokio::test(start_paused = true)]
async fn critic_rejection_then_approval() {
    let dir = tempfile::tempdir().unwrap();
    let agent = RoleAgent::new(&[
        r#"{"approved":false,"feedback":"missing test","response":""}"#,
        r#"{"approved":true,"feedback":"ok","response":"Final answer F"}"#,
    ]);
    let sink = Arc::new(BrainFileSink::new(dir.path()));
    let pipeline = Pipeline::new(PipelineConfig::default()).with_sink(sink.clone());

    let started = Instant::now();
    let answer = pipeline
        .run(&agent, "add a helper for parsing dates", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(answer, "Final answer F");

    // Two full passes, each role in order.
    let roles = agent.roles_called();
    assert_eq!(roles.len(), 8);
    assert_eq!(&roles[..4], &["Planner", "Researcher", "Executor", "Critic"]);
    assert_eq!(&roles[4..], &roles[..4]);

    // Seven gaps separate eight role calls.
    assert!(started.elapsed() >= Duration::from_millis(1500) * 7);

    // The second planner pass sees the critic's feedback.
    let planner_inputs = agent.inputs_for(PipelineRole::Planner);
    assert!(!planner_inputs[0].contains(CRITIC_FEEDBACK_HEADER));
    assert!(planner_inputs[1].contains(CRITIC_FEEDBACK_HEADER));
    assert!(planner_inputs[1].contains("missing test"));

    // The critic sees every earlier output.
    let critic_input = &agent.inputs_for(PipelineRole::Critic)[0];
    assert!(critic_input.contains("added the function"));
    assert!(critic_input.contains("src/lib.rs holds the module"));

    let brain = std::fs::read_to_string(sink.path()).unwrap();
    assert!(brain.contains("## Pipeline: add a helper for parsing dates"));
    assert!(brain.contains("Final answer F"));
}

#[tokio::test(start_paused = true)]
async fn role_tool_access_follows_role() {
    let agent = RoleAgent::new(&[r#"{"approved":true,"feedback":"","response":"done"}"#]);
    let pipeline = Pipeline::new(PipelineConfig::default());
    pipeline.run(&agent, "tidy up", &CancellationToken::new()).await.unwrap();

    let filters: Vec<ToolFilter> = agent.calls.lock().unwrap().iter().map(|(_, _, f)| *f).collect();
    assert_eq!(
        filters,
        vec![ToolFilter::None, ToolFilter::ReadOnly, ToolFilter::All, ToolFilter::None]
    );
}

#[tokio::test(start_paused = true)]
async fn rejection_on_every_attempt_reports_last_feedback() {
    let dir = tempfile::tempdir().unwrap();
    let agent = RoleAgent::new(&[
        r#"{"approved":false,"feedback":"first issue"}"#,
        r#"{"approved":false,"feedback":"still no tests"}"#,
    ]);
    let sink = Arc::new(BrainFileSink::new(dir.path()));
    let pipeline = Pipeline::new(PipelineConfig::default()).with_sink(sink.clone());

    let answer = pipeline.run(&agent, "ship it", &CancellationToken::new()).await.unwrap();
    assert_eq!(answer, format!("{MAX_RETRIES_PREFIX} still no tests"));
    assert_eq!(agent.roles_called().len(), 8);
    assert!(!sink.path().exists());
}

#[tokio::test(start_paused = true)]
async fn approval_without_response_uses_executor_output() {
    let agent = RoleAgent::new(&[r#"Looks good: {"approved": true}"#]);
    let pipeline = Pipeline::new(PipelineConfig::default());
    let answer = pipeline.run(&agent, "do it", &CancellationToken::new()).await.unwrap();
    assert_eq!(answer, "added the function");
}

#[tokio::test]
async fn cancellation_between_roles_stops_the_run() {
    let agent = RoleAgent::new(&[]);
    let pipeline = Pipeline::new(PipelineConfig {
        role_gap: Duration::from_secs(60),
        ..PipelineConfig::default()
    });
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pipeline.run(&agent, "anything", &cancel).await.unwrap_err();
    assert!(err.is_canceled());
    // Only the first role ran before the gap observed the cancellation.
    assert!(agent.roles_called().len() <= 1);
}

#[tokio::test]
async fn enabled_pipeline_answers_through_roles_and_records_exchange() {
    let model = Arc::new(
        ScriptedModel::new()
            .then(Outcome::text("plan"))
            .then(Outcome::text("facts"))
            .then(Outcome::text("work done"))
            .then(Outcome::text(r#"{"approved":true,"feedback":"","response":"all set"}"#)),
    );
    let agent = agent_with(AgentConfig::new("m"), MemoryConfig::default(), model.clone(), ToolRegistry::new());
    agent.set_pipeline_enabled(true);
    let pipeline = Pipeline::new(PipelineConfig {
        role_gap: Duration::ZERO,
        ..PipelineConfig::default()
    });

    let answer = agent.respond(&pipeline, "fix the build", &CancellationToken::new()).await.unwrap();
    assert_eq!(answer, "all set");

    // Each role request starts with its own system prompt.
    let requests = model.requests.lock().unwrap();
    assert_eq!(requests.len(), 4);
    for (request, role) in requests.iter().zip(PipelineRole::ALL) {
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[0].content, role.system_prompt());
    }
    drop(requests);

    // Role scratch histories stay out of memory; only the exchange lands.
    assert_eq!(
        transcript(&agent),
        vec![
            ("user".to_owned(), "fix the build".to_owned()),
            ("assistant".to_owned(), "all set".to_owned()),
        ]
    );
}
