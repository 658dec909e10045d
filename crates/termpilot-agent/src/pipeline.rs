//! Planner, researcher, executor and critic in a fixed sequence.
//!
//! Each role is one [`TurnAgent::run_role`] call on the same agent, so
//! role turns share its model, tools and usage counters but not its
//! conversation memory. The critic answers with a JSON verdict; a
//! rejection reruns all four roles with the critic's feedback attached.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, TurnAgent};
use crate::error::{AgentError, Result};
use crate::recovery::{error_log, sleep_or_cancel};
use crate::tools::ToolFilter;

/// Minimum pause between two role calls.
pub const DEFAULT_ROLE_GAP: Duration = Duration::from_millis(1500);

/// Role inputs longer than this are cut in the middle.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 12_000;

pub const DEFAULT_MAX_ATTEMPTS: usize = 2;

pub const CRITIC_FEEDBACK_HEADER: &str = "[Critic feedback from previous attempt]";

pub const MAX_RETRIES_PREFIX: &str = "[Pipeline: max retries reached]";

const TRUNCATION_MARKER: &str = "\n\n[... truncated ...]\n\n";

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRole {
    Planner,
    Researcher,
    Executor,
    Critic,
}

impl PipelineRole {
    pub const ALL: [PipelineRole; 4] = [Self::Planner, Self::Researcher, Self::Executor, Self::Critic];

    pub fn label(self) -> &'static str {
        match self {
            Self::Planner => "Planner",
            Self::Researcher => "Researcher",
            Self::Executor => "Executor",
            Self::Critic => "Critic",
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::Planner => {
                "You are the Planner. Read the user's request and produce a short numbered plan \
                 of concrete steps. Do not carry out the steps and do not call tools. Output only the plan."
            }
            Self::Researcher => {
                "You are the Researcher. Gather the facts the plan depends on: relevant files, \
                 definitions, current behaviour and constraints. You may use read-only tools. \
                 Report findings as concise bullet points with file paths."
            }
            Self::Executor => {
                "You are the Executor. Carry out the plan using the research. You may use any tool. \
                 Make the changes, then report exactly what you did and the result."
            }
            Self::Critic => {
                "You are the Critic. Check whether the executor's work fully answers the user's \
                 request. Reply with a single JSON object and nothing else: \
                 {\"approved\": true|false, \"feedback\": \"what is missing or wrong\", \
                 \"response\": \"the final answer for the user when approved\"}."
            }
        }
    }

    /// Tools the role may call.
    pub fn tools(self) -> ToolFilter {
        match self {
            Self::Planner | Self::Critic => ToolFilter::None,
            Self::Researcher => ToolFilter::ReadOnly,
            Self::Executor => ToolFilter::All,
        }
    }
}

impl fmt::Display for PipelineRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Critic verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticVerdict {
    #[serde(default)]
    pub approved: bool,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub response: String,
}

/// Parse the critic's reply.
///
/// The JSON object is taken from the first `{` to the last `}`. Output
/// that does not parse counts as approval with the raw text as the answer.
pub fn parse_critic(raw: &str) -> CriticVerdict {
    let parsed = match (raw.find('{'), raw.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str::<CriticVerdict>(&raw[start..=end]).ok(),
        _ => None,
    };
    parsed.unwrap_or_else(|| {
        tracing::debug!("critic reply is not a JSON verdict, treating as approval");
        CriticVerdict {
            approved: true,
            feedback: String::new(),
            response: raw.trim().to_owned(),
        }
    })
}

/// Keep the head and tail of `text` within `max_chars`. Below the marker's
/// own length only the head survives, unmarked.
pub fn truncate_middle(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_owned();
    }
    if max_chars <= TRUNCATION_MARKER.chars().count() {
        return text.chars().take(max_chars).collect();
    }
    let keep = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let head_len = keep / 2;
    let tail_len = keep - head_len;
    let head: String = text.chars().take(head_len).collect();
    let tail: String = text.chars().skip(count - tail_len).collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

fn compose_input(request: &str, outputs: &[(PipelineRole, String)], feedback: Option<&str>) -> String {
    let mut input = request.trim().to_owned();
    for (role, output) in outputs {
        input.push_str(&format!("\n\n[{role} output]\n{}", output.trim()));
    }
    if let Some(feedback) = feedback {
        input.push_str(&format!("\n\n{CRITIC_FEEDBACK_HEADER}\n{}", feedback.trim()));
    }
    input
}

// ---------------------------------------------------------------------------
// Insight sink
// ---------------------------------------------------------------------------

/// A finished pipeline run, worth remembering across sessions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Insight {
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait InsightSink: Send + Sync {
    async fn record(&self, insight: &Insight) -> Result<()>;
}

/// Appends insights as Markdown sections to `<workplace>/brain.md`.
#[derive(Debug, Clone)]
pub struct BrainFileSink {
    path: PathBuf,
}

impl BrainFileSink {
    pub fn new(workplace: impl AsRef<Path>) -> Self {
        Self {
            path: workplace.as_ref().join("brain.md"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl InsightSink for BrainFileSink {
    async fn record(&self, insight: &Insight) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let entry = format!(
            "\n## {}\n_{}_\n\n{}\n",
            insight.title,
            insight.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            insight.body.trim()
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub max_attempts: usize,
    pub role_gap: Duration,
    pub max_input_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            role_gap: DEFAULT_ROLE_GAP,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }
}

#[derive(Default, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    sink: Option<Arc<dyn InsightSink>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config, sink: None }
    }

    pub fn with_sink(mut self, sink: Arc<dyn InsightSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the four roles on `request`, retrying on critic rejection.
    pub async fn run(&self, agent: &dyn TurnAgent, request: &str, cancel: &CancellationToken) -> Result<String> {
        if request.trim().is_empty() {
            return Err(AgentError::EmptyMessage);
        }
        let attempts = self.config.max_attempts.max(1);
        let mut feedback: Option<String> = None;
        let mut first_call = true;

        for attempt in 1..=attempts {
            tracing::info!(agent = %agent.name(), attempt, max = attempts, "pipeline attempt started");
            let mut outputs: Vec<(PipelineRole, String)> = Vec::with_capacity(PipelineRole::ALL.len());

            for role in PipelineRole::ALL {
                if !first_call {
                    sleep_or_cancel(self.config.role_gap, cancel).await?;
                }
                first_call = false;

                let input = truncate_middle(
                    &compose_input(request, &outputs, feedback.as_deref()),
                    self.config.max_input_chars,
                );
                tracing::debug!(role = %role, chars = input.len(), "running pipeline role");
                let output = agent
                    .run_role(role.system_prompt(), &input, role.tools(), cancel)
                    .await
                    .map_err(|e| match e {
                        AgentError::Canceled => e,
                        other => AgentError::PipelineFailed {
                            reason: format!("{role} failed: {other}"),
                        },
                    })?;
                outputs.push((role, output));
            }

            let critic_raw = outputs.last().map(|(_, out)| out.as_str()).unwrap_or_default();
            let verdict = parse_critic(critic_raw);
            if verdict.approved {
                let answer = if verdict.response.trim().is_empty() {
                    outputs
                        .iter()
                        .find(|(role, _)| *role == PipelineRole::Executor)
                        .map(|(_, out)| out.clone())
                        .unwrap_or_default()
                } else {
                    verdict.response
                };
                tracing::info!(attempt, "pipeline approved");
                self.record_insight(request, &answer, attempt).await;
                return Ok(answer);
            }

            tracing::info!(attempt, feedback = %verdict.feedback, "critic rejected pipeline attempt");
            feedback = Some(verdict.feedback);
        }

        Ok(format!("{MAX_RETRIES_PREFIX} {}", feedback.unwrap_or_default().trim()))
    }

    async fn record_insight(&self, request: &str, answer: &str, attempts: usize) {
        let Some(sink) = &self.sink else { return };
        let summary: String = request.trim().lines().next().unwrap_or_default().chars().take(60).collect();
        let insight = Insight {
            title: format!("Pipeline: {summary}"),
            body: format!(
                "**Request:** {}\n\n**Attempts:** {attempts}\n\n**Answer:**\n{}",
                request.trim(),
                answer.trim()
            ),
            created_at: Utc::now(),
        };
        if let Err(e) = sink.record(&insight).await {
            tracing::warn!(error = %e, "failed to record pipeline insight");
            error_log::global().record(&e, "pipeline insight", "pipeline.record_insight", true);
        }
    }
}

impl Agent {
    /// Answer `text` through the pipeline when it is enabled, otherwise
    /// through a regular turn. Pipeline exchanges are recorded in memory.
    pub async fn respond(&self, pipeline: &Pipeline, text: &str, cancel: &CancellationToken) -> Result<String> {
        if !self.pipeline_enabled() {
            return self.chat(text, cancel).await;
        }
        let answer = pipeline.run(self, text, cancel).await?;
        self.record_exchange(text, &answer);
        Ok(answer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critic_json_is_extracted_from_surrounding_text() {
        let v = parse_critic("Here you go:\n```json\n{\"approved\": false, \"feedback\": \"add tests\", \"response\": \"\"}\n```");
        assert!(!v.approved);
        assert_eq!(v.feedback, "add tests");
    }

    #[test]
    fn unparseable_critic_output_is_approval() {
        let v = parse_critic("Looks great, ship it.");
        assert!(v.approved);
        assert_eq!(v.response, "Looks great, ship it.");

        let v = parse_critic("{not json}");
        assert!(v.approved);
        assert_eq!(v.response, "{not json}");
    }

    #[test]
    fn truncation_keeps_both_ends() {
        let text = format!("{}{}", "a".repeat(100), "z".repeat(100));
        let cut = truncate_middle(&text, 80);
        assert!(cut.chars().count() <= 80);
        assert!(cut.starts_with('a'));
        assert!(cut.ends_with('z'));
        assert!(cut.contains("[... truncated ...]"));
        assert_eq!(truncate_middle("short", 80), "short");
    }

    #[test]
    fn truncation_below_marker_length_stays_within_limit() {
        let text = "x".repeat(200);
        for max in [0, 1, 10, TRUNCATION_MARKER.chars().count()] {
            let cut = truncate_middle(&text, max);
            assert_eq!(cut.chars().count(), max);
            assert!(!cut.contains("truncated"));
        }
        let cut = truncate_middle(&text, TRUNCATION_MARKER.chars().count() + 2);
        assert_eq!(cut.chars().count(), TRUNCATION_MARKER.chars().count() + 2);
        assert!(cut.contains("[... truncated ...]"));
    }

    #[test]
    fn input_carries_prior_outputs_then_feedback() {
        let outputs = vec![(PipelineRole::Planner, "1. do it".to_owned())];
        let input = compose_input("fix bug", &outputs, Some("missing test"));
        let plan = input.find("[Planner output]").unwrap();
        let fb = input.find(CRITIC_FEEDBACK_HEADER).unwrap();
        assert!(input.starts_with("fix bug"));
        assert!(plan < fb);
    }

    #[test]
    fn role_tool_access() {
        assert_eq!(PipelineRole::Researcher.tools(), ToolFilter::ReadOnly);
        assert_eq!(PipelineRole::Executor.tools(), ToolFilter::All);
        assert_eq!(PipelineRole::Critic.tools(), ToolFilter::None);
    }

    #[tokio::test]
    async fn brain_sink_appends_entries() {
        let dir = tempfile::tempdir().unwrap();
        let sink = BrainFileSink::new(dir.path());
        for n in 0..2 {
            let insight = Insight {
                title: format!("Pipeline: run {n}"),
                body: "answer".into(),
                created_at: Utc::now(),
            };
            sink.record(&insight).await.unwrap();
        }
        let text = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(text.matches("## Pipeline:").count(), 2);
    }
}
