//! Model self-configuration interview.
//!
//! The model is asked, in a short structured prompt, for the sampling
//! parameters it works best with. Answers are parsed as strict JSON and
//! range-checked; anything unusable falls back to a static profile.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::llm::client::ChatModel;
use crate::llm::types::{ChatRequest, Message};

const INTERVIEW_PROMPT: &str = "Reply with ONLY a JSON object, no prose, describing the settings \
you work best with as a coding assistant: \
{\"temperature\": <0-2>, \"top_p\": <0-1>, \"max_tokens\": <max output tokens>, \
\"context_window\": <total context tokens>}";

/// Sampling parameters a model reported for itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSelfConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub context_window: u64,
    /// False when the values come from the static profile.
    #[serde(default)]
    pub from_model: bool,
}

#[derive(Deserialize)]
struct RawAnswer {
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
    context_window: u64,
}

/// Parse and validate an interview answer.
pub fn parse_self_config(text: &str) -> Result<ModelSelfConfig> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(AgentError::LlmParseFailed {
            reason: "interview answer has no JSON object".into(),
        });
    };
    if end < start {
        return Err(AgentError::LlmParseFailed {
            reason: "interview answer has no JSON object".into(),
        });
    }
    let raw: RawAnswer =
        serde_json::from_str(&text[start..=end]).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("interview answer is not valid JSON: {e}"),
        })?;

    let invalid = |field: &str, reason: String| AgentError::ValidationError {
        field: field.into(),
        reason,
    };
    if !(0.0..=2.0).contains(&raw.temperature) {
        return Err(invalid("temperature", format!("{} is outside [0, 2]", raw.temperature)));
    }
    if !(0.0..=1.0).contains(&raw.top_p) {
        return Err(invalid("top_p", format!("{} is outside [0, 1]", raw.top_p)));
    }
    if raw.max_tokens == 0 {
        return Err(invalid("max_tokens", "must be at least 1".into()));
    }
    if raw.context_window < u64::from(raw.max_tokens) {
        return Err(invalid(
            "context_window",
            format!("{} is smaller than max_tokens", raw.context_window),
        ));
    }

    Ok(ModelSelfConfig {
        temperature: raw.temperature,
        top_p: raw.top_p,
        max_tokens: raw.max_tokens,
        context_window: raw.context_window,
        from_model: true,
    })
}

/// Conservative defaults keyed on the model family.
pub fn static_profile(model: &str) -> ModelSelfConfig {
    let m = model.to_ascii_lowercase();
    let (max_tokens, context_window) = if m.starts_with("claude") {
        (8_192, 200_000)
    } else if m.starts_with("gemini") {
        (8_192, 1_000_000)
    } else if m.starts_with("gpt-4o") || m.starts_with("gpt-4.1") || m.starts_with("gpt-5") {
        (16_384, 128_000)
    } else if m.contains("deepseek") {
        (8_192, 64_000)
    } else {
        (4_096, 32_000)
    };
    ModelSelfConfig {
        temperature: 0.7,
        top_p: 1.0,
        max_tokens,
        context_window,
        from_model: false,
    }
}

/// Ask `model` for its preferred settings, falling back to
/// [`static_profile`] on any failure.
pub async fn interview(model: &dyn ChatModel, model_id: &str, cancel: &CancellationToken) -> ModelSelfConfig {
    let mut request = ChatRequest::new(
        model_id,
        vec![
            Message::system("You answer configuration questions with strict JSON."),
            Message::user(INTERVIEW_PROMPT),
        ],
    );
    request.temperature = Some(0.0);
    request.max_tokens = Some(200);

    match model.complete(&request, cancel).await {
        Ok(resp) => match parse_self_config(&resp.message.content) {
            Ok(config) => {
                tracing::info!(model = model_id, ?config, "model interview succeeded");
                config
            }
            Err(e) => {
                tracing::warn!(model = model_id, error = %e, "unusable interview answer, using static profile");
                static_profile(model_id)
            }
        },
        Err(e) => {
            tracing::warn!(model = model_id, error = %e, "model interview failed, using static profile");
            static_profile(model_id)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
