//! Provider catalog and adapter auto-detection.

use serde::{Deserialize, Serialize};

/// Prefix of Anthropic OAuth access tokens.
pub const ANTHROPIC_OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat";

/// Prefix of Anthropic API keys (and OAuth tokens).
pub const ANTHROPIC_KEY_PREFIX: &str = "sk-ant-";

// ---------------------------------------------------------------------------
// Families and auth modes
// ---------------------------------------------------------------------------

/// Wire-protocol family spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// OpenAI Chat Completions and compatible endpoints.
    OpenAi,
    /// Anthropic Messages API.
    Anthropic,
    /// Google Generative Language API.
    Google,
}

impl ProviderFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }

    /// Parse a family or provider name.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        if let Some(option) = find(&lower) {
            return Some(option.family);
        }
        match lower.as_str() {
            "openai" | "openai-style" | "openai_compatible" => Some(Self::OpenAi),
            "anthropic" | "anthropic-style" | "claude" => Some(Self::Anthropic),
            "google" | "google-style" | "gemini" => Some(Self::Google),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a provider expects to be authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    None,
    ApiKey,
    OAuth,
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A selectable provider endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProviderOption {
    pub id: &'static str,
    pub label: &'static str,
    pub family: ProviderFamily,
    pub base_url: &'static str,
    pub auth_mode: AuthMode,
    /// OAuth strategy id in the token refresher, for OAuth providers.
    pub oauth_provider: Option<&'static str>,
    /// Model used when none is configured.
    pub default_model: &'static str,
}

/// Every provider the client knows how to reach.
pub const PROVIDERS: &[ProviderOption] = &[
    ProviderOption {
        id: "openai",
        label: "OpenAI",
        family: ProviderFamily::OpenAi,
        base_url: "https://api.openai.com/v1",
        auth_mode: AuthMode::ApiKey,
        oauth_provider: None,
        default_model: "gpt-4o-mini",
    },
    ProviderOption {
        id: "anthropic",
        label: "Anthropic (API key)",
        family: ProviderFamily::Anthropic,
        base_url: "https://api.anthropic.com",
        auth_mode: AuthMode::ApiKey,
        oauth_provider: None,
        default_model: "claude-sonnet-4-20250514",
    },
    ProviderOption {
        id: "anthropic-oauth",
        label: "Anthropic (Claude subscription)",
        family: ProviderFamily::Anthropic,
        base_url: "https://api.anthropic.com",
        auth_mode: AuthMode::OAuth,
        oauth_provider: Some("anthropic"),
        default_model: "claude-sonnet-4-20250514",
    },
    ProviderOption {
        id: "google",
        label: "Google Gemini",
        family: ProviderFamily::Google,
        base_url: "https://generativelanguage.googleapis.com/v1beta",
        auth_mode: AuthMode::ApiKey,
        oauth_provider: None,
        default_model: "gemini-2.5-flash",
    },
    ProviderOption {
        id: "nvidia",
        label: "NVIDIA NIM",
        family: ProviderFamily::OpenAi,
        base_url: "https://integrate.api.nvidia.com/v1",
        auth_mode: AuthMode::ApiKey,
        oauth_provider: None,
        default_model: "meta/llama-3.1-70b-instruct",
    },
    ProviderOption {
        id: "deepseek",
        label: "DeepSeek",
        family: ProviderFamily::OpenAi,
        base_url: "https://api.deepseek.com/v1",
        auth_mode: AuthMode::ApiKey,
        oauth_provider: None,
        default_model: "deepseek-chat",
    },
    ProviderOption {
        id: "openrouter",
        label: "OpenRouter",
        family: ProviderFamily::OpenAi,
        base_url: "https://openrouter.ai/api/v1",
        auth_mode: AuthMode::ApiKey,
        oauth_provider: None,
        default_model: "openai/gpt-4o-mini",
    },
    ProviderOption {
        id: "groq",
        label: "Groq",
        family: ProviderFamily::OpenAi,
        base_url: "https://api.groq.com/openai/v1",
        auth_mode: AuthMode::ApiKey,
        oauth_provider: None,
        default_model: "llama-3.3-70b-versatile",
    },
    ProviderOption {
        id: "ollama",
        label: "Ollama (local)",
        family: ProviderFamily::OpenAi,
        base_url: "http://localhost:11434/v1",
        auth_mode: AuthMode::None,
        oauth_provider: None,
        default_model: "llama3.2",
    },
    ProviderOption {
        id: "openai-codex-oauth",
        label: "OpenAI (ChatGPT subscription)",
        family: ProviderFamily::OpenAi,
        base_url: "https://chatgpt.com/backend-api/codex",
        auth_mode: AuthMode::OAuth,
        oauth_provider: Some("openai-codex"),
        default_model: "gpt-5-codex",
    },
];

/// Look up a catalog entry by id.
pub fn find(id: &str) -> Option<&'static ProviderOption> {
    PROVIDERS.iter().find(|p| p.id.eq_ignore_ascii_case(id.trim()))
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Whether `key` is an Anthropic OAuth access token.
pub fn is_oauth_token(key: &str) -> bool {
    key.starts_with(ANTHROPIC_OAUTH_TOKEN_PREFIX)
}

/// Pick the wire family for a configuration.
///
/// An explicit provider name wins, then a `claude` model prefix, then an
/// `sk-ant-` key prefix; everything else speaks the OpenAI protocol.
pub fn detect_family(explicit: Option<&str>, model: &str, api_key: &str) -> ProviderFamily {
    if let Some(family) = explicit
        .filter(|p| !p.trim().is_empty())
        .and_then(ProviderFamily::from_name)
    {
        return family;
    }
    if model.trim().to_ascii_lowercase().starts_with("claude") {
        return ProviderFamily::Anthropic;
    }
    if api_key.starts_with(ANTHROPIC_KEY_PREFIX) {
        return ProviderFamily::Anthropic;
    }
    ProviderFamily::OpenAi
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
