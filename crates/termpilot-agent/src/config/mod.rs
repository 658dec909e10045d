//! Configuration loading and validation.
//!
//! One JSON document, taken from the first of: the path given on the
//! command line, `./config.json`, `<home>/.termpilot/config.json`. A
//! missing file yields defaults. Environment variables override the file,
//! and a `.env` file may supply whitelisted variables that the process
//! environment does not already set.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentConfig, DEFAULT_MAX_TOOL_ITERATIONS};
use crate::error::{AgentError, Result};
use crate::llm::client::LlmClientConfig;
use crate::llm::provider::{self, AuthMode, ProviderFamily};
use crate::llm::types::ReasoningEffort;
use crate::memory::MemoryConfig;
use crate::prompt::PromptProfile;
use crate::tools::executor::DEFAULT_TOOL_TIMEOUT;
use crate::tools::permissions::PermissionPolicy;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const CONFIG_DIR_NAME: &str = ".termpilot";

/// Variables a `.env` file is allowed to provide.
pub const DOTENV_WHITELIST: &[&str] = &[
    "API_KEY",
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "NVIDIA_API_KEY",
    "API_BASE_URL",
    "OPENAI_BASE_URL",
    "MODEL",
    "OPENAI_MODEL",
    "PROVIDER",
    "TELEGRAM_BOT_TOKEN",
    "TELEGRAM_CHAT_ID",
    "VERBOSE",
];

pub const DEFAULT_MAX_CONTEXT_SIZE: usize = 128_000;

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: String,
    pub api_base_url: String,
    pub api_key: Option<String>,
    /// Catalog id or adapter family; detected when absent.
    pub provider: Option<String>,
    pub fallback_models: Vec<String>,
    /// Seconds without stream bytes before switching model.
    pub fallback_timeout: u64,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Informational; the engine does not count tokens.
    pub max_context_size: usize,
    pub memory: MemoryConfig,
    pub permissions: PermissionPolicy,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Seconds; 0 disables. Consumed by the host application.
    pub heartbeat_interval: u64,
    pub max_tool_iterations: usize,
    pub history_window: usize,
    /// Per-tool handler timeout in seconds.
    pub tool_timeout: u64,
    /// Wrap the tool executor in the retrying executor.
    pub intelligent_retry: bool,
    /// Directory for transcripts and the brain file. Defaults to the
    /// working directory.
    pub workplace: Option<PathBuf>,
    pub profile: PromptProfile,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: String::new(),
            api_base_url: String::new(),
            api_key: None,
            provider: None,
            fallback_models: Vec::new(),
            fallback_timeout: 30,
            temperature: None,
            top_p: None,
            max_tokens: None,
            max_context_size: DEFAULT_MAX_CONTEXT_SIZE,
            memory: MemoryConfig::default(),
            permissions: PermissionPolicy::default(),
            reasoning_effort: None,
            heartbeat_interval: 0,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            history_window: 40,
            tool_timeout: DEFAULT_TOOL_TIMEOUT.as_secs(),
            intelligent_retry: false,
            workplace: None,
            profile: PromptProfile::default(),
        }
    }
}

/// A loaded configuration and the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: Config,
    pub source: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Process environment layered over whitelisted `.env` values.
#[derive(Debug, Clone, Default)]
pub struct Env {
    dotenv: HashMap<String, String>,
    overrides: Option<HashMap<String, String>>,
}

impl Env {
    /// Process environment only.
    pub fn process() -> Self {
        Self::default()
    }

    /// Process environment plus whitelisted keys from the `.env` file at
    /// `path`. A missing file is not an error.
    pub fn with_dotenv(path: &Path) -> Result<Self> {
        let mut env = Self::default();
        if !path.exists() {
            return Ok(env);
        }
        let iter = dotenvy::from_path_iter(path).map_err(|e| AgentError::ConfigError {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        for item in iter {
            let (key, value) = item.map_err(|e| AgentError::ConfigError {
                reason: format!("malformed {}: {e}", path.display()),
            })?;
            if DOTENV_WHITELIST.contains(&key.as_str()) {
                env.dotenv.insert(key, value);
            } else {
                tracing::debug!(key = %key, "ignoring non-whitelisted .env key");
            }
        }
        tracing::debug!(path = %path.display(), keys = env.dotenv.len(), "loaded .env");
        Ok(env)
    }

    /// A fixed map that replaces the process environment.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            dotenv: HashMap::new(),
            overrides: Some(vars),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let from_process = match &self.overrides {
            Some(vars) => vars.get(key).cloned(),
            None => std::env::var(key).ok(),
        };
        from_process
            .or_else(|| self.dotenv.get(key).cloned())
            .filter(|v| !v.trim().is_empty())
    }

    fn first(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.get(k))
    }

    /// Whether `VERBOSE` is set to something truthy.
    pub fn verbose(&self) -> bool {
        self.get("VERBOSE")
            .is_some_and(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
    }
}

/// `HOME`, or `USERPROFILE` on Windows.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// `<home>/.termpilot`.
pub fn config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(CONFIG_DIR_NAME))
}

/// Files tried in load order.
pub fn candidate_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(p) = explicit {
        paths.push(p.to_path_buf());
    }
    paths.push(PathBuf::from(CONFIG_FILE_NAME));
    if let Some(dir) = config_dir() {
        paths.push(dir.join(CONFIG_FILE_NAME));
    }
    paths
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load, apply `env`, fill provider defaults and validate.
    pub fn load(explicit: Option<&Path>, env: &Env) -> Result<LoadedConfig> {
        if let Some(path) = explicit
            && !path.exists()
        {
            return Err(AgentError::ConfigError {
                reason: format!("config file {} does not exist", path.display()),
            });
        }

        let source = candidate_paths(explicit).into_iter().find(|p| p.is_file());
        let mut config = match &source {
            Some(path) => Self::load_from_file(path)?,
            None => {
                tracing::debug!("no config file found, using defaults");
                Self::default()
            }
        };
        config.apply_env(env);
        config.fill_provider_defaults();
        config.validate()?;
        if let Some(path) = &source {
            tracing::info!(path = %path.display(), model = %config.model, "configuration loaded");
        }
        Ok(LoadedConfig { config, source })
    }

    /// Parse one file. An empty file yields defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&text).map_err(|e| AgentError::ConfigError {
            reason: format!("malformed {}: {e}", path.display()),
        })
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self, env: &Env) {
        if let Some(provider) = env.get("PROVIDER") {
            self.provider = Some(provider);
        }
        if let Some(url) = env.first(&["API_BASE_URL", "OPENAI_BASE_URL"]) {
            self.api_base_url = url;
        }
        if let Some(model) = env.first(&["MODEL", "OPENAI_MODEL"]) {
            self.model = model;
        }

        if let Some(key) = self.family_key(env) {
            self.api_key = Some(key);
        } else if self.api_key.as_deref().is_none_or(|k| k.trim().is_empty())
            && let Some(key) = env.first(&["OPENAI_API_KEY", "ANTHROPIC_API_KEY", "NVIDIA_API_KEY"])
        {
            self.api_key = Some(key);
        }
    }

    /// `API_KEY`, else the key variable of this configuration's family.
    fn family_key(&self, env: &Env) -> Option<String> {
        let family_key = match self.key_provider() {
            KeyProvider::Anthropic => "ANTHROPIC_API_KEY",
            KeyProvider::Nvidia => "NVIDIA_API_KEY",
            _ => "OPENAI_API_KEY",
        };
        env.first(&["API_KEY", family_key])
    }

    /// This configuration re-pointed at catalog provider `id`, on its
    /// default base URL and model unless `model` names one. The current key
    /// carries over only within the same key family.
    pub fn switched_to(&self, id: &str, model: Option<&str>, env: &Env) -> Result<Config> {
        let option = provider::find(id).ok_or_else(|| invalid("provider", &format!("unknown provider `{id}`")))?;
        let mut next = self.clone();
        next.provider = Some(option.id.to_owned());
        next.api_base_url = option.base_url.to_owned();
        next.model = model.unwrap_or(option.default_model).to_owned();
        next.api_key = match option.auth_mode {
            AuthMode::ApiKey => next.family_key(env).or_else(|| {
                (next.key_provider() == self.key_provider())
                    .then(|| self.api_key.clone())
                    .flatten()
            }),
            AuthMode::None | AuthMode::OAuth => None,
        };
        next.validate()?;
        Ok(next)
    }

    /// Fill the base URL and model from the provider catalog when the
    /// document leaves them out.
    pub fn fill_provider_defaults(&mut self) {
        let Some(option) = self.provider.as_deref().and_then(provider::find) else {
            return;
        };
        if self.api_base_url.trim().is_empty() {
            self.api_base_url = option.base_url.to_owned();
        }
        if self.model.trim().is_empty() {
            self.model = option.default_model.to_owned();
        }
    }

    fn auth_mode(&self) -> AuthMode {
        self.provider
            .as_deref()
            .and_then(provider::find)
            .map(|p| p.auth_mode)
            .unwrap_or(AuthMode::ApiKey)
    }

    fn key_provider(&self) -> KeyProvider {
        if let Some(p) = self.provider.as_deref() {
            let lower = p.trim().to_ascii_lowercase();
            if lower == "nvidia" {
                return KeyProvider::Nvidia;
            }
            if lower == "openai" {
                return KeyProvider::OpenAi;
            }
            if lower.starts_with("anthropic") || lower == "claude" {
                return KeyProvider::Anthropic;
            }
            return KeyProvider::Other;
        }
        let host = url::Url::parse(&self.api_base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_default();
        if host.ends_with("anthropic.com") || self.model.to_ascii_lowercase().starts_with("claude") {
            KeyProvider::Anthropic
        } else if host.ends_with("nvidia.com") {
            KeyProvider::Nvidia
        } else if host.ends_with("openai.com") {
            KeyProvider::OpenAi
        } else {
            KeyProvider::Other
        }
    }

    // -- validation ----------------------------------------------------------

    /// Check required fields, key shape, URL and numeric ranges.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(invalid("model", "is required"));
        }

        let oauth = self.auth_mode() == AuthMode::OAuth;
        if self.api_base_url.trim().is_empty() {
            if !oauth {
                return Err(invalid("api_base_url", "is required unless the provider uses OAuth"));
            }
        } else {
            validate_url(&self.api_base_url)?;
        }

        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            if oauth {
                return Err(invalid("api_key", "cannot be combined with an OAuth provider"));
            }
            self.validate_key(key)?;
        }

        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(invalid("temperature", "must be between 0 and 2"));
        }
        if let Some(p) = self.top_p
            && !(0.0..=1.0).contains(&p)
        {
            return Err(invalid("top_p", "must be between 0 and 1"));
        }
        if self.max_tokens == Some(0) {
            return Err(invalid("max_tokens", "must be at least 1"));
        }
        if self.max_tool_iterations == 0 {
            return Err(invalid("max_tool_iterations", "must be at least 1"));
        }
        if self.history_window == 0 {
            return Err(invalid("history_window", "must be at least 1"));
        }
        if self.tool_timeout == 0 {
            return Err(invalid("tool_timeout", "must be at least 1"));
        }

        let m = &self.memory;
        if m.max_short_term_items == 0 || m.max_working_items == 0 || m.max_long_term_items == 0 {
            return Err(invalid("memory", "tier limits must be at least 1"));
        }
        if m.compression_trigger == 0 {
            return Err(invalid("memory.compression_trigger", "must be at least 1"));
        }
        if let Some(family) = self.provider.as_deref().filter(|p| !p.trim().is_empty())
            && ProviderFamily::from_name(family).is_none()
        {
            return Err(invalid("provider", &format!("unknown provider `{family}`")));
        }
        Ok(())
    }

    fn validate_key(&self, key: &str) -> Result<()> {
        let (prefix, min_len) = match self.key_provider() {
            KeyProvider::Anthropic => (Some("sk-ant-"), 20),
            KeyProvider::OpenAi => (Some("sk-"), 20),
            KeyProvider::Nvidia => (Some("nvapi-"), 20),
            KeyProvider::Other => (None, 10),
        };
        if let Some(prefix) = prefix
            && !key.starts_with(prefix)
        {
            return Err(invalid("api_key", &format!("must start with `{prefix}`")));
        }
        if key.len() < min_len {
            return Err(invalid("api_key", &format!("must be at least {min_len} characters")));
        }
        Ok(())
    }

    // -- derived configs -------------------------------------------------------

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            model: self.model.clone(),
            fallback_models: self.fallback_models.clone(),
            fallback_timeout: Duration::from_secs(self.fallback_timeout),
            max_tool_iterations: self.max_tool_iterations,
            history_window: self.history_window,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            reasoning_effort: self.reasoning_effort,
            profile: self.profile.clone(),
            ..AgentConfig::default()
        }
    }

    pub fn llm_client_config(&self) -> LlmClientConfig {
        let mut config = LlmClientConfig::new(self.api_base_url.clone(), self.model.clone());
        if let Some(provider) = self.provider.as_deref().filter(|p| !p.trim().is_empty()) {
            config = config.with_provider(provider);
            if let Some(oauth) = provider::find(provider).and_then(|p| p.oauth_provider) {
                config = config.with_oauth(oauth);
            }
        }
        if let Some(key) = self.api_key.as_deref() {
            config = config.with_api_key(key);
        }
        config
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout)
    }

    pub fn workplace(&self) -> PathBuf {
        self.workplace.clone().unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyProvider {
    Anthropic,
    OpenAi,
    Nvidia,
    Other,
}

fn invalid(field: &str, reason: &str) -> AgentError {
    AgentError::ValidationError {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let url = url::Url::parse(raw.trim()).map_err(|e| invalid("api_base_url", &e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("api_base_url", "must use http or https"));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("api_base_url", "must include a host"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            model: "gpt-4o-mini".into(),
            api_base_url: "https://api.openai.com/v1".into(),
            api_key: Some("sk-proj-0123456789abcdef".into()),
            ..Config::default()
        }
    }

    fn env(pairs: &[(&str, &str)]) -> Env {
        Env::from_map(pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect())
    }

    #[test]
    fn parses_documented_options() {
        let doc = r#"{
            "model": "claude-sonnet-4-20250514",
            "api_base_url": "https://api.anthropic.com",
            "fallback_models": ["claude-3-5-haiku-latest"],
            "fallback_timeout": 45,
            "temperature": 0.3,
            "reasoning_effort": "high",
            "memory": {"max_short_term_items": 20, "compression_trigger": 15},
            "permissions": {"allowed_commands": ["cargo", "git status"], "sensitive_tools": ["run_shell"]}
        }"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, doc).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.fallback_timeout, 45);
        assert_eq!(config.reasoning_effort, Some(ReasoningEffort::High));
        assert_eq!(config.memory.max_short_term_items, 20);
        assert_eq!(config.memory.max_working_items, MemoryConfig::default().max_working_items);
        assert_eq!(config.permissions.allowed_commands, vec!["cargo", "git status"]);

        let agent = config.agent_config();
        assert_eq!(agent.fallback_timeout, Duration::from_secs(45));
        assert_eq!(agent.fallback_models, vec!["claude-3-5-haiku-latest"]);
    }

    #[test]
    fn switching_provider_uses_catalog_defaults_and_family_key() {
        let env = env(&[("ANTHROPIC_API_KEY", "sk-ant-REDACTED")]);

        let local = valid().switched_to("ollama", None, &env).unwrap();
        assert_eq!(local.api_base_url, "http://localhost:11434/v1");
        assert_eq!(local.model, "llama3.2");
        assert!(local.api_key.is_none());

        let claude = valid().switched_to("anthropic", Some("claude-3-5-haiku-latest"), &env).unwrap();
        assert_eq!(claude.model, "claude-3-5-haiku-latest");
        assert_eq!(claude.api_key.as_deref(), Some("sk-ant-REDACTED"));
        assert_eq!(claude.llm_client_config().provider.as_deref(), Some("anthropic"));

        // The OpenAI key does not follow the switch to another family.
        let keyless = valid().switched_to("anthropic", None, &Env::from_map(HashMap::new())).unwrap();
        assert!(keyless.api_key.is_none());

        assert!(matches!(
            valid().switched_to("nowhere", None, &env),
            Err(AgentError::ValidationError { .. })
        ));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Config::load_from_file(&path).unwrap_err();
        assert!(matches!(err, AgentError::ConfigError { .. }));
    }

    #[test]
    fn explicit_missing_path_fails() {
        let err = Config::load(Some(Path::new("/definitely/not/here.json")), &env(&[])).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = valid();
        config.apply_env(&env(&[
            ("MODEL", "gpt-4o"),
            ("OPENAI_BASE_URL", "https://proxy.example.com/v1"),
            ("OPENAI_API_KEY", "sk-env-0123456789abcdefgh"),
        ]));
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.api_base_url, "https://proxy.example.com/v1");
        assert_eq!(config.api_key.as_deref(), Some("sk-env-0123456789abcdefgh"));
    }

    #[test]
    fn generic_api_key_wins() {
        let mut config = valid();
        config.apply_env(&env(&[("API_KEY", "generic-key-123"), ("OPENAI_API_KEY", "sk-other")]));
        assert_eq!(config.api_key.as_deref(), Some("generic-key-123"));
    }

    #[test]
    fn key_prefixes_follow_provider() {
        assert!(valid().validate().is_ok());

        let mut c = valid();
        c.api_key = Some("pk-0123456789abcdefghij".into());
        assert!(c.validate().unwrap_err().to_string().contains("sk-"));

        let mut c = valid();
        c.api_base_url = "https://api.anthropic.com".into();
        c.api_key = Some("sk-proj-0123456789abcdef".into());
        assert!(c.validate().unwrap_err().to_string().contains("sk-ant-"));

        let mut c = valid();
        c.provider = Some("nvidia".into());
        c.api_key = Some("nvapi-0123456789abcdef".into());
        assert!(c.validate().is_ok());

        let mut c = valid();
        c.api_base_url = "http://localhost:8080/v1".into();
        c.api_key = Some("short".into());
        assert!(c.validate().is_err());
        c.api_key = Some("local-key-1".into());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn url_and_ranges_are_checked() {
        let mut c = valid();
        c.api_base_url = "ftp://example.com".into();
        assert!(c.validate().is_err());

        let mut c = valid();
        c.temperature = Some(2.5);
        assert!(c.validate().unwrap_err().to_string().contains("temperature"));

        let mut c = valid();
        c.top_p = Some(1.5);
        assert!(c.validate().is_err());

        let mut c = valid();
        c.max_tokens = Some(0);
        assert!(c.validate().is_err());
    }

    #[test]
    fn oauth_provider_needs_no_url_or_key() {
        let mut c = Config {
            provider: Some("anthropic-oauth".into()),
            ..Config::default()
        };
        c.fill_provider_defaults();
        assert!(c.validate().is_ok());
        assert_eq!(c.llm_client_config().oauth_provider.as_deref(), Some("anthropic"));

        c.api_key = Some("sk-ant-REDACTED".into());
        assert!(c.validate().unwrap_err().to_string().contains("OAuth"));
    }

    #[test]
    fn dotenv_only_exports_whitelisted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "TERMPILOT_TEST_SECRET=nope\nTELEGRAM_CHAT_ID=42\n").unwrap();
        let env = Env::with_dotenv(&path).unwrap();
        assert_eq!(env.get("TERMPILOT_TEST_SECRET"), None);
        assert_eq!(env.get("TELEGRAM_CHAT_ID").as_deref(), Some("42"));
    }
}
