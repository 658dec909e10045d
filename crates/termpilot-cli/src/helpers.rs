//! Shared helpers used across CLI subcommands.
//!
//! Tracing setup, configuration loading and construction of the LLM
//! client, tool executor and agents from a validated [`Config`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use termpilot_agent::config::config_dir;
use termpilot_agent::memory::persist::load_long_term;
use termpilot_agent::tools::{Approver, AuditLog, AutoApprove, RetryingExecutor};
use termpilot_agent::{
    Agent, AgentObserver, Config, Env, LlmClient, LoadedConfig, MemoryManager, ToolDispatch, ToolExecutor,
    ToolRegistry,
};
use termpilot_auth::{CredentialStore, ProviderRegistry, TokenRefresher};

use crate::tools::register_builtin_tools;
use crate::ui::PromptApprover;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber. `RUST_LOG` wins; otherwise `info`,
/// or `debug` when `VERBOSE` is set. Logs go to stderr so answers on
/// stdout stay clean.
pub fn init_tracing(json: bool, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .init();
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Environment with whitelisted `.env` values from the working directory.
pub fn load_env() -> Result<Env> {
    Env::with_dotenv(Path::new(".env")).context("failed to read .env")
}

pub fn load_config(explicit: Option<&Path>, env: &Env) -> Result<LoadedConfig> {
    Config::load(explicit, env).context("invalid configuration")
}

/// `<home>/.termpilot/oauth.json`.
pub fn oauth_store_path() -> Result<PathBuf> {
    config_dir()
        .map(|d| d.join("oauth.json"))
        .context("cannot locate the home directory (set HOME)")
}

/// Refresher over the user's credential store with the built-in providers.
pub fn open_refresher() -> Result<Arc<TokenRefresher>> {
    let path = oauth_store_path()?;
    let store = CredentialStore::open(&path)
        .with_context(|| format!("failed to open credential store {}", path.display()))?;
    let refresher = TokenRefresher::new(Arc::new(store), ProviderRegistry::builtin())
        .context("failed to build token refresher")?;
    Ok(Arc::new(refresher))
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Everything built once per process and shared by every agent.
pub struct Runtime {
    pub config: Config,
    pub env: Env,
    pub client: Arc<LlmClient>,
    pub tools: Arc<dyn ToolDispatch>,
    pub audit: Option<Arc<AuditLog>>,
}

impl Runtime {
    /// Build the client and tool stack for `config`.
    pub async fn build(config: Config, env: Env, auto_approve: bool) -> Result<Self> {
        let mut client = LlmClient::new(config.llm_client_config()).context("failed to create LLM client")?;
        if config.llm_client_config().oauth_provider.is_some() {
            client = client.with_refresher(open_refresher()?);
        }
        info!(model = %config.model, base_url = %client.base_url(), "LLM client ready");

        let registry = ToolRegistry::new();
        let workplace = config.workplace();
        register_builtin_tools(&registry, &workplace, &config.permissions)
            .context("failed to register built-in tools")?;

        let approver: Arc<dyn Approver> = if auto_approve {
            Arc::new(AutoApprove)
        } else {
            Arc::new(PromptApprover)
        };
        let mut executor = ToolExecutor::new(Arc::new(registry))
            .with_policy(config.permissions.clone())
            .with_approver(approver)
            .with_timeout(config.tool_timeout());

        let audit = if config.permissions.enable_audit_log {
            let path = match &config.permissions.audit_log_path {
                Some(p) => PathBuf::from(p),
                None => config_dir().unwrap_or_else(|| workplace.clone()).join("audit.log"),
            };
            let log = AuditLog::open(&path)
                .await
                .with_context(|| format!("failed to open audit log {}", path.display()))?;
            info!(path = %path.display(), "tool audit log enabled");
            Some(Arc::new(log))
        } else {
            None
        };
        if let Some(log) = &audit {
            executor = executor.with_audit(log.clone());
        }

        let executor = Arc::new(executor);
        let tools: Arc<dyn ToolDispatch> = if config.intelligent_retry {
            Arc::new(RetryingExecutor::new(executor))
        } else {
            executor
        };

        Ok(Self {
            config,
            env,
            client: Arc::new(client),
            tools,
            audit,
        })
    }

    /// A fresh agent with its own memory, sharing the client and tools.
    pub async fn agent(&self, name: &str, observer: Arc<dyn AgentObserver>) -> Result<Agent> {
        let memory_config = self.config.memory.clone();
        let memory = match &memory_config.storage_path {
            Some(path) => {
                let items = load_long_term(path)
                    .await
                    .with_context(|| format!("failed to load long-term memory from {}", path.display()))?;
                MemoryManager::with_long_term(memory_config.clone(), items)
            }
            None => MemoryManager::new(memory_config),
        };
        Ok(Agent::new(self.config.agent_config(), self.client.clone(), self.tools.clone(), memory)
            .with_name(name)
            .with_observer(observer))
    }

    /// Flush buffered audit records before exit.
    pub async fn shutdown(&self) {
        if let Some(log) = &self.audit
            && let Err(e) = log.flush().await
        {
            tracing::warn!(error = %e, "failed to flush audit log");
        }
    }
}
