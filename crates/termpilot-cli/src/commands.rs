//! One-shot subcommands: ask, pipeline, debate, interview, login, logout,
//! providers and config-check.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use termpilot_agent::llm::interview::interview;
use termpilot_agent::llm::provider::{AuthMode, PROVIDERS};
use termpilot_agent::{BrainFileSink, DebateSetup, DualSession, DualSessionConfig, Env, Pipeline, PipelineConfig};
use termpilot_auth::{CodeSource, DEFAULT_CALLBACK_TIMEOUT, PendingLogin, now_ms, parse_redirect_input};

use crate::cli::DebateArgs;
use crate::helpers::{Runtime, load_config, open_refresher};
use crate::ui::{ConsoleObserver, DebatePrinter, Interrupts};

// ---------------------------------------------------------------------------
// ask / pipeline
// ---------------------------------------------------------------------------

pub async fn cmd_ask(runtime: &Runtime, interrupts: &Interrupts, text: &str) -> Result<()> {
    let agent = runtime.agent("termpilot", Arc::new(ConsoleObserver::default())).await?;
    let cancel = interrupts.begin();
    agent.chat(text, &cancel).await?;
    println!();
    Ok(())
}

pub async fn cmd_pipeline(runtime: &Runtime, interrupts: &Interrupts, text: &str) -> Result<()> {
    let agent = runtime.agent("termpilot", Arc::new(ConsoleObserver::quiet())).await?;
    let pipeline = Pipeline::new(PipelineConfig::default())
        .with_sink(Arc::new(BrainFileSink::new(runtime.config.workplace())));
    let cancel = interrupts.begin();
    let answer = pipeline.run(&agent, text, &cancel).await?;
    println!("{answer}");
    Ok(())
}

// ---------------------------------------------------------------------------
// debate
// ---------------------------------------------------------------------------

pub async fn cmd_debate(runtime: &Runtime, interrupts: &Interrupts, args: DebateArgs) -> Result<()> {
    let a = runtime.agent(&args.role_a, Arc::new(ConsoleObserver::quiet())).await?;
    let b = runtime.agent(&args.role_b, Arc::new(ConsoleObserver::quiet())).await?;
    let session = DualSession::new(
        Arc::new(a),
        Arc::new(b),
        DualSessionConfig::new(runtime.config.workplace()),
    )
    .with_observer(Arc::new(DebatePrinter));

    session.enable();
    session.start(DebateSetup {
        initial_prompt: crate::cli::joined(&args.topic),
        role_a: args.role_a,
        prompt_a: args.prompt_a,
        role_b: args.role_b,
        prompt_b: args.prompt_b,
        max_turns: args.turns,
    })?;

    // Ctrl-C stops the debate; the transcript is still written.
    let cancel = interrupts.begin();
    let session = Arc::new(session);
    let stopper = {
        let session = session.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            session.stop();
        })
    };
    session.wait().await;
    stopper.abort();

    let stats = session.stats();
    println!();
    println!("  {}", session.progress());
    if let Some(path) = &stats.transcript_path {
        println!("  Transcript: {}", path.display());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// interview
// ---------------------------------------------------------------------------

pub async fn cmd_interview(runtime: &Runtime, interrupts: &Interrupts) -> Result<()> {
    let cancel = interrupts.begin();
    let model = runtime.config.model.clone();
    let answer = interview(runtime.client.as_ref(), &model, &cancel).await;
    let source = if answer.from_model { "model" } else { "static profile" };
    println!("  Model:          {model} (answer from {source})");
    println!("  temperature:    {}", answer.temperature);
    println!("  top_p:          {}", answer.top_p);
    println!("  max_tokens:     {}", answer.max_tokens);
    println!("  context_window: {}", answer.context_window);
    Ok(())
}

// ---------------------------------------------------------------------------
// login / logout
// ---------------------------------------------------------------------------

pub async fn cmd_login(provider_id: &str) -> Result<()> {
    let refresher = open_refresher()?;
    let provider = refresher
        .providers()
        .get(provider_id)
        .with_context(|| format!("unknown OAuth provider `{provider_id}`"))?
        .clone();

    let login = PendingLogin::begin(&provider).context("failed to start login")?;
    println!();
    println!("  Open this URL in your browser to authorize termpilot:");
    println!();
    println!("  {}", login.url());
    println!();

    let params = match login.code_source(DEFAULT_CALLBACK_TIMEOUT).await {
        CodeSource::Callback(server) => {
            println!("  Waiting for the browser redirect on port {} ...", server.port());
            server.wait().await.context("authorization callback failed")?
        }
        CodeSource::Paste => {
            println!("  Paste the redirect URL (or the code) here:");
            let line = tokio::task::spawn_blocking(|| {
                let mut line = String::new();
                std::io::stdin().read_line(&mut line).map(|_| line)
            })
            .await
            .context("input task failed")?
            .context("failed to read pasted code")?;
            parse_redirect_input(line.trim()).context("could not find an authorization code")?
        }
    };

    let credentials = login.finish(params, &refresher).await.context("token exchange failed")?;
    let minutes = (credentials.expires_at - now_ms()).max(0) / 60_000;
    println!("  Logged in to {}; token valid for {minutes} minutes.", credentials.provider);
    Ok(())
}

pub async fn cmd_logout(provider_id: &str) -> Result<()> {
    let refresher = open_refresher()?;
    if refresher
        .store()
        .remove(provider_id)
        .await
        .context("failed to update credential store")?
    {
        println!("  Removed credentials for {provider_id}.");
    } else {
        println!("  No credentials stored for {provider_id}.");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// providers / config-check
// ---------------------------------------------------------------------------

pub async fn cmd_providers() -> Result<()> {
    let store = open_refresher().ok().map(|r| r.store().clone());
    println!();
    for option in PROVIDERS {
        let auth = match option.auth_mode {
            AuthMode::None => "no auth".to_owned(),
            AuthMode::ApiKey => "api key".to_owned(),
            AuthMode::OAuth => {
                let logged_in = match (&store, option.oauth_provider) {
                    (Some(store), Some(id)) => store.get(id).await.is_some(),
                    _ => false,
                };
                if logged_in { "oauth, logged in" } else { "oauth" }.to_owned()
            }
        };
        println!("  {:<20} {:<32} {:<18} {}", option.id, option.label, auth, option.base_url);
    }
    println!();
    Ok(())
}

pub fn cmd_config_check(explicit: Option<&Path>, env: &Env) -> Result<()> {
    let loaded = load_config(explicit, env)?;
    let config = &loaded.config;
    info!(source = ?loaded.source, "configuration is valid");
    println!();
    match &loaded.source {
        Some(path) => println!("  Source:        {}", path.display()),
        None => println!("  Source:        defaults and environment"),
    }
    println!("  Model:         {}", config.model);
    println!("  Provider:      {}", config.provider.as_deref().unwrap_or("auto"));
    println!("  Base URL:      {}", config.api_base_url);
    println!("  API key:       {}", if config.api_key.is_some() { "set" } else { "not set" });
    if !config.fallback_models.is_empty() {
        println!("  Fallbacks:     {}", config.fallback_models.join(", "));
    }
    println!("  Tool timeout:  {}s", config.tool_timeout);
    println!("  Workplace:     {}", config.workplace().display());
    println!();
    Ok(())
}
