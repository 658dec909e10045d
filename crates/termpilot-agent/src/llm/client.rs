//! Multi-provider LLM client.
//!
//! [`LlmClient`] composes a [`ProviderAdapter`] with the HTTP transport. It
//! injects credentials (API key, or OAuth with transparent refresh), retries
//! transient failures with backoff, decodes SSE streams and keeps a running
//! usage total. The rest of the crate talks to it through the [`ChatModel`]
//! trait so tests and orchestration layers can substitute their own models.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use termpilot_auth::{OAuthCredentials, TokenRefresher};

use crate::error::{AgentError, Result};
use crate::llm::adapters::{Credential, ProviderAdapter, adapter_for, retry_after_header};
use crate::llm::provider::{self, AuthMode, ProviderFamily};
use crate::llm::streaming::SseLineBuffer;
use crate::llm::types::{ChatRequest, ChatResponse, StreamChunk, UsageTotals};
use crate::recovery::{BackoffPolicy, retry_with_backoff};

/// Connect timeout for provider requests. The request itself is unbounded;
/// stalls are detected by the engine's watchdog.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for model listing.
const LIST_MODELS_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on error bodies kept in [`AgentError::HttpStatus`].
const ERROR_BODY_LIMIT: usize = 2000;

/// Callback type for streamed deltas.
pub type ChunkSink<'a> = &'a mut (dyn FnMut(StreamChunk) + Send);

// ---------------------------------------------------------------------------
// ChatModel
// ---------------------------------------------------------------------------

/// Anything that can answer a chat request.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Blocking completion.
    async fn complete(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<ChatResponse>;

    /// Streaming completion; deltas go to `on_chunk`, the assembled
    /// response is returned.
    async fn stream(
        &self,
        request: &ChatRequest,
        on_chunk: ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse>;

    /// Model used when a request leaves `model` empty.
    fn default_model(&self) -> String;

    /// Short provider label for logs and status lines.
    fn provider_name(&self) -> String;

    /// Whether the provider keeps conversation state server-side, so a
    /// prefix already sent may be elided.
    fn supports_prefix_caching(&self) -> bool {
        false
    }

    /// Endpoint the model talks to, if it has one.
    fn endpoint_url(&self) -> Option<String> {
        None
    }

    /// Repoint the model at another provider endpoint.
    fn switch_provider(&self, config: &LlmClientConfig) -> Result<()> {
        Err(AgentError::ConfigError {
            reason: format!("{} cannot switch to provider {:?}", self.provider_name(), config.provider),
        })
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for one provider endpoint.
#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    /// Catalog id or family name; `None` auto-detects.
    pub provider: Option<String>,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// OAuth strategy id in the refresher. When set, bearer tokens from the
    /// credential store replace the API key.
    pub oauth_provider: Option<String>,
    pub backoff: BackoffPolicy,
}

impl LlmClientConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: None,
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            oauth_provider: None,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Configuration for a catalog entry with its default endpoint.
    pub fn for_provider(id: &str, model: Option<&str>) -> Result<Self> {
        let option = provider::find(id).ok_or_else(|| AgentError::ConfigError {
            reason: format!("unknown provider `{id}`"),
        })?;
        let mut config = Self::new(option.base_url, model.unwrap_or(option.default_model));
        config.provider = Some(option.id.to_owned());
        config.oauth_provider = option.oauth_provider.map(str::to_owned);
        Ok(config)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into()).filter(|k: &String| !k.is_empty());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_oauth(mut self, oauth_provider: impl Into<String>) -> Self {
        self.oauth_provider = Some(oauth_provider.into());
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn family(&self) -> ProviderFamily {
        provider::detect_family(
            self.provider.as_deref(),
            &self.model,
            self.api_key.as_deref().unwrap_or_default(),
        )
    }

    fn auth_mode(&self) -> AuthMode {
        if self.oauth_provider.is_some() {
            return AuthMode::OAuth;
        }
        if self.api_key.is_some() {
            return AuthMode::ApiKey;
        }
        self.provider
            .as_deref()
            .and_then(provider::find)
            .map(|p| p.auth_mode)
            .unwrap_or(AuthMode::ApiKey)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Swappable endpoint state, so a model or provider switch does not require
/// rebuilding the client.
#[derive(Debug, Clone)]
struct Endpoint {
    adapter: Arc<dyn ProviderAdapter>,
    label: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    oauth_provider: Option<String>,
    auth_mode: AuthMode,
}

impl Endpoint {
    fn from_config(config: &LlmClientConfig) -> Self {
        let family = config.family();
        Self {
            adapter: adapter_for(family),
            label: config
                .provider
                .clone()
                .unwrap_or_else(|| family.as_str().to_owned()),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            oauth_provider: config.oauth_provider.clone(),
            auth_mode: config.auth_mode(),
        }
    }
}

/// HTTP client for any catalog provider.
#[derive(Debug)]
pub struct LlmClient {
    http: reqwest::Client,
    endpoint: RwLock<Endpoint>,
    refresher: Option<Arc<TokenRefresher>>,
    backoff: BackoffPolicy,
    usage: Mutex<UsageTotals>,
}

impl LlmClient {
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        if config.model.trim().is_empty() {
            return Err(AgentError::NoModelConfigured);
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AgentError::LlmRequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            endpoint: RwLock::new(Endpoint::from_config(&config)),
            refresher: None,
            backoff: config.backoff,
            usage: Mutex::new(UsageTotals::default()),
        })
    }

    /// Attach the OAuth refresher used when the endpoint is OAuth-backed.
    pub fn with_refresher(mut self, refresher: Arc<TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn family(&self) -> ProviderFamily {
        self.endpoint().adapter.family()
    }

    pub fn model(&self) -> String {
        self.endpoint().model
    }

    pub fn base_url(&self) -> String {
        self.endpoint().base_url
    }

    /// Switch the default model.
    pub fn set_model(&self, model: impl Into<String>) {
        self.endpoint
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .model = model.into();
    }

    /// Cumulative usage across all successful calls.
    pub fn usage(&self) -> UsageTotals {
        *self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_usage(&self, response: &ChatResponse) {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&response.usage, &response.rate_limit);
    }

    // -- Credentials ------------------------------------------------------

    /// Resolve the credential for the next call, refreshing OAuth tokens
    /// that are within the refresh margin.
    async fn credential(&self, endpoint: &Endpoint) -> Result<Credential> {
        if let Some(oauth_provider) = &endpoint.oauth_provider {
            let refresher = self.refresher.as_ref().ok_or_else(|| AgentError::MissingApiKey {
                provider: endpoint.label.clone(),
            })?;
            let creds = refresher.valid_credentials(oauth_provider).await?;
            return Ok(oauth_credential(creds));
        }
        match (&endpoint.api_key, endpoint.auth_mode) {
            (Some(key), _) => Ok(Credential::ApiKey(key.clone())),
            (None, AuthMode::None) => Ok(Credential::None),
            (None, _) => Err(AgentError::MissingApiKey {
                provider: endpoint.label.clone(),
            }),
        }
    }

    /// Force a refresh of the OAuth credentials backing this client.
    pub async fn refresh_credentials(&self) -> Result<OAuthCredentials> {
        let endpoint = self.endpoint();
        let (Some(refresher), Some(provider)) = (&self.refresher, &endpoint.oauth_provider) else {
            return Err(AgentError::ConfigError {
                reason: format!("provider {} is not OAuth-backed", endpoint.label),
            });
        };
        let current = refresher.valid_credentials(provider).await?;
        Ok(refresher
            .refresh_stale(provider, &current.access_token)
            .await?)
    }

    // -- Transport ----------------------------------------------------------

    /// One HTTP round trip up to the response headers.
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &ChatRequest,
        credential: &Credential,
    ) -> Result<reqwest::Response> {
        let adapter = &endpoint.adapter;
        let url = adapter.endpoint_url(&endpoint.base_url, &request.model, request.stream);
        let headers = adapter.headers(credential)?;
        let body = adapter.build_request(request);

        tracing::debug!(
            url = %url,
            model = %request.model,
            provider = %endpoint.label,
            stream = request.stream,
            oauth = credential.is_oauth(),
            "sending LLM request"
        );

        let resp = self.http.post(&url).headers(headers).json(&body).send().await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after_secs = retry_after_header(resp.headers());
        let text = resp.text().await.unwrap_or_default();
        let body: String = text.chars().take(ERROR_BODY_LIMIT).collect();
        tracing::debug!(status = status.as_u16(), body = %body, "provider returned error status");
        Err(AgentError::HttpStatus {
            status: status.as_u16(),
            body,
            retry_after_secs,
        })
    }

    /// [`send`](Self::send) with credential injection. A 401 on an OAuth
    /// endpoint triggers one refresh and one retry.
    async fn send_authorized(&self, endpoint: &Endpoint, request: &ChatRequest) -> Result<reqwest::Response> {
        let credential = self.credential(endpoint).await?;
        match self.send(endpoint, request, &credential).await {
            Err(err) if err.is_unauthorized() && credential.is_oauth() => {
                let (Some(refresher), Some(provider)) = (&self.refresher, &endpoint.oauth_provider)
                else {
                    return Err(err);
                };
                let stale = credential.secret().unwrap_or_default();
                tracing::info!(provider = %provider, "401 from provider, refreshing oauth token");
                let fresh = refresher.refresh_stale(provider, stale).await?;
                self.send(endpoint, request, &oauth_credential(fresh)).await
            }
            other => other,
        }
    }

    /// Send with transient-failure retries. Only the request phase is
    /// retried; once body bytes flow, failures surface to the caller.
    async fn send_with_retry(
        &self,
        endpoint: &Endpoint,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response> {
        retry_with_backoff(&self.backoff, true, cancel, "llm.request", move |_| async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(AgentError::Canceled),
                r = self.send_authorized(endpoint, request) => r,
            }
        })
        .await
    }

    fn prepare(&self, request: &ChatRequest, endpoint: &Endpoint, stream: bool) -> Result<ChatRequest> {
        let mut request = request.clone();
        if request.model.trim().is_empty() {
            request.model = endpoint.model.clone();
        }
        request.stream = stream;
        request.validate()?;
        Ok(request)
    }

    // -- Model listing --------------------------------------------------------

    /// Model ids offered by the provider.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let endpoint = self.endpoint();
        let adapter = &endpoint.adapter;
        if !adapter.supports_model_listing() {
            return Ok(Vec::new());
        }
        let credential = self.credential(&endpoint).await?;
        let url = adapter.models_url(&endpoint.base_url);
        tracing::debug!(url = %url, provider = %endpoint.label, "listing models");

        let resp = self
            .http
            .get(&url)
            .headers(adapter.headers(&credential)?)
            .timeout(LIST_MODELS_TIMEOUT)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(AgentError::HttpStatus {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_LIMIT).collect(),
                retry_after_secs: None,
            });
        }
        let v: Value = serde_json::from_str(&text).map_err(|e| AgentError::LlmParseFailed {
            reason: format!("invalid model list: {e}"),
        })?;
        Ok(adapter.parse_model_list(&v))
    }
}

fn oauth_credential(creds: OAuthCredentials) -> Credential {
    Credential::OAuth {
        token: creds.access_token,
        account_id: creds.account_id,
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<ChatResponse> {
        let endpoint = self.endpoint();
        let request = self.prepare(request, &endpoint, false)?;
        let (endpoint, request) = (&endpoint, &request);

        let response = retry_with_backoff(&self.backoff, true, cancel, "llm.complete", move |_| async move {
            let resp = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Canceled),
                r = self.send_authorized(endpoint, request) => r?,
            };
            let rate_limit = endpoint.adapter.rate_limits(resp.headers());
            let text = resp.text().await.map_err(|e| AgentError::LlmRequestFailed {
                reason: format!("failed to read response body: {e}"),
            })?;
            let v: Value = serde_json::from_str(&text).map_err(|e| AgentError::LlmParseFailed {
                reason: format!("invalid JSON response: {e}"),
            })?;
            let mut response = endpoint.adapter.parse_response(&v)?;
            response.rate_limit = rate_limit;
            Ok(response)
        })
        .await?;

        self.record_usage(&response);
        Ok(response)
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        on_chunk: ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let endpoint = self.endpoint();
        let request = self.prepare(request, &endpoint, true)?;

        let resp = self.send_with_retry(&endpoint, &request, cancel).await?;
        let rate_limit = endpoint.adapter.rate_limits(resp.headers());

        let mut decoder = endpoint.adapter.stream_decoder();
        let mut lines = SseLineBuffer::new();
        let mut body = resp.bytes_stream();

        'read: loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Canceled),
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| AgentError::LlmStreamError {
                reason: format!("stream read error: {e}"),
            })?;
            on_chunk(StreamChunk::Activity);

            for line in lines.push(&chunk) {
                decoder.feed_line(&line, on_chunk)?;
                if decoder.is_done() {
                    break 'read;
                }
            }
        }
        if !decoder.is_done()
            && let Some(tail) = lines.finish()
        {
            decoder.feed_line(&tail, on_chunk)?;
        }
        if decoder.has_terminator() && !decoder.is_done() {
            tracing::warn!(provider = %endpoint.label, "stream closed before the terminator");
            return Err(AgentError::LlmStreamError {
                reason: "stream ended before the provider's terminator".into(),
            });
        }

        let mut response = decoder.finish()?;
        response.rate_limit = rate_limit;
        self.record_usage(&response);
        Ok(response)
    }

    fn default_model(&self) -> String {
        self.model()
    }

    fn provider_name(&self) -> String {
        self.endpoint().label
    }

    fn endpoint_url(&self) -> Option<String> {
        Some(self.endpoint().base_url)
    }

    fn switch_provider(&self, config: &LlmClientConfig) -> Result<()> {
        if config.oauth_provider.is_some() && self.refresher.is_none() {
            return Err(AgentError::ConfigError {
                reason: "OAuth provider selected but no credential store is attached".into(),
            });
        }
        let next = Endpoint::from_config(config);
        tracing::info!(provider = %next.label, model = %next.model, "switching provider");
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
