//! OAuth 2.0 Authorization Code Flow with PKCE.
//!
//! # Flow Overview
//!
//! 1. Generate a PKCE verifier and its S256 challenge.
//! 2. Build the authorization URL; the verifier doubles as `state`.
//! 3. Receive the authorization code via the callback server or a paste.
//! 4. Exchange the code + verifier for tokens (JSON body, 15s timeout).
//! 5. Refresh tokens before they expire.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::credentials::{OAuthCredentials, TokenGrant, now_ms};
use crate::error::{AuthError, Result};
use crate::providers::OAuthProvider;

/// Length of the PKCE code verifier in bytes (before base64 encoding).
const PKCE_VERIFIER_BYTES: usize = 32;

/// Timeout for every token endpoint request.
pub const TOKEN_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Grants whose lifetime is at or below this are rejected.
const MIN_GRANT_LIFETIME_SECS: i64 = 60;

/// Lifetime assumed when the server omits `expires_in`.
const DEFAULT_GRANT_LIFETIME_SECS: i64 = 3600;

// ---------------------------------------------------------------------------
// PKCE helpers
// ---------------------------------------------------------------------------

/// A PKCE verifier and the challenge derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    /// Generate fresh PKCE material from the system CSPRNG.
    pub fn generate() -> Result<Self> {
        let verifier = generate_pkce_verifier()?;
        let challenge = pkce_challenge(&verifier);
        Ok(Self {
            verifier,
            challenge,
        })
    }
}

/// Generate a PKCE code verifier (random 32 bytes, base64url encoded).
///
/// # Errors
///
/// Returns an error if the system CSPRNG fails.
pub fn generate_pkce_verifier() -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; PKCE_VERIFIER_BYTES];
    rng.fill(&mut bytes).map_err(|_| AuthError::Pkce {
        reason: "system random source unavailable".to_string(),
    })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Derive the PKCE code challenge from a code verifier using SHA-256.
///
/// `challenge = BASE64URL_NOPAD(SHA256(verifier))`
pub fn pkce_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Build the authorization URL the user should visit.
///
/// Query parameters are appended in a fixed order because some
/// authorization servers reject reordered queries. The verifier is sent as
/// `state`.
///
/// # Errors
///
/// Returns [`AuthError::UrlParse`] if the provider's authorize URL is invalid.
pub fn authorization_url(provider: &OAuthProvider, pkce: &Pkce) -> Result<String> {
    let mut url = Url::parse(&provider.authorize_url)?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("client_id", &provider.client_id);
        params.append_pair("response_type", "code");
        params.append_pair("redirect_uri", &provider.redirect_uri);
        params.append_pair("scope", &provider.scope_string());
        params.append_pair("code_challenge", &pkce.challenge);
        params.append_pair("code_challenge_method", "S256");
        params.append_pair("state", &pkce.verifier);
    }

    Ok(url.to_string())
}

/// Split a pasted authorization code of the form `code#state`.
pub fn split_code_and_state(input: &str) -> (String, Option<String>) {
    let input = input.trim();
    match input.split_once('#') {
        Some((code, state)) if !state.is_empty() => (code.to_owned(), Some(state.to_owned())),
        Some((code, _)) => (code.to_owned(), None),
        None => (input.to_owned(), None),
    }
}

// ---------------------------------------------------------------------------
// Token endpoint client
// ---------------------------------------------------------------------------

/// Raw token response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    account: Option<TokenAccount>,
}

#[derive(Debug, Deserialize)]
struct TokenAccount {
    uuid: Option<String>,
}

impl TokenResponse {
    fn into_grant(self) -> Result<TokenGrant> {
        if self.access_token.is_empty() {
            return Err(AuthError::InvalidTokenResponse {
                reason: "empty access_token".into(),
            });
        }
        let expires_in_secs = self.expires_in.unwrap_or(DEFAULT_GRANT_LIFETIME_SECS);
        if expires_in_secs <= MIN_GRANT_LIFETIME_SECS {
            return Err(AuthError::InvalidTokenResponse {
                reason: format!("expires_in of {expires_in_secs}s is too short to use"),
            });
        }
        Ok(TokenGrant {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_in_secs,
            account_id: self.account.and_then(|a| a.uuid),
        })
    }
}

/// HTTP client for a provider's token endpoint.
///
/// Stateless apart from the connection pool; all flow state is passed in.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
}

impl TokenClient {
    /// Create a client with the 15-second token timeout.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TOKEN_HTTP_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    /// Exchange an authorization code for credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenEndpoint`] if the server rejects the code,
    /// or [`AuthError::Network`] on transport failure.
    pub async fn exchange_code(
        &self,
        provider: &OAuthProvider,
        code: &str,
        state: &str,
        verifier: &str,
    ) -> Result<OAuthCredentials> {
        let body = json!({
            "grant_type": "authorization_code",
            "client_id": provider.client_id,
            "code": code,
            "state": state,
            "redirect_uri": provider.redirect_uri,
            "code_verifier": verifier,
        });

        tracing::debug!(provider = %provider.id, token_url = %provider.token_url, "exchanging authorization code");

        let grant = self.post_token(provider, &body).await?;
        Ok(grant.into_credentials(&provider.id, now_ms()))
    }

    /// Refresh `current` and return the merged credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NoRefreshToken`] if `current` has no refresh
    /// token, [`AuthError::TokenEndpoint`] on non-200 responses.
    pub async fn refresh(
        &self,
        provider: &OAuthProvider,
        current: &OAuthCredentials,
    ) -> Result<OAuthCredentials> {
        let refresh_token =
            current
                .refresh_token
                .as_deref()
                .ok_or_else(|| AuthError::NoRefreshToken {
                    provider: provider.id.clone(),
                })?;

        let body = json!({
            "grant_type": "refresh_token",
            "client_id": provider.client_id,
            "refresh_token": refresh_token,
        });

        tracing::debug!(provider = %provider.id, token_url = %provider.token_url, "refreshing access token");

        let grant = self.post_token(provider, &body).await?;
        Ok(current.merged_with(grant, now_ms()))
    }

    async fn post_token(
        &self,
        provider: &OAuthProvider,
        body: &serde_json::Value,
    ) -> Result<TokenGrant> {
        let response = self
            .http
            .post(&provider.token_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if status != reqwest::StatusCode::OK {
            return Err(AuthError::token_endpoint(status.as_u16(), &text));
        }

        let parsed: TokenResponse =
            serde_json::from_str(&text).map_err(|e| AuthError::InvalidTokenResponse {
                reason: e.to_string(),
            })?;
        parsed.into_grant()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
