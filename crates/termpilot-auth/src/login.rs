//! End-to-end login orchestration.
//!
//! [`PendingLogin`] carries the PKCE material between building the
//! authorization URL and exchanging the returned code, so the caller can
//! choose between the callback server and manual paste in between.

use std::time::Duration;

use crate::callback::{CallbackParams, CallbackServer};
use crate::credentials::OAuthCredentials;
use crate::error::{AuthError, Result};
use crate::oauth::{Pkce, authorization_url};
use crate::providers::OAuthProvider;
use crate::refresher::TokenRefresher;

/// How the authorization code will reach us.
pub enum CodeSource {
    /// A callback server is waiting on the loopback port.
    Callback(CallbackServer),
    /// The user has to paste the redirect URL or code.
    Paste,
}

/// A login in progress.
pub struct PendingLogin {
    provider: OAuthProvider,
    pkce: Pkce,
    url: String,
}

impl PendingLogin {
    /// Generate PKCE material and the authorization URL for `provider`.
    pub fn begin(provider: &OAuthProvider) -> Result<Self> {
        let pkce = Pkce::generate()?;
        let url = authorization_url(provider, &pkce)?;
        tracing::info!(provider = %provider.id, "starting OAuth authorization code flow");
        Ok(Self {
            provider: provider.clone(),
            pkce,
            url,
        })
    }

    /// URL the user should open.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn provider(&self) -> &OAuthProvider {
        &self.provider
    }

    /// Start the callback server when the provider redirects to loopback,
    /// falling back to paste mode when it cannot be bound.
    pub async fn code_source(&self, timeout: Duration) -> CodeSource {
        let Some(port) = self.provider.callback_port else {
            return CodeSource::Paste;
        };
        match CallbackServer::spawn(port, timeout).await {
            Ok(server) => CodeSource::Callback(server),
            Err(e) => {
                tracing::warn!(error = %e, "callback server unavailable, falling back to paste mode");
                CodeSource::Paste
            }
        }
    }

    /// Exchange the received code and persist the credentials.
    ///
    /// # Errors
    ///
    /// [`AuthError::StateMismatch`] if the redirect carries a foreign state,
    /// plus any token endpoint or store error.
    pub async fn finish(
        self,
        params: CallbackParams,
        refresher: &TokenRefresher,
    ) -> Result<OAuthCredentials> {
        if let Some(state) = &params.state
            && state != &self.pkce.verifier
        {
            return Err(AuthError::StateMismatch);
        }

        let credentials = refresher
            .client()
            .exchange_code(
                &self.provider,
                &params.code,
                &self.pkce.verifier,
                &self.pkce.verifier,
            )
            .await?;

        refresher.store().upsert(credentials.clone()).await?;
        tracing::info!(provider = %self.provider.id, "OAuth login completed");
        Ok(credentials)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::providers::ProviderRegistry;
    use crate::store::CredentialStore;

    #[test]
    fn begin_builds_url_with_verifier_as_state() {
        let login = PendingLogin::begin(&OAuthProvider::anthropic()).unwrap();
        let url = url::Url::parse(login.url()).unwrap();
        let state = url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert_eq!(state, login.pkce.verifier);
    }

    #[tokio::test]
    async fn provider_without_port_uses_paste() {
        let login = PendingLogin::begin(&OAuthProvider::anthropic()).unwrap();
        assert!(matches!(
            login.code_source(Duration::from_secs(1)).await,
            CodeSource::Paste
        ));
    }

    #[tokio::test]
    async fn foreign_state_is_rejected_before_exchange() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::open(dir.path().join("oauth.json")).unwrap());
        let refresher = TokenRefresher::new(store, ProviderRegistry::builtin()).unwrap();

        let login = PendingLogin::begin(&OAuthProvider::anthropic()).unwrap();
        let err = login
            .finish(
                CallbackParams {
                    code: "c".into(),
                    state: Some("not-the-verifier".into()),
                },
                &refresher,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::StateMismatch));
    }
}
