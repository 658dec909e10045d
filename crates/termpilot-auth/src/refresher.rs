//! Coalescing token refresher.
//!
//! Concurrent callers asking for a refresh of the same provider queue on a
//! provider-keyed mutex. The first caller hits the token endpoint and
//! persists the result; the rest observe the updated store and return
//! without issuing a second request.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::credentials::OAuthCredentials;
use crate::error::{AuthError, Result};
use crate::oauth::TokenClient;
use crate::providers::ProviderRegistry;
use crate::store::CredentialStore;

/// Refreshes and persists OAuth credentials.
#[derive(Debug)]
pub struct TokenRefresher {
    store: Arc<CredentialStore>,
    providers: ProviderRegistry,
    client: TokenClient,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenRefresher {
    /// Create a refresher over `store` using the given strategies.
    pub fn new(store: Arc<CredentialStore>, providers: ProviderRegistry) -> Result<Self> {
        Ok(Self {
            store,
            providers,
            client: TokenClient::new()?,
            locks: DashMap::new(),
        })
    }

    /// The backing credential store.
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// The provider strategies in use.
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// The token endpoint client.
    pub fn client(&self) -> &TokenClient {
        &self.client
    }

    /// Return credentials for `provider` that are not about to expire,
    /// refreshing first when needed.
    ///
    /// # Errors
    ///
    /// [`AuthError::NotLoggedIn`] if nothing is stored, or any refresh error.
    pub async fn valid_credentials(&self, provider: &str) -> Result<OAuthCredentials> {
        let current = self.stored(provider).await?;
        if !current.needs_refresh() {
            return Ok(current);
        }
        self.refresh_stale(provider, &current.access_token).await
    }

    /// Force a refresh because `stale_access_token` was rejected upstream.
    ///
    /// If another task already replaced that token, the stored credentials
    /// are returned without contacting the token endpoint.
    pub async fn refresh_stale(
        &self,
        provider: &str,
        stale_access_token: &str,
    ) -> Result<OAuthCredentials> {
        let lock = self.lock_for(provider);
        let _guard = lock.lock().await;

        let current = self.stored(provider).await?;
        if current.access_token != stale_access_token && !current.needs_refresh() {
            tracing::debug!(provider, "refresh coalesced with a concurrent refresh");
            return Ok(current);
        }

        let strategy = self.providers.get(provider)?;
        let refreshed = self.client.refresh(strategy, &current).await?;
        self.store.upsert(refreshed.clone()).await?;

        tracing::info!(
            provider,
            expires_in_secs = refreshed.remaining_ms() / 1000,
            "oauth token refreshed"
        );
        Ok(refreshed)
    }

    async fn stored(&self, provider: &str) -> Result<OAuthCredentials> {
        self.store
            .get(provider)
            .await
            .ok_or_else(|| AuthError::NotLoggedIn {
                provider: provider.to_owned(),
            })
    }

    fn lock_for(&self, provider: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(provider.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::now_ms;

    fn creds(expires_at: i64) -> OAuthCredentials {
        OAuthCredentials {
            provider: "anthropic".into(),
            access_token: "fresh".into(),
            refresh_token: Some("r".into()),
            expires_at,
            account_id: None,
            project_id: None,
        }
    }

    async fn refresher_with(creds: Option<OAuthCredentials>) -> (tempfile::TempDir, TokenRefresher) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::open(dir.path().join("oauth.json")).unwrap());
        if let Some(c) = creds {
            store.upsert(c).await.unwrap();
        }
        let refresher = TokenRefresher::new(store, ProviderRegistry::builtin()).unwrap();
        (dir, refresher)
    }

    #[tokio::test]
    async fn valid_credentials_returns_unexpired_without_refresh() {
        let expires = now_ms() + 60 * 60 * 1000;
        let (_dir, refresher) = refresher_with(Some(creds(expires))).await;
        let c = refresher.valid_credentials("anthropic").await.unwrap();
        assert_eq!(c.access_token, "fresh");
        assert_eq!(c.expires_at, expires);
    }

    #[tokio::test]
    async fn missing_credentials_is_not_logged_in() {
        let (_dir, refresher) = refresher_with(None).await;
        let err = refresher.valid_credentials("anthropic").await.unwrap_err();
        assert!(matches!(err, AuthError::NotLoggedIn { .. }));
    }

    #[tokio::test]
    async fn stale_token_already_replaced_is_coalesced() {
        let (_dir, refresher) = refresher_with(Some(creds(now_ms() + 60 * 60 * 1000))).await;
        let c = refresher
            .refresh_stale("anthropic", "some-older-token")
            .await
            .unwrap();
        assert_eq!(c.access_token, "fresh");
    }

    #[test]
    fn lock_is_shared_per_provider() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CredentialStore::open(dir.path().join("oauth.json")).unwrap());
        let refresher = TokenRefresher::new(store, ProviderRegistry::builtin()).unwrap();
        let a = refresher.lock_for("anthropic");
        let b = refresher.lock_for("anthropic");
        let c = refresher.lock_for("openai-codex");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
