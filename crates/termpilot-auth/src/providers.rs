//! OAuth provider strategies.
//!
//! Each provider is a static bundle of endpoints and client metadata. The
//! [`ProviderRegistry`] maps provider ids to strategies and is the single
//! lookup point for login and refresh.

use std::collections::HashMap;

use crate::error::{AuthError, Result};

/// Endpoints and client metadata for one OAuth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthProvider {
    /// Stable id used as the key in the credential store.
    pub id: String,
    /// Authorization endpoint the user is sent to.
    pub authorize_url: String,
    /// Token endpoint for code exchange and refresh.
    pub token_url: String,
    /// Public client id.
    pub client_id: String,
    /// Scopes requested at authorization time.
    pub scopes: Vec<String>,
    /// Redirect URI registered for the client.
    pub redirect_uri: String,
    /// Loopback port for the callback server, when the redirect targets
    /// localhost. `None` means the user must paste the code.
    pub callback_port: Option<u16>,
}

impl OAuthProvider {
    /// Anthropic console OAuth (Claude subscription tokens).
    pub fn anthropic() -> Self {
        Self {
            id: "anthropic".into(),
            authorize_url: "https://claude.ai/oauth/authorize".into(),
            token_url: "https://console.anthropic.com/v1/oauth/token".into(),
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".into(),
            scopes: vec![
                "org:create_api_key".into(),
                "user:profile".into(),
                "user:inference".into(),
            ],
            redirect_uri: "https://console.anthropic.com/oauth/code/callback".into(),
            callback_port: None,
        }
    }

    /// OpenAI account login used by Codex-style clients.
    pub fn openai_codex() -> Self {
        Self {
            id: "openai-codex".into(),
            authorize_url: "https://auth.openai.com/oauth/authorize".into(),
            token_url: "https://auth.openai.com/oauth/token".into(),
            client_id: "app_EMoamEEZ73f0CkXaXp7hrann".into(),
            scopes: vec![
                "openid".into(),
                "profile".into(),
                "email".into(),
                "offline_access".into(),
            ],
            redirect_uri: "http://localhost:1455/auth/callback".into(),
            callback_port: Some(1455),
        }
    }

    /// Scopes joined with single spaces, as sent on the wire.
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }
}

/// Provider id to strategy map.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, OAuthProvider>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Registry seeded with the built-in providers.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.insert(OAuthProvider::anthropic());
        registry.insert(OAuthProvider::openai_codex());
        registry
    }

    /// Add or replace a strategy.
    pub fn insert(&mut self, provider: OAuthProvider) {
        self.providers.insert(provider.id.clone(), provider);
    }

    /// Look up a strategy by id.
    pub fn get(&self, id: &str) -> Result<&OAuthProvider> {
        self.providers
            .get(id)
            .ok_or_else(|| AuthError::UnknownProvider {
                provider: id.to_owned(),
            })
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_known_providers() {
        let registry = ProviderRegistry::builtin();
        assert_eq!(registry.ids(), vec!["anthropic", "openai-codex"]);
        assert!(registry.get("anthropic").is_ok());
    }

    #[test]
    fn unknown_provider_is_an_error() {
        let registry = ProviderRegistry::builtin();
        let err = registry.get("slack").unwrap_err();
        assert!(matches!(err, AuthError::UnknownProvider { .. }));
    }

    #[test]
    fn insert_overrides_existing() {
        let mut registry = ProviderRegistry::builtin();
        let mut custom = OAuthProvider::anthropic();
        custom.token_url = "http://127.0.0.1:9/token".into();
        registry.insert(custom);
        assert_eq!(
            registry.get("anthropic").unwrap().token_url,
            "http://127.0.0.1:9/token"
        );
    }

    #[test]
    fn scope_string_is_space_joined() {
        assert_eq!(
            OAuthProvider::anthropic().scope_string(),
            "org:create_api_key user:profile user:inference"
        );
    }
}
