//! OAuth engine for termpilot.
//!
//! This crate owns everything needed to hold provider OAuth tokens:
//!
//! - **PKCE authorization code flow** (RFC 7636) with a fixed-order
//!   authorization URL
//! - **Token exchange and refresh** against JSON token endpoints
//! - **Credential store** at `<config>/oauth.json` (0600, atomic writes,
//!   legacy flat form accepted)
//! - **Coalescing refresher** so concurrent refreshes for one provider
//!   produce a single token request
//! - **Loopback callback server** with a paste-the-URL fallback
//!
//! # Architecture
//!
//! ```text
//! PendingLogin ──► CallbackServer / paste
//!      │
//!      ▼
//! TokenRefresher ──► TokenClient ──► provider token endpoint
//!      │                 ▲
//!      ▼                 │
//! CredentialStore   ProviderRegistry
//! ```

pub mod callback;
pub mod credentials;
pub mod error;
pub mod login;
pub mod oauth;
pub mod providers;
pub mod refresher;
pub mod store;

// Re-export key types at the crate root for convenience.
pub use callback::{CallbackParams, CallbackServer, DEFAULT_CALLBACK_TIMEOUT, parse_redirect_input};
pub use credentials::{OAuthCredentials, REFRESH_MARGIN_MS, TokenGrant, now_ms};
pub use error::{AuthError, Result};
pub use login::{CodeSource, PendingLogin};
pub use oauth::{Pkce, TokenClient, authorization_url, generate_pkce_verifier, pkce_challenge};
pub use providers::{OAuthProvider, ProviderRegistry};
pub use refresher::TokenRefresher;
pub use store::{CredentialStore, OAuthStore};
