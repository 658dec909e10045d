//! Error types for the auth crate.
//!
//! All OAuth operations surface errors through [`AuthError`]. Each variant
//! carries enough context for callers to decide whether to retry, fall back
//! to manual code entry, or ask the user to log in again.

/// Maximum number of response-body characters kept in an error message.
pub const ERROR_BODY_LIMIT: usize = 200;

/// Unified error type for the termpilot auth crate.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    // -- Provider / credential lookup ----------------------------------------
    /// No OAuth strategy is registered under this provider id.
    #[error("unknown oauth provider: {provider}")]
    UnknownProvider {
        /// The provider id that was requested.
        provider: String,
    },

    /// The store holds no credentials for this provider.
    #[error("not logged in to {provider}; run /login {provider}")]
    NotLoggedIn {
        /// The provider that has no credentials.
        provider: String,
    },

    /// The access token needs refreshing but no refresh token is stored.
    #[error("token for {provider} expired and no refresh token is available; run /login {provider}")]
    NoRefreshToken {
        /// The provider whose token cannot be refreshed.
        provider: String,
    },

    // -- Token endpoint --------------------------------------------------------
    /// The token endpoint answered with a non-success status.
    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated to [`ERROR_BODY_LIMIT`] characters.
        body: String,
    },

    /// The token endpoint answered 200 but the payload is unusable.
    #[error("invalid token response: {reason}")]
    InvalidTokenResponse {
        /// What was wrong with the payload.
        reason: String,
    },

    /// An HTTP request to the authorization server failed.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    // -- Authorization flow ----------------------------------------------------
    /// PKCE material could not be generated.
    #[error("pkce generation failed: {reason}")]
    Pkce {
        /// Details about the failure.
        reason: String,
    },

    /// The `state` returned by the authorization server does not match.
    #[error("oauth state mismatch")]
    StateMismatch,

    /// The authorization flow failed for a non-specific reason.
    #[error("authentication flow failed: {reason}")]
    FlowFailed {
        /// Details about why the flow failed.
        reason: String,
    },

    /// The local callback server timed out waiting for the redirect.
    #[error("callback timed out after {timeout_secs} seconds")]
    CallbackTimeout {
        /// How many seconds we waited before giving up.
        timeout_secs: u64,
    },

    /// The loopback callback port could not be bound.
    #[error("callback port {port} unavailable: {reason}")]
    CallbackUnavailable {
        /// Port that was requested.
        port: u16,
        /// Underlying bind error.
        reason: String,
    },

    // -- Store -------------------------------------------------------------------
    /// The credential store file is not in a recognised shape.
    #[error("malformed oauth store {path}: {reason}")]
    MalformedStore {
        /// Path of the store file.
        path: String,
        /// What failed to parse.
        reason: String,
    },

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (store file, callback listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl AuthError {
    /// Build a [`AuthError::TokenEndpoint`] with the body cut to
    /// [`ERROR_BODY_LIMIT`] characters.
    pub fn token_endpoint(status: u16, body: &str) -> Self {
        Self::TokenEndpoint {
            status,
            body: truncate_body(body),
        }
    }

    /// Whether the user must log in again to recover.
    pub fn requires_login(&self) -> bool {
        match self {
            Self::NotLoggedIn { .. } | Self::NoRefreshToken { .. } => true,
            Self::TokenEndpoint { status, .. } => *status == 400 || *status == 401,
            _ => false,
        }
    }
}

/// Truncate a response body to at most [`ERROR_BODY_LIMIT`] characters.
pub fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= ERROR_BODY_LIMIT {
        return trimmed.to_owned();
    }
    let mut out: String = trimmed.chars().take(ERROR_BODY_LIMIT).collect();
    out.push_str("...");
    out
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
