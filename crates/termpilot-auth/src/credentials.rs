//! OAuth credential record and expiry arithmetic.

use serde::{Deserialize, Serialize};

/// Credentials are refreshed when they expire within this window.
pub const REFRESH_MARGIN_MS: i64 = 5 * 60 * 1000;

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Tokens held for one provider.
///
/// `expires_at` is unix milliseconds. Optional ids are only present for
/// providers that scope tokens to an account or project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCredentials {
    /// Provider id this credential belongs to.
    pub provider: String,

    /// Bearer token sent on API calls.
    pub access_token: String,

    /// Token used to obtain a new access token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Expiry as unix milliseconds.
    pub expires_at: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

impl OAuthCredentials {
    /// True when `now + 5min >= expires_at`.
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(now_ms())
    }

    /// [`needs_refresh`](Self::needs_refresh) against an explicit clock.
    pub fn needs_refresh_at(&self, now_ms: i64) -> bool {
        now_ms + REFRESH_MARGIN_MS >= self.expires_at
    }

    /// True when the access token is already past its expiry.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    /// Milliseconds until expiry (negative once expired).
    pub fn remaining_ms(&self) -> i64 {
        self.expires_at - now_ms()
    }

    /// Merge a fresh token grant into this record.
    ///
    /// Servers may omit the refresh token on refresh; the previous one is
    /// kept in that case. Account and project ids always carry over.
    pub fn merged_with(&self, grant: TokenGrant, now_ms: i64) -> Self {
        Self {
            provider: self.provider.clone(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or_else(|| self.refresh_token.clone()),
            expires_at: now_ms + grant.expires_in_secs * 1000,
            account_id: grant.account_id.or_else(|| self.account_id.clone()),
            project_id: self.project_id.clone(),
        }
    }
}

/// A successful token endpoint response, normalised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in_secs: i64,
    pub account_id: Option<String>,
}

impl TokenGrant {
    /// Turn the grant into a brand-new credential for `provider`.
    pub fn into_credentials(self, provider: &str, now_ms: i64) -> OAuthCredentials {
        OAuthCredentials {
            provider: provider.to_owned(),
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: now_ms + self.expires_in_secs * 1000,
            account_id: self.account_id,
            project_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
