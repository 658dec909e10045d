//! Per-user OAuth credential store.
//!
//! The store is a JSON object mapping provider id to credentials, kept at
//! `<config>/oauth.json` with owner-only permissions. Older installs wrote a
//! single flat credential object; that form is still accepted on load and is
//! rewritten as a map on the next save.
//!
//! Writes go to a temporary sibling file which is then renamed over the
//! target, so a crash never leaves a half-written store behind.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::credentials::OAuthCredentials;
use crate::error::{AuthError, Result};

/// Provider assumed for a legacy flat credential without a `provider` field.
pub const LEGACY_DEFAULT_PROVIDER: &str = "anthropic";

// ---------------------------------------------------------------------------
// In-memory document
// ---------------------------------------------------------------------------

/// The decoded store document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthStore {
    credentials: BTreeMap<String, OAuthCredentials>,
}

/// Credential entry as it may appear on disk (provider optional).
#[derive(Debug, Deserialize)]
struct StoredEntry {
    provider: Option<String>,
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_at: i64,
    #[serde(default)]
    account_id: Option<String>,
    #[serde(default)]
    project_id: Option<String>,
}

impl StoredEntry {
    fn into_credentials(self, fallback_provider: &str) -> OAuthCredentials {
        OAuthCredentials {
            provider: self
                .provider
                .unwrap_or_else(|| fallback_provider.to_owned()),
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_at,
            account_id: self.account_id,
            project_id: self.project_id,
        }
    }
}

impl OAuthStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials for `provider`, if any.
    pub fn get(&self, provider: &str) -> Option<&OAuthCredentials> {
        self.credentials.get(provider)
    }

    /// Insert or replace credentials, keyed by their provider.
    pub fn upsert(&mut self, credentials: OAuthCredentials) {
        self.credentials
            .insert(credentials.provider.clone(), credentials);
    }

    /// Remove credentials for `provider`, returning them.
    pub fn remove(&mut self, provider: &str) -> Option<OAuthCredentials> {
        self.credentials.remove(provider)
    }

    /// Provider ids with stored credentials, sorted.
    pub fn providers(&self) -> Vec<String> {
        self.credentials.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Decode a store document, accepting both the map and the legacy flat
    /// single-credential form.
    pub fn from_json(text: &str, origin: &Path) -> Result<Self> {
        let malformed = |reason: String| AuthError::MalformedStore {
            path: origin.display().to_string(),
            reason,
        };

        if text.trim().is_empty() {
            return Ok(Self::new());
        }

        let value: Value = serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(malformed("top level is not an object".into()));
        };

        let mut store = Self::new();

        if map.contains_key("access_token") {
            let entry: StoredEntry = serde_json::from_value(Value::Object(map))
                .map_err(|e| malformed(format!("legacy credential: {e}")))?;
            store.upsert(entry.into_credentials(LEGACY_DEFAULT_PROVIDER));
            return Ok(store);
        }

        for (key, raw) in map {
            let entry: StoredEntry = serde_json::from_value(raw)
                .map_err(|e| malformed(format!("entry `{key}`: {e}")))?;
            let mut credentials = entry.into_credentials(&key);
            // The map key is authoritative.
            credentials.provider = key;
            store.upsert(credentials);
        }

        Ok(store)
    }

    /// Encode as the canonical map form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.credentials)?)
    }

    /// Load from `path`; a missing file is an empty store.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json(&text, path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically write to `path` with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        write_private_atomic(path, json.as_bytes())
    }
}

/// Write `bytes` to `path` via a temp file + rename, mode 0600 on unix.
pub fn write_private_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "oauth.json".to_owned());
    let tmp_path = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));

    {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
    }

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared file-backed store
// ---------------------------------------------------------------------------

/// Process-wide handle on the store file.
///
/// Readers get a consistent snapshot; writers serialize and persist before
/// releasing the lock.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    inner: RwLock<OAuthStore>,
}

impl CredentialStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = OAuthStore::load(&path)?;
        tracing::debug!(path = %path.display(), providers = store.credentials.len(), "oauth store loaded");
        Ok(Self {
            path,
            inner: RwLock::new(store),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the credentials for `provider`.
    pub async fn get(&self, provider: &str) -> Option<OAuthCredentials> {
        self.inner.read().await.get(provider).cloned()
    }

    /// Snapshot of the whole document.
    pub async fn snapshot(&self) -> OAuthStore {
        self.inner.read().await.clone()
    }

    /// Insert or replace credentials and persist.
    pub async fn upsert(&self, credentials: OAuthCredentials) -> Result<()> {
        let mut guard = self.inner.write().await;
        let mut next = guard.clone();
        next.upsert(credentials);
        next.save(&self.path)?;
        *guard = next;
        Ok(())
    }

    /// Remove credentials for `provider` and persist. Returns whether
    /// anything was removed.
    pub async fn remove(&self, provider: &str) -> Result<bool> {
        let mut guard = self.inner.write().await;
        if guard.get(provider).is_none() {
            return Ok(false);
        }
        let mut next = guard.clone();
        next.remove(provider);
        next.save(&self.path)?;
        *guard = next;
        tracing::info!(provider, "oauth credentials removed");
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(provider: &str, token: &str) -> OAuthCredentials {
        OAuthCredentials {
            provider: provider.into(),
            access_token: token.into(),
            refresh_token: Some(format!("{token}-refresh")),
            expires_at: 1_700_000_000_000,
            account_id: None,
            project_id: Some("p".into()),
        }
    }

    #[test]
    fn save_then_load_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth.json");

        let mut store = OAuthStore::new();
        store.upsert(creds("openai-codex", "b"));
        store.upsert(creds("anthropic", "a"));
        store.save(&path).unwrap();

        let loaded = OAuthStore::load(&path).unwrap();
        assert_eq!(loaded, store);
        assert_eq!(loaded.to_json().unwrap(), store.to_json().unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), store.to_json().unwrap());
    }

    #[test]
    fn legacy_flat_form_is_accepted() {
        let text = r#"{"access_token":"tok","refresh_token":"ref","expires_at":42}"#;
        let store = OAuthStore::from_json(text, Path::new("oauth.json")).unwrap();
        let c = store.get(LEGACY_DEFAULT_PROVIDER).unwrap();
        assert_eq!(c.access_token, "tok");
        assert_eq!(c.expires_at, 42);
    }

    #[test]
    fn legacy_flat_form_keeps_its_provider() {
        let text = r#"{"provider":"openai-codex","access_token":"tok","expires_at":1}"#;
        let store = OAuthStore::from_json(text, Path::new("oauth.json")).unwrap();
        assert!(store.get("openai-codex").is_some());
    }

    #[test]
    fn map_key_wins_over_embedded_provider() {
        let text = r#"{"anthropic":{"provider":"other","access_token":"t","expires_at":1}}"#;
        let store = OAuthStore::from_json(text, Path::new("oauth.json")).unwrap();
        assert_eq!(store.get("anthropic").unwrap().provider, "anthropic");
    }

    #[test]
    fn malformed_store_is_reported() {
        let err = OAuthStore::from_json("[1,2]", Path::new("x.json")).unwrap_err();
        assert!(err.to_string().contains("x.json"));
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = OAuthStore::load(&dir.path().join("absent.json")).unwrap();
        assert!(store.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt as _;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("oauth.json");
        let mut store = OAuthStore::new();
        store.upsert(creds("anthropic", "a"));
        store.save(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn save_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth.json");
        OAuthStore::new().save(&path).unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["oauth.json"]);
    }

    #[tokio::test]
    async fn credential_store_persists_upsert_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oauth.json");

        let shared = CredentialStore::open(&path).unwrap();
        shared.upsert(creds("anthropic", "a")).await.unwrap();
        assert_eq!(
            OAuthStore::load(&path).unwrap().get("anthropic").unwrap().access_token,
            "a"
        );

        assert!(shared.remove("anthropic").await.unwrap());
        assert!(!shared.remove("anthropic").await.unwrap());
        assert!(OAuthStore::load(&path).unwrap().is_empty());
    }
}
