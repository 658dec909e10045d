//! Token refresh against an in-process token endpoint.
//!
//! A tiny HTTP/1.1 responder built on `TcpListener` stands in for the
//! provider so these tests never leave the machine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use termpilot_auth::{
    AuthError, CredentialStore, OAuthCredentials, OAuthProvider, OAuthStore, ProviderRegistry,
    TokenRefresher, now_ms,
};

// ═══════════════════════════════════════════════════════════════════════
//  Stub token endpoint
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    body: String,
}

type Responder = Arc<dyn Fn(&Recorded) -> (u16, String) + Send + Sync>;

async fn spawn_stub(responder: Responder) -> (String, Arc<Mutex<Vec<Recorded>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_task = seen.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let responder = responder.clone();
            let seen = seen_task.clone();
            tokio::spawn(async move {
                let mut raw = Vec::new();
                let mut buf = [0u8; 4096];
                let header_end = loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    raw.extend_from_slice(&buf[..n]);
                    if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                };
                let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
                let content_length = head
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                while raw.len() < header_end + content_length {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                }
                let path = head
                    .lines()
                    .next()
                    .and_then(|l| l.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();
                let body = String::from_utf8_lossy(&raw[header_end..]).into_owned();
                let recorded = Recorded { path, body };
                seen.lock().unwrap().push(recorded.clone());

                let (status, payload) = responder(&recorded);
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), seen)
}

fn provider_at(base: &str) -> OAuthProvider {
    let mut p = OAuthProvider::anthropic();
    p.token_url = format!("{base}/v1/oauth/token");
    p
}

async fn refresher_for(
    dir: &tempfile::TempDir,
    base: &str,
    creds: OAuthCredentials,
) -> TokenRefresher {
    let store = Arc::new(CredentialStore::open(dir.path().join("oauth.json")).unwrap());
    store.upsert(creds).await.unwrap();
    let mut registry = ProviderRegistry::builtin();
    registry.insert(provider_at(base));
    TokenRefresher::new(store, registry).unwrap()
}

fn expiring_creds() -> OAuthCredentials {
    OAuthCredentials {
        provider: "anthropic".into(),
        access_token: "old-token".into(),
        refresh_token: Some("refresh-1".into()),
        expires_at: now_ms() + 2 * 60 * 1000,
        account_id: None,
        project_id: None,
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn refresh_before_expiry_persists_new_token() {
    let (base, seen) = spawn_stub(Arc::new(|_| {
        (
            200,
            r#"{"access_token":"new-token","refresh_token":"refresh-2","expires_in":3600}"#.into(),
        )
    }))
    .await;
    let dir = tempfile::tempdir().unwrap();
    let refresher = refresher_for(&dir, &base, expiring_creds()).await;

    let before = now_ms();
    let creds = refresher.valid_credentials("anthropic").await.unwrap();

    assert_eq!(creds.access_token, "new-token");
    assert_eq!(creds.refresh_token.as_deref(), Some("refresh-2"));
    assert!(creds.expires_at > before + 60_000);

    let on_disk = OAuthStore::load(&dir.path().join("oauth.json")).unwrap();
    assert_eq!(on_disk.get("anthropic").unwrap().access_token, "new-token");

    let requests = seen.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/v1/oauth/token");
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(body["grant_type"], "refresh_token");
    assert_eq!(body["refresh_token"], "refresh-1");
    assert_eq!(body["client_id"], OAuthProvider::anthropic().client_id);
}

#[tokio::test]
async fn concurrent_refreshes_hit_the_endpoint_once() {
    let (base, seen) = spawn_stub(Arc::new(|_| {
        std::thread::sleep(Duration::from_millis(50));
        (
            200,
            r#"{"access_token":"coalesced","expires_in":3600}"#.into(),
        )
    }))
    .await;
    let dir = tempfile::tempdir().unwrap();
    let refresher = Arc::new(refresher_for(&dir, &base, expiring_creds()).await);

    let mut handles = Vec::new();
    for _ in 0..5 {
        let r = refresher.clone();
        handles.push(tokio::spawn(async move {
            r.valid_credentials("anthropic").await.unwrap()
        }));
    }
    for h in handles {
        assert_eq!(h.await.unwrap().access_token, "coalesced");
    }

    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn non_200_refresh_returns_truncated_body() {
    let long_body = format!(r#"{{"error":"invalid_grant","detail":"{}"}}"#, "z".repeat(500));
    let (base, _) = spawn_stub(Arc::new(move |_| (400, long_body.clone()))).await;
    let dir = tempfile::tempdir().unwrap();
    let refresher = refresher_for(&dir, &base, expiring_creds()).await;

    let err = refresher.valid_credentials("anthropic").await.unwrap_err();
    match &err {
        AuthError::TokenEndpoint { status, body } => {
            assert_eq!(*status, 400);
            assert!(body.chars().count() <= 203);
            assert!(body.contains("invalid_grant"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.requires_login());

    let on_disk = OAuthStore::load(&dir.path().join("oauth.json")).unwrap();
    assert_eq!(on_disk.get("anthropic").unwrap().access_token, "old-token");
}

#[tokio::test]
async fn exchange_code_posts_json_grant() {
    let (base, seen) = spawn_stub(Arc::new(|_| {
        (200, r#"{"access_token":"a1","refresh_token":"r1","expires_in":7200}"#.into())
    }))
    .await;
    let client = termpilot_auth::TokenClient::new().unwrap();
    let provider = provider_at(&base);

    let creds = client
        .exchange_code(&provider, "the-code", "the-state", "the-verifier")
        .await
        .unwrap();
    assert_eq!(creds.provider, "anthropic");
    assert_eq!(creds.access_token, "a1");

    let body: serde_json::Value =
        serde_json::from_str(&seen.lock().unwrap()[0].body).unwrap();
    assert_eq!(body["grant_type"], "authorization_code");
    assert_eq!(body["code"], "the-code");
    assert_eq!(body["state"], "the-state");
    assert_eq!(body["code_verifier"], "the-verifier");
    assert_eq!(body["redirect_uri"], provider.redirect_uri);
}
