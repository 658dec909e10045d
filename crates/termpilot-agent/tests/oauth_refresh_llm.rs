//! An OAuth-backed client refreshes an expiring token before the LLM call.
//!
//! One in-process HTTP/1.1 stub serves both the token endpoint and the
//! OpenAI-style streaming endpoint.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use termpilot_agent::{
    Agent, AgentConfig, LlmClient, LlmClientConfig, MemoryConfig, MemoryManager, ToolExecutor, ToolRegistry,
};
use termpilot_auth::{
    CredentialStore, OAuthCredentials, OAuthProvider, OAuthStore, ProviderRegistry, TokenRefresher, now_ms,
};

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    authorization: Option<String>,
    body: String,
}

const SSE_REPLY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hello \"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"from the stub\"}}]}\n\n",
    "data: [DONE]\n\n",
);

async fn spawn_stub() -> (String, Arc<Mutex<Vec<Recorded>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_task = seen.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
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
                let header = |name: &str| {
                    head.lines().find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case(name).then(|| v.trim().to_owned())
                    })
                };
                let content_length = header("content-length")
                    .and_then(|v| v.parse::<usize>().ok())
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
                    .to_owned();
                let recorded = Recorded {
                    authorization: header("authorization"),
                    body: String::from_utf8_lossy(&raw[header_end..]).into_owned(),
                    path,
                };
                seen.lock().unwrap().push(recorded.clone());

                let (content_type, payload) = if recorded.path.ends_with("/oauth/token") {
                    (
                        "application/json",
                        r#"{"access_token":"new-token","refresh_token":"refresh-2","expires_in":3600}"#.to_owned(),
                    )
                } else {
                    ("text/event-stream", SSE_REPLY.to_owned())
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{payload}",
                    payload.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (format!("http://{addr}"), seen)
}

#[tokio::test]
async fn expiring_token_is_refreshed_before_the_chat_request() {
    let (base, seen) = spawn_stub().await;
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("oauth.json");

    let store = Arc::new(CredentialStore::open(&store_path).unwrap());
    store
        .upsert(OAuthCredentials {
            provider: "anthropic".into(),
            access_token: "old-token".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: now_ms() + 2 * 60 * 1000,
            account_id: None,
            project_id: None,
        })
        .await
        .unwrap();
    let mut provider = OAuthProvider::anthropic();
    provider.token_url = format!("{base}/v1/oauth/token");
    let mut registry = ProviderRegistry::builtin();
    registry.insert(provider);
    let refresher = Arc::new(TokenRefresher::new(store, registry).unwrap());

    let client = LlmClient::new(
        LlmClientConfig::new(base.as_str(), "gpt-4o-mini")
            .with_provider("openai")
            .with_oauth("anthropic"),
    )
    .unwrap()
    .with_refresher(refresher);
    let agent = Agent::new(
        AgentConfig::new("gpt-4o-mini"),
        Arc::new(client),
        Arc::new(ToolExecutor::new(Arc::new(ToolRegistry::new()))),
        MemoryManager::new(MemoryConfig::default()),
    );

    let answer = agent.chat("hi", &CancellationToken::new()).await.unwrap();
    assert_eq!(answer, "Hello from the stub");

    let requests = seen.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].path, "/v1/oauth/token");
    let refresh: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(refresh["refresh_token"], "refresh-1");

    assert_eq!(requests[1].path, "/chat/completions");
    assert_eq!(requests[1].authorization.as_deref(), Some("Bearer new-token"));
    let chat: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
    assert_eq!(chat["model"], "gpt-4o-mini");
    assert_eq!(chat["stream"], true);

    let on_disk = OAuthStore::load(&store_path).unwrap();
    let creds = on_disk.get("anthropic").unwrap();
    assert_eq!(creds.access_token, "new-token");
    assert_eq!(creds.refresh_token.as_deref(), Some("refresh-2"));
    assert!(creds.expires_at > now_ms() + 30 * 60 * 1000);
}
