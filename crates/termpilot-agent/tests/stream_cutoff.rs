//! A stream that closes before the provider's terminator is a failed call,
//! never a short answer.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use termpilot_agent::llm::types::Role;
use termpilot_agent::{
    Agent, AgentConfig, AgentError, ErrorKind, LlmClient, LlmClientConfig, MemoryConfig, MemoryManager, ToolExecutor,
    ToolRegistry,
};

/// Serve every request with `body` as an event stream, then close.
async fn spawn_stub(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
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
                let head = String::from_utf8_lossy(&raw[..header_end]).to_ascii_lowercase();
                let content_length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while raw.len() < header_end + content_length {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    raw.extend_from_slice(&buf[..n]);
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

fn agent_for(base: &str) -> Agent {
    let client = LlmClient::new(
        LlmClientConfig::new(base, "gpt-4o-mini")
            .with_provider("openai")
            .with_api_key("sk-test-0123456789abcdef0123"),
    )
    .unwrap();
    Agent::new(
        AgentConfig::new("gpt-4o-mini"),
        Arc::new(client),
        Arc::new(ToolExecutor::new(Arc::new(ToolRegistry::new()))),
        MemoryManager::new(MemoryConfig::default()),
    )
}

#[tokio::test]
async fn stream_without_done_is_an_error() {
    let base = spawn_stub("data: {\"choices\":[{\"delta\":{\"content\":\"Partial ans\"}}]}\n\n").await;
    let agent = agent_for(&base);

    let err = agent.chat("hi", &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, AgentError::LlmStreamError { .. }), "{err:?}");
    assert_eq!(err.kind(), ErrorKind::Transport);

    // Only the user message was kept; the partial text was not stored.
    let roles: Vec<Role> = agent.with_memory(|m| m.short_term().map(|i| i.to_message().role).collect());
    assert_eq!(roles, vec![Role::User]);
}

#[tokio::test]
async fn stream_with_done_completes() {
    let base = spawn_stub(concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Full answer\"}}]}\n\n",
        "data: [DONE]\n\n",
    ))
    .await;
    let agent = agent_for(&base);

    let answer = agent.chat("hi", &CancellationToken::new()).await.unwrap();
    assert_eq!(answer, "Full answer");
}
