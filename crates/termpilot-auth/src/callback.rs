//! Loopback callback server for OAuth redirects.
//!
//! Binds `127.0.0.1:<port>`, answers the first redirect with a small HTML
//! page and hands the `(code, state)` pair to the waiting login flow over a
//! single-shot channel. When the port cannot be bound the caller falls back
//! to asking the user to paste the redirect URL; [`parse_redirect_input`]
//! handles that path.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use url::Url;

use crate::error::{AuthError, Result};

/// Default time to wait for the browser redirect.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// HTML page served to the browser after a successful redirect.
const SUCCESS_HTML: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>termpilot</title></head>
<body style="font-family: sans-serif; text-align: center; margin-top: 15%;">
<h2>Login complete</h2>
<p>You can close this tab and return to the terminal.</p>
</body>
</html>"#;

/// Authorization code and state delivered by a redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: String,
    pub state: Option<String>,
}

/// A running callback server.
pub struct CallbackServer {
    port: u16,
    receiver: oneshot::Receiver<Result<CallbackParams>>,
    timeout: Duration,
}

impl CallbackServer {
    /// Bind the loopback port and start waiting for one redirect.
    ///
    /// # Errors
    ///
    /// [`AuthError::CallbackUnavailable`] if the port cannot be bound; the
    /// caller should switch to manual paste mode.
    pub async fn spawn(port: u16, timeout: Duration) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| AuthError::CallbackUnavailable {
                port,
                reason: e.to_string(),
            })?;
        let bound_port = listener.local_addr()?.port();

        tracing::info!(port = bound_port, "callback server listening for OAuth redirect");

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = accept_one(&listener).await;
            if tx.send(outcome).is_err() {
                tracing::debug!("callback receiver dropped before redirect arrived");
            }
        });

        Ok(Self {
            port: bound_port,
            receiver: rx,
            timeout,
        })
    }

    /// The port actually bound (useful when spawned on port 0).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the redirect.
    ///
    /// # Errors
    ///
    /// [`AuthError::CallbackTimeout`] when the timeout elapses, or the parse
    /// error for a malformed redirect.
    pub async fn wait(self) -> Result<CallbackParams> {
        let timeout_secs = self.timeout.as_secs();
        match tokio::time::timeout(self.timeout, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AuthError::FlowFailed {
                reason: "callback server stopped unexpectedly".into(),
            }),
            Err(_) => Err(AuthError::CallbackTimeout { timeout_secs }),
        }
    }
}

/// Accept a single connection, parse the request, send a response.
async fn accept_one(listener: &TcpListener) -> Result<CallbackParams> {
    let (mut stream, peer) = listener.accept().await?;
    tracing::debug!(peer = %peer, "accepted callback connection");

    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let parsed = parse_request_line(&request);
    let (status, body) = match &parsed {
        Ok(_) => ("200 OK", SUCCESS_HTML.to_owned()),
        Err(e) => ("400 Bad Request", format!("<html><body><p>{e}</p></body></html>")),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    parsed
}

/// Extract the callback parameters from a raw HTTP GET request.
fn parse_request_line(request: &str) -> Result<CallbackParams> {
    let request_line = request
        .lines()
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| AuthError::FlowFailed {
            reason: "empty HTTP request".to_string(),
        })?;

    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| AuthError::FlowFailed {
            reason: format!("malformed HTTP request line: {request_line}"),
        })?;

    let query = target
        .split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| AuthError::FlowFailed {
            reason: "callback request has no query string".to_string(),
        })?;

    params_from_query(query)
}

fn params_from_query(query: &str) -> Result<CallbackParams> {
    let mut code = None;
    let mut state = None;

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => {
                return Err(AuthError::FlowFailed {
                    reason: format!("authorization server returned error: {value}"),
                });
            }
            _ => {}
        }
    }

    let code = code.ok_or_else(|| AuthError::FlowFailed {
        reason: "callback missing 'code' parameter".to_string(),
    })?;

    Ok(CallbackParams { code, state })
}

/// Parse what the user pasted in manual mode.
///
/// Accepts a full redirect URL, a bare query string, `code#state`, or a
/// bare code.
pub fn parse_redirect_input(input: &str) -> Result<CallbackParams> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AuthError::FlowFailed {
            reason: "no authorization code entered".into(),
        });
    }

    if let Ok(url) = Url::parse(input)
        && let Some(query) = url.query()
    {
        return params_from_query(query);
    }

    if input.contains("code=") {
        let query = input.trim_start_matches('?');
        return params_from_query(query);
    }

    let (code, state) = crate::oauth::split_code_and_state(input);
    Ok(CallbackParams { code, state })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_standard_request() {
        let request =
            "GET /callback?code=abc123&state=xyz789 HTTP/1.1\r\nHost: 127.0.0.1:1455\r\n\r\n";
        let params = parse_request_line(request).unwrap();
        assert_eq!(params.code, "abc123");
        assert_eq!(params.state.as_deref(), Some("xyz789"));
    }

    #[test]
    fn parse_percent_encoded_values() {
        let request = "GET /cb?code=abc%20def&state=123%2B456 HTTP/1.1\r\n\r\n";
        let params = parse_request_line(request).unwrap();
        assert_eq!(params.code, "abc def");
        assert_eq!(params.state.as_deref(), Some("123+456"));
    }

    #[test]
    fn parse_missing_code_fails() {
        let err = parse_request_line("GET /cb?state=xyz HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("missing 'code'"));
    }

    #[test]
    fn parse_error_param_fails() {
        let err =
            parse_request_line("GET /cb?error=access_denied HTTP/1.1\r\n\r\n").unwrap_err();
        assert!(err.to_string().contains("access_denied"));
    }

    #[test]
    fn parse_without_query_fails() {
        assert!(parse_request_line("GET /cb HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request_line("").is_err());
        assert!(parse_request_line("NOTHTTP").is_err());
    }

    #[test]
    fn pasted_full_url() {
        let p = parse_redirect_input("http://localhost:1455/auth/callback?code=c1&state=s1").unwrap();
        assert_eq!(p.code, "c1");
        assert_eq!(p.state.as_deref(), Some("s1"));
    }

    #[test]
    fn pasted_code_hash_state() {
        let p = parse_redirect_input("c2#s2\n").unwrap();
        assert_eq!(p.code, "c2");
        assert_eq!(p.state.as_deref(), Some("s2"));
    }

    #[test]
    fn pasted_query_string() {
        let p = parse_redirect_input("?code=c3&state=s3").unwrap();
        assert_eq!(p.code, "c3");
    }

    #[test]
    fn pasted_empty_is_error() {
        assert!(parse_redirect_input("   ").is_err());
    }

    #[tokio::test]
    async fn server_delivers_code_over_channel() {
        let server = CallbackServer::spawn(0, Duration::from_secs(5)).await.unwrap();
        let port = server.port();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
            stream
                .write_all(b"GET /auth/callback?code=test_code_42&state=st HTTP/1.1\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf).into_owned()
        });

        let params = server.wait().await.unwrap();
        let response = client.await.unwrap();

        assert_eq!(params.code, "test_code_42");
        assert_eq!(params.state.as_deref(), Some("st"));
        assert!(response.contains("200 OK"));
        assert!(response.contains("Login complete"));
    }

    #[tokio::test]
    async fn server_times_out() {
        let server = CallbackServer::spawn(0, Duration::from_millis(50)).await.unwrap();
        let err = server.wait().await.unwrap_err();
        assert!(matches!(err, AuthError::CallbackTimeout { .. }));
    }

    #[tokio::test]
    async fn busy_port_reports_unavailable() {
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();
        let err = CallbackServer::spawn(port, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::CallbackUnavailable { .. }));
    }
}
