//! Loopback listener for the redirect sign-in flow.
//!
//! The listener is bound on `127.0.0.1` before the browser is opened, then
//! waits for the identity platform to redirect back with `code` and `state`
//! (or `error`) in the query string.

use crate::error::{AuthError, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::debug;

const FINISHED_RESPONSE: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n\
    <html><body><h1>Sign-in finished</h1><p>You may close this tab.</p></body></html>";

const NOT_FOUND_RESPONSE: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Bind the loopback callback port. Port `0` picks a free port.
pub async fn bind_loopback(port: u16) -> Result<TcpListener> {
    TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            AuthError::Callback(format!("port {port} is already in use"))
        } else {
            AuthError::Callback(format!("cannot bind callback port {port}: {e}"))
        }
    })
}

/// Wait for the authorization redirect on an already-bound listener.
///
/// Requests without `code` or `error` (favicons, browser preconnects) are
/// answered with 404 and skipped.
pub async fn accept_callback(
    listener: TcpListener,
    wait: Duration,
) -> Result<HashMap<String, String>> {
    tokio::time::timeout(wait, next_authorization_response(&listener))
        .await
        .map_err(|_| AuthError::Callback("timed out waiting for the sign-in redirect".into()))?
}

async fn next_authorization_response(listener: &TcpListener) -> Result<HashMap<String, String>> {
    loop {
        let (mut stream, peer) = listener.accept().await?;

        let mut buf = vec![0u8; 8192];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);
        let params = parse_query_from_request(&request)?;

        if params.contains_key("code") || params.contains_key("error") {
            stream.write_all(FINISHED_RESPONSE).await?;
            let _ = stream.shutdown().await;
            return Ok(params);
        }

        debug!("Ignoring callback request from {} without a result", peer);
        let _ = stream.write_all(NOT_FOUND_RESPONSE).await;
    }
}

fn parse_query_from_request(request: &str) -> Result<HashMap<String, String>> {
    // "GET /?code=...&state=... HTTP/1.1"
    let first_line = request.lines().next().unwrap_or("");
    let path = first_line.split_ascii_whitespace().nth(1).unwrap_or("/");
    let query = path.split_once('?').map_or("", |(_, q)| q);
    serde_urlencoded::from_str(query)
        .map_err(|e| AuthError::Callback(format!("invalid callback query: {e}")))
}
