//! OAuth callback relay.
//!
//! The guest has no listening ports reachable from a host browser, so an
//! agent's OAuth flow would dead-end at its `http://localhost:<port>/...`
//! redirect. When the URL-open watcher spots such a redirect it starts
//! this relay: a one-shot HTTP listener on the same host port that
//! captures the callback, republishes the full URL through the bootstrap
//! directory for the guest poller, and shows the browser a success page.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::bootstrap::BootstrapDir;
use crate::errors::{FaizeError, FaizeResult};

/// Hard cap on how long the relay waits for the callback.
const RELAY_TIMEOUT: Duration = Duration::from_secs(300);
/// After the callback is handled, late retries get `410 Gone` for this long.
const LINGER_AFTER_HANDLED: Duration = Duration::from_millis(500);

const SUCCESS_BODY: &str =
    "<!DOCTYPE html><html><body><p>Authentication successful. You can close this tab.</p></body></html>";

/// Extract the localhost port from an OAuth authorization URL's
/// `redirect_uri` query parameter.
///
/// Returns `Some(port)` only for `http://localhost:<port>/...` with
/// `1024 <= port <= 65535`; anything else (other hosts, https, missing or
/// privileged ports) returns `None`.
pub fn parse_oauth_redirect(raw_url: &str) -> Option<String> {
    let url = url::Url::parse(raw_url).ok()?;

    let redirect_uri = url
        .query_pairs()
        .find(|(key, _)| key == "redirect_uri")
        .map(|(_, value)| value.into_owned())?;

    let redirect = url::Url::parse(&redirect_uri).ok()?;
    if redirect.scheme() != "http" {
        return None;
    }
    if redirect.host_str() != Some("localhost") {
        return None;
    }

    // `Url::port` hides the scheme default, so an explicit :80 also comes
    // back as None, which is below 1024 anyway.
    let port = redirect.port()?;
    if port < 1024 {
        return None;
    }
    Some(port.to_string())
}

/// Serve exactly one callback request on `127.0.0.1:<port>`.
///
/// Shuts down on the first of: callback handled, `done` cancelled, or the
/// five-minute timeout. The bind happens before this returns so a relay
/// that cannot get its port fails fast.
pub async fn start_oauth_relay(
    done: CancellationToken,
    bootstrap: BootstrapDir,
    port: &str,
) -> FaizeResult<tokio::task::JoinHandle<()>> {
    let listener = TcpListener::bind(("127.0.0.1", port.parse::<u16>().map_err(|_| {
        FaizeError::Config(format!("invalid relay port: {port}"))
    })?))
    .await
    .map_err(|e| FaizeError::Io(e))?;

    let port = port.to_string();
    Ok(tokio::spawn(async move {
        relay_loop(listener, done, bootstrap, &port).await;
    }))
}

async fn relay_loop(
    listener: TcpListener,
    done: CancellationToken,
    bootstrap: BootstrapDir,
    port: &str,
) {
    let deadline = tokio::time::sleep(RELAY_TIMEOUT);
    tokio::pin!(deadline);

    let mut handled = false;
    // Armed once the callback is handled; gives racing retries their 410.
    // The initial value is inert; the select arm is gated on `handled`.
    let linger = tokio::time::sleep(RELAY_TIMEOUT);
    tokio::pin!(linger);

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = &mut deadline => {
                tracing::debug!(port, "OAuth relay timed out");
                break;
            }
            _ = &mut linger, if handled => break,
            res = listener.accept() => {
                let Ok((conn, _)) = res else { continue };
                match serve_connection(conn, &bootstrap, port, handled).await {
                    Ok(true) if !handled => {
                        handled = true;
                        tracing::debug!(port, "OAuth callback received, relaying to VM");
                        linger.as_mut().reset(tokio::time::Instant::now() + LINGER_AFTER_HANDLED);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(error = %e, "OAuth relay request failed"),
                }
            }
        }
    }
}

/// Handle one HTTP connection. Returns `Ok(true)` when this request was
/// the captured callback.
async fn serve_connection(
    mut conn: TcpStream,
    bootstrap: &BootstrapDir,
    port: &str,
    already_handled: bool,
) -> FaizeResult<bool> {
    let uri = match read_request_uri(&mut conn).await? {
        Some(uri) => uri,
        None => return Ok(false),
    };

    if already_handled {
        respond(
            &mut conn,
            "410 Gone",
            "text/plain; charset=utf-8",
            "already handled",
        )
        .await?;
        return Ok(false);
    }

    let reconstructed = format!("http://localhost:{port}{uri}");
    bootstrap.write_auth_callback(&reconstructed)?;

    respond(&mut conn, "200 OK", "text/html; charset=utf-8", SUCCESS_BODY).await?;
    Ok(true)
}

/// Read the request head and return the request-URI of the first line.
async fn read_request_uri(conn: &mut TcpStream) -> FaizeResult<Option<String>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    // Read until the end of headers or a sane cap.
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.len() < 8192 {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let head = String::from_utf8_lossy(&buf);
    let mut parts = head.lines().next().unwrap_or("").split_whitespace();
    let _method = parts.next();
    Ok(parts.next().map(str::to_string))
}

async fn respond(
    conn: &mut TcpStream,
    status: &str,
    content_type: &str,
    body: &str,
) -> FaizeResult<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    conn.write_all(response.as_bytes()).await?;
    conn.shutdown().await?;
    Ok(())
}
