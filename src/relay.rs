//! Response relay.
//!
//! Forwards a downstream provider response to the original caller in either
//! streaming or buffered mode, and owns the cancellation context combining
//! the two abort sources: the caller disconnecting, and the force-abort
//! raised once the caller's stream has been fully flushed (so the
//! downstream connection is torn down promptly instead of lingering).

use actix_web::HttpResponse;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancellation context for one relay operation.
///
/// The root token is cancelled by whichever fires first: the caller's
/// response stream being dropped (client disconnect) or completing
/// normally (force abort after flush). The body copy observes a derived
/// child token.
pub struct RelayCancellation {
    root: CancellationToken,
}

impl RelayCancellation {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
        }
    }

    /// Derived signal for the copy loop.
    pub fn child(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Guard that raises the root signal when dropped.
    pub fn abort_guard(&self) -> AbortGuard {
        AbortGuard(self.root.clone())
    }

    pub fn cancel(&self) {
        self.root.cancel();
    }
}

impl Default for RelayCancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Fires the force-abort signal on drop. Held by the streaming body, so the
/// signal is raised both when the caller disconnects (body dropped early)
/// and when the last byte has been flushed (body dropped at end).
pub struct AbortGuard(CancellationToken);

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn actix_status(status: reqwest::StatusCode) -> actix_web::http::StatusCode {
    actix_web::http::StatusCode::from_u16(status.as_u16()).unwrap()
}

/// Streaming relay: headers are already read; a non-success status is
/// relayed bodyless, a success body is piped byte-for-byte. A cancellation
/// observed mid-copy ends the relay silently.
pub fn relay_streaming(upstream: reqwest::Response, cancellation: RelayCancellation) -> HttpResponse {
    let status = upstream.status();
    if !status.is_success() {
        warn!(status = %status, "downstream returned non-success status");
        return HttpResponse::build(actix_status(status)).finish();
    }

    let upstream_ct = upstream.headers().get("content-type").cloned();
    let cancel = cancellation.child();
    let guard = cancellation.abort_guard();
    let mut body = Box::pin(upstream.bytes_stream());

    let stream = async_stream::stream! {
        let _guard = guard;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stream relay aborted");
                    break;
                }
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => yield Ok::<Bytes, std::io::Error>(bytes),
                    Some(Err(e)) => {
                        yield Err(std::io::Error::other(e.to_string()));
                        break;
                    }
                    None => break,
                },
            }
        }
    };

    let mut response = HttpResponse::build(actix_status(status));
    if let Some(ct) = upstream_ct.as_ref().and_then(|v| v.to_str().ok()) {
        response.insert_header(("content-type", ct));
    }
    response
        .insert_header(("cache-control", "no-cache"))
        .streaming(stream)
}

/// Buffered relay: await the full downstream body; a non-success status is
/// relayed bodyless, a success body is returned with a JSON content type.
pub async fn relay_buffered(upstream: reqwest::Response) -> HttpResponse {
    let status = upstream.status();
    if !status.is_success() {
        warn!(status = %status, "downstream returned non-success status");
        return HttpResponse::build(actix_status(status)).finish();
    }

    let bytes = upstream.bytes().await.unwrap_or_default();
    HttpResponse::build(actix_status(status))
        .content_type("application/json")
        .body(bytes)
}
