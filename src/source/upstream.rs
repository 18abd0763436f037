// Upstream HTTP access for HLS and direct sessions - bounded fetches, Range forwarding, header mirroring.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderName, Response},
};
use futures::{stream, StreamExt};
use reqwest::{redirect, Client, RequestBuilder, Url};
use tracing::{debug, warn};

use crate::config::MAX_MANIFEST_BYTES;
use crate::engine::session::SessionLease;
use crate::engine::stats::RelayStats;
use crate::engine::transfer::TransferStream;
use crate::error::{RelayError, RelayResult};

const MAX_REDIRECTS: usize = 10;

/// Response headers copied from the upstream onto relayed responses.
pub const RELAYED_HEADERS: [HeaderName; 4] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
];

/// Parse and check a client-supplied upstream URL: absolute, `http` or `https`, with a host.
pub fn validate_http_url(raw: &str) -> RelayResult<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| RelayError::validation(format!("invalid url {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RelayError::validation(format!(
            "unsupported url scheme {:?}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(RelayError::validation("url has no host"));
    }
    Ok(url)
}

/// Client-side request details forwarded upstream.
#[derive(Debug, Clone, Default)]
pub struct Forwarded {
    pub range: Option<String>,
    pub user_agent: Option<String>,
}

pub struct UpstreamClient {
    client: Client,
    timeout: Duration,
}

impl UpstreamClient {
    /// Client following redirects anywhere, up to reqwest's default limit.
    pub fn new(timeout: Duration) -> RelayResult<Self> {
        Self::with_redirects(timeout, redirect::Policy::default())
    }

    /// Client that only follows redirects staying on the first request's
    /// scheme, host and port.
    pub fn same_origin(timeout: Duration) -> RelayResult<Self> {
        let policy = redirect::Policy::custom(|attempt| {
            let same = attempt
                .previous()
                .first()
                .is_some_and(|first| first.origin() == attempt.url().origin());
            if attempt.previous().len() > MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if same {
                attempt.follow()
            } else {
                warn!("refusing cross-origin redirect to {}", attempt.url());
                attempt.stop()
            }
        });
        Self::with_redirects(timeout, policy)
    }

    fn with_redirects(timeout: Duration, policy: redirect::Policy) -> RelayResult<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .redirect(policy)
            .build()
            .map_err(|e| RelayError::Internal(format!("failed to build http client: {e}")))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn build_request(&self, url: &Url, fwd: &Forwarded) -> RequestBuilder {
        let mut req = self.client.get(url.clone());
        if let Some(range) = &fwd.range {
            req = req.header(header::RANGE, range.as_str());
        }
        if let Some(ua) = &fwd.user_agent {
            req = req.header(header::USER_AGENT, ua.as_str());
        }
        req
    }

    /// Send a GET and wait for response headers, bounded by the upstream timeout.
    pub async fn send(&self, url: &Url, fwd: &Forwarded) -> RelayResult<reqwest::Response> {
        debug!("upstream GET {} range={:?}", url, fwd.range);
        match tokio::time::timeout(self.timeout, self.build_request(url, fwd).send()).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => {
                warn!("upstream request to {} failed: {}", url, e);
                Err(e.into())
            }
            Err(_) => {
                warn!(
                    "upstream {} did not respond within {}s",
                    url,
                    self.timeout.as_secs()
                );
                Err(RelayError::UpstreamTimeout(format!(
                    "{url} did not respond within {}s",
                    self.timeout.as_secs()
                )))
            }
        }
    }

    /// Fetch a text document (playlist). Non-2xx statuses and bodies above
    /// `MAX_MANIFEST_BYTES` are upstream failures.
    pub async fn fetch_text(&self, url: &Url, user_agent: Option<&str>) -> RelayResult<String> {
        let fwd = Forwarded {
            range: None,
            user_agent: user_agent.map(str::to_string),
        };
        let resp = self.send(url, &fwd).await?;
        let status = resp.status();
        if !status.is_success() {
            warn!("upstream {} returned HTTP {}", url, status.as_u16());
            return Err(RelayError::upstream(format!(
                "{url} returned HTTP {}",
                status.as_u16()
            )));
        }
        read_text_limited(resp, self.timeout).await
    }

    /// Mirror an upstream response onto the client: status, the streaming
    /// subset of headers, and the body streamed under the session lease.
    pub fn mirror(
        &self,
        resp: reqwest::Response,
        lease: SessionLease,
        stats: Arc<RelayStats>,
    ) -> RelayResult<Response<Body>> {
        let mut builder = Response::builder().status(resp.status());
        for name in RELAYED_HEADERS.iter() {
            if let Some(value) = resp.headers().get(name) {
                builder = builder.header(name, value.clone());
            }
        }

        let body = stalling_after(resp, self.timeout);
        let transfer = TransferStream::new(Box::pin(body), lease, stats);
        builder
            .body(transfer.into_body())
            .map_err(|e| RelayError::Internal(format!("failed to build response: {e}")))
    }
}

/// Upstream body chunks, failing with `TimedOut` once no chunk arrives within `stall`.
fn stalling_after(
    resp: reqwest::Response,
    stall: Duration,
) -> impl futures::Stream<Item = io::Result<bytes::Bytes>> + Send {
    let chunks = resp.bytes_stream().boxed();
    stream::unfold(Some(chunks), move |state| async move {
        let mut chunks = state?;
        match tokio::time::timeout(stall, chunks.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(chunks))),
            Ok(Some(Err(e))) => Some((Err(io::Error::other(e)), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("upstream body stalled for {}s", stall.as_secs()),
                )),
                None,
            )),
        }
    })
}

/// Read a response body as text, enforcing the manifest size limit and a read deadline.
pub async fn read_text_limited(resp: reqwest::Response, timeout: Duration) -> RelayResult<String> {
    if let Some(len) = resp.content_length() {
        if len as usize > MAX_MANIFEST_BYTES {
            return Err(RelayError::upstream(format!(
                "playlist too large ({len} bytes, max {MAX_MANIFEST_BYTES})"
            )));
        }
    }
    let bytes = match tokio::time::timeout(timeout, resp.bytes()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(RelayError::UpstreamTimeout(
                "timed out reading playlist body".into(),
            ))
        }
    };
    if bytes.len() > MAX_MANIFEST_BYTES {
        return Err(RelayError::upstream(format!(
            "playlist too large ({} bytes, max {MAX_MANIFEST_BYTES})",
            bytes.len()
        )));
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
