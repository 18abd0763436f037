// Response body wrapper that keeps a session leased for the lifetime of a transfer.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::Bytes;
use futures::stream::{BoxStream, Stream};
use tracing::{debug, error};

use super::session::SessionLease;
use super::stats::RelayStats;

/// Streams bytes to the client while holding a `SessionLease`.
///
/// Each chunk refreshes the session's last-access time. Once headers are out,
/// a backend error is logged and surfaced as a body error, which makes the
/// server terminate the connection. Dropping the body (client disconnect)
/// drops the backend stream and the lease.
pub struct TransferStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
    lease: SessionLease,
    stats: Arc<RelayStats>,
    sent: u64,
    finished: bool,
}

impl TransferStream {
    pub fn new(
        inner: BoxStream<'static, io::Result<Bytes>>,
        lease: SessionLease,
        stats: Arc<RelayStats>,
    ) -> Self {
        stats.transfer_started();
        Self {
            inner,
            lease,
            stats,
            sent: 0,
            finished: false,
        }
    }

    pub fn into_body(self) -> Body {
        Body::from_stream(self)
    }

    fn finish(&mut self, failed: bool) {
        if !self.finished {
            self.finished = true;
            self.stats.transfer_finished(failed);
        }
    }
}

impl Stream for TransferStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.sent += chunk.len() as u64;
                self.stats.record_served(chunk.len() as u64);
                self.lease.touch();
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                error!(
                    "{} session {} transfer failed after {} bytes: {}",
                    self.lease.kind(),
                    self.lease.id(),
                    self.sent,
                    e
                );
                self.finish(true);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                debug!(
                    "{} session {} transfer complete ({} bytes)",
                    self.lease.kind(),
                    self.lease.id(),
                    self.sent
                );
                self.finish(false);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TransferStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "{} session {} transfer aborted by client after {} bytes",
                self.lease.kind(),
                self.lease.id(),
                self.sent
            );
            self.finish(false);
        }
    }
}
