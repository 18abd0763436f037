// HTTP surface of the relay: route table, auth layer, server lifecycle.

pub mod auth;
pub mod handler;

use std::net::SocketAddr;

use anyhow::Result;
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use handler::RelayState;

/// Build the relay's route table. Everything except `/health` sits behind
/// the state's authorizer.
pub fn router(state: RelayState) -> Router {
    let protected = Router::new()
        .route("/api/torrent", post(handler::create_torrent))
        .route(
            "/api/torrent/{id}/files/{index}",
            get(handler::stream_torrent_file).head(handler::head_torrent_file),
        )
        .route("/api/hls", post(handler::create_hls))
        .route("/api/hls/{id}/manifest.m3u8", get(handler::hls_manifest))
        .route("/api/hls/{id}/segment/{*path}", get(handler::hls_segment))
        .route("/api/direct", post(handler::create_direct))
        .route("/api/direct/{id}/stream", get(handler::direct_stream))
        .route("/api/sessions", get(handler::list_sessions))
        .route("/api/sessions/{id}", delete(handler::delete_session))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(handler::health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct RelayServer {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RelayServer {
    /// Bind `addr` (port 0 picks a free port) and serve the relay routes.
    pub async fn start(addr: SocketAddr, state: RelayState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state);

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                error!("relay server stopped with error: {}", e);
            }
        });
        info!("relay listening on http://{}", addr);

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Absolute URL for a relay path such as `/api/direct/{id}/stream`.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop accepting connections and wait for in-flight requests to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("relay server on {} stopped", self.addr);
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}
