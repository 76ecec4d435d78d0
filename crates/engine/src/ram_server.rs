//! Loopback byte server for RAM-tier inputs
//!
//! Encoders take a URL, not an in-process buffer, so RAM-cached sources are
//! served read-only on `127.0.0.1` at `GET /{token}`.

use crate::cache_store::CacheStore;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that can occur when running an HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Invalid listen address '{0}'")]
    InvalidAddr(String),
}

/// Handler for GET /{token}
async fn serve_token(
    State(store): State<Arc<CacheStore>>,
    Path(token): Path<String>,
) -> Response {
    match store.get(&token) {
        Some(data) => {
            debug!(bytes = data.len(), "serving RAM buffer");
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "video/mp4".to_string()),
                    (header::CONTENT_LENGTH, data.len().to_string()),
                ],
                data,
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Creates the router serving cache store buffers
pub fn create_ram_router(store: Arc<CacheStore>) -> Router {
    Router::new()
        .route("/:token", get(serve_token))
        .with_state(store)
}

/// `http://127.0.0.1:<port>/<token>`
pub fn loopback_url(port: u16, token: &str) -> String {
    format!("http://127.0.0.1:{}/{}", port, token)
}

/// Running loopback server
pub struct RamServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl RamServer {
    /// Bind an ephemeral loopback port and start serving
    ///
    /// The server stops when `shutdown` (or [`RamServer::shutdown`]) fires.
    pub async fn start(
        store: Arc<CacheStore>,
        shutdown: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let app = create_ram_router(store);

        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "loopback server stopped with error");
            }
        });

        info!(%addr, "loopback byte server listening");
        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections and wait for the server task
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;
    use axum::body::Body;
    use axum::http::Request;
    use bytes::Bytes;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_known_token_returns_full_buffer() {
        let store = Arc::new(CacheStore::new());
        let token = store.put_bytes(JobId::new(), Bytes::from_static(b"0123456789"));

        let response = create_ram_router(store)
            .oneshot(
                Request::builder()
                    .uri(format!("/{}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_unknown_token_is_404() {
        let store = Arc::new(CacheStore::new());
        let response = create_ram_router(store)
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_released_token_is_404() {
        let store = Arc::new(CacheStore::new());
        let job = JobId::new();
        let token = store.put_bytes(job, Bytes::from_static(b"abc"));
        store.release(job);

        let response = create_ram_router(store)
            .oneshot(
                Request::builder()
                    .uri(format!("/{}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_binds_loopback_and_serves() {
        let store = Arc::new(CacheStore::new());
        let token = store.put_bytes(JobId::new(), Bytes::from_static(b"payload"));
        let server = RamServer::start(store, CancellationToken::new()).await.unwrap();
        assert_eq!(
            loopback_url(server.port(), &token),
            format!("http://127.0.0.1:{}/{}", server.port(), token)
        );

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", server.port()))
            .await
            .unwrap();
        let request = format!(
            "GET /{} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            token
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw);
        assert!(text.starts_with("HTTP/1.1 200"));
        assert!(text.ends_with("payload"));

        server.shutdown().await;
    }
}
