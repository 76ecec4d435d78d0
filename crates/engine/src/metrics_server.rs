//! Metrics HTTP Server for tiercast
//!
//! Exposes the batch status snapshot at `GET /metrics` for dashboards and
//! monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::{MetricsSnapshot, SharedMetrics};
use crate::ram_server::ServerError;

/// Handler for GET /metrics endpoint
/// Returns the current MetricsSnapshot as JSON
async fn get_metrics(State(metrics): State<SharedMetrics>) -> Json<MetricsSnapshot> {
    let snapshot = metrics.read().clone();
    Json(snapshot)
}

/// Creates the axum Router with metrics endpoint
pub fn create_metrics_router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// Runs the metrics HTTP server on `addr` until `shutdown` fires
pub async fn run_metrics_server(
    metrics: SharedMetrics,
    addr: &str,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| ServerError::InvalidAddr(addr.to_string()))?;
    let app = create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobState};
    use crate::metrics::{new_shared_metrics, MetricsObserver};
    use crate::observer::Observer;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_metrics_returns_json() {
        let metrics = new_shared_metrics();
        let observer = MetricsObserver::new(metrics.clone());
        observer.set_limits(3, 8 * 1024 * 1024 * 1024);

        let mut job = Job::new(PathBuf::from("/media/video.mkv"), 5_368_709_120, 600.0);
        job.transition(JobState::Ready).unwrap();
        job.transition(JobState::Encoding).unwrap();
        job.advance_progress(0.45);
        job.stats.fps = 12.5;
        job.stats.eta_secs = Some(3600.0);
        observer.job_changed(&job);

        let response = create_metrics_router(metrics)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type.to_str().unwrap().contains("application/json"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["workers"], 3);
        assert_eq!(json["counts"]["encoding"], 1);
        assert_eq!(json["jobs"][0]["stage"], "encoding");
        assert_eq!(json["jobs"][0]["input_path"], "/media/video.mkv");
        assert_eq!(json["jobs"][0]["fps"], 12.5);
        assert_eq!(json["jobs"][0]["progress"], 0.45);
    }

    #[tokio::test]
    async fn test_unknown_path_returns_404() {
        let response = create_metrics_router(new_shared_metrics())
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_addr_is_rejected() {
        let err = run_metrics_server(new_shared_metrics(), "not-an-addr", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::InvalidAddr(_)));
    }
}
