//! Health endpoints for the SFU Controller.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (are workers up and signaling accepting?)
//!
//! `main.rs` merges a `/metrics` route rendered by `metrics-exporter-prometheus`
//! into the same listener.
//!
//! # Readiness Phases
//!
//! | Phase      | `/ready` | Entered when                              |
//! |------------|----------|-------------------------------------------|
//! | `Starting` | 503      | process start                             |
//! | `Ready`    | 200      | worker pool and signaling listener are up |
//! | `Draining` | 503      | shutdown signal received                  |
//! | `Failed`   | 503      | a media worker died                       |
//!
//! `Failed` is terminal; `Draining` never goes back to `Ready`.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Readiness phase of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadinessPhase {
    Starting = 0,
    Ready = 1,
    Draining = 2,
    Failed = 3,
}

impl ReadinessPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ReadinessPhase::Starting => "starting",
            ReadinessPhase::Ready => "ready",
            ReadinessPhase::Draining => "draining",
            ReadinessPhase::Failed => "failed",
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => ReadinessPhase::Ready,
            2 => ReadinessPhase::Draining,
            3 => ReadinessPhase::Failed,
            _ => ReadinessPhase::Starting,
        }
    }
}

/// Health state for the SFU Controller.
#[derive(Debug)]
pub struct HealthState {
    /// Whether the process is live. Always true after startup.
    live: AtomicBool,
    /// Current [`ReadinessPhase`].
    phase: AtomicU8,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (live, starting).
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            phase: AtomicU8::new(ReadinessPhase::Starting as u8),
        }
    }

    /// Mark the service ready. Ignored once draining or failed.
    pub fn set_ready(&self) {
        let _ = self.phase.compare_exchange(
            ReadinessPhase::Starting as u8,
            ReadinessPhase::Ready as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Stop accepting new peers. Ignored once failed.
    pub fn set_draining(&self) {
        let _ = self
            .phase
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != ReadinessPhase::Failed as u8).then_some(ReadinessPhase::Draining as u8)
            });
    }

    /// A media worker died; the process is about to exit.
    pub fn set_failed(&self) {
        self.phase
            .store(ReadinessPhase::Failed as u8, Ordering::SeqCst);
    }

    #[must_use]
    pub fn phase(&self) -> ReadinessPhase {
        ReadinessPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Check if the service is live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == ReadinessPhase::Ready
    }
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Readiness probe handler. The body names the current phase.
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    let phase = state.phase();
    let status = if phase == ReadinessPhase::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, phase.as_str())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_health_state_default() {
        let state = HealthState::new();
        assert!(state.is_live(), "Should be live by default");
        assert!(!state.is_ready(), "Should not be ready by default");
        assert_eq!(state.phase(), ReadinessPhase::Starting);
    }

    #[test]
    fn test_health_state_transitions() {
        let state = HealthState::new();

        state.set_ready();
        assert!(state.is_ready());

        state.set_draining();
        assert_eq!(state.phase(), ReadinessPhase::Draining);

        state.set_ready();
        assert_eq!(
            state.phase(),
            ReadinessPhase::Draining,
            "Draining must not return to ready"
        );
    }

    #[test]
    fn test_failed_is_terminal() {
        let state = HealthState::new();
        state.set_ready();
        state.set_failed();
        state.set_draining();
        state.set_ready();
        assert_eq!(state.phase(), ReadinessPhase::Failed);
    }

    #[test]
    fn test_health_state_thread_safety() {
        use std::thread;

        let state = Arc::new(HealthState::new());

        let state_clone = Arc::clone(&state);
        let handle = thread::spawn(move || {
            state_clone.set_ready();
        });

        handle.join().expect("Thread should complete");
        assert!(
            state.is_ready(),
            "State should be updated from another thread"
        );
    }

    #[tokio::test]
    async fn test_readiness_handler_reports_phase() {
        let state = Arc::new(HealthState::new());
        let (status, body) = readiness_handler(State(Arc::clone(&state))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "starting");

        state.set_ready();
        let (status, body) = readiness_handler(State(Arc::clone(&state))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready");

        state.set_failed();
        let (status, body) = readiness_handler(State(state)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "failed");
    }

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn test_health_router_liveness_endpoint() {
        let state = Arc::new(HealthState::new());
        let app = health_router(state);

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .expect("Failed to build request");

        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_router_readiness_while_draining() {
        let state = Arc::new(HealthState::new());
        state.set_ready();
        state.set_draining();
        let app = health_router(state);

        let request = Request::builder()
            .uri("/ready")
            .body(Body::empty())
            .expect("Failed to build request");

        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response
            .into_body()
            .collect()
            .await
            .expect("Failed to read body")
            .to_bytes();
        assert_eq!(body.as_ref(), b"draining");
    }

    #[tokio::test]
    async fn test_health_router_unknown_path_returns_404() {
        let state = Arc::new(HealthState::new());
        let app = health_router(state);

        let request = Request::builder()
            .uri("/unknown")
            .body(Body::empty())
            .expect("Failed to build request");

        let response = app
            .oneshot(request)
            .await
            .expect("Failed to execute request");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
