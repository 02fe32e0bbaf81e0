//! Admin HTTP surface: Prometheus metrics, job status and health.

pub mod metrics;

use crate::background_jobs::{JobInfo, SchedulerHandle};
use crate::host::HostedService;
use crate::task_queue::TaskQueue;
use crate::task_runner::RunnerState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Clone)]
pub struct AdminState {
    pub scheduler: SchedulerHandle,
    pub runner_state: watch::Receiver<RunnerState>,
    pub queue: Arc<dyn TaskQueue>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    runner: String,
    queue_kind: &'static str,
    queue_depth: usize,
    queue_completed: bool,
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    let runner = *state.runner_state.borrow();
    let status_code = if runner == RunnerState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        status: if status_code == StatusCode::OK { "ok" } else { "unavailable" },
        runner: runner.to_string(),
        queue_kind: state.queue.kind(),
        queue_depth: state.queue.len(),
        queue_completed: state.queue.is_completed(),
    };
    (status_code, Json(body))
}

async fn list_jobs(State(state): State<AdminState>) -> Json<Vec<JobInfo>> {
    Json(state.scheduler.list_jobs())
}

async fn get_job(
    State(state): State<AdminState>,
    Path(job_name): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    state
        .scheduler
        .get_job(&job_name)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub fn make_admin_app(state: AdminState) -> Router {
    Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .route("/health", get(health))
        .route("/jobs", get(list_jobs))
        .route("/jobs/{job_name}", get(get_job))
        .with_state(state)
}

/// Serves the admin app on `port` until shutdown.
pub struct AdminServer {
    port: u16,
    state: AdminState,
    active: Mutex<Option<(JoinHandle<()>, CancellationToken)>>,
}

impl AdminServer {
    pub fn new(port: u16, state: AdminState) -> Self {
        Self {
            port,
            state,
            active: Mutex::new(None),
        }
    }
}

#[async_trait]
impl HostedService for AdminServer {
    fn name(&self) -> &str {
        "admin_server"
    }

    async fn start(&self, shutdown: &CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", self.port))
            .await
            .with_context(|| format!("Failed to bind admin port {}", self.port))?;
        info!("Metrics available at port {}!", self.port);

        let app = make_admin_app(self.state.clone());
        let stop = shutdown.child_token();
        let token = stop.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("Admin server error: {}", e);
            }
        });
        *self.active.lock().await = Some((handle, stop));
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some((handle, stop)) = self.active.lock().await.take() {
            stop.cancel();
            handle.await.context("Admin server task failed")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::{JobExecutionState, JobTracker};
    use crate::task_queue::{UnboundedTaskQueue, WorkItem};
    use axum::{body::Body, http::Request};
    use tower::ServiceExt; // for `oneshot`

    fn state(
        runner: RunnerState,
    ) -> (AdminState, watch::Sender<RunnerState>, Arc<UnboundedTaskQueue>) {
        let (tx, rx) = watch::channel(runner);
        let queue = Arc::new(UnboundedTaskQueue::new());
        let state = AdminState {
            scheduler: SchedulerHandle::new(),
            runner_state: rx,
            queue: queue.clone(),
        };
        (state, tx, queue)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_queue_depth() {
        let (state, _tx, queue) = state(RunnerState::Running);
        queue.push(WorkItem::new(|_| async { Ok(()) })).unwrap();
        let app = make_admin_app(state);

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["runner"], "running");
        assert_eq!(body["queue_depth"], 1);
        assert_eq!(body["queue_kind"], "unbounded");
    }

    #[tokio::test]
    async fn test_health_unavailable_when_stopped() {
        let (state, _tx, _queue) = state(RunnerState::Stopped);
        let app = make_admin_app(state);

        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_jobs_endpoints() {
        let (state, _tx, _queue) = state(RunnerState::Running);
        let tracker = Arc::new(JobTracker::new(
            "test::Params",
            Arc::new(JobExecutionState::default()),
        ));
        tracker.set_settings("nightly", "0 0 3 * * *", true, true);
        state.scheduler.attach(tracker);
        let app = make_admin_app(state);

        let request = Request::builder().uri("/jobs").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body[0]["job_name"], "nightly");
        assert_eq!(body[0]["lock_single_instance"], true);

        let request = Request::builder().uri("/jobs/nightly").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder().uri("/jobs/unknown").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::init_metrics();
        let (state, _tx, _queue) = state(RunnerState::Running);
        let app = make_admin_app(state);

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
