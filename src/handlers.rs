use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::application::{apply_optimized_weights, ApplicationError, ApplicationReport, TickerWeight};
use crate::config::OptimizationRequest;
use crate::error::{ErrorKind, OptimizerError};
use crate::jobs::{JobError, JobProgress, OptimizationController};
use crate::report::OptimizationReport;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<OptimizationController>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: ErrorKind,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: String, kind: ErrorKind) -> Self {
        ApiError {
            status,
            body: ErrorResponse { error, kind },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<OptimizerError> for ApiError {
    fn from(err: OptimizerError) -> Self {
        let status = match err.kind() {
            ErrorKind::InvalidConfig => StatusCode::BAD_REQUEST,
            ErrorKind::JobNotFound | ErrorKind::InvalidPortfolio => StatusCode::NOT_FOUND,
            ErrorKind::InsufficientData
            | ErrorKind::InvalidWeight
            | ErrorKind::NoAssetsUpdated
            | ErrorKind::JobCancelled => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::JobNotFinished => StatusCode::CONFLICT,
            ErrorKind::Collaborator => StatusCode::BAD_GATEWAY,
            ErrorKind::Computation => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string(), err.kind())
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let status = match &err {
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::NotFinished { .. } => StatusCode::CONFLICT,
            JobError::Failed { .. } | JobError::Cancelled { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        };
        ApiError::new(status, err.to_string(), err.kind())
    }
}

impl From<ApplicationError> for ApiError {
    fn from(err: ApplicationError) -> Self {
        OptimizerError::from(err).into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplyWeightsRequest {
    /// Percent weights keyed by ticker, as returned in a report.
    pub optimized_weights: Vec<TickerWeight>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub jobs: usize,
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "Service"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        jobs: state.controller.registry().len(),
    })
}

#[utoipa::path(
    post,
    path = "/portfolios/{portfolio_id}/optimizations",
    params(("portfolio_id" = u64, Path, description = "Portfolio to optimize")),
    request_body = OptimizationRequest,
    responses(
        (status = 202, description = "Job accepted", body = JobAccepted),
        (status = 400, description = "Invalid optimization parameters", body = ErrorResponse)
    ),
    tag = "Optimization"
)]
pub async fn start_optimization(
    State(state): State<AppState>,
    Path(portfolio_id): Path<u64>,
    Json(request): Json<OptimizationRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), ApiError> {
    let job_id = state.controller.start(portfolio_id, request).map_err(|e| {
        warn!(portfolio_id, error = %e, "optimization rejected");
        ApiError::from(e)
    })?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted { job_id })))
}

#[utoipa::path(
    get,
    path = "/optimizations/{job_id}/progress",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Current progress", body = JobProgress),
        (status = 404, description = "Unknown or expired job", body = ErrorResponse)
    ),
    tag = "Optimization"
)]
pub async fn get_progress(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobProgress>, ApiError> {
    Ok(Json(state.controller.poll_progress(job_id)?))
}

#[utoipa::path(
    get,
    path = "/optimizations/{job_id}/result",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Optimization report", body = OptimizationReport),
        (status = 404, description = "Unknown or expired job", body = ErrorResponse),
        (status = 409, description = "Job has not finished", body = ErrorResponse),
        (status = 422, description = "Job failed or was cancelled", body = ErrorResponse)
    ),
    tag = "Optimization"
)]
pub async fn get_result(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Arc<OptimizationReport>>, ApiError> {
    Ok(Json(state.controller.result(job_id)?))
}

#[utoipa::path(
    post,
    path = "/optimizations/{job_id}/cancel",
    params(("job_id" = Uuid, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Progress after the cancellation request", body = JobProgress),
        (status = 404, description = "Unknown or expired job", body = ErrorResponse)
    ),
    tag = "Optimization"
)]
pub async fn cancel_optimization(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobProgress>, ApiError> {
    Ok(Json(state.controller.cancel(job_id)?))
}

#[utoipa::path(
    post,
    path = "/portfolios/{portfolio_id}/weights",
    params(("portfolio_id" = u64, Path, description = "Portfolio to update")),
    request_body = ApplyWeightsRequest,
    responses(
        (status = 200, description = "Per-asset outcome of the update", body = ApplicationReport),
        (status = 404, description = "Unknown portfolio", body = ErrorResponse),
        (status = 422, description = "Invalid weights or no matching asset", body = ErrorResponse)
    ),
    tag = "Portfolio"
)]
pub async fn apply_weights(
    State(state): State<AppState>,
    Path(portfolio_id): Path<u64>,
    Json(payload): Json<ApplyWeightsRequest>,
) -> Result<Json<ApplicationReport>, ApiError> {
    let controller = &state.controller;
    let report = apply_optimized_weights(
        controller.store().as_ref(),
        portfolio_id,
        &payload.optimized_weights,
        &controller.config().market_suffixes,
    )
    .await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::fixtures::demo_collaborators;
    use crate::jobs::JobStatus;
    use crate::web_app::build_app;
    use axum::body::{to_bytes, Body};
    use axum::Router;
    use http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let (prices, store) = demo_collaborators();
        let controller = OptimizationController::new(prices, store, ServiceConfig::default());
        build_app(AppState {
            controller: Arc::new(controller),
        })
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_optimization_round_trip() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/portfolios/1/optimizations",
            Some(json!({"populationSize": 20, "generations": 8, "seed": 3, "frontierSamples": 100})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let progress_uri = format!("/optimizations/{job_id}/progress");
        let mut last = Value::Null;
        for _ in 0..6000 {
            let (status, body) = send(&app, "GET", &progress_uri, None).await;
            assert_eq!(status, StatusCode::OK);
            last = body;
            if last["status"] == json!("completed") || last["status"] == json!("error") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(last["status"], json!("completed"));
        assert_eq!(last["progress"], json!(100));

        let (status, report) = send(&app, "GET", &format!("/optimizations/{job_id}/result"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["portfolioId"], json!(1));
        assert_eq!(report["optimizedWeights"].as_array().unwrap().len(), 3);
        assert!(report["convergenceHistory"].is_array());

        // Feed the optimized weights back into the portfolio.
        let (status, applied) = send(
            &app,
            "POST",
            "/portfolios/1/weights",
            Some(json!({"optimizedWeights": report["optimizedWeights"].clone()})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(applied["updatedCount"], json!(3));
    }

    #[tokio::test]
    async fn test_unknown_job_is_404() {
        let app = app();
        let uri = format!("/optimizations/{}/progress", Uuid::new_v4());
        let (status, body) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], json!("job_not_found"));
    }

    #[tokio::test]
    async fn test_invalid_request_is_400() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/portfolios/1/optimizations",
            Some(json!({"cvarAlpha": 2.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], json!("invalid_config"));
    }

    #[tokio::test]
    async fn test_result_of_running_job_is_409() {
        let app = app();
        let (_, body) = send(
            &app,
            "POST",
            "/portfolios/1/optimizations",
            Some(json!({"generations": 1000000, "includeFrontier": false})),
        )
        .await;
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let (status, body) = send(&app, "GET", &format!("/optimizations/{job_id}/result"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], json!("job_not_finished"));

        let (status, body) = send(&app, "POST", &format!("/optimizations/{job_id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(body["status"], json!(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_unmatched_weights_are_422() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/portfolios/1/weights",
            Some(json!({"optimizedWeights": [{"ticker": "AAPL", "weight": 100.0}]})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], json!("no_assets_updated"));

        let (status, _) = send(
            &app,
            "POST",
            "/portfolios/77/weights",
            Some(json!({"optimizedWeights": [{"ticker": "PETR4", "weight": 100.0}]})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_openapi_are_served() {
        let app = app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("ok"));

        let (status, doc) = send(&app, "GET", "/api-docs/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(doc["paths"]["/optimizations/{job_id}/result"].is_object());
    }
}
