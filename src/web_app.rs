use axum::{
    routing::{get, post},
    Router,
};
use http::header::HeaderName;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, request_id::MakeRequestUuid,
    request_id::SetRequestIdLayer, trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::docs::ApiDoc;
use crate::handlers::{
    apply_weights, cancel_optimization, get_progress, get_result, health, start_optimization,
    AppState,
};

pub fn build_app(state: AppState) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");
    Router::new()
        .route("/health", get(health))
        .route(
            "/portfolios/{portfolio_id}/optimizations",
            post(start_optimization),
        )
        .route("/portfolios/{portfolio_id}/weights", post(apply_weights))
        .route("/optimizations/{job_id}/progress", get(get_progress))
        .route("/optimizations/{job_id}/result", get(get_result))
        .route("/optimizations/{job_id}/cancel", post(cancel_optimization))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .with_state(state)
        .layer(
            tower::ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(
                    x_request_id.clone(),
                    MakeRequestUuid,
                ))
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive())
                .into_inner(),
        )
}
