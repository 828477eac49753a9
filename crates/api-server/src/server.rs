//! API server: REST router, middleware stack and the metrics exporter.

use std::future::Future;
use std::net::SocketAddr;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use outreach_core::config::AppConfig;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::idempotency::idempotent;
use crate::rest::{self, AppState};
use crate::swagger::ApiDoc;
use crate::{enrollment_rest, sequence_rest, webhook_rest};

/// Full application router. Exposed separately so tests can drive it with
/// `tower::ServiceExt::oneshot`.
pub fn build_router(state: AppState) -> Router {
    let v1 = Router::new()
        // Sequence admin
        .route(
            "/v1/sequences",
            post(sequence_rest::handle_publish).get(sequence_rest::handle_list),
        )
        .route("/v1/sequences/:id/versions", get(sequence_rest::handle_versions))
        .route(
            "/v1/sequences/:id/versions/:version",
            get(sequence_rest::handle_get_version),
        )
        .route("/v1/sequences/:id/pause", post(sequence_rest::handle_pause))
        .route("/v1/sequences/:id/resume", post(sequence_rest::handle_resume))
        .route("/v1/sequences/:id/stats", get(sequence_rest::handle_stats))
        // Enrollments
        .route("/v1/sequences/:id/enroll", post(sequence_rest::handle_enroll))
        .route("/v1/enrollments/:id", get(enrollment_rest::handle_get))
        .route("/v1/enrollments/:id/pause", post(enrollment_rest::handle_pause))
        .route("/v1/enrollments/:id/resume", post(enrollment_rest::handle_resume))
        // Operator tasks
        .route("/v1/tasks", get(enrollment_rest::handle_open_tasks))
        .route(
            "/v1/tasks/:id/complete",
            post(enrollment_rest::handle_complete_task),
        )
        // Webhooks
        .route("/v1/webhooks/events", post(webhook_rest::handle_event))
        .route("/v1/webhooks/sendgrid", post(webhook_rest::handle_sendgrid))
        .layer(middleware::from_fn_with_state(
            state.idempotency.clone(),
            idempotent,
        ));

    Router::new()
        .merge(v1)
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Middleware
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP front end for the sequence engine.
pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: AppConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve the REST API until `shutdown` resolves.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = build_router(self.state.clone());
        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Start the Prometheus exporter on its own port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
