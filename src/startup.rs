//! Server startup and wiring.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use http::{HeaderName, Request};
use svc_telemetry::PrometheusHandle;
use tonic::service::Routes;
use tonic_health::ServingStatus;
use tonic_health::server::health_reporter;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{Level, info};

use crate::admission::AdmissionGuard;
use crate::client::RetryPolicy;
use crate::config::Config;
use crate::middleware::{AuthInterceptor, AuthLayer, REQUEST_ID_HEADER, RequestIdLayer};
use crate::routes::{AppState, rest_routes};

/// Request timeout duration.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Assembled application, ready to serve.
pub struct App {
    pub router: Router,
    pub addr: SocketAddr,
    /// Kept so the caller can block IPs at runtime and stop the sweeper on shutdown.
    pub admission: AdmissionGuard,
    /// Retry policy for outbound clients, built from the `--retry-*` flags.
    pub retry: RetryPolicy,
}

/// Build and configure the complete application.
pub async fn build_app(config: &Config, metrics: Option<PrometheusHandle>) -> anyhow::Result<App> {
    let addr: SocketAddr = config.address.parse()?;

    let auth_config = config.auth_config()?;
    let api_keys = auth_config.api_keys.len();
    let auth = AuthInterceptor::new(auth_config);
    let admission = AdmissionGuard::new(config.admission_config());
    let retry = RetryPolicy::new(config.retry_config()?);

    // Health reporter
    let (health_reporter, health_service) = health_reporter();
    health_reporter
        .set_service_status("", ServingStatus::Serving)
        .await;

    // gRPC routes, every call authenticated
    let grpc_router = Routes::new(health_service)
        .into_axum_router()
        .layer(AuthLayer::new(auth));

    // REST routes behind admission control
    let rest_router = rest_routes(AppState {
        admission: admission.clone(),
        metrics,
    })
    .layer(admission.layer());

    let cors = build_cors(config.cors_allow_origins.as_deref());

    // Executes top-to-bottom on request
    let middleware = ServiceBuilder::new()
        .layer(CatchPanicLayer::new())
        .layer(RequestIdLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request<_>| {
                    tracing::info_span!(
                        "request",
                        method = %req.method(),
                        uri = %req.uri(),
                        request_id = tracing::field::Empty,
                        user_id = tracing::field::Empty,
                    )
                })
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(TimeoutLayer::with_status_code(
            http::StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
        .layer(cors);

    let router = rest_router.merge(grpc_router).layer(middleware);

    info!(
        auth_enabled = config.auth_enabled,
        api_keys,
        rate_limit_rpm = config.rate_limit_rpm,
        rate_limit_burst = config.rate_limit_burst,
        allowed_networks = config.allowed_ips.len(),
        retry_max_attempts = retry.config().max_attempts(),
        "Application built"
    );

    Ok(App {
        router,
        addr,
        admission,
        retry,
    })
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = match origins {
        Some(o) if o.trim() == "*" => CorsLayer::permissive(),
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            CorsLayer::new().allow_origin(origins)
        }
        None => CorsLayer::permissive(),
    };

    cors.allow_headers(Any)
        .expose_headers([
            HeaderName::from_static("grpc-status"),
            HeaderName::from_static("grpc-message"),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .allow_methods(Any)
        .max_age(Duration::from_secs(3600))
}
