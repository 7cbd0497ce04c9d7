//! Admission control for inbound HTTP requests.
//!
//! [`AdmissionGuard`] owns the per-client rate limiter, the explicit IP block
//! list and the static IP policy. [`AdmissionLayer`] turns the guard into a
//! tower layer whose checks run as members of a [`MiddlewareChain`]:
//!
//! | priority | member             | rejection |
//! |----------|--------------------|-----------|
//! | 10       | `ip_restriction`   | 403       |
//! | 20       | `rate_limit`       | 429       |
//! | 30       | `content_type`     | 400       |
//! | 40       | `request_size`     | 413/400   |
//! | 50       | `security_headers` | -         |
//! | max      | `handler`          | -         |
//!
//! Rejections never reach the wrapped service and carry a JSON body
//! `{"error": "..."}`. Security headers are only added to admitted responses.

pub mod checks;
pub mod ip_filter;
pub mod rate_limit;

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::response::IntoResponse;
use futures::future::BoxFuture;
use http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use ipnetwork::IpNetwork;
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, error, info, warn};

pub use checks::{AdmissionRejection, FrameOptions, ReferrerPolicy, SecurityHeadersConfig};
pub use ip_filter::{IpBlockList, IpDenial, IpPolicy};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter};

use crate::chain::{ChainError, Middleware, MiddlewareChain};
use crate::middleware::ClientIp;

pub type HttpMiddleware = Middleware<Request<Body>, Response<Body>, ChainError>;
pub type HttpChain = MiddlewareChain<Request<Body>, Response<Body>, ChainError>;

/// Chain priorities of the built-in admission members.
pub mod priority {
    pub const IP_RESTRICTION: i32 = 10;
    pub const RATE_LIMIT: i32 = 20;
    pub const CONTENT_TYPE: i32 = 30;
    pub const REQUEST_SIZE: i32 = 40;
    pub const SECURITY_HEADERS: i32 = 50;
    pub const HANDLER: i32 = i32::MAX;
}

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub rate_limit: RateLimitConfig,
    /// Empty means every address is allowed.
    pub allowed_networks: Vec<IpNetwork>,
    pub allow_private_networks: bool,
    /// Media type prefixes accepted on requests with a body. Empty disables the check.
    pub allowed_content_types: Vec<String>,
    pub max_request_bytes: u64,
    pub security_headers: SecurityHeadersConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            allowed_networks: Vec::new(),
            allow_private_networks: true,
            allowed_content_types: vec![
                "application/json".to_string(),
                "application/x-www-form-urlencoded".to_string(),
                "multipart/form-data".to_string(),
            ],
            max_request_bytes: 10 * 1024 * 1024,
            security_headers: SecurityHeadersConfig::default(),
        }
    }
}

impl From<IpDenial> for AdmissionRejection {
    fn from(denial: IpDenial) -> Self {
        match denial {
            IpDenial::NotAllowed => Self::NotAllowed,
            IpDenial::PrivateNetwork => Self::PrivateNetwork,
        }
    }
}

struct GuardState {
    limiter: Arc<RateLimiter>,
    block_list: IpBlockList,
    policy: IpPolicy,
    allowed_content_types: Vec<String>,
    max_request_bytes: u64,
    security_headers: Arc<[(HeaderName, HeaderValue)]>,
    sweeper: CancellationToken,
}

impl Drop for GuardState {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

/// Shared admission state. Clones refer to the same limiter and block list.
///
/// The background sweeper stops on [`AdmissionGuard::shutdown`] or when the
/// last clone (including those held by layers) is dropped.
#[derive(Clone)]
pub struct AdmissionGuard {
    state: Arc<GuardState>,
}

impl AdmissionGuard {
    /// Build the guard and start its sweeper on the current tokio runtime.
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let sweeper = CancellationToken::new();
        spawn_sweeper(
            Arc::downgrade(&limiter),
            config.rate_limit.cleanup_interval,
            sweeper.clone(),
        );

        Self {
            state: Arc::new(GuardState {
                limiter,
                block_list: IpBlockList::new(),
                policy: IpPolicy::new(config.allowed_networks, config.allow_private_networks),
                allowed_content_types: config.allowed_content_types,
                max_request_bytes: config.max_request_bytes,
                security_headers: config.security_headers.headers().into(),
                sweeper,
            }),
        }
    }

    pub fn block_ip(&self, ip: IpAddr, duration: Duration) {
        info!(%ip, duration_secs = duration.as_secs(), "IP blocked");
        self.state.block_list.block_ip(ip, duration);
    }

    pub fn unblock_ip(&self, ip: IpAddr) -> bool {
        let removed = self.state.block_list.unblock_ip(ip);
        if removed {
            info!(%ip, "IP unblocked");
        }
        removed
    }

    #[must_use]
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.state.block_list.is_blocked(ip)
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.state.limiter
    }

    /// Stop the background sweeper. Admission keeps working.
    pub fn shutdown(&self) {
        self.state.sweeper.cancel();
    }

    #[must_use]
    pub fn layer(&self) -> AdmissionLayer {
        AdmissionLayer::new(self.clone())
    }

    /// Block list, allow-list and private-network policy.
    ///
    /// # Errors
    /// The first failing rule.
    pub fn check_ip(&self, client: ClientIp) -> Result<(), AdmissionRejection> {
        if self.state.block_list.is_blocked(client.key()) {
            return Err(AdmissionRejection::Blocked);
        }
        self.state.policy.check(client.ip())?;
        Ok(())
    }

    /// Count the request against the client's quota.
    ///
    /// # Errors
    /// [`AdmissionRejection::RateLimited`] once the quota is used up.
    pub fn check_rate(&self, client: ClientIp) -> Result<(), AdmissionRejection> {
        match self.state.limiter.check(client.key()) {
            RateDecision::Allowed => Ok(()),
            RateDecision::Limited { retry_after } => {
                Err(AdmissionRejection::RateLimited { retry_after })
            }
        }
    }

    /// The built-in admission members in priority order.
    #[must_use]
    pub fn middlewares(&self) -> Vec<HttpMiddleware> {
        let ip = self.clone();
        let rate = self.clone();
        let content = self.clone();
        let size = self.clone();
        let headers = Arc::clone(&self.state.security_headers);

        vec![
            check("ip_restriction", priority::IP_RESTRICTION, move |req| {
                let client = ClientIp::from_request(req);
                req.extensions_mut().insert(client);
                ip.check_ip(client)
            }),
            check("rate_limit", priority::RATE_LIMIT, move |req| {
                rate.check_rate(client_ip(req))
            }),
            check("content_type", priority::CONTENT_TYPE, move |req| {
                checks::check_content_type(
                    req.method(),
                    req.headers(),
                    &content.state.allowed_content_types,
                )
            }),
            check("request_size", priority::REQUEST_SIZE, move |req| {
                checks::check_content_length(req.headers(), size.state.max_request_bytes)
            }),
            HttpMiddleware::new(
                "security_headers",
                priority::SECURITY_HEADERS,
                move |req, next| {
                    let headers = Arc::clone(&headers);
                    async move {
                        let mut response = next.run(req).await?;
                        checks::apply_security_headers(response.headers_mut(), &headers);
                        Ok(response)
                    }
                },
            ),
        ]
    }
}

fn client_ip(req: &Request<Body>) -> ClientIp {
    req.extensions()
        .get::<ClientIp>()
        .copied()
        .unwrap_or_else(|| ClientIp::from_request(req))
}

/// Wrap a synchronous check as a chain member that short-circuits on rejection.
fn check<F>(name: &'static str, priority: i32, rule: F) -> HttpMiddleware
where
    F: Fn(&mut Request<Body>) -> Result<(), AdmissionRejection> + Send + Sync + 'static,
{
    HttpMiddleware::new(name, priority, move |mut req, next| {
        let verdict = rule(&mut req);
        if let Err(rejection) = &verdict {
            let client = client_ip(&req);
            warn!(
                client_ip = ?client.ip(),
                method = %req.method(),
                path = req.uri().path(),
                reason = rejection.reason(),
                "Request rejected"
            );
            metrics::counter!("admission_rejections_total", "reason" => rejection.reason())
                .increment(1);
        }

        async move {
            match verdict {
                Ok(()) => next.run(req).await,
                Err(rejection) => Ok(rejection.into_response()),
            }
        }
    })
}

fn spawn_sweeper(limiter: Weak<RateLimiter>, every: Duration, token: CancellationToken) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No tokio runtime, rate limit sweeper not started");
        return;
    };

    runtime.spawn(async move {
        let mut interval = tokio::time::interval(every.max(Duration::from_millis(100)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = interval.tick() => {
                    let Some(limiter) = limiter.upgrade() else { break };
                    let removed = limiter.sweep();
                    if removed > 0 {
                        debug!(removed, remaining = limiter.len(), "Swept idle rate limit entries");
                    }
                }
            }
        }
        debug!("Rate limit sweeper stopped");
    });
}

/// Tower layer running [`AdmissionGuard`] checks in front of a service.
#[derive(Clone)]
pub struct AdmissionLayer {
    guard: AdmissionGuard,
    extra: Vec<HttpMiddleware>,
}

impl AdmissionLayer {
    #[must_use]
    pub const fn new(guard: AdmissionGuard) -> Self {
        Self {
            guard,
            extra: Vec::new(),
        }
    }

    /// Add a custom member; its priority decides where it runs among the checks.
    #[must_use]
    pub fn with_middleware(mut self, middleware: HttpMiddleware) -> Self {
        self.extra.push(middleware);
        self
    }
}

impl<S> Layer<S> for AdmissionLayer
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    type Service = AdmissionService;

    fn layer(&self, inner: S) -> Self::Service {
        let members = HttpChain::new();
        for middleware in self.guard.middlewares().into_iter().chain(self.extra.iter().cloned()) {
            members.add(middleware);
        }
        members.add(handler(inner));

        AdmissionService {
            chain: Arc::new(members),
        }
    }
}

/// Terminal chain member calling the wrapped service.
fn handler<S>(inner: S) -> HttpMiddleware
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Infallible>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    HttpMiddleware::new("handler", priority::HANDLER, move |req, _next| {
        let inner = inner.clone();
        async move {
            match inner.oneshot(req).await {
                Ok(response) => Ok(response),
                Err(never) => match never {},
            }
        }
    })
}

/// Admission middleware service.
#[derive(Clone)]
pub struct AdmissionService {
    chain: Arc<HttpChain>,
}

impl AdmissionService {
    /// The live chain; members added here apply to subsequent requests.
    #[must_use]
    pub fn chain(&self) -> &HttpChain {
        &self.chain
    }
}

impl Service<Request<Body>> for AdmissionService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let response = self.chain.execute(req);
        Box::pin(async move {
            Ok(response.await.unwrap_or_else(|err| {
                error!(error = %err, "Admission chain misconfigured");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    axum::Json(json!({ "error": "internal server error" })),
                )
                    .into_response()
            }))
        })
    }
}
