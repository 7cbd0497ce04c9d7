//! Correlation id propagation.
//!
//! Inbound: reuse a well-formed `x-request-id` or generate one, expose it as a
//! [`RequestId`] extension and echo it on the response. Outbound: the client
//! interceptor copies a [`RequestId`] found on a `tonic::Request` into metadata.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::{HeaderValue, Request, Response};
use tower::{Layer, Service};
use tracing::Span;
use uuid::Uuid;

/// Header / metadata key for the correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Maximum length for request IDs.
const MAX_REQUEST_ID_LENGTH: usize = 64;

/// Correlation id of the current call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(Arc<str>);

impl RequestId {
    /// Generate a new random request ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string().into())
    }

    /// Accept a caller-supplied id if it is short, non-empty visible ASCII.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let valid = !s.is_empty()
            && s.len() <= MAX_REQUEST_ID_LENGTH
            && s.bytes().all(|b| b.is_ascii_graphic());
        valid.then(|| Self(s.into()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tower layer for request ID propagation.
#[derive(Clone, Copy, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdMiddleware { inner }
    }
}

/// Request ID middleware service.
#[derive(Clone)]
pub struct RequestIdMiddleware<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RequestIdMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let request_id = req
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(RequestId::parse)
            .unwrap_or_else(RequestId::generate);

        Span::current().record("request_id", request_id.as_str());
        req.extensions_mut().insert(request_id.clone());

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let mut response = inner.call(req).await?;
            if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
                response.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use tower::ServiceExt;

    use super::*;

    async fn echo(req: Request<()>) -> Result<Response<String>, Infallible> {
        let id = req
            .extensions()
            .get::<RequestId>()
            .map(ToString::to_string)
            .unwrap_or_default();
        Ok(Response::new(id))
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(RequestId::parse("").is_none());
        assert!(RequestId::parse("has space").is_none());
        assert!(RequestId::parse(&"x".repeat(65)).is_none());
        assert_eq!(RequestId::parse("custom-id").unwrap().as_str(), "custom-id");
    }

    #[tokio::test]
    async fn propagates_incoming_id() {
        let service = RequestIdLayer::new().layer(tower::service_fn(echo));
        let req = Request::builder()
            .header(REQUEST_ID_HEADER, "corr-123")
            .body(())
            .unwrap();

        let response = service.oneshot(req).await.unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "corr-123");
        assert_eq!(response.body(), "corr-123");
    }

    #[tokio::test]
    async fn generates_id_when_absent() {
        let service = RequestIdLayer::new().layer(tower::service_fn(echo));
        let response = service
            .oneshot(Request::builder().body(()).unwrap())
            .await
            .unwrap();
        let header = response.headers()[REQUEST_ID_HEADER].to_str().unwrap().to_string();
        assert_eq!(&header, response.body());
        assert!(Uuid::parse_str(&header).is_ok());
    }
}
