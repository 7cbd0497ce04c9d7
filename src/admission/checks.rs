//! Admission rejections, request content checks and security response headers.

use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::response::IntoResponse;
use http::header::{
    CONTENT_LENGTH, CONTENT_SECURITY_POLICY, CONTENT_TYPE, REFERRER_POLICY, RETRY_AFTER,
    STRICT_TRANSPORT_SECURITY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Response, StatusCode};
use serde_json::json;
use tracing::warn;

/// A request refused by the admission guard.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionRejection {
    #[error("ip address is blocked")]
    Blocked,
    #[error("ip address is not allowed")]
    NotAllowed,
    #[error("private network access denied")]
    PrivateNetwork,
    #[error("rate limit exceeded")]
    RateLimited { retry_after: Duration },
    #[error("missing content type")]
    MissingContentType,
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("invalid content length")]
    InvalidContentLength,
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: u64 },
}

impl AdmissionRejection {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Blocked | Self::NotAllowed | Self::PrivateNetwork => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::MissingContentType
            | Self::UnsupportedContentType(_)
            | Self::InvalidContentLength => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Blocked => "ip_blocked",
            Self::NotAllowed => "ip_not_allowed",
            Self::PrivateNetwork => "private_network",
            Self::RateLimited { .. } => "rate_limited",
            Self::MissingContentType | Self::UnsupportedContentType(_) => "content_type",
            Self::InvalidContentLength | Self::PayloadTooLarge { .. } => "request_size",
        }
    }
}

impl IntoResponse for AdmissionRejection {
    fn into_response(self) -> Response<Body> {
        let mut response = (self.status(), Json(json!({ "error": self.to_string() }))).into_response();
        if let Self::RateLimited { retry_after } = self {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}

/// Require an allowed media type on requests that carry a body.
///
/// `GET` and `HEAD` are exempt; an empty `allowed` list disables the check.
/// Matching is a case-insensitive prefix match on the media type.
pub fn check_content_type(
    method: &Method,
    headers: &HeaderMap,
    allowed: &[String],
) -> Result<(), AdmissionRejection> {
    if allowed.is_empty() || *method == Method::GET || *method == Method::HEAD {
        return Ok(());
    }

    let media_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .filter(|v| !v.is_empty())
        .ok_or(AdmissionRejection::MissingContentType)?;

    if allowed
        .iter()
        .any(|prefix| media_type.starts_with(&prefix.to_ascii_lowercase()))
    {
        Ok(())
    } else {
        Err(AdmissionRejection::UnsupportedContentType(media_type))
    }
}

/// Reject requests whose declared `Content-Length` exceeds `max_bytes`.
///
/// Requests without the header (e.g. chunked bodies) pass.
pub fn check_content_length(headers: &HeaderMap, max_bytes: u64) -> Result<(), AdmissionRejection> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(());
    };

    let length = value
        .to_str()
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or(AdmissionRejection::InvalidContentLength)?;

    if length > max_bytes {
        return Err(AdmissionRejection::PayloadTooLarge { limit: max_bytes });
    }
    Ok(())
}

/// Security headers configuration for admitted responses.
#[derive(Debug, Clone)]
#[must_use = "config does nothing unless you use it"]
pub struct SecurityHeadersConfig {
    /// HTTP Strict Transport Security (HSTS) max age in seconds.
    pub hsts_max_age_seconds: u64,
    pub hsts_include_subdomains: bool,
    /// Content Security Policy (CSP) directives.
    pub content_security_policy: Option<String>,
    pub frame_options: FrameOptions,
    pub referrer_policy: ReferrerPolicy,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            hsts_max_age_seconds: 31_536_000, // 1 year
            hsts_include_subdomains: true,
            content_security_policy: Some(
                "default-src 'self'; frame-ancestors 'none'; base-uri 'self'; form-action 'self'"
                    .to_string(),
            ),
            frame_options: FrameOptions::Deny,
            referrer_policy: ReferrerPolicy::StrictOriginWhenCrossOrigin,
        }
    }
}

impl SecurityHeadersConfig {
    pub fn hsts_header_value(&self) -> String {
        if self.hsts_include_subdomains {
            format!("max-age={}; includeSubDomains", self.hsts_max_age_seconds)
        } else {
            format!("max-age={}", self.hsts_max_age_seconds)
        }
    }

    /// Header pairs to add, skipping values that are not valid header text.
    pub fn headers(&self) -> Vec<(HeaderName, HeaderValue)> {
        let mut pairs = vec![
            (X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
            (X_FRAME_OPTIONS, HeaderValue::from_static(self.frame_options.as_str())),
            (REFERRER_POLICY, HeaderValue::from_static(self.referrer_policy.as_str())),
        ];

        match HeaderValue::try_from(self.hsts_header_value()) {
            Ok(value) => pairs.push((STRICT_TRANSPORT_SECURITY, value)),
            Err(e) => warn!(error = %e, "Invalid HSTS header value"),
        }

        if let Some(csp) = self.content_security_policy.as_deref() {
            match HeaderValue::from_str(csp) {
                Ok(value) => pairs.push((CONTENT_SECURITY_POLICY, value)),
                Err(e) => warn!(error = %e, "Invalid Content-Security-Policy value"),
            }
        }

        pairs
    }
}

/// X-Frame-Options header values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOptions {
    Deny,
    SameOrigin,
}

impl FrameOptions {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deny => "DENY",
            Self::SameOrigin => "SAMEORIGIN",
        }
    }
}

/// Referrer-Policy header values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferrerPolicy {
    NoReferrer,
    Origin,
    StrictOriginWhenCrossOrigin,
}

impl ReferrerPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoReferrer => "no-referrer",
            Self::Origin => "origin",
            Self::StrictOriginWhenCrossOrigin => "strict-origin-when-cross-origin",
        }
    }
}

/// Add each header unless the handler already set it.
pub fn apply_security_headers(headers: &mut HeaderMap, pairs: &[(HeaderName, HeaderValue)]) {
    for (name, value) in pairs {
        if !headers.contains_key(name) {
            headers.insert(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(HeaderName, &str)]) -> HeaderMap {
        pairs
            .iter()
            .map(|(k, v)| (k.clone(), HeaderValue::from_str(v).unwrap()))
            .collect()
    }

    fn allowed() -> Vec<String> {
        vec!["application/json".to_string(), "multipart/".to_string()]
    }

    #[test]
    fn content_type_is_not_required_for_get_and_head() {
        let empty = HeaderMap::new();
        assert!(check_content_type(&Method::GET, &empty, &allowed()).is_ok());
        assert!(check_content_type(&Method::HEAD, &empty, &allowed()).is_ok());
    }

    #[test]
    fn content_type_missing_on_post() {
        assert_eq!(
            check_content_type(&Method::POST, &HeaderMap::new(), &allowed()),
            Err(AdmissionRejection::MissingContentType)
        );
    }

    #[test]
    fn content_type_prefix_match_ignores_parameters_and_case() {
        let json = headers(&[(CONTENT_TYPE, "Application/JSON; charset=utf-8")]);
        assert!(check_content_type(&Method::POST, &json, &allowed()).is_ok());

        let multipart = headers(&[(CONTENT_TYPE, "multipart/form-data; boundary=x")]);
        assert!(check_content_type(&Method::PUT, &multipart, &allowed()).is_ok());

        let xml = headers(&[(CONTENT_TYPE, "text/xml")]);
        assert_eq!(
            check_content_type(&Method::POST, &xml, &allowed()),
            Err(AdmissionRejection::UnsupportedContentType("text/xml".to_string()))
        );
    }

    #[test]
    fn empty_allow_list_disables_content_type_check() {
        assert!(check_content_type(&Method::POST, &HeaderMap::new(), &[]).is_ok());
    }

    #[test]
    fn content_length_limits() {
        assert!(check_content_length(&HeaderMap::new(), 10).is_ok());
        assert!(check_content_length(&headers(&[(CONTENT_LENGTH, "10")]), 10).is_ok());
        assert_eq!(
            check_content_length(&headers(&[(CONTENT_LENGTH, "11")]), 10),
            Err(AdmissionRejection::PayloadTooLarge { limit: 10 })
        );
        assert_eq!(
            check_content_length(&headers(&[(CONTENT_LENGTH, "lots")]), 10),
            Err(AdmissionRejection::InvalidContentLength)
        );
    }

    #[test]
    fn rejection_status_codes() {
        assert_eq!(AdmissionRejection::Blocked.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AdmissionRejection::RateLimited { retry_after: Duration::from_secs(1) }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(AdmissionRejection::MissingContentType.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AdmissionRejection::PayloadTooLarge { limit: 1 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn rate_limited_response_carries_retry_after() {
        let response = AdmissionRejection::RateLimited {
            retry_after: Duration::from_millis(40_500),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "41");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn hsts_header_value() {
        let config = SecurityHeadersConfig {
            hsts_include_subdomains: false,
            ..Default::default()
        };
        assert_eq!(config.hsts_header_value(), "max-age=31536000");
        assert_eq!(
            SecurityHeadersConfig::default().hsts_header_value(),
            "max-age=31536000; includeSubDomains"
        );
    }

    #[test]
    fn security_headers_do_not_override_handler_values() {
        let pairs = SecurityHeadersConfig::default().headers();
        let mut response_headers = headers(&[(X_FRAME_OPTIONS, "SAMEORIGIN")]);
        apply_security_headers(&mut response_headers, &pairs);

        assert_eq!(response_headers[X_FRAME_OPTIONS], "SAMEORIGIN");
        assert_eq!(response_headers[X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert!(response_headers.contains_key(STRICT_TRANSPORT_SECURITY));
        assert!(response_headers.contains_key(CONTENT_SECURITY_POLICY));
        assert_eq!(response_headers[REFERRER_POLICY], "strict-origin-when-cross-origin");
    }
}
