//! Client IP address resolution.
//!
//! Precedence: first entry of `X-Forwarded-For`, then `X-Real-IP`, then the
//! socket peer address recorded by `into_make_service_with_connect_info`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::ConnectInfo;
use http::Request;

/// Header priority for IP extraction (highest to lowest).
const IP_HEADERS: &[&str] = &["x-forwarded-for", "x-real-ip"];

/// Client IP address resolved from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub Option<IpAddr>);

impl ClientIp {
    #[must_use]
    pub fn from_request<T>(req: &Request<T>) -> Self {
        Self(resolve(req))
    }

    #[inline]
    #[must_use]
    pub const fn ip(&self) -> Option<IpAddr> {
        self.0
    }

    /// Key for per-client state. Unresolvable clients share `0.0.0.0`.
    #[inline]
    #[must_use]
    pub fn key(&self) -> IpAddr {
        self.0.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

fn resolve<T>(req: &Request<T>) -> Option<IpAddr> {
    IP_HEADERS
        .iter()
        .find_map(|header| {
            req.headers()
                .get(*header)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.split(',').next())
                .map(str::trim)
                .and_then(|ip| ip.parse::<IpAddr>().ok())
        })
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip())
        })
}
