//! Credential injection for outgoing gRPC calls.

use secrecy::{ExposeSecret, SecretString};
use svc_core::StatusExt;
use tonic::metadata::AsciiMetadataValue;
use tonic::service::Interceptor;
use tonic::{Request, Status};

use crate::middleware::{REQUEST_ID_HEADER, RequestId};

/// Attaches `authorization: Bearer <token>` to every outgoing call and
/// forwards the caller's [`RequestId`] as `x-request-id` when present.
///
/// No validation happens client side; the server decides.
///
/// ```ignore
/// let channel = Endpoint::from_static("http://[::1]:50051").connect().await?;
/// let client = HealthClient::with_interceptor(channel, ClientAuthInterceptor::new(token));
/// ```
#[derive(Clone)]
pub struct ClientAuthInterceptor {
    token: SecretString,
}

impl ClientAuthInterceptor {
    #[must_use]
    pub const fn new(token: SecretString) -> Self {
        Self { token }
    }
}

impl Interceptor for ClientAuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let mut value: AsciiMetadataValue = format!("Bearer {}", self.token.expose_secret())
            .parse()
            .status("Invalid bearer token")?;
        value.set_sensitive(true);
        request.metadata_mut().insert("authorization", value);

        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|id| AsciiMetadataValue::try_from(id.as_str()).ok());
        if let Some(id) = request_id {
            request.metadata_mut().insert(REQUEST_ID_HEADER, id);
        }

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interceptor(token: &str) -> ClientAuthInterceptor {
        ClientAuthInterceptor::new(SecretString::from(token.to_string()))
    }

    #[test]
    fn attaches_bearer_token() {
        let request = interceptor("abc.def.ghi").call(Request::new(())).unwrap();
        assert_eq!(
            request.metadata().get("authorization").unwrap(),
            "Bearer abc.def.ghi"
        );
        assert!(request.metadata().get(REQUEST_ID_HEADER).is_none());
    }

    #[test]
    fn propagates_request_id_from_extensions() {
        let mut request = Request::new(());
        request
            .extensions_mut()
            .insert(RequestId::parse("corr-42").unwrap());

        let request = interceptor("tok").call(request).unwrap();
        assert_eq!(request.metadata().get(REQUEST_ID_HEADER).unwrap(), "corr-42");
    }

    #[test]
    fn overwrites_existing_authorization() {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert("authorization", "Bearer stale".parse().unwrap());

        let request = interceptor("fresh").call(request).unwrap();
        assert_eq!(request.metadata().get("authorization").unwrap(), "Bearer fresh");
    }

    #[test]
    fn rejects_tokens_that_are_not_valid_metadata() {
        let err = interceptor("bad\ntoken").call(Request::new(())).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }
}
