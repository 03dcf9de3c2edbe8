//! The narrow routing surface the transport core consumes.
//!
//! Route matching itself lives outside this crate; the core only needs to
//! know which service a stream targets and how that service exchanges data.

use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::sync::Arc;

/// How a service streams its request and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    /// Neither side streams.
    Unary,
    /// Only the request streams.
    RequestStreaming,
    /// Only the response streams.
    ResponseStreaming,
    /// Both sides stream.
    BidiStreaming,
}

impl ExchangeType {
    /// Returns true if the request body is delivered progressively.
    pub fn is_request_streaming(&self) -> bool {
        matches!(self, ExchangeType::RequestStreaming | ExchangeType::BidiStreaming)
    }

    /// Returns true if the response body is produced progressively.
    pub fn is_response_streaming(&self) -> bool {
        matches!(self, ExchangeType::ResponseStreaming | ExchangeType::BidiStreaming)
    }
}

/// Per-service settings resolved for a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Service name, used in logs.
    pub name: String,
    /// Exchange type of the service.
    pub exchange_type: ExchangeType,
    /// Maximum request body length in bytes, `0` meaning unlimited. `None`
    /// falls back to the transport-wide default.
    pub max_request_length: Option<u64>,
    /// Successful requests to transient services are not access-logged.
    pub transient: bool,
}

impl ServiceConfig {
    /// Creates a service config that inherits the default body limit.
    pub fn new(name: impl Into<String>, exchange_type: ExchangeType) -> Self {
        Self {
            name: name.into(),
            exchange_type,
            max_request_length: None,
            transient: false,
        }
    }

    /// Overrides the body limit for this service.
    pub fn with_max_request_length(mut self, max_request_length: u64) -> Self {
        self.max_request_length = Some(max_request_length);
        self
    }

    /// Returns the body limit, using `default` when the service sets none.
    pub fn effective_max_request_length(&self, default: u64) -> u64 {
        self.max_request_length.unwrap_or(default)
    }

    /// Marks the service as transient.
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

/// Decoded request headers of a stream.
#[derive(Debug, Clone)]
pub struct RequestHeaders {
    /// Request method.
    pub method: Method,
    /// Request path, without the query string.
    pub path: String,
    /// Remaining header fields.
    pub fields: HeaderMap,
}

impl RequestHeaders {
    /// Creates headers with no extra fields.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            fields: HeaderMap::new(),
        }
    }

    /// Returns true if the client asked to close the connection after this request.
    pub fn wants_close(&self) -> bool {
        self.fields
            .get(http::header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    }
}

/// Finds the service a stream targets.
pub trait HandlerResolver: Send + Sync {
    /// Returns the service for `headers`, or `None` if no route matches.
    fn resolve(&self, headers: &RequestHeaders) -> Option<Arc<ServiceConfig>>;
}

/// Exact-path resolver.
#[derive(Debug, Default)]
pub struct PathResolver {
    routes: HashMap<String, Arc<ServiceConfig>>,
}

impl PathResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `service` to `path`, replacing any previous binding.
    pub fn route(mut self, path: impl Into<String>, service: ServiceConfig) -> Self {
        self.routes.insert(path.into(), Arc::new(service));
        self
    }
}

impl HandlerResolver for PathResolver {
    fn resolve(&self, headers: &RequestHeaders) -> Option<Arc<ServiceConfig>> {
        self.routes.get(&headers.path).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_exchange_type_streaming_flags() {
        assert!(!ExchangeType::Unary.is_request_streaming());
        assert!(!ExchangeType::Unary.is_response_streaming());
        assert!(ExchangeType::RequestStreaming.is_request_streaming());
        assert!(!ExchangeType::ResponseStreaming.is_request_streaming());
        assert!(ExchangeType::BidiStreaming.is_request_streaming());
        assert!(ExchangeType::BidiStreaming.is_response_streaming());
    }

    #[test]
    fn test_path_resolver() {
        let resolver = PathResolver::new()
            .route(
                "/upload",
                ServiceConfig::new("upload", ExchangeType::RequestStreaming).with_max_request_length(0),
            )
            .route("/health", ServiceConfig::new("health", ExchangeType::Unary).transient());

        let service = resolver
            .resolve(&RequestHeaders::new(Method::POST, "/upload"))
            .unwrap();
        assert_eq!(service.name, "upload");
        assert_eq!(service.effective_max_request_length(1024), 0);
        assert!(!service.transient);
        assert!(resolver
            .resolve(&RequestHeaders::new(Method::GET, "/health"))
            .unwrap()
            .transient);
        assert!(resolver
            .resolve(&RequestHeaders::new(Method::GET, "/missing"))
            .is_none());
    }

    #[test]
    fn test_default_body_limit_inherited() {
        let service = ServiceConfig::new("echo", ExchangeType::Unary);
        assert_eq!(service.effective_max_request_length(4096), 4096);
        assert_eq!(
            service.with_max_request_length(16).effective_max_request_length(4096),
            16
        );
    }

    #[test]
    fn test_wants_close() {
        let mut headers = RequestHeaders::new(Method::GET, "/");
        assert!(!headers.wants_close());
        headers
            .fields
            .insert(http::header::CONNECTION, HeaderValue::from_static("Close"));
        assert!(headers.wants_close());
    }
}
