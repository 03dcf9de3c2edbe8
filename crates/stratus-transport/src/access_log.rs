//! Access log records emitted when a stream finishes.

use http::Method;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::AbortCause;
use crate::route::ExchangeType;

/// What happened to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLog {
    /// Connection the stream belonged to.
    pub connection_id: u64,
    /// Stream id on that connection.
    pub stream_id: u32,
    /// Request method.
    pub method: Method,
    /// Request path.
    pub path: String,
    /// Resolved service, if any route matched.
    pub service: Option<String>,
    /// Exchange type the request was decoded with.
    pub exchange_type: ExchangeType,
    /// Wall-clock start in microseconds since the epoch.
    pub start_time_micros: u64,
    /// Time from stream creation to completion or abort.
    pub duration: Duration,
    /// Request body bytes received.
    pub request_length: u64,
    /// Whether the service opted out of logging successful requests.
    pub transient: bool,
    /// Abort cause, if the exchange failed.
    pub cause: Option<AbortCause>,
}

impl RequestLog {
    /// Returns true if the exchange completed without an abort.
    pub fn is_success(&self) -> bool {
        self.cause.is_none()
    }

    /// Returns true if the record should be written at all.
    pub fn is_loggable(&self) -> bool {
        !(self.transient && self.is_success())
    }
}

/// Sink for finished requests.
pub trait LogWriter: Send + Sync {
    /// Writes one record.
    fn write(&self, log: &RequestLog);
}

/// Writes records as `tracing` events: failures at WARN, the rest at DEBUG.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogWriter;

impl LogWriter for TracingLogWriter {
    fn write(&self, log: &RequestLog) {
        if !log.is_loggable() {
            return;
        }
        let service = log.service.as_deref().unwrap_or("-");
        match &log.cause {
            Some(cause) => warn!(
                connection_id = log.connection_id,
                stream_id = log.stream_id,
                method = %log.method,
                path = %log.path,
                service,
                duration_us = log.duration.as_micros() as u64,
                request_length = log.request_length,
                %cause,
                "request failed"
            ),
            None => debug!(
                connection_id = log.connection_id,
                stream_id = log.stream_id,
                method = %log.method,
                path = %log.path,
                service,
                duration_us = log.duration.as_micros() as u64,
                request_length = log.request_length,
                "request completed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(transient: bool, cause: Option<AbortCause>) -> RequestLog {
        RequestLog {
            connection_id: 1,
            stream_id: 3,
            method: Method::GET,
            path: String::from("/health"),
            service: Some(String::from("health")),
            exchange_type: ExchangeType::Unary,
            start_time_micros: 0,
            duration: Duration::from_millis(2),
            request_length: 0,
            transient,
            cause,
        }
    }

    #[test]
    fn test_transient_success_not_logged() {
        assert!(!record(true, None).is_loggable());
        assert!(record(false, None).is_loggable());
    }

    #[test]
    fn test_transient_failure_still_logged() {
        let log = record(true, Some(AbortCause::PeerReset { code: 8 }));
        assert!(!log.is_success());
        assert!(log.is_loggable());
    }

    #[test]
    fn test_tracing_writer_accepts_any_record() {
        let writer = TracingLogWriter;
        writer.write(&record(false, None));
        writer.write(&record(false, Some(AbortCause::ConnectionClosed)));
        writer.write(&record(true, None));
    }
}
