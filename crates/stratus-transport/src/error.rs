use thiserror::Error;

/// Reason a stream's response was aborted.
///
/// Cloned into every observer that needs it: the bound response producer,
/// the request body consumer and the access log record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortCause {
    #[error("stream reset by peer with code {code}")]
    PeerReset { code: u32 },

    #[error("request body of {received} bytes exceeds limit of {limit} bytes")]
    AggregationLimitExceeded { limit: u64, received: u64 },

    #[error("connection closed before the exchange completed")]
    ConnectionClosed,

    #[error("connection is draining")]
    ConnectionDraining,

    #[error("request cancelled: {0}")]
    Cancelled(String),
}

impl AbortCause {
    /// Returns true if the abort was initiated by the remote peer.
    pub fn is_peer_initiated(&self) -> bool {
        matches!(self, AbortCause::PeerReset { .. })
    }

    /// Converts the cause into the error surfaced for `stream_id`.
    pub fn into_error(self, stream_id: u32) -> TransportError {
        match self {
            AbortCause::AggregationLimitExceeded { limit, received } => {
                TransportError::AggregationLimitExceeded { limit, received }
            }
            cause => TransportError::AbortedRequest { stream_id, cause },
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("keep-alive limit reached: {reason}")]
    KeepAliveTimeout { reason: &'static str },

    #[error("keep-alive ping {payload:#x} not acknowledged within {timeout_ms}ms")]
    KeepAliveUnhealthy { payload: u64, timeout_ms: u64 },

    #[error("shutdown already in progress with reason {reason}")]
    ShutdownRace { reason: &'static str },

    #[error("request body of {received} bytes exceeds limit of {limit} bytes")]
    AggregationLimitExceeded { limit: u64, received: u64 },

    #[error("request on stream {stream_id} aborted: {cause}")]
    AbortedRequest { stream_id: u32, cause: AbortCause },

    #[error("response already bound to stream {stream_id}")]
    ResponseAlreadyBound { stream_id: u32 },

    #[error("unknown stream {stream_id}")]
    UnknownStream { stream_id: u32 },

    #[error("stream {stream_id} refused: {reason}")]
    StreamRefused { stream_id: u32, reason: &'static str },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_cause_maps_to_limit_error() {
        let err = AbortCause::AggregationLimitExceeded {
            limit: 1024,
            received: 2048,
        }
        .into_error(3);
        assert!(matches!(
            err,
            TransportError::AggregationLimitExceeded {
                limit: 1024,
                received: 2048
            }
        ));
    }

    #[test]
    fn test_other_cause_keeps_stream_id() {
        let err = AbortCause::ConnectionClosed.into_error(7);
        assert!(matches!(
            err,
            TransportError::AbortedRequest {
                stream_id: 7,
                cause: AbortCause::ConnectionClosed
            }
        ));
    }

    #[test]
    fn test_abort_cause_display() {
        let cause = AbortCause::PeerReset { code: 8 };
        assert_eq!(cause.to_string(), "stream reset by peer with code 8");
        assert!(cause.is_peer_initiated());
        assert!(!AbortCause::ConnectionClosed.is_peer_initiated());
    }
}
