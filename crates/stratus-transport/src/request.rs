//! Per-stream request state.
//!
//! The body delivery mode is picked once, when the stream's headers arrive:
//!
//! - no matching route, or headers that end the stream: [`EmptyRequest`]
//! - a service that does not stream its request: [`AggregatingRequest`]
//! - a request-streaming service: [`StreamingRequest`]
//!
//! Every variant owns the response bound to it and notifies that response of
//! an abort exactly once.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::access_log::RequestLog;
use crate::error::{AbortCause, Result, TransportError};
use crate::route::{ExchangeType, RequestHeaders, ServiceConfig};
use crate::traffic::TrafficController;

type Chunk = std::result::Result<Bytes, AbortCause>;

/// Consumer side of a bound response.
pub trait ResponseProducer: Send {
    /// Stops producing the response because the exchange failed.
    fn abort(&mut self, cause: AbortCause);
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// No content will ever be delivered.
    Empty,
    /// Buffering the body until the stream ends.
    Aggregating,
    /// Delivering the body chunk by chunk.
    Streaming,
    /// The response finished.
    Completed,
    /// The exchange was aborted.
    Aborted,
}

/// Everything needed to create a [`StreamRequest`].
#[derive(Debug, Clone)]
pub struct StreamInit {
    /// Id of the owning connection.
    pub connection_id: u64,
    /// Stream id, unique only while the connection lives.
    pub stream_id: u32,
    /// Decoded headers.
    pub headers: RequestHeaders,
    /// Whether the headers ended the stream.
    pub end_of_stream: bool,
    /// Whether the connection stays open after this exchange.
    pub keep_alive: bool,
    /// Resolved service, `None` if no route matched.
    pub service: Option<Arc<ServiceConfig>>,
    /// Body limit used when the service does not set one.
    pub default_max_request_length: u64,
    /// Creation time.
    pub now: Instant,
}

struct RequestCore {
    connection_id: u64,
    stream_id: u32,
    headers: RequestHeaders,
    keep_alive: bool,
    exchange_type: ExchangeType,
    service: Option<Arc<ServiceConfig>>,
    max_request_length: u64,
    start_instant: Instant,
    start_time_micros: u64,
    received: u64,
    response: Option<Box<dyn ResponseProducer>>,
    abort_cause: Option<AbortCause>,
    reset_requested: bool,
    completed: bool,
}

impl RequestCore {
    fn new(init: StreamInit, exchange_type: ExchangeType) -> Self {
        let max_request_length = init
            .service
            .as_ref()
            .map(|s| s.effective_max_request_length(init.default_max_request_length))
            .unwrap_or(init.default_max_request_length);
        Self {
            connection_id: init.connection_id,
            stream_id: init.stream_id,
            headers: init.headers,
            keep_alive: init.keep_alive,
            exchange_type,
            service: init.service,
            max_request_length,
            start_instant: init.now,
            start_time_micros: epoch_micros(),
            received: 0,
            response: None,
            abort_cause: None,
            reset_requested: false,
            completed: false,
        }
    }

    fn is_terminal(&self) -> bool {
        self.completed || self.abort_cause.is_some()
    }

    fn record_received(&mut self, len: u64) -> Option<AbortCause> {
        self.received = self.received.saturating_add(len);
        (self.max_request_length > 0 && self.received > self.max_request_length).then(|| {
            AbortCause::AggregationLimitExceeded {
                limit: self.max_request_length,
                received: self.received,
            }
        })
    }

    fn bind(&mut self, mut producer: Box<dyn ResponseProducer>) -> Result<()> {
        if self.response.is_some() {
            return Err(TransportError::ResponseAlreadyBound {
                stream_id: self.stream_id,
            });
        }
        if let Some(cause) = &self.abort_cause {
            producer.abort(cause.clone());
        }
        self.response = Some(producer);
        Ok(())
    }

    /// Returns true if this call recorded the cause.
    fn abort(&mut self, cause: AbortCause, reset_stream: bool) -> bool {
        if self.is_terminal() {
            return false;
        }
        debug!(
            connection_id = self.connection_id,
            stream_id = self.stream_id,
            %cause,
            reset_stream,
            "aborting request"
        );
        if let Some(response) = self.response.as_mut() {
            response.abort(cause.clone());
        }
        self.abort_cause = Some(cause);
        self.reset_requested = reset_stream;
        true
    }
}

/// A request that never attaches to content.
pub struct EmptyRequest {
    core: RequestCore,
}

/// A request whose body is buffered until the stream ends.
pub struct AggregatingRequest {
    core: RequestCore,
    buffer: BytesMut,
    complete: bool,
    taken: bool,
}

/// A request whose body is delivered progressively through a [`RequestBody`].
pub struct StreamingRequest {
    core: RequestCore,
    sender: Option<mpsc::UnboundedSender<Chunk>>,
    body: Option<RequestBody>,
    traffic: Arc<TrafficController>,
}

impl StreamingRequest {
    fn close_content(&mut self, cause: Option<AbortCause>) {
        if let Some(sender) = self.sender.take() {
            if let Some(cause) = cause {
                let _ = sender.send(Err(cause));
            }
        }
    }
}

/// Receiving end of a streaming request body.
///
/// Every chunk handed out is reported to the connection's traffic controller
/// as consumed. Chunks left behind when the body is dropped are released too.
pub struct RequestBody {
    rx: mpsc::UnboundedReceiver<Chunk>,
    traffic: Arc<TrafficController>,
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody").finish_non_exhaustive()
    }
}

impl RequestBody {
    fn channel(traffic: Arc<TrafficController>) -> (mpsc::UnboundedSender<Chunk>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx, traffic })
    }

    fn consumed(&self, item: &Chunk) {
        if let Ok(bytes) = item {
            self.traffic.on_consumed(bytes.len() as u64);
        }
    }

    /// Waits for the next chunk. `None` means the body ended cleanly.
    pub async fn chunk(&mut self) -> Option<Chunk> {
        let item = self.rx.recv().await?;
        self.consumed(&item);
        Some(item)
    }

    /// Returns the next chunk if one is already buffered.
    pub fn try_chunk(&mut self) -> Option<Chunk> {
        let item = self.rx.try_recv().ok()?;
        self.consumed(&item);
        Some(item)
    }

    /// Reads the whole body.
    pub async fn collect(mut self) -> std::result::Result<Bytes, AbortCause> {
        let mut buf = BytesMut::new();
        while let Some(item) = self.chunk().await {
            buf.extend_from_slice(&item?);
        }
        Ok(buf.freeze())
    }
}

impl Drop for RequestBody {
    fn drop(&mut self) {
        self.rx.close();
        while let Ok(item) = self.rx.try_recv() {
            self.consumed(&item);
        }
    }
}

/// A decoded request on one stream.
pub enum StreamRequest {
    /// See [`EmptyRequest`].
    Empty(EmptyRequest),
    /// See [`AggregatingRequest`].
    Aggregating(AggregatingRequest),
    /// See [`StreamingRequest`].
    Streaming(StreamingRequest),
}

impl fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRequest")
            .field("connection_id", &self.connection_id())
            .field("stream_id", &self.stream_id())
            .field("state", &self.state())
            .field("exchange_type", &self.exchange_type())
            .finish()
    }
}

impl StreamRequest {
    /// Creates the request variant matching the route and the headers.
    pub fn new(init: StreamInit, traffic: &Arc<TrafficController>) -> Self {
        let Some(service) = init.service.as_ref() else {
            return StreamRequest::Empty(EmptyRequest {
                core: RequestCore::new(init, ExchangeType::ResponseStreaming),
            });
        };
        let exchange_type = service.exchange_type;

        if init.end_of_stream {
            StreamRequest::Empty(EmptyRequest {
                core: RequestCore::new(init, exchange_type),
            })
        } else if exchange_type.is_request_streaming() {
            let (sender, body) = RequestBody::channel(Arc::clone(traffic));
            StreamRequest::Streaming(StreamingRequest {
                core: RequestCore::new(init, exchange_type),
                sender: Some(sender),
                body: Some(body),
                traffic: Arc::clone(traffic),
            })
        } else {
            StreamRequest::Aggregating(AggregatingRequest {
                core: RequestCore::new(init, exchange_type),
                buffer: BytesMut::new(),
                complete: false,
                taken: false,
            })
        }
    }

    fn core(&self) -> &RequestCore {
        match self {
            StreamRequest::Empty(r) => &r.core,
            StreamRequest::Aggregating(r) => &r.core,
            StreamRequest::Streaming(r) => &r.core,
        }
    }

    fn core_mut(&mut self) -> &mut RequestCore {
        match self {
            StreamRequest::Empty(r) => &mut r.core,
            StreamRequest::Aggregating(r) => &mut r.core,
            StreamRequest::Streaming(r) => &mut r.core,
        }
    }

    /// Id of the owning connection.
    pub fn connection_id(&self) -> u64 {
        self.core().connection_id
    }

    /// Stream id on the owning connection.
    pub fn stream_id(&self) -> u32 {
        self.core().stream_id
    }

    /// Decoded request headers.
    pub fn headers(&self) -> &RequestHeaders {
        &self.core().headers
    }

    /// Resolved service, if a route matched.
    pub fn service(&self) -> Option<&Arc<ServiceConfig>> {
        self.core().service.as_ref()
    }

    /// Exchange type the request was created with.
    pub fn exchange_type(&self) -> ExchangeType {
        self.core().exchange_type
    }

    /// Whether the connection stays open after this exchange.
    pub fn is_keep_alive(&self) -> bool {
        self.core().keep_alive
    }

    /// Monotonic creation time.
    pub fn start_instant(&self) -> Instant {
        self.core().start_instant
    }

    /// Wall-clock creation time in microseconds since the epoch.
    pub fn start_time_micros(&self) -> u64 {
        self.core().start_time_micros
    }

    /// Body bytes received so far.
    pub fn received_bytes(&self) -> u64 {
        self.core().received
    }

    /// Returns true if the body must be fully buffered before dispatch.
    pub fn needs_aggregation(&self) -> bool {
        matches!(self, StreamRequest::Aggregating(_))
    }

    /// Returns true once the request can be handed to its service.
    pub fn is_ready(&self) -> bool {
        match self {
            StreamRequest::Aggregating(r) => r.complete || r.core.abort_cause.is_some(),
            _ => true,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        let core = self.core();
        if core.abort_cause.is_some() {
            return RequestState::Aborted;
        }
        if core.completed {
            return RequestState::Completed;
        }
        match self {
            StreamRequest::Empty(_) => RequestState::Empty,
            StreamRequest::Aggregating(_) => RequestState::Aggregating,
            StreamRequest::Streaming(_) => RequestState::Streaming,
        }
    }

    /// The recorded abort cause, if aborted.
    pub fn abort_cause(&self) -> Option<&AbortCause> {
        self.core().abort_cause.as_ref()
    }

    /// Returns true if the response was aborted.
    pub fn is_response_aborted(&self) -> bool {
        self.core().abort_cause.is_some()
    }

    /// Returns true if the abort asked for the stream to be reset.
    pub fn reset_requested(&self) -> bool {
        self.core().reset_requested
    }

    /// Returns true if a response is bound.
    pub fn has_response(&self) -> bool {
        self.core().response.is_some()
    }

    /// Feeds a DATA frame into the request.
    ///
    /// Exceeding the body limit aborts the request and fails with
    /// [`TransportError::AggregationLimitExceeded`]. Data for an empty or
    /// finished request is dropped.
    pub fn on_data(&mut self, data: Bytes, end_of_stream: bool) -> Result<()> {
        let len = data.len() as u64;
        match self {
            StreamRequest::Empty(r) => {
                r.core.received = r.core.received.saturating_add(len);
                Ok(())
            }
            StreamRequest::Aggregating(r) => {
                if r.core.is_terminal() || r.complete {
                    return Ok(());
                }
                if let Some(cause) = r.core.record_received(len) {
                    r.buffer = BytesMut::new();
                    r.core.abort(cause.clone(), true);
                    return Err(cause.into_error(r.core.stream_id));
                }
                r.buffer.extend_from_slice(&data);
                r.complete = end_of_stream;
                Ok(())
            }
            StreamRequest::Streaming(r) => {
                if r.core.is_terminal() || r.sender.is_none() {
                    return Ok(());
                }
                if let Some(cause) = r.core.record_received(len) {
                    r.core.abort(cause.clone(), true);
                    r.close_content(Some(cause.clone()));
                    return Err(cause.into_error(r.core.stream_id));
                }
                if len > 0 {
                    r.traffic.on_data(len);
                    let delivered = r
                        .sender
                        .as_ref()
                        .is_some_and(|sender| sender.send(Ok(data)).is_ok());
                    if !delivered {
                        r.traffic.on_consumed(len);
                    }
                }
                if end_of_stream {
                    r.close_content(None);
                }
                Ok(())
            }
        }
    }

    /// Hands out the body of a streaming request. Only the first call returns it.
    pub fn take_body(&mut self) -> Option<RequestBody> {
        match self {
            StreamRequest::Streaming(r) => r.body.take(),
            _ => None,
        }
    }

    /// Hands out the buffered body of a complete aggregating request, once.
    pub fn take_aggregated(&mut self) -> Option<Bytes> {
        match self {
            StreamRequest::Aggregating(r)
                if r.complete && !r.taken && r.core.abort_cause.is_none() =>
            {
                r.taken = true;
                Some(std::mem::take(&mut r.buffer).freeze())
            }
            _ => None,
        }
    }

    /// Binds the response. Fails if one is already bound, leaving it in place.
    ///
    /// A response bound to an aborted request is aborted right away.
    pub fn set_response(&mut self, producer: Box<dyn ResponseProducer>) -> Result<()> {
        self.core_mut().bind(producer)
    }

    /// Aborts the exchange.
    ///
    /// The first abort is delivered to the bound response and closes the body
    /// with `cause`. Later calls keep the first cause. Returns the recorded
    /// cause, or `None` if the response already completed.
    pub fn abort_response(&mut self, cause: AbortCause, reset_stream: bool) -> Option<AbortCause> {
        let first = self.core_mut().abort(cause.clone(), reset_stream);
        if first {
            match self {
                StreamRequest::Aggregating(r) => r.buffer = BytesMut::new(),
                StreamRequest::Streaming(r) => r.close_content(Some(cause)),
                StreamRequest::Empty(_) => {}
            }
        }
        self.core().abort_cause.clone()
    }

    /// Marks the response finished. Returns false if the request was already terminal.
    pub fn on_response_complete(&mut self) -> bool {
        let core = self.core_mut();
        if core.is_terminal() {
            return false;
        }
        core.completed = true;
        true
    }

    /// Builds a streaming request whose body and response are already failed with `cause`.
    ///
    /// Lets a service observe an aggregation failure without seeing any of the
    /// buffered content. Returns `None` unless this is an aggregating request.
    pub fn to_aborted_streaming(
        &self,
        cause: AbortCause,
        traffic: &Arc<TrafficController>,
    ) -> Option<StreamRequest> {
        let StreamRequest::Aggregating(r) = self else {
            return None;
        };
        let source = &r.core;
        let (sender, body) = RequestBody::channel(Arc::clone(traffic));
        let _ = sender.send(Err(cause.clone()));

        Some(StreamRequest::Streaming(StreamingRequest {
            core: RequestCore {
                connection_id: source.connection_id,
                stream_id: source.stream_id,
                headers: source.headers.clone(),
                keep_alive: source.keep_alive,
                exchange_type: source.exchange_type,
                service: source.service.clone(),
                max_request_length: source.max_request_length,
                start_instant: source.start_instant,
                start_time_micros: source.start_time_micros,
                received: source.received,
                response: None,
                abort_cause: Some(cause),
                reset_requested: source.reset_requested,
                completed: false,
            },
            sender: None,
            body: Some(body),
            traffic: Arc::clone(traffic),
        }))
    }

    /// Consumes the request into its access log record.
    pub fn into_log(self, now: Instant) -> RequestLog {
        let core = self.core();
        RequestLog {
            connection_id: core.connection_id,
            stream_id: core.stream_id,
            method: core.headers.method.clone(),
            path: core.headers.path.clone(),
            service: core.service.as_ref().map(|s| s.name.clone()),
            exchange_type: core.exchange_type,
            start_time_micros: core.start_time_micros,
            duration: now.saturating_duration_since(core.start_instant),
            request_length: core.received,
            transient: core.service.as_ref().is_some_and(|s| s.transient),
            cause: core.abort_cause.clone(),
        }
    }
}

fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
