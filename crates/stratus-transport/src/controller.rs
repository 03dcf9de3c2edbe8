//! Per-connection controller.
//!
//! Glues the keep-alive monitor, the drain coordinator and the stream table
//! to one transport. Every method runs on the connection's serial context,
//! so nothing in here is locked; only the server-wide pieces in
//! [`ServerContext`] are shared.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::access_log::LogWriter;
use crate::config::TransportConfig;
use crate::error::{AbortCause, Result, TransportError};
use crate::keepalive::{FrameKind, KeepAliveAction, KeepAliveMonitor, KeepAliveStats};
use crate::metrics::TransportMetrics;
use crate::request::{RequestState, ResponseProducer, StreamInit, StreamRequest};
use crate::route::{HandlerResolver, RequestHeaders};
use crate::shutdown::{DrainHooks, DrainPhase, ShutdownCoordinator, ShutdownReason};
use crate::traffic::{ReadControl, TrafficController};

/// HTTP/2 error code: graceful shutdown.
pub const NO_ERROR: u32 = 0x0;
/// HTTP/2 error code: internal error.
pub const INTERNAL_ERROR: u32 = 0x2;
/// HTTP/2 error code: stream refused before any processing.
pub const REFUSED_STREAM: u32 = 0x7;
/// HTTP/2 error code: stream no longer needed.
pub const CANCEL: u32 = 0x8;

const UNBOUNDED_LAST_STREAM_ID: u32 = i32::MAX as u32;

/// Wire protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    /// HTTP/1 over TLS.
    H1,
    /// HTTP/1 cleartext.
    H1C,
    /// HTTP/2 over TLS.
    H2,
    /// HTTP/2 cleartext.
    H2C,
}

impl ProtocolKind {
    /// Label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolKind::H1 => "h1",
            ProtocolKind::H1C => "h1c",
            ProtocolKind::H2 => "h2",
            ProtocolKind::H2C => "h2c",
        }
    }

    /// Returns true for HTTP/2, which announces shutdowns with GOAWAY.
    pub fn is_http2(&self) -> bool {
        matches!(self, ProtocolKind::H2 | ProtocolKind::H2C)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Serving streams.
    Active,
    /// Shutdown announced; in-flight streams still run.
    Draining,
    /// Final shutdown signal sent, waiting for the transport to close.
    Closing,
    /// The transport is gone.
    Closed,
}

/// Transport lifecycle notifications. They may arrive in any order, any number of times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The controller was attached to the transport.
    Added,
    /// The transport was registered with its event loop.
    Registered,
    /// The transport became active.
    Active,
    /// The transport became inactive.
    Inactive,
    /// The controller was detached.
    Removed,
}

/// Writes to the transport on behalf of the controller.
pub trait TransportSink: ReadControl {
    /// Flushes buffered frames.
    fn flush(&self);
    /// Sends GOAWAY.
    fn go_away(&self, error_code: u32, last_stream_id: u32, debug_data: &str);
    /// Sends RST_STREAM.
    fn reset_stream(&self, stream_id: u32, error_code: u32);
    /// Sends a PING.
    fn ping(&self, payload: u64);
    /// Closes the transport.
    fn close(&self);
}

/// Receives requests once they can be handed to a service.
pub trait RequestHandler: Send {
    /// Called once per stream, when its body mode allows dispatch.
    fn on_request(&mut self, request: &mut StreamRequest);
}

/// Server-wide state shared by every connection.
#[derive(Clone)]
pub struct ServerContext {
    /// Transport configuration.
    pub config: Arc<TransportConfig>,
    /// Route lookup.
    pub resolver: Arc<dyn HandlerResolver>,
    /// Access log sink.
    pub log_writer: Arc<dyn LogWriter>,
    /// Transport metrics.
    pub metrics: Arc<TransportMetrics>,
    /// Set once the server is shutting down.
    pub closing: Arc<AtomicBool>,
}

impl ServerContext {
    /// Validates `config` and builds a context with fresh metrics.
    pub fn new(
        config: TransportConfig,
        resolver: Arc<dyn HandlerResolver>,
        log_writer: Arc<dyn LogWriter>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            resolver,
            log_writer,
            metrics: Arc::new(TransportMetrics::new()?),
            closing: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns true once the server is shutting down.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// Snapshot of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Connection id.
    pub connection_id: u64,
    /// Wire protocol.
    pub protocol: ProtocolKind,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Drain phase.
    pub drain_phase: DrainPhase,
    /// Streams still in the table.
    pub open_streams: usize,
    /// Highest stream id admitted so far.
    pub last_processed_stream_id: u32,
    /// Time since the controller was created.
    pub age: Duration,
    /// Keep-alive counters.
    pub keep_alive: KeepAliveStats,
}

struct GoAwayHooks<'a> {
    connection_id: u64,
    protocol: ProtocolKind,
    last_stream_id: u32,
    sink: &'a dyn TransportSink,
}

impl DrainHooks for GoAwayHooks<'_> {
    fn on_drain_start(&mut self, reason: ShutdownReason) {
        if self.protocol.is_http2() {
            self.sink
                .go_away(NO_ERROR, UNBOUNDED_LAST_STREAM_ID, reason.debug_tag());
            self.sink.flush();
        }
        debug!(connection_id = self.connection_id, reason = reason.debug_tag(), "shutdown announced");
    }

    fn on_drain_end(&mut self, reason: ShutdownReason) {
        if self.protocol.is_http2() {
            self.sink
                .go_away(NO_ERROR, self.last_stream_id, reason.debug_tag());
        }
        self.sink.close();
        debug!(
            connection_id = self.connection_id,
            last_stream_id = self.last_stream_id,
            reason = reason.debug_tag(),
            "final shutdown signal sent"
        );
    }
}

/// Controls the lifecycle of one connection.
pub struct ConnectionController {
    connection_id: u64,
    protocol: ProtocolKind,
    created_at: Instant,
    state: ConnectionState,
    registered: bool,
    active: bool,
    torn_down: bool,
    keep_alive: KeepAliveMonitor,
    keep_alive_close_requested: bool,
    shutdown: ShutdownCoordinator,
    drain_duration: Duration,
    default_max_request_length: u64,
    streams: HashMap<u32, StreamRequest>,
    last_processed_stream_id: u32,
    peer_error_code: Option<u32>,
    ctx: ServerContext,
    sink: Arc<dyn TransportSink>,
    traffic: Arc<TrafficController>,
    handler: Box<dyn RequestHandler>,
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController")
            .field("connection_id", &self.connection_id)
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .field("open_streams", &self.streams.len())
            .finish()
    }
}

impl ConnectionController {
    /// Creates the controller for a new connection.
    pub fn new<S: TransportSink + 'static>(
        connection_id: u64,
        protocol: ProtocolKind,
        ctx: ServerContext,
        sink: Arc<S>,
        handler: Box<dyn RequestHandler>,
        now: Instant,
    ) -> Self {
        let config = Arc::clone(&ctx.config);
        let keep_alive = KeepAliveMonitor::new(config.keep_alive.clone())
            .with_metrics(Arc::clone(&ctx.metrics), protocol.label());
        let read_control: Arc<dyn ReadControl> = sink.clone();
        let traffic = Arc::new(TrafficController::with_read_control(
            config.traffic.clone(),
            read_control,
        ));

        Self {
            connection_id,
            protocol,
            created_at: now,
            state: ConnectionState::Active,
            registered: false,
            active: false,
            torn_down: false,
            keep_alive,
            keep_alive_close_requested: false,
            shutdown: ShutdownCoordinator::new(),
            drain_duration: config.drain.drain_duration(),
            default_max_request_length: config.request.max_request_length,
            streams: HashMap::new(),
            last_processed_stream_id: 0,
            peer_error_code: None,
            ctx,
            sink,
            traffic,
            handler,
        }
    }

    /// Connection id.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Wire protocol.
    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Drain phase.
    pub fn drain_phase(&self) -> DrainPhase {
        self.shutdown.phase()
    }

    /// Inbound traffic controller of this connection.
    pub fn traffic(&self) -> &Arc<TrafficController> {
        &self.traffic
    }

    /// Returns the stream with `stream_id`, if it is still open.
    pub fn stream(&self, stream_id: u32) -> Option<&StreamRequest> {
        self.streams.get(&stream_id)
    }

    /// Highest stream id admitted so far.
    pub fn last_processed_stream_id(&self) -> u32 {
        self.last_processed_stream_id
    }

    /// Handles a transport lifecycle notification.
    pub fn on_lifecycle(&mut self, event: LifecycleEvent, now: Instant) {
        debug!(connection_id = self.connection_id, ?event, "lifecycle event");
        match event {
            LifecycleEvent::Added => {}
            LifecycleEvent::Registered => {
                self.registered = true;
                self.maybe_initialize(now);
            }
            LifecycleEvent::Active => {
                if !self.active && !self.torn_down {
                    self.active = true;
                    self.ctx.metrics.inc_connections_opened();
                }
                self.maybe_initialize(now);
            }
            LifecycleEvent::Inactive | LifecycleEvent::Removed => self.teardown(now),
        }
    }

    fn maybe_initialize(&mut self, now: Instant) {
        if self.registered && self.active && !self.torn_down && self.keep_alive.initialize(now) {
            info!(
                connection_id = self.connection_id,
                protocol = self.protocol.label(),
                "connection established"
            );
        }
    }

    fn teardown(&mut self, now: Instant) {
        self.keep_alive.destroy(now);
        self.shutdown.cancel();
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let open: Vec<u32> = self.streams.keys().copied().collect();
        for stream_id in open {
            if let Some(mut request) = self.streams.remove(&stream_id) {
                if request.state() != RequestState::Completed && !request.is_response_aborted() {
                    request.abort_response(AbortCause::ConnectionClosed, false);
                    self.ctx.metrics.inc_requests_aborted();
                }
                self.ctx.log_writer.write(&request.into_log(now));
            }
        }

        self.state = ConnectionState::Closed;
        if self.active {
            self.ctx.metrics.inc_connections_closed();
        }
        info!(
            connection_id = self.connection_id,
            age_ms = now.saturating_duration_since(self.created_at).as_millis() as u64,
            "connection closed"
        );
    }

    /// Returns true if the connection must close without waiting for a drain.
    pub fn needs_immediate_disconnection(&mut self, now: Instant) -> bool {
        self.ctx.is_closing() || self.peer_error_code.is_some() || self.keep_alive.is_unhealthy(now)
    }

    /// Closes the connection.
    ///
    /// An unhealthy connection, a peer error or a server shutdown closes right
    /// away. Otherwise a drain starts, tagged with the keep-alive limit that
    /// was hit, if any.
    pub fn close(&mut self, now: Instant) {
        if self.shutdown.is_closed() || self.torn_down {
            return;
        }
        if self.needs_immediate_disconnection(now) {
            self.force_close(now);
            return;
        }
        let reason = self
            .keep_alive
            .verdict(now)
            .map(ShutdownReason::from)
            .unwrap_or(ShutdownReason::ServerShutdown);
        self.start_drain(reason, self.drain_duration, now);
    }

    /// Starts a drain requested by the application. `drain` overrides the configured duration.
    pub fn on_application_shutdown_requested(&mut self, drain: Option<Duration>, now: Instant) {
        if self.torn_down {
            return;
        }
        let drain = drain.unwrap_or(self.drain_duration);
        self.start_drain(ShutdownReason::AppRequested, drain, now);
    }

    fn start_drain(&mut self, reason: ShutdownReason, drain: Duration, now: Instant) {
        let mut hooks = GoAwayHooks {
            connection_id: self.connection_id,
            protocol: self.protocol,
            last_stream_id: self.last_processed_stream_id,
            sink: self.sink.as_ref(),
        };
        match self.shutdown.start(reason, drain, now, &mut hooks) {
            Ok(()) => {
                self.ctx.metrics.inc_drains_started();
                if self.state == ConnectionState::Active {
                    self.state = ConnectionState::Draining;
                }
            }
            Err(err) => debug!(connection_id = self.connection_id, %err, "ignoring drain trigger"),
        }
        self.after_shutdown_step(now);
    }

    fn force_close(&mut self, now: Instant) {
        let reason = if self.peer_error_code.is_some() {
            ShutdownReason::PeerGoAway
        } else if self.keep_alive.is_unhealthy(now) {
            ShutdownReason::PingTimeout
        } else {
            ShutdownReason::ServerShutdown
        };
        let mut hooks = GoAwayHooks {
            connection_id: self.connection_id,
            protocol: self.protocol,
            last_stream_id: self.last_processed_stream_id,
            sink: self.sink.as_ref(),
        };
        if self.shutdown.force_immediate(reason, now, &mut hooks) {
            self.ctx.metrics.inc_immediate_disconnects();
        }
        self.after_shutdown_step(now);
    }

    fn after_shutdown_step(&mut self, now: Instant) {
        if self.shutdown.is_closed() && self.state < ConnectionState::Closing {
            self.state = ConnectionState::Closing;
            self.keep_alive.destroy(now);
        }
    }

    /// Fires due timers: keep-alive pings, keep-alive limits and the drain end.
    pub fn poll_timers(&mut self, now: Instant) {
        if self.torn_down {
            return;
        }
        if let Some(KeepAliveAction::SendPing(payload)) = self.keep_alive.poll(now) {
            self.sink.ping(payload);
            self.sink.flush();
        }

        let mut hooks = GoAwayHooks {
            connection_id: self.connection_id,
            protocol: self.protocol,
            last_stream_id: self.last_processed_stream_id,
            sink: self.sink.as_ref(),
        };
        if self.shutdown.poll(now, &mut hooks) {
            self.after_shutdown_step(now);
        }
        self.check_disconnection(now);
    }

    fn check_disconnection(&mut self, now: Instant) {
        if self.shutdown.is_closed() || self.torn_down {
            return;
        }
        if self.needs_immediate_disconnection(now) {
            self.force_close(now);
        } else if !self.keep_alive_close_requested && self.keep_alive.needs_disconnection(now) {
            self.keep_alive_close_requested = true;
            self.close(now);
        }
    }

    /// Returns the earliest instant at which [`poll_timers`](Self::poll_timers) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.keep_alive.next_deadline(), self.shutdown.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Handles a HEADERS frame that opens a stream.
    pub fn on_headers(
        &mut self,
        stream_id: u32,
        headers: RequestHeaders,
        end_of_stream: bool,
        now: Instant,
    ) -> Result<()> {
        self.keep_alive.on_activity(now, FrameKind::Headers);

        if self.state >= ConnectionState::Closing {
            return Err(self.refuse(stream_id, "connection closing"));
        }
        if !self.keep_alive.on_stream_opened() {
            let err = self.refuse(stream_id, "max-requests");
            self.check_disconnection(now);
            return Err(err);
        }

        self.ctx.metrics.inc_streams_opened();
        self.last_processed_stream_id = self.last_processed_stream_id.max(stream_id);

        let keep_alive = self.state == ConnectionState::Active
            && (self.protocol.is_http2() || !headers.wants_close());
        let service = self.ctx.resolver.resolve(&headers);
        let mut request = StreamRequest::new(
            StreamInit {
                connection_id: self.connection_id,
                stream_id,
                headers,
                end_of_stream,
                keep_alive,
                service,
                default_max_request_length: self.default_max_request_length,
                now,
            },
            &self.traffic,
        );
        if request.is_ready() {
            self.handler.on_request(&mut request);
        }
        self.streams.insert(stream_id, request);

        self.check_disconnection(now);
        Ok(())
    }

    fn refuse(&mut self, stream_id: u32, reason: &'static str) -> TransportError {
        debug!(connection_id = self.connection_id, stream_id, reason, "refusing stream");
        self.sink.reset_stream(stream_id, REFUSED_STREAM);
        self.ctx.metrics.inc_streams_refused();
        TransportError::StreamRefused { stream_id, reason }
    }

    /// Handles a DATA frame.
    pub fn on_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_of_stream: bool,
        now: Instant,
    ) -> Result<()> {
        self.keep_alive.on_activity(now, FrameKind::Data);
        let request = self
            .streams
            .get_mut(&stream_id)
            .ok_or(TransportError::UnknownStream { stream_id })?;

        let was_ready = request.is_ready();
        match request.on_data(data, end_of_stream) {
            Ok(()) => {
                if !was_ready && request.is_ready() {
                    self.handler.on_request(request);
                }
                Ok(())
            }
            Err(err) => {
                self.ctx.metrics.inc_aggregation_failures();
                warn!(connection_id = self.connection_id, stream_id, %err, "request body rejected");
                if let Some(cause) = request.abort_cause().cloned() {
                    // An aggregating service still sees the failure, as a pre-aborted stream.
                    if let Some(mut aborted) = request.to_aborted_streaming(cause, &self.traffic) {
                        self.handler.on_request(&mut aborted);
                        self.streams.insert(stream_id, aborted);
                    }
                    if self
                        .streams
                        .get(&stream_id)
                        .is_some_and(StreamRequest::reset_requested)
                    {
                        self.sink.reset_stream(stream_id, CANCEL);
                    }
                    self.finish_stream(stream_id, now);
                }
                Err(err)
            }
        }
    }

    /// Handles an inbound PING.
    pub fn on_ping(&mut self, _payload: u64, now: Instant) {
        self.keep_alive.on_activity(now, FrameKind::Ping);
    }

    /// Handles an inbound PING acknowledgement.
    pub fn on_ping_ack(&mut self, payload: u64, now: Instant) {
        self.keep_alive.on_activity(now, FrameKind::Ping);
        self.keep_alive.on_ping_ack(payload, now);
    }

    /// Handles RST_STREAM from the peer.
    pub fn on_rst_stream(&mut self, stream_id: u32, error_code: u32, now: Instant) -> Result<()> {
        self.keep_alive.on_activity(now, FrameKind::Control);
        let request = self
            .streams
            .get_mut(&stream_id)
            .ok_or(TransportError::UnknownStream { stream_id })?;
        if !request.is_response_aborted() {
            request.abort_response(AbortCause::PeerReset { code: error_code }, false);
            self.ctx.metrics.inc_requests_aborted();
        }
        self.finish_stream(stream_id, now);
        Ok(())
    }

    /// Handles GOAWAY from the peer. A non-zero error code closes immediately.
    pub fn on_go_away(&mut self, error_code: u32, last_stream_id: u32, now: Instant) {
        self.keep_alive.on_activity(now, FrameKind::Control);
        info!(connection_id = self.connection_id, error_code, last_stream_id, "peer sent GOAWAY");
        if error_code != NO_ERROR {
            self.peer_error_code.get_or_insert(error_code);
            self.force_close(now);
        } else if !self.torn_down && !self.shutdown.is_closed() {
            self.start_drain(ShutdownReason::PeerGoAway, self.drain_duration, now);
        }
    }

    /// Binds a response to an open stream.
    pub fn set_response(&mut self, stream_id: u32, producer: Box<dyn ResponseProducer>) -> Result<()> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(TransportError::UnknownStream { stream_id })?
            .set_response(producer)
    }

    /// Records that the response of `stream_id` finished and retires the stream.
    pub fn complete_response(&mut self, stream_id: u32, now: Instant) -> Result<()> {
        self.streams
            .get_mut(&stream_id)
            .ok_or(TransportError::UnknownStream { stream_id })?
            .on_response_complete();
        self.finish_stream(stream_id, now);
        Ok(())
    }

    /// Aborts an open stream locally and resets it.
    pub fn abort_stream(&mut self, stream_id: u32, cause: AbortCause, now: Instant) -> Result<()> {
        let request = self
            .streams
            .get_mut(&stream_id)
            .ok_or(TransportError::UnknownStream { stream_id })?;
        if !request.is_response_aborted() && request.abort_response(cause, true).is_some() {
            self.ctx.metrics.inc_requests_aborted();
        }
        if request.reset_requested() {
            self.sink.reset_stream(stream_id, CANCEL);
        }
        self.finish_stream(stream_id, now);
        Ok(())
    }

    fn finish_stream(&mut self, stream_id: u32, now: Instant) {
        if let Some(request) = self.streams.remove(&stream_id) {
            self.ctx.log_writer.write(&request.into_log(now));
        }
    }

    /// Returns a snapshot of the connection.
    pub fn stats(&self, now: Instant) -> ConnectionStats {
        ConnectionStats {
            connection_id: self.connection_id,
            protocol: self.protocol,
            state: self.state,
            drain_phase: self.shutdown.phase(),
            open_streams: self.streams.len(),
            last_processed_stream_id: self.last_processed_stream_id,
            age: now.saturating_duration_since(self.created_at),
            keep_alive: self.keep_alive.stats(),
        }
    }
}
