//! Runs connection controllers on tokio.
//!
//! Each connection gets one task. The task owns the controller and is the
//! only place its state changes: transport events arrive over a channel and
//! timers are a single sleep on the controller's next deadline. Writes go back
//! to the transport through a [`TransportSink`], typically a [`ChannelSink`].

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::controller::{
    ConnectionController, ConnectionState, LifecycleEvent, ProtocolKind, RequestHandler,
    ServerContext, TransportSink,
};
use crate::error::{AbortCause, Result};
use crate::request::ResponseProducer;
use crate::route::RequestHeaders;
use crate::traffic::ReadControl;

/// Something that happened on, or to, a connection.
pub enum ConnectionEvent {
    /// Transport lifecycle change.
    Lifecycle(LifecycleEvent),
    /// A HEADERS frame opened a stream.
    Headers {
        /// Stream id.
        stream_id: u32,
        /// Decoded headers.
        headers: RequestHeaders,
        /// Whether the frame ended the stream.
        end_of_stream: bool,
    },
    /// A DATA frame.
    Data {
        /// Stream id.
        stream_id: u32,
        /// Payload.
        data: Bytes,
        /// Whether the frame ended the stream.
        end_of_stream: bool,
    },
    /// A PING from the peer.
    Ping(u64),
    /// A PING acknowledgement from the peer.
    PingAck(u64),
    /// RST_STREAM from the peer.
    RstStream {
        /// Stream id.
        stream_id: u32,
        /// Error code.
        error_code: u32,
    },
    /// GOAWAY from the peer.
    GoAway {
        /// Error code.
        error_code: u32,
        /// Last stream id the peer will process.
        last_stream_id: u32,
    },
    /// Bind a response to a stream.
    SetResponse {
        /// Stream id.
        stream_id: u32,
        /// The response.
        producer: Box<dyn ResponseProducer>,
    },
    /// The response of a stream finished.
    ResponseComplete(u32),
    /// Abort a stream locally.
    AbortStream {
        /// Stream id.
        stream_id: u32,
        /// Why.
        cause: AbortCause,
    },
    /// Close the connection, immediately if required.
    Close,
    /// Drain the connection on behalf of the application.
    ApplicationShutdown(Option<Duration>),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::Lifecycle(event) => write!(f, "Lifecycle({event:?})"),
            ConnectionEvent::Headers { stream_id, .. } => write!(f, "Headers({stream_id})"),
            ConnectionEvent::Data { stream_id, data, .. } => {
                write!(f, "Data({stream_id}, {} bytes)", data.len())
            }
            ConnectionEvent::Ping(payload) => write!(f, "Ping({payload:#x})"),
            ConnectionEvent::PingAck(payload) => write!(f, "PingAck({payload:#x})"),
            ConnectionEvent::RstStream { stream_id, error_code } => {
                write!(f, "RstStream({stream_id}, {error_code:#x})")
            }
            ConnectionEvent::GoAway { error_code, last_stream_id } => {
                write!(f, "GoAway({error_code:#x}, {last_stream_id})")
            }
            ConnectionEvent::SetResponse { stream_id, .. } => write!(f, "SetResponse({stream_id})"),
            ConnectionEvent::ResponseComplete(stream_id) => write!(f, "ResponseComplete({stream_id})"),
            ConnectionEvent::AbortStream { stream_id, cause } => {
                write!(f, "AbortStream({stream_id}, {cause})")
            }
            ConnectionEvent::Close => f.write_str("Close"),
            ConnectionEvent::ApplicationShutdown(drain) => write!(f, "ApplicationShutdown({drain:?})"),
        }
    }
}

/// Sender side of a connection's event channel.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: u64,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionHandle {
    /// Connection id.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Queues `event`. Returns false if the connection's task already ended.
    pub fn send(&self, event: ConnectionEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Transport write forwarded by a [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkCommand {
    /// Flush buffered frames.
    Flush,
    /// Send GOAWAY.
    GoAway {
        /// Error code.
        error_code: u32,
        /// Highest stream id processed.
        last_stream_id: u32,
        /// Debug data.
        debug_data: String,
    },
    /// Send RST_STREAM.
    ResetStream {
        /// Stream id.
        stream_id: u32,
        /// Error code.
        error_code: u32,
    },
    /// Send PING.
    Ping(u64),
    /// Close the transport.
    Close,
    /// Stop reading from the socket.
    SuspendReads,
    /// Resume reading from the socket.
    ResumeReads,
}

/// A sink that forwards every write to the I/O task owning the socket.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkCommand>,
}

impl ChannelSink {
    /// Creates the sink and the receiver the I/O task reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, command: SinkCommand) {
        if self.tx.send(command).is_err() {
            debug!("transport already gone, dropping write");
        }
    }
}

impl ReadControl for ChannelSink {
    fn suspend_reads(&self) {
        self.send(SinkCommand::SuspendReads);
    }

    fn resume_reads(&self) {
        self.send(SinkCommand::ResumeReads);
    }
}

impl TransportSink for ChannelSink {
    fn flush(&self) {
        self.send(SinkCommand::Flush);
    }

    fn go_away(&self, error_code: u32, last_stream_id: u32, debug_data: &str) {
        self.send(SinkCommand::GoAway {
            error_code,
            last_stream_id,
            debug_data: debug_data.to_string(),
        });
    }

    fn reset_stream(&self, stream_id: u32, error_code: u32) {
        self.send(SinkCommand::ResetStream {
            stream_id,
            error_code,
        });
    }

    fn ping(&self, payload: u64) {
        self.send(SinkCommand::Ping(payload));
    }

    fn close(&self) {
        self.send(SinkCommand::Close);
    }
}

/// Drives one controller until the connection is closed.
pub struct ConnectionDriver {
    controller: ConnectionController,
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl ConnectionDriver {
    /// Pairs a controller with its event receiver.
    pub fn new(controller: ConnectionController, rx: mpsc::UnboundedReceiver<ConnectionEvent>) -> Self {
        Self { controller, rx }
    }

    /// Processes events and timers until the connection reaches [`ConnectionState::Closed`].
    ///
    /// Dropping every sender counts as the controller being removed.
    pub async fn run(mut self) -> ConnectionController {
        let connection_id = self.controller.connection_id();
        debug!(connection_id, "connection driver started");
        loop {
            let deadline = self.controller.next_deadline();
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => self
                        .controller
                        .on_lifecycle(LifecycleEvent::Removed, Instant::now()),
                },
                _ = sleep_or_pending(deadline) => self.controller.poll_timers(Instant::now()),
            }
            if self.controller.state() == ConnectionState::Closed {
                break;
            }
        }
        debug!(connection_id, "connection driver stopped");
        self.controller
    }

    fn dispatch(&mut self, event: ConnectionEvent) {
        let now = Instant::now();
        let controller = &mut self.controller;
        let result: Result<()> = match event {
            ConnectionEvent::Lifecycle(event) => {
                controller.on_lifecycle(event, now);
                Ok(())
            }
            ConnectionEvent::Headers {
                stream_id,
                headers,
                end_of_stream,
            } => controller.on_headers(stream_id, headers, end_of_stream, now),
            ConnectionEvent::Data {
                stream_id,
                data,
                end_of_stream,
            } => controller.on_data(stream_id, data, end_of_stream, now),
            ConnectionEvent::Ping(payload) => {
                controller.on_ping(payload, now);
                Ok(())
            }
            ConnectionEvent::PingAck(payload) => {
                controller.on_ping_ack(payload, now);
                Ok(())
            }
            ConnectionEvent::RstStream {
                stream_id,
                error_code,
            } => controller.on_rst_stream(stream_id, error_code, now),
            ConnectionEvent::GoAway {
                error_code,
                last_stream_id,
            } => {
                controller.on_go_away(error_code, last_stream_id, now);
                Ok(())
            }
            ConnectionEvent::SetResponse {
                stream_id,
                producer,
            } => controller.set_response(stream_id, producer),
            ConnectionEvent::ResponseComplete(stream_id) => {
                controller.complete_response(stream_id, now)
            }
            ConnectionEvent::AbortStream { stream_id, cause } => {
                controller.abort_stream(stream_id, cause, now)
            }
            ConnectionEvent::Close => {
                controller.close(now);
                Ok(())
            }
            ConnectionEvent::ApplicationShutdown(drain) => {
                controller.on_application_shutdown_requested(drain, now);
                Ok(())
            }
        };
        if let Err(err) = result {
            debug!(connection_id = controller.connection_id(), %err, "event rejected");
        }
    }
}

async fn sleep_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Every live connection of a server, plus the server-wide closing flag.
///
/// The registry only holds weak senders: once the transport drops every
/// [`ConnectionHandle`] the connection's task ends as if it was removed.
pub struct ConnectionRegistry {
    ctx: ServerContext,
    connections: DashMap<u64, mpsc::WeakUnboundedSender<ConnectionEvent>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("closing", &self.ctx.is_closing())
            .finish()
    }
}

impl ConnectionRegistry {
    /// Creates an empty registry sharing `ctx` with every connection.
    pub fn new(ctx: ServerContext) -> Self {
        Self {
            ctx,
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Server-wide context.
    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Spawns the driver task of a new connection.
    ///
    /// The connection leaves the registry when its task ends.
    pub fn spawn<S: TransportSink + 'static>(
        self: &Arc<Self>,
        protocol: ProtocolKind,
        sink: Arc<S>,
        handler: Box<dyn RequestHandler>,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let controller = ConnectionController::new(
            connection_id,
            protocol,
            self.ctx.clone(),
            sink,
            handler,
            Instant::now(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(connection_id, tx.downgrade());
        let handle = ConnectionHandle { connection_id, tx };

        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            ConnectionDriver::new(controller, rx).run().await;
            registry.connections.remove(&connection_id);
        });

        if self.ctx.is_closing() {
            handle.send(ConnectionEvent::Close);
        }
        (handle, task)
    }

    /// Returns a handle to a live connection, if the transport still holds one.
    pub fn get(&self, connection_id: u64) -> Option<ConnectionHandle> {
        let tx = self.connections.get(&connection_id)?.value().upgrade()?;
        Some(ConnectionHandle { connection_id, tx })
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns true if no connection is live.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Returns true once [`shutdown_all`](Self::shutdown_all) was called.
    pub fn is_closing(&self) -> bool {
        self.ctx.is_closing()
    }

    /// Marks the server as closing and closes every connection without a drain.
    pub fn shutdown_all(&self) -> usize {
        self.ctx.closing.store(true, Ordering::Release);
        let notified = self.broadcast(|| ConnectionEvent::Close);
        info!(connections = notified, "closing all connections");
        notified
    }

    /// Asks every connection to drain, leaving the server open.
    pub fn drain_all(&self, drain: Option<Duration>) -> usize {
        let notified = self.broadcast(|| ConnectionEvent::ApplicationShutdown(drain));
        info!(connections = notified, drain_us = drain.map(|d| d.as_micros() as u64), "draining all connections");
        notified
    }

    fn broadcast(&self, event: impl Fn() -> ConnectionEvent) -> usize {
        self.connections
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .filter(|tx| tx.send(event()).is_ok())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KeepAliveConfig, TransportConfig};
    use crate::controller::tests::{context, RecordingLogWriter};
    use crate::controller::NO_ERROR;
    use crate::request::{RequestBody, StreamRequest};
    use http::Method;
    use std::sync::Mutex;

    const UNBOUNDED: u32 = i32::MAX as u32;

    #[derive(Clone, Default)]
    struct BodyGrabber {
        body: Arc<Mutex<Option<RequestBody>>>,
    }

    impl RequestHandler for BodyGrabber {
        fn on_request(&mut self, request: &mut StreamRequest) {
            *self.body.lock().unwrap() = request.take_body();
        }
    }

    fn registry(config: TransportConfig) -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(context(config, RecordingLogWriter::default())))
    }

    fn go_away(last_stream_id: u32, tag: &str) -> SinkCommand {
        SinkCommand::GoAway {
            error_code: NO_ERROR,
            last_stream_id,
            debug_data: tag.to_string(),
        }
    }

    fn assert_elapsed(start: Instant, millis: u64) {
        let elapsed = start.elapsed();
        let expected = Duration::from_millis(millis);
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(5),
            "expected ~{millis}ms, got {elapsed:?}"
        );
    }

    fn open(handle: &ConnectionHandle) {
        handle.send(ConnectionEvent::Lifecycle(LifecycleEvent::Added));
        handle.send(ConnectionEvent::Lifecycle(LifecycleEvent::Active));
        handle.send(ConnectionEvent::Lifecycle(LifecycleEvent::Registered));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_drained_on_schedule() {
        let mut config = TransportConfig::default();
        config.keep_alive = KeepAliveConfig {
            idle_timeout_millis: 5000,
            ..KeepAliveConfig::disabled()
        };
        config.drain.drain_duration_micros = 2_000_000;
        let registry = registry(config);
        let (sink, mut commands) = ChannelSink::channel();
        let start = Instant::now();
        let (handle, task) = registry.spawn(ProtocolKind::H2, Arc::new(sink), Box::new(BodyGrabber::default()));
        open(&handle);
        assert_eq!(registry.len(), 1);

        assert_eq!(commands.recv().await, Some(go_away(UNBOUNDED, "idle-timeout")));
        assert_elapsed(start, 5000);
        assert_eq!(commands.recv().await, Some(SinkCommand::Flush));

        assert_eq!(commands.recv().await, Some(go_away(0, "idle-timeout")));
        assert_elapsed(start, 7000);
        assert_eq!(commands.recv().await, Some(SinkCommand::Close));

        handle.send(ConnectionEvent::Lifecycle(LifecycleEvent::Inactive));
        task.await.unwrap();
        assert!(registry.is_empty());
        assert!(!handle.send(ConnectionEvent::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_idle_drain() {
        let mut config = TransportConfig::default();
        config.keep_alive = KeepAliveConfig {
            idle_timeout_millis: 1000,
            ..KeepAliveConfig::disabled()
        };
        config.drain.drain_duration_micros = 0;
        let registry = registry(config);
        let (sink, mut commands) = ChannelSink::channel();
        let start = Instant::now();
        let (handle, _task) = registry.spawn(ProtocolKind::H2, Arc::new(sink), Box::new(BodyGrabber::default()));
        open(&handle);

        tokio::time::sleep(Duration::from_millis(800)).await;
        handle.send(ConnectionEvent::Ping(1));
        handle.send(ConnectionEvent::Headers {
            stream_id: 1,
            headers: RequestHeaders::new(Method::GET, "/unary"),
            end_of_stream: true,
        });

        assert_eq!(commands.recv().await, Some(go_away(UNBOUNDED, "idle-timeout")));
        assert_elapsed(start, 1800);
        assert_eq!(commands.recv().await, Some(SinkCommand::Flush));
        assert_eq!(commands.recv().await, Some(go_away(1, "idle-timeout")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_ping_closes_immediately() {
        let mut config = TransportConfig::default();
        config.keep_alive = KeepAliveConfig {
            ping_interval_millis: 1000,
            ping_timeout_millis: 500,
            ..KeepAliveConfig::disabled()
        };
        let registry = registry(config);
        let (sink, mut commands) = ChannelSink::channel();
        let start = Instant::now();
        let (handle, _task) = registry.spawn(ProtocolKind::H2, Arc::new(sink), Box::new(BodyGrabber::default()));
        open(&handle);

        assert!(matches!(commands.recv().await, Some(SinkCommand::Ping(_))));
        assert_elapsed(start, 1000);
        assert_eq!(commands.recv().await, Some(SinkCommand::Flush));

        assert_eq!(commands.recv().await, Some(go_away(0, "ping-timeout")));
        assert_elapsed(start, 1500);
        assert_eq!(commands.recv().await, Some(SinkCommand::Close));
        assert_eq!(registry.context().metrics.snapshot().immediate_disconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all_skips_drain() {
        let registry = registry(TransportConfig::default());
        let (sink, mut commands) = ChannelSink::channel();
        let (handle, _task) = registry.spawn(ProtocolKind::H2C, Arc::new(sink), Box::new(BodyGrabber::default()));
        open(&handle);

        assert_eq!(registry.shutdown_all(), 1);
        assert!(registry.is_closing());
        assert_eq!(commands.recv().await, Some(go_away(0, "server-shutdown")));
        assert_eq!(commands.recv().await, Some(SinkCommand::Close));

        let (late_sink, mut late_commands) = ChannelSink::channel();
        let (late, _late_task) =
            registry.spawn(ProtocolKind::H2C, Arc::new(late_sink), Box::new(BodyGrabber::default()));
        open(&late);
        assert_eq!(late_commands.recv().await, Some(go_away(0, "server-shutdown")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_all_uses_requested_duration() {
        let registry = registry(TransportConfig::default());
        let (sink, mut commands) = ChannelSink::channel();
        let start = Instant::now();
        let (handle, _task) = registry.spawn(ProtocolKind::H2, Arc::new(sink), Box::new(BodyGrabber::default()));
        open(&handle);

        assert_eq!(registry.drain_all(Some(Duration::from_millis(300))), 1);
        assert_eq!(commands.recv().await, Some(go_away(UNBOUNDED, "app-requested")));
        assert_eq!(commands.recv().await, Some(SinkCommand::Flush));
        assert_eq!(commands.recv().await, Some(go_away(0, "app-requested")));
        assert_elapsed(start, 300);
        assert!(!registry.is_closing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_backpressure_round_trip() {
        let mut config = TransportConfig::default();
        config.traffic.high_water_mark = 8;
        config.traffic.low_water_mark = 2;
        let registry = registry(config);
        let (sink, mut commands) = ChannelSink::channel();
        let grabber = BodyGrabber::default();
        let (handle, _task) = registry.spawn(ProtocolKind::H2, Arc::new(sink), Box::new(grabber.clone()));
        open(&handle);

        handle.send(ConnectionEvent::Headers {
            stream_id: 1,
            headers: RequestHeaders::new(Method::POST, "/stream"),
            end_of_stream: false,
        });
        handle.send(ConnectionEvent::Data {
            stream_id: 1,
            data: Bytes::from_static(b"0123456789"),
            end_of_stream: false,
        });
        assert_eq!(commands.recv().await, Some(SinkCommand::SuspendReads));

        let mut body = grabber.body.lock().unwrap().take().unwrap();
        assert_eq!(body.chunk().await, Some(Ok(Bytes::from_static(b"0123456789"))));
        assert_eq!(commands.recv().await, Some(SinkCommand::ResumeReads));

        handle.send(ConnectionEvent::RstStream {
            stream_id: 1,
            error_code: 0x8,
        });
        assert_eq!(body.chunk().await, Some(Err(AbortCause::PeerReset { code: 0x8 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_ends_registered_connection() {
        let registry = registry(TransportConfig::default());
        let (sink, _commands) = ChannelSink::channel();
        let (handle, task) = registry.spawn(ProtocolKind::H2, Arc::new(sink), Box::new(BodyGrabber::default()));
        open(&handle);
        let connection_id = handle.connection_id();
        assert!(registry.get(connection_id).is_some());

        drop(handle);
        tokio::time::timeout(Duration::from_secs(3600), task)
            .await
            .expect("driver task should end once every handle is dropped")
            .unwrap();
        assert!(registry.is_empty());
        assert!(registry.get(connection_id).is_none());
        assert_eq!(registry.shutdown_all(), 0);
    }

    #[tokio::test]
    async fn test_dropped_senders_end_driver() {
        let ctx = context(TransportConfig::default(), RecordingLogWriter::default());
        let (sink, _commands) = ChannelSink::channel();
        let controller = ConnectionController::new(
            5,
            ProtocolKind::H1,
            ctx,
            Arc::new(sink),
            Box::new(BodyGrabber::default()),
            Instant::now(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ConnectionEvent::Lifecycle(LifecycleEvent::Active)).unwrap();
        drop(tx);

        let controller = ConnectionDriver::new(controller, rx).run().await;
        assert_eq!(controller.state(), ConnectionState::Closed);
    }
}
