//! Keep-alive tracking for a single connection.
//!
//! The monitor owns four independent dimensions: idle time, ping round-trips,
//! connection age and the number of streams opened. It never touches the
//! transport itself. Timers are deadlines that the connection's driver fires
//! through [`KeepAliveMonitor::poll`]; the monitor answers with the actions
//! the transport has to take and latches the verdict once a limit is hit.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::KeepAliveConfig;
use crate::error::TransportError;
use crate::metrics::TransportMetrics;

/// Kind of inbound frame reported as activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// HEADERS or CONTINUATION.
    Headers,
    /// DATA.
    Data,
    /// PING sent by the peer.
    Ping,
    /// SETTINGS, WINDOW_UPDATE and other connection control frames.
    Control,
}

/// Why the monitor wants the connection gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveVerdict {
    /// No inbound frame within the idle timeout.
    IdleTimeout,
    /// The connection outlived its maximum age.
    MaxAge,
    /// The connection served its maximum number of streams.
    MaxRequests,
    /// A ping was not acknowledged in time.
    PingTimeout,
}

impl KeepAliveVerdict {
    /// Returns true if the connection must be dropped without a drain.
    pub fn is_unhealthy(&self) -> bool {
        matches!(self, KeepAliveVerdict::PingTimeout)
    }

    /// Tag carried in the GOAWAY debug data.
    pub fn debug_tag(&self) -> &'static str {
        match self {
            KeepAliveVerdict::IdleTimeout => "idle-timeout",
            KeepAliveVerdict::MaxAge => "max-age",
            KeepAliveVerdict::MaxRequests => "max-requests",
            KeepAliveVerdict::PingTimeout => "ping-timeout",
        }
    }
}

impl From<KeepAliveVerdict> for TransportError {
    fn from(verdict: KeepAliveVerdict) -> Self {
        match verdict {
            KeepAliveVerdict::PingTimeout => TransportError::KeepAliveUnhealthy {
                payload: 0,
                timeout_ms: 0,
            },
            other => TransportError::KeepAliveTimeout {
                reason: other.debug_tag(),
            },
        }
    }
}

/// Action the transport must perform on behalf of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveAction {
    /// Write a PING frame carrying this payload.
    SendPing(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorState {
    Uninitialized,
    Active,
    Destroyed,
}

#[derive(Debug, Clone, Copy)]
struct OutstandingPing {
    payload: u64,
    sent_at: Instant,
    deadline: Instant,
}

/// Keep-alive statistics for one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeepAliveStats {
    /// Number of streams opened, refused ones included.
    pub request_count: u64,
    /// Number of pings written.
    pub pings_sent: u64,
    /// Number of pings acknowledged.
    pub pings_acked: u64,
    /// Average ping round-trip time, if any ping was acknowledged.
    pub average_rtt: Option<Duration>,
    /// The latched verdict, if any.
    pub verdict: Option<KeepAliveVerdict>,
}

/// Decides when a connection has to be recycled or dropped.
pub struct KeepAliveMonitor {
    config: KeepAliveConfig,
    state: MonitorState,
    initialized_at: Option<Instant>,
    idle_deadline: Option<Instant>,
    age_deadline: Option<Instant>,
    ping_due_at: Option<Instant>,
    outstanding_ping: Option<OutstandingPing>,
    next_payload: u64,
    request_count: u64,
    graceful: Option<KeepAliveVerdict>,
    unhealthy: bool,
    pings_sent: u64,
    pings_acked: u64,
    rtt_sum: Duration,
    metrics: Option<(Arc<TransportMetrics>, &'static str)>,
}

impl std::fmt::Debug for KeepAliveMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveMonitor")
            .field("config", &self.config)
            .field("state", &self.state)
            .field("stats", &self.stats())
            .finish()
    }
}

impl KeepAliveMonitor {
    /// Creates a monitor with the given thresholds.
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config,
            state: MonitorState::Uninitialized,
            initialized_at: None,
            idle_deadline: None,
            age_deadline: None,
            ping_due_at: None,
            outstanding_ping: None,
            next_payload: 1,
            request_count: 0,
            graceful: None,
            unhealthy: false,
            pings_sent: 0,
            pings_acked: 0,
            rtt_sum: Duration::ZERO,
            metrics: None,
        }
    }

    /// Reports pings and the connection lifespan to `metrics`, labelled with `protocol`.
    pub fn with_metrics(mut self, metrics: Arc<TransportMetrics>, protocol: &'static str) -> Self {
        self.metrics = Some((metrics, protocol));
        self
    }

    /// Returns true if every dimension is disabled.
    pub fn is_noop(&self) -> bool {
        !self.config.is_enabled()
    }

    /// Returns true between the first `initialize` and `destroy`.
    pub fn is_active(&self) -> bool {
        self.state == MonitorState::Active
    }

    /// Arms the configured timers.
    ///
    /// Only the first call on an uninitialized monitor has an effect. Returns
    /// true if this call armed the timers.
    pub fn initialize(&mut self, now: Instant) -> bool {
        if self.state != MonitorState::Uninitialized || self.is_noop() {
            return false;
        }

        self.state = MonitorState::Active;
        self.initialized_at = Some(now);
        self.idle_deadline = self.config.idle_timeout().map(|d| now + d);
        self.age_deadline = self.config.max_connection_age().map(|d| now + d);
        self.ping_due_at = self.config.ping_interval().map(|d| now + d);

        debug!(
            idle_timeout_ms = self.config.idle_timeout_millis,
            ping_interval_ms = self.config.ping_interval_millis,
            max_age_ms = self.config.max_connection_age_millis,
            max_requests = self.config.max_num_requests_per_connection,
            "keep-alive monitor initialized"
        );
        true
    }

    /// Records an inbound frame.
    pub fn on_activity(&mut self, now: Instant, kind: FrameKind) {
        if self.state != MonitorState::Active || self.verdict_latched() {
            return;
        }
        if kind == FrameKind::Ping && !self.config.keep_alive_on_ping {
            return;
        }

        if let Some(timeout) = self.config.idle_timeout() {
            self.idle_deadline = Some(now + timeout);
        }
        if self.outstanding_ping.is_none() {
            if let Some(interval) = self.config.ping_interval() {
                self.ping_due_at = Some(now + interval);
            }
        }
    }

    /// Counts a new stream.
    ///
    /// Returns false if the stream exceeds the per-connection request limit
    /// and must be refused.
    pub fn on_stream_opened(&mut self) -> bool {
        self.request_count += 1;
        let Some(max) = self.config.max_requests() else {
            return true;
        };

        if self.request_count >= max && self.graceful.is_none() {
            info!(request_count = self.request_count, max, "connection reached its request limit");
            self.graceful = Some(KeepAliveVerdict::MaxRequests);
        }
        self.request_count <= max
    }

    /// Records a PING acknowledgement. Returns true if it matched the outstanding ping.
    pub fn on_ping_ack(&mut self, payload: u64, now: Instant) -> bool {
        match self.outstanding_ping {
            Some(ping) if ping.payload == payload && !self.unhealthy => {
                self.outstanding_ping = None;
                self.pings_acked += 1;
                self.rtt_sum += now.saturating_duration_since(ping.sent_at);
                self.ping_due_at = self.config.ping_interval().map(|d| now + d);
                true
            }
            _ => {
                debug!(payload, "ignoring unexpected ping ack");
                false
            }
        }
    }

    /// Fires every timer that is due at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<KeepAliveAction> {
        if self.state != MonitorState::Active {
            return None;
        }
        self.expire(now);
        if self.unhealthy || self.outstanding_ping.is_some() {
            return None;
        }

        let due = self.ping_due_at.filter(|at| *at <= now)?;
        let timeout = self.config.ping_timeout()?;
        let payload = self.next_payload;
        self.next_payload = self.next_payload.wrapping_add(1);
        self.ping_due_at = None;
        self.outstanding_ping = Some(OutstandingPing {
            payload,
            sent_at: now,
            deadline: now + timeout,
        });
        self.pings_sent += 1;
        if let Some((metrics, _)) = &self.metrics {
            metrics.inc_pings_sent();
        }
        debug!(payload, late_by_us = now.saturating_duration_since(due).as_micros() as u64, "sending keep-alive ping");
        Some(KeepAliveAction::SendPing(payload))
    }

    /// Returns the latched verdict, firing any deadline that passed.
    ///
    /// A ping timeout takes precedence over the graceful limits.
    pub fn verdict(&mut self, now: Instant) -> Option<KeepAliveVerdict> {
        if self.state == MonitorState::Destroyed {
            return None;
        }
        if self.state == MonitorState::Active {
            self.expire(now);
        }
        if self.unhealthy {
            Some(KeepAliveVerdict::PingTimeout)
        } else {
            self.graceful
        }
    }

    /// Returns true if the connection should be closed.
    pub fn needs_disconnection(&mut self, now: Instant) -> bool {
        self.verdict(now).is_some()
    }

    /// Returns true if an unacknowledged ping marked the connection unhealthy.
    pub fn is_unhealthy(&mut self, now: Instant) -> bool {
        self.verdict(now).is_some_and(|v| v.is_unhealthy())
    }

    /// Returns the earliest armed timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != MonitorState::Active {
            return None;
        }
        [
            self.idle_deadline,
            self.age_deadline,
            self.ping_due_at.filter(|_| self.outstanding_ping.is_none() && !self.unhealthy),
            self.outstanding_ping.filter(|_| !self.unhealthy).map(|p| p.deadline),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Cancels every timer. Safe to call any number of times.
    ///
    /// Returns true if this call tore down an initialized monitor.
    pub fn destroy(&mut self, now: Instant) -> bool {
        let was_active = self.state == MonitorState::Active;
        self.state = MonitorState::Destroyed;
        self.idle_deadline = None;
        self.age_deadline = None;
        self.ping_due_at = None;
        self.outstanding_ping = None;

        if was_active {
            if let (Some(start), Some((metrics, protocol))) = (self.initialized_at, &self.metrics) {
                metrics.observe_lifespan(protocol, now.saturating_duration_since(start));
            }
            debug!(request_count = self.request_count, "keep-alive monitor destroyed");
        }
        was_active
    }

    /// Returns the number of streams opened so far.
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Returns a snapshot of the monitor's statistics.
    pub fn stats(&self) -> KeepAliveStats {
        let average_rtt = (self.pings_acked > 0).then(|| self.rtt_sum / self.pings_acked as u32);
        KeepAliveStats {
            request_count: self.request_count,
            pings_sent: self.pings_sent,
            pings_acked: self.pings_acked,
            average_rtt,
            verdict: if self.unhealthy {
                Some(KeepAliveVerdict::PingTimeout)
            } else {
                self.graceful
            },
        }
    }

    fn verdict_latched(&self) -> bool {
        self.unhealthy || self.graceful.is_some()
    }

    fn expire(&mut self, now: Instant) {
        if self.idle_deadline.is_some_and(|at| at <= now) {
            self.idle_deadline = None;
            self.latch_graceful(KeepAliveVerdict::IdleTimeout);
        }
        if self.age_deadline.is_some_and(|at| at <= now) {
            self.age_deadline = None;
            self.latch_graceful(KeepAliveVerdict::MaxAge);
        }
        if let Some(ping) = self.outstanding_ping {
            if ping.deadline <= now && !self.unhealthy {
                self.unhealthy = true;
                if let Some((metrics, _)) = &self.metrics {
                    metrics.inc_ping_timeouts();
                }
                warn!(payload = ping.payload, "keep-alive ping not acknowledged, connection unhealthy");
            }
        }
    }

    fn latch_graceful(&mut self, verdict: KeepAliveVerdict) {
        if self.graceful.is_none() {
            info!(reason = verdict.debug_tag(), "keep-alive limit reached");
            self.graceful = Some(verdict);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn idle_only(idle_ms: u64) -> KeepAliveConfig {
        KeepAliveConfig {
            idle_timeout_millis: idle_ms,
            ..KeepAliveConfig::disabled()
        }
    }

    fn ping_only(interval_ms: u64) -> KeepAliveConfig {
        KeepAliveConfig {
            ping_interval_millis: interval_ms,
            ..KeepAliveConfig::disabled()
        }
    }

    #[test]
    fn test_noop_monitor_never_disconnects() {
        let mut monitor = KeepAliveMonitor::new(KeepAliveConfig::disabled());
        let t0 = Instant::now();
        assert!(monitor.is_noop());
        assert!(!monitor.initialize(t0));
        for _ in 0..1000 {
            assert!(monitor.on_stream_opened());
        }
        assert!(!monitor.needs_disconnection(t0 + Duration::from_secs(86_400)));
        assert_eq!(monitor.poll(t0 + Duration::from_secs(86_400)), None);
        assert_eq!(monitor.next_deadline(), None);
    }

    #[test]
    fn test_initialize_idempotent() {
        let mut monitor = KeepAliveMonitor::new(idle_only(1000));
        let t0 = Instant::now();
        assert!(monitor.initialize(t0));
        assert!(!monitor.initialize(t0 + ms(500)));
        assert_eq!(monitor.next_deadline(), Some(t0 + ms(1000)));
    }

    #[test]
    fn test_idle_deadline_latches() {
        let mut monitor = KeepAliveMonitor::new(idle_only(5000));
        let t0 = Instant::now();
        monitor.initialize(t0);

        assert!(!monitor.needs_disconnection(t0 + ms(4999)));
        assert_eq!(monitor.verdict(t0 + ms(5000)), Some(KeepAliveVerdict::IdleTimeout));

        monitor.on_activity(t0 + ms(5001), FrameKind::Data);
        assert!(monitor.needs_disconnection(t0 + ms(5002)));
        assert!(!monitor.is_unhealthy(t0 + ms(5002)));
    }

    #[test]
    fn test_activity_resets_idle_deadline() {
        let mut monitor = KeepAliveMonitor::new(idle_only(1000));
        let t0 = Instant::now();
        monitor.initialize(t0);
        monitor.on_activity(t0 + ms(800), FrameKind::Headers);
        assert!(!monitor.needs_disconnection(t0 + ms(1500)));
        assert!(monitor.needs_disconnection(t0 + ms(1800)));
    }

    #[test]
    fn test_ping_frame_counts_only_with_keep_alive_on_ping() {
        let t0 = Instant::now();

        let mut monitor = KeepAliveMonitor::new(idle_only(1000));
        monitor.initialize(t0);
        monitor.on_activity(t0 + ms(900), FrameKind::Ping);
        assert!(monitor.needs_disconnection(t0 + ms(1000)));

        let mut monitor = KeepAliveMonitor::new(KeepAliveConfig {
            keep_alive_on_ping: true,
            ..idle_only(1000)
        });
        monitor.initialize(t0);
        monitor.on_activity(t0 + ms(900), FrameKind::Ping);
        assert!(!monitor.needs_disconnection(t0 + ms(1000)));
    }

    #[test]
    fn test_max_age() {
        let mut monitor = KeepAliveMonitor::new(KeepAliveConfig {
            max_connection_age_millis: 2000,
            ..KeepAliveConfig::disabled()
        });
        let t0 = Instant::now();
        monitor.initialize(t0);
        monitor.on_activity(t0 + ms(1999), FrameKind::Data);
        assert_eq!(monitor.verdict(t0 + ms(2000)), Some(KeepAliveVerdict::MaxAge));
    }

    #[test]
    fn test_request_limit() {
        let mut monitor = KeepAliveMonitor::new(KeepAliveConfig {
            max_num_requests_per_connection: 3,
            ..KeepAliveConfig::disabled()
        });
        let t0 = Instant::now();
        monitor.initialize(t0);

        assert!(monitor.on_stream_opened());
        assert!(monitor.on_stream_opened());
        assert!(!monitor.needs_disconnection(t0));
        assert!(monitor.on_stream_opened());
        assert_eq!(monitor.verdict(t0), Some(KeepAliveVerdict::MaxRequests));
        assert!(!monitor.on_stream_opened());
        assert_eq!(monitor.request_count(), 4);
    }

    #[test]
    fn test_ping_sent_and_acked() {
        let mut monitor = KeepAliveMonitor::new(ping_only(1000));
        let t0 = Instant::now();
        monitor.initialize(t0);

        assert_eq!(monitor.poll(t0 + ms(999)), None);
        let Some(KeepAliveAction::SendPing(payload)) = monitor.poll(t0 + ms(1000)) else {
            panic!("expected a ping");
        };
        assert_eq!(monitor.poll(t0 + ms(1100)), None);
        assert_eq!(monitor.next_deadline(), Some(t0 + ms(2000)));

        assert!(monitor.on_ping_ack(payload, t0 + ms(1200)));
        assert!(!monitor.needs_disconnection(t0 + ms(2100)));
        assert_eq!(monitor.next_deadline(), Some(t0 + ms(2200)));

        let stats = monitor.stats();
        assert_eq!(stats.pings_sent, 1);
        assert_eq!(stats.pings_acked, 1);
        assert_eq!(stats.average_rtt, Some(ms(200)));
    }

    #[test]
    fn test_unacked_ping_is_unhealthy() {
        let mut monitor = KeepAliveMonitor::new(KeepAliveConfig {
            ping_timeout_millis: 300,
            ..ping_only(1000)
        });
        let t0 = Instant::now();
        monitor.initialize(t0);

        let Some(KeepAliveAction::SendPing(payload)) = monitor.poll(t0 + ms(1000)) else {
            panic!("expected a ping");
        };
        assert!(!monitor.is_unhealthy(t0 + ms(1299)));
        assert!(monitor.is_unhealthy(t0 + ms(1300)));
        assert_eq!(monitor.verdict(t0 + ms(1300)), Some(KeepAliveVerdict::PingTimeout));

        assert!(!monitor.on_ping_ack(payload, t0 + ms(1400)));
        assert!(monitor.is_unhealthy(t0 + ms(1400)));
        assert_eq!(monitor.poll(t0 + ms(5000)), None);
    }

    #[test]
    fn test_unhealthy_overrides_graceful() {
        let mut monitor = KeepAliveMonitor::new(KeepAliveConfig {
            idle_timeout_millis: 1500,
            ..ping_only(1000)
        });
        let t0 = Instant::now();
        monitor.initialize(t0);
        monitor.poll(t0 + ms(1000));
        assert_eq!(monitor.verdict(t0 + ms(1600)), Some(KeepAliveVerdict::IdleTimeout));
        assert_eq!(monitor.verdict(t0 + ms(2000)), Some(KeepAliveVerdict::PingTimeout));
    }

    #[test]
    fn test_unknown_ack_ignored() {
        let mut monitor = KeepAliveMonitor::new(ping_only(1000));
        let t0 = Instant::now();
        monitor.initialize(t0);
        monitor.poll(t0 + ms(1000));
        assert!(!monitor.on_ping_ack(0xdead, t0 + ms(1001)));
        assert_eq!(monitor.stats().pings_acked, 0);
    }

    #[test]
    fn test_destroy_idempotent_and_clears_timers() {
        let mut monitor = KeepAliveMonitor::new(idle_only(1000));
        let t0 = Instant::now();
        monitor.initialize(t0);

        assert!(monitor.destroy(t0 + ms(10)));
        assert!(!monitor.destroy(t0 + ms(20)));
        assert_eq!(monitor.next_deadline(), None);
        assert!(!monitor.needs_disconnection(t0 + ms(5000)));
        assert!(!monitor.initialize(t0 + ms(30)));
    }

    #[test]
    fn test_destroy_before_initialize() {
        let mut monitor = KeepAliveMonitor::new(idle_only(1000));
        let t0 = Instant::now();
        assert!(!monitor.destroy(t0));
        assert!(!monitor.initialize(t0));
        assert!(!monitor.is_active());
    }

    #[test]
    fn test_lifespan_recorded_once() {
        let metrics = Arc::new(TransportMetrics::new().unwrap());
        let mut monitor =
            KeepAliveMonitor::new(idle_only(1000)).with_metrics(Arc::clone(&metrics), "h2");
        let t0 = Instant::now();
        monitor.initialize(t0);
        monitor.destroy(t0 + ms(100));
        monitor.destroy(t0 + ms(200));
        assert_eq!(metrics.lifespan_samples("h2"), 1);
    }

    #[test]
    fn test_verdict_tags() {
        assert_eq!(KeepAliveVerdict::MaxAge.debug_tag(), "max-age");
        assert!(KeepAliveVerdict::PingTimeout.is_unhealthy());
        assert!(!KeepAliveVerdict::IdleTimeout.is_unhealthy());
        assert!(matches!(
            TransportError::from(KeepAliveVerdict::MaxRequests),
            TransportError::KeepAliveTimeout { reason: "max-requests" }
        ));
    }
}
