//! Graceful connection drain.
//!
//! A drain announces the shutdown while in-flight streams keep running, waits
//! for the drain duration, then finalizes. The coordinator only sequences the
//! phases; the announce and finalize actions come from a [`DrainHooks`]
//! implementation supplied by the connection.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::keepalive::KeepAliveVerdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Phase of the drain. Transitions only move forward.
pub enum DrainPhase {
    /// No drain requested.
    Idle,
    /// The shutdown is being announced.
    DrainStart,
    /// Waiting for in-flight streams before finalizing.
    DrainWait,
    /// The final shutdown signal was sent.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why a connection is being shut down.
pub enum ShutdownReason {
    /// No inbound frames within the idle timeout.
    IdleTimeout,
    /// The connection reached its maximum age.
    MaxConnectionAge,
    /// The connection served its maximum number of streams.
    MaxRequests,
    /// A keep-alive ping went unacknowledged.
    PingTimeout,
    /// The peer sent a GOAWAY.
    PeerGoAway,
    /// The server is shutting down every connection.
    ServerShutdown,
    /// The application asked for the connection to go away.
    AppRequested,
}

impl ShutdownReason {
    /// Tag carried in the GOAWAY debug data.
    pub fn debug_tag(&self) -> &'static str {
        match self {
            ShutdownReason::IdleTimeout => "idle-timeout",
            ShutdownReason::MaxConnectionAge => "max-age",
            ShutdownReason::MaxRequests => "max-requests",
            ShutdownReason::PingTimeout => "ping-timeout",
            ShutdownReason::PeerGoAway => "peer-go-away",
            ShutdownReason::ServerShutdown => "server-shutdown",
            ShutdownReason::AppRequested => "app-requested",
        }
    }

    /// Returns true if the transport itself requires the shutdown.
    pub fn is_protocol_required(&self) -> bool {
        !matches!(self, ShutdownReason::AppRequested)
    }
}

impl From<KeepAliveVerdict> for ShutdownReason {
    fn from(verdict: KeepAliveVerdict) -> Self {
        match verdict {
            KeepAliveVerdict::IdleTimeout => ShutdownReason::IdleTimeout,
            KeepAliveVerdict::MaxAge => ShutdownReason::MaxConnectionAge,
            KeepAliveVerdict::MaxRequests => ShutdownReason::MaxRequests,
            KeepAliveVerdict::PingTimeout => ShutdownReason::PingTimeout,
        }
    }
}

/// Actions run at the edges of a drain.
pub trait DrainHooks {
    /// Announce the shutdown. New streams may still complete.
    fn on_drain_start(&mut self, reason: ShutdownReason);
    /// Send the final shutdown signal and close the transport.
    fn on_drain_end(&mut self, reason: ShutdownReason);
}

/// Sequences the drain of one connection.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    phase: DrainPhase,
    reason: Option<ShutdownReason>,
    started_at: Option<Instant>,
    deadline: Option<Instant>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    /// Creates an idle coordinator.
    pub fn new() -> Self {
        Self {
            phase: DrainPhase::Idle,
            reason: None,
            started_at: None,
            deadline: None,
        }
    }

    /// Starts the drain.
    ///
    /// Only the first call announces and schedules the drain end; a zero
    /// `drain` finalizes before returning. Later calls return
    /// [`TransportError::ShutdownRace`] and keep the first deadline, although a
    /// protocol-required reason replaces an application-requested one.
    pub fn start<H: DrainHooks + ?Sized>(
        &mut self,
        reason: ShutdownReason,
        drain: Duration,
        now: Instant,
        hooks: &mut H,
    ) -> Result<()> {
        if self.phase != DrainPhase::Idle {
            let current = self.reason.unwrap_or(reason);
            if self.phase != DrainPhase::Closed
                && current == ShutdownReason::AppRequested
                && reason.is_protocol_required()
            {
                debug!(
                    from = current.debug_tag(),
                    to = reason.debug_tag(),
                    "protocol shutdown reason supersedes application request"
                );
                self.reason = Some(reason);
            }
            return Err(TransportError::ShutdownRace {
                reason: current.debug_tag(),
            });
        }

        info!(
            reason = reason.debug_tag(),
            drain_us = drain.as_micros() as u64,
            "starting connection drain"
        );
        self.phase = DrainPhase::DrainStart;
        self.reason = Some(reason);
        self.started_at = Some(now);
        hooks.on_drain_start(reason);

        if drain.is_zero() {
            self.finish(now, hooks);
        } else {
            self.phase = DrainPhase::DrainWait;
            self.deadline = Some(now + drain);
        }
        Ok(())
    }

    /// Finalizes right away, skipping any remaining wait.
    ///
    /// From [`DrainPhase::Idle`] this closes without an announce phase.
    /// Returns false if the drain was already closed.
    pub fn force_immediate<H: DrainHooks + ?Sized>(
        &mut self,
        reason: ShutdownReason,
        now: Instant,
        hooks: &mut H,
    ) -> bool {
        if self.phase == DrainPhase::Closed {
            return false;
        }
        let reason = *self.reason.get_or_insert(reason);
        warn!(reason = reason.debug_tag(), phase = ?self.phase, "forcing connection close");
        self.finish(now, hooks);
        true
    }

    /// Drops the pending drain end. Returns true if one was pending.
    pub fn cancel(&mut self) -> bool {
        let pending = self.deadline.take().is_some();
        if pending {
            debug!(phase = ?self.phase, "drain end cancelled");
        }
        pending
    }

    /// Runs the drain end if its deadline passed. Returns true if it ran.
    pub fn poll<H: DrainHooks + ?Sized>(&mut self, now: Instant, hooks: &mut H) -> bool {
        match self.deadline {
            Some(deadline) if self.phase == DrainPhase::DrainWait && deadline <= now => {
                self.finish(now, hooks);
                true
            }
            _ => false,
        }
    }

    /// Returns the pending drain end deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the current phase.
    pub fn phase(&self) -> DrainPhase {
        self.phase
    }

    /// Returns the recorded reason, if a drain started.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason
    }

    /// Returns true while the drain is announced but not finalized.
    pub fn is_draining(&self) -> bool {
        matches!(self.phase, DrainPhase::DrainStart | DrainPhase::DrainWait)
    }

    /// Returns true once the final signal went out.
    pub fn is_closed(&self) -> bool {
        self.phase == DrainPhase::Closed
    }

    fn finish<H: DrainHooks + ?Sized>(&mut self, now: Instant, hooks: &mut H) {
        self.phase = DrainPhase::Closed;
        self.deadline = None;
        let reason = self.reason.unwrap_or(ShutdownReason::ServerShutdown);
        let elapsed = self
            .started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default();
        info!(
            reason = reason.debug_tag(),
            elapsed_us = elapsed.as_micros() as u64,
            "connection drain finished"
        );
        hooks.on_drain_end(reason);
    }
}
