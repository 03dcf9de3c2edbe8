//! Inbound traffic control for request bodies.
//!
//! Counts bytes that were read from the transport but not yet consumed by a
//! handler. Crossing the high water mark asks the transport to stop reading;
//! falling back to the low water mark lets it read again. Signals are
//! level-triggered: a suspend is only ever followed by a resume and vice versa.
//!
//! The controller is shared between the connection context, which reports
//! arriving bytes, and body consumers, which report drained bytes. The byte
//! count is atomic; suspend and resume transitions are serialized by a lock
//! so the transport sees them in the order they were decided.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::config::TrafficConfig;

/// Transport hook that starts and stops automatic reads.
pub trait ReadControl: Send + Sync {
    /// Stop reading from the socket.
    fn suspend_reads(&self);
    /// Resume reading from the socket.
    fn resume_reads(&self);
}

/// Signal issued when a water mark is crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficSignal {
    /// Unread bytes reached the high water mark.
    Suspend,
    /// Unread bytes fell to the low water mark.
    Resume,
}

/// Counters describing past backpressure activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrafficStats {
    /// Bytes currently buffered and unread.
    pub unread_bytes: u64,
    /// Whether reads are currently suspended.
    pub suspended: bool,
    /// Number of suspend signals issued.
    pub suspend_count: u64,
    /// Number of resume signals issued.
    pub resume_count: u64,
}

/// Byte-budget backpressure gate.
pub struct TrafficController {
    config: TrafficConfig,
    unread: AtomicU64,
    suspended: AtomicBool,
    gate: Mutex<()>,
    suspend_count: AtomicU64,
    resume_count: AtomicU64,
    control: Option<Arc<dyn ReadControl>>,
}

impl fmt::Debug for TrafficController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrafficController")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TrafficController {
    /// Creates a controller that only reports signals through return values.
    pub fn new(config: TrafficConfig) -> Self {
        Self {
            config,
            unread: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
            gate: Mutex::new(()),
            suspend_count: AtomicU64::new(0),
            resume_count: AtomicU64::new(0),
            control: None,
        }
    }

    /// Creates a controller that also drives `control` on every signal.
    pub fn with_read_control(config: TrafficConfig, control: Arc<dyn ReadControl>) -> Self {
        Self {
            control: Some(control),
            ..Self::new(config)
        }
    }

    /// A controller that never suspends reads.
    pub fn disabled() -> Self {
        Self::new(TrafficConfig {
            high_water_mark: 0,
            low_water_mark: 0,
        })
    }

    /// Records `len` bytes read from the transport.
    pub fn on_data(&self, len: u64) -> Option<TrafficSignal> {
        self.unread.fetch_add(len, Ordering::AcqRel);
        if self.config.high_water_mark == 0 {
            return None;
        }
        self.settle()
    }

    /// Records `len` bytes drained by a consumer.
    pub fn on_consumed(&self, len: u64) -> Option<TrafficSignal> {
        let _ = self
            .unread
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(len))
            });
        if self.config.high_water_mark == 0 {
            return None;
        }
        self.settle()
    }

    /// Brings the suspended flag in line with the current unread count.
    ///
    /// Runs after every counter update. The count is re-read under the gate
    /// lock, so the last caller to settle always sees the final count and no
    /// suspend can outlive the bytes that caused it. `ReadControl` is invoked
    /// under the same lock and must not call back into the controller.
    fn settle(&self) -> Option<TrafficSignal> {
        let _gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let unread = self.unread.load(Ordering::Acquire);
        let suspended = self.suspended.load(Ordering::Acquire);

        if !suspended && unread >= self.config.high_water_mark {
            self.suspended.store(true, Ordering::Release);
            self.suspend_count.fetch_add(1, Ordering::Relaxed);
            debug!(unread, high_water_mark = self.config.high_water_mark, "suspending inbound reads");
            if let Some(control) = &self.control {
                control.suspend_reads();
            }
            Some(TrafficSignal::Suspend)
        } else if suspended && unread <= self.config.low_water_mark {
            self.suspended.store(false, Ordering::Release);
            self.resume_count.fetch_add(1, Ordering::Relaxed);
            debug!(unread, low_water_mark = self.config.low_water_mark, "resuming inbound reads");
            if let Some(control) = &self.control {
                control.resume_reads();
            }
            Some(TrafficSignal::Resume)
        } else {
            None
        }
    }

    /// Returns the number of buffered, unread bytes.
    pub fn unread_bytes(&self) -> u64 {
        self.unread.load(Ordering::Acquire)
    }

    /// Returns true while reads are suspended.
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &TrafficConfig {
        &self.config
    }

    /// Returns a snapshot of the controller's counters.
    pub fn stats(&self) -> TrafficStats {
        TrafficStats {
            unread_bytes: self.unread_bytes(),
            suspended: self.is_suspended(),
            suspend_count: self.suspend_count.load(Ordering::Relaxed),
            resume_count: self.resume_count.load(Ordering::Relaxed),
        }
    }
}
