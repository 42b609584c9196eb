//! Contract between the Director and the per-controller device sessions.
//!
//! A device session owns one controller link and knows how to encode commands
//! for it.  The Director only ever talks to sessions through [`DeviceSession`],
//! creates them through a [`SessionFactory`], and learns about their lifecycle
//! through the [`SessionEvents`] sink it hands to the factory.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use tester_core::{BoardVoltages, IoBoard, PinAffinityAndId, SimpleConnectivityDescription, VoltageLevel};

/// Identifier of a device session; also the owner key of its boards.
pub type SessionId = Uuid;

/// Lifecycle of a single device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Link is up, controller not yet described.
    Initializing,
    /// Controller answered its inventory and accepts commands.
    Operating,
    /// A command is in flight that excludes others (a local sweep).
    Measuring,
    /// Link lost; a fatal error follows.
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Answer of a controller to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerResponse {
    Acknowledged,
    NotAcknowledged,
    PerformanceSucceeded,
    PerformanceFailed,
}

/// Errors a session reports for a command it could not complete.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("link to the controller is closed")]
    LinkClosed,

    #[error("controller did not answer within {0} ms")]
    Timeout(u64),

    #[error("command not supported by this session: {0}")]
    Unsupported(&'static str),

    #[error("controller error: {0}")]
    Device(String),
}

/// One controller as seen by the Director.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceSession: Send + Sync {
    fn id(&self) -> SessionId;

    fn state(&self) -> SessionState;

    /// Boards behind this controller, owned by this session's id.
    async fn boards(&self) -> Result<Vec<IoBoard>, SessionError>;

    /// Energizes a pin given in **physical** numbering.
    async fn set_voltage_at_pin(&self, pin: PinAffinityAndId) -> Result<ControllerResponse, SessionError>;

    /// Voltage read-back of every local board, keyed by harness pin id.
    async fn measure_all_voltages(&self) -> Result<Vec<BoardVoltages>, SessionError>;

    async fn disable_output(&self) -> Result<ControllerResponse, SessionError>;

    async fn set_voltage_level(&self, level: VoltageLevel) -> Result<ControllerResponse, SessionError>;

    /// Runs the whole sweep on the controller itself and publishes one result
    /// per probed pin.
    async fn check_connections_for_local_boards(
        &self,
        results: mpsc::Sender<SimpleConnectivityDescription>,
    ) -> Result<(), SessionError>;

    /// Stops every task the session runs.
    fn cancel_all_jobs(&self);
}

// ── Session events ────────────────────────────────────────────────────────────

/// Lifecycle notifications sent from sessions to the Director's supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged {
        session: SessionId,
        previous: SessionState,
        new: SessionState,
    },
    FatalError {
        session: SessionId,
    },
}

/// Event sink handed to a session when it is created.
///
/// `fatal_error` is effective at most once per sink; later calls are ignored.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    session: SessionId,
    tx: mpsc::UnboundedSender<SessionEvent>,
    fatal_reported: Arc<AtomicBool>,
}

impl SessionEvents {
    pub(crate) fn new(session: SessionId, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            session,
            tx,
            fatal_reported: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn state_changed(&self, previous: SessionState, new: SessionState) {
        debug!(session = %self.session, %previous, %new, "session state changed");
        self.send(SessionEvent::StateChanged {
            session: self.session,
            previous,
            new,
        });
    }

    pub fn fatal_error(&self) {
        if self.fatal_reported.swap(true, Ordering::AcqRel) {
            debug!(session = %self.session, "repeated fatal error ignored");
            return;
        }
        error!(session = %self.session, "session reported a fatal error");
        self.send(SessionEvent::FatalError {
            session: self.session,
        });
    }

    fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!(session = %self.session, "director gone, session event dropped");
        }
    }
}

// ── Collaborator seams ────────────────────────────────────────────────────────

/// Builds a session from a freshly admitted link.
#[async_trait]
pub trait SessionFactory<L>: Send + Sync {
    async fn create(
        &self,
        link: L,
        id: SessionId,
        voltage_level: VoltageLevel,
        events: SessionEvents,
    ) -> Result<Arc<dyn DeviceSession>, SessionError>;
}

/// User-facing sink for errors the Director cannot handle itself.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, message: &str);
}

/// Reports errors through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, message: &str) {
        error!("{message}");
    }
}

/// Source of the operator's preferred output level.
pub trait VoltagePreference: Send + Sync {
    fn preferred_level(&self) -> VoltageLevel;
}

impl VoltagePreference for VoltageLevel {
    fn preferred_level(&self) -> VoltageLevel {
        *self
    }
}
