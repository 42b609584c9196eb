//! Monitor session: a read-only [`DeviceSession`] over a [`DeviceLink`].
//!
//! It decodes every inbound frame, keeps the controller's board inventory from
//! `HW` and `INTERNALS` frames, and stores every reported connection snapshot
//! on its pin, logging the pins whose connectivity changed.  It issues no
//! commands, so every command method answers [`SessionError::Unsupported`].
//! This is what the binary attaches to each admitted link to bring a bench up
//! and watch its traffic.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tester_core::protocol::{ConnectionsDescription, HardwareDescription, InternalParameters};
use tester_core::{
    BoardRegistry, BoardVoltages, FrameBuffer, IoBoard, PinAffinityAndId, ResponseInterpreter,
    SimpleConnectivityDescription, VoltageLevel,
};

use crate::application::session::{
    ControllerResponse, DeviceSession, SessionError, SessionEvents, SessionFactory, SessionId,
    SessionState,
};
use crate::infrastructure::network::link::DeviceLink;

/// Builds a [`MonitorSession`] for every admitted link.
#[derive(Debug, Clone, Copy)]
pub struct MonitorSessionFactory {
    max_detectable_resistance: f32,
}

impl MonitorSessionFactory {
    /// `max_detectable_resistance` is the ceiling (ohms) above which a
    /// connection that appears or disappears is not reported as a change.
    pub fn new(max_detectable_resistance: f32) -> Self {
        Self {
            max_detectable_resistance,
        }
    }
}

#[async_trait]
impl SessionFactory<DeviceLink> for MonitorSessionFactory {
    async fn create(
        &self,
        link: DeviceLink,
        id: SessionId,
        voltage_level: VoltageLevel,
        events: SessionEvents,
    ) -> Result<Arc<dyn DeviceSession>, SessionError> {
        if link.is_closed() {
            return Err(SessionError::LinkClosed);
        }
        Ok(Arc::new(MonitorSession::spawn(
            link,
            id,
            voltage_level,
            self.max_detectable_resistance,
            events,
        )))
    }
}

/// State shared between the session handle and its reader task.
#[derive(Debug)]
struct Shared {
    id: SessionId,
    voltage_level: VoltageLevel,
    max_detectable_resistance: f32,
    state: Mutex<SessionState>,
    registry: Mutex<BoardRegistry>,
    events: SessionEvents,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, new: SessionState) {
        let previous = std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            new,
        );
        if previous != new {
            self.events.state_changed(previous, new);
        }
    }

    fn apply_hardware(&self, hardware: HardwareDescription) {
        {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            for address in hardware.boards_online {
                if registry.get(address).is_some() {
                    continue;
                }
                match IoBoard::new(address, self.id) {
                    Ok(board) => {
                        registry.insert(board);
                    }
                    Err(e) => warn!(session = %self.id, "ignoring board: {e}"),
                }
            }
            info!(session = %self.id, boards = registry.len(), "controller described its hardware");
        }

        if self.state() == SessionState::Initializing {
            self.transition(SessionState::Operating);
        }
    }

    fn apply_internals(&self, internals: InternalParameters) {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        match registry.get_mut(internals.board_address) {
            Some(board) => board.set_internal_parameters(internals.parameters, self.voltage_level),
            None => debug!(
                session = %self.id,
                board = internals.board_address,
                "internal parameters for unknown board ignored"
            ),
        }
    }

    /// Stores the reported snapshot on its pin.  Returns whether it differs
    /// from the previous one below the resistance ceiling.
    fn apply_connections(&self, description: ConnectionsDescription) -> bool {
        let ConnectionsDescription { pin, connections } = description;
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(target) = registry
            .get_mut(pin.board_address())
            .and_then(|board| board.pin_mut(&pin))
        else {
            debug!(session = %self.id, %pin, "connections for unknown pin ignored");
            return false;
        };

        let changed = target.connections_differ(&connections, self.max_detectable_resistance);
        let count = connections.len();
        target.set_connections(connections);
        if changed {
            info!(session = %self.id, %pin, connections = count, "pin connectivity changed");
        } else {
            debug!(session = %self.id, %pin, connections = count, "pin connectivity unchanged");
        }
        changed
    }
}

/// Read-only session over one device link.
#[derive(Debug)]
pub struct MonitorSession {
    shared: Arc<Shared>,
    token: CancellationToken,
}

impl MonitorSession {
    /// Starts the reader task for `link`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        link: DeviceLink,
        id: SessionId,
        voltage_level: VoltageLevel,
        max_detectable_resistance: f32,
        events: SessionEvents,
    ) -> Self {
        let shared = Arc::new(Shared {
            id,
            voltage_level,
            max_detectable_resistance,
            state: Mutex::new(SessionState::Initializing),
            registry: Mutex::new(BoardRegistry::new()),
            events,
        });
        let token = link.token();
        tokio::spawn(run_reader(link, Arc::clone(&shared)));
        Self { shared, token }
    }
}

async fn run_reader(mut link: DeviceLink, shared: Arc<Shared>) {
    let interpreter = ResponseInterpreter::new()
        .on_hardware_description({
            let shared = Arc::clone(&shared);
            move |hardware| shared.apply_hardware(hardware)
        })
        .on_internal_parameters({
            let shared = Arc::clone(&shared);
            move |internals| shared.apply_internals(internals)
        })
        .on_connections_description({
            let shared = Arc::clone(&shared);
            move |description| {
                shared.apply_connections(description);
            }
        });
    let mut buffer = FrameBuffer::new();

    while let Some(bytes) = link.recv().await {
        interpreter.feed(&mut buffer, &bytes);
    }

    warn!(session = %shared.id, "controller link lost");
    shared.transition(SessionState::Disconnected);
    shared.events.fatal_error();
}

#[async_trait]
impl DeviceSession for MonitorSession {
    fn id(&self) -> SessionId {
        self.shared.id
    }

    fn state(&self) -> SessionState {
        self.shared.state()
    }

    async fn boards(&self) -> Result<Vec<IoBoard>, SessionError> {
        if self.token.is_cancelled() {
            return Err(SessionError::LinkClosed);
        }
        let registry = self.shared.registry.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(registry.boards().cloned().collect())
    }

    async fn set_voltage_at_pin(&self, _pin: PinAffinityAndId) -> Result<ControllerResponse, SessionError> {
        Err(SessionError::Unsupported("set_voltage_at_pin"))
    }

    async fn measure_all_voltages(&self) -> Result<Vec<BoardVoltages>, SessionError> {
        Err(SessionError::Unsupported("measure_all_voltages"))
    }

    async fn disable_output(&self) -> Result<ControllerResponse, SessionError> {
        Err(SessionError::Unsupported("disable_output"))
    }

    async fn set_voltage_level(&self, _level: VoltageLevel) -> Result<ControllerResponse, SessionError> {
        Err(SessionError::Unsupported("set_voltage_level"))
    }

    async fn check_connections_for_local_boards(
        &self,
        _results: mpsc::Sender<SimpleConnectivityDescription>,
    ) -> Result<(), SessionError> {
        Err(SessionError::Unsupported("check_connections_for_local_boards"))
    }

    fn cancel_all_jobs(&self) {
        self.token.cancel();
    }
}
