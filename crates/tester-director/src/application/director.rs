//! Director: supervises controller sessions and fans out bench operations.
//!
//! # Responsibilities
//!
//! - Turns every admitted link into a [`DeviceSession`] through the
//!   [`SessionFactory`] and keeps the set of active sessions.
//! - Owns the bench readiness state machine ([`DirectorState`]).
//! - Rediscovers the board inventory, debounced, whenever a session enters or
//!   leaves [`SessionState::Operating`], and publishes it on the boards channel.
//! - Fans connectivity checks and voltage-level changes out across sessions.
//! - Removes sessions that report a fatal error.
//!
//! # Tasks (for beginners)
//!
//! ```text
//! Director::start()
//!  ├─ supervisor     -- receives links and session events, mutates the session set
//!  ├─ state writer   -- the only task that writes the watched DirectorState
//!  └─ rediscovery    -- one pending timer; re-arming aborts the previous one
//! ```
//!
//! Every task runs under the [`CancellationToken`] passed to
//! [`Director::start`]; cancelling it (or calling [`Director::shutdown`]) stops
//! them all.  The session set is a copy-on-write snapshot: readers clone an
//! `Arc` and iterate without holding a lock.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tester_core::{
    BoardAddress, BoardRegistry, IoBoard, Pin, PinAffinityAndId, SimpleConnectivityDescription,
    VoltageLevel,
};

use crate::application::session::{
    ControllerResponse, DeviceSession, ErrorReporter, SessionError, SessionEvent, SessionEvents,
    SessionFactory, SessionId, SessionState, VoltagePreference,
};

/// Quiet period after the last session change before the inventory is rebuilt.
pub const DEFAULT_REDISCOVERY_DELAY: Duration = Duration::from_millis(3000);

/// Capacity of the outbound boards channel.
pub const DEFAULT_BOARDS_CHANNEL_CAPACITY: usize = 16;

/// Readiness of the whole bench.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectorState {
    InitializingDirector,
    SearchingForControllers,
    RecoveryFromFailure,
    UpdatingBoards,
    NoBoardsAvailable,
    Operating,
}

impl fmt::Display for DirectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tuning knobs of the Director.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorConfig {
    pub rediscovery_delay: Duration,
    pub boards_channel_capacity: usize,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            rediscovery_delay: DEFAULT_REDISCOVERY_DELAY,
            boards_channel_capacity: DEFAULT_BOARDS_CHANNEL_CAPACITY,
        }
    }
}

/// Errors returned by Director operations.
#[derive(Debug, Error)]
pub enum DirectorError {
    #[error("no controllers to operate with")]
    NoControllers,

    #[error("no controller owns board {0}")]
    UnknownBoard(BoardAddress),

    #[error("controller {session} answered {response:?} to {command}")]
    CommandRejected {
        session: SessionId,
        command: &'static str,
        response: ControllerResponse,
    },

    #[error("controller {session} failed {command}: {source}")]
    Session {
        session: SessionId,
        command: &'static str,
        #[source]
        source: SessionError,
    },

    #[error("connection results receiver is closed")]
    ResultsClosed,

    #[error("{failed} of {total} controllers did not apply voltage level {level}")]
    VoltageLevelNotApplied {
        level: VoltageLevel,
        failed: usize,
        total: usize,
    },

    #[error("{failed} of {total} connection checks failed")]
    ChecksFailed { failed: usize, total: usize },
}

#[derive(Debug, Clone, Copy)]
struct ControllersSettings {
    voltage_level: VoltageLevel,
}

type SessionList = Arc<Vec<Arc<dyn DeviceSession>>>;

struct Inner {
    config: DirectorConfig,
    sessions: RwLock<SessionList>,
    state: watch::Receiver<DirectorState>,
    state_requests: mpsc::UnboundedSender<DirectorState>,
    settings: tokio::sync::Mutex<ControllersSettings>,
    rediscovery: Mutex<Option<JoinHandle<()>>>,
    boards_tx: mpsc::Sender<Vec<IoBoard>>,
    inventory: RwLock<Arc<BoardRegistry>>,
    error_reporter: Arc<dyn ErrorReporter>,
    voltage_preference: Arc<dyn VoltagePreference>,
    cancel: CancellationToken,
}

/// Handle to a running Director.  Cloning is cheap; all clones share state.
#[derive(Clone)]
pub struct Director {
    inner: Arc<Inner>,
}

impl fmt::Debug for Director {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Director")
            .field("state", &self.state())
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl Director {
    /// Spawns the Director's tasks and returns its handle together with the
    /// receiver of published board inventories.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<L, F>(
        config: DirectorConfig,
        links: mpsc::Receiver<L>,
        factory: Arc<F>,
        error_reporter: Arc<dyn ErrorReporter>,
        voltage_preference: Arc<dyn VoltagePreference>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Vec<IoBoard>>)
    where
        L: Send + 'static,
        F: SessionFactory<L> + ?Sized + 'static,
    {
        let (boards_tx, boards_rx) = mpsc::channel(config.boards_channel_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(DirectorState::InitializingDirector);
        let (state_requests, requests_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let settings = ControllersSettings {
            voltage_level: voltage_preference.preferred_level(),
        };
        let inner = Arc::new(Inner {
            config,
            sessions: RwLock::new(Arc::new(Vec::new())),
            state: state_rx,
            state_requests,
            settings: tokio::sync::Mutex::new(settings),
            rediscovery: Mutex::new(None),
            boards_tx,
            inventory: RwLock::new(Arc::new(BoardRegistry::new())),
            error_reporter,
            voltage_preference,
            cancel,
        });

        tokio::spawn(run_state_writer(state_tx, requests_rx, inner.cancel.clone()));
        tokio::spawn(supervise(Arc::clone(&inner), links, factory, events_tx, events_rx));

        info!("director started");
        (Self { inner }, boards_rx)
    }

    // ── Observation ───────────────────────────────────────────────────────────

    pub fn state(&self) -> DirectorState {
        *self.inner.state.borrow()
    }

    /// A receiver that observes every state the writer commits.
    pub fn subscribe_state(&self) -> watch::Receiver<DirectorState> {
        self.inner.state.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == DirectorState::Operating
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions_snapshot().len()
    }

    /// The inventory published by the last rediscovery.
    pub fn inventory(&self) -> Arc<BoardRegistry> {
        Arc::clone(&self.inner.inventory.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// The voltage level all controllers last agreed on.
    pub async fn voltage_level(&self) -> VoltageLevel {
        self.inner.settings.lock().await.voltage_level
    }

    // ── Measurements ──────────────────────────────────────────────────────────

    /// Checks every pin of the bench and publishes one result per pin.
    ///
    /// With a single operable controller the sweep runs on the controller
    /// itself; with several, each pin is probed across all of them.
    ///
    /// # Errors
    ///
    /// [`DirectorError::NoControllers`] without operable controllers,
    /// [`DirectorError::ChecksFailed`] when some per-pin checks failed, and
    /// [`DirectorError::ResultsClosed`] when the receiver went away.
    pub async fn check_all_connections(
        &self,
        results: &mpsc::Sender<SimpleConnectivityDescription>,
    ) -> Result<(), DirectorError> {
        let operable = self.inner.operable_sessions();

        match operable.as_slice() {
            [] => {
                self.inner.error_reporter.report("No controllers to operate with!");
                Err(DirectorError::NoControllers)
            }
            [single] => single
                .check_connections_for_local_boards(results.clone())
                .await
                .map_err(|source| {
                    let e = DirectorError::Session {
                        session: single.id(),
                        command: "check_connections_for_local_boards",
                        source,
                    };
                    self.inner.error_reporter.report(&e.to_string());
                    e
                }),
            _ => {
                let registry = BoardRegistry::from_boards(self.inner.collect_boards().await);
                let pins: Vec<PinAffinityAndId> = registry.pins().map(Pin::id).collect();
                info!(pins = pins.len(), controllers = operable.len(), "checking every pin across controllers");

                let mut failed = 0;
                for pin in &pins {
                    match self.inner.check_connection_in(&registry, *pin, results).await {
                        Ok(()) => {}
                        Err(DirectorError::ResultsClosed) => return Err(DirectorError::ResultsClosed),
                        Err(_) => failed += 1,
                    }
                }
                if failed > 0 {
                    return Err(DirectorError::ChecksFailed {
                        failed,
                        total: pins.len(),
                    });
                }
                Ok(())
            }
        }
    }

    /// Energizes `pin`, reads back every controller, and publishes the pins
    /// that saw a voltage.
    ///
    /// Nothing is published when any step fails; the failure is returned and
    /// forwarded to the error reporter.
    ///
    /// # Errors
    ///
    /// Returns [`DirectorError`] describing the step that failed.
    pub async fn check_connection(
        &self,
        pin: PinAffinityAndId,
        results: &mpsc::Sender<SimpleConnectivityDescription>,
    ) -> Result<(), DirectorError> {
        // The published inventory may still name a session that was removed
        // before the next rediscovery ran.
        let snapshot = self.inventory();
        let owner_active = snapshot
            .owner_of(&pin)
            .is_some_and(|owner| self.inner.session(owner).is_some());
        if owner_active {
            return self.inner.check_connection_in(&snapshot, pin, results).await;
        }
        let fresh = BoardRegistry::from_boards(self.inner.collect_boards().await);
        self.inner.check_connection_in(&fresh, pin, results).await
    }

    // ── Settings ──────────────────────────────────────────────────────────────

    /// Applies the operator's preferred level to every controller.
    ///
    /// # Errors
    ///
    /// See [`Director::set_voltage_level`].
    pub async fn set_voltage_level_according_to_preferences(&self) -> Result<(), DirectorError> {
        let level = self.inner.voltage_preference.preferred_level();
        self.set_voltage_level(level).await
    }

    /// Applies `level` to every controller concurrently.  The shared setting
    /// changes only if every controller reports success; on partial failure
    /// the controllers that succeeded keep the new level.
    ///
    /// # Errors
    ///
    /// Returns [`DirectorError::VoltageLevelNotApplied`] on partial failure.
    pub async fn set_voltage_level(&self, level: VoltageLevel) -> Result<(), DirectorError> {
        let mut settings = self.inner.settings.lock().await;
        let sessions = self.inner.sessions_snapshot();

        let outcomes = join_all(sessions.iter().map(|s| s.set_voltage_level(level))).await;
        let failed = sessions
            .iter()
            .zip(&outcomes)
            .filter(|(session, outcome)| match outcome {
                Ok(ControllerResponse::PerformanceSucceeded) => false,
                other => {
                    warn!(session = %session.id(), %level, "voltage level not applied: {other:?}");
                    true
                }
            })
            .count();

        if failed > 0 {
            let e = DirectorError::VoltageLevelNotApplied {
                level,
                failed,
                total: sessions.len(),
            };
            self.inner.error_reporter.report(&e.to_string());
            return Err(e);
        }

        settings.voltage_level = level;
        info!(%level, controllers = sessions.len(), "voltage level applied");
        Ok(())
    }

    /// Cancels every Director task.  Sessions are told to cancel their jobs.
    pub fn shutdown(&self) {
        info!("director shutting down");
        self.inner.cancel.cancel();
        self.inner.abort_rediscovery();
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn run_state_writer(
    state: watch::Sender<DirectorState>,
    mut requests: mpsc::UnboundedReceiver<DirectorState>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = requests.recv() => next,
        };
        let Some(next) = next else { break };
        let previous = state.send_replace(next);
        if previous != next {
            info!(%previous, %next, "director state changed");
        }
    }
    debug!("director state writer stopped");
}

async fn supervise<L, F>(
    inner: Arc<Inner>,
    mut links: mpsc::Receiver<L>,
    factory: Arc<F>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) where
    L: Send + 'static,
    F: SessionFactory<L> + ?Sized + 'static,
{
    inner.set_state(DirectorState::SearchingForControllers);
    let mut links_open = true;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            link = links.recv(), if links_open => match link {
                Some(link) => inner.register(link, factory.as_ref(), &events_tx).await,
                None => {
                    warn!("link hand-off closed, no further controllers will be admitted");
                    links_open = false;
                }
            },
            Some(event) = events.recv() => inner.handle_event(event),
        }
    }

    inner.abort_rediscovery();
    for session in inner.sessions_snapshot().iter() {
        session.cancel_all_jobs();
    }
    debug!("director supervisor stopped");
}

impl Inner {
    fn set_state(&self, state: DirectorState) {
        if self.state_requests.send(state).is_err() {
            debug!(%state, "state writer stopped, transition dropped");
        }
    }

    fn sessions_snapshot(&self) -> SessionList {
        Arc::clone(&self.sessions.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update_sessions(&self, change: impl FnOnce(&mut Vec<Arc<dyn DeviceSession>>)) {
        let mut guard = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = guard.as_ref().clone();
        change(&mut next);
        *guard = Arc::new(next);
    }

    fn operable_sessions(&self) -> Vec<Arc<dyn DeviceSession>> {
        self.sessions_snapshot()
            .iter()
            .filter(|s| s.state() == SessionState::Operating)
            .cloned()
            .collect()
    }

    fn session(&self, id: SessionId) -> Option<Arc<dyn DeviceSession>> {
        self.sessions_snapshot().iter().find(|s| s.id() == id).cloned()
    }

    async fn register<L, F>(
        self: &Arc<Self>,
        link: L,
        factory: &F,
        events_tx: &mpsc::UnboundedSender<SessionEvent>,
    ) where
        F: SessionFactory<L> + ?Sized,
    {
        let id = Uuid::new_v4();
        let level = self.voltage_preference.preferred_level();
        let events = SessionEvents::new(id, events_tx.clone());

        match factory.create(link, id, level, events).await {
            Ok(session) => {
                self.update_sessions(|sessions| sessions.push(session));
                info!(session = %id, %level, "controller session registered");
                self.arm_rediscovery();
            }
            Err(e) => {
                self.error_reporter
                    .report(&format!("failed to start controller session: {e}"));
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::StateChanged {
                session,
                previous,
                new,
            } => {
                if new == SessionState::Operating || previous == SessionState::Operating {
                    debug!(%session, %previous, %new, "rearming rediscovery");
                    self.arm_rediscovery();
                }
            }
            SessionEvent::FatalError { session } => self.remove_failed(session),
        }
    }

    fn remove_failed(self: &Arc<Self>, id: SessionId) {
        let mut removed = None;
        let mut remaining = 0;
        self.update_sessions(|sessions| {
            if let Some(position) = sessions.iter().position(|s| s.id() == id) {
                removed = Some(sessions.remove(position));
            }
            remaining = sessions.len();
        });

        let Some(session) = removed else {
            debug!(session = %id, "fatal error from unknown session ignored");
            return;
        };

        warn!(session = %id, remaining, "controller removed after fatal error");
        session.cancel_all_jobs();
        self.set_state(if remaining == 0 {
            DirectorState::SearchingForControllers
        } else {
            DirectorState::RecoveryFromFailure
        });
        self.arm_rediscovery();
    }

    fn arm_rediscovery(self: &Arc<Self>) {
        let mut slot = self.rediscovery.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slot.take() {
            pending.abort();
        }
        if self.cancel.is_cancelled() {
            return;
        }

        let inner = Arc::clone(self);
        let delay = self.config.rediscovery_delay;
        *slot = Some(tokio::spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => inner.update_all_boards().await,
            }
        }));
    }

    fn abort_rediscovery(&self) {
        if let Some(pending) = self
            .rediscovery
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pending.abort();
        }
    }

    async fn update_all_boards(&self) {
        self.set_state(DirectorState::UpdatingBoards);

        let boards = self.collect_boards().await;
        let count = boards.len();
        *self.inventory.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(BoardRegistry::from_boards(boards.iter().cloned()));

        if self.boards_tx.send(boards).await.is_err() {
            debug!("boards receiver dropped, inventory not published");
        }

        if count == 0 {
            warn!("no boards found");
            self.set_state(DirectorState::NoBoardsAvailable);
        } else {
            info!(count, "boards found");
            self.set_state(DirectorState::Operating);
        }
    }

    /// Inventory of every operable session, queried concurrently.  A session
    /// whose query fails is skipped.
    async fn collect_boards(&self) -> Vec<IoBoard> {
        let sessions = self.operable_sessions();
        let inventories = join_all(sessions.iter().map(|s| s.boards())).await;

        sessions
            .iter()
            .zip(inventories)
            .flat_map(|(session, inventory)| match inventory {
                Ok(boards) => boards,
                Err(e) => {
                    warn!(session = %session.id(), "inventory query failed, controller skipped: {e}");
                    Vec::new()
                }
            })
            .collect()
    }

    async fn check_connection_in(
        &self,
        registry: &BoardRegistry,
        pin: PinAffinityAndId,
        results: &mpsc::Sender<SimpleConnectivityDescription>,
    ) -> Result<(), DirectorError> {
        debug!(%pin, "checking connection");
        let outcome = match self.probe(registry, pin).await {
            Ok(description) => results
                .send(description)
                .await
                .map_err(|_| DirectorError::ResultsClosed),
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            if !matches!(e, DirectorError::ResultsClosed) {
                self.error_reporter
                    .report(&format!("connection check of {pin} failed: {e}"));
            }
        }
        outcome
    }

    async fn probe(
        &self,
        registry: &BoardRegistry,
        pin: PinAffinityAndId,
    ) -> Result<SimpleConnectivityDescription, DirectorError> {
        let unknown = || DirectorError::UnknownBoard(pin.board_address());
        let owner_id = registry.owner_of(&pin).ok_or_else(unknown)?;
        let owner = self.session(owner_id).ok_or_else(unknown)?;

        expect_response(
            owner_id,
            "set_voltage_at_pin",
            owner.set_voltage_at_pin(pin.physical()).await,
            ControllerResponse::Acknowledged,
        )?;

        let readers = self.operable_sessions();
        let read_back = join_all(
            readers
                .iter()
                .map(|s| async move { (s.id(), s.measure_all_voltages().await) }),
        )
        .await;

        let disabled = expect_response(
            owner_id,
            "disable_output",
            owner.disable_output().await,
            ControllerResponse::Acknowledged,
        );

        let mut tables = Vec::new();
        for (session, result) in read_back {
            tables.extend(result.map_err(|source| DirectorError::Session {
                session,
                command: "measure_all_voltages",
                source,
            })?);
        }
        disabled?;

        Ok(SimpleConnectivityDescription::from_read_back(pin, &tables))
    }
}

fn expect_response(
    session: SessionId,
    command: &'static str,
    outcome: Result<ControllerResponse, SessionError>,
    expected: ControllerResponse,
) -> Result<(), DirectorError> {
    match outcome {
        Ok(response) if response == expected => Ok(()),
        Ok(response) => Err(DirectorError::CommandRejected {
            session,
            command,
            response,
        }),
        Err(source) => Err(DirectorError::Session {
            session,
            command,
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use mockall::predicate::eq;
    use tester_core::BoardVoltages;

    use super::*;
    use crate::application::session::MockDeviceSession;

    // ── Test doubles ──────────────────────────────────────────────────────────

    /// Hands out prepared sessions, one per link.
    struct QueueFactory {
        sessions: Mutex<VecDeque<Arc<dyn DeviceSession>>>,
    }

    impl QueueFactory {
        fn new(sessions: Vec<Arc<dyn DeviceSession>>) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(sessions.into()),
            })
        }
    }

    #[async_trait]
    impl SessionFactory<()> for QueueFactory {
        async fn create(
            &self,
            _link: (),
            _id: SessionId,
            _voltage_level: VoltageLevel,
            _events: SessionEvents,
        ) -> Result<Arc<dyn DeviceSession>, SessionError> {
            self.sessions
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(SessionError::Device("no session prepared".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        messages: Mutex<Vec<String>>,
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    fn operable_mock(id: SessionId) -> MockDeviceSession {
        let mut session = MockDeviceSession::new();
        session.expect_id().return_const(id);
        session.expect_state().return_const(SessionState::Operating);
        session.expect_cancel_all_jobs().return_const(());
        session
    }

    fn board(address: u8, owner: SessionId) -> IoBoard {
        IoBoard::new(address, owner).unwrap()
    }

    async fn start_with(
        sessions: Vec<Arc<dyn DeviceSession>>,
        reporter: Arc<RecordingReporter>,
    ) -> (Director, mpsc::Receiver<Vec<IoBoard>>) {
        let count = sessions.len();
        let (links_tx, links_rx) = mpsc::channel(8);
        let (director, boards_rx) = Director::start(
            DirectorConfig {
                rediscovery_delay: Duration::from_secs(3600),
                ..DirectorConfig::default()
            },
            links_rx,
            QueueFactory::new(sessions),
            reporter,
            Arc::new(VoltageLevel::Low),
            CancellationToken::new(),
        );
        for _ in 0..count {
            links_tx.send(()).await.unwrap();
        }
        while director.session_count() < count {
            tokio::task::yield_now().await;
        }
        (director, boards_rx)
    }

    // ── check_all_connections ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_check_all_connections_without_sessions_reports_error() {
        // Arrange
        let reporter = Arc::new(RecordingReporter::default());
        let (director, _boards) = start_with(Vec::new(), Arc::clone(&reporter)).await;
        let (results_tx, mut results_rx) = mpsc::channel(4);

        // Act
        let outcome = director.check_all_connections(&results_tx).await;

        // Assert
        assert!(matches!(outcome, Err(DirectorError::NoControllers)));
        assert_eq!(reporter.messages.lock().unwrap().len(), 1);
        assert!(results_rx.try_recv().is_err());
        assert_ne!(director.state(), DirectorState::Operating);
        director.shutdown();
    }

    #[tokio::test]
    async fn test_check_all_connections_with_one_session_delegates_sweep() {
        // Arrange
        let id = Uuid::new_v4();
        let mut session = operable_mock(id);
        session
            .expect_check_connections_for_local_boards()
            .times(1)
            .returning(|_| Ok(()));
        session.expect_set_voltage_at_pin().never();
        let (director, _boards) =
            start_with(vec![Arc::new(session)], Arc::new(RecordingReporter::default())).await;
        let (results_tx, _results_rx) = mpsc::channel(4);

        // Act / Assert
        director.check_all_connections(&results_tx).await.unwrap();
        director.shutdown();
    }

    // ── check_connection ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_check_connection_energizes_physical_pin_and_publishes_positive_voltages() {
        // Arrange
        let id = Uuid::new_v4();
        let pin = PinAffinityAndId::new(2, 10).unwrap();
        let mut session = operable_mock(id);
        session
            .expect_boards()
            .returning(move || Ok(vec![board(2, id)]));
        session
            .expect_set_voltage_at_pin()
            .with(eq(PinAffinityAndId::new(2, 18).unwrap()))
            .times(1)
            .returning(|_| Ok(ControllerResponse::Acknowledged));
        session.expect_measure_all_voltages().times(1).returning(|| {
            Ok(vec![BoardVoltages {
                board_address: 2,
                voltages: vec![(10, 0.85), (11, 0.0)],
            }])
        });
        session
            .expect_disable_output()
            .times(1)
            .returning(|| Ok(ControllerResponse::Acknowledged));
        let (director, _boards) =
            start_with(vec![Arc::new(session)], Arc::new(RecordingReporter::default())).await;
        let (results_tx, mut results_rx) = mpsc::channel(4);

        // Act
        director.check_connection(pin, &results_tx).await.unwrap();

        // Assert
        let result = results_rx.recv().await.unwrap();
        assert_eq!(result.pin, pin);
        assert_eq!(result.connections.len(), 1);
        assert_eq!(result.connections[0].to_pin, pin);
        director.shutdown();
    }

    #[tokio::test]
    async fn test_check_connection_aborts_when_energize_not_acknowledged() {
        // Arrange
        let id = Uuid::new_v4();
        let mut session = operable_mock(id);
        session
            .expect_boards()
            .returning(move || Ok(vec![board(1, id)]));
        session
            .expect_set_voltage_at_pin()
            .returning(|_| Ok(ControllerResponse::NotAcknowledged));
        session.expect_measure_all_voltages().never();
        session.expect_disable_output().never();
        let reporter = Arc::new(RecordingReporter::default());
        let (director, _boards) = start_with(vec![Arc::new(session)], Arc::clone(&reporter)).await;
        let (results_tx, mut results_rx) = mpsc::channel(4);

        // Act
        let outcome = director
            .check_connection(PinAffinityAndId::new(1, 0).unwrap(), &results_tx)
            .await;

        // Assert
        assert!(matches!(
            outcome,
            Err(DirectorError::CommandRejected {
                command: "set_voltage_at_pin",
                response: ControllerResponse::NotAcknowledged,
                ..
            })
        ));
        assert!(results_rx.try_recv().is_err());
        assert_eq!(reporter.messages.lock().unwrap().len(), 1);
        director.shutdown();
    }

    #[tokio::test]
    async fn test_check_connection_publishes_nothing_when_disable_not_acknowledged() {
        // Arrange
        let id = Uuid::new_v4();
        let mut session = operable_mock(id);
        session.expect_boards().returning(move || Ok(vec![board(1, id)]));
        session
            .expect_set_voltage_at_pin()
            .times(1)
            .returning(|_| Ok(ControllerResponse::Acknowledged));
        session.expect_measure_all_voltages().times(1).returning(|| {
            Ok(vec![BoardVoltages {
                board_address: 1,
                voltages: vec![(0, 1.0)],
            }])
        });
        session
            .expect_disable_output()
            .times(1)
            .returning(|| Ok(ControllerResponse::NotAcknowledged));
        let reporter = Arc::new(RecordingReporter::default());
        let (director, _boards) = start_with(vec![Arc::new(session)], Arc::clone(&reporter)).await;
        let (results_tx, mut results_rx) = mpsc::channel(4);

        // Act
        let outcome = director
            .check_connection(PinAffinityAndId::new(1, 0).unwrap(), &results_tx)
            .await;

        // Assert
        assert!(matches!(
            outcome,
            Err(DirectorError::CommandRejected {
                command: "disable_output",
                response: ControllerResponse::NotAcknowledged,
                ..
            })
        ));
        assert!(results_rx.try_recv().is_err());
        assert_eq!(reporter.messages.lock().unwrap().len(), 1);
        director.shutdown();
    }

    #[tokio::test]
    async fn test_check_connection_disables_output_after_failed_read_back() {
        // Arrange
        let id = Uuid::new_v4();
        let disabled = Arc::new(AtomicUsize::new(0));
        let mut session = operable_mock(id);
        session.expect_boards().returning(move || Ok(vec![board(1, id)]));
        session
            .expect_set_voltage_at_pin()
            .times(1)
            .returning(|_| Ok(ControllerResponse::Acknowledged));
        session
            .expect_measure_all_voltages()
            .times(1)
            .returning(|| Err(SessionError::Timeout(4000)));
        session.expect_disable_output().times(1).returning({
            let disabled = Arc::clone(&disabled);
            move || {
                disabled.fetch_add(1, Ordering::SeqCst);
                Ok(ControllerResponse::Acknowledged)
            }
        });
        let (director, _boards) =
            start_with(vec![Arc::new(session)], Arc::new(RecordingReporter::default())).await;
        let (results_tx, mut results_rx) = mpsc::channel(4);

        // Act
        let outcome = director
            .check_connection(PinAffinityAndId::new(1, 0).unwrap(), &results_tx)
            .await;

        // Assert
        assert!(matches!(
            outcome,
            Err(DirectorError::Session {
                command: "measure_all_voltages",
                source: SessionError::Timeout(4000),
                ..
            })
        ));
        assert_eq!(disabled.load(Ordering::SeqCst), 1);
        assert!(results_rx.try_recv().is_err());
        director.shutdown();
    }

    #[tokio::test]
    async fn test_check_connection_for_unowned_board_fails() {
        let id = Uuid::new_v4();
        let mut session = operable_mock(id);
        session.expect_boards().returning(move || Ok(vec![board(1, id)]));
        let (director, _boards) =
            start_with(vec![Arc::new(session)], Arc::new(RecordingReporter::default())).await;
        let (results_tx, _results_rx) = mpsc::channel(4);

        let outcome = director
            .check_connection(PinAffinityAndId::new(9, 0).unwrap(), &results_tx)
            .await;

        assert!(matches!(outcome, Err(DirectorError::UnknownBoard(9))));
        director.shutdown();
    }

    // ── Voltage level ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_set_voltage_level_partial_failure_keeps_previous_setting() {
        // Arrange
        let mut good = operable_mock(Uuid::new_v4());
        good.expect_set_voltage_level()
            .returning(|_| Ok(ControllerResponse::PerformanceSucceeded));
        let mut bad = operable_mock(Uuid::new_v4());
        bad.expect_set_voltage_level()
            .returning(|_| Ok(ControllerResponse::PerformanceFailed));
        let (director, _boards) = start_with(
            vec![Arc::new(good), Arc::new(bad)],
            Arc::new(RecordingReporter::default()),
        )
        .await;

        // Act
        let outcome = director.set_voltage_level(VoltageLevel::High).await;

        // Assert
        assert!(matches!(
            outcome,
            Err(DirectorError::VoltageLevelNotApplied { failed: 1, total: 2, .. })
        ));
        assert_eq!(director.voltage_level().await, VoltageLevel::Low);
        director.shutdown();
    }

    #[tokio::test]
    async fn test_set_voltage_level_commits_when_all_succeed() {
        let mut session = operable_mock(Uuid::new_v4());
        session
            .expect_set_voltage_level()
            .with(eq(VoltageLevel::High))
            .returning(|_| Ok(ControllerResponse::PerformanceSucceeded));
        let (director, _boards) =
            start_with(vec![Arc::new(session)], Arc::new(RecordingReporter::default())).await;

        director.set_voltage_level(VoltageLevel::High).await.unwrap();

        assert_eq!(director.voltage_level().await, VoltageLevel::High);
        director.shutdown();
    }

    #[test]
    fn test_director_config_defaults() {
        let config = DirectorConfig::default();
        assert_eq!(config.rediscovery_delay, Duration::from_millis(3000));
        assert_eq!(config.boards_channel_capacity, 16);
    }
}
