//! Integration tests for the Director against in-memory controller sessions.
//!
//! Every fake session shares one simulated wiring harness: energizing a pin
//! on any controller makes every pin wired to it read 1.0 V on whichever
//! controller owns that pin.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use tester_core::{
    BoardAddress, BoardVoltages, IoBoard, PinAffinityAndId, SimpleConnectivityDescription,
    VoltageLevel,
};
use tester_director::application::director::{
    Director, DirectorConfig, DirectorError, DirectorState,
};
use tester_director::application::session::{
    ControllerResponse, DeviceSession, ErrorReporter, SessionError, SessionEvents, SessionFactory,
    SessionId, SessionState,
};

// ── Simulated bench ───────────────────────────────────────────────────────────

struct Harness {
    wires: Vec<(PinAffinityAndId, PinAffinityAndId)>,
    energized: Mutex<Option<PinAffinityAndId>>,
}

impl Harness {
    fn new(wires: &[((u8, u8), (u8, u8))]) -> Arc<Self> {
        Arc::new(Self {
            wires: wires.iter().map(|&(a, b)| (pin(a.0, a.1), pin(b.0, b.1))).collect(),
            energized: Mutex::new(None),
        })
    }

    fn lit(&self, probe: PinAffinityAndId) -> bool {
        match *self.energized.lock().unwrap() {
            Some(source) => {
                source == probe
                    || self
                        .wires
                        .iter()
                        .any(|&(a, b)| (a == source && b == probe) || (b == source && a == probe))
            }
            None => false,
        }
    }
}

fn pin(board: u8, id: u8) -> PinAffinityAndId {
    PinAffinityAndId::new(board, id).unwrap()
}

#[derive(Clone)]
struct Plan {
    boards: Vec<BoardAddress>,
    fail_inventory: bool,
    voltage_response: ControllerResponse,
}

impl Plan {
    fn boards(boards: &[BoardAddress]) -> Self {
        Self {
            boards: boards.to_vec(),
            fail_inventory: false,
            voltage_response: ControllerResponse::PerformanceSucceeded,
        }
    }
}

struct FakeSession {
    id: SessionId,
    plan: Plan,
    harness: Arc<Harness>,
    events: SessionEvents,
    inventory_queries: AtomicUsize,
    cancelled: AtomicBool,
}

impl FakeSession {
    fn read_back(&self) -> Vec<BoardVoltages> {
        self.plan
            .boards
            .iter()
            .map(|&address| BoardVoltages {
                board_address: address,
                voltages: (0..32)
                    .map(|id| (id, if self.harness.lit(pin(address, id)) { 1.0 } else { 0.0 }))
                    .collect(),
            })
            .collect()
    }
}

#[async_trait]
impl DeviceSession for FakeSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> SessionState {
        SessionState::Operating
    }

    async fn boards(&self) -> Result<Vec<IoBoard>, SessionError> {
        self.inventory_queries.fetch_add(1, Ordering::SeqCst);
        if self.plan.fail_inventory {
            return Err(SessionError::Timeout(4000));
        }
        Ok(self
            .plan
            .boards
            .iter()
            .map(|&address| IoBoard::new(address, self.id).unwrap())
            .collect())
    }

    async fn set_voltage_at_pin(&self, physical: PinAffinityAndId) -> Result<ControllerResponse, SessionError> {
        *self.harness.energized.lock().unwrap() = Some(physical.from_physical());
        Ok(ControllerResponse::Acknowledged)
    }

    async fn measure_all_voltages(&self) -> Result<Vec<BoardVoltages>, SessionError> {
        Ok(self.read_back())
    }

    async fn disable_output(&self) -> Result<ControllerResponse, SessionError> {
        *self.harness.energized.lock().unwrap() = None;
        Ok(ControllerResponse::Acknowledged)
    }

    async fn set_voltage_level(&self, _level: VoltageLevel) -> Result<ControllerResponse, SessionError> {
        Ok(self.plan.voltage_response)
    }

    async fn check_connections_for_local_boards(
        &self,
        results: mpsc::Sender<SimpleConnectivityDescription>,
    ) -> Result<(), SessionError> {
        for &address in &self.plan.boards {
            for id in 0..32 {
                let probe = pin(address, id);
                *self.harness.energized.lock().unwrap() = Some(probe);
                let description = SimpleConnectivityDescription::from_read_back(probe, &self.read_back());
                results.send(description).await.map_err(|_| SessionError::LinkClosed)?;
            }
        }
        *self.harness.energized.lock().unwrap() = None;
        Ok(())
    }

    fn cancel_all_jobs(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

struct FakeFactory {
    harness: Arc<Harness>,
    plans: Mutex<VecDeque<Plan>>,
    created: Mutex<Vec<Arc<FakeSession>>>,
}

#[async_trait]
impl SessionFactory<()> for FakeFactory {
    async fn create(
        &self,
        _link: (),
        id: SessionId,
        _voltage_level: VoltageLevel,
        events: SessionEvents,
    ) -> Result<Arc<dyn DeviceSession>, SessionError> {
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(SessionError::Device("no plan".to_string()))?;
        let session = Arc::new(FakeSession {
            id,
            plan,
            harness: Arc::clone(&self.harness),
            events,
            inventory_queries: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        });
        self.created.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

#[derive(Default)]
struct CountingReporter {
    reports: AtomicUsize,
}

impl ErrorReporter for CountingReporter {
    fn report(&self, _message: &str) {
        self.reports.fetch_add(1, Ordering::SeqCst);
    }
}

struct Bench {
    director: Director,
    boards: mpsc::Receiver<Vec<IoBoard>>,
    sessions: Vec<Arc<FakeSession>>,
    reporter: Arc<CountingReporter>,
    factory: Arc<FakeFactory>,
    links: mpsc::Sender<()>,
}

async fn bench(harness: Arc<Harness>, plans: Vec<Plan>) -> Bench {
    let count = plans.len();
    let factory = Arc::new(FakeFactory {
        harness,
        plans: Mutex::new(plans.into()),
        created: Mutex::new(Vec::new()),
    });
    let reporter = Arc::new(CountingReporter::default());
    let (links_tx, links_rx) = mpsc::channel(8);

    let (director, boards) = Director::start(
        DirectorConfig::default(),
        links_rx,
        Arc::clone(&factory),
        Arc::clone(&reporter) as Arc<dyn ErrorReporter>,
        Arc::new(VoltageLevel::Low),
        CancellationToken::new(),
    );
    for _ in 0..count {
        links_tx.send(()).await.unwrap();
    }
    timeout(Duration::from_secs(5), async {
        while director.session_count() < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    let sessions = factory.created.lock().unwrap().clone();
    Bench {
        director,
        boards,
        sessions,
        reporter,
        factory,
        links: links_tx,
    }
}

async fn reach(state: &mut watch::Receiver<DirectorState>, target: DirectorState) {
    timeout(Duration::from_secs(60), state.wait_for(|s| *s == target))
        .await
        .unwrap()
        .unwrap();
}

async fn sweep(director: &Director) -> BTreeMap<PinAffinityAndId, BTreeSet<PinAffinityAndId>> {
    let (results_tx, mut results_rx) = mpsc::channel(256);
    director.check_all_connections(&results_tx).await.unwrap();
    drop(results_tx);

    let mut seen = BTreeMap::new();
    while let Some(result) = results_rx.recv().await {
        seen.insert(
            result.pin,
            result.connections.iter().map(|c| c.to_pin).collect(),
        );
    }
    seen
}

// ── Rediscovery ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_rapid_state_changes_trigger_single_rediscovery() {
    // Arrange
    let mut bench = bench(Harness::new(&[]), vec![Plan::boards(&[1, 2])]).await;
    let session = Arc::clone(&bench.sessions[0]);

    // Act
    for i in 0..10 {
        let (previous, new) = if i % 2 == 0 {
            (SessionState::Initializing, SessionState::Operating)
        } else {
            (SessionState::Operating, SessionState::Measuring)
        };
        session.events.state_changed(previous, new);
        sleep(Duration::from_millis(100)).await;
    }
    sleep(Duration::from_millis(3500)).await;

    // Assert
    assert_eq!(session.inventory_queries.load(Ordering::SeqCst), 1);
    let inventory = bench.boards.try_recv().unwrap();
    assert_eq!(inventory.len(), 2);
    assert_eq!(bench.director.state(), DirectorState::Operating);
    assert!(bench.director.is_ready());
    assert_eq!(bench.director.inventory().len(), 2);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(session.inventory_queries.load(Ordering::SeqCst), 1);
    assert!(bench.boards.try_recv().is_err());
    bench.director.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_rediscovery_skips_session_with_failed_inventory() {
    // Arrange
    let failing = Plan {
        fail_inventory: true,
        ..Plan::boards(&[9])
    };
    let mut bench = bench(Harness::new(&[]), vec![Plan::boards(&[3]), failing]).await;

    // Act
    let inventory = timeout(Duration::from_secs(10), bench.boards.recv())
        .await
        .unwrap()
        .unwrap();

    // Assert
    assert_eq!(inventory.iter().map(IoBoard::address).collect::<Vec<_>>(), vec![3]);
    let mut state = bench.director.subscribe_state();
    reach(&mut state, DirectorState::Operating).await;
    bench.director.shutdown();
}

// ── Fatal errors ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_fatal_errors_drive_recovery_then_search() {
    // Arrange
    let mut bench = bench(Harness::new(&[]), vec![Plan::boards(&[1]), Plan::boards(&[2])]).await;
    let mut state = bench.director.subscribe_state();
    let (first, second) = (Arc::clone(&bench.sessions[0]), Arc::clone(&bench.sessions[1]));

    // Act / Assert: one of two fails
    first.events.fatal_error();
    reach(&mut state, DirectorState::RecoveryFromFailure).await;
    assert_eq!(bench.director.session_count(), 1);
    assert!(first.cancelled.load(Ordering::SeqCst));

    // A repeated report changes nothing.
    first.events.fatal_error();
    tokio::task::yield_now().await;
    assert_eq!(bench.director.session_count(), 1);

    // The last one fails.
    second.events.fatal_error();
    reach(&mut state, DirectorState::SearchingForControllers).await;
    assert_eq!(bench.director.session_count(), 0);

    // Rediscovery still runs and finds nothing.
    let inventory = timeout(Duration::from_secs(10), bench.boards.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(inventory.is_empty());
    reach(&mut state, DirectorState::NoBoardsAvailable).await;
    bench.director.shutdown();
}

// ── Connectivity checks ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_check_connection_follows_controller_reconnected_before_rediscovery() {
    // Arrange
    let mut bench = bench(Harness::new(&[((1, 0), (1, 4))]), vec![Plan::boards(&[1])]).await;
    timeout(Duration::from_secs(10), bench.boards.recv())
        .await
        .unwrap()
        .unwrap();
    let first = Arc::clone(&bench.sessions[0]);

    // Act: the controller drops and comes back on a new link.
    bench.factory.plans.lock().unwrap().push_back(Plan::boards(&[1]));
    first.events.fatal_error();
    bench.links.send(()).await.unwrap();
    timeout(Duration::from_secs(1), async {
        while !first.cancelled.load(Ordering::SeqCst) || bench.director.session_count() != 1 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    let (results_tx, mut results_rx) = mpsc::channel(4);
    let outcome = bench.director.check_connection(pin(1, 0), &results_tx).await;

    // Assert
    assert_eq!(bench.director.inventory().owner_of(&pin(1, 0)), Some(first.id));
    assert!(outcome.is_ok(), "{outcome:?}");
    let result = results_rx.try_recv().unwrap();
    let lit: BTreeSet<_> = result.connections.iter().map(|c| c.to_pin).collect();
    assert_eq!(lit, BTreeSet::from([pin(1, 0), pin(1, 4)]));
    bench.director.shutdown();
}

#[tokio::test]
async fn test_single_session_sweep_matches_multi_session_sweep() {
    // Arrange
    let wires = [((1, 0), (1, 5)), ((1, 3), (2, 7)), ((2, 1), (2, 2))];
    let single = bench(Harness::new(&wires), vec![Plan::boards(&[1, 2])]).await;
    let multi = bench(Harness::new(&wires), vec![Plan::boards(&[1]), Plan::boards(&[2])]).await;

    // Act
    let from_single = sweep(&single.director).await;
    let from_multi = sweep(&multi.director).await;

    // Assert
    assert_eq!(from_single.len(), 64);
    assert_eq!(from_single, from_multi);
    assert_eq!(from_multi[&pin(1, 3)], BTreeSet::from([pin(1, 3), pin(2, 7)]));
    assert_eq!(from_multi[&pin(2, 2)], BTreeSet::from([pin(2, 1), pin(2, 2)]));
    assert_eq!(from_multi[&pin(1, 31)], BTreeSet::from([pin(1, 31)]));
    single.director.shutdown();
    multi.director.shutdown();
}

#[tokio::test]
async fn test_check_connection_publishes_wired_pins_across_controllers() {
    // Arrange
    let bench = bench(
        Harness::new(&[((4, 12), (5, 30))]),
        vec![Plan::boards(&[4]), Plan::boards(&[5])],
    )
    .await;
    let (results_tx, mut results_rx) = mpsc::channel(4);

    // Act
    bench.director.check_connection(pin(4, 12), &results_tx).await.unwrap();

    // Assert
    let result = results_rx.recv().await.unwrap();
    let lit: BTreeSet<_> = result.connections.iter().map(|c| c.to_pin).collect();
    assert_eq!(lit, BTreeSet::from([pin(4, 12), pin(5, 30)]));
    assert!(result.connections.iter().all(|c| c.voltage > 0.0));
    bench.director.shutdown();
}

#[tokio::test]
async fn test_check_all_connections_with_closed_results_stops() {
    let bench = bench(Harness::new(&[]), vec![Plan::boards(&[1]), Plan::boards(&[2])]).await;
    let (results_tx, results_rx) = mpsc::channel(4);
    drop(results_rx);

    let outcome = bench.director.check_all_connections(&results_tx).await;

    assert!(matches!(outcome, Err(DirectorError::ResultsClosed)));
    assert_eq!(bench.reporter.reports.load(Ordering::SeqCst), 0);
    bench.director.shutdown();
}

// ── Voltage level ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_voltage_level_kept_when_one_controller_fails() {
    // Arrange
    let failing = Plan {
        voltage_response: ControllerResponse::PerformanceFailed,
        ..Plan::boards(&[2])
    };
    let bench = bench(Harness::new(&[]), vec![Plan::boards(&[1]), failing]).await;

    // Act
    let outcome = bench.director.set_voltage_level(VoltageLevel::High).await;

    // Assert
    assert!(outcome.is_err());
    assert_eq!(bench.director.voltage_level().await, VoltageLevel::Low);
    assert_eq!(bench.reporter.reports.load(Ordering::SeqCst), 1);
    bench.director.shutdown();
}

#[tokio::test]
async fn test_voltage_level_from_preferences_applies_to_all() {
    let bench = bench(Harness::new(&[]), vec![Plan::boards(&[1]), Plan::boards(&[2])]).await;

    bench.director.set_voltage_level(VoltageLevel::High).await.unwrap();
    bench
        .director
        .set_voltage_level_according_to_preferences()
        .await
        .unwrap();

    assert_eq!(bench.director.voltage_level().await, VoltageLevel::Low);
    bench.director.shutdown();
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_shutdown_cancels_session_jobs() {
    let bench = bench(Harness::new(&[]), vec![Plan::boards(&[1])]).await;
    let session = Arc::clone(&bench.sessions[0]);

    bench.director.shutdown();

    timeout(Duration::from_secs(5), async {
        while !session.cancelled.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}
