//! Pin identity, descriptors, and the runtime pin entity.
//!
//! A pin is addressed by its board (the *affinity*) and its id on that board.
//! The harness numbering used by operators differs from the physical pin
//! numbering of the multiplexers on the board; [`PinAffinityAndId::physical`]
//! and [`PinAffinityAndId::from_physical`] translate between the two.
//!
//! A [`Pin`] never points back at its board.  It only carries the board
//! address, which callers resolve through a
//! [`BoardRegistry`](crate::domain::board::BoardRegistry).

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::connection::Connection;

/// Address of an I/O board behind a controller.
pub type BoardAddress = u8;

/// Index of a pin on a single board.
pub type PinId = u8;

/// Lowest valid board address.
pub const MIN_BOARD_ADDRESS: BoardAddress = 1;
/// Highest valid board address.
pub const MAX_BOARD_ADDRESS: BoardAddress = 127;
/// Lowest valid pin id.
pub const MIN_PIN_ID: PinId = 0;
/// Highest valid pin id.
pub const MAX_PIN_ID: PinId = 31;
/// Number of pins on a single I/O board.
pub const PINS_PER_BOARD: usize = 32;
/// Number of pins served by one of the two multiplexers on a board.
pub const SINGLE_MUX_PINS: PinId = 16;
/// Size of the binary form of [`PinAffinityAndId`].
pub const PIN_IDENTITY_SIZE_BYTES: usize = 2;

/// Harness (logical) pin id → physical multiplexer pin index.
const HARNESS_TO_PHYSICAL: [PinId; PINS_PER_BOARD] = [
    6, 4, 2, 0, 9, 11, 13, 15, 22, 20, 18, 16, 25, 27, 29, 31, 30, 28, 26, 24, 17, 19, 21, 23, 14,
    12, 10, 8, 1, 3, 5, 7,
];

/// Physical multiplexer pin index → harness (logical) pin id.
const PHYSICAL_TO_HARNESS: [PinId; PINS_PER_BOARD] = invert(HARNESS_TO_PHYSICAL);

const fn invert(map: [PinId; PINS_PER_BOARD]) -> [PinId; PINS_PER_BOARD] {
    let mut inverse = [0; PINS_PER_BOARD];
    let mut i = 0;
    while i < PINS_PER_BOARD {
        inverse[map[i] as usize] = i as PinId;
        i += 1;
    }
    inverse
}

/// Errors raised when a pin identity is out of range or truncated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PinError {
    #[error("board address {0} is out of range [1, 127]")]
    BoardAddressOutOfRange(i64),

    #[error("pin id {0} is out of range [0, 31]")]
    PinIdOutOfRange(i64),

    #[error("pin identity needs 2 bytes, got {available}")]
    InsufficientBytes { available: usize },
}

/// Validates a board address coming from the wire.
///
/// # Errors
///
/// Returns [`PinError::BoardAddressOutOfRange`] outside `[1, 127]`.
pub fn validate_board_address(raw: i64) -> Result<BoardAddress, PinError> {
    if raw < i64::from(MIN_BOARD_ADDRESS) || raw > i64::from(MAX_BOARD_ADDRESS) {
        return Err(PinError::BoardAddressOutOfRange(raw));
    }
    Ok(raw as BoardAddress)
}

fn validate_pin_id(raw: i64) -> Result<PinId, PinError> {
    if raw < i64::from(MIN_PIN_ID) || raw > i64::from(MAX_PIN_ID) {
        return Err(PinError::PinIdOutOfRange(raw));
    }
    Ok(raw as PinId)
}

// ── PinAffinityAndId ──────────────────────────────────────────────────────────

/// Immutable identity of a pin: `(board address, pin id)`.
///
/// Construction always validates the ranges, so a value of this type is
/// guaranteed to be addressable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PinAffinityAndId {
    board_address: BoardAddress,
    pin_id: PinId,
}

impl PinAffinityAndId {
    /// Creates a pin identity.
    ///
    /// # Errors
    ///
    /// Returns [`PinError`] if either component is out of range.
    pub fn new(board_address: BoardAddress, pin_id: PinId) -> Result<Self, PinError> {
        Self::from_raw(i64::from(board_address), i64::from(pin_id))
    }

    /// Creates a pin identity from unchecked wide integers, as parsed from text.
    ///
    /// # Errors
    ///
    /// Returns [`PinError`] if either component is out of range.
    pub fn from_raw(board_address: i64, pin_id: i64) -> Result<Self, PinError> {
        Ok(Self {
            board_address: validate_board_address(board_address)?,
            pin_id: validate_pin_id(pin_id)?,
        })
    }

    /// Decodes the two-byte binary form `[board, pin]`.
    ///
    /// # Errors
    ///
    /// Returns [`PinError`] when fewer than two bytes are given or a component
    /// is out of range.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PinError> {
        match bytes {
            [board, pin, ..] => Self::new(*board, *pin),
            _ => Err(PinError::InsufficientBytes {
                available: bytes.len(),
            }),
        }
    }

    /// Encodes the two-byte binary form `[board, pin]`.
    pub fn to_bytes(self) -> [u8; PIN_IDENTITY_SIZE_BYTES] {
        [self.board_address, self.pin_id]
    }

    pub fn board_address(&self) -> BoardAddress {
        self.board_address
    }

    pub fn pin_id(&self) -> PinId {
        self.pin_id
    }

    /// Physical multiplexer index of this harness pin.
    pub fn physical_pin_index(&self) -> PinId {
        HARNESS_TO_PHYSICAL[self.pin_id as usize]
    }

    /// The same pin expressed in physical numbering, as sent to a controller.
    pub fn physical(&self) -> Self {
        Self {
            board_address: self.board_address,
            pin_id: self.physical_pin_index(),
        }
    }

    /// Interprets `self` as physical numbering and returns the harness pin.
    pub fn from_physical(&self) -> Self {
        Self {
            board_address: self.board_address,
            pin_id: PHYSICAL_TO_HARNESS[self.pin_id as usize],
        }
    }
}

impl fmt::Display for PinAffinityAndId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.board_address, self.pin_id)
    }
}

// ── Descriptors ───────────────────────────────────────────────────────────────

/// A named group of pins (a connector, a harness branch).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PinGroup {
    pub id: u32,
    pub name: Option<String>,
}

impl PinGroup {
    pub fn pretty_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }
}

/// Identity plus the operator-facing naming of a pin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinDescriptor {
    pub affinity_and_id: PinAffinityAndId,
    pub name: Option<String>,
    pub group: Option<PinGroup>,
    /// Process-unique id used by UI layers to correlate rows; not part of the
    /// pin's identity.
    pub uid: Uuid,
}

impl PinDescriptor {
    pub fn new(affinity_and_id: PinAffinityAndId) -> Self {
        Self {
            affinity_and_id,
            name: None,
            group: None,
            uid: Uuid::new_v4(),
        }
    }

    /// Drops the pin name and the group name; the group id is kept.
    pub fn clear_names(&mut self) {
        if let Some(group) = &mut self.group {
            group.name = None;
        }
        self.name = None;
    }

    /// Which of the two on-board multiplexers serves this pin.
    pub fn mux_index(&self) -> u8 {
        if self.affinity_and_id.physical_pin_index() >= SINGLE_MUX_PINS {
            1
        } else {
            0
        }
    }

    /// `<group or board>:<name or pin id>`.
    pub fn pretty_name(&self) -> String {
        let prefix = match &self.group {
            Some(group) => group.pretty_name(),
            None => self.affinity_and_id.board_address().to_string(),
        };
        let suffix = match &self.name {
            Some(name) => name.clone(),
            None => self.affinity_and_id.pin_id().to_string(),
        };
        format!("{prefix}:{suffix}")
    }
}

impl fmt::Display for PinDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pretty_name())
    }
}

// ── Runtime pin ───────────────────────────────────────────────────────────────

/// Calibration values a board reports for its measurement path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PinCalibration {
    pub in_resistance: Option<f32>,
    pub out_resistance: Option<f32>,
    pub shunt_resistance: Option<f32>,
    pub out_voltage: Option<f32>,
}

/// A pin on a live board together with the latest measured connections.
///
/// [`Pin::set_connections`] replaces the whole snapshot and recomputes the
/// derived views (health, missing and unexpected connections).
#[derive(Debug, Clone, PartialEq)]
pub struct Pin {
    descriptor: PinDescriptor,
    connections: Vec<Connection>,
    expected_connections: Option<Vec<Connection>>,
    unexpected_connections: Option<Vec<Connection>>,
    missing_expected_connections: Option<Vec<Connection>>,
    healthy: bool,
    pub changed_since_previous_check: bool,
    pub calibration: PinCalibration,
}

impl Pin {
    pub fn new(descriptor: PinDescriptor) -> Self {
        Self {
            descriptor,
            connections: Vec::new(),
            expected_connections: None,
            unexpected_connections: None,
            missing_expected_connections: None,
            healthy: false,
            changed_since_previous_check: false,
            calibration: PinCalibration::default(),
        }
    }

    pub fn descriptor(&self) -> &PinDescriptor {
        &self.descriptor
    }

    pub fn descriptor_mut(&mut self) -> &mut PinDescriptor {
        &mut self.descriptor
    }

    pub fn id(&self) -> PinAffinityAndId {
        self.descriptor.affinity_and_id
    }

    /// Lookup key of the owning board.
    pub fn board_key(&self) -> BoardAddress {
        self.descriptor.affinity_and_id.board_address()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Whether the last snapshot contained the pin's own connection.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn expected_connections(&self) -> Option<&[Connection]> {
        self.expected_connections.as_deref()
    }

    /// Observed connections absent from the expected baseline (self excluded).
    /// `None` until a baseline is set.
    pub fn unexpected_connections(&self) -> Option<&[Connection]> {
        self.unexpected_connections.as_deref()
    }

    /// Expected connections absent from the last snapshot.
    /// `None` until a baseline is set.
    pub fn missing_expected_connections(&self) -> Option<&[Connection]> {
        self.missing_expected_connections.as_deref()
    }

    /// Replaces the connection snapshot and recomputes the derived views.
    pub fn set_connections(&mut self, connections: Vec<Connection>) {
        self.connections = connections;
        self.recompute();
    }

    /// Sets (or clears) the expected baseline and recomputes the derived views.
    pub fn set_expected_connections(&mut self, expected: Option<Vec<Connection>>) {
        self.expected_connections = expected;
        self.recompute();
    }

    pub fn has_connection(&self, to_pin: &PinAffinityAndId) -> bool {
        self.connection_to(to_pin).is_some()
    }

    pub fn connection_to(&self, to_pin: &PinAffinityAndId) -> Option<&Connection> {
        self.connections.iter().find(|c| c.to_pin == *to_pin)
    }

    /// Compares the current snapshot against `checked`.
    ///
    /// A connection present on one side only counts as a difference when its
    /// resistance is below `max_resistance`, or when it carries no resistance.
    pub fn connections_differ(&self, checked: &[Connection], max_resistance: f32) -> bool {
        let significant = |c: &Connection| match c.resistance() {
            Some(ohms) => ohms < max_resistance,
            None => true,
        };

        let only_in_checked = checked
            .iter()
            .filter(|c| !self.has_connection(&c.to_pin))
            .any(significant);
        if only_in_checked {
            return true;
        }

        self.connections
            .iter()
            .filter(|mine| !checked.iter().any(|c| c.to_pin == mine.to_pin))
            .any(significant)
    }

    fn recompute(&mut self) {
        let own_id = self.id();
        self.healthy = self.has_connection(&own_id);

        let Some(expected) = &self.expected_connections else {
            self.unexpected_connections = None;
            self.missing_expected_connections = None;
            return;
        };

        let missing = expected
            .iter()
            .filter(|e| !self.has_connection(&e.to_pin))
            .cloned()
            .collect();
        let unexpected = self
            .connections
            .iter()
            .filter(|c| c.to_pin != own_id && !expected.iter().any(|e| e.to_pin == c.to_pin))
            .cloned()
            .collect();

        self.missing_expected_connections = Some(missing);
        self.unexpected_connections = Some(unexpected);
    }
}
