//! I/O boards, their calibration, and the board registry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::domain::pin::{
    validate_board_address, BoardAddress, Pin, PinAffinityAndId, PinDescriptor, PinError,
    MAX_PIN_ID, MIN_PIN_ID,
};

/// Key of the controller session that reported a board.
pub type ControllerId = Uuid;

/// Number of floats in an `INTERNALS` frame.
pub const INTERNAL_PARAMETERS_COUNT: usize = 7;

// ── Voltage level ─────────────────────────────────────────────────────────────

/// Output voltage level applied to energized pins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoltageLevel {
    #[default]
    Low,
    High,
}

impl VoltageLevel {
    pub const LOW_PREFERENCE: &'static str = "Low(0.7V)";
    pub const HIGH_PREFERENCE: &'static str = "High(1.0V)";

    /// Maps a stored preference string to a level.  Unknown strings map to
    /// [`VoltageLevel::Low`].
    pub fn from_preference(preference: &str) -> Self {
        match preference {
            Self::HIGH_PREFERENCE => VoltageLevel::High,
            _ => VoltageLevel::Low,
        }
    }

    pub fn preference_label(self) -> &'static str {
        match self {
            VoltageLevel::Low => Self::LOW_PREFERENCE,
            VoltageLevel::High => Self::HIGH_PREFERENCE,
        }
    }
}

impl fmt::Display for VoltageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.preference_label())
    }
}

// ── Internal parameters ───────────────────────────────────────────────────────

/// Calibration values of one board's two measurement paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IoBoardInternalParameters {
    pub in_resistance_1: f32,
    pub out_resistance_1: f32,
    pub in_resistance_2: f32,
    pub out_resistance_2: f32,
    pub shunt_resistance: f32,
    /// Volts.
    pub output_voltage_low: f32,
    /// Volts.
    pub output_voltage_high: f32,
}

impl IoBoardInternalParameters {
    /// Builds the parameters from wire order; the two output voltages arrive
    /// in millivolts.
    pub fn from_wire(values: [f32; INTERNAL_PARAMETERS_COUNT]) -> Self {
        let [in_r1, out_r1, in_r2, out_r2, shunt, low_mv, high_mv] = values;
        Self {
            in_resistance_1: in_r1,
            out_resistance_1: out_r1,
            in_resistance_2: in_r2,
            out_resistance_2: out_r2,
            shunt_resistance: shunt,
            output_voltage_low: low_mv / 1000.0,
            output_voltage_high: high_mv / 1000.0,
        }
    }

    pub fn output_voltage(&self, level: VoltageLevel) -> f32 {
        match level {
            VoltageLevel::Low => self.output_voltage_low,
            VoltageLevel::High => self.output_voltage_high,
        }
    }
}

// ── IoBoard ───────────────────────────────────────────────────────────────────

/// One addressable I/O board with its 32 pins.
#[derive(Debug, Clone, PartialEq)]
pub struct IoBoard {
    address: BoardAddress,
    controller: ControllerId,
    pins: Vec<Pin>,
    internal_parameters: Option<IoBoardInternalParameters>,
}

impl IoBoard {
    /// Creates a board with all of its pins unnamed and unmeasured.
    ///
    /// # Errors
    ///
    /// Returns [`PinError::BoardAddressOutOfRange`] for an invalid address.
    pub fn new(address: BoardAddress, controller: ControllerId) -> Result<Self, PinError> {
        let address = validate_board_address(i64::from(address))?;
        let pins = (MIN_PIN_ID..=MAX_PIN_ID)
            .map(|pin_id| PinAffinityAndId::new(address, pin_id).map(|id| Pin::new(PinDescriptor::new(id))))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            address,
            controller,
            pins,
            internal_parameters: None,
        })
    }

    pub fn address(&self) -> BoardAddress {
        self.address
    }

    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    pub fn pins(&self) -> &[Pin] {
        &self.pins
    }

    pub fn pin(&self, id: &PinAffinityAndId) -> Option<&Pin> {
        if id.board_address() != self.address {
            return None;
        }
        self.pins.get(id.pin_id() as usize)
    }

    pub fn pin_mut(&mut self, id: &PinAffinityAndId) -> Option<&mut Pin> {
        if id.board_address() != self.address {
            return None;
        }
        self.pins.get_mut(id.pin_id() as usize)
    }

    pub fn internal_parameters(&self) -> Option<&IoBoardInternalParameters> {
        self.internal_parameters.as_ref()
    }

    /// Stores the board calibration and copies the matching measurement path
    /// onto every pin (first mux → path 1, second mux → path 2).
    pub fn set_internal_parameters(&mut self, parameters: IoBoardInternalParameters, level: VoltageLevel) {
        for pin in &mut self.pins {
            let second_path = pin.descriptor().mux_index() == 1;
            pin.calibration.in_resistance = Some(if second_path {
                parameters.in_resistance_2
            } else {
                parameters.in_resistance_1
            });
            pin.calibration.out_resistance = Some(if second_path {
                parameters.out_resistance_2
            } else {
                parameters.out_resistance_1
            });
            pin.calibration.shunt_resistance = Some(parameters.shunt_resistance);
            pin.calibration.out_voltage = Some(parameters.output_voltage(level));
        }
        self.internal_parameters = Some(parameters);
    }
}

// ── BoardRegistry ─────────────────────────────────────────────────────────────

/// Address → board lookup for one discovery cycle.
///
/// Pins carry only their board address; this is where that key is resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoardRegistry {
    boards: BTreeMap<BoardAddress, IoBoard>,
}

impl BoardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from a flat inventory.  When two controllers report
    /// the same address the first report is kept.
    pub fn from_boards(boards: impl IntoIterator<Item = IoBoard>) -> Self {
        let mut registry = Self::new();
        for board in boards {
            registry.insert(board);
        }
        registry
    }

    /// Inserts a board; returns `false` (and keeps the existing one) when the
    /// address is already registered.
    pub fn insert(&mut self, board: IoBoard) -> bool {
        if let Some(existing) = self.boards.get(&board.address) {
            warn!(
                address = board.address,
                kept = %existing.controller,
                ignored = %board.controller,
                "duplicate board address reported by two controllers"
            );
            return false;
        }
        self.boards.insert(board.address, board);
        true
    }

    pub fn get(&self, address: BoardAddress) -> Option<&IoBoard> {
        self.boards.get(&address)
    }

    pub fn get_mut(&mut self, address: BoardAddress) -> Option<&mut IoBoard> {
        self.boards.get_mut(&address)
    }

    /// Resolves a pin's board key.
    pub fn board_of(&self, pin: &Pin) -> Option<&IoBoard> {
        self.get(pin.board_key())
    }

    /// Controller owning the board `id` lives on.
    pub fn owner_of(&self, id: &PinAffinityAndId) -> Option<ControllerId> {
        self.get(id.board_address()).map(IoBoard::controller)
    }

    pub fn boards(&self) -> impl Iterator<Item = &IoBoard> {
        self.boards.values()
    }

    pub fn pins(&self) -> impl Iterator<Item = &Pin> {
        self.boards.values().flat_map(|b| b.pins().iter())
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }
}
