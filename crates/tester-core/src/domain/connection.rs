//! Connections between pins and the per-probe result types.

use serde::Serialize;
use tracing::debug;

use crate::domain::pin::{BoardAddress, PinAffinityAndId, PinId};

/// The single measurement a connection may carry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Reading {
    Voltage(f32),
    Resistance(f32),
    /// Raw ADC code as reported by the controller.
    Raw(i32),
}

/// Directed edge from a pin to `to_pin`.
///
/// A connection reported by a boolean (`CONNECT`) frame carries no reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub to_pin: PinAffinityAndId,
    pub reading: Option<Reading>,
}

impl Connection {
    pub fn flag(to_pin: PinAffinityAndId) -> Self {
        Self {
            to_pin,
            reading: None,
        }
    }

    pub fn with_reading(to_pin: PinAffinityAndId, reading: Reading) -> Self {
        Self {
            to_pin,
            reading: Some(reading),
        }
    }

    pub fn voltage(&self) -> Option<f32> {
        match self.reading {
            Some(Reading::Voltage(volts)) => Some(volts),
            _ => None,
        }
    }

    pub fn resistance(&self) -> Option<f32> {
        match self.reading {
            Some(Reading::Resistance(ohms)) => Some(ohms),
            _ => None,
        }
    }

    pub fn raw(&self) -> Option<i32> {
        match self.reading {
            Some(Reading::Raw(code)) => Some(code),
            _ => None,
        }
    }
}

/// A pin seen at `voltage` while another pin was energized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimpleConnection {
    pub to_pin: PinAffinityAndId,
    pub voltage: f32,
}

/// One check result: everything that lit up while `pin` was energized.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimpleConnectivityDescription {
    pub pin: PinAffinityAndId,
    pub connections: Vec<SimpleConnection>,
}

impl SimpleConnectivityDescription {
    /// Builds a result from the read-back tables of every board, keeping only
    /// strictly positive voltages.
    pub fn from_read_back(pin: PinAffinityAndId, tables: &[BoardVoltages]) -> Self {
        Self {
            pin,
            connections: tables
                .iter()
                .flat_map(BoardVoltages::connections_above_zero)
                .collect(),
        }
    }
}

/// Voltage read-back of every pin on one board, keyed by harness pin id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoardVoltages {
    pub board_address: BoardAddress,
    pub voltages: Vec<(PinId, f32)>,
}

impl BoardVoltages {
    pub fn new(board_address: BoardAddress) -> Self {
        Self {
            board_address,
            voltages: Vec::new(),
        }
    }

    /// Entries with a voltage above zero as [`SimpleConnection`]s.
    ///
    /// Entries whose pin id cannot be addressed are skipped.
    pub fn connections_above_zero(&self) -> Vec<SimpleConnection> {
        self.voltages
            .iter()
            .filter(|(_, volts)| *volts > 0.0)
            .filter_map(|(pin_id, volts)| {
                match PinAffinityAndId::new(self.board_address, *pin_id) {
                    Ok(to_pin) => Some(SimpleConnection {
                        to_pin,
                        voltage: *volts,
                    }),
                    Err(e) => {
                        debug!(board = self.board_address, pin = pin_id, "skipping read-back entry: {e}");
                        None
                    }
                }
            })
            .collect()
    }
}
