//! Controller message types and the keywords of the text protocol.
//!
//! Grammar of one frame (whitespace separated, newlines insignificant):
//!
//! ```text
//! <HEADER> <ARGUMENT> [ -> <VALUE> ... ] END
//! ```

use std::fmt;

use serde::Serialize;

use crate::domain::board::{IoBoardInternalParameters, VoltageLevel};
use crate::domain::connection::Connection;
use crate::domain::pin::{BoardAddress, PinAffinityAndId};

// ── Protocol keywords ─────────────────────────────────────────────────────────

/// Mandatory frame terminator token.
pub const TERMINATOR: &str = "END";

/// Separates the argument from the value list.
pub const VALUES_SEPARATOR: &str = "->";

/// Separates board address and pin id inside a pin identity.
pub const PIN_FIELD_SEPARATOR: char = ':';

// ── Headers ───────────────────────────────────────────────────────────────────

/// Frame headers understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageHeader {
    /// `CONNECT`: boolean connectivity of a pin.
    PinConnectivityBoolean,
    /// `VOLTAGES`: connectivity with measured volts.
    PinConnectivityVoltage,
    /// `RESISTANCES`: connectivity with measured ohms.
    PinConnectivityResistance,
    /// `CONN_RAW`: connectivity with raw ADC codes.
    PinConnectivityRaw,
    /// `HW`: addresses of the boards behind a controller.
    HardwareDescription,
    /// `INTERNALS`: calibration of one board.
    InternalParameters,
}

impl MessageHeader {
    pub const ALL: [MessageHeader; 6] = [
        MessageHeader::PinConnectivityBoolean,
        MessageHeader::PinConnectivityVoltage,
        MessageHeader::PinConnectivityResistance,
        MessageHeader::PinConnectivityRaw,
        MessageHeader::HardwareDescription,
        MessageHeader::InternalParameters,
    ];

    pub fn keyword(self) -> &'static str {
        match self {
            MessageHeader::PinConnectivityBoolean => "CONNECT",
            MessageHeader::PinConnectivityVoltage => "VOLTAGES",
            MessageHeader::PinConnectivityResistance => "RESISTANCES",
            MessageHeader::PinConnectivityRaw => "CONN_RAW",
            MessageHeader::HardwareDescription => "HW",
            MessageHeader::InternalParameters => "INTERNALS",
        }
    }

    /// Whether the argument of this header is a `<board>:<pin>` identity.
    pub fn has_pin_argument(self) -> bool {
        matches!(
            self,
            MessageHeader::PinConnectivityBoolean
                | MessageHeader::PinConnectivityVoltage
                | MessageHeader::PinConnectivityResistance
                | MessageHeader::PinConnectivityRaw
        )
    }
}

impl fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Connections observed from `pin`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionsDescription {
    pub pin: PinAffinityAndId,
    pub connections: Vec<Connection>,
}

/// Boards a controller reports as present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HardwareDescription {
    pub boards_online: Vec<BoardAddress>,
}

/// Calibration of a single board.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InternalParameters {
    pub board_address: BoardAddress,
    pub parameters: IoBoardInternalParameters,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ControllerMessage {
    ConnectionsDescription(ConnectionsDescription),
    HardwareDescription(HardwareDescription),
    InternalParameters(InternalParameters),
    /// Output level confirmed by a controller.  No frame header currently
    /// produces it; sessions that learn the level out of band dispatch it
    /// through the same handler table.
    SelectedVoltageLevel(VoltageLevel),
}

impl ControllerMessage {
    /// Short name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ControllerMessage::ConnectionsDescription(_) => "connections_description",
            ControllerMessage::HardwareDescription(_) => "hardware_description",
            ControllerMessage::InternalParameters(_) => "internal_parameters",
            ControllerMessage::SelectedVoltageLevel(_) => "selected_voltage_level",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_are_distinct() {
        let mut keywords: Vec<_> = MessageHeader::ALL.iter().map(|h| h.keyword()).collect();
        keywords.sort_unstable();
        keywords.dedup();
        assert_eq!(keywords.len(), MessageHeader::ALL.len());
    }

    #[test]
    fn test_only_connectivity_headers_take_pin_argument() {
        assert!(MessageHeader::PinConnectivityRaw.has_pin_argument());
        assert!(!MessageHeader::HardwareDescription.has_pin_argument());
        assert!(!MessageHeader::InternalParameters.has_pin_argument());
    }
}
