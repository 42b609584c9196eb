//! # tester-core
//!
//! Shared library for the connections tester bench: the controller text
//! protocol and the circuit domain (pins, boards, connections).
//!
//! No sockets, no runtime.  The director crate builds its networking and
//! supervision on top of these types.
//!
//! # Architecture overview (for beginners)
//!
//! A bench is a set of *controller* boxes on the network.  Each controller
//! multiplexes up to 127 I/O boards of 32 pins.  The tester energizes one pin,
//! reads back which pins see a voltage, and reports the result as
//! connections.
//!
//! - **`protocol`** – How controller output is turned into typed messages.
//!   Frames look like `VOLTAGES 2:10 -> 2:10 0.850 END`; the decoder copes with
//!   partial reads, concatenated frames and line noise.
//!
//! - **`domain`** – Pin identities (with the harness↔physical numbering), the
//!   runtime pin with its connection snapshot, boards and the registry that
//!   resolves a pin's board.

pub mod domain;
pub mod protocol;

pub use domain::board::{
    BoardRegistry, ControllerId, IoBoard, IoBoardInternalParameters, VoltageLevel,
};
pub use domain::connection::{
    BoardVoltages, Connection, Reading, SimpleConnection, SimpleConnectivityDescription,
};
pub use domain::pin::{
    BoardAddress, Pin, PinAffinityAndId, PinDescriptor, PinError, PinGroup, PinId,
};
pub use protocol::codec::{decode_all, decode_next, DecodeError, FrameBuffer};
pub use protocol::interpreter::ResponseInterpreter;
pub use protocol::messages::ControllerMessage;
