//! Circuit domain entities for the connections tester.
//!
//! Pure data and rules, no sockets and no runtime.
//!
//! # Model (for beginners)
//!
//! A *controller* box owns up to 127 *I/O boards*; each board has 32 *pins*.
//! The tester energizes one pin at a time and reads which other pins see a
//! voltage, producing *connections*.
//!
//! - [`pin`]: identity of a pin, harness↔physical numbering, and the runtime
//!   [`Pin`](pin::Pin) that holds the latest connection snapshot.
//! - [`connection`]: the edges between pins and the per-probe result types.
//! - [`board`]: boards, their calibration, and the
//!   [`BoardRegistry`](board::BoardRegistry) that resolves a pin's board.

pub mod board;
pub mod connection;
pub mod pin;
