//! Network infrastructure for the bench director.
//!
//! # Sub-modules
//!
//! - **`admission`** – The rendezvous listener.  Accepts a controller on the
//!   well-known port, opens a dedicated link for it, and tells it the link's
//!   port.
//!
//! - **`link`** – One dedicated TCP link per controller: inbound bytes,
//!   outbound frames, and the periodic heartbeat.
//!
//! - **`monitor`** – A read-only device session that decodes a link's traffic
//!   and tracks the controller's boards.

pub mod admission;
pub mod link;
pub mod monitor;
