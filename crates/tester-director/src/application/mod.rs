//! Application layer of the bench director.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The application layer coordinates domain objects from `tester_core` to
//! fulfil operator goals ("check every connection on the bench").  It talks
//! to controllers only through the [`session::DeviceSession`] trait, so it
//! contains no sockets and no file access, and can be tested with mocks.
//!
//! # Sub-modules
//!
//! - **`session`**  – The device session contract, its lifecycle events, and
//!   the other collaborator seams (factory, error reporter, voltage
//!   preference).
//!
//! - **`director`** – The supervisory state machine: admits sessions,
//!   rediscovers boards, fans out connectivity checks and voltage changes.

pub mod director;
pub mod session;
