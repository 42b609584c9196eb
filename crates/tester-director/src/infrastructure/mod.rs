//! Infrastructure layer of the bench director.
//!
//! Contains OS-facing adapters: the rendezvous listener, device links, the
//! link monitor session, and TOML configuration storage.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `tester_core`, but MUST NOT be imported by the `application` layer.

pub mod network;
pub mod storage;
