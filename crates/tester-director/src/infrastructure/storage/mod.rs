//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the TOML configuration from an explicit path
//! or the platform-appropriate directory, falls back to defaults on first
//! run, and converts its sections into the runtime configs of the admission
//! listener and the Director.

pub mod config;
