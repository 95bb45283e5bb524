//! Typed configuration and logging support shared between the relay
//! binary and the relay core engine.
//!
//! This crate plays the same role `sozu-command-lib` plays for sozu: it
//! carries the pieces a running proxy needs but that are not part of the
//! event-driven engine itself.

#[macro_use]
extern crate serde_derive;
extern crate chrono;
extern crate log;
extern crate serde;
extern crate serde_json;

pub mod config;
pub mod logging;

pub use config::{Config, ConfigError};
pub use logging::{init as init_logging, LogError};
