//! Huddle server core: configuration, logging and startup wiring shared by
//! the HTTP layer and the binary.

pub mod bootstrap;
pub mod config;
pub mod logging;

pub use config::Config;
