//! Bootstrap module for initializing the Huddle server
//!
//! This module handles:
//! - Configuration loading
//! - Media engine startup and SFU wiring

pub mod config;
pub mod services;

pub use config::load_config;
pub use services::{init_services, Services};
