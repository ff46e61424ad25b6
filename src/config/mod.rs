//! # Configuration
//!
//! Process configuration read from the environment at startup.

mod controller;
mod server;

pub use controller::ControllerConfig;
pub use server::ServerConfig;
