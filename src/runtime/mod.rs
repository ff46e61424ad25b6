//! # Runtime
//!
//! Process wiring: initialization, the controller and the secret watcher feeding
//! it, and the error policy applied to failed reconciles.

pub mod error_policy;
pub mod initialization;
pub mod secret_watch;
pub mod watch_loop;
