//! ServiceInstance Operator Library
//!
//! This library provides the core functionality of the ServiceInstance operator:
//! the `ServiceInstance` CRD, the reconciler that drives an asynchronous service
//! manager, and the runtime that feeds it.
//!
//! ## Quick Start
//!
//! ```rust
//! use service_instance_operator::prelude::*;
//! ```
//!
//! This brings commonly used types and traits into scope. For more specific imports,
//! use the individual modules.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod prelude;
pub mod runtime;
pub mod server;
pub mod sm;
pub mod store;
