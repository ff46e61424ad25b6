//! # Controller
//!
//! Core controller modules for the ServiceInstance operator.
//!
//! - `backoff`: Exponential backoff for retries
//! - `reconciler`: Core reconciliation logic

pub mod backoff;
pub mod reconciler;
