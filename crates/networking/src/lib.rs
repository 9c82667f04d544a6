//! Networking utilities for offline sync
//!
//! This crate tracks platform connectivity and computes retry delays for
//! failed synchronization passes. It performs no requests itself; request
//! execution belongs to application-supplied functions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod monitor;
pub mod retry;

pub use monitor::{NetworkMonitor, NetworkState};
pub use retry::{RetrySchedule, RetryStrategy};
