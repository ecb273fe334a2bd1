//! Completion-driven I/O core.
//!
//! - `connection`: connection state machine and live-connection registry
//! - `op`: pending-operation descriptors and their allocation ledger
//! - `acceptor`: accepts connections and submits their first read
//! - `uring`: the io_uring completion queue and the worker pool
//!
//! Only Linux provides the completion queue; the descriptor model itself
//! is platform independent.

pub mod connection;
pub mod op;

#[cfg(target_os = "linux")]
pub mod acceptor;

#[cfg(target_os = "linux")]
pub mod uring;
