#![warn(missing_docs)]

//! Completion-driven reliable-connection transport server.
//!
//! Accepts connections negotiated out-of-band by a connection manager,
//! builds the per-connection fabric resource set, and multiplexes
//! connection-manager events and completion notifications across every open
//! connection from a single reactor task. The echo application semantics
//! mirror what the fixed-size message contract allows: whatever arrives in
//! the receive buffer goes back out of the send buffer unchanged.

pub mod builder;
pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod poller;
pub mod registry;
pub mod server;
pub mod transition;
