//! Transport error taxonomy.
//!
//! Per-connection failures (setup, transition, completion status) are
//! contained: the reactor logs them and tears down only the offending
//! connection. `ControlPlane` is the fatal class that stops the server.

use thiserror::Error;

use rclink_fabric::cm::CmIdHandle;
use rclink_fabric::completion::WcStatus;
use rclink_fabric::error::FabricError;

use crate::transition::TransitionPhase;

/// Errors surfaced by the transport server and client.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A fabric operation failed.
    #[error(transparent)]
    Fabric(#[from] FabricError),

    /// A queue-pair transition phase failed; the connection must be torn
    /// down, never retried in place.
    #[error("queue pair transition failed in {phase:?} phase: {source}")]
    Transition {
        /// The phase that failed.
        phase: TransitionPhase,
        /// The underlying fabric failure.
        #[source]
        source: FabricError,
    },

    /// The connection registry is full.
    #[error("connection registry at capacity ({max})")]
    AtCapacity {
        /// Configured maximum.
        max: usize,
    },

    /// An event referenced an identity the registry does not know.
    #[error("unknown connection {id:?}")]
    UnknownConnection {
        /// The unknown identity.
        id: CmIdHandle,
    },

    /// The remote side refused the connection.
    #[error("connection to {addr} rejected")]
    Rejected {
        /// The address that refused us.
        addr: String,
    },

    /// A message does not fit the fixed-size wire buffer.
    #[error("message of {len} bytes exceeds buffer size {max}")]
    MessageTooLarge {
        /// Message length.
        len: usize,
        /// Registered buffer size.
        max: usize,
    },

    /// A work completion reported a failure status.
    #[error("completion failed with status {status:?}")]
    CompletionFailed {
        /// The reported status.
        status: WcStatus,
    },

    /// The peer did not answer in time.
    #[error("timed out after {timeout_ms}ms waiting for the peer")]
    Timeout {
        /// Elapsed budget in milliseconds.
        timeout_ms: u64,
    },

    /// An event source closed underneath us.
    #[error("event source closed")]
    Closed,

    /// The reactor itself cannot continue.
    #[error("control plane failure: {reason}")]
    ControlPlane {
        /// Human-readable cause.
        reason: String,
    },
}

/// Transport result alias.
pub type Result<T> = std::result::Result<T, TransportError>;
