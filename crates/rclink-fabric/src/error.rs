use thiserror::Error;

use crate::types::{QpState, ResourceKind};

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("invalid {kind} handle {id}")]
    InvalidHandle { kind: &'static str, id: u64 },

    #[error("{kind} handle {id} still referenced by another resource")]
    ResourceBusy { kind: &'static str, id: u64 },

    #[error("queue pair in state {actual:?}, expected {expected:?}")]
    InvalidQpState { expected: QpState, actual: QpState },

    #[error("memory region access out of bounds: offset {offset} + len {len} > capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },

    #[error("work queue full (depth {depth})")]
    QueueFull { depth: usize },

    #[error("address already in use: {addr}")]
    AddressInUse { addr: String },

    #[error("cm id {id} has no connected peer")]
    NotConnected { id: u64 },

    #[error("injected {kind:?} allocation fault")]
    InjectedFault { kind: ResourceKind },
}

pub type Result<T> = std::result::Result<T, FabricError>;
