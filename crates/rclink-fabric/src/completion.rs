//! Work descriptors and work completions.

use serde::{Deserialize, Serialize};

use crate::types::MrHandle;

/// Opaque tag attached to a posted work request and echoed on its
/// completion. The transport uses it to identify the owning connection
/// through its registry instead of reinterpreting a raw address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionTag(pub u64);

/// Operation kind reported by a work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcOpcode {
    Send,
    Recv,
}

/// Outcome of a completed work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcStatus {
    Success,
    LocalError,
    RemoteError,
    FlushError,
}

impl WcStatus {
    /// Anything other than `Success` is fatal for the owning connection.
    pub fn is_error(self) -> bool {
        self != Self::Success
    }
}

/// Record describing the outcome of one previously posted work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    pub tag: CompletionTag,
    pub opcode: WcOpcode,
    pub status: WcStatus,
    /// Bytes transferred, valid on success.
    pub byte_len: u32,
}

/// Single scatter/gather work descriptor, reused across reposts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    pub tag: CompletionTag,
    pub mr: MrHandle,
    pub len: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_error() {
        assert!(!WcStatus::Success.is_error());
        assert!(WcStatus::LocalError.is_error());
        assert!(WcStatus::RemoteError.is_error());
        assert!(WcStatus::FlushError.is_error());
    }
}
