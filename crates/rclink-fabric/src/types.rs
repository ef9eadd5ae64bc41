//! Opaque resource handles and capability types.

use serde::{Deserialize, Serialize};

/// Protection domain handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PdHandle(pub u64);

/// Completion notification channel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompChannelHandle(pub u64);

/// Completion queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CqHandle(pub u64);

/// Queue pair handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QpHandle(pub u64);

/// Registered memory region handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MrHandle(pub u64);

/// Resource kinds tracked by the fabric, used for accounting and fault
/// injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Pd,
    CompChannel,
    Cq,
    Qp,
    Mr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOCAL_READ: Self = Self(1);
    pub const LOCAL_WRITE: Self = Self(2);
    pub const REMOTE_READ: Self = Self(4);
    pub const REMOTE_WRITE: Self = Self(8);
    pub const ALL: Self = Self(0xF);

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn empty() -> Self {
        Self(0)
    }
}

impl std::ops::BitOr for AccessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for AccessFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Queue-pair work queue capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpCaps {
    /// Maximum outstanding send work requests.
    pub max_send_wr: u32,
    /// Maximum outstanding receive work requests.
    pub max_recv_wr: u32,
    /// Scatter/gather entries per send work request.
    pub max_send_sge: u32,
    /// Scatter/gather entries per receive work request.
    pub max_recv_sge: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 10,
            max_recv_wr: 10,
            max_send_sge: 1,
            max_recv_sge: 1,
        }
    }
}

/// Queue-pair state, advanced one phase at a time by the transition protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpState {
    Reset,
    Init,
    ReadyToReceive,
    ReadyToSend,
    Error,
}

impl Default for QpState {
    fn default() -> Self {
        Self::Reset
    }
}

/// Negotiated remote endpoint parameters consumed by the ready-to-receive
/// transition phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEndpoint {
    /// Remote queue-pair number.
    pub remote_qpn: u32,
    /// Negotiated path MTU in bytes.
    pub path_mtu: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_flags_contains() {
        let flags = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        assert!(flags.contains(AccessFlags::LOCAL_WRITE));
        assert!(flags.contains(AccessFlags::REMOTE_WRITE));
        assert!(!flags.contains(AccessFlags::LOCAL_READ));
        assert!(AccessFlags::ALL.contains(flags));
    }

    #[test]
    fn test_access_flags_empty() {
        assert!(!AccessFlags::empty().contains(AccessFlags::LOCAL_READ));
    }

    #[test]
    fn test_qp_caps_default() {
        let caps = QpCaps::default();
        assert_eq!(caps.max_send_wr, 10);
        assert_eq!(caps.max_recv_wr, 10);
        assert_eq!(caps.max_send_sge, 1);
        assert_eq!(caps.max_recv_sge, 1);
    }

    #[test]
    fn test_qp_state_default() {
        assert_eq!(QpState::default(), QpState::Reset);
    }
}
