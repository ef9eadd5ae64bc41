//! Out-of-band connection-manager contract and event vocabulary.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::types::{QpHandle, RemoteEndpoint};
use crate::verbs::Fabric;

/// Opaque transport identifier. Maps 1:1 to a queue pair once one is bound,
/// and keys the transport's connection registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CmIdHandle(pub u64);

/// Connection-manager event, tagged by the identity it concerns.
///
/// Ordering guarantee relied on by the transport: `Established` follows a
/// successful accept/connect and precedes `Disconnected` for the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    /// Inbound request carrying a freshly created id for the would-be
    /// connection (the listener id is untouched).
    ConnectRequest { id: CmIdHandle },
    AddrResolved { id: CmIdHandle },
    RouteResolved { id: CmIdHandle },
    Established { id: CmIdHandle },
    Disconnected { id: CmIdHandle },
    /// The remote side refused the connection.
    Rejected { id: CmIdHandle },
    Error { id: CmIdHandle },
}

impl CmEvent {
    /// The identity this event concerns.
    pub fn id(&self) -> CmIdHandle {
        match *self {
            CmEvent::ConnectRequest { id }
            | CmEvent::AddrResolved { id }
            | CmEvent::RouteResolved { id }
            | CmEvent::Established { id }
            | CmEvent::Disconnected { id }
            | CmEvent::Rejected { id }
            | CmEvent::Error { id } => id,
        }
    }
}

/// Sink connection-manager events are delivered into.
pub type CmEventSink = UnboundedSender<CmEvent>;

/// Address negotiation and connection lifecycle, consumed as an opaque
/// collaborator. All traffic readiness flows through the event sinks
/// registered at `listen`/`resolve` time.
pub trait ConnectionManager: Send + Sync {
    /// Bind and listen at `addr`; events for the listener and every inbound
    /// request are delivered to `events`.
    fn listen(&self, addr: &str, events: CmEventSink) -> Result<CmIdHandle>;

    /// Create an outbound id targeting `addr` and run address/route
    /// resolution; emits `AddrResolved` then `RouteResolved`.
    fn resolve(&self, addr: &str, events: CmEventSink) -> Result<CmIdHandle>;

    /// Associate a queue pair with the id before accept/connect.
    fn bind_qp(&self, id: CmIdHandle, qp: QpHandle) -> Result<()>;

    /// Negotiated remote parameters for the ready-to-receive phase.
    /// Available to the passive side once the connect request arrived, and
    /// to the active side once established.
    fn remote_endpoint(&self, id: CmIdHandle) -> Result<RemoteEndpoint>;

    fn connect(&self, id: CmIdHandle) -> Result<()>;
    fn accept(&self, id: CmIdHandle) -> Result<()>;
    fn reject(&self, id: CmIdHandle) -> Result<()>;
    fn disconnect(&self, id: CmIdHandle) -> Result<()>;
    fn destroy_id(&self, id: CmIdHandle) -> Result<()>;
}

/// Everything the transport needs from one fabric provider.
pub trait Provider: Fabric + ConnectionManager {}

impl<T: Fabric + ConnectionManager> Provider for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_covers_every_variant() {
        let id = CmIdHandle(42);
        let events = [
            CmEvent::ConnectRequest { id },
            CmEvent::AddrResolved { id },
            CmEvent::RouteResolved { id },
            CmEvent::Established { id },
            CmEvent::Disconnected { id },
            CmEvent::Rejected { id },
            CmEvent::Error { id },
        ];
        for event in events {
            assert_eq!(event.id(), id);
        }
    }
}
