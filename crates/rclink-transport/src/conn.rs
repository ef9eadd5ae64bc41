//! Per-connection state tracked by the reactor.

use rclink_fabric::cm::CmIdHandle;
use rclink_fabric::completion::{CompletionTag, WorkDescriptor};
use rclink_fabric::types::{CompChannelHandle, CqHandle, MrHandle, QpHandle};
use rclink_fabric::verbs::Fabric;

use crate::builder::ConnResources;
use crate::error::Result;

/// Connection lifecycle as the reactor observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Resources built and accept issued; establishment not yet confirmed.
    Accepting,
    /// Fully established, completions flowing.
    Established,
    /// Torn down; only removal remains.
    Disconnected,
}

/// One accepted connection and its resource set.
///
/// Handles are cached as plain copies so the hot completion path never
/// touches the `Option` holding the releasable set.
#[derive(Debug)]
pub struct Connection {
    /// Connection-manager identity, the registry key.
    pub id: CmIdHandle,
    /// Current lifecycle state.
    pub state: ConnState,
    /// Queue pair, cached for posting.
    pub qp: QpHandle,
    /// Completion queue, cached for polling and arming.
    pub cq: CqHandle,
    /// Notification channel, the routing key for completion events.
    pub channel: CompChannelHandle,
    /// Receive buffer registration.
    pub recv_mr: MrHandle,
    /// Send buffer registration.
    pub send_mr: MrHandle,
    /// Messages echoed so far.
    pub echoed: u64,
    resources: Option<ConnResources>,
    buffer_size: usize,
}

impl Connection {
    /// Wrap a freshly built resource set.
    pub fn new(id: CmIdHandle, resources: ConnResources, buffer_size: usize) -> Self {
        Self {
            id,
            state: ConnState::Accepting,
            qp: resources.qp,
            cq: resources.cq,
            channel: resources.channel,
            recv_mr: resources.recv_mr,
            send_mr: resources.send_mr,
            echoed: 0,
            resources: Some(resources),
            buffer_size,
        }
    }

    /// Tag shared by this connection's work requests; completions carry it
    /// back so the opcode alone disambiguates direction.
    pub fn tag(&self) -> CompletionTag {
        CompletionTag(self.id.0)
    }

    /// Receive descriptor covering the whole registered buffer.
    pub fn recv_desc(&self) -> WorkDescriptor {
        WorkDescriptor {
            tag: self.tag(),
            mr: self.recv_mr,
            len: self.buffer_size as u32,
        }
    }

    /// Send descriptor for an echo of `len` bytes.
    pub fn send_desc(&self, len: u32) -> WorkDescriptor {
        WorkDescriptor {
            tag: self.tag(),
            mr: self.send_mr,
            len,
        }
    }

    /// Post the standing receive so an inbound message always has a
    /// buffer waiting.
    pub fn post_receive<F: Fabric + ?Sized>(&self, fabric: &F) -> Result<()> {
        fabric.post_recv(self.qp, self.recv_desc())?;
        Ok(())
    }

    /// Record establishment. Returns false if the connection was not in
    /// the accepting state, in which case the event is stale.
    pub fn mark_established(&mut self) -> bool {
        if self.state == ConnState::Accepting {
            self.state = ConnState::Established;
            true
        } else {
            false
        }
    }

    /// Record disconnection.
    pub fn mark_disconnected(&mut self) {
        self.state = ConnState::Disconnected;
    }

    /// Release the resource set. Safe to call more than once; only the
    /// first call releases anything.
    pub fn release<F: Fabric + ?Sized>(&mut self, fabric: &F) {
        if let Some(resources) = self.resources.take() {
            resources.release(fabric);
        }
    }
}
