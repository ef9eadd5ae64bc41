//! In-process software fabric for testing without hardware.
//!
//! [`SimFabric`] implements both the verbs contract and the connection
//! manager. Message delivery is synchronous: a posted send consumes exactly
//! one posted receive on the linked peer queue pair, copies the bytes into
//! the peer's receive region, and appends completions on both sides. An
//! armed completion queue fires a single notification into its channel's
//! sink and disarms, mirroring the hardware semantics the transport's
//! poller has to cope with.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::cm::{CmEvent, CmEventSink, CmIdHandle, ConnectionManager};
use crate::completion::{CompletionTag, WcOpcode, WcStatus, WorkCompletion, WorkDescriptor};
use crate::error::{FabricError, Result};
use crate::types::{
    AccessFlags, CompChannelHandle, CqHandle, MrHandle, PdHandle, QpCaps, QpHandle, QpState,
    RemoteEndpoint, ResourceKind,
};
use crate::verbs::{Fabric, NotifySink};

/// Paired acquire/release counters plus data-path accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FabricStats {
    pub pds_allocated: u64,
    pub pds_released: u64,
    pub channels_created: u64,
    pub channels_destroyed: u64,
    pub cqs_created: u64,
    pub cqs_destroyed: u64,
    pub qps_created: u64,
    pub qps_destroyed: u64,
    pub mrs_registered: u64,
    pub mrs_deregistered: u64,
    pub recvs_posted: u64,
    pub sends_completed: u64,
    pub sends_failed: u64,
    pub recvs_completed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub completions_dropped: u64,
}

impl FabricStats {
    /// True when every resource kind has been released exactly as often as
    /// it was acquired.
    pub fn balanced(&self) -> bool {
        self.pds_allocated == self.pds_released
            && self.channels_created == self.channels_destroyed
            && self.cqs_created == self.cqs_destroyed
            && self.qps_created == self.qps_destroyed
            && self.mrs_registered == self.mrs_deregistered
    }
}

struct ChannelEntry {
    notify: NotifySink,
}

struct CqEntry {
    depth: usize,
    channel: u64,
    armed: bool,
    entries: VecDeque<WorkCompletion>,
}

struct QpEntry {
    pd: u64,
    cq: u64,
    caps: QpCaps,
    state: QpState,
    recv_queue: VecDeque<WorkDescriptor>,
    remote_qp: Option<u64>,
    remote: Option<RemoteEndpoint>,
}

struct MrEntry {
    pd: u64,
    buf: Vec<u8>,
    access: AccessFlags,
}

struct CmIdEntry {
    events: CmEventSink,
    /// Target address for outbound ids.
    target: Option<String>,
    /// Bound address for listener ids.
    listen_addr: Option<String>,
    qp: Option<u64>,
    peer: Option<u64>,
    connected: bool,
}

#[derive(Default)]
struct Tables {
    pds: HashMap<u64, ()>,
    channels: HashMap<u64, ChannelEntry>,
    cqs: HashMap<u64, CqEntry>,
    qps: HashMap<u64, QpEntry>,
    mrs: HashMap<u64, MrEntry>,
    ids: HashMap<u64, CmIdEntry>,
    listeners: HashMap<String, u64>,
    stats: FabricStats,
    fail_next: Option<ResourceKind>,
}

/// Software fabric shared by every endpoint of one simulated network.
pub struct SimFabric {
    inner: Mutex<Tables>,
    next_id: AtomicU64,
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFabric {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tables::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Snapshot of the allocation and data-path counters.
    pub fn stats(&self) -> FabricStats {
        self.inner.lock().unwrap().stats
    }

    /// Make the next allocation of `kind` fail once.
    pub fn fail_next_alloc(&self, kind: ResourceKind) {
        self.inner.lock().unwrap().fail_next = Some(kind);
    }

    /// Append a failed completion to the queue pair's completion queue, as a
    /// fabric-level error on that connection would.
    pub fn inject_completion_error(&self, qp: QpHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let (cq, tag) = {
            let qe = t.qps.get(&qp.0).ok_or(FabricError::InvalidHandle {
                kind: "qp",
                id: qp.0,
            })?;
            let tag = qe
                .recv_queue
                .front()
                .map(|d| d.tag)
                .unwrap_or(CompletionTag(0));
            (qe.cq, tag)
        };
        Self::push_wc(
            t,
            cq,
            WorkCompletion {
                tag,
                opcode: WcOpcode::Recv,
                status: WcStatus::LocalError,
                byte_len: 0,
            },
        );
        Ok(())
    }

    /// Queue pair at the other end of an established link.
    pub fn peer_qp(&self, qp: QpHandle) -> Result<QpHandle> {
        let t = &*self.inner.lock().unwrap();
        let entry = t.qps.get(&qp.0).ok_or(FabricError::InvalidHandle {
            kind: "qp",
            id: qp.0,
        })?;
        entry
            .remote_qp
            .map(QpHandle)
            .ok_or(FabricError::NotConnected { id: qp.0 })
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn take_fault(t: &mut Tables, kind: ResourceKind) -> Result<()> {
        if t.fail_next == Some(kind) {
            t.fail_next = None;
            return Err(FabricError::InjectedFault { kind });
        }
        Ok(())
    }

    fn push_wc(t: &mut Tables, cq_id: u64, wc: WorkCompletion) {
        let mut fired = None;
        let mut dropped = false;
        if let Some(cq) = t.cqs.get_mut(&cq_id) {
            if cq.entries.len() >= cq.depth {
                dropped = true;
            } else {
                cq.entries.push_back(wc);
                if cq.armed {
                    cq.armed = false;
                    fired = Some(cq.channel);
                }
            }
        }
        if dropped {
            t.stats.completions_dropped += 1;
        }
        if let Some(channel) = fired {
            if let Some(ch) = t.channels.get(&channel) {
                let _ = ch.notify.send(CompChannelHandle(channel));
            }
        }
    }

    fn complete_send_error(t: &mut Tables, cq: u64, tag: CompletionTag) {
        Self::push_wc(
            t,
            cq,
            WorkCompletion {
                tag,
                opcode: WcOpcode::Send,
                status: WcStatus::RemoteError,
                byte_len: 0,
            },
        );
        t.stats.sends_failed += 1;
    }
}

impl Fabric for SimFabric {
    fn alloc_pd(&self) -> Result<PdHandle> {
        let t = &mut *self.inner.lock().unwrap();
        Self::take_fault(t, ResourceKind::Pd)?;
        let id = self.next();
        t.pds.insert(id, ());
        t.stats.pds_allocated += 1;
        Ok(PdHandle(id))
    }

    fn dealloc_pd(&self, pd: PdHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        if !t.pds.contains_key(&pd.0) {
            return Err(FabricError::InvalidHandle {
                kind: "pd",
                id: pd.0,
            });
        }
        let busy = t.qps.values().any(|q| q.pd == pd.0) || t.mrs.values().any(|m| m.pd == pd.0);
        if busy {
            return Err(FabricError::ResourceBusy {
                kind: "pd",
                id: pd.0,
            });
        }
        t.pds.remove(&pd.0);
        t.stats.pds_released += 1;
        Ok(())
    }

    fn create_comp_channel(&self, notify: NotifySink) -> Result<CompChannelHandle> {
        let t = &mut *self.inner.lock().unwrap();
        Self::take_fault(t, ResourceKind::CompChannel)?;
        let id = self.next();
        t.channels.insert(id, ChannelEntry { notify });
        t.stats.channels_created += 1;
        Ok(CompChannelHandle(id))
    }

    fn destroy_comp_channel(&self, channel: CompChannelHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        if !t.channels.contains_key(&channel.0) {
            return Err(FabricError::InvalidHandle {
                kind: "channel",
                id: channel.0,
            });
        }
        if t.cqs.values().any(|c| c.channel == channel.0) {
            return Err(FabricError::ResourceBusy {
                kind: "channel",
                id: channel.0,
            });
        }
        t.channels.remove(&channel.0);
        t.stats.channels_destroyed += 1;
        Ok(())
    }

    fn create_cq(&self, depth: usize, channel: CompChannelHandle) -> Result<CqHandle> {
        let t = &mut *self.inner.lock().unwrap();
        Self::take_fault(t, ResourceKind::Cq)?;
        if !t.channels.contains_key(&channel.0) {
            return Err(FabricError::InvalidHandle {
                kind: "channel",
                id: channel.0,
            });
        }
        let id = self.next();
        t.cqs.insert(
            id,
            CqEntry {
                depth,
                channel: channel.0,
                armed: false,
                entries: VecDeque::new(),
            },
        );
        t.stats.cqs_created += 1;
        Ok(CqHandle(id))
    }

    fn destroy_cq(&self, cq: CqHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        if !t.cqs.contains_key(&cq.0) {
            return Err(FabricError::InvalidHandle {
                kind: "cq",
                id: cq.0,
            });
        }
        if t.qps.values().any(|q| q.cq == cq.0) {
            return Err(FabricError::ResourceBusy {
                kind: "cq",
                id: cq.0,
            });
        }
        t.cqs.remove(&cq.0);
        t.stats.cqs_destroyed += 1;
        Ok(())
    }

    fn create_qp(&self, pd: PdHandle, cq: CqHandle, caps: QpCaps) -> Result<QpHandle> {
        let t = &mut *self.inner.lock().unwrap();
        Self::take_fault(t, ResourceKind::Qp)?;
        if !t.pds.contains_key(&pd.0) {
            return Err(FabricError::InvalidHandle {
                kind: "pd",
                id: pd.0,
            });
        }
        if !t.cqs.contains_key(&cq.0) {
            return Err(FabricError::InvalidHandle {
                kind: "cq",
                id: cq.0,
            });
        }
        let id = self.next();
        t.qps.insert(
            id,
            QpEntry {
                pd: pd.0,
                cq: cq.0,
                caps,
                state: QpState::Reset,
                recv_queue: VecDeque::new(),
                remote_qp: None,
                remote: None,
            },
        );
        t.stats.qps_created += 1;
        Ok(QpHandle(id))
    }

    fn destroy_qp(&self, qp: QpHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let entry = t.qps.remove(&qp.0).ok_or(FabricError::InvalidHandle {
            kind: "qp",
            id: qp.0,
        })?;
        // Unlink the peer so its next send completes with a remote error
        // instead of writing into freed state.
        if let Some(peer) = entry.remote_qp {
            if let Some(pq) = t.qps.get_mut(&peer) {
                pq.remote_qp = None;
            }
        }
        t.stats.qps_destroyed += 1;
        Ok(())
    }

    fn reg_mr(&self, pd: PdHandle, len: usize, access: AccessFlags) -> Result<MrHandle> {
        let t = &mut *self.inner.lock().unwrap();
        Self::take_fault(t, ResourceKind::Mr)?;
        if !t.pds.contains_key(&pd.0) {
            return Err(FabricError::InvalidHandle {
                kind: "pd",
                id: pd.0,
            });
        }
        let id = self.next();
        t.mrs.insert(
            id,
            MrEntry {
                pd: pd.0,
                buf: vec![0u8; len],
                access,
            },
        );
        t.stats.mrs_registered += 1;
        Ok(MrHandle(id))
    }

    fn dereg_mr(&self, mr: MrHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        if t.mrs.remove(&mr.0).is_none() {
            return Err(FabricError::InvalidHandle {
                kind: "mr",
                id: mr.0,
            });
        }
        t.stats.mrs_deregistered += 1;
        Ok(())
    }

    fn write_mr(&self, mr: MrHandle, offset: usize, data: &[u8]) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let entry = t.mrs.get_mut(&mr.0).ok_or(FabricError::InvalidHandle {
            kind: "mr",
            id: mr.0,
        })?;
        let end = offset.saturating_add(data.len());
        if end > entry.buf.len() {
            return Err(FabricError::OutOfBounds {
                offset,
                len: data.len(),
                capacity: entry.buf.len(),
            });
        }
        entry.buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    fn read_mr(&self, mr: MrHandle, offset: usize, len: usize) -> Result<Vec<u8>> {
        let t = &*self.inner.lock().unwrap();
        let entry = t.mrs.get(&mr.0).ok_or(FabricError::InvalidHandle {
            kind: "mr",
            id: mr.0,
        })?;
        let end = offset.saturating_add(len);
        if end > entry.buf.len() {
            return Err(FabricError::OutOfBounds {
                offset,
                len,
                capacity: entry.buf.len(),
            });
        }
        Ok(entry.buf[offset..end].to_vec())
    }

    fn modify_qp_init(&self, qp: QpHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let entry = t.qps.get_mut(&qp.0).ok_or(FabricError::InvalidHandle {
            kind: "qp",
            id: qp.0,
        })?;
        if entry.state != QpState::Reset {
            return Err(FabricError::InvalidQpState {
                expected: QpState::Reset,
                actual: entry.state,
            });
        }
        entry.state = QpState::Init;
        Ok(())
    }

    fn modify_qp_rtr(&self, qp: QpHandle, remote: RemoteEndpoint) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let entry = t.qps.get_mut(&qp.0).ok_or(FabricError::InvalidHandle {
            kind: "qp",
            id: qp.0,
        })?;
        if entry.state != QpState::Init {
            return Err(FabricError::InvalidQpState {
                expected: QpState::Init,
                actual: entry.state,
            });
        }
        entry.remote = Some(remote);
        entry.state = QpState::ReadyToReceive;
        Ok(())
    }

    fn modify_qp_rts(&self, qp: QpHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let entry = t.qps.get_mut(&qp.0).ok_or(FabricError::InvalidHandle {
            kind: "qp",
            id: qp.0,
        })?;
        if entry.state != QpState::ReadyToReceive {
            return Err(FabricError::InvalidQpState {
                expected: QpState::ReadyToReceive,
                actual: entry.state,
            });
        }
        entry.state = QpState::ReadyToSend;
        Ok(())
    }

    fn post_recv(&self, qp: QpHandle, desc: WorkDescriptor) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        if !t.mrs.contains_key(&desc.mr.0) {
            return Err(FabricError::InvalidHandle {
                kind: "mr",
                id: desc.mr.0,
            });
        }
        let entry = t.qps.get_mut(&qp.0).ok_or(FabricError::InvalidHandle {
            kind: "qp",
            id: qp.0,
        })?;
        if entry.state == QpState::Reset || entry.state == QpState::Error {
            return Err(FabricError::InvalidQpState {
                expected: QpState::Init,
                actual: entry.state,
            });
        }
        if entry.recv_queue.len() >= entry.caps.max_recv_wr as usize {
            return Err(FabricError::QueueFull {
                depth: entry.caps.max_recv_wr as usize,
            });
        }
        entry.recv_queue.push_back(desc);
        t.stats.recvs_posted += 1;
        Ok(())
    }

    fn post_send(&self, qp: QpHandle, desc: WorkDescriptor) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let (local_cq, remote_qp, src) = {
            let entry = t.qps.get(&qp.0).ok_or(FabricError::InvalidHandle {
                kind: "qp",
                id: qp.0,
            })?;
            if entry.state != QpState::ReadyToSend {
                return Err(FabricError::InvalidQpState {
                    expected: QpState::ReadyToSend,
                    actual: entry.state,
                });
            }
            let mr = t.mrs.get(&desc.mr.0).ok_or(FabricError::InvalidHandle {
                kind: "mr",
                id: desc.mr.0,
            })?;
            let len = desc.len as usize;
            if len > mr.buf.len() {
                return Err(FabricError::OutOfBounds {
                    offset: 0,
                    len,
                    capacity: mr.buf.len(),
                });
            }
            (entry.cq, entry.remote_qp, mr.buf[..len].to_vec())
        };

        // Peer gone: the send itself posts fine but completes in error.
        let Some(peer) = remote_qp else {
            Self::complete_send_error(t, local_cq, desc.tag);
            return Ok(());
        };

        // A message with no posted receive waiting is a protocol violation
        // the fabric surfaces as a failed send completion.
        let (peer_cq, recv) = match t.qps.get_mut(&peer) {
            Some(pq) => (pq.cq, pq.recv_queue.pop_front()),
            None => {
                Self::complete_send_error(t, local_cq, desc.tag);
                return Ok(());
            }
        };
        let Some(rdesc) = recv else {
            Self::complete_send_error(t, local_cq, desc.tag);
            return Ok(());
        };

        let n = src.len().min(rdesc.len as usize);
        let delivered = match t.mrs.get_mut(&rdesc.mr.0) {
            Some(dst) if dst.access.contains(AccessFlags::LOCAL_WRITE) && n <= dst.buf.len() => {
                dst.buf[..n].copy_from_slice(&src[..n]);
                true
            }
            _ => false,
        };
        if !delivered {
            Self::complete_send_error(t, local_cq, desc.tag);
            return Ok(());
        }

        Self::push_wc(
            t,
            peer_cq,
            WorkCompletion {
                tag: rdesc.tag,
                opcode: WcOpcode::Recv,
                status: WcStatus::Success,
                byte_len: n as u32,
            },
        );
        t.stats.recvs_completed += 1;
        t.stats.bytes_received += n as u64;

        Self::push_wc(
            t,
            local_cq,
            WorkCompletion {
                tag: desc.tag,
                opcode: WcOpcode::Send,
                status: WcStatus::Success,
                byte_len: n as u32,
            },
        );
        t.stats.sends_completed += 1;
        t.stats.bytes_sent += n as u64;
        Ok(())
    }

    fn poll_cq(&self, cq: CqHandle, max: usize) -> Result<Vec<WorkCompletion>> {
        let t = &mut *self.inner.lock().unwrap();
        let entry = t.cqs.get_mut(&cq.0).ok_or(FabricError::InvalidHandle {
            kind: "cq",
            id: cq.0,
        })?;
        let n = entry.entries.len().min(max);
        Ok(entry.entries.drain(..n).collect())
    }

    fn arm_cq(&self, cq: CqHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let entry = t.cqs.get_mut(&cq.0).ok_or(FabricError::InvalidHandle {
            kind: "cq",
            id: cq.0,
        })?;
        // Arming only covers the next appended completion; anything already
        // queued stays silent, which is why the poller drains once more
        // after re-arming.
        entry.armed = true;
        Ok(())
    }
}

impl ConnectionManager for SimFabric {
    fn listen(&self, addr: &str, events: CmEventSink) -> Result<CmIdHandle> {
        let t = &mut *self.inner.lock().unwrap();
        if t.listeners.contains_key(addr) {
            return Err(FabricError::AddressInUse {
                addr: addr.to_string(),
            });
        }
        let id = self.next();
        t.ids.insert(
            id,
            CmIdEntry {
                events,
                target: None,
                listen_addr: Some(addr.to_string()),
                qp: None,
                peer: None,
                connected: false,
            },
        );
        t.listeners.insert(addr.to_string(), id);
        Ok(CmIdHandle(id))
    }

    fn resolve(&self, addr: &str, events: CmEventSink) -> Result<CmIdHandle> {
        let t = &mut *self.inner.lock().unwrap();
        let id = self.next();
        let _ = events.send(CmEvent::AddrResolved { id: CmIdHandle(id) });
        let _ = events.send(CmEvent::RouteResolved { id: CmIdHandle(id) });
        t.ids.insert(
            id,
            CmIdEntry {
                events,
                target: Some(addr.to_string()),
                listen_addr: None,
                qp: None,
                peer: None,
                connected: false,
            },
        );
        Ok(CmIdHandle(id))
    }

    fn bind_qp(&self, id: CmIdHandle, qp: QpHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        if !t.qps.contains_key(&qp.0) {
            return Err(FabricError::InvalidHandle {
                kind: "qp",
                id: qp.0,
            });
        }
        let entry = t.ids.get_mut(&id.0).ok_or(FabricError::InvalidHandle {
            kind: "cm id",
            id: id.0,
        })?;
        entry.qp = Some(qp.0);
        Ok(())
    }

    fn remote_endpoint(&self, id: CmIdHandle) -> Result<RemoteEndpoint> {
        let t = &*self.inner.lock().unwrap();
        let entry = t.ids.get(&id.0).ok_or(FabricError::InvalidHandle {
            kind: "cm id",
            id: id.0,
        })?;
        let peer = entry.peer.ok_or(FabricError::NotConnected { id: id.0 })?;
        let peer_qp = t
            .ids
            .get(&peer)
            .and_then(|p| p.qp)
            .ok_or(FabricError::NotConnected { id: id.0 })?;
        Ok(RemoteEndpoint {
            remote_qpn: peer_qp as u32,
            path_mtu: 4096,
        })
    }

    fn connect(&self, id: CmIdHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let (target, my_sink) = {
            let entry = t.ids.get(&id.0).ok_or(FabricError::InvalidHandle {
                kind: "cm id",
                id: id.0,
            })?;
            let target = entry
                .target
                .clone()
                .ok_or(FabricError::NotConnected { id: id.0 })?;
            (target, entry.events.clone())
        };

        let listener_sink = t
            .listeners
            .get(&target)
            .and_then(|lid| t.ids.get(lid))
            .map(|l| l.events.clone());
        let Some(listener_sink) = listener_sink else {
            // Connection-refused equivalent: nobody listening there.
            let _ = my_sink.send(CmEvent::Rejected { id });
            return Ok(());
        };

        let sid = self.next();
        t.ids.insert(
            sid,
            CmIdEntry {
                events: listener_sink.clone(),
                target: None,
                listen_addr: None,
                qp: None,
                peer: Some(id.0),
                connected: false,
            },
        );
        if let Some(entry) = t.ids.get_mut(&id.0) {
            entry.peer = Some(sid);
        }
        let _ = listener_sink.send(CmEvent::ConnectRequest {
            id: CmIdHandle(sid),
        });
        Ok(())
    }

    fn accept(&self, id: CmIdHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let (my_qp, peer_id, my_sink) = {
            let entry = t.ids.get(&id.0).ok_or(FabricError::InvalidHandle {
                kind: "cm id",
                id: id.0,
            })?;
            let qp = entry.qp.ok_or(FabricError::NotConnected { id: id.0 })?;
            let peer = entry.peer.ok_or(FabricError::NotConnected { id: id.0 })?;
            (qp, peer, entry.events.clone())
        };
        let (peer_qp, peer_sink) = {
            let peer = t
                .ids
                .get(&peer_id)
                .ok_or(FabricError::NotConnected { id: id.0 })?;
            let qp = peer.qp.ok_or(FabricError::NotConnected { id: peer_id })?;
            (qp, peer.events.clone())
        };

        if let Some(q) = t.qps.get_mut(&my_qp) {
            q.remote_qp = Some(peer_qp);
        }
        if let Some(q) = t.qps.get_mut(&peer_qp) {
            q.remote_qp = Some(my_qp);
        }
        if let Some(e) = t.ids.get_mut(&id.0) {
            e.connected = true;
        }
        if let Some(e) = t.ids.get_mut(&peer_id) {
            e.connected = true;
        }

        let _ = my_sink.send(CmEvent::Established { id });
        let _ = peer_sink.send(CmEvent::Established {
            id: CmIdHandle(peer_id),
        });
        Ok(())
    }

    fn reject(&self, id: CmIdHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let peer_id = {
            let entry = t.ids.get_mut(&id.0).ok_or(FabricError::InvalidHandle {
                kind: "cm id",
                id: id.0,
            })?;
            entry.peer.take()
        };
        if let Some(peer_id) = peer_id {
            if let Some(peer) = t.ids.get_mut(&peer_id) {
                peer.peer = None;
                let _ = peer.events.send(CmEvent::Rejected {
                    id: CmIdHandle(peer_id),
                });
            }
        }
        Ok(())
    }

    fn disconnect(&self, id: CmIdHandle) -> Result<()> {
        let t = &mut *self.inner.lock().unwrap();
        let (was_connected, my_qp, peer_id) = {
            let entry = t.ids.get_mut(&id.0).ok_or(FabricError::InvalidHandle {
                kind: "cm id",
                id: id.0,
            })?;
            let was = entry.connected;
            entry.connected = false;
            (was, entry.qp, entry.peer.take())
        };
        if let Some(qp) = my_qp {
            if let Some(q) = t.qps.get_mut(&qp) {
                q.remote_qp = None;
            }
        }
        if let Some(peer_id) = peer_id {
            let mut notify = None;
            if let Some(peer) = t.ids.get_mut(&peer_id) {
                peer.peer = None;
                peer.connected = false;
                if let Some(pqp) = peer.qp {
                    notify = Some((peer.events.clone(), pqp));
                } else if was_connected {
                    let _ = peer.events.send(CmEvent::Disconnected {
                        id: CmIdHandle(peer_id),
                    });
                }
            }
            if let Some((sink, pqp)) = notify {
                if let Some(q) = t.qps.get_mut(&pqp) {
                    q.remote_qp = None;
                }
                if was_connected {
                    let _ = sink.send(CmEvent::Disconnected {
                        id: CmIdHandle(peer_id),
                    });
                }
            }
        }
        Ok(())
    }

    fn destroy_id(&self, id: CmIdHandle) -> Result<()> {
        // A still-connected id is disconnected first so the peer always
        // observes the teardown.
        let connected = {
            let t = &*self.inner.lock().unwrap();
            t.ids
                .get(&id.0)
                .ok_or(FabricError::InvalidHandle {
                    kind: "cm id",
                    id: id.0,
                })?
                .connected
        };
        if connected {
            self.disconnect(id)?;
        }
        let t = &mut *self.inner.lock().unwrap();
        if let Some(entry) = t.ids.remove(&id.0) {
            if let Some(addr) = entry.listen_addr {
                t.listeners.remove(&addr);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::sync::mpsc;

    fn sink() -> (NotifySink, mpsc::UnboundedReceiver<CompChannelHandle>) {
        mpsc::unbounded_channel()
    }

    fn basic_resources(fabric: &SimFabric) -> (PdHandle, CompChannelHandle, CqHandle, QpHandle) {
        let (tx, _rx) = sink();
        let pd = fabric.alloc_pd().unwrap();
        let ch = fabric.create_comp_channel(tx).unwrap();
        let cq = fabric.create_cq(10, ch).unwrap();
        let qp = fabric.create_qp(pd, cq, QpCaps::default()).unwrap();
        (pd, ch, cq, qp)
    }

    fn bring_up(fabric: &SimFabric, qp: QpHandle) {
        fabric.modify_qp_init(qp).unwrap();
        fabric
            .modify_qp_rtr(
                qp,
                RemoteEndpoint {
                    remote_qpn: 1,
                    path_mtu: 4096,
                },
            )
            .unwrap();
        fabric.modify_qp_rts(qp).unwrap();
    }

    #[test]
    fn test_alloc_release_accounting() {
        let fabric = SimFabric::new();
        let (pd, ch, cq, qp) = basic_resources(&fabric);
        let mr = fabric.reg_mr(pd, 64, AccessFlags::ALL).unwrap();

        fabric.dereg_mr(mr).unwrap();
        fabric.destroy_qp(qp).unwrap();
        fabric.destroy_cq(cq).unwrap();
        fabric.destroy_comp_channel(ch).unwrap();
        fabric.dealloc_pd(pd).unwrap();

        let stats = fabric.stats();
        assert!(stats.balanced());
        assert_eq!(stats.pds_allocated, 1);
        assert_eq!(stats.qps_created, 1);
    }

    #[test]
    fn test_double_free_detected() {
        let fabric = SimFabric::new();
        let pd = fabric.alloc_pd().unwrap();
        fabric.dealloc_pd(pd).unwrap();
        assert!(matches!(
            fabric.dealloc_pd(pd),
            Err(FabricError::InvalidHandle { kind: "pd", .. })
        ));
        assert_eq!(fabric.stats().pds_released, 1);
    }

    #[test]
    fn test_release_while_referenced_fails() {
        let fabric = SimFabric::new();
        let (pd, ch, cq, qp) = basic_resources(&fabric);
        assert!(matches!(
            fabric.dealloc_pd(pd),
            Err(FabricError::ResourceBusy { .. })
        ));
        assert!(matches!(
            fabric.destroy_cq(cq),
            Err(FabricError::ResourceBusy { .. })
        ));
        assert!(matches!(
            fabric.destroy_comp_channel(ch),
            Err(FabricError::ResourceBusy { .. })
        ));
        fabric.destroy_qp(qp).unwrap();
        fabric.destroy_cq(cq).unwrap();
        fabric.destroy_comp_channel(ch).unwrap();
        fabric.dealloc_pd(pd).unwrap();
    }

    #[test]
    fn test_fault_injection_one_shot() {
        let fabric = SimFabric::new();
        fabric.fail_next_alloc(ResourceKind::Cq);
        let (tx, _rx) = sink();
        let ch = fabric.create_comp_channel(tx).unwrap();
        assert!(matches!(
            fabric.create_cq(10, ch),
            Err(FabricError::InjectedFault {
                kind: ResourceKind::Cq
            })
        ));
        // Only the next allocation fails.
        fabric.create_cq(10, ch).unwrap();
    }

    #[test]
    fn test_qp_transition_order_enforced() {
        let fabric = SimFabric::new();
        let (_pd, _ch, _cq, qp) = basic_resources(&fabric);
        let remote = RemoteEndpoint {
            remote_qpn: 7,
            path_mtu: 4096,
        };
        assert!(fabric.modify_qp_rtr(qp, remote).is_err());
        assert!(fabric.modify_qp_rts(qp).is_err());
        fabric.modify_qp_init(qp).unwrap();
        assert!(fabric.modify_qp_init(qp).is_err());
        fabric.modify_qp_rtr(qp, remote).unwrap();
        fabric.modify_qp_rts(qp).unwrap();
    }

    #[test]
    fn test_post_recv_requires_init() {
        let fabric = SimFabric::new();
        let (pd, _ch, _cq, qp) = basic_resources(&fabric);
        let mr = fabric.reg_mr(pd, 64, AccessFlags::ALL).unwrap();
        let desc = WorkDescriptor {
            tag: CompletionTag(1),
            mr,
            len: 64,
        };
        assert!(matches!(
            fabric.post_recv(qp, desc),
            Err(FabricError::InvalidQpState { .. })
        ));
        fabric.modify_qp_init(qp).unwrap();
        fabric.post_recv(qp, desc).unwrap();
        assert_eq!(fabric.stats().recvs_posted, 1);
    }

    #[test]
    fn test_send_without_posted_receive_fails_completion() {
        let fabric = SimFabric::new();
        let (pd_a, _ch_a, cq_a, qp_a) = basic_resources(&fabric);
        let (_pd_b, _ch_b, _cq_b, qp_b) = basic_resources(&fabric);
        bring_up(&fabric, qp_a);
        bring_up(&fabric, qp_b);
        // Link manually, bypassing the cm.
        {
            let t = &mut *fabric.inner.lock().unwrap();
            t.qps.get_mut(&qp_a.0).unwrap().remote_qp = Some(qp_b.0);
            t.qps.get_mut(&qp_b.0).unwrap().remote_qp = Some(qp_a.0);
        }
        let mr = fabric.reg_mr(pd_a, 16, AccessFlags::ALL).unwrap();
        fabric
            .post_send(
                qp_a,
                WorkDescriptor {
                    tag: CompletionTag(9),
                    mr,
                    len: 16,
                },
            )
            .unwrap();
        let wcs = fabric.poll_cq(cq_a, 16).unwrap();
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].status, WcStatus::RemoteError);
        assert_eq!(wcs[0].tag, CompletionTag(9));
        assert_eq!(fabric.stats().sends_failed, 1);
    }

    #[test]
    fn test_armed_cq_notifies_once() {
        let fabric = SimFabric::new();
        let (tx, mut rx) = sink();
        let pd_a = fabric.alloc_pd().unwrap();
        let ch = fabric.create_comp_channel(tx).unwrap();
        let cq = fabric.create_cq(10, ch).unwrap();
        let qp_a = fabric.create_qp(pd_a, cq, QpCaps::default()).unwrap();
        let (pd_b, _ch_b, _cq_b, qp_b) = basic_resources(&fabric);
        bring_up(&fabric, qp_a);
        bring_up(&fabric, qp_b);
        {
            let t = &mut *fabric.inner.lock().unwrap();
            t.qps.get_mut(&qp_a.0).unwrap().remote_qp = Some(qp_b.0);
            t.qps.get_mut(&qp_b.0).unwrap().remote_qp = Some(qp_a.0);
        }
        let send_mr = fabric.reg_mr(pd_a, 16, AccessFlags::ALL).unwrap();
        let recv_mr = fabric.reg_mr(pd_b, 16, AccessFlags::ALL).unwrap();
        fabric
            .post_recv(
                qp_b,
                WorkDescriptor {
                    tag: CompletionTag(1),
                    mr: recv_mr,
                    len: 16,
                },
            )
            .unwrap();

        // Disarmed: completion lands silently.
        fabric
            .post_send(
                qp_a,
                WorkDescriptor {
                    tag: CompletionTag(2),
                    mr: send_mr,
                    len: 16,
                },
            )
            .unwrap();
        assert!(rx.try_recv().is_err());

        // Armed: exactly one notification for the next completion.
        fabric.arm_cq(cq).unwrap();
        fabric
            .post_recv(
                qp_b,
                WorkDescriptor {
                    tag: CompletionTag(3),
                    mr: recv_mr,
                    len: 16,
                },
            )
            .unwrap();
        fabric
            .post_send(
                qp_a,
                WorkDescriptor {
                    tag: CompletionTag(4),
                    mr: send_mr,
                    len: 16,
                },
            )
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), ch);
        assert!(rx.try_recv().is_err());
        assert_eq!(fabric.poll_cq(cq, 16).unwrap().len(), 2);
    }

    #[test]
    fn test_listen_address_in_use() {
        let fabric = SimFabric::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        fabric.listen("10.0.0.1:20079", tx.clone()).unwrap();
        assert!(matches!(
            fabric.listen("10.0.0.1:20079", tx),
            Err(FabricError::AddressInUse { .. })
        ));
    }

    #[test]
    fn test_connect_without_listener_rejected() {
        let fabric = SimFabric::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = fabric.resolve("10.0.0.9:1", tx).unwrap();
        assert_eq!(rx.try_recv().unwrap(), CmEvent::AddrResolved { id });
        assert_eq!(rx.try_recv().unwrap(), CmEvent::RouteResolved { id });
        fabric.connect(id).unwrap();
        assert_eq!(rx.try_recv().unwrap(), CmEvent::Rejected { id });
    }

    #[test]
    fn test_accept_establishes_both_sides() {
        let fabric = SimFabric::new();
        let (srv_tx, mut srv_rx) = mpsc::unbounded_channel();
        let (cli_tx, mut cli_rx) = mpsc::unbounded_channel();
        fabric.listen("addr", srv_tx).unwrap();
        let cli = fabric.resolve("addr", cli_tx).unwrap();
        let _ = cli_rx.try_recv();
        let _ = cli_rx.try_recv();

        let (_pd, _ch, _cq, cli_qp) = basic_resources(&fabric);
        fabric.bind_qp(cli, cli_qp).unwrap();
        fabric.connect(cli).unwrap();

        let srv = match srv_rx.try_recv().unwrap() {
            CmEvent::ConnectRequest { id } => id,
            other => panic!("unexpected event {other:?}"),
        };
        let (_pd2, _ch2, _cq2, srv_qp) = basic_resources(&fabric);
        fabric.bind_qp(srv, srv_qp).unwrap();
        // Passive side can see the requester's qp before accepting.
        let remote = fabric.remote_endpoint(srv).unwrap();
        assert_eq!(remote.remote_qpn, cli_qp.0 as u32);

        fabric.accept(srv).unwrap();
        assert_eq!(srv_rx.try_recv().unwrap(), CmEvent::Established { id: srv });
        assert_eq!(cli_rx.try_recv().unwrap(), CmEvent::Established { id: cli });

        // Disconnect is delivered to the peer exactly once.
        fabric.disconnect(cli).unwrap();
        assert_eq!(
            srv_rx.try_recv().unwrap(),
            CmEvent::Disconnected { id: srv }
        );
        fabric.disconnect(srv).unwrap();
        assert!(cli_rx.try_recv().is_err());
    }

    #[test]
    fn test_inject_completion_error() {
        let fabric = SimFabric::new();
        let (_pd, _ch, cq, qp) = basic_resources(&fabric);
        fabric.inject_completion_error(qp).unwrap();
        let wcs = fabric.poll_cq(cq, 16).unwrap();
        assert_eq!(wcs.len(), 1);
        assert!(wcs[0].status.is_error());
    }

    proptest! {
        #[test]
        fn test_mr_access_stays_in_bounds(
            capacity in 1usize..512,
            offset in 0usize..1024,
            len in 0usize..1024,
        ) {
            let fabric = SimFabric::new();
            let pd = fabric.alloc_pd().unwrap();
            let mr = fabric.reg_mr(pd, capacity, AccessFlags::ALL).unwrap();
            let data = vec![0xABu8; len];
            let write = fabric.write_mr(mr, offset, &data);
            let read = fabric.read_mr(mr, offset, len);
            let fits = offset.saturating_add(len) <= capacity;
            prop_assert_eq!(write.is_ok(), fits);
            prop_assert_eq!(read.is_ok(), fits);
        }
    }
}
