//! The verbs-like fabric contract consumed by the transport core.

use tokio::sync::mpsc::UnboundedSender;

use crate::completion::{WorkCompletion, WorkDescriptor};
use crate::error::Result;
use crate::types::{
    AccessFlags, CompChannelHandle, CqHandle, MrHandle, PdHandle, QpCaps, QpHandle, RemoteEndpoint,
};

/// Sink a completion channel delivers its notifications into. Several
/// channels owned by one consumer may share a sink; the delivered handle
/// identifies which channel fired.
pub type NotifySink = UnboundedSender<CompChannelHandle>;

/// Handle-based fabric operations with success/failure outcomes.
///
/// Arming semantics: an armed completion queue delivers exactly one
/// notification (its channel handle, into the channel's sink) when the next
/// completion is appended, then disarms. Completions appended while the
/// queue is disarmed are silent; consumers must re-arm before their final
/// drain pass or they can miss a wakeup.
pub trait Fabric: Send + Sync {
    fn alloc_pd(&self) -> Result<PdHandle>;
    fn dealloc_pd(&self, pd: PdHandle) -> Result<()>;

    fn create_comp_channel(&self, notify: NotifySink) -> Result<CompChannelHandle>;
    fn destroy_comp_channel(&self, channel: CompChannelHandle) -> Result<()>;

    fn create_cq(&self, depth: usize, channel: CompChannelHandle) -> Result<CqHandle>;
    fn destroy_cq(&self, cq: CqHandle) -> Result<()>;

    fn create_qp(&self, pd: PdHandle, cq: CqHandle, caps: QpCaps) -> Result<QpHandle>;
    fn destroy_qp(&self, qp: QpHandle) -> Result<()>;

    fn reg_mr(&self, pd: PdHandle, len: usize, access: AccessFlags) -> Result<MrHandle>;
    fn dereg_mr(&self, mr: MrHandle) -> Result<()>;

    /// Local processor write into a registered buffer.
    fn write_mr(&self, mr: MrHandle, offset: usize, data: &[u8]) -> Result<()>;
    /// Local processor read out of a registered buffer.
    fn read_mr(&self, mr: MrHandle, offset: usize, len: usize) -> Result<Vec<u8>>;

    /// Transition phase one: reset to initialized.
    fn modify_qp_init(&self, qp: QpHandle) -> Result<()>;
    /// Transition phase two: initialized to ready-to-receive, binding the
    /// negotiated remote endpoint parameters.
    fn modify_qp_rtr(&self, qp: QpHandle, remote: RemoteEndpoint) -> Result<()>;
    /// Transition phase three: ready-to-receive to ready-to-send.
    fn modify_qp_rts(&self, qp: QpHandle) -> Result<()>;

    fn post_recv(&self, qp: QpHandle, desc: WorkDescriptor) -> Result<()>;
    fn post_send(&self, qp: QpHandle, desc: WorkDescriptor) -> Result<()>;

    /// Drain up to `max` completions from the queue; an empty vec means the
    /// queue currently reports empty.
    fn poll_cq(&self, cq: CqHandle, max: usize) -> Result<Vec<WorkCompletion>>;
    /// Request one notification for the next completion appended.
    fn arm_cq(&self, cq: CqHandle) -> Result<()>;
}
