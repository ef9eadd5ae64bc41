//! Completion draining and the echo data path.

use tracing::{debug, trace};

use rclink_fabric::completion::{WcOpcode, WcStatus};
use rclink_fabric::verbs::Fabric;

use crate::conn::Connection;
use crate::error::Result;

/// What a drain pass concluded about the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// All drained completions succeeded.
    Progress {
        /// Completions handled this pass.
        handled: usize,
    },
    /// A completion carried an error status; the connection is dead.
    Fatal {
        /// The failing status.
        status: WcStatus,
    },
}

/// Drain the connection's completion queue after a notification.
///
/// The notification that led here consumed the arming, so the queue must be
/// re-armed before the final empty poll: a completion landing between the
/// last non-empty poll and the re-arm would otherwise never notify again.
pub fn drain<F: Fabric + ?Sized>(
    fabric: &F,
    conn: &mut Connection,
    batch: usize,
) -> Result<PollOutcome> {
    let mut handled = 0;
    let mut rearmed = false;
    loop {
        let completions = fabric.poll_cq(conn.cq, batch)?;
        if completions.is_empty() {
            if rearmed {
                return Ok(PollOutcome::Progress { handled });
            }
            fabric.arm_cq(conn.cq)?;
            rearmed = true;
            continue;
        }
        for wc in completions {
            if wc.status.is_error() {
                debug!(id = conn.id.0, status = ?wc.status, opcode = ?wc.opcode,
                       "completion error");
                return Ok(PollOutcome::Fatal { status: wc.status });
            }
            match wc.opcode {
                WcOpcode::Recv => echo(fabric, conn, wc.byte_len)?,
                WcOpcode::Send => {
                    conn.echoed += 1;
                    trace!(id = conn.id.0, echoed = conn.echoed, "echo confirmed");
                }
            }
            handled += 1;
        }
    }
}

/// Copy the received message into the send buffer and send it back.
///
/// The replacement receive is posted before the send so the peer can never
/// find the receive queue empty, whatever order it acts on our reply.
///
/// Overwriting the send buffer here relies on the single standing receive:
/// the next message cannot arrive until the peer has taken delivery of the
/// previous echo, so the prior send's completion has been reported by the
/// time another Recv completion shows up.
fn echo<F: Fabric + ?Sized>(fabric: &F, conn: &mut Connection, byte_len: u32) -> Result<()> {
    let msg = fabric.read_mr(conn.recv_mr, 0, byte_len as usize)?;
    fabric.write_mr(conn.send_mr, 0, &msg)?;
    conn.post_receive(fabric)?;
    fabric.post_send(conn.qp, conn.send_desc(byte_len))?;
    trace!(id = conn.id.0, bytes = byte_len, "echoing");
    Ok(())
}
