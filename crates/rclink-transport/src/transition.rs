//! Queue-pair bring-up through the mandatory state sequence.
//!
//! The three phases are a wire-level contract of the fabric: they happen in
//! fixed order, each is all-or-nothing, and a failed phase leaves the queue
//! pair unusable. The distinct error variant keeps transition failures on
//! the connection-teardown path rather than the completion-error path.

use rclink_fabric::types::{QpHandle, RemoteEndpoint};
use rclink_fabric::verbs::Fabric;

use crate::error::{Result, TransportError};

/// The three ordered bring-up phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPhase {
    /// Reset to initialized.
    Init,
    /// Initialized to ready-to-receive, binding the remote endpoint.
    ReadyToReceive,
    /// Ready-to-receive to ready-to-send.
    ReadyToSend,
}

/// Drive a freshly created queue pair to the transmit/receive-capable state.
pub fn bring_up<F: Fabric + ?Sized>(
    fabric: &F,
    qp: QpHandle,
    remote: RemoteEndpoint,
) -> Result<()> {
    fabric
        .modify_qp_init(qp)
        .map_err(|source| TransportError::Transition {
            phase: TransitionPhase::Init,
            source,
        })?;
    fabric
        .modify_qp_rtr(qp, remote)
        .map_err(|source| TransportError::Transition {
            phase: TransitionPhase::ReadyToReceive,
            source,
        })?;
    fabric
        .modify_qp_rts(qp)
        .map_err(|source| TransportError::Transition {
            phase: TransitionPhase::ReadyToSend,
            source,
        })?;
    Ok(())
}
