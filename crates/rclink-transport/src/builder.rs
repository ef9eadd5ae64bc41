//! Per-connection fabric resource set: atomic acquisition, ordered release.
//!
//! The set is acquired as a unit. If any allocation fails, everything
//! acquired so far is released in reverse order before the error surfaces,
//! so a partial set can never be registered with the multiplexer.

use tracing::warn;

use rclink_fabric::types::{
    AccessFlags, CompChannelHandle, CqHandle, MrHandle, PdHandle, QpCaps, QpHandle,
};
use rclink_fabric::verbs::{Fabric, NotifySink};

use crate::error::Result;

/// The complete resource set backing one connection. Populated only by
/// [`ConnResources::build`], so holding one implies every handle is live.
#[derive(Debug, Clone, Copy)]
pub struct ConnResources {
    /// Protection domain scoping every other resource.
    pub pd: PdHandle,
    /// Completion notification channel feeding the multiplexer.
    pub channel: CompChannelHandle,
    /// Completion queue shared by both work directions.
    pub cq: CqHandle,
    /// The reliable-connection queue pair.
    pub qp: QpHandle,
    /// Registered receive buffer.
    pub recv_mr: MrHandle,
    /// Registered send buffer.
    pub send_mr: MrHandle,
}

#[derive(Default)]
struct Partial {
    pd: Option<PdHandle>,
    channel: Option<CompChannelHandle>,
    cq: Option<CqHandle>,
    qp: Option<QpHandle>,
    recv_mr: Option<MrHandle>,
    send_mr: Option<MrHandle>,
}

impl Partial {
    /// Release whatever was acquired, newest first.
    fn abort<F: Fabric + ?Sized>(self, fabric: &F) {
        if let Some(mr) = self.send_mr {
            log_release(fabric.dereg_mr(mr), "send mr");
        }
        if let Some(mr) = self.recv_mr {
            log_release(fabric.dereg_mr(mr), "recv mr");
        }
        if let Some(qp) = self.qp {
            log_release(fabric.destroy_qp(qp), "qp");
        }
        if let Some(cq) = self.cq {
            log_release(fabric.destroy_cq(cq), "cq");
        }
        if let Some(channel) = self.channel {
            log_release(fabric.destroy_comp_channel(channel), "comp channel");
        }
        if let Some(pd) = self.pd {
            log_release(fabric.dealloc_pd(pd), "pd");
        }
    }
}

fn log_release(result: rclink_fabric::error::Result<()>, what: &'static str) {
    if let Err(error) = result {
        warn!(%error, what, "resource release failed");
    }
}

impl ConnResources {
    /// Acquire the full set: protection domain, notification channel,
    /// completion queue (armed), queue pair, and the two registered
    /// buffers. Rolls back and returns the first error on any failure.
    pub fn build<F: Fabric + ?Sized>(
        fabric: &F,
        notify: NotifySink,
        buffer_size: usize,
        cq_depth: usize,
        queue_depth: u32,
    ) -> Result<Self> {
        let mut partial = Partial::default();
        match Self::try_build(
            fabric,
            notify,
            buffer_size,
            cq_depth,
            queue_depth,
            &mut partial,
        ) {
            Ok(resources) => Ok(resources),
            Err(err) => {
                partial.abort(fabric);
                Err(err)
            }
        }
    }

    fn try_build<F: Fabric + ?Sized>(
        fabric: &F,
        notify: NotifySink,
        buffer_size: usize,
        cq_depth: usize,
        queue_depth: u32,
        partial: &mut Partial,
    ) -> Result<Self> {
        let pd = fabric.alloc_pd()?;
        partial.pd = Some(pd);

        let channel = fabric.create_comp_channel(notify)?;
        partial.channel = Some(channel);

        let cq = fabric.create_cq(cq_depth, channel)?;
        partial.cq = Some(cq);
        // Request notification before any work can complete.
        fabric.arm_cq(cq)?;

        let caps = QpCaps {
            max_send_wr: queue_depth,
            max_recv_wr: queue_depth,
            max_send_sge: 1,
            max_recv_sge: 1,
        };
        let qp = fabric.create_qp(pd, cq, caps)?;
        partial.qp = Some(qp);

        let access = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        let recv_mr = fabric.reg_mr(pd, buffer_size, access)?;
        partial.recv_mr = Some(recv_mr);
        let send_mr = fabric.reg_mr(pd, buffer_size, access)?;
        partial.send_mr = Some(send_mr);

        Ok(Self {
            pd,
            channel,
            cq,
            qp,
            recv_mr,
            send_mr,
        })
    }

    /// Release the set in reverse acquisition order. Individual failures
    /// are logged and do not stop the remaining releases.
    pub fn release<F: Fabric + ?Sized>(self, fabric: &F) {
        log_release(fabric.dereg_mr(self.send_mr), "send mr");
        log_release(fabric.dereg_mr(self.recv_mr), "recv mr");
        log_release(fabric.destroy_qp(self.qp), "qp");
        log_release(fabric.destroy_cq(self.cq), "cq");
        log_release(fabric.destroy_comp_channel(self.channel), "comp channel");
        log_release(fabric.dealloc_pd(self.pd), "pd");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rclink_fabric::sim::SimFabric;
    use rclink_fabric::types::ResourceKind;
    use tokio::sync::mpsc;

    fn build_on(fabric: &SimFabric) -> Result<ConnResources> {
        let (tx, _rx) = mpsc::unbounded_channel();
        ConnResources::build(fabric, tx, 1024, 10, 10)
    }

    #[test]
    fn test_build_then_release_is_balanced() {
        let fabric = SimFabric::new();
        let resources = build_on(&fabric).unwrap();
        resources.release(&fabric);
        let stats = fabric.stats();
        assert!(stats.balanced());
        assert_eq!(stats.pds_allocated, 1);
        assert_eq!(stats.cqs_created, 1);
        assert_eq!(stats.qps_created, 1);
        assert_eq!(stats.mrs_registered, 2);
    }

    #[test]
    fn test_partial_failure_rolls_back_everything() {
        for kind in [
            ResourceKind::Pd,
            ResourceKind::CompChannel,
            ResourceKind::Cq,
            ResourceKind::Qp,
            ResourceKind::Mr,
        ] {
            let fabric = SimFabric::new();
            fabric.fail_next_alloc(kind);
            assert!(build_on(&fabric).is_err(), "{kind:?} fault not surfaced");
            assert!(
                fabric.stats().balanced(),
                "rollback leaked after {kind:?} fault"
            );
        }
    }

    #[test]
    fn test_no_resources_survive_a_qp_fault() {
        let fabric = SimFabric::new();
        fabric.fail_next_alloc(ResourceKind::Qp);
        assert!(build_on(&fabric).is_err());
        let stats = fabric.stats();
        assert_eq!(stats.pds_allocated, stats.pds_released);
        assert_eq!(stats.cqs_created, stats.cqs_destroyed);
        assert_eq!(stats.mrs_registered, 0);
    }
}
