//! Blocking-style echo client used by the demo binary and the integration
//! tests. One outstanding request at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use rclink_fabric::cm::{CmEvent, CmIdHandle, Provider};
use rclink_fabric::completion::{CompletionTag, WcOpcode, WorkCompletion, WorkDescriptor};
use rclink_fabric::types::{CompChannelHandle, QpHandle};

use crate::builder::ConnResources;
use crate::config::ClientConfig;
use crate::error::{Result, TransportError};
use crate::transition;

/// An established client connection.
pub struct ClientConnection<P: Provider + 'static> {
    provider: Arc<P>,
    config: ClientConfig,
    id: CmIdHandle,
    resources: Option<ConnResources>,
    cm_rx: mpsc::UnboundedReceiver<CmEvent>,
    notify_rx: mpsc::UnboundedReceiver<CompChannelHandle>,
}

/// Resolve, connect, and bring the connection to the traffic-ready state.
pub async fn connect<P: Provider + 'static>(
    provider: Arc<P>,
    addr: &str,
    config: ClientConfig,
) -> Result<ClientConnection<P>> {
    let (cm_tx, mut cm_rx) = mpsc::unbounded_channel();
    let (notify_tx, notify_rx) = mpsc::unbounded_channel();

    let id = provider.resolve(addr, cm_tx)?;
    next_event(&mut cm_rx, config.response_timeout)
        .await
        .and_then(require(|e| matches!(e, CmEvent::AddrResolved { .. })))?;
    next_event(&mut cm_rx, config.response_timeout)
        .await
        .and_then(require(|e| matches!(e, CmEvent::RouteResolved { .. })))?;

    let resources = ConnResources::build(
        provider.as_ref(),
        notify_tx,
        config.buffer_size,
        config.cq_depth,
        config.queue_depth,
    )?;

    match establish(provider.as_ref(), id, &resources, addr, &config, &mut cm_rx).await {
        Ok(()) => Ok(ClientConnection {
            provider,
            config,
            id,
            resources: Some(resources),
            cm_rx,
            notify_rx,
        }),
        Err(err) => {
            resources.release(provider.as_ref());
            if let Err(error) = provider.destroy_id(id) {
                debug!(id = id.0, %error, "destroy_id after failed connect");
            }
            Err(err)
        }
    }
}

async fn establish<P: Provider>(
    provider: &P,
    id: CmIdHandle,
    resources: &ConnResources,
    addr: &str,
    config: &ClientConfig,
    cm_rx: &mut mpsc::UnboundedReceiver<CmEvent>,
) -> Result<()> {
    provider.bind_qp(id, resources.qp)?;
    provider.connect(id)?;
    match next_event(cm_rx, config.response_timeout).await? {
        CmEvent::Established { .. } => {}
        CmEvent::Rejected { .. } => {
            return Err(TransportError::Rejected {
                addr: addr.to_string(),
            });
        }
        other => {
            return Err(TransportError::ControlPlane {
                reason: format!("unexpected event while connecting: {other:?}"),
            });
        }
    }
    let remote = provider.remote_endpoint(id)?;
    transition::bring_up(provider, resources.qp, remote)?;
    Ok(())
}

async fn next_event(
    cm_rx: &mut mpsc::UnboundedReceiver<CmEvent>,
    timeout: Duration,
) -> Result<CmEvent> {
    match tokio::time::timeout(timeout, cm_rx.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(TransportError::Closed),
        Err(_) => Err(TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

fn require(want: fn(&CmEvent) -> bool) -> impl Fn(CmEvent) -> Result<CmEvent> {
    move |event| {
        if want(&event) {
            Ok(event)
        } else {
            Err(TransportError::ControlPlane {
                reason: format!("unexpected event: {event:?}"),
            })
        }
    }
}

impl<P: Provider + 'static> ClientConnection<P> {
    /// Connection-manager identity of this connection.
    pub fn id(&self) -> CmIdHandle {
        self.id
    }

    /// Local queue pair, if the connection is still open.
    pub fn qp(&self) -> Result<QpHandle> {
        Ok(self.live()?.qp)
    }

    fn live(&self) -> Result<&ConnResources> {
        self.resources.as_ref().ok_or(TransportError::Closed)
    }

    /// Send `msg` and wait for the echoed reply.
    pub async fn request(&mut self, msg: &[u8]) -> Result<Bytes> {
        let resources = *self.live()?;
        if msg.len() > self.config.buffer_size {
            return Err(TransportError::MessageTooLarge {
                len: msg.len(),
                max: self.config.buffer_size,
            });
        }
        let provider = Arc::clone(&self.provider);
        // Post the reply buffer before the send leaves.
        provider.post_recv(resources.qp, self.recv_desc(&resources))?;
        provider.write_mr(resources.send_mr, 0, msg)?;
        provider.post_send(
            resources.qp,
            WorkDescriptor {
                tag: CompletionTag(self.id.0),
                mr: resources.send_mr,
                len: msg.len() as u32,
            },
        )?;

        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            let completions = provider.poll_cq(resources.cq, self.config.poll_batch)?;
            if completions.is_empty() {
                provider.arm_cq(resources.cq)?;
                // A completion may have landed between the empty poll and
                // the arm; it will not notify, so look once more.
                let completions = provider.poll_cq(resources.cq, self.config.poll_batch)?;
                if completions.is_empty() {
                    self.await_notify(deadline).await?;
                    continue;
                }
                if let Some(reply) = self.consume(&resources, completions)? {
                    return Ok(reply);
                }
                continue;
            }
            if let Some(reply) = self.consume(&resources, completions)? {
                return Ok(reply);
            }
        }
    }

    fn recv_desc(&self, resources: &ConnResources) -> WorkDescriptor {
        WorkDescriptor {
            tag: CompletionTag(self.id.0),
            mr: resources.recv_mr,
            len: self.config.buffer_size as u32,
        }
    }

    fn consume(
        &self,
        resources: &ConnResources,
        completions: Vec<WorkCompletion>,
    ) -> Result<Option<Bytes>> {
        let mut reply = None;
        for wc in completions {
            if wc.status.is_error() {
                return Err(TransportError::CompletionFailed { status: wc.status });
            }
            if wc.opcode == WcOpcode::Recv {
                let data = self
                    .provider
                    .read_mr(resources.recv_mr, 0, wc.byte_len as usize)?;
                reply = Some(Bytes::from(data));
            }
        }
        Ok(reply)
    }

    async fn await_notify(&mut self, deadline: Instant) -> Result<()> {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(TransportError::Timeout {
                timeout_ms: self.config.response_timeout.as_millis() as u64,
            })?;
        match tokio::time::timeout(remaining, self.notify_rx.recv()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout {
                timeout_ms: self.config.response_timeout.as_millis() as u64,
            }),
        }
    }

    /// Disconnect and release everything. Further calls return `Closed`.
    pub fn disconnect(&mut self) -> Result<()> {
        let resources = self.resources.take().ok_or(TransportError::Closed)?;
        let provider = self.provider.as_ref();
        if let Err(error) = provider.disconnect(self.id) {
            debug!(id = self.id.0, %error, "disconnect");
        }
        resources.release(provider);
        provider.destroy_id(self.id)?;
        // Drain whatever the manager still had queued for us.
        while self.cm_rx.try_recv().is_ok() {}
        Ok(())
    }
}

impl<P: Provider + 'static> Drop for ClientConnection<P> {
    fn drop(&mut self) {
        if self.resources.is_some() {
            let _ = self.disconnect();
        }
    }
}
