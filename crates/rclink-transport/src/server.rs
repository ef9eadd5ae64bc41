//! Echo server: a single reactor task multiplexing connection-manager
//! events and completion notifications across every open connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rclink_fabric::cm::{CmEvent, CmIdHandle, Provider};
use rclink_fabric::types::CompChannelHandle;
use rclink_fabric::verbs::NotifySink;

use crate::builder::ConnResources;
use crate::config::ServerConfig;
use crate::conn::Connection;
use crate::error::{Result, TransportError};
use crate::poller::{self, PollOutcome};
use crate::registry::Registry;
use crate::transition;

/// The transport server. Binds the listener synchronously in [`spawn`] so a
/// bind failure surfaces to the caller, then runs the reactor as a task.
///
/// [`spawn`]: Server::spawn
pub struct Server<P: Provider + 'static> {
    provider: Arc<P>,
    config: ServerConfig,
}

/// Running server control surface.
pub struct ServerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
    active: Arc<AtomicUsize>,
}

impl ServerHandle {
    /// Number of currently admitted connections.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the reactor, tearing down every open connection and the
    /// listener, and return its final result.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(true);
        match self.task.await {
            Ok(result) => result,
            Err(join) => Err(TransportError::ControlPlane {
                reason: format!("reactor task failed: {join}"),
            }),
        }
    }
}

impl<P: Provider + 'static> Server<P> {
    /// New server over the given provider.
    pub fn new(provider: Arc<P>, config: ServerConfig) -> Self {
        Self { provider, config }
    }

    /// Bind the listener and start the reactor task.
    pub fn spawn(self) -> Result<ServerHandle> {
        let (cm_tx, cm_rx) = mpsc::unbounded_channel();
        let (comp_tx, comp_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let active = Arc::new(AtomicUsize::new(0));

        let listener = self.provider.listen(&self.config.listen_addr, cm_tx)?;
        info!(addr = %self.config.listen_addr, "listening");

        let reactor = Reactor {
            provider: self.provider,
            registry: Registry::new(self.config.max_connections),
            config: self.config,
            listener,
            cm_rx,
            comp_rx,
            comp_tx,
            stop_rx,
            active: Arc::clone(&active),
        };
        let task = tokio::spawn(reactor.run());

        Ok(ServerHandle {
            stop: stop_tx,
            task,
            active,
        })
    }
}

struct Reactor<P: Provider + 'static> {
    provider: Arc<P>,
    registry: Registry,
    config: ServerConfig,
    listener: CmIdHandle,
    cm_rx: mpsc::UnboundedReceiver<CmEvent>,
    comp_rx: mpsc::UnboundedReceiver<CompChannelHandle>,
    // Held so comp_rx stays open with zero connections, and cloned as the
    // notify sink for every new resource set.
    comp_tx: NotifySink,
    stop_rx: watch::Receiver<bool>,
    active: Arc<AtomicUsize>,
}

impl<P: Provider + 'static> Reactor<P> {
    async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.stop_rx.changed() => {
                    info!("stop requested");
                    self.shutdown_all();
                    return Ok(());
                }
                event = self.cm_rx.recv() => {
                    match event {
                        Some(event) => self.handle_cm_event(event),
                        None => {
                            self.shutdown_all();
                            return Err(TransportError::ControlPlane {
                                reason: "connection manager event channel closed".to_string(),
                            });
                        }
                    }
                }
                channel = self.comp_rx.recv() => {
                    // comp_tx is held by self, so recv cannot return None.
                    if let Some(channel) = channel {
                        self.handle_completion(channel);
                    }
                }
            }
        }
    }

    fn handle_cm_event(&mut self, event: CmEvent) {
        match event {
            CmEvent::ConnectRequest { id } => self.handle_connect_request(id),
            CmEvent::Established { id } => self.handle_established(id),
            CmEvent::Disconnected { id } => {
                info!(id = id.0, "peer disconnected");
                self.teardown(id);
            }
            CmEvent::Rejected { .. } | CmEvent::Error { .. } => {
                let id = event.id();
                if self.registry.contains(id) {
                    warn!(id = id.0, event = ?event, "connection failed");
                    self.teardown(id);
                } else {
                    debug!(id = id.0, event = ?event, "event for unknown id ignored");
                }
            }
            // Resolution events belong to the active side.
            CmEvent::AddrResolved { .. } | CmEvent::RouteResolved { .. } => {
                debug!(id = event.id().0, event = ?event, "unexpected event ignored");
            }
        }
    }

    fn handle_connect_request(&mut self, id: CmIdHandle) {
        let conn = match self.admit(id) {
            Ok(conn) => conn,
            Err(error) => {
                warn!(id = id.0, %error, "connect request refused");
                self.refuse(id);
                return;
            }
        };

        let channel = conn.channel;
        if let Err(mut conn) = self.registry.insert(conn) {
            let error = TransportError::AtCapacity {
                max: self.config.max_connections,
            };
            warn!(id = id.0, %error, "registry refused the connection");
            conn.release(self.provider.as_ref());
            self.refuse(id);
            return;
        }
        // Routed from admission: the peer may have traffic in flight
        // before our established event gets its turn.
        self.registry.register_channel(channel, id);
        self.active.store(self.registry.len(), Ordering::SeqCst);
        info!(id = id.0, active = self.registry.len(), "connection admitted");
    }

    /// Build the resource set, bring the queue pair up, post the standing
    /// receive, and accept. Any failure releases everything acquired. The
    /// capacity check comes before any allocation, so a refused request
    /// never touches the fabric.
    fn admit(&self, id: CmIdHandle) -> Result<Connection> {
        if self.registry.at_capacity() {
            return Err(TransportError::AtCapacity {
                max: self.config.max_connections,
            });
        }
        let resources = ConnResources::build(
            self.provider.as_ref(),
            self.comp_tx.clone(),
            self.config.buffer_size,
            self.config.cq_depth,
            self.config.queue_depth,
        )?;
        let mut conn = Connection::new(id, resources, self.config.buffer_size);
        if let Err(err) = self.prepare(&conn) {
            conn.release(self.provider.as_ref());
            return Err(err);
        }
        Ok(conn)
    }

    fn prepare(&self, conn: &Connection) -> Result<()> {
        let provider = self.provider.as_ref();
        provider.bind_qp(conn.id, conn.qp)?;
        let remote = provider.remote_endpoint(conn.id)?;
        transition::bring_up(provider, conn.qp, remote)?;
        // The receive must stand before accept: the peer may send the
        // instant it observes establishment.
        conn.post_receive(provider)?;
        provider.accept(conn.id)?;
        Ok(())
    }

    fn handle_established(&mut self, id: CmIdHandle) {
        let Some(conn) = self.registry.get_mut(id) else {
            let error = TransportError::UnknownConnection { id };
            debug!(%error, "established event ignored");
            return;
        };
        if !conn.mark_established() {
            debug!(id = id.0, "stale established event ignored");
            return;
        }
        info!(id = id.0, "connection established");
    }

    fn handle_completion(&mut self, channel: CompChannelHandle) {
        let Some(conn) = self.registry.route(channel) else {
            // Notifications can outlive their connection; stale ones carry
            // no work.
            debug!(channel = channel.0, "stale notification dropped");
            return;
        };
        let id = conn.id;
        match poller::drain(self.provider.as_ref(), conn, self.config.poll_batch) {
            Ok(PollOutcome::Progress { .. }) => {}
            Ok(PollOutcome::Fatal { status }) => {
                warn!(id = id.0, status = ?status, "completion error, closing connection");
                self.teardown(id);
            }
            Err(error) => {
                warn!(id = id.0, %error, "poll failed, closing connection");
                self.teardown(id);
            }
        }
    }

    /// Remove, disconnect, release, destroy. Safe against the peer having
    /// already torn down its side.
    fn teardown(&mut self, id: CmIdHandle) {
        let Some(mut conn) = self.registry.remove(id) else {
            return;
        };
        conn.mark_disconnected();
        let provider = self.provider.as_ref();
        if let Err(error) = provider.disconnect(id) {
            debug!(id = id.0, %error, "disconnect during teardown");
        }
        conn.release(provider);
        if let Err(error) = provider.destroy_id(id) {
            warn!(id = id.0, %error, "destroy_id during teardown");
        }
        self.active.store(self.registry.len(), Ordering::SeqCst);
        info!(id = id.0, active = self.registry.len(), "connection closed");
    }

    /// Reject a request we will not admit.
    fn refuse(&self, id: CmIdHandle) {
        let provider = self.provider.as_ref();
        if let Err(error) = provider.reject(id) {
            debug!(id = id.0, %error, "reject failed");
        }
        if let Err(error) = provider.destroy_id(id) {
            debug!(id = id.0, %error, "destroy_id after reject failed");
        }
    }

    fn shutdown_all(&mut self) {
        for id in self.registry.ids() {
            self.teardown(id);
        }
        if let Err(error) = self.provider.destroy_id(self.listener) {
            warn!(%error, "listener destroy failed");
        }
        info!("server stopped");
    }
}
