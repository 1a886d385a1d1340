//! TCP server multiplexer
//!
//! One accept task hands new connections to one routing task. The routing
//! task owns the [`Router`], starts an engine per client, merges every
//! client's inbound messages into the application's `received` queue and
//! fans the application's `outgoing` queue out to the clients.

use crate::core::address::Address;
use crate::core::connection::{ConnectionEngine, EngineConfig};
use crate::core::message::Message;
use crate::core::message_queue::{MessageQueue, MessageStream};
use crate::core::router::Router;
use crate::core::socket::{bind_listener, configure_stream, SocketOptions};
use crate::error::{NetworkError, Result};
use crate::stability::ShutdownSignal;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Pause after a failed accept, so a persistent error does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address
    pub bind_address: String,
    /// Listen backlog
    pub backlog: i32,
    /// Options applied to the listener and every accepted stream
    pub socket: SocketOptions,
    /// Per-connection engine tuning
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2445".to_string(),
            backlog: 10,
            socket: SocketOptions::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new<S: Into<String>>(bind_address: S) -> Self {
        Self {
            bind_address: bind_address.into(),
            ..Default::default()
        }
    }

    /// Set listen backlog
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set socket options
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_socket_options(mut self, options: SocketOptions) -> Self {
        self.socket = options;
        self
    }

    /// Set engine configuration
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}

/// Application-facing queue ends, consumed by the first `start`
struct AppQueues {
    outgoing: MessageStream,
    received: MessageQueue,
}

/// TCP server
pub struct TcpServer {
    config: ServerConfig,
    stop: ShutdownSignal,
    running: Arc<AtomicBool>,
    clients: Arc<RwLock<Vec<Address>>>,
    queues: Option<AppQueues>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
    routing_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Create a server
    ///
    /// Messages taken from `outgoing` are sent to the client named by their
    /// address, or to every client for [`Address::BROADCAST`]. Messages from
    /// clients are delivered to `received`, addressed with their origin.
    #[must_use]
    pub fn new(config: ServerConfig, outgoing: MessageStream, received: MessageQueue) -> Self {
        Self {
            config,
            stop: ShutdownSignal::new(),
            running: Arc::new(AtomicBool::new(false)),
            clients: Arc::new(RwLock::new(Vec::new())),
            queues: Some(AppQueues { outgoing, received }),
            local_addr: None,
            accept_task: None,
            routing_task: None,
        }
    }

    /// Bind the listener and start the accept and routing tasks
    pub async fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(NetworkError::invalid_state("Server is already running"));
        }

        let addr: SocketAddr = self
            .config
            .bind_address
            .parse()
            .map_err(|e| NetworkError::invalid_address(format!("Invalid address: {}", e)))?;

        if self.queues.is_none() {
            return Err(NetworkError::invalid_state("Server cannot be restarted"));
        }

        let listener = bind_listener(addr, &self.config.socket, self.config.backlog)?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        let AppQueues { outgoing, received } = self
            .queues
            .take()
            .ok_or_else(|| NetworkError::invalid_state("Server cannot be restarted"))?;

        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        self.running.store(true, Ordering::Release);

        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            pending_tx,
            self.stop.clone(),
            self.config.socket.clone(),
        )));

        let routing = RoutingLoop {
            router: Router::new(),
            pending: pending_rx,
            outgoing,
            outgoing_open: true,
            received,
            stop: self.stop.clone(),
            engine_config: self.config.engine.clone(),
            clients: Arc::clone(&self.clients),
        };
        self.routing_task = Some(tokio::spawn(routing.run()));

        tracing::info!("Server listening on {}", local_addr);
        Ok(())
    }

    /// Stop the server
    ///
    /// Signals stop, waits for every client engine and both tasks, then
    /// closes the listener.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }

        self.stop.trigger();

        // The routing task joins every engine before finishing
        if let Some(task) = self.routing_task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Routing task ended abnormally: {}", e);
            }
        }

        // Listener is dropped when the accept task returns
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Accept task ended abnormally: {}", e);
            }
        }

        self.clients.write().clear();
        self.running.store(false, Ordering::Release);
        tracing::info!("Server stopped");

        Ok(())
    }

    /// Address the listener is bound to, once started
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Check if server is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of registered clients
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Addresses of registered clients
    #[must_use]
    pub fn clients(&self) -> Vec<Address> {
        self.clients.read().clone()
    }
}

/// Abort the tasks of a server dropped without `stop()`
///
/// Drop cannot await, so engines are left to observe the stop signal on
/// their own. Call `stop().await` for an orderly shutdown.
impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            tracing::warn!("TcpServer dropped while still running - performing emergency cleanup");

            self.stop.trigger();

            if let Some(task) = self.accept_task.take() {
                task.abort();
            }
            if let Some(task) = self.routing_task.take() {
                task.abort();
            }

            self.running.store(false, Ordering::Release);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    pending: mpsc::UnboundedSender<(TcpStream, Address)>,
    stop: ShutdownSignal,
    options: SocketOptions,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop.wait() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                let peer = match Address::try_from(peer) {
                    Ok(peer) => peer,
                    Err(e) => {
                        tracing::warn!("Rejecting connection: {}", e);
                        continue;
                    }
                };

                configure_stream(&stream, &options);
                tracing::info!("Accepted connection from {}", peer);

                if pending.send((stream, peer)).is_err() {
                    tracing::debug!("Routing task gone, accept loop exiting");
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    drop(listener);
    tracing::debug!("Accept loop exited");
}

struct RoutingLoop {
    router: Router,
    pending: mpsc::UnboundedReceiver<(TcpStream, Address)>,
    outgoing: MessageStream,
    outgoing_open: bool,
    received: MessageQueue,
    stop: ShutdownSignal,
    engine_config: EngineConfig,
    clients: Arc<RwLock<Vec<Address>>>,
}

impl RoutingLoop {
    async fn run(mut self) {
        let activity = self.router.activity();

        loop {
            // A message woken on is routed after registrations and inbound,
            // same as one picked up by the sweep
            let mut woken_by = None;

            tokio::select! {
                biased;
                _ = self.stop.wait() => break,
                Some(connection) = self.pending.recv() => {
                    self.register(connection);
                }
                next = self.outgoing.dequeue(), if self.outgoing_open => match next {
                    Some(message) => woken_by = Some(message),
                    None => {
                        tracing::debug!("Application outgoing queue closed");
                        self.outgoing_open = false;
                    }
                },
                _ = activity.notified() => {}
            }

            while let Ok(connection) = self.pending.try_recv() {
                self.register(connection);
            }

            self.router.collect_inbound(&self.received);

            if let Some(message) = woken_by {
                self.dispatch(message).await;
            }
            while let Some(message) = self.outgoing.try_dequeue() {
                self.dispatch(message).await;
            }

            self.publish_clients();
        }

        tracing::debug!("Routing loop stopping, joining {} engines", self.router.len());
        self.router.join_all().await;
        self.clients.write().clear();
    }

    fn register(&mut self, (stream, peer): (TcpStream, Address)) {
        let (outbound, inbound) = self.router.open_client(peer);
        let engine = ConnectionEngine::start(
            stream,
            peer,
            outbound,
            inbound,
            self.stop.clone(),
            self.engine_config.clone(),
        );
        self.router.attach_engine(peer, engine);
        tracing::debug!("Registered client {} ({} total)", peer, self.router.len());
    }

    async fn dispatch(&self, message: Message) {
        let destination = message.address();
        match self.router.route(message).await {
            Ok(delivered) => {
                tracing::trace!("Routed message for {} to {} clients", destination, delivered);
            }
            Err(e) => tracing::warn!("Failed to route message: {}", e),
        }
    }

    fn publish_clients(&self) {
        let current = self.router.clients();
        let mut published = self.clients.write();
        if *published != current {
            *published = current;
        }
    }
}
