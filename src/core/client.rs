//! TCP client with automatic reconnection
//!
//! A single control task alternates between two states. While
//! disconnected it opens a connection, at most once per retry interval.
//! While connected it relays messages between the application queues and
//! the connection engine until the engine reports shutdown.

use crate::core::address::Address;
use crate::core::connection::{ConnectionEngine, EngineConfig};
use crate::core::message::Message;
use crate::core::message_queue::{message_queue, MessageQueue, MessageStream};
use crate::core::socket::{connect_stream, SocketOptions};
use crate::error::{NetworkError, Result};
use crate::stability::ShutdownSignal;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or IP
    pub server_address: String,
    /// Server port
    pub server_port: u16,
    /// Minimum time between connection attempts
    pub retry_interval: Duration,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Options applied to every connection
    pub socket: SocketOptions,
    /// Connection engine tuning
    pub engine: EngineConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 2445,
            retry_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            socket: SocketOptions::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Create a configuration for the given server
    #[must_use]
    pub fn new<S: Into<String>>(server_address: S, server_port: u16) -> Self {
        Self {
            server_address: server_address.into(),
            server_port,
            ..Default::default()
        }
    }

    /// Set retry interval
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set connection timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
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

    fn target(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }
}

/// Client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
}

/// State observable from outside the control task
#[derive(Debug)]
struct ClientShared {
    state: RwLock<ClientState>,
    local_address: RwLock<Option<Address>>,
    attempts: AtomicU64,
}

impl ClientShared {
    fn set_connected(&self, local: Option<Address>) {
        *self.local_address.write() = local;
        *self.state.write() = ClientState::Connected;
    }

    fn set_disconnected(&self) {
        *self.state.write() = ClientState::Disconnected;
        *self.local_address.write() = None;
    }
}

/// TCP client
pub struct TcpClient {
    config: ClientConfig,
    stop: ShutdownSignal,
    shared: Arc<ClientShared>,
    queues: Option<(MessageStream, MessageQueue)>,
    task: Option<JoinHandle<()>>,
}

impl TcpClient {
    /// Create a client
    ///
    /// Messages taken from `outgoing` are sent to the server while
    /// connected; messages from the server are delivered to `received`.
    #[must_use]
    pub fn new(config: ClientConfig, outgoing: MessageStream, received: MessageQueue) -> Self {
        Self {
            config,
            stop: ShutdownSignal::new(),
            shared: Arc::new(ClientShared {
                state: RwLock::new(ClientState::Disconnected),
                local_address: RwLock::new(None),
                attempts: AtomicU64::new(0),
            }),
            queues: Some((outgoing, received)),
            task: None,
        }
    }

    /// Start the control task; the first connection attempt is immediate
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        let (outgoing, received) = self.queues.take().ok_or_else(|| {
            NetworkError::invalid_state("Client is already running or cannot be restarted")
        })?;

        let reconnector = Reconnector {
            config: self.config.clone(),
            stop: self.stop.clone(),
            shared: Arc::clone(&self.shared),
            outgoing,
            outgoing_open: true,
            received,
            last_attempt: None,
        };

        tracing::info!("Client starting for {}", self.config.target());
        self.task = Some(tokio::spawn(reconnector.run()));
        Ok(())
    }

    /// Stop the control task and close the connection, if any
    pub async fn stop(&mut self) -> Result<()> {
        self.stop.trigger();

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Client control task ended abnormally: {}", e);
            }
        }

        self.shared.set_disconnected();
        Ok(())
    }

    /// Get current state
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.shared.state.read()
    }

    /// Check if connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Connection attempts made so far, successful or not
    #[must_use]
    pub fn connection_attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::Relaxed)
    }

    /// Local endpoint of the current connection
    #[must_use]
    pub fn local_address(&self) -> Option<Address> {
        *self.shared.local_address.read()
    }
}

/// Abort the control task of a client dropped without `stop()`
impl Drop for TcpClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                tracing::warn!("TcpClient dropped while still running - aborting control task");
                self.stop.trigger();
                task.abort();
            }
        }
    }
}

/// The live connection and the engine-side queue ends
struct Link {
    engine: ConnectionEngine,
    outbound: MessageQueue,
    inbound: MessageStream,
}

enum LinkEvent {
    Stop,
    Inbound(Option<Message>),
    Outgoing(Option<Message>),
}

struct Reconnector {
    config: ClientConfig,
    stop: ShutdownSignal,
    shared: Arc<ClientShared>,
    outgoing: MessageStream,
    outgoing_open: bool,
    received: MessageQueue,
    /// Last failed attempt or last disconnect
    last_attempt: Option<Instant>,
}

impl Reconnector {
    async fn run(mut self) {
        let mut link = None;

        while !self.stop.is_triggered() {
            link = match link.take() {
                None => self.establish().await,
                Some(live) => self.relay(live).await,
            };
        }

        if let Some(mut live) = link {
            live.engine.join().await;
        }
        self.shared.set_disconnected();
        tracing::info!("Client for {} stopped", self.config.target());
    }

    /// One connection attempt, after the retry interval has elapsed
    async fn establish(&mut self) -> Option<Link> {
        if let Some(last) = self.last_attempt {
            tokio::select! {
                biased;
                _ = self.stop.wait() => return None,
                _ = sleep_until(last + self.config.retry_interval) => {}
            }
        }

        let attempt = self.shared.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!("Connection attempt {} to {}", attempt, self.config.target());

        let connected = tokio::select! {
            biased;
            _ = self.stop.wait() => return None,
            connected = self.connect() => connected,
        };

        match connected.and_then(|stream| self.attach(stream)) {
            Ok(link) => Some(link),
            Err(e) => {
                tracing::warn!(
                    "Failed to connect to {} (attempt {}): {}",
                    self.config.target(),
                    attempt,
                    e
                );
                self.last_attempt = Some(Instant::now());
                None
            }
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let target = self.config.target();
        let addr: SocketAddr = lookup_host(target.as_str())
            .await
            .map_err(|e| NetworkError::invalid_address(format!("Failed to resolve {}: {}", target, e)))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| NetworkError::invalid_address(format!("No IPv4 address for {}", target)))?;

        connect_stream(addr, &self.config.socket, self.config.connect_timeout).await
    }

    fn attach(&self, stream: TcpStream) -> Result<Link> {
        let peer = Address::try_from(stream.peer_addr()?)?;
        let local = stream
            .local_addr()
            .ok()
            .and_then(|addr| Address::try_from(addr).ok());

        let (outbound, engine_outbound) = message_queue();
        let (engine_inbound, inbound) = message_queue();
        let engine = ConnectionEngine::start(
            stream,
            peer,
            engine_outbound,
            engine_inbound,
            self.stop.clone(),
            self.config.engine.clone(),
        );

        self.shared.set_connected(local);
        tracing::info!("Connected to {}", peer);

        Ok(Link {
            engine,
            outbound,
            inbound,
        })
    }

    /// Relay messages until the connection ends or stop is signalled
    ///
    /// Returns the link while it is still live.
    async fn relay(&mut self, mut link: Link) -> Option<Link> {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.wait() => LinkEvent::Stop,
                next = link.inbound.dequeue() => LinkEvent::Inbound(next),
                next = self.outgoing.dequeue(), if self.outgoing_open => LinkEvent::Outgoing(next),
            };

            match event {
                LinkEvent::Stop => return Some(link),
                LinkEvent::Inbound(Some(message))
                    if message.is_shutdown_sentinel() && link.engine.has_exited() =>
                {
                    self.disconnect(link).await;
                    return None;
                }
                LinkEvent::Inbound(Some(message)) => {
                    tracing::trace!("Received {} (latency {:?})", message, message.latency());
                    if self.received.enqueue(message).is_err() {
                        tracing::debug!("Application inbound queue closed, dropping message");
                    }
                }
                LinkEvent::Inbound(None) => {
                    // Engine went away without its shutdown notice
                    self.disconnect(link).await;
                    return None;
                }
                LinkEvent::Outgoing(Some(message)) => {
                    if let Err(e) = link.outbound.enqueue(message) {
                        tracing::warn!("Failed to queue message for {}: {}", link.engine.peer(), e);
                    }
                }
                LinkEvent::Outgoing(None) => {
                    tracing::debug!("Application outgoing queue closed");
                    self.outgoing_open = false;
                }
            }
        }
    }

    async fn disconnect(&mut self, mut link: Link) {
        tracing::info!("Connection to {} lost", link.engine.peer());
        if link.engine.has_exited() {
            link.engine.join().await;
        } else {
            // Joining a live engine would wait for the stop signal
            tracing::warn!("Engine for {} still running, aborting it", link.engine.peer());
            drop(link);
        }
        self.shared.set_disconnected();
        self.last_attempt = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    fn queues() -> (MessageQueue, MessageStream, MessageQueue, MessageStream) {
        let (outgoing_tx, outgoing) = message_queue();
        let (received, received_rx) = message_queue();
        (outgoing_tx, outgoing, received, received_rx)
    }

    #[test]
    fn test_client_config() {
        let config = ClientConfig::new("example.com", 9000)
            .with_retry_interval(Duration::from_millis(250))
            .with_connect_timeout(Duration::from_secs(3));

        assert_eq!(config.server_address, "example.com");
        assert_eq!(config.server_port, 9000);
        assert_eq!(config.retry_interval, Duration::from_millis(250));
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.target(), "example.com:9000");
    }

    #[test]
    fn test_default_retry_interval() {
        assert_eq!(ClientConfig::default().retry_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_client_creation() {
        let (_tx, outgoing, received, _rx) = queues();
        let client = TcpClient::new(ClientConfig::default(), outgoing, received);

        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(client.connection_attempts(), 0);
        assert!(client.local_address().is_none());
    }

    #[tokio::test]
    async fn test_connects_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let (_tx, outgoing, received, _rx) = queues();
        let mut client = TcpClient::new(ClientConfig::new("127.0.0.1", port), outgoing, received);
        client.start().unwrap();
        assert!(client.start().is_err());

        let _server_side = accept.await.unwrap();
        timeout(Duration::from_secs(2), async {
            while !client.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(client.connection_attempts(), 1);
        assert!(client.local_address().is_some());

        client.stop().await.unwrap();
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_stop_while_waiting_to_retry() {
        // Nobody listens on this port
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let (_tx, outgoing, received, _rx) = queues();
        let config =
            ClientConfig::new("127.0.0.1", port).with_retry_interval(Duration::from_secs(60));
        let mut client = TcpClient::new(config, outgoing, received);
        client.start().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.connection_attempts(), 1);

        timeout(Duration::from_secs(2), client.stop())
            .await
            .unwrap()
            .unwrap();
        assert!(!client.is_connected());
    }
}
