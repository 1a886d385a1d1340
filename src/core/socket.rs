//! Socket construction and tuning

use crate::error::{NetworkError, Result};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::timeout;

/// Default receive buffer (16MB), sized for bursts of image frames
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Default send buffer (8MB)
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Socket-level options applied to listeners and streams
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// SO_RCVBUF, left to the OS when `None`
    pub recv_buffer_size: Option<usize>,
    /// SO_SNDBUF, left to the OS when `None`
    pub send_buffer_size: Option<usize>,
    /// TCP keep-alive idle time
    pub keep_alive: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_buffer_size: Some(DEFAULT_RECV_BUFFER_SIZE),
            send_buffer_size: Some(DEFAULT_SEND_BUFFER_SIZE),
            keep_alive: Some(Duration::from_secs(60)),
        }
    }
}

impl SocketOptions {
    /// Create options with the default buffer sizes
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set receive buffer size
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_recv_buffer_size(mut self, size: Option<usize>) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Set send buffer size
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// Set keep-alive interval
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }
}

/// Bind a listening socket with address reuse and the configured buffers
///
/// Accepted streams inherit the listener's buffer sizes on most platforms.
/// Must be called from within a tokio runtime.
pub fn bind_listener(addr: SocketAddr, options: &SocketOptions, backlog: i32) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;

    if let Some(size) = options.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size) {
            tracing::warn!("Failed to set listener send buffer to {}: {}", size, e);
        }
    }
    if let Some(size) = options.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::warn!("Failed to set listener receive buffer to {}: {}", size, e);
        }
    }

    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::connection(format!("Failed to bind {}: {}", addr, e)))?;
    socket
        .listen(backlog)
        .map_err(|e| NetworkError::connection(format!("Failed to listen on {}: {}", addr, e)))?;

    // tokio requires nonblocking sockets for async I/O
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into())?)
}

/// Open a connection, sizing the receive buffer before the handshake
pub async fn connect_stream(
    addr: SocketAddr,
    options: &SocketOptions,
    connect_timeout: Duration,
) -> Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if let Some(size) = options.recv_buffer_size {
        let size = u32::try_from(size).unwrap_or(u32::MAX);
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::warn!("Failed to set receive buffer to {}: {}", size, e);
        }
    }

    let stream = timeout(connect_timeout, socket.connect(addr))
        .await
        .map_err(|_| NetworkError::timeout(format!("Connection to {} timed out", addr)))?
        .map_err(|e| NetworkError::connection(format!("Failed to connect to {}: {}", addr, e)))?;

    configure_stream(&stream, &options.clone().with_recv_buffer_size(None));
    Ok(stream)
}

/// Apply per-stream options; failures are logged and otherwise ignored
pub fn configure_stream(stream: &TcpStream, options: &SocketOptions) {
    let socket = SockRef::from(stream);

    if let Some(size) = options.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::warn!("Failed to set receive buffer to {}: {}", size, e);
        }
    }
    if let Some(size) = options.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size) {
            tracing::warn!("Failed to set send buffer to {}: {}", size, e);
        }
    }
    if let Some(keep_alive) = options.keep_alive {
        let keep_alive = TcpKeepalive::new().with_time(keep_alive);
        if let Err(e) = socket.set_tcp_keepalive(&keep_alive) {
            tracing::warn!("Failed to set keep-alive: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_options_builder() {
        let options = SocketOptions::new()
            .with_recv_buffer_size(Some(1024 * 1024))
            .with_send_buffer_size(None)
            .with_keep_alive(None);

        assert_eq!(options.recv_buffer_size, Some(1024 * 1024));
        assert_eq!(options.send_buffer_size, None);
        assert_eq!(options.keep_alive, None);
    }

    #[test]
    fn test_default_buffers() {
        let options = SocketOptions::default();
        assert_eq!(options.recv_buffer_size, Some(DEFAULT_RECV_BUFFER_SIZE));
        assert_eq!(options.send_buffer_size, Some(DEFAULT_SEND_BUFFER_SIZE));
    }

    #[tokio::test]
    async fn test_bind_and_connect() {
        let options = SocketOptions::default();
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &options, 10).unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(
            connect_stream(addr, &options, Duration::from_secs(2)),
            listener.accept()
        );

        let client = client.unwrap();
        let (server_side, peer) = accepted.unwrap();
        assert_eq!(client.local_addr().unwrap(), peer);
        configure_stream(&server_side, &options);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();

        let result = connect_stream(addr, &SocketOptions::default(), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(NetworkError::Connection(_))));
    }
}
