//! Connection engine: the paired receive and transmit tasks of one connection
//!
//! # Concurrency Design
//!
//! The TCP stream is split into independent read and write halves. The
//! receive task owns the read half; the write half is shared behind a mutex
//! so the receive task can close the connection when it exits while the
//! transmit task is idle. Both tasks race their I/O against the shared stop
//! signal and finish within one await point of it being triggered.
//!
//! ```text
//! socket ─▶ receive task ─▶ decode ─▶ inbound queue ─▶ caller
//! caller ─▶ outbound queue ─▶ transmit task ─▶ encode ─▶ socket
//! ```

use crate::core::address::Address;
use crate::core::message::{Message, RawFrame};
use crate::core::message_queue::{MessageQueue, MessageStream};
use crate::error::{NetworkError, Result};
use crate::stability::ShutdownSignal;
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;

type SharedWriter = Arc<Mutex<Option<OwnedWriteHalf>>>;

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Bytes reserved for each socket read
    pub read_chunk_size: usize,
    /// Upper bound for writing one encoded message
    pub write_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: 64 * 1024,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Create a new configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set read chunk size
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.max(1);
        self
    }

    /// Set write timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }
}

/// Owner of one live connection
///
/// Decoded messages go to the inbound queue in wire order; messages taken
/// from the outbound queue are written in submission order. When the
/// connection ends for any reason the exited flag is set, the inbound queue
/// receives one [`Message::shutdown_sentinel`] and the connection is closed.
/// A frame from the peer that looks like the sentinel is discarded, so the
/// notice on the inbound queue always comes from the engine itself.
pub struct ConnectionEngine {
    peer: Address,
    exited: ShutdownSignal,
    receive_task: Option<JoinHandle<()>>,
    transmit_task: Option<JoinHandle<()>>,
}

impl ConnectionEngine {
    /// Spawn the receive and transmit tasks for `stream`
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        stream: TcpStream,
        peer: Address,
        outbound: MessageStream,
        inbound: MessageQueue,
        stop: ShutdownSignal,
        config: EngineConfig,
    ) -> Self {
        // Frames carry our own endpoint as origin
        let local = stream
            .local_addr()
            .map_err(NetworkError::from)
            .and_then(Address::try_from);
        let origin = match local {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(
                    "Local address of connection to {} unknown: {} - sending unspecified origin",
                    peer,
                    e
                );
                Address::BROADCAST
            }
        };

        let (read_half, write_half) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(Some(write_half)));
        let exited = ShutdownSignal::new();

        let receiver = Receiver {
            reader: read_half,
            writer: Arc::clone(&writer),
            inbound,
            stop: stop.clone(),
            exited: exited.clone(),
            peer,
            chunk_size: config.read_chunk_size,
        };
        let transmitter = Transmitter {
            writer,
            outbound,
            stop,
            exited: exited.clone(),
            peer,
            origin,
            write_timeout: config.write_timeout,
        };

        tracing::debug!("Starting connection engine for {}", peer);

        Self {
            peer,
            exited,
            receive_task: Some(tokio::spawn(receiver.run())),
            transmit_task: Some(tokio::spawn(transmitter.run())),
        }
    }

    /// Remote endpoint of this connection
    #[must_use]
    pub fn peer(&self) -> Address {
        self.peer
    }

    /// True once the receive task has finished and the connection is closed
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.is_triggered()
    }

    /// True once both tasks have terminated
    #[must_use]
    pub fn is_finished(&self) -> bool {
        [&self.receive_task, &self.transmit_task]
            .into_iter()
            .flatten()
            .all(JoinHandle::is_finished)
    }

    /// Wait for both tasks to terminate
    ///
    /// Only returns after the shared stop signal has been triggered or the
    /// connection has ended on its own; calling it on a healthy connection
    /// without stopping it waits indefinitely.
    pub async fn join(&mut self) {
        for (name, task) in [
            ("transmit", self.transmit_task.take()),
            ("receive", self.receive_task.take()),
        ] {
            if let Some(task) = task {
                if let Err(e) = task.await {
                    tracing::warn!("{} task for {} ended abnormally: {}", name, self.peer, e);
                }
            }
        }
    }
}

impl std::fmt::Debug for ConnectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("peer", &self.peer)
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// Abort tasks of an engine dropped without being joined
impl Drop for ConnectionEngine {
    fn drop(&mut self) {
        let running: Vec<_> = [self.receive_task.take(), self.transmit_task.take()]
            .into_iter()
            .flatten()
            .filter(|task| !task.is_finished())
            .collect();

        if !running.is_empty() {
            tracing::warn!(
                "Connection engine for {} dropped while running - aborting tasks",
                self.peer
            );
            for task in running {
                task.abort();
            }
        }
    }
}

struct Receiver {
    reader: OwnedReadHalf,
    writer: SharedWriter,
    inbound: MessageQueue,
    stop: ShutdownSignal,
    exited: ShutdownSignal,
    peer: Address,
    chunk_size: usize,
}

impl Receiver {
    async fn run(mut self) {
        let mut buf = BytesMut::with_capacity(self.chunk_size);

        loop {
            buf.reserve(self.chunk_size);

            let read = tokio::select! {
                biased;
                _ = self.stop.wait() => {
                    tracing::debug!("Receive task for {} stopping", self.peer);
                    break;
                }
                read = self.reader.read_buf(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    tracing::info!("Connection closed by peer {}", self.peer);
                    break;
                }
                Ok(n) => {
                    tracing::trace!("Read {} bytes from {}", n, self.peer);
                    if !self.drain_frames(&mut buf).await {
                        break;
                    }
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!("Error receiving from {}: {} (retrying)", self.peer, e);
                }
                Err(e) => {
                    tracing::warn!("Error receiving from {}: {}", self.peer, e);
                    break;
                }
            }
        }

        self.finish().await;
    }

    /// Decode every complete frame in `buf`; false if the stream is unusable
    async fn drain_frames(&self, buf: &mut BytesMut) -> bool {
        loop {
            let decoded = match RawFrame::split(buf) {
                Ok(Some(frame)) => frame.into_message_async().await,
                Ok(None) => return true,
                Err(e) if e.is_stream_corrupt() => {
                    tracing::error!("Dropping connection to {}: {}", self.peer, e);
                    return false;
                }
                Err(e) => Err(e),
            };

            match decoded {
                Ok(message) if message.is_shutdown_sentinel() => {
                    tracing::warn!("Discarding reserved shutdown signal sent by {}", self.peer);
                }
                Ok(message) => {
                    tracing::trace!("Received {} from {}", message, self.peer);
                    if self.inbound.enqueue(message).is_err() {
                        tracing::debug!("Inbound queue for {} closed, discarding", self.peer);
                    }
                }
                Err(e) => {
                    tracing::warn!("Discarding undecodable frame from {}: {}", self.peer, e);
                }
            }
        }
    }

    async fn finish(self) {
        // Flag first: whoever sees the notice can rely on has_exited()
        self.exited.trigger();
        if self.inbound.enqueue(Message::shutdown_sentinel()).is_err() {
            tracing::debug!("Inbound queue for {} closed before shutdown notice", self.peer);
        }

        if let Some(mut write_half) = self.writer.lock().await.take() {
            // Best effort shutdown - ignore errors
            let _ = write_half.shutdown().await;
        }
        drop(self.reader);

        tracing::debug!("Receive task for {} exited", self.peer);
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

struct Transmitter {
    writer: SharedWriter,
    outbound: MessageStream,
    stop: ShutdownSignal,
    exited: ShutdownSignal,
    peer: Address,
    origin: Address,
    write_timeout: Duration,
}

impl Transmitter {
    async fn run(mut self) {
        loop {
            let first = tokio::select! {
                biased;
                _ = self.stop.wait() => break,
                _ = self.exited.wait() => break,
                next = self.outbound.dequeue() => match next {
                    Some(message) => message,
                    None => {
                        tracing::debug!("Outbound queue for {} closed", self.peer);
                        break;
                    }
                },
            };

            let backlog = self.outbound.stats().depth;
            if backlog > 0 {
                tracing::debug!("Outbound backlog for {}: {} messages", self.peer, backlog + 1);
            }

            // Drain everything queued so far before waiting again
            let mut next = Some(first);
            while let Some(message) = next.take().or_else(|| self.outbound.try_dequeue()) {
                if let Err(e) = self.send(message).await {
                    if self.exited.is_triggered() {
                        tracing::debug!("Dropped write to closed connection {}: {}", self.peer, e);
                    } else {
                        tracing::warn!("Error transmitting to {}: {}", self.peer, e);
                    }
                }
            }
        }

        tracing::debug!("Transmit task for {} exited", self.peer);
    }

    async fn send(&self, message: Message) -> Result<()> {
        // Broadcast copies arrive already encoded; anything else is encoded here
        let data = message.prepared().await?.encode_from(self.origin)?;

        let mut guard = self.writer.lock().await;
        let write_half = guard
            .as_mut()
            .ok_or_else(|| NetworkError::invalid_state("Connection is closed"))?;

        let written = timeout(self.write_timeout, write_half.write_all(&data)).await;
        match written {
            Ok(result) => {
                result.map_err(|e| NetworkError::connection(format!("Failed to write: {}", e)))
            }
            Err(_) => {
                // A partial frame may be on the wire; the stream cannot be resumed
                if let Some(mut write_half) = guard.take() {
                    let _ = write_half.shutdown().await;
                }
                Err(NetworkError::timeout("Write timed out, connection closed"))
            }
        }
    }
}
