//! Rust Frame Transport
//!
//! Multi-client TCP message transport for control, image and acknowledgement
//! frames.
//!
//! ## Features
//!
//! - Length-prefixed binary frames with a fixed 25-byte header
//! - JSON control payloads, JPEG image payloads, ACK codes
//! - Server multiplexer with per-client routing and broadcast
//! - Client with automatic reconnection at a fixed retry interval
//! - Applications talk to both through plain message queues
//!
//! ## Example
//!
//! ```no_run
//! use rust_frame_transport::{message_queue, Address, Message, ServerConfig, TcpServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (outgoing, outgoing_rx) = message_queue();
//!     let (received_tx, mut received) = message_queue();
//!
//!     let mut server = TcpServer::new(ServerConfig::new("0.0.0.0:2445"), outgoing_rx, received_tx);
//!     server.start().await?;
//!
//!     while let Some(message) = received.dequeue().await {
//!         // Acknowledge to the sender, then tell everyone
//!         outgoing.enqueue(Message::ack(message.address(), 0))?;
//!         outgoing.enqueue(Message::internal(Address::BROADCAST, "seen"))?;
//!     }
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod error;
pub mod stability;

// Re-export main types
pub use core::{
    message_queue, Address, ClientConfig, ClientState, ConnectionEngine, ControlMap,
    EngineConfig, FrameHeader, Message, MessageKind, MessageQueue, MessageQueueStats,
    MessageStream, Payload, RawFrame, ServerConfig, SocketOptions, TcpClient, TcpServer,
    CONN_SHUTDOWN, HEADER_SIZE, MAX_MESSAGE_SIZE,
};
pub use error::{NetworkError, Result};
pub use stability::ShutdownSignal;
