//! Core transport components

pub mod address;
pub mod client;
pub mod connection;
pub mod message;
pub mod message_queue;
pub mod router;
pub mod server;
pub mod socket;

pub use address::Address;
pub use client::{ClientConfig, ClientState, TcpClient};
pub use connection::{ConnectionEngine, EngineConfig};
pub use message::{
    ControlMap, FrameHeader, Message, MessageKind, Payload, RawFrame, CONN_SHUTDOWN,
    HEADER_SIZE, MAX_MESSAGE_SIZE,
};
pub use message_queue::{
    message_queue, message_queue_with_waker, MessageQueue, MessageQueueStats, MessageStream,
};
pub use router::Router;
pub use server::{ServerConfig, TcpServer};
pub use socket::SocketOptions;
