//! Message types and the binary wire format
//!
//! Every frame is a fixed 25-byte big-endian header followed by the payload:
//!
//! ```text
//! ┌──────┬───────────┬───────────┬──────────────┬───────────┬─────────────┐
//! │ kind │ origin ip │ port      │ payload len  │ timestamp │ payload     │
//! │ u8   │ 4 octets  │ i32       │ u64          │ f64       │ len bytes   │
//! └──────┴───────────┴───────────┴──────────────┴───────────┴─────────────┘
//! ```
//!
//! Payload encoding depends on the kind: CONTROL is a JSON object, IMAGE a
//! JPEG stream, ACK a 4-byte unsigned integer and INTERNAL UTF-8 text.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::core::address::Address;
use crate::error::{NetworkError, Result};

/// Maximum payload size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size: kind + 4 ip octets + port + payload length + timestamp
pub const HEADER_SIZE: usize = 1 + 4 + 4 + 8 + 8;

/// INTERNAL payload announcing that a connection has ended
pub const CONN_SHUTDOWN: &str = "CONN_SHUTDOWN";

/// JPEG quality used for IMAGE payloads
const JPEG_QUALITY: u8 = 90;

/// Structured key/value data carried by CONTROL messages
pub type ControlMap = serde_json::Map<String, Value>;

/// Kind of a message, carried as the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Structured command data
    Control = 0,
    /// A single encoded raster frame
    Image = 1,
    /// Acknowledgement code
    Ack = 2,
    /// Transport lifecycle signal
    Internal = 3,
}

impl MessageKind {
    /// Wire representation
    #[must_use]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = NetworkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Control),
            1 => Ok(Self::Image),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Internal),
            other => Err(NetworkError::serialization(format!(
                "Unknown message kind {}",
                other
            ))),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Control => "CONTROL",
            Self::Image => "IMAGE",
            Self::Ack => "ACK",
            Self::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

/// Message payload, one variant per [`MessageKind`]
///
/// Images sit behind an `Arc` so broadcasting a frame to many clients does not
/// copy the raster.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Control(ControlMap),
    Image(Arc<RgbImage>),
    Ack(u32),
    Internal(String),
}

impl Payload {
    /// Kind tag matching this payload
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Control(_) => MessageKind::Control,
            Self::Image(_) => MessageKind::Image,
            Self::Ack(_) => MessageKind::Ack,
            Self::Internal(_) => MessageKind::Internal,
        }
    }

    #[must_use]
    pub fn as_control(&self) -> Option<&ControlMap> {
        match self {
            Self::Control(map) => Some(map),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_image(&self) -> Option<&RgbImage> {
        match self {
            Self::Image(image) => Some(image.as_ref()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_ack(&self) -> Option<u32> {
        match self {
            Self::Ack(code) => Some(*code),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_internal(&self) -> Option<&str> {
        match self {
            Self::Internal(text) => Some(text.as_str()),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Self::Control(map) => serde_json::to_vec(map).map_err(|e| {
                NetworkError::serialization(format!("JSON serialization failed: {}", e))
            }),
            Self::Image(image) => encode_jpeg(image),
            Self::Ack(code) => Ok(code.to_be_bytes().to_vec()),
            Self::Internal(text) => Ok(text.as_bytes().to_vec()),
        }
    }

    fn from_bytes(kind: MessageKind, data: &[u8]) -> Result<Self> {
        match kind {
            MessageKind::Control => serde_json::from_slice::<ControlMap>(data)
                .map(Self::Control)
                .map_err(|e| {
                    NetworkError::serialization(format!("JSON deserialization failed: {}", e))
                }),
            MessageKind::Image => decode_jpeg(data).map(|image| Self::Image(Arc::new(image))),
            MessageKind::Ack => decode_ack(data).map(Self::Ack),
            MessageKind::Internal => String::from_utf8(data.to_vec())
                .map(Self::Internal)
                .map_err(|e| {
                    NetworkError::serialization(format!("Invalid UTF-8 in internal payload: {}", e))
                }),
        }
    }
}

fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|e| NetworkError::serialization(format!("JPEG encoding failed: {}", e)))?;
    Ok(out)
}

fn decode_jpeg(data: &[u8]) -> Result<RgbImage> {
    image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map(|decoded| decoded.to_rgb8())
        .map_err(|e| NetworkError::serialization(format!("JPEG decoding failed: {}", e)))
}

/// ACK codes are written as 4 bytes; shorter big-endian values from
/// minimal-width senders are still accepted.
fn decode_ack(data: &[u8]) -> Result<u32> {
    if data.len() > 4 {
        return Err(NetworkError::serialization(format!(
            "ACK payload is {} bytes (max 4)",
            data.len()
        )));
    }
    Ok(data
        .iter()
        .fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte)))
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_else(|e| {
            tracing::warn!("System time before Unix epoch: {} - using zero timestamp", e);
            0.0
        })
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    /// Raw kind byte (not validated)
    pub kind: u8,
    /// Origin IP octets
    pub ip: [u8; 4],
    /// Origin port as carried on the wire
    pub port: i32,
    /// Number of payload bytes following the header
    pub payload_len: u64,
    /// Send time in seconds since the Unix epoch
    pub timestamp: f64,
}

impl FrameHeader {
    /// Parse the header at the front of `data`, if enough bytes are present
    #[must_use]
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }

        let mut cursor = &data[..HEADER_SIZE];
        let kind = cursor.get_u8();
        let mut ip = [0u8; 4];
        cursor.copy_to_slice(&mut ip);

        Some(Self {
            kind,
            ip,
            port: cursor.get_i32(),
            payload_len: cursor.get_u64(),
            timestamp: cursor.get_f64(),
        })
    }

    /// Append the header to `buf`
    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        buf.put_slice(&self.ip);
        buf.put_i32(self.port);
        buf.put_u64(self.payload_len);
        buf.put_f64(self.timestamp);
    }
}

/// Unit of exchange between application and transport
///
/// `address` is the origin of an inbound message and the destination of an
/// outbound one. It is routing metadata: the engine writes the socket's own
/// address into the frame header, not this field.
///
/// A message may carry its payload already encoded (see
/// [`Message::prepare`]). Clones share those bytes, so a broadcast frame is
/// encoded once however many clients it reaches.
#[derive(Debug, Clone)]
pub struct Message {
    address: Address,
    payload: Payload,
    timestamp: f64,
    encoded: Option<Bytes>,
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.payload == other.payload
            && self.timestamp == other.timestamp
    }
}

impl Message {
    /// Create a message stamped with the current time
    #[must_use]
    pub fn new(address: Address, payload: Payload) -> Self {
        Self {
            address,
            payload,
            timestamp: unix_now(),
            encoded: None,
        }
    }

    #[must_use]
    pub fn control(address: Address, data: ControlMap) -> Self {
        Self::new(address, Payload::Control(data))
    }

    /// Create a CONTROL message from any value that serializes to a JSON object
    pub fn control_from<T: Serialize>(address: Address, value: &T) -> Result<Self> {
        match serde_json::to_value(value).map_err(|e| {
            NetworkError::serialization(format!("JSON serialization failed: {}", e))
        })? {
            Value::Object(map) => Ok(Self::control(address, map)),
            other => Err(NetworkError::serialization(format!(
                "Control payload must be a JSON object, got {}",
                other
            ))),
        }
    }

    #[must_use]
    pub fn image(address: Address, image: RgbImage) -> Self {
        Self::new(address, Payload::Image(Arc::new(image)))
    }

    #[must_use]
    pub fn ack(address: Address, code: u32) -> Self {
        Self::new(address, Payload::Ack(code))
    }

    #[must_use]
    pub fn internal(address: Address, signal: impl Into<String>) -> Self {
        Self::new(address, Payload::Internal(signal.into()))
    }

    /// Sentinel enqueued by a connection engine when its connection ends
    #[must_use]
    pub fn shutdown_sentinel() -> Self {
        Self::internal(Address::BROADCAST, CONN_SHUTDOWN)
    }

    /// Check whether this is the connection-ended sentinel
    #[must_use]
    pub fn is_shutdown_sentinel(&self) -> bool {
        matches!(&self.payload, Payload::Internal(text) if text == CONN_SHUTDOWN)
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Wire form of the payload, if already encoded
    #[must_use]
    pub fn encoded_payload(&self) -> Option<&Bytes> {
        self.encoded.as_ref()
    }

    /// Creation time, or send time for decoded messages (seconds since the Unix epoch)
    #[must_use]
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    /// Time elapsed since [`Message::timestamp`]
    #[must_use]
    pub fn latency(&self) -> Duration {
        Duration::try_from_secs_f64((unix_now() - self.timestamp).max(0.0)).unwrap_or_default()
    }

    /// Deserialize a CONTROL payload into a typed value
    pub fn control_as<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.payload {
            Payload::Control(map) => serde_json::from_value(Value::Object(map.clone())).map_err(
                |e| NetworkError::serialization(format!("JSON deserialization failed: {}", e)),
            ),
            other => Err(NetworkError::invalid_state(format!(
                "Expected a CONTROL payload, found {}",
                other.kind()
            ))),
        }
    }

    /// Encode the payload now and keep the bytes for every later encode
    ///
    /// Does nothing if the payload is already encoded.
    pub fn prepare(&mut self) -> Result<()> {
        if self.encoded.is_none() {
            let payload = self.payload.to_bytes()?;
            if payload.len() > MAX_MESSAGE_SIZE {
                return Err(NetworkError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
            }
            self.encoded = Some(Bytes::from(payload));
        }
        Ok(())
    }

    /// [`Message::prepare`] without blocking the async runtime
    ///
    /// JPEG encoding runs on the blocking pool; the other kinds are cheap
    /// enough to encode in place. Must be called from within a tokio runtime.
    pub async fn prepared(mut self) -> Result<Self> {
        if self.encoded.is_some() || self.kind() != MessageKind::Image {
            self.prepare()?;
            return Ok(self);
        }

        tokio::task::spawn_blocking(move || -> Result<Self> {
            self.prepare()?;
            Ok(self)
        })
        .await
        .map_err(|e| NetworkError::serialization(format!("JPEG encoding task failed: {}", e)))?
    }

    /// Encode into wire format with this message's address as the header origin
    pub fn encode(&self) -> Result<BytesMut> {
        self.encode_from(self.address)
    }

    /// Encode into wire format with an explicit header origin
    ///
    /// The header timestamp is the time of this call.
    pub fn encode_from(&self, origin: Address) -> Result<BytesMut> {
        let payload = match &self.encoded {
            Some(bytes) => bytes.clone(),
            None => Bytes::from(self.payload.to_bytes()?),
        };
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
        }

        let header = FrameHeader {
            kind: self.kind().as_byte(),
            ip: origin.octets(),
            port: i32::from(origin.port()),
            payload_len: payload.len() as u64,
            timestamp: unix_now(),
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        header.write(&mut buf);
        buf.put_slice(&payload);
        Ok(buf)
    }

    /// Decode one message from the front of `buf`
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the header or
    /// payload is incomplete. A length over [`MAX_MESSAGE_SIZE`] is rejected
    /// without consuming anything. Any other error means the frame was
    /// complete but unusable; it has been removed from `buf`.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>> {
        RawFrame::split(buf)?.map(RawFrame::into_message).transpose()
    }
}

/// A complete frame cut from a byte stream, payload still encoded
#[derive(Debug, Clone)]
pub struct RawFrame {
    header: FrameHeader,
    payload: Bytes,
}

impl RawFrame {
    /// Cut one frame from the front of `buf`
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is
    /// incomplete. A length over [`MAX_MESSAGE_SIZE`] is rejected without
    /// consuming anything.
    pub fn split(buf: &mut BytesMut) -> Result<Option<Self>> {
        let Some(header) = FrameHeader::parse(buf) else {
            return Ok(None);
        };

        if header.payload_len > MAX_MESSAGE_SIZE as u64 {
            let len = usize::try_from(header.payload_len).unwrap_or(usize::MAX);
            return Err(NetworkError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
        }

        let frame_len = HEADER_SIZE + header.payload_len as usize;
        if buf.len() < frame_len {
            return Ok(None);
        }

        let payload = buf.split_to(frame_len).split_off(HEADER_SIZE).freeze();
        Ok(Some(Self { header, payload }))
    }

    #[must_use]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Decode the payload
    ///
    /// A decoded image keeps the received JPEG as its encoded payload, so
    /// forwarding it does not encode again.
    pub fn into_message(self) -> Result<Message> {
        let kind = MessageKind::try_from(self.header.kind)?;
        let port = u16::try_from(self.header.port).map_err(|_| {
            NetworkError::serialization(format!("Origin port {} out of range", self.header.port))
        })?;
        let payload = Payload::from_bytes(kind, &self.payload)?;

        Ok(Message {
            address: Address::new(self.header.ip, port),
            payload,
            timestamp: self.header.timestamp,
            encoded: (kind == MessageKind::Image).then_some(self.payload),
        })
    }

    /// [`RawFrame::into_message`] with JPEG decoding moved to the blocking pool
    ///
    /// Must be called from within a tokio runtime.
    pub async fn into_message_async(self) -> Result<Message> {
        if self.header.kind != MessageKind::Image.as_byte() {
            return self.into_message();
        }

        tokio::task::spawn_blocking(move || self.into_message())
            .await
            .map_err(|e| NetworkError::serialization(format!("JPEG decoding task failed: {}", e)))?
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} message [{}]", self.kind(), self.address)
    }
}
