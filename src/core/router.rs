//! Address-keyed routing state of the server
//!
//! The router owns every per-client queue pair and engine. It is driven by a
//! single task, so none of its maps need locking.

use crate::core::address::Address;
use crate::core::connection::ConnectionEngine;
use crate::core::message::Message;
use crate::core::message_queue::{
    message_queue, message_queue_with_waker, MessageQueue, MessageStream,
};
use crate::error::{NetworkError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

/// Per-client queues and engines, keyed by peer address
#[derive(Debug)]
pub struct Router {
    outbound: HashMap<Address, MessageQueue>,
    inbound: HashMap<Address, MessageStream>,
    engines: HashMap<Address, ConnectionEngine>,
    /// Engines of removed clients, kept until their tasks finish
    retired: Vec<ConnectionEngine>,
    activity: Arc<Notify>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create an empty router
    #[must_use]
    pub fn new() -> Self {
        Self {
            outbound: HashMap::new(),
            inbound: HashMap::new(),
            engines: HashMap::new(),
            retired: Vec::new(),
            activity: Arc::new(Notify::new()),
        }
    }

    /// Signalled whenever any client's inbound queue receives a message
    #[must_use]
    pub fn activity(&self) -> Arc<Notify> {
        Arc::clone(&self.activity)
    }

    /// Register a fresh queue pair for `addr`
    ///
    /// Returns the engine-side ends: the stream the engine transmits from
    /// and the queue it delivers decoded messages into. A client already
    /// registered under the same address is replaced.
    pub fn open_client(&mut self, addr: Address) -> (MessageStream, MessageQueue) {
        if self.outbound.contains_key(&addr) {
            tracing::warn!("Replacing existing registration for {}", addr);
            self.remove_client(addr);
        }

        let (outbound_queue, outbound_stream) = message_queue();
        let (inbound_queue, inbound_stream) = message_queue_with_waker(Arc::clone(&self.activity));

        self.outbound.insert(addr, outbound_queue);
        self.inbound.insert(addr, inbound_stream);

        (outbound_stream, inbound_queue)
    }

    /// Attach the engine serving a client opened with [`Router::open_client`]
    pub fn attach_engine(&mut self, addr: Address, engine: ConnectionEngine) {
        if let Some(previous) = self.engines.insert(addr, engine) {
            self.retired.push(previous);
        }
    }

    /// Move every pending client message into `shared`
    ///
    /// Messages are re-addressed to the client they came from. A client whose
    /// engine reported shutdown is removed; the notice itself is not
    /// forwarded. The notice only counts once the engine has actually exited.
    /// Returns the number of forwarded messages.
    pub fn collect_inbound(&mut self, shared: &MessageQueue) -> usize {
        let mut forwarded = 0;
        let mut closed = Vec::new();

        for (addr, stream) in &mut self.inbound {
            while let Some(message) = stream.try_dequeue() {
                if message.is_shutdown_sentinel() {
                    let exited = self
                        .engines
                        .get(addr)
                        .map_or(true, ConnectionEngine::has_exited);
                    if exited {
                        closed.push(*addr);
                        break;
                    }
                    tracing::warn!("Ignoring shutdown notice for live connection {}", addr);
                    continue;
                }

                if shared.enqueue(message.with_address(*addr)).is_err() {
                    tracing::debug!("Shared inbound queue closed, dropping message from {}", addr);
                    continue;
                }
                forwarded += 1;
            }
        }

        for addr in closed {
            tracing::info!("Client {} disconnected", addr);
            self.remove_client(addr);
        }

        self.retired.retain(|engine| !engine.is_finished());
        forwarded
    }

    /// Deliver an outgoing message to its destination queue(s)
    ///
    /// A [`Address::BROADCAST`] destination copies the message to every
    /// registered client. The payload is encoded once, off the async
    /// runtime, and the copies share it. Returns the number of clients
    /// reached.
    ///
    /// # Errors
    ///
    /// `UnknownDestination` when no client is registered under the address;
    /// `Channel` when the client's engine has stopped transmitting. A
    /// broadcast payload that cannot be encoded is reported before any
    /// client receives it.
    pub async fn route(&self, mut message: Message) -> Result<usize> {
        if message.address().is_broadcast() {
            if self.outbound.len() > 1 {
                message = message.prepared().await?;
            }

            let mut delivered = 0;
            for (addr, queue) in &self.outbound {
                match queue.enqueue(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(e) => tracing::warn!("Broadcast to {} failed: {}", addr, e),
                }
            }
            return Ok(delivered);
        }

        let addr = message.address();
        let queue = self
            .outbound
            .get(&addr)
            .ok_or(NetworkError::UnknownDestination(addr))?;
        queue.enqueue(message)?;
        Ok(1)
    }

    /// Addresses of registered clients, sorted
    #[must_use]
    pub fn clients(&self) -> Vec<Address> {
        let mut clients: Vec<_> = self.outbound.keys().copied().collect();
        clients.sort();
        clients
    }

    /// Check if a client is registered
    #[must_use]
    pub fn contains(&self, addr: &Address) -> bool {
        self.outbound.contains_key(addr)
    }

    /// Number of registered clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.outbound.len()
    }

    /// Check if no client is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    /// Wait for every engine, live or retired, to terminate
    ///
    /// The engines' stop signal must have been triggered first.
    pub async fn join_all(&mut self) {
        let engines: Vec<_> = self
            .engines
            .drain()
            .map(|(_, engine)| engine)
            .chain(self.retired.drain(..))
            .collect();

        for mut engine in engines {
            engine.join().await;
        }

        self.outbound.clear();
        self.inbound.clear();
    }

    fn remove_client(&mut self, addr: Address) {
        // Dropping the producer half ends the engine's transmit task
        self.outbound.remove(&addr);
        self.inbound.remove(&addr);
        if let Some(engine) = self.engines.remove(&addr) {
            self.retired.push(engine);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Payload, MAX_MESSAGE_SIZE};
    use image::{Rgb, RgbImage};

    fn client(n: u8) -> Address {
        Address::new([127, 0, 0, 1], 40000 + u16::from(n))
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let mut router = Router::new();
        let mut engine_sides: Vec<_> = (1..=3).map(|n| router.open_client(client(n))).collect();

        let delivered = router.route(Message::ack(Address::BROADCAST, 5)).await.unwrap();
        assert_eq!(delivered, 3);

        for (outbound, _) in &mut engine_sides {
            let message = outbound.try_dequeue().unwrap();
            assert_eq!(message.payload().as_ack(), Some(5));
            assert!(outbound.try_dequeue().is_none());
        }
    }

    #[tokio::test]
    async fn test_unicast_reaches_only_named_client() {
        let mut router = Router::new();
        let mut engine_sides: Vec<_> = (1..=3).map(|n| router.open_client(client(n))).collect();

        assert_eq!(router.route(Message::ack(client(2), 9)).await.unwrap(), 1);

        assert!(engine_sides[0].0.try_dequeue().is_none());
        assert_eq!(
            engine_sides[1].0.try_dequeue().unwrap().payload().as_ack(),
            Some(9)
        );
        assert!(engine_sides[2].0.try_dequeue().is_none());
    }

    #[tokio::test]
    async fn test_unknown_destination_leaves_queues_untouched() {
        let mut router = Router::new();
        let mut engine_sides: Vec<_> = (1..=2).map(|n| router.open_client(client(n))).collect();

        let stale = client(7);
        match router.route(Message::ack(stale, 1)).await {
            Err(NetworkError::UnknownDestination(addr)) => assert_eq!(addr, stale),
            other => panic!("expected UnknownDestination, got {:?}", other),
        }

        for (outbound, _) in &mut engine_sides {
            assert!(outbound.try_dequeue().is_none());
        }
    }

    #[test]
    fn test_inbound_stamped_with_registered_origin() {
        let mut router = Router::new();
        let (_outbound, engine_inbound) = router.open_client(client(1));
        let (shared, mut received) = message_queue();

        // Whatever the client claimed, the registered address wins
        engine_inbound
            .enqueue(Message::internal(Address::new([6, 6, 6, 6], 6), "hello"))
            .unwrap();
        engine_inbound
            .enqueue(Message::ack(Address::BROADCAST, 2))
            .unwrap();

        assert_eq!(router.collect_inbound(&shared), 2);

        let first = received.try_dequeue().unwrap();
        assert_eq!(first.address(), client(1));
        assert_eq!(first.payload(), &Payload::Internal("hello".to_string()));
        assert_eq!(received.try_dequeue().unwrap().address(), client(1));
    }

    #[tokio::test]
    async fn test_shutdown_notice_removes_client() {
        let mut router = Router::new();
        let (mut outbound, engine_inbound) = router.open_client(client(1));
        let (_other_outbound, _other_inbound) = router.open_client(client(2));
        let (shared, mut received) = message_queue();

        engine_inbound
            .enqueue(Message::ack(Address::BROADCAST, 1))
            .unwrap();
        engine_inbound.enqueue(Message::shutdown_sentinel()).unwrap();

        assert_eq!(router.collect_inbound(&shared), 1);
        assert_eq!(router.clients(), vec![client(2)]);
        assert!(!router.contains(&client(1)));

        // The notice itself never reaches the application
        assert_eq!(received.try_dequeue().unwrap().payload().as_ack(), Some(1));
        assert!(received.try_dequeue().is_none());

        // The removed client's transmit side sees its queue closed
        assert!(outbound.try_dequeue().is_none());
        assert!(matches!(
            router.route(Message::ack(client(1), 1)).await,
            Err(NetworkError::UnknownDestination(_))
        ));
    }

    #[tokio::test]
    async fn test_inbound_signals_activity() {
        let mut router = Router::new();
        let activity = router.activity();
        let (_outbound, engine_inbound) = router.open_client(client(1));

        engine_inbound
            .enqueue(Message::ack(Address::BROADCAST, 1))
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_millis(100), activity.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reopen_replaces_registration() {
        let mut router = Router::new();
        let (mut first_outbound, _first_inbound) = router.open_client(client(1));
        let (mut second_outbound, _second_inbound) = router.open_client(client(1));

        assert_eq!(router.len(), 1);
        router.route(Message::ack(client(1), 3)).await.unwrap();

        assert!(first_outbound.try_dequeue().is_none());
        assert_eq!(second_outbound.try_dequeue().unwrap().payload().as_ack(), Some(3));
    }

    #[tokio::test]
    async fn test_broadcast_encodes_payload_once() {
        let mut router = Router::new();
        let mut engine_sides: Vec<_> = (1..=3).map(|n| router.open_client(client(n))).collect();

        let frame = RgbImage::from_pixel(64, 48, Rgb([40, 80, 120]));
        let delivered = router
            .route(Message::image(Address::BROADCAST, frame))
            .await
            .unwrap();
        assert_eq!(delivered, 3);

        let copies: Vec<_> = engine_sides
            .iter_mut()
            .map(|(outbound, _)| outbound.try_dequeue().unwrap())
            .collect();
        let shared = copies[0].encoded_payload().unwrap().as_ptr();
        for copy in &copies {
            assert_eq!(copy.encoded_payload().unwrap().as_ptr(), shared);
        }
    }

    #[tokio::test]
    async fn test_unencodable_broadcast_reaches_nobody() {
        let mut router = Router::new();
        let mut engine_sides: Vec<_> = (1..=2).map(|n| router.open_client(client(n))).collect();

        let text = "x".repeat(MAX_MESSAGE_SIZE + 1);
        let result = router.route(Message::internal(Address::BROADCAST, text)).await;
        assert!(matches!(result, Err(NetworkError::MessageTooLarge(..))));

        for (outbound, _) in &mut engine_sides {
            assert!(outbound.try_dequeue().is_none());
        }
    }
}
