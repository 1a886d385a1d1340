//! Tests for client reconnection logic

use rust_frame_transport::{
    message_queue, Address, ClientConfig, ClientState, Message, MessageQueue, MessageStream,
    ServerConfig, TcpClient, TcpServer,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init()
        .ok();
}

/// A port nothing is listening on (yet)
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn client_for(port: u16, retry_interval: Duration) -> (TcpClient, MessageQueue, MessageStream) {
    let (outgoing, outgoing_rx) = message_queue();
    let (received_tx, received) = message_queue();
    let config = ClientConfig::new("127.0.0.1", port)
        .with_retry_interval(retry_interval)
        .with_connect_timeout(Duration::from_secs(2));

    (TcpClient::new(config, outgoing_rx, received_tx), outgoing, received)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A dropped connection is retried once, and not before the retry interval
#[tokio::test]
async fn test_reconnect_waits_for_retry_interval() {
    init_tracing();

    let interval = Duration::from_millis(500);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (mut client, _outgoing, _received) = client_for(port, interval);
    client.start().unwrap();

    // Accept and immediately kill the first connection
    let (first, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    drop(first);
    let dropped_at = Instant::now();

    wait_for(|| client.state() == ClientState::Disconnected).await;
    assert_eq!(client.connection_attempts(), 1);

    // Halfway through the interval nothing has been attempted
    sleep(interval / 2).await;
    assert_eq!(client.connection_attempts(), 1);

    let (_second, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    assert!(dropped_at.elapsed() >= interval);

    wait_for(|| client.is_connected()).await;
    assert_eq!(client.connection_attempts(), 2);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_retries_until_server_appears() {
    init_tracing();

    let port = free_port();
    let (mut client, _outgoing, _received) = client_for(port, Duration::from_millis(100));
    client.start().unwrap();

    sleep(Duration::from_millis(350)).await;
    assert!(!client.is_connected());
    let failed = client.connection_attempts();
    assert!((2..=5).contains(&failed), "unexpected attempt count {}", failed);

    let (_outgoing_tx, outgoing_rx) = message_queue();
    let (received_tx, _received_rx) = message_queue();
    let mut server = TcpServer::new(
        ServerConfig::new(format!("127.0.0.1:{}", port)),
        outgoing_rx,
        received_tx,
    );
    server.start().await.unwrap();

    wait_for(|| client.is_connected()).await;
    wait_for(|| server.client_count() == 1).await;

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_messages_queued_while_disconnected_are_sent_later() {
    init_tracing();

    let port = free_port();
    let (mut client, outgoing, _received) = client_for(port, Duration::from_millis(100));
    client.start().unwrap();

    outgoing
        .enqueue(Message::internal(Address::BROADCAST, "queued during outage"))
        .unwrap();
    sleep(Duration::from_millis(150)).await;

    let (_server_outgoing, outgoing_rx) = message_queue();
    let (received_tx, mut received) = message_queue();
    let mut server = TcpServer::new(
        ServerConfig::new(format!("127.0.0.1:{}", port)),
        outgoing_rx,
        received_tx,
    );
    server.start().await.unwrap();

    let message = received.dequeue_timeout(WAIT).await.expect("queued message lost");
    assert_eq!(message.payload().as_internal(), Some("queued during outage"));

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_reconnects_after_server_restart() {
    init_tracing();

    let port = free_port();
    let bind = format!("127.0.0.1:{}", port);

    let (_first_outgoing, outgoing_rx) = message_queue();
    let (received_tx, _first_received) = message_queue();
    let mut server = TcpServer::new(ServerConfig::new(&bind), outgoing_rx, received_tx);
    server.start().await.unwrap();

    let (mut client, outgoing, _received) = client_for(port, Duration::from_millis(200));
    client.start().unwrap();
    wait_for(|| client.is_connected()).await;

    server.stop().await.unwrap();
    wait_for(|| !client.is_connected()).await;

    let (_second_outgoing, outgoing_rx) = message_queue();
    let (received_tx, mut received) = message_queue();
    let mut server = TcpServer::new(ServerConfig::new(&bind), outgoing_rx, received_tx);
    server.start().await.unwrap();

    wait_for(|| client.is_connected()).await;
    assert!(client.connection_attempts() >= 2);

    outgoing
        .enqueue(Message::ack(Address::BROADCAST, 7))
        .unwrap();
    let message = received.dequeue_timeout(WAIT).await.expect("no ack after restart");
    assert_eq!(message.payload().as_ack(), Some(7));
    assert_eq!(message.address(), client.local_address().unwrap());

    client.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_while_disconnected() {
    init_tracing();

    let port = free_port();
    let (mut client, _outgoing, _received) = client_for(port, Duration::from_secs(30));
    client.start().unwrap();

    wait_for(|| client.connection_attempts() == 1).await;

    timeout(Duration::from_secs(1), client.stop())
        .await
        .expect("stop blocked on the retry interval")
        .unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);
}
