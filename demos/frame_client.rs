//! Frame client demo
//!
//! Connects to the frame server, reconnecting whenever the connection drops,
//! and acknowledges every frame it receives.

use rust_frame_transport::{message_queue, Address, ClientConfig, Message, Payload, TcpClient};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let host = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match std::env::args().nth(2) {
        Some(port) => port.parse()?,
        None => 2445,
    };

    let (outgoing, outgoing_rx) = message_queue();
    let (received_tx, mut received) = message_queue();

    let config = ClientConfig::new(&host, port).with_retry_interval(Duration::from_secs(1));
    let mut client = TcpClient::new(config, outgoing_rx, received_tx);
    client.start()?;

    println!("Connecting to {}:{}. Press Ctrl+C to stop.", host, port);

    let mut frames = 0u32;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(message) = received.dequeue() => match message.payload() {
                Payload::Image(image) => {
                    frames = frames.wrapping_add(1);
                    if frames % 10 == 0 {
                        println!(
                            "Frame {} ({}x{}, latency {:?})",
                            frames,
                            image.width(),
                            image.height(),
                            message.latency()
                        );
                    }
                    outgoing.enqueue(Message::ack(Address::BROADCAST, frames))?;
                }
                Payload::Control(settings) => println!("Control: {}", serde_json::Value::Object(settings.clone())),
                _ => println!("Received {}", message),
            },
        }
    }

    println!("\nShutting down...");
    client.stop().await?;

    println!("Client stopped after {} frames.", frames);

    Ok(())
}
