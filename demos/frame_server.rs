//! Frame server demo
//!
//! Broadcasts a generated image frame to every connected client ten times a
//! second and prints the acknowledgements that come back.

use image::{Rgb, RgbImage};
use rust_frame_transport::{message_queue, Address, Message, Payload, ServerConfig, TcpServer};
use serde_json::json;
use std::time::Duration;

fn frame(tick: u32) -> RgbImage {
    RgbImage::from_fn(320, 240, |x, y| {
        Rgb([((x + tick) % 256) as u8, ((y + tick) % 256) as u8, (tick % 256) as u8])
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let bind = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2445".to_string());

    let (outgoing, outgoing_rx) = message_queue();
    let (received_tx, mut received) = message_queue();

    let mut server = TcpServer::new(ServerConfig::new(&bind), outgoing_rx, received_tx);
    server.start().await?;

    println!("Frame server listening on {}. Press Ctrl+C to stop.", bind);

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut tick = 0u32;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if server.client_count() == 0 {
                    continue;
                }
                tick = tick.wrapping_add(1);
                outgoing.enqueue(Message::image(Address::BROADCAST, frame(tick)))?;

                if tick % 50 == 0 {
                    let settings = json!({"frame": tick, "clients": server.client_count()});
                    outgoing.enqueue(Message::control_from(Address::BROADCAST, &settings)?)?;
                }
            }
            Some(message) = received.dequeue() => match message.payload() {
                Payload::Ack(code) => println!("ACK {} from {} ({:?})", code, message.address(), message.latency()),
                _ => println!("Received {}", message),
            },
        }
    }

    println!("\nShutting down...");
    server.stop().await?;

    println!("Server stopped.");

    Ok(())
}
