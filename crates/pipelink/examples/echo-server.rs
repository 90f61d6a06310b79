//! Minimal echo server: serves one client and echoes its messages back.
//!
//! Run with:
//!   cargo run --example echo-server --features peer
//!
//! In another terminal:
//!   cargo run --features cli -- send pipelink-echo-example \
//!     --json '{"hello":"world"}' --wait --wait-timeout 3s

use pipelink::peer::{CancellationToken, Endpoint, Event, Server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = Endpoint::new("pipelink-echo-example")?;
    let (server, mut events) = Server::raw(ServerConfig::single_connection(endpoint.clone()));

    let cancel = CancellationToken::new();
    server.start(&cancel).await?;
    eprintln!("Listening on {}", endpoint.address());

    while let Some(event) = events.recv().await {
        match event {
            Event::Connected { connection } => eprintln!("Client connected: {connection}"),
            Event::MessageReceived {
                connection,
                message,
            } => {
                eprintln!("Received {} bytes from {connection}", message.len());
                server.write_raw_to(connection, &message, &cancel).await?;
            }
            Event::ExceptionOccurred { error, .. } => eprintln!("Error: {error}"),
            Event::Disconnected { connection } => {
                eprintln!("Client disconnected: {connection}");
                break;
            }
        }
    }

    server.stop().await;
    Ok(())
}
