//! Minimal Lumberjack endpoint - accepts forwarder connections, logs every
//! received batch and acknowledges it immediately.
//!
//! ```sh
//! cargo run --example server -- 127.0.0.1:5044
//! ```

use timberwire::ServerBuilder;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5044".to_string());

    let mut server = ServerBuilder::new().bind(&addr).await?;
    info!("listening on {addr}");

    while let Some(batch) = server.receive().await {
        info!(
            events = batch.len(),
            remote = batch.remote_addr().unwrap_or("?"),
            "received batch"
        );
        batch.ack();
    }

    Ok(())
}
