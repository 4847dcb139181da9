//! Simple iperf3 server example.
//!
//! Run with:
//! ```bash
//! cargo run --example simple_server [port]
//! ```
//!
//! Then test with:
//! ```bash
//! iperf3 -c 127.0.0.1 -t 5
//! cargo run --example simple_client 127.0.0.1
//! ```

use iperf3_engine::{Iperf3Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // IPERF3_LOG takes filter directives, e.g. "debug" or "iperf3_engine=trace"
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("IPERF3_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = ServerConfig::default();
    if let Some(port) = std::env::args().nth(1) {
        config.port = port.parse()?;
    }

    let server = Iperf3Server::bind(config).await?;
    println!("iperf3 server listening on {}", server.local_addr()?);
    println!("Press Ctrl+C to stop");

    // Handle Ctrl+C gracefully
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nShutting down...");
            shutdown.shutdown();
        }
    });

    server
        .run(|outcome| match outcome {
            Ok(report) => println!("{}", report),
            Err(e) => {
                eprintln!("Test failed: {}", e);
                if let Some(partial) = e.partial_report() {
                    eprintln!("{}", partial);
                }
            }
        })
        .await?;

    Ok(())
}
