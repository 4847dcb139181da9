//! Simple iperf3 client example.
//!
//! Run with:
//! ```bash
//! cargo run --example simple_client <server> [seconds] [-R] [-u] [-b bits/s] [--json]
//! ```

use iperf3_engine::{ClientConfig, Iperf3Client, Protocol};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let mut args = std::env::args().skip(1);
    let mut config = ClientConfig::new(args.next().unwrap_or_else(|| "127.0.0.1".to_string()));
    let mut json = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-R" => config.reverse = true,
            "-u" => config.protocol = Protocol::Udp,
            "-b" => config.target_bandwidth = args.next().map(|b| b.parse()).transpose()?,
            "--json" => json = true,
            seconds => config.duration_seconds = seconds.parse()?,
        }
    }

    let mut client = Iperf3Client::new(config);
    let stop = client.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    match client.run().await {
        Ok(report) if json => println!("{}", serde_json::to_string_pretty(&report)?),
        Ok(report) => println!("{}", report),
        Err(e) => {
            if let Some(partial) = e.partial_report() {
                println!("{}", partial);
            }
            return Err(e.into());
        }
    }
    Ok(())
}
