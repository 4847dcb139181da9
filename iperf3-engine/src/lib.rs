//! # iperf3-engine
//!
//! An iperf3-compatible bandwidth measurement engine in Rust.
//!
//! Both roles of the iperf3 control protocol are implemented: a client that
//! proposes a test and a server that accepts it. Each test negotiates its
//! parameters over a control connection, transfers filler data for a fixed
//! duration on a single data connection, then exchanges result summaries.
//!
//! ## Features
//!
//! - iperf3 wire format (cookie, state commands, length-prefixed JSON)
//! - TCP and UDP tests, in either direction (`reverse`)
//! - UDP pacing, loss and reordering accounting
//! - Warm-up (`omit`) window and per-interval statistics
//! - Pluggable transport through [`Connector`] and [`Acceptor`]
//! - Async/await based on Tokio
//!
//! ## Example
//!
//! ```no_run
//! use iperf3_engine::{run_client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ClientConfig {
//!         duration_seconds: 5,
//!         ..ClientConfig::new("192.0.2.10")
//!     };
//!     let report = run_client(config).await.unwrap();
//!     println!("{}", report);
//! }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod cookie;
pub mod engine;
pub mod error;
pub mod negotiator;
pub mod protocol;
pub mod report;
pub mod server;
pub mod session;
pub mod transport;

pub use client::Iperf3Client;
pub use config::{ClientConfig, ServerConfig, Tuning};
pub use cookie::Cookie;
pub use error::{Iperf3Error, Result};
pub use protocol::{Direction, Protocol, Role, TestParameters};
pub use report::{FinalResult, IntervalStat, ResultMismatch, TestReport};
pub use server::{Iperf3Server, ShutdownHandle};
pub use session::{SessionState, StopHandle};
pub use transport::{Acceptor, Channel, Connection, Connector, Received, TcpAcceptor, TcpConnector};

/// Run one test against the server named in `config`
pub async fn run_client(config: ClientConfig) -> Result<TestReport> {
    Iperf3Client::new(config).run().await
}

/// Serve tests on the configured port until the future is dropped.
///
/// Every finished or failed session is passed to `on_result`.
pub async fn run_server<F>(config: ServerConfig, on_result: F) -> Result<()>
where
    F: FnMut(Result<TestReport>) + Send,
{
    Iperf3Server::bind(config).await?.run(on_result).await
}
