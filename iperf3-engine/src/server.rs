//! iperf3 server: accepts control connections and runs their tests one at a time.

use crate::config::ServerConfig;
use crate::cookie::CookieRegistry;
use crate::engine::{ReceiveStop, Receiver, SendStop, Sender};
use crate::error::{Iperf3Error, Result};
use crate::negotiator::{self, expect_command, unexpected_command};
use crate::protocol::{Command, ResultsMessage, Role, TestParameters};
use crate::report::{results_message, FinalResult, Reporter, TestReport};
use crate::session::{Session, StopHandle};
use crate::transport::{Acceptor, Channel, Connection, TcpAcceptor};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Stops a running [`Iperf3Server`] from another task
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown_tx: broadcast::Sender<()>,
    stop: StopHandle,
}

impl ShutdownHandle {
    /// Cancel the current test (if any) and leave the accept loop
    pub fn shutdown(&self) {
        self.stop.stop();
        let _ = self.shutdown_tx.send(());
    }
}

/// The iperf3 server
pub struct Iperf3Server<A: Acceptor = TcpAcceptor> {
    /// Server configuration
    config: ServerConfig,

    acceptor: A,

    /// Cookies of sessions in progress
    cookies: CookieRegistry,

    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,

    stop: StopHandle,
}

impl Iperf3Server<TcpAcceptor> {
    /// Bind the control port given by `config`
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let acceptor = TcpAcceptor::bind(&config.bind_endpoint()).await?;
        Ok(Self::with_acceptor(config, acceptor))
    }
}

impl<A: Acceptor> Iperf3Server<A> {
    pub fn with_acceptor(config: ServerConfig, acceptor: A) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            acceptor,
            cookies: CookieRegistry::new(),
            shutdown_tx,
            stop: StopHandle::new(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.acceptor.local_addr()?)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Number of sessions currently holding a cookie
    pub fn session_count(&self) -> usize {
        self.cookies.len()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            stop: self.stop.clone(),
        }
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        self.shutdown_handle().shutdown();
    }

    /// Serve tests until shut down, handing every outcome to `on_result`
    pub async fn run<F>(mut self, mut on_result: F) -> Result<()>
    where
        F: FnMut(Result<TestReport>) + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::info!("iperf3 server listening on {}", self.acceptor.local_addr()?);

        loop {
            if self.stop.is_stopped() {
                break;
            }
            tokio::select! {
                accept_result = self.acceptor.accept(Channel::Stream) => {
                    match accept_result {
                        Ok(control) => {
                            let outcome = self.serve(control).await;
                            on_result(outcome);
                        }
                        Err(e) => {
                            tracing::error!("iperf3: Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        tracing::info!("iperf3 server shutting down");
        Ok(())
    }

    /// Accept one control connection and run its test
    pub async fn serve_one(&mut self) -> Result<TestReport> {
        if self.stop.is_stopped() {
            return Err(Iperf3Error::Shutdown);
        }
        let control = self.acceptor.accept(Channel::Stream).await?;
        self.serve(control).await
    }

    async fn serve(&mut self, control: Box<dyn Connection>) -> Result<TestReport> {
        let mut session = Session::new(Role::Server, control);
        tracing::info!(
            "iperf3: New connection from {:?} (session {})",
            session.control().peer_addr(),
            session.id
        );

        let outcome = self.drive(&mut session).await;
        if let Some(cookie) = session.cookie() {
            self.cookies.release(cookie);
        }
        match &outcome {
            Ok(report) => tracing::info!(
                "iperf3: Session {} complete: {} bytes in {:.2}s",
                session.id,
                report.result.total_bytes,
                report.result.elapsed_seconds
            ),
            Err(e) => tracing::error!("iperf3: Session {} failed: {}", session.id, e),
        }
        outcome
    }

    async fn drive(&mut self, session: &mut Session) -> Result<TestReport> {
        negotiator::server_handshake(
            session,
            &mut self.acceptor,
            &self.config,
            &mut self.cookies,
            &self.stop,
        )
        .await?;

        let params = session.negotiated()?.clone();
        let tuning = &self.config.tuning;
        let mut reporter = Reporter::new(
            params.protocol,
            params.direction.is_sender(Role::Server),
            Duration::from_secs(params.omit_seconds),
            tuning.interval(),
        );

        match self.transfer(session, &params, &mut reporter).await {
            Ok((local, peer)) => Ok(TestReport::assemble(
                session,
                params,
                reporter.take_intervals(),
                local,
                Some(&peer),
                tuning.tolerance_ratio,
            )),
            Err(cause) => {
                session.fail();
                session.detach_data().await;
                let mut local = reporter.finish(Instant::now(), false);
                local.complete = false;
                let partial = TestReport::assemble(
                    session,
                    params,
                    reporter.take_intervals(),
                    local,
                    None,
                    tuning.tolerance_ratio,
                );
                Err(Iperf3Error::Aborted {
                    cause: Box::new(cause),
                    partial: Box::new(partial),
                })
            }
        }
    }

    /// From `Active` to `Closed`
    async fn transfer(
        &self,
        session: &mut Session,
        params: &TestParameters,
        reporter: &mut Reporter,
    ) -> Result<(FinalResult, ResultsMessage)> {
        let tuning = &self.config.tuning;
        let timeout = tuning.handshake_timeout();
        let deadline = reporter.deadline(Duration::from_secs(params.duration_seconds));
        let (control, data) = session.channels()?;

        if params.direction.is_sender(Role::Server) {
            let mut sender = Sender::new(params, tuning, &self.stop);
            let stopped = sender.run(data, Some(&mut *control), reporter, deadline).await?;
            sender.finish(data).await;
            match stopped {
                SendStop::Peer(Command::TestEnd) => {}
                SendStop::Peer(command) => {
                    return Err(unexpected_command(control, command, timeout).await)
                }
                SendStop::Deadline => expect_command(control, Command::TestEnd, timeout).await?,
            }
        } else {
            let mut receiver = Receiver::new(params, tuning, &self.stop);
            match receiver.run(data, Some(&mut *control), reporter, None).await? {
                ReceiveStop::Peer(Command::TestEnd) => {
                    let linger_until = Instant::now() + tuning.linger();
                    receiver.run(data, None, reporter, Some(linger_until)).await?;
                }
                ReceiveStop::Peer(command) => {
                    return Err(unexpected_command(control, command, timeout).await)
                }
                ReceiveStop::EndOfStream | ReceiveStop::Deadline => {
                    expect_command(control, Command::TestEnd, timeout).await?
                }
            }
        }

        let local = reporter.finish(Instant::now(), true);
        session.detach_data().await;
        let peer =
            negotiator::server_exchange_results(session, &results_message(&local), tuning).await?;
        Ok((local, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Iperf3Server::bind(local_config()).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_run() {
        let server = Iperf3Server::bind(local_config()).await.unwrap();
        server.shutdown();
        let mut outcomes = 0;
        server.run(|_| outcomes += 1).await.unwrap();
        assert_eq!(outcomes, 0);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting() {
        let server = Iperf3Server::bind(local_config()).await.unwrap();
        let handle = server.shutdown_handle();
        let task = tokio::spawn(server.run(|_| {}));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_serve_one_after_shutdown() {
        let mut server = Iperf3Server::bind(local_config()).await.unwrap();
        server.shutdown();
        assert!(matches!(
            server.serve_one().await,
            Err(Iperf3Error::Shutdown)
        ));
    }
}
