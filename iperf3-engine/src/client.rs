//! iperf3 client: drives one test from connect to report.

use crate::codec::send_command;
use crate::config::ClientConfig;
use crate::cookie::CookieRegistry;
use crate::engine::{ReceiveStop, Receiver, SendStop, Sender};
use crate::error::{Iperf3Error, Result};
use crate::negotiator::{self, unexpected_command};
use crate::protocol::{Command, ResultsMessage, Role, TestParameters};
use crate::report::{results_message, FinalResult, Reporter, TestReport};
use crate::session::{Session, SessionState, StopHandle};
use crate::transport::{Channel, Connector, TcpConnector};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info};

/// iperf3 client
pub struct Iperf3Client<C: Connector = TcpConnector> {
    config: ClientConfig,
    connector: C,
    cookies: CookieRegistry,
    stop: StopHandle,
}

impl Iperf3Client<TcpConnector> {
    /// Client connecting to `config.server_address:config.port` over TCP/UDP sockets
    pub fn new(config: ClientConfig) -> Self {
        let connector = TcpConnector::new(config.server_endpoint());
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> Iperf3Client<C> {
    pub fn with_connector(config: ClientConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            cookies: CookieRegistry::new(),
            stop: StopHandle::new(),
        }
    }

    /// Handle that cancels a running test from another task
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run one test.
    ///
    /// Failures before data transfer return the plain error. Failures after it
    /// return `Aborted` with the measurements collected so far.
    pub async fn run(&mut self) -> Result<TestReport> {
        let params = self.config.to_parameters()?;
        let timeout = self.config.tuning.handshake_timeout();
        self.stop.check()?;

        let control = tokio::time::timeout(timeout, self.connector.open(Channel::Stream))
            .await
            .map_err(|_| Iperf3Error::HandshakeTimeout {
                state: SessionState::Idle,
                timeout,
            })??;

        let mut session = Session::new(Role::Client, control);
        let cookie = self.cookies.issue();
        session.set_cookie(cookie.clone());
        info!(
            "iperf3: session {} connected to {} ({} {:?}, {}s)",
            session.id,
            self.config.server_endpoint(),
            params.protocol,
            params.direction,
            params.duration_seconds
        );

        let outcome = self.drive(&mut session, &params).await;
        self.cookies.release(&cookie);
        match &outcome {
            Ok(report) => info!(
                "iperf3: session {} complete: {} bytes in {:.2}s",
                session.id, report.result.total_bytes, report.result.elapsed_seconds
            ),
            Err(e) => error!("iperf3: session {} failed: {}", session.id, e),
        }
        outcome
    }

    async fn drive(&self, session: &mut Session, params: &TestParameters) -> Result<TestReport> {
        let tuning = &self.config.tuning;
        negotiator::client_handshake(session, &self.connector, params, tuning, &self.stop).await?;

        let sending = params.direction.is_sender(Role::Client);
        let mut reporter = Reporter::new(
            params.protocol,
            sending,
            Duration::from_secs(params.omit_seconds),
            tuning.interval(),
        );

        match self.transfer(session, params, &mut reporter).await {
            Ok((local, peer)) => Ok(TestReport::assemble(
                session,
                params.clone(),
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
                    params.clone(),
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

        let requested = if params.direction.is_sender(Role::Client) {
            let mut sender = Sender::new(params, tuning, &self.stop);
            match sender.run(data, Some(&mut *control), reporter, deadline).await? {
                SendStop::Deadline => {}
                SendStop::Peer(command) => {
                    return Err(unexpected_command(control, command, timeout).await)
                }
            }
            sender.finish(data).await;
            send_command(control, Command::TestEnd).await?;
            false
        } else {
            let mut receiver = Receiver::new(params, tuning, &self.stop);
            match receiver
                .run(data, Some(&mut *control), reporter, Some(deadline))
                .await?
            {
                ReceiveStop::Deadline | ReceiveStop::EndOfStream => {}
                ReceiveStop::Peer(command) => {
                    return Err(unexpected_command(control, command, timeout).await)
                }
            }
            send_command(control, Command::TestEnd).await?;

            // Drain what is still in flight
            let drain_until = Instant::now() + timeout;
            match receiver
                .run(data, Some(&mut *control), reporter, Some(drain_until))
                .await?
            {
                ReceiveStop::Peer(Command::ExchangeResults) => true,
                ReceiveStop::Peer(command) => {
                    return Err(unexpected_command(control, command, timeout).await)
                }
                ReceiveStop::Deadline | ReceiveStop::EndOfStream => false,
            }
        };

        let local = reporter.finish(Instant::now(), true);
        session.detach_data().await;
        let peer = negotiator::client_exchange_results(
            session,
            &results_message(&local),
            requested,
            tuning,
        )
        .await?;
        Ok((local, peer))
    }
}
