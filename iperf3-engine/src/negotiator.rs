//! Handshake and teardown sequences on the control connection.
//!
//! Each function advances a [`Session`] through its states. Waits are
//! bounded by the handshake timeout; a timeout before the test starts
//! surfaces as `HandshakeTimeout` naming the state it happened in.

use crate::codec::{
    decode_control, read_command, read_cookie, read_exact, read_server_error, send_command,
    send_cookie, send_server_error, udp_connect_probe, udp_connect_reply, write_control,
};
use crate::config::{ServerConfig, Tuning};
use crate::cookie::{Cookie, CookieRegistry};
use crate::error::{Iperf3Error, Result};
use crate::protocol::{
    Command, ParamsMessage, Protocol, ResultsMessage, ServerErrorCode, TestParameters,
};
use crate::session::{Session, SessionState, StopHandle};
use crate::transport::{Acceptor, Channel, Connection, Connector, Received};
use std::io;
use std::time::Duration;
use tokio::time::Instant;

/// Spacing of UDP connect probes while waiting for the server's reply
const UDP_PROBE_INTERVAL_MS: u64 = 50;

/// Turn a plain timeout into a `HandshakeTimeout` for `state`
fn in_state(state: SessionState, timeout: Duration) -> impl FnOnce(Iperf3Error) -> Iperf3Error {
    move |e| match e {
        Iperf3Error::Timeout(_) => Iperf3Error::HandshakeTimeout { state, timeout },
        other => other,
    }
}

fn server_error(code: i32, errno: i32) -> Iperf3Error {
    if code == ServerErrorCode::UnsupportedParameters as i32
        || code == ServerErrorCode::BadParameters as i32
    {
        Iperf3Error::UnsupportedParameters(format!("rejected by server (code {})", code))
    } else {
        Iperf3Error::ServerError { code, errno }
    }
}

/// The error a command arriving out of turn stands for
pub async fn unexpected_command(
    control: &mut dyn Connection,
    command: Command,
    timeout: Duration,
) -> Iperf3Error {
    match command {
        Command::AccessDenied => Iperf3Error::AccessDenied,
        Command::ServerError => match read_server_error(control, timeout).await {
            Ok((code, errno)) => server_error(code, errno),
            Err(e) => e,
        },
        Command::ServerTerminate => Iperf3Error::Protocol("server terminated the test".to_string()),
        Command::ClientTerminate => Iperf3Error::Protocol("client terminated the test".to_string()),
        other => Iperf3Error::Protocol(format!("unexpected command {:?}", other)),
    }
}

/// Read the next command and fail unless it is `expected`
pub async fn expect_command(
    control: &mut dyn Connection,
    expected: Command,
    timeout: Duration,
) -> Result<()> {
    let command = read_command(control, timeout).await?;
    if command == expected {
        tracing::debug!("iperf3: received {:?}", command);
        Ok(())
    } else {
        Err(unexpected_command(control, command, timeout).await)
    }
}

/// Client side: from a fresh control connection to `Active`.
///
/// The session is left in `Error` when this fails.
pub async fn client_handshake(
    session: &mut Session,
    connector: &dyn Connector,
    params: &TestParameters,
    tuning: &Tuning,
    stop: &StopHandle,
) -> Result<()> {
    let outcome = client_steps(session, connector, params, tuning, stop).await;
    if outcome.is_err() {
        session.fail();
    }
    outcome
}

async fn client_steps(
    session: &mut Session,
    connector: &dyn Connector,
    params: &TestParameters,
    tuning: &Tuning,
    stop: &StopHandle,
) -> Result<()> {
    let timeout = tuning.handshake_timeout();
    let cookie = session
        .cookie()
        .cloned()
        .ok_or_else(|| Iperf3Error::Protocol("session has no cookie".to_string()))?;

    stop.check()?;
    send_cookie(session.control(), &cookie).await?;
    session.transition(SessionState::CookieSent)?;

    expect_command(session.control(), Command::ParamExchange, timeout)
        .await
        .map_err(in_state(SessionState::CookieSent, timeout))?;
    stop.check()?;
    write_control(session.control(), &params.to_message()).await?;
    session.set_params(params.clone())?;
    session.transition(SessionState::ParamsExchanged)?;

    expect_command(session.control(), Command::CreateStreams, timeout)
        .await
        .map_err(in_state(SessionState::ParamsExchanged, timeout))?;
    stop.check()?;
    let data = open_data(connector, params.protocol, &cookie, timeout)
        .await
        .map_err(in_state(SessionState::ParamsExchanged, timeout))?;
    session.attach_data(data);
    session.transition(SessionState::DataConnReady)?;

    expect_command(session.control(), Command::TestStart, timeout)
        .await
        .map_err(in_state(SessionState::DataConnReady, timeout))?;
    expect_command(session.control(), Command::TestRunning, timeout)
        .await
        .map_err(in_state(SessionState::DataConnReady, timeout))?;
    stop.check()?;
    session.transition(SessionState::Active)?;
    tracing::info!("iperf3: session {} test running", session.id);
    Ok(())
}

async fn open_data(
    connector: &dyn Connector,
    protocol: Protocol,
    cookie: &Cookie,
    timeout: Duration,
) -> Result<Box<dyn Connection>> {
    match protocol {
        Protocol::Tcp => {
            let mut data = tokio::time::timeout(timeout, connector.open(Channel::Stream))
                .await
                .map_err(|_| Iperf3Error::Timeout(timeout))??;
            send_cookie(data.as_mut(), cookie).await?;
            Ok(data)
        }
        Protocol::Udp => {
            let mut data = tokio::time::timeout(timeout, connector.open(Channel::Datagram))
                .await
                .map_err(|_| Iperf3Error::Timeout(timeout))??;
            udp_connect(data.as_mut(), timeout).await?;
            Ok(data)
        }
    }
}

/// Probe until the server answers; probes sent before its socket exists bounce
async fn udp_connect(data: &mut dyn Connection, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let probe_every = Duration::from_millis(UDP_PROBE_INTERVAL_MS);
    let mut reply = [0u8; 4];

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Iperf3Error::Timeout(timeout));
        }
        match data.send(&udp_connect_probe()).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
            Err(e) => return Err(e.into()),
        }

        let wait = probe_every.min(deadline.saturating_duration_since(now));
        match data.receive(&mut reply, wait).await {
            Ok(Received::Data(4)) if reply == udp_connect_reply() => {
                tracing::debug!("iperf3: UDP data stream connected");
                return Ok(());
            }
            Ok(Received::Data(n)) => {
                tracing::debug!("iperf3: ignoring {} byte reply while connecting", n);
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Server side: from an accepted control connection to `Active`.
///
/// The session is left in `Error` when this fails.
pub async fn server_handshake(
    session: &mut Session,
    acceptor: &mut dyn Acceptor,
    config: &ServerConfig,
    registry: &mut CookieRegistry,
    stop: &StopHandle,
) -> Result<()> {
    let outcome = server_steps(session, acceptor, config, registry, stop).await;
    if outcome.is_err() {
        session.fail();
    }
    outcome
}

async fn server_steps(
    session: &mut Session,
    acceptor: &mut dyn Acceptor,
    config: &ServerConfig,
    registry: &mut CookieRegistry,
    stop: &StopHandle,
) -> Result<()> {
    let timeout = config.tuning.handshake_timeout();

    let cookie = read_cookie(session.control(), timeout)
        .await
        .map_err(in_state(SessionState::Idle, timeout))?;
    if !registry.register(&cookie) {
        tracing::warn!("iperf3: cookie {} already in use, treating as a new session", cookie);
    }
    session.set_cookie(cookie.clone());
    session.transition(SessionState::CookieSent)?;

    stop.check()?;
    send_command(session.control(), Command::ParamExchange).await?;
    let message: ParamsMessage = match decode_control(session.control(), timeout).await {
        Ok(message) => message,
        Err(e @ Iperf3Error::MalformedFrame(_)) => {
            let _ = send_server_error(session.control(), ServerErrorCode::BadParameters).await;
            return Err(e);
        }
        Err(e) => return Err(in_state(SessionState::CookieSent, timeout)(e)),
    };
    tracing::debug!("iperf3: client parameters {:?}", message);

    let params = match TestParameters::from_message(&message).and_then(|p| {
        config.admit(&p)?;
        Ok(p)
    }) {
        Ok(params) => params,
        Err(e) => {
            tracing::warn!("iperf3: session {} rejected: {}", session.id, e);
            let _ = send_server_error(session.control(), ServerErrorCode::UnsupportedParameters).await;
            return Err(e);
        }
    };
    session.set_params(params.clone())?;
    session.transition(SessionState::ParamsExchanged)?;

    stop.check()?;
    send_command(session.control(), Command::CreateStreams).await?;
    let data = accept_data(acceptor, params.protocol, &cookie, timeout)
        .await
        .map_err(in_state(SessionState::ParamsExchanged, timeout))?;
    session.attach_data(data);
    session.transition(SessionState::DataConnReady)?;

    stop.check()?;
    send_command(session.control(), Command::TestStart).await?;
    send_command(session.control(), Command::TestRunning).await?;
    session.transition(SessionState::Active)?;
    tracing::info!(
        "iperf3: session {} test running ({} {:?}, {}s)",
        session.id,
        params.protocol,
        params.direction,
        params.duration_seconds
    );
    Ok(())
}

async fn accept_data(
    acceptor: &mut dyn Acceptor,
    protocol: Protocol,
    cookie: &Cookie,
    timeout: Duration,
) -> Result<Box<dyn Connection>> {
    let deadline = Instant::now() + timeout;
    match protocol {
        Protocol::Tcp => {
            let mut stray: Option<Cookie> = None;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let accepted = tokio::time::timeout(remaining, acceptor.accept(Channel::Stream)).await;
                let mut conn = match accepted {
                    Ok(conn) => conn?,
                    Err(_) => {
                        return Err(match stray {
                            Some(received) => Iperf3Error::CookieMismatch {
                                expected: cookie.to_string(),
                                received: received.to_string(),
                            },
                            None => Iperf3Error::Timeout(timeout),
                        })
                    }
                };

                let remaining = deadline.saturating_duration_since(Instant::now());
                match read_cookie(conn.as_mut(), remaining).await {
                    Ok(received) if &received == cookie => return Ok(conn),
                    Ok(received) => {
                        tracing::warn!(
                            "iperf3: data connection from {:?} with foreign cookie {}",
                            conn.peer_addr(),
                            received
                        );
                        let _ = send_command(conn.as_mut(), Command::AccessDenied).await;
                        let _ = conn.close().await;
                        stray = Some(received);
                    }
                    Err(e) => {
                        tracing::debug!("iperf3: dropping data connection without cookie: {}", e);
                    }
                }
            }
        }
        Protocol::Udp => {
            let mut conn = tokio::time::timeout(timeout, acceptor.accept(Channel::Datagram))
                .await
                .map_err(|_| Iperf3Error::Timeout(timeout))??;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let mut probe = [0u8; 4];
            read_exact(conn.as_mut(), &mut probe, remaining).await?;
            if probe != udp_connect_probe() {
                return Err(Iperf3Error::Protocol(format!(
                    "unexpected UDP connect message {:?}",
                    probe
                )));
            }
            conn.send(&udp_connect_reply()).await?;
            Ok(conn)
        }
    }
}

/// Client side of teardown: exchange results, then `IPERF_DONE`.
///
/// `requested` is true when `EXCHANGE_RESULTS` was already read.
pub async fn client_exchange_results(
    session: &mut Session,
    local: &ResultsMessage,
    requested: bool,
    tuning: &Tuning,
) -> Result<ResultsMessage> {
    let timeout = tuning.handshake_timeout();
    if !requested {
        expect_command(session.control(), Command::ExchangeResults, timeout).await?;
    }
    write_control(session.control(), local).await?;
    let peer: ResultsMessage = decode_control(session.control(), timeout).await?;
    session.transition(SessionState::ResultsExchanged)?;

    expect_command(session.control(), Command::DisplayResults, timeout).await?;
    send_command(session.control(), Command::IperfDone).await?;
    session.transition(SessionState::Closed)?;
    Ok(peer)
}

/// Server side of teardown. A client that hangs up instead of sending
/// `IPERF_DONE` still counts as finished.
pub async fn server_exchange_results(
    session: &mut Session,
    local: &ResultsMessage,
    tuning: &Tuning,
) -> Result<ResultsMessage> {
    let timeout = tuning.handshake_timeout();
    send_command(session.control(), Command::ExchangeResults).await?;
    let peer: ResultsMessage = decode_control(session.control(), timeout).await?;
    write_control(session.control(), local).await?;
    session.transition(SessionState::ResultsExchanged)?;

    send_command(session.control(), Command::DisplayResults).await?;
    match read_command(session.control(), timeout).await {
        Ok(Command::IperfDone) => {}
        Ok(other) => tracing::debug!("iperf3: expected IPERF_DONE, got {:?}", other),
        Err(e) => tracing::debug!("iperf3: client left before IPERF_DONE: {}", e),
    }
    session.transition(SessionState::Closed)?;
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use crate::transport::{StreamConnection, TcpAcceptor, TcpConnector};

    fn quick_tuning() -> Tuning {
        Tuning {
            handshake_timeout_secs: 1,
            ..Tuning::default()
        }
    }

    #[tokio::test]
    async fn test_timeout_named_by_state() {
        let (a, _b) = tokio::io::duplex(64);
        let mut session = Session::new(Role::Server, Box::new(StreamConnection::new(a)));
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig {
            tuning: quick_tuning(),
            ..ServerConfig::default()
        };
        let mut registry = CookieRegistry::new();

        let err = server_handshake(
            &mut session,
            &mut acceptor,
            &config,
            &mut registry,
            &StopHandle::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Iperf3Error::HandshakeTimeout {
                state: SessionState::Idle,
                ..
            }
        ));
        assert_eq!(session.state(), SessionState::Error);
    }

    async fn client_timeout_state(
        client: &mut Session,
        connector: &TcpConnector,
    ) -> Iperf3Error {
        let params = crate::ClientConfig::default().to_parameters().unwrap();
        client_handshake(client, connector, &params, &quick_tuning(), &StopHandle::new())
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_client_timeout_after_cookie() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = Session::new(Role::Client, Box::new(StreamConnection::new(a)));
        client.set_cookie(Cookie::generate());
        let mut peer = StreamConnection::new(b);
        let silent = async move {
            read_cookie(&mut peer, Duration::from_secs(1)).await.unwrap();
            peer
        };

        let connector = TcpConnector::new("127.0.0.1:9");
        let (err, _peer) = tokio::join!(client_timeout_state(&mut client, &connector), silent);
        assert!(matches!(
            err,
            Iperf3Error::HandshakeTimeout {
                state: SessionState::CookieSent,
                ..
            }
        ));
        assert_eq!(client.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_client_timeout_after_param_exchange() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = Session::new(Role::Client, Box::new(StreamConnection::new(a)));
        client.set_cookie(Cookie::generate());
        let mut peer = StreamConnection::new(b);
        let silent = async move {
            read_cookie(&mut peer, Duration::from_secs(1)).await.unwrap();
            send_command(&mut peer, Command::ParamExchange).await.unwrap();
            let _: ParamsMessage = decode_control(&mut peer, Duration::from_secs(1)).await.unwrap();
            peer
        };

        let connector = TcpConnector::new("127.0.0.1:9");
        let (err, _peer) = tokio::join!(client_timeout_state(&mut client, &connector), silent);
        assert!(matches!(
            err,
            Iperf3Error::HandshakeTimeout {
                state: SessionState::ParamsExchanged,
                ..
            }
        ));
        assert_eq!(client.state(), SessionState::Error);
        assert!(!client.has_data());
    }

    #[tokio::test]
    async fn test_client_timeout_waiting_for_test_start() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let connector = TcpConnector::new(acceptor.local_addr().unwrap().to_string());
        let (a, b) = tokio::io::duplex(1024);
        let mut client = Session::new(Role::Client, Box::new(StreamConnection::new(a)));
        client.set_cookie(Cookie::generate());
        let mut peer = StreamConnection::new(b);
        let silent = async move {
            read_cookie(&mut peer, Duration::from_secs(1)).await.unwrap();
            send_command(&mut peer, Command::ParamExchange).await.unwrap();
            let _: ParamsMessage = decode_control(&mut peer, Duration::from_secs(1)).await.unwrap();
            send_command(&mut peer, Command::CreateStreams).await.unwrap();
            let mut data = acceptor.accept(Channel::Stream).await.unwrap();
            read_cookie(data.as_mut(), Duration::from_secs(1)).await.unwrap();
            (peer, data)
        };

        let (err, _held) = tokio::join!(client_timeout_state(&mut client, &connector), silent);
        assert!(matches!(
            err,
            Iperf3Error::HandshakeTimeout {
                state: SessionState::DataConnReady,
                ..
            }
        ));
        assert_eq!(client.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_handshake_both_sides() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let connector = TcpConnector::new(addr.to_string());
        let tuning = quick_tuning();
        let config = ServerConfig {
            tuning: tuning.clone(),
            ..ServerConfig::default()
        };
        let params = crate::ClientConfig {
            duration_seconds: 1,
            ..crate::ClientConfig::default()
        }
        .to_parameters()
        .unwrap();

        let (client_control, server_control) = tokio::join!(
            connector.open(Channel::Stream),
            acceptor.accept(Channel::Stream)
        );
        let mut client = Session::new(Role::Client, client_control.unwrap());
        let mut server = Session::new(Role::Server, server_control.unwrap());
        let mut registry = CookieRegistry::new();
        client.set_cookie(registry.issue());
        let mut server_registry = CookieRegistry::new();
        let stop = StopHandle::new();

        let (c, s) = tokio::join!(
            client_handshake(&mut client, &connector, &params, &tuning, &stop),
            server_handshake(&mut server, &mut acceptor, &config, &mut server_registry, &stop)
        );
        c.unwrap();
        s.unwrap();

        assert_eq!(client.state(), SessionState::Active);
        assert_eq!(server.state(), SessionState::Active);
        assert_eq!(server.negotiated().unwrap(), client.negotiated().unwrap());
        assert_eq!(server.cookie(), client.cookie());
        assert!(server.has_data() && client.has_data());
        assert_eq!(server_registry.len(), 1);
    }

    #[tokio::test]
    async fn test_server_rejection_maps_to_unsupported() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = Session::new(Role::Client, Box::new(StreamConnection::new(a)));
        client.set_cookie(Cookie::generate());
        let mut peer = StreamConnection::new(b);

        let server = async move {
            let cookie = read_cookie(&mut peer, Duration::from_secs(1)).await.unwrap();
            send_command(&mut peer, Command::ParamExchange).await.unwrap();
            let _: ParamsMessage = decode_control(&mut peer, Duration::from_secs(1)).await.unwrap();
            send_server_error(&mut peer, ServerErrorCode::UnsupportedParameters)
                .await
                .unwrap();
            cookie
        };
        let params = crate::ClientConfig::default().to_parameters().unwrap();
        let connector = TcpConnector::new("127.0.0.1:9");
        let tuning = quick_tuning();
        let stop = StopHandle::new();
        let (result, cookie) = tokio::join!(
            client_handshake(&mut client, &connector, &params, &tuning, &stop),
            server
        );

        assert!(matches!(result, Err(Iperf3Error::UnsupportedParameters(_))));
        assert_eq!(Some(&cookie), client.cookie());
        assert!(!client.has_data());
        assert_eq!(client.state(), SessionState::Error);
    }

    #[tokio::test]
    async fn test_access_denied() {
        let (a, b) = tokio::io::duplex(1024);
        let mut client = Session::new(Role::Client, Box::new(StreamConnection::new(a)));
        client.set_cookie(Cookie::generate());
        let mut peer = StreamConnection::new(b);
        send_command(&mut peer, Command::AccessDenied).await.unwrap();

        let params = crate::ClientConfig::default().to_parameters().unwrap();
        let connector = TcpConnector::new("127.0.0.1:9");
        let err = client_handshake(
            &mut client,
            &connector,
            &params,
            &quick_tuning(),
            &StopHandle::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Iperf3Error::AccessDenied));
    }

    #[tokio::test]
    async fn test_stray_data_connection_is_refused() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let expected = Cookie::generate();
        let foreign = Cookie::generate();

        let stray = tokio::spawn(async move {
            let connector = TcpConnector::new(addr.to_string());
            let mut conn = connector.open(Channel::Stream).await.unwrap();
            send_cookie(conn.as_mut(), &foreign).await.unwrap();
            read_command(conn.as_mut(), Duration::from_secs(2)).await.unwrap()
        });

        let err = accept_data(
            &mut acceptor,
            Protocol::Tcp,
            &expected,
            Duration::from_millis(500),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, Iperf3Error::CookieMismatch { .. }));
        assert_eq!(stray.await.unwrap(), Command::AccessDenied);
    }
}
