//! Wire codec for the control and data channels.
//!
//! Control frames are a 4-byte big-endian length followed by a JSON object.
//! State commands are a single signed byte. UDP datagrams start with a
//! 12-byte header of seconds, microseconds and packet id, all big-endian.

use crate::cookie::Cookie;
use crate::error::{Iperf3Error, Result};
use crate::protocol::{
    Command, ServerErrorCode, COOKIE_SIZE, MAX_CONTROL_FRAME, UDP_CONNECT_MSG, UDP_CONNECT_REPLY,
    UDP_HEADER_SIZE, UDP_TERMINATOR_FLAG,
};
use crate::transport::{Connection, Received};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::time::Duration;
use tokio::time::Instant;

/// Serialize `record` into a length-prefixed control frame
pub fn encode_control<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(record)?;
    if payload.len() > MAX_CONTROL_FRAME {
        return Err(Iperf3Error::MalformedFrame(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_CONTROL_FRAME
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Validate a length prefix against the frame size bound
pub fn frame_length(prefix: [u8; 4]) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_CONTROL_FRAME {
        return Err(Iperf3Error::MalformedFrame(format!(
            "declared length {} exceeds the {} byte limit",
            len, MAX_CONTROL_FRAME
        )));
    }
    Ok(len)
}

/// Parse a control frame payload
pub fn parse_control<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(payload)?)
}

/// Write one control frame
pub async fn write_control<T: Serialize>(conn: &mut dyn Connection, record: &T) -> Result<()> {
    let frame = encode_control(record)?;
    conn.send(&frame).await?;
    Ok(())
}

/// Read one control frame, waiting at most `timeout` for all of it
pub async fn decode_control<T: DeserializeOwned>(
    conn: &mut dyn Connection,
    timeout: Duration,
) -> Result<T> {
    let deadline = Instant::now() + timeout;
    let mut prefix = [0u8; 4];
    read_exact_until(conn, &mut prefix, deadline, timeout).await?;
    let len = frame_length(prefix)?;

    let mut payload = vec![0u8; len];
    read_exact_until(conn, &mut payload, deadline, timeout).await?;
    parse_control(&payload)
}

/// Fill `buf` completely, waiting at most `timeout`
pub async fn read_exact(conn: &mut dyn Connection, buf: &mut [u8], timeout: Duration) -> Result<()> {
    read_exact_until(conn, buf, Instant::now() + timeout, timeout).await
}

async fn read_exact_until(
    conn: &mut dyn Connection,
    buf: &mut [u8],
    deadline: Instant,
    timeout: Duration,
) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match conn.receive(&mut buf[filled..], remaining).await? {
            Received::Data(n) => filled += n,
            Received::Empty => return Err(Iperf3Error::Timeout(timeout)),
            Received::Closed => return Err(connection_closed()),
        }
    }
    Ok(())
}

fn connection_closed() -> Iperf3Error {
    Iperf3Error::Transport(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "control connection closed by peer",
    ))
}

pub async fn send_command(conn: &mut dyn Connection, command: Command) -> Result<()> {
    conn.send(&[command.to_byte()]).await?;
    Ok(())
}

fn decode_command(byte: u8) -> Result<Command> {
    Command::from_byte(byte)
        .ok_or_else(|| Iperf3Error::Protocol(format!("Unknown command: {}", byte)))
}

/// Wait at most `timeout` for the next command byte
pub async fn read_command(conn: &mut dyn Connection, timeout: Duration) -> Result<Command> {
    let mut buf = [0u8; 1];
    read_exact(conn, &mut buf, timeout).await?;
    decode_command(buf[0])
}

/// Return a command if one is already waiting, without blocking
pub async fn poll_command(conn: &mut dyn Connection) -> Result<Option<Command>> {
    let mut buf = [0u8; 1];
    match conn.receive(&mut buf, Duration::ZERO).await? {
        Received::Data(1) => decode_command(buf[0]).map(Some),
        Received::Data(_) | Received::Empty => Ok(None),
        Received::Closed => Err(connection_closed()),
    }
}

/// `SERVER_ERROR` followed by the error code and a zero errno
pub async fn send_server_error(conn: &mut dyn Connection, code: ServerErrorCode) -> Result<()> {
    let mut frame = Vec::with_capacity(9);
    frame.push(Command::ServerError.to_byte());
    frame.extend_from_slice(&(code as i32).to_be_bytes());
    frame.extend_from_slice(&0i32.to_be_bytes());
    conn.send(&frame).await?;
    Ok(())
}

/// Read the code and errno that follow a `SERVER_ERROR` command
pub async fn read_server_error(conn: &mut dyn Connection, timeout: Duration) -> Result<(i32, i32)> {
    let mut buf = [0u8; 8];
    read_exact(conn, &mut buf, timeout).await?;
    let code = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let errno = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    Ok((code, errno))
}

pub async fn send_cookie(conn: &mut dyn Connection, cookie: &Cookie) -> Result<()> {
    conn.send(&cookie.to_bytes()).await?;
    Ok(())
}

pub async fn read_cookie(conn: &mut dyn Connection, timeout: Duration) -> Result<Cookie> {
    let mut buf = [0u8; COOKIE_SIZE];
    read_exact(conn, &mut buf, timeout).await?;
    Cookie::from_bytes(&buf)
}

/// Datagram the client sends first on a UDP data stream
pub fn udp_connect_probe() -> [u8; 4] {
    UDP_CONNECT_MSG.to_le_bytes()
}

/// Server answer to the connect probe
pub fn udp_connect_reply() -> [u8; 4] {
    UDP_CONNECT_REPLY.to_le_bytes()
}

/// Header at the start of every UDP payload datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub sec: u32,
    pub usec: u32,
    pub id: u32,
}

impl UdpHeader {
    /// Header for datagram `sequence`, stamped with the current wall clock
    pub fn now(sequence: u32) -> Self {
        let now = chrono::Utc::now();
        Self {
            sec: now.timestamp() as u32,
            usec: now.timestamp_subsec_micros(),
            id: sequence & !UDP_TERMINATOR_FLAG,
        }
    }

    /// Header of the datagram that ends the test; `next_sequence` is the id
    /// the next payload datagram would have had
    pub fn terminator(next_sequence: u32) -> Self {
        let mut header = Self::now(next_sequence);
        header.id |= UDP_TERMINATOR_FLAG;
        header
    }

    pub fn is_terminator(&self) -> bool {
        self.id & UDP_TERMINATOR_FLAG != 0
    }

    pub fn sequence(&self) -> u32 {
        self.id & !UDP_TERMINATOR_FLAG
    }

    /// Write into the first `UDP_HEADER_SIZE` bytes of `buf`
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.sec.to_be_bytes());
        buf[4..8].copy_from_slice(&self.usec.to_be_bytes());
        buf[8..12].copy_from_slice(&self.id.to_be_bytes());
    }

    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < UDP_HEADER_SIZE {
            return None;
        }
        let word = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some(Self {
            sec: word(0),
            usec: word(4),
            id: word(8),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResultsMessage;
    use crate::transport::StreamConnection;
    use serde_json::json;

    #[test]
    fn test_encode_control_layout() {
        let frame = encode_control(&json!({"state": "ready"})).unwrap();
        let payload = br#"{"state":"ready"}"#;
        assert_eq!(&frame[..4], &(payload.len() as u32).to_be_bytes());
        assert_eq!(&frame[4..], payload);
    }

    #[tokio::test]
    async fn test_decode_control_from_split_reads() {
        let frame = encode_control(&json!({"bytes": 1024, "seconds": 1.5, "packets": null})).unwrap();
        let mock = tokio_test::io::Builder::new()
            .read(&frame[..2])
            .read(&frame[2..7])
            .read(&frame[7..])
            .build();
        let mut conn = StreamConnection::new(mock);

        let msg: ResultsMessage = decode_control(&mut conn, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(msg.bytes, Some(1024));
        assert_eq!(msg.seconds, Some(1.5));
        assert_eq!(msg.packets, None);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_before_reading() {
        let declared = (MAX_CONTROL_FRAME as u32 + 1).to_be_bytes();
        // Only the prefix is scripted; reading any payload would hit EOF instead
        let mock = tokio_test::io::Builder::new().read(&declared).build();
        let mut conn = StreamConnection::new(mock);

        let err = decode_control::<serde_json::Value>(&mut conn, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Iperf3Error::MalformedFrame(_)), "{err}");
    }

    #[tokio::test]
    async fn test_garbage_payload_is_malformed() {
        let mut frame = 5u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"{oops");
        let mock = tokio_test::io::Builder::new().read(&frame).build();
        let mut conn = StreamConnection::new(mock);

        let err = decode_control::<serde_json::Value>(&mut conn, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Iperf3Error::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn test_decode_control_times_out() {
        let (_keep, b) = tokio::io::duplex(64);
        let mut conn = StreamConnection::new(b);
        let err = decode_control::<serde_json::Value>(&mut conn, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Iperf3Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_commands_and_server_error() {
        let (a, b) = tokio::io::duplex(64);
        let mut tx = StreamConnection::new(a);
        let mut rx = StreamConnection::new(b);

        assert_eq!(poll_command(&mut rx).await.unwrap(), None);

        send_command(&mut tx, Command::TestStart).await.unwrap();
        send_server_error(&mut tx, ServerErrorCode::UnsupportedParameters)
            .await
            .unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(read_command(&mut rx, timeout).await.unwrap(), Command::TestStart);
        assert_eq!(read_command(&mut rx, timeout).await.unwrap(), Command::ServerError);
        assert_eq!(read_server_error(&mut rx, timeout).await.unwrap(), (1, 0));
    }

    #[tokio::test]
    async fn test_unknown_command_byte() {
        let mock = tokio_test::io::Builder::new().read(&[3]).build();
        let mut conn = StreamConnection::new(mock);
        assert!(matches!(
            read_command(&mut conn, Duration::from_secs(1)).await,
            Err(Iperf3Error::Protocol(_))
        ));
    }

    #[test]
    fn test_udp_header_layout() {
        let header = UdpHeader {
            sec: 1,
            usec: 2,
            id: 3,
        };
        let mut buf = [0u8; UDP_HEADER_SIZE];
        header.write_to(&mut buf);
        assert_eq!(buf, [0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]);
        assert_eq!(UdpHeader::parse(&buf), Some(header));
        assert_eq!(UdpHeader::parse(&buf[..8]), None);
    }

    #[test]
    fn test_udp_terminator_flag() {
        let fin = UdpHeader::terminator(42);
        assert!(fin.is_terminator());
        assert_eq!(fin.sequence(), 42);
        assert!(!UdpHeader::now(42).is_terminator());
    }
}
