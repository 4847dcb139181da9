//! iperf3 protocol definitions.
//!
//! The iperf3 protocol uses a control connection (TCP) and a data stream
//! (TCP or UDP) for testing.
//!
//! Control messages are JSON objects with a 4-byte length prefix (big-endian);
//! state changes travel as single signed bytes.

use crate::error::{Iperf3Error, Result};
use serde::{Deserialize, Serialize};

/// Cookie length on the wire, including the trailing NUL
pub const COOKIE_SIZE: usize = 37;

/// Size of the header at the start of every UDP datagram (sec, usec, id)
pub const UDP_HEADER_SIZE: usize = 12;

/// Sent by the client on a fresh UDP data socket so the server learns its address
pub const UDP_CONNECT_MSG: u32 = 123_456_789;

/// Server answer to `UDP_CONNECT_MSG`
pub const UDP_CONNECT_REPLY: u32 = 987_654_321;

/// Set on the packet id of the datagram that ends a UDP test
pub const UDP_TERMINATOR_FLAG: u32 = 0x8000_0000;

/// Upper bound on a control frame payload
pub const MAX_CONTROL_FRAME: usize = 128 * 1024;

/// Default TCP block size (128 KiB, as iperf3)
pub const DEFAULT_TCP_BLOCK_SIZE: usize = 128 * 1024;

/// Default UDP block size: an Ethernet MTU minus IP/UDP headers
pub const DEFAULT_UDP_BLOCK_SIZE: usize = 1500 - 42;

/// Largest TCP block accepted
pub const MAX_TCP_BLOCK_SIZE: usize = 1024 * 1024;

/// Largest UDP payload that fits in a datagram
pub const MAX_UDP_BLOCK_SIZE: usize = 65_507;

/// Version string advertised in the parameter message
/// Longest test duration any endpoint accepts, in seconds
pub const MAX_TEST_DURATION_SECS: u64 = 86_400;

/// Longest warm-up window any endpoint accepts, in seconds
pub const MAX_OMIT_SECS: u64 = 600;

pub const CLIENT_VERSION: &str = "3.6";

/// iperf3 protocol commands, exchanged as one signed byte on the control connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Command {
    TestStart = 1,
    TestRunning = 2,
    TestEnd = 4,
    ParamExchange = 9,
    CreateStreams = 10,
    ServerTerminate = 11,
    ClientTerminate = 12,
    ExchangeResults = 13,
    DisplayResults = 14,
    IperfStart = 15,
    IperfDone = 16,
    AccessDenied = -1,
    ServerError = -2,
}

impl Command {
    pub fn from_byte(b: u8) -> Option<Self> {
        // Convert to signed byte for proper comparison
        let signed = b as i8;
        match signed {
            1 => Some(Command::TestStart),
            2 => Some(Command::TestRunning),
            4 => Some(Command::TestEnd),
            9 => Some(Command::ParamExchange),
            10 => Some(Command::CreateStreams),
            11 => Some(Command::ServerTerminate),
            12 => Some(Command::ClientTerminate),
            13 => Some(Command::ExchangeResults),
            14 => Some(Command::DisplayResults),
            15 => Some(Command::IperfStart),
            16 => Some(Command::IperfDone),
            -1 => Some(Command::AccessDenied),
            -2 => Some(Command::ServerError),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self as i8) as u8
    }
}

/// Error codes carried after a `SERVER_ERROR` command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ServerErrorCode {
    /// Parameters were understood but cannot be honoured
    UnsupportedParameters = 1,
    /// Parameter message could not be parsed
    BadParameters = 2,
}

/// Transport protocol of the data stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn default_block_size(self) -> usize {
        match self {
            Protocol::Tcp => DEFAULT_TCP_BLOCK_SIZE,
            Protocol::Udp => DEFAULT_UDP_BLOCK_SIZE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

/// Which way the payload flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    /// Both at once; recognised on the wire but never run
    Bidirectional,
}

/// Side of the test a controller plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Direction {
    /// Whether `role` writes the payload in this direction
    pub fn is_sender(self, role: Role) -> bool {
        matches!(
            (self, role),
            (Direction::ClientToServer, Role::Client) | (Direction::ServerToClient, Role::Server)
        )
    }
}

/// Negotiated test parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestParameters {
    pub protocol: Protocol,
    pub direction: Direction,
    pub duration_seconds: u64,
    pub block_size_bytes: usize,
    /// UDP pacing target in bits/second
    pub target_bandwidth: Option<u64>,
    pub omit_seconds: u64,
}

impl TestParameters {
    /// Build the parameter message the client sends
    pub fn to_message(&self) -> ParamsMessage {
        ParamsMessage {
            protocol: Some(self.protocol.as_str().to_string()),
            tcp: (self.protocol == Protocol::Tcp).then_some(true),
            udp: (self.protocol == Protocol::Udp).then_some(true),
            omit: self.omit_seconds,
            time: self.duration_seconds,
            len: self.block_size_bytes as u64,
            bandwidth: self.target_bandwidth,
            parallel: 1,
            reverse: self.direction == Direction::ServerToClient,
            bidirectional: self.direction == Direction::Bidirectional,
            pacing_timer: 1000,
            client_version: CLIENT_VERSION.to_string(),
        }
    }

    /// Interpret a received parameter message
    ///
    /// Accepts both the `"protocol"` field and iperf3's `"tcp"`/`"udp"` flags.
    /// A bandwidth of zero means unpaced, the same as `null`.
    pub fn from_message(msg: &ParamsMessage) -> Result<Self> {
        let protocol = match (msg.protocol.as_deref(), msg.tcp, msg.udp) {
            (Some(p), _, _) if p.eq_ignore_ascii_case("tcp") => Protocol::Tcp,
            (Some(p), _, _) if p.eq_ignore_ascii_case("udp") => Protocol::Udp,
            (Some(p), _, _) => {
                return Err(Iperf3Error::UnsupportedParameters(format!(
                    "unknown protocol {:?}",
                    p
                )))
            }
            (None, _, Some(true)) => Protocol::Udp,
            (None, Some(true), _) => Protocol::Tcp,
            // iperf3 omits both flags only for SCTP
            (None, _, _) => {
                return Err(Iperf3Error::UnsupportedParameters(
                    "no supported protocol requested".to_string(),
                ))
            }
        };

        let direction = if msg.bidirectional {
            Direction::Bidirectional
        } else if msg.reverse {
            Direction::ServerToClient
        } else {
            Direction::ClientToServer
        };

        if msg.parallel > 1 {
            return Err(Iperf3Error::UnsupportedParameters(format!(
                "{} parallel streams requested, only 1 is supported",
                msg.parallel
            )));
        }

        Ok(Self {
            protocol,
            direction,
            duration_seconds: msg.time,
            block_size_bytes: msg.len as usize,
            target_bandwidth: msg.bandwidth.filter(|bw| *bw > 0),
            omit_seconds: msg.omit,
        })
    }

    /// Check the structural limits every endpoint enforces
    pub fn validate(&self) -> Result<()> {
        if self.direction == Direction::Bidirectional {
            return Err(Iperf3Error::UnsupportedParameters(
                "bidirectional tests are not supported".to_string(),
            ));
        }
        if self.duration_seconds == 0 {
            return Err(Iperf3Error::UnsupportedParameters(
                "test duration must be at least one second".to_string(),
            ));
        }
        if self.duration_seconds > MAX_TEST_DURATION_SECS {
            return Err(Iperf3Error::UnsupportedParameters(format!(
                "test duration {}s exceeds {}s",
                self.duration_seconds, MAX_TEST_DURATION_SECS
            )));
        }
        if self.omit_seconds > MAX_OMIT_SECS {
            return Err(Iperf3Error::UnsupportedParameters(format!(
                "omit {}s exceeds {}s",
                self.omit_seconds, MAX_OMIT_SECS
            )));
        }
        let (min, max) = match self.protocol {
            Protocol::Tcp => (1, MAX_TCP_BLOCK_SIZE),
            Protocol::Udp => (UDP_HEADER_SIZE, MAX_UDP_BLOCK_SIZE),
        };
        if self.block_size_bytes < min || self.block_size_bytes > max {
            return Err(Iperf3Error::UnsupportedParameters(format!(
                "block size {} outside {}..={} for {}",
                self.block_size_bytes, min, max, self.protocol
            )));
        }
        Ok(())
    }
}

/// Test parameters as they travel on the control connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParamsMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// iperf3 flag for TCP tests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<bool>,

    /// iperf3 flag for UDP tests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp: Option<bool>,

    /// Omit first N seconds from statistics
    #[serde(default)]
    pub omit: u64,

    /// Test duration in seconds
    #[serde(default = "default_duration")]
    pub time: u64,

    /// Block size for writes
    #[serde(default = "default_len")]
    pub len: u64,

    /// Pacing target (bits/second)
    #[serde(default)]
    pub bandwidth: Option<u64>,

    /// Number of parallel streams
    #[serde(default = "default_streams")]
    pub parallel: u32,

    /// Reverse mode: server sends to client
    #[serde(default)]
    pub reverse: bool,

    /// Bidirectional mode
    #[serde(default)]
    pub bidirectional: bool,

    /// Pacing timer in microseconds
    #[serde(default)]
    pub pacing_timer: u64,

    /// Client version string
    #[serde(default)]
    pub client_version: String,
}

fn default_duration() -> u64 {
    10
}

fn default_len() -> u64 {
    DEFAULT_TCP_BLOCK_SIZE as u64
}

fn default_streams() -> u32 {
    1
}

/// Per-stream entry of an iperf3 result message
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StreamResults {
    pub id: u32,
    pub bytes: u64,
    #[serde(default)]
    pub retransmits: i64,
    #[serde(default)]
    pub jitter: f64,
    /// Lost datagrams (UDP)
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub packets: u64,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub end_time: f64,
}

/// Results each side sends during `EXCHANGE_RESULTS`
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ResultsMessage {
    /// Total bytes counted by the sending endpoint
    #[serde(default)]
    pub bytes: Option<u64>,

    /// Measured seconds
    #[serde(default)]
    pub seconds: Option<f64>,

    /// Datagrams (UDP only)
    #[serde(default)]
    pub packets: Option<u64>,

    #[serde(default)]
    pub cpu_util_total: f64,
    #[serde(default)]
    pub cpu_util_user: f64,
    #[serde(default)]
    pub cpu_util_system: f64,
    #[serde(default)]
    pub sender_has_retransmits: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion_used: Option<String>,

    #[serde(default)]
    pub streams: Vec<StreamResults>,
}

impl ResultsMessage {
    /// Bytes reported by the peer, whichever form it used
    pub fn total_bytes(&self) -> Option<u64> {
        self.bytes
            .or_else(|| self.streams.first().map(|s| s.bytes))
    }

    pub fn total_seconds(&self) -> Option<f64> {
        self.seconds
            .or_else(|| self.streams.first().map(|s| s.end_time - s.start_time))
    }

    pub fn total_packets(&self) -> Option<u64> {
        self.packets.or_else(|| {
            self.streams
                .first()
                .map(|s| s.packets)
                .filter(|p| *p > 0)
        })
    }

    pub fn lost_packets(&self) -> Option<u64> {
        self.streams.first().map(|s| s.errors).filter(|e| *e > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(protocol: Protocol, direction: Direction) -> TestParameters {
        TestParameters {
            protocol,
            direction,
            duration_seconds: 5,
            block_size_bytes: protocol.default_block_size(),
            target_bandwidth: if protocol == Protocol::Udp {
                Some(10_000_000)
            } else {
                None
            },
            omit_seconds: 1,
        }
    }

    #[test]
    fn test_command_byte_conversion() {
        let commands = [
            Command::TestStart,
            Command::TestRunning,
            Command::TestEnd,
            Command::ParamExchange,
            Command::CreateStreams,
            Command::ServerTerminate,
            Command::ClientTerminate,
            Command::ExchangeResults,
            Command::DisplayResults,
            Command::IperfStart,
            Command::IperfDone,
            Command::AccessDenied,
            Command::ServerError,
        ];

        for command in commands {
            assert_eq!(Command::from_byte(command.to_byte()), Some(command));
        }
        assert_eq!(Command::AccessDenied.to_byte(), 0xff);
        assert_eq!(Command::from_byte(3), None);
    }

    #[test]
    fn test_parameters_survive_the_wire() {
        for protocol in [Protocol::Tcp, Protocol::Udp] {
            for direction in [Direction::ClientToServer, Direction::ServerToClient] {
                let sent = params(protocol, direction);
                let json = serde_json::to_vec(&sent.to_message()).unwrap();
                let msg: ParamsMessage = serde_json::from_slice(&json).unwrap();
                assert_eq!(TestParameters::from_message(&msg).unwrap(), sent);
            }
        }
    }

    #[test]
    fn test_parameter_message_fields() {
        let msg = params(Protocol::Udp, Direction::ServerToClient).to_message();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["protocol"], "udp");
        assert_eq!(json["udp"], true);
        assert_eq!(json["time"], 5);
        assert_eq!(json["omit"], 1);
        assert_eq!(json["len"], 1458);
        assert_eq!(json["bandwidth"], 10_000_000);
        assert_eq!(json["reverse"], true);

        let tcp = params(Protocol::Tcp, Direction::ClientToServer).to_message();
        let json = serde_json::to_value(&tcp).unwrap();
        assert!(json["bandwidth"].is_null());
        assert_eq!(json["tcp"], true);
    }

    #[test]
    fn test_iperf3_style_parameters() {
        // What a stock iperf3 client sends
        let raw = r#"{"tcp":true,"omit":0,"time":10,"num":0,"blockcount":0,
            "parallel":1,"len":131072,"pacing_timer":1000,"client_version":"3.16"}"#;
        let msg: ParamsMessage = serde_json::from_str(raw).unwrap();
        let params = TestParameters::from_message(&msg).unwrap();
        assert_eq!(params.protocol, Protocol::Tcp);
        assert_eq!(params.direction, Direction::ClientToServer);
        assert_eq!(params.block_size_bytes, 131072);
        assert_eq!(params.target_bandwidth, None);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_rejects_unsupported_requests() {
        let mut msg = params(Protocol::Tcp, Direction::ClientToServer).to_message();
        msg.parallel = 4;
        assert!(matches!(
            TestParameters::from_message(&msg),
            Err(Iperf3Error::UnsupportedParameters(_))
        ));

        let mut msg = params(Protocol::Tcp, Direction::ClientToServer).to_message();
        msg.protocol = Some("sctp".to_string());
        assert!(matches!(
            TestParameters::from_message(&msg),
            Err(Iperf3Error::UnsupportedParameters(_))
        ));

        let bidir = params(Protocol::Tcp, Direction::Bidirectional);
        assert!(bidir.validate().is_err());

        let mut tiny = params(Protocol::Udp, Direction::ClientToServer);
        tiny.block_size_bytes = 8;
        assert!(tiny.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_times() {
        let raw = r#"{"tcp":true,"omit":18446744073709551615,"time":1,"len":1024}"#;
        let msg: ParamsMessage = serde_json::from_str(raw).unwrap();
        let params = TestParameters::from_message(&msg).unwrap();
        assert!(matches!(
            params.validate(),
            Err(Iperf3Error::UnsupportedParameters(_))
        ));

        let mut long = params;
        long.omit_seconds = 0;
        long.duration_seconds = u64::MAX;
        assert!(long.validate().is_err());

        long.duration_seconds = MAX_TEST_DURATION_SECS;
        long.omit_seconds = MAX_OMIT_SECS;
        assert!(long.validate().is_ok());
    }

    #[test]
    fn test_results_message_fallbacks() {
        let raw = r#"{"cpu_util_total":1,"streams":[{"id":1,"bytes":4096,
            "retransmits":0,"jitter":0,"errors":3,"packets":40,
            "start_time":0,"end_time":2.5}]}"#;
        let msg: ResultsMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.total_bytes(), Some(4096));
        assert_eq!(msg.total_seconds(), Some(2.5));
        assert_eq!(msg.total_packets(), Some(40));
        assert_eq!(msg.lost_packets(), Some(3));
    }
}
