//! Configuration for the iperf3 client and server.

use crate::error::{Iperf3Error, Result};
use crate::protocol::{Direction, Protocol, TestParameters};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts and measurement knobs shared by both roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tuning {
    /// Bound on every handshake wait, in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Extra silence tolerated on the data connection beyond the test duration
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,

    /// Width of a reporting interval
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Longest single wait inside the transfer loop
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// How long a receiver keeps draining after the peer announced TEST_END
    #[serde(default = "default_linger")]
    pub linger_ms: u64,

    /// Allowed sender/receiver byte disagreement, as a fraction of the sender total
    #[serde(default = "default_tolerance_ratio")]
    pub tolerance_ratio: f64,
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_grace_period() -> u64 {
    2000
}

fn default_interval() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    50
}

fn default_linger() -> u64 {
    250
}

fn default_tolerance_ratio() -> f64 {
    0.05
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout(),
            grace_period_ms: default_grace_period(),
            interval_ms: default_interval(),
            poll_interval_ms: default_poll_interval(),
            linger_ms: default_linger(),
            tolerance_ratio: default_tolerance_ratio(),
        }
    }
}

impl Tuning {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

/// Configuration for an iperf3 client run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Host name or IP address of the server
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Control port (default: 5201)
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub protocol: Protocol,

    /// Test duration in seconds
    #[serde(default = "default_duration")]
    pub duration_seconds: u64,

    /// Block size; the protocol default when unset
    #[serde(default)]
    pub block_size_bytes: Option<usize>,

    /// UDP pacing target in bits/second (unpaced when unset)
    #[serde(default)]
    pub target_bandwidth: Option<u64>,

    /// Reverse mode: the server sends and this client receives
    #[serde(default)]
    pub reverse: bool,

    /// Warm-up seconds excluded from statistics
    #[serde(default)]
    pub omit_seconds: u64,

    #[serde(default)]
    pub tuning: Tuning,
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5201
}

fn default_duration() -> u64 {
    10
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            port: default_port(),
            protocol: Protocol::default(),
            duration_seconds: default_duration(),
            block_size_bytes: None,
            target_bandwidth: None,
            reverse: false,
            omit_seconds: 0,
            tuning: Tuning::default(),
        }
    }
}

impl ClientConfig {
    /// Client for `server_address` with every other setting at its default
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            ..Self::default()
        }
    }

    /// `host:port` of the server
    pub fn server_endpoint(&self) -> String {
        if self.server_address.contains(':') && !self.server_address.starts_with('[') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.server_address, self.port)
        } else {
            format!("{}:{}", self.server_address, self.port)
        }
    }

    /// The parameters this client will propose
    pub fn to_parameters(&self) -> Result<TestParameters> {
        let params = TestParameters {
            protocol: self.protocol,
            direction: if self.reverse {
                Direction::ServerToClient
            } else {
                Direction::ClientToServer
            },
            duration_seconds: self.duration_seconds,
            block_size_bytes: self
                .block_size_bytes
                .unwrap_or_else(|| self.protocol.default_block_size()),
            target_bandwidth: self.target_bandwidth.filter(|bw| *bw > 0),
            omit_seconds: self.omit_seconds,
        };
        params
            .validate()
            .map_err(|e| Iperf3Error::InvalidParameter(e.to_string()))?;
        Ok(params)
    }
}

/// Configuration for the iperf3 server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host/IP address to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Control port (default: 5201)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether UDP tests are accepted
    #[serde(default = "default_allow_udp")]
    pub allow_udp: bool,

    /// Maximum test duration in seconds (0 = unlimited)
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,

    /// Maximum UDP pacing target in bits/second (0 = unlimited)
    #[serde(default)]
    pub max_bandwidth: u64,

    #[serde(default)]
    pub tuning: Tuning,
}

fn default_allow_udp() -> bool {
    cfg!(feature = "udp")
}

fn default_max_duration() -> u64 {
    3600 // 1 hour max
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allow_udp: default_allow_udp(),
            max_duration_secs: default_max_duration(),
            max_bandwidth: 0,
            tuning: Tuning::default(),
        }
    }
}

impl ServerConfig {
    pub fn bind_endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Apply this server's policy to parameters a client proposed
    pub fn admit(&self, params: &TestParameters) -> Result<()> {
        params.validate()?;
        if params.protocol == Protocol::Udp && !self.allow_udp {
            return Err(Iperf3Error::UnsupportedParameters(
                "UDP tests are not supported by this server".to_string(),
            ));
        }
        let total = params.duration_seconds.saturating_add(params.omit_seconds);
        if self.max_duration_secs > 0 && total > self.max_duration_secs {
            return Err(Iperf3Error::UnsupportedParameters(format!(
                "duration {}s plus omit {}s exceeds the server limit of {}s",
                params.duration_seconds, params.omit_seconds, self.max_duration_secs
            )));
        }
        if let Some(bandwidth) = params.target_bandwidth {
            if self.max_bandwidth > 0 && bandwidth > self.max_bandwidth {
                return Err(Iperf3Error::UnsupportedParameters(format!(
                    "bandwidth {} bit/s exceeds the server limit of {} bit/s",
                    bandwidth, self.max_bandwidth
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints() {
        assert_eq!(ClientConfig::new("192.0.2.1").server_endpoint(), "192.0.2.1:5201");
        assert_eq!(ClientConfig::new("::1").server_endpoint(), "[::1]:5201");
        let server = ServerConfig {
            host: "::".to_string(),
            port: 5000,
            ..ServerConfig::default()
        };
        assert_eq!(server.bind_endpoint(), "[::]:5000");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"server_address": "10.0.0.1", "reverse": true}"#).unwrap();
        assert_eq!(config.port, 5201);
        assert_eq!(config.duration_seconds, 10);
        assert_eq!(config.tuning.linger_ms, 250);

        let params = config.to_parameters().unwrap();
        assert_eq!(params.direction, Direction::ServerToClient);
        assert_eq!(params.block_size_bytes, Protocol::Tcp.default_block_size());
    }

    #[test]
    fn test_zero_bandwidth_is_unpaced() {
        let config = ClientConfig {
            protocol: Protocol::Udp,
            target_bandwidth: Some(0),
            ..ClientConfig::default()
        };
        assert_eq!(config.to_parameters().unwrap().target_bandwidth, None);
    }

    #[test]
    fn test_admit_limits() {
        let server = ServerConfig {
            max_duration_secs: 30,
            max_bandwidth: 1_000_000,
            ..ServerConfig::default()
        };
        let mut params = ClientConfig::default().to_parameters().unwrap();
        assert!(server.admit(&params).is_ok());

        params.duration_seconds = 31;
        assert!(matches!(
            server.admit(&params),
            Err(Iperf3Error::UnsupportedParameters(_))
        ));

        // The warm-up window counts against the limit
        params.duration_seconds = 25;
        params.omit_seconds = 10;
        assert!(server.admit(&params).is_err());

        params.duration_seconds = 5;
        params.omit_seconds = 0;
        params.target_bandwidth = Some(2_000_000);
        assert!(server.admit(&params).is_err());

        let unlimited = ServerConfig {
            max_duration_secs: 0,
            ..ServerConfig::default()
        };
        params.target_bandwidth = None;
        params.duration_seconds = 50_000;
        assert!(unlimited.admit(&params).is_ok());
    }

    #[test]
    fn test_tuning_floors() {
        let tuning = Tuning {
            interval_ms: 0,
            poll_interval_ms: 0,
            ..Tuning::default()
        };
        assert_eq!(tuning.interval(), Duration::from_millis(1));
        assert_eq!(tuning.poll_interval(), Duration::from_millis(1));
    }
}
