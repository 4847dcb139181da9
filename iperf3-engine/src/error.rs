//! Error types for the iperf3 engine.

use crate::report::TestReport;
use crate::session::SessionState;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while running an iperf3 test
#[derive(Error, Debug)]
pub enum Iperf3Error {
    /// Transport error (connection reset, refused, ...)
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Control frame could not be decoded
    #[error("Malformed control frame: {0}")]
    MalformedFrame(String),

    /// Handshake did not progress in time
    #[error("Handshake timed out in state {state:?} after {timeout:?}")]
    HandshakeTimeout {
        state: SessionState,
        timeout: Duration,
    },

    /// Parameters the server cannot honour
    #[error("Unsupported parameters: {0}")]
    UnsupportedParameters(String),

    /// Data connection presented a cookie for another session
    #[error("Cookie mismatch: expected {expected}, got {received}")]
    CookieMismatch { expected: String, received: String },

    /// No data arrived on the data connection for too long
    #[error("Transfer stalled: no data for {idle:?}")]
    TransferStalled { idle: Duration },

    /// Session state machine was driven through an illegal edge
    #[error("Invalid session transition from {from:?} to {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    /// Invalid local configuration
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Server refused the connection
    #[error("Access denied by server")]
    AccessDenied,

    /// Server reported an error code
    #[error("Server error: code {code}, errno {errno}")]
    ServerError { code: i32, errno: i32 },

    /// Peer violated the control protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A bounded wait expired
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Test was cancelled by the caller
    #[error("Test cancelled")]
    Cancelled,

    /// Server is shutting down
    #[error("Server is shutting down")]
    Shutdown,

    /// Test failed after data transfer began; carries what was measured so far
    #[error("Test aborted: {cause}")]
    Aborted {
        cause: Box<Iperf3Error>,
        partial: Box<TestReport>,
    },
}

impl Iperf3Error {
    /// Partial measurements, when the failure happened after the test started
    pub fn partial_report(&self) -> Option<&TestReport> {
        match self {
            Iperf3Error::Aborted { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// The underlying failure, looking through `Aborted`
    pub fn root_cause(&self) -> &Iperf3Error {
        match self {
            Iperf3Error::Aborted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Iperf3Error {
    fn from(e: serde_json::Error) -> Self {
        Iperf3Error::MalformedFrame(e.to_string())
    }
}

/// Result type for iperf3 operations
pub type Result<T> = std::result::Result<T, Iperf3Error>;
