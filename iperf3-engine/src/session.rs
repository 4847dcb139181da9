//! Test session state for iperf3.

use crate::cookie::Cookie;
use crate::error::{Iperf3Error, Result};
use crate::protocol::{Role, TestParameters};
use crate::transport::Connection;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Cooperative cancellation flag shared with a running controller.
///
/// Checked between data blocks and between protocol steps.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once stopped
    pub fn check(&self) -> Result<()> {
        if self.is_stopped() {
            Err(Iperf3Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Lifecycle of a session.
///
/// `Idle → CookieSent → ParamsExchanged → DataConnReady → Active →
/// ResultsExchanged → Closed`, with `Error` reachable from every
/// non-terminal state. `Closed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    CookieSent,
    ParamsExchanged,
    DataConnReady,
    Active,
    ResultsExchanged,
    Closed,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Error)
    }

    /// Whether the handshake is still in progress
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            SessionState::Idle
                | SessionState::CookieSent
                | SessionState::ParamsExchanged
                | SessionState::DataConnReady
        )
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Error) => !from.is_terminal(),
            (Idle, CookieSent)
            | (CookieSent, ParamsExchanged)
            | (ParamsExchanged, DataConnReady)
            | (DataConnReady, Active)
            | (Active, ResultsExchanged)
            | (ResultsExchanged, Closed) => true,
            _ => false,
        }
    }
}

/// One logical test run: its cookie, connections, parameters and state
pub struct Session {
    /// Local identifier, used in logs and reports
    pub id: Uuid,

    pub role: Role,

    pub started_at: DateTime<Utc>,

    cookie: Option<Cookie>,

    params: Option<TestParameters>,

    state: SessionState,

    /// Control connection
    control: Box<dyn Connection>,

    /// Data connection, once associated
    data: Option<Box<dyn Connection>>,
}

impl Session {
    /// Create a session around a freshly established control connection
    pub fn new(role: Role, control: Box<dyn Connection>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            started_at: Utc::now(),
            cookie: None,
            params: None,
            state: SessionState::Idle,
            control,
            data: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, rejecting edges the state machine does not have
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Iperf3Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("iperf3: session {} {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Enter `Error` unless the session already finished
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!("iperf3: session {} {:?} -> Error", self.id, self.state);
            self.state = SessionState::Error;
        }
    }

    pub fn cookie(&self) -> Option<&Cookie> {
        self.cookie.as_ref()
    }

    pub fn set_cookie(&mut self, cookie: Cookie) {
        self.cookie = Some(cookie);
    }

    pub fn params(&self) -> Option<&TestParameters> {
        self.params.as_ref()
    }

    /// Parameters are negotiated once
    pub fn set_params(&mut self, params: TestParameters) -> Result<()> {
        if self.params.is_some() {
            return Err(Iperf3Error::Protocol(
                "parameters already negotiated".to_string(),
            ));
        }
        self.params = Some(params);
        Ok(())
    }

    /// Negotiated parameters; an error before negotiation
    pub fn negotiated(&self) -> Result<&TestParameters> {
        self.params
            .as_ref()
            .ok_or_else(|| Iperf3Error::Protocol("parameters not negotiated yet".to_string()))
    }

    pub fn control(&mut self) -> &mut dyn Connection {
        self.control.as_mut()
    }

    pub fn attach_data(&mut self, data: Box<dyn Connection>) {
        self.data = Some(data);
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Close and drop the data connection
    pub async fn detach_data(&mut self) {
        if let Some(mut data) = self.data.take() {
            if let Err(e) = data.close().await {
                tracing::debug!("iperf3: session {} data close: {}", self.id, e);
            }
        }
    }

    /// Both connections at once, for the transfer loop
    pub fn channels(&mut self) -> Result<(&mut dyn Connection, &mut dyn Connection)> {
        let data = self
            .data
            .as_mut()
            .ok_or_else(|| Iperf3Error::Protocol("no data connection".to_string()))?;
        Ok((self.control.as_mut(), data.as_mut()))
    }
}
