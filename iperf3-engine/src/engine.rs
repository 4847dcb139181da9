//! Timed sender and receiver loops for the data connection.
//!
//! Both loops run inside the session's own task. Every wait is bounded by the
//! poll interval, so the stop handle and the control channel are looked at
//! regularly even when the data connection is idle.

use crate::codec::{poll_command, UdpHeader};
use crate::config::Tuning;
use crate::error::{Iperf3Error, Result};
use crate::protocol::{Command, Protocol, TestParameters, MAX_UDP_BLOCK_SIZE, UDP_HEADER_SIZE};
use crate::report::Reporter;
use crate::session::StopHandle;
use crate::transport::{Connection, Received};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Minimum spacing of non-blocking control polls during a transfer
const CONTROL_POLL_INTERVAL_MS: u64 = 10;

/// Copies of the end-of-test datagram, since any one of them may be dropped
const UDP_TERMINATOR_COUNT: usize = 3;

/// Why a sender loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStop {
    /// `omit + duration` elapsed
    Deadline,
    /// The peer sent a command on the control channel
    Peer(Command),
}

/// Why a receiver loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStop {
    /// TCP end of file or UDP terminator datagram
    EndOfStream,
    /// The caller's deadline passed
    Deadline,
    /// The peer sent a command on the control channel
    Peer(Command),
}

/// Longest silence tolerated on the data connection
pub fn stall_limit(params: &TestParameters, tuning: &Tuning) -> Duration {
    Duration::from_secs(params.omit_seconds.saturating_add(params.duration_seconds))
        .saturating_add(tuning.grace_period())
}

/// Leaky-bucket pacing for UDP datagrams
#[derive(Debug)]
struct Pacer {
    per_block: Duration,
    next_slot: Option<Instant>,
}

impl Pacer {
    fn new(bits_per_second: u64, block_size: usize) -> Self {
        let seconds = block_size as f64 * 8.0 / bits_per_second.max(1) as f64;
        Self {
            per_block: Duration::from_secs_f64(seconds),
            next_slot: None,
        }
    }

    /// When the next datagram may go out, if that is still in the future
    fn wait_until(&self, now: Instant) -> Option<Instant> {
        self.next_slot.filter(|slot| *slot > now)
    }

    /// A datagram went out at `now`. A sender that fell behind is allowed one
    /// slot of credit, not a burst.
    fn consumed(&mut self, now: Instant) {
        let floor = now.checked_sub(self.per_block).unwrap_or(now);
        let base = self.next_slot.map_or(now, |slot| slot.max(floor));
        self.next_slot = Some(base + self.per_block);
    }
}

/// Writes filler blocks until the deadline
pub struct Sender<'a> {
    protocol: Protocol,
    tuning: &'a Tuning,
    stop: &'a StopHandle,
    block: Vec<u8>,
    sequence: u32,
    pacer: Option<Pacer>,
    stall_limit: Duration,
}

impl<'a> Sender<'a> {
    pub fn new(params: &TestParameters, tuning: &'a Tuning, stop: &'a StopHandle) -> Self {
        let mut block = vec![0u8; params.block_size_bytes];
        rand::thread_rng().fill(&mut block[..]);
        let pacer = match (params.protocol, params.target_bandwidth) {
            (Protocol::Udp, Some(bandwidth)) => Some(Pacer::new(bandwidth, params.block_size_bytes)),
            _ => None,
        };
        Self {
            protocol: params.protocol,
            tuning,
            stop,
            block,
            sequence: 0,
            pacer,
            stall_limit: stall_limit(params, tuning),
        }
    }

    /// Id of the last datagram sent (UDP)
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Send until `deadline` or until the peer speaks on `control`
    pub async fn run(
        &mut self,
        data: &mut dyn Connection,
        mut control: Option<&mut dyn Connection>,
        reporter: &mut Reporter,
        deadline: Instant,
    ) -> Result<SendStop> {
        let control_every = Duration::from_millis(CONTROL_POLL_INTERVAL_MS);
        let mut next_control_poll = Instant::now();

        loop {
            self.stop.check()?;
            let now = Instant::now();
            reporter.tick(now);
            if now >= deadline {
                return Ok(SendStop::Deadline);
            }

            if let Some(ctrl) = control.as_deref_mut() {
                if now >= next_control_poll {
                    next_control_poll = now + control_every;
                    if let Some(command) = poll_command(ctrl).await? {
                        return Ok(SendStop::Peer(command));
                    }
                }
            }

            if let Some(slot) = self.pacer.as_ref().and_then(|p| p.wait_until(now)) {
                let wake = slot.min(deadline).min(now + self.tuning.poll_interval());
                tokio::time::sleep_until(wake).await;
                continue;
            }

            if self.protocol == Protocol::Udp {
                self.sequence = self.sequence.wrapping_add(1);
                UdpHeader::now(self.sequence).write_to(&mut self.block);
            }

            let sent = match tokio::time::timeout(self.stall_limit, data.send(&self.block)).await {
                Ok(sent) => sent?,
                Err(_) => {
                    return Err(Iperf3Error::TransferStalled {
                        idle: self.stall_limit,
                    })
                }
            };
            let sent_at = Instant::now();
            reporter.record(sent_at, sent as u64);
            if let Some(pacer) = &mut self.pacer {
                pacer.consumed(sent_at);
            }
        }
    }

    /// Signal end of data: TCP half-close, or UDP terminator datagrams
    pub async fn finish(&mut self, data: &mut dyn Connection) {
        match self.protocol {
            Protocol::Tcp => {
                if let Err(e) = data.close().await {
                    tracing::debug!("iperf3: data half-close failed: {}", e);
                }
            }
            Protocol::Udp => {
                let mut buf = [0u8; UDP_HEADER_SIZE];
                UdpHeader::terminator(self.sequence.wrapping_add(1)).write_to(&mut buf);
                for _ in 0..UDP_TERMINATOR_COUNT {
                    if let Err(e) = data.send(&buf).await {
                        tracing::debug!("iperf3: terminator datagram not sent: {}", e);
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arrival {
    InOrder,
    Gap(u64),
    Late,
}

/// Tracks UDP packet ids, which start at 1
#[derive(Debug)]
struct SequenceTracker {
    expected: u32,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self { expected: 1 }
    }
}

impl SequenceTracker {
    fn observe(&mut self, sequence: u32) -> Arrival {
        if sequence == self.expected {
            self.expected = sequence.wrapping_add(1);
            Arrival::InOrder
        } else if sequence > self.expected {
            let gap = (sequence - self.expected) as u64;
            self.expected = sequence.wrapping_add(1);
            Arrival::Gap(gap)
        } else {
            Arrival::Late
        }
    }

    /// Datagrams missing at the end, given the id the terminator announced
    fn finish(&mut self, next_sequence: u32) -> u64 {
        let missing = next_sequence.saturating_sub(self.expected) as u64;
        self.expected = self.expected.max(next_sequence);
        missing
    }
}

/// Drains the data connection and accounts what arrives
pub struct Receiver<'a> {
    protocol: Protocol,
    tuning: &'a Tuning,
    stop: &'a StopHandle,
    buf: Vec<u8>,
    tracker: SequenceTracker,
    last_data: Instant,
    stall_limit: Duration,
    ended: bool,
}

impl<'a> Receiver<'a> {
    pub fn new(params: &TestParameters, tuning: &'a Tuning, stop: &'a StopHandle) -> Self {
        let size = match params.protocol {
            Protocol::Tcp => params.block_size_bytes,
            Protocol::Udp => MAX_UDP_BLOCK_SIZE.max(params.block_size_bytes),
        };
        Self {
            protocol: params.protocol,
            tuning,
            stop,
            buf: vec![0u8; size],
            tracker: SequenceTracker::default(),
            last_data: Instant::now(),
            stall_limit: stall_limit(params, tuning),
            ended: false,
        }
    }

    /// Whether the peer already signalled end of data
    pub fn ended(&self) -> bool {
        self.ended
    }

    /// Receive until end of stream, `until`, or a command on `control`.
    ///
    /// May be called again after returning; a stream that already ended
    /// returns `EndOfStream` straight away.
    pub async fn run(
        &mut self,
        data: &mut dyn Connection,
        mut control: Option<&mut dyn Connection>,
        reporter: &mut Reporter,
        until: Option<Instant>,
    ) -> Result<ReceiveStop> {
        let control_every = Duration::from_millis(CONTROL_POLL_INTERVAL_MS);
        let mut next_control_poll = Instant::now();

        loop {
            self.stop.check()?;
            let now = Instant::now();
            reporter.tick(now);
            if self.ended {
                return Ok(ReceiveStop::EndOfStream);
            }
            if until.map_or(false, |until| now >= until) {
                return Ok(ReceiveStop::Deadline);
            }

            if let Some(ctrl) = control.as_deref_mut() {
                if now >= next_control_poll {
                    next_control_poll = now + control_every;
                    if let Some(command) = poll_command(ctrl).await? {
                        return Ok(ReceiveStop::Peer(command));
                    }
                }
            }

            let mut wait = self.tuning.poll_interval();
            if let Some(until) = until {
                wait = wait.min(until.saturating_duration_since(now));
            }

            match data.receive(&mut self.buf, wait).await? {
                Received::Data(n) => {
                    let at = Instant::now();
                    self.last_data = at;
                    self.consume(n, at, reporter);
                }
                Received::Empty => {
                    let idle = Instant::now().saturating_duration_since(self.last_data);
                    if idle > self.stall_limit {
                        return Err(Iperf3Error::TransferStalled { idle });
                    }
                }
                Received::Closed => self.ended = true,
            }
        }
    }

    fn consume(&mut self, n: usize, at: Instant, reporter: &mut Reporter) {
        if self.protocol == Protocol::Tcp {
            reporter.record(at, n as u64);
            return;
        }

        // Connect probes and other short strays carry no header
        let header = match UdpHeader::parse(&self.buf[..n]) {
            Some(header) => header,
            None => {
                tracing::debug!("iperf3: ignoring {} byte datagram", n);
                return;
            }
        };

        if header.is_terminator() {
            let missing = self.tracker.finish(header.sequence());
            if reporter.is_measuring(at) {
                reporter.record_loss(missing);
            }
            self.ended = true;
            return;
        }

        let counted = reporter.record(at, n as u64);
        match self.tracker.observe(header.sequence()) {
            Arrival::Gap(missing) if counted => reporter.record_loss(missing),
            Arrival::Late if counted => reporter.record_late(),
            _ => {}
        }
    }
}
