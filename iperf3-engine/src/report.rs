//! Interval accounting, final results and their presentation.

use crate::protocol::{Protocol, ResultsMessage, Role, StreamResults, TestParameters};
use crate::session::Session;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Throughput sampled over one reporting interval
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntervalStat {
    /// Seconds since measurement started
    pub start_time: f64,
    pub end_time: f64,
    pub bytes_transferred: u64,
    /// Datagrams (UDP only)
    pub packets: Option<u64>,
}

impl IntervalStat {
    pub fn seconds(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn bits_per_second(&self) -> f64 {
        rate(self.bytes_transferred, self.seconds())
    }
}

/// Aggregate of a whole test as measured locally
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalResult {
    pub total_bytes: u64,
    pub elapsed_seconds: f64,
    /// Datagrams (UDP only)
    pub packets: Option<u64>,
    /// Missing datagrams (UDP receiver only)
    pub lost_packets: Option<u64>,
    /// Datagrams that arrived after a later one (UDP receiver only)
    pub out_of_order: Option<u64>,
    /// False when the test ended early; the figures are best effort
    pub complete: bool,
    /// Set when the peer's totals disagree with ours beyond tolerance
    pub mismatch: Option<ResultMismatch>,
}

impl FinalResult {
    pub fn mean_rate_bps(&self) -> f64 {
        rate(self.total_bytes, self.elapsed_seconds)
    }

    pub fn lost_percent(&self) -> Option<f64> {
        let lost = self.lost_packets?;
        let total = self.packets.unwrap_or(0) + lost;
        Some(if total == 0 {
            0.0
        } else {
            100.0 * lost as f64 / total as f64
        })
    }
}

fn rate(bytes: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        bytes as f64 * 8.0 / seconds
    } else {
        0.0
    }
}

/// Totals reported by the other endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerResult {
    pub bytes: Option<u64>,
    pub seconds: Option<f64>,
    pub packets: Option<u64>,
    pub lost_packets: Option<u64>,
}

impl From<&ResultsMessage> for PeerResult {
    fn from(msg: &ResultsMessage) -> Self {
        Self {
            bytes: msg.total_bytes(),
            seconds: msg.total_seconds(),
            packets: msg.total_packets(),
            lost_packets: msg.lost_packets(),
        }
    }
}

/// Sender and receiver totals that do not agree.
///
/// Never fatal; it annotates the result and is printed as a warning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultMismatch {
    pub sender_bytes: u64,
    /// Receiver bytes plus lost datagrams at the negotiated block size
    pub receiver_bytes: u64,
    pub tolerance_bytes: u64,
}

impl fmt::Display for ResultMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sender reported {} bytes but receiver accounted for {} (tolerance {})",
            self.sender_bytes, self.receiver_bytes, self.tolerance_bytes
        )
    }
}

/// Compare the two sides of a test.
///
/// The tolerance is the larger of two blocks and `ratio` of the sender total.
pub fn reconcile(
    local: &FinalResult,
    local_is_sender: bool,
    peer: &PeerResult,
    params: &TestParameters,
    ratio: f64,
) -> Option<ResultMismatch> {
    let peer_bytes = peer.bytes?;
    let (sender_bytes, received, lost) = if local_is_sender {
        (local.total_bytes, peer_bytes, peer.lost_packets)
    } else {
        (peer_bytes, local.total_bytes, local.lost_packets)
    };
    let block = params.block_size_bytes as u64;
    let receiver_bytes = received.saturating_add(lost.unwrap_or(0).saturating_mul(block));
    let tolerance_bytes = block
        .saturating_mul(2)
        .max((sender_bytes as f64 * ratio) as u64);

    if sender_bytes.abs_diff(receiver_bytes) > tolerance_bytes {
        Some(ResultMismatch {
            sender_bytes,
            receiver_bytes,
            tolerance_bytes,
        })
    } else {
        None
    }
}

/// Accumulates transfer progress into fixed-width intervals.
///
/// Bytes recorded during the omit window are dropped. Interval times are
/// relative to the end of the omit window.
#[derive(Debug)]
pub struct Reporter {
    protocol: Protocol,
    sending: bool,
    width: Duration,
    measure_from: Instant,
    interval_start: Instant,
    interval_bytes: u64,
    interval_packets: u64,
    intervals: Vec<IntervalStat>,
    total_bytes: u64,
    total_packets: u64,
    lost_packets: u64,
    out_of_order: u64,
    finished: Option<FinalResult>,
}

impl Reporter {
    pub fn new(protocol: Protocol, sending: bool, omit: Duration, width: Duration) -> Self {
        Self::starting_at(Instant::now(), protocol, sending, omit, width)
    }

    pub fn starting_at(
        start: Instant,
        protocol: Protocol,
        sending: bool,
        omit: Duration,
        width: Duration,
    ) -> Self {
        let measure_from = start.checked_add(omit).unwrap_or(start);
        Self {
            protocol,
            sending,
            width,
            measure_from,
            interval_start: measure_from,
            interval_bytes: 0,
            interval_packets: 0,
            intervals: Vec::new(),
            total_bytes: 0,
            total_packets: 0,
            lost_packets: 0,
            out_of_order: 0,
            finished: None,
        }
    }

    /// When the timed part of a `duration` test ends
    pub fn deadline(&self, duration: Duration) -> Instant {
        self.measure_from
            .checked_add(duration)
            .unwrap_or(self.measure_from)
    }

    pub fn is_measuring(&self, now: Instant) -> bool {
        now >= self.measure_from
    }

    /// Count one block or datagram. Returns false if it fell in the omit window.
    pub fn record(&mut self, now: Instant, bytes: u64) -> bool {
        if !self.is_measuring(now) || self.finished.is_some() {
            return false;
        }
        self.roll(now);
        self.interval_bytes += bytes;
        self.interval_packets += 1;
        self.total_bytes += bytes;
        self.total_packets += 1;
        true
    }

    pub fn record_loss(&mut self, lost: u64) {
        self.lost_packets += lost;
    }

    /// A datagram arrived after a later one; it was counted as lost before
    pub fn record_late(&mut self) {
        self.out_of_order += 1;
        self.lost_packets = self.lost_packets.saturating_sub(1);
    }

    /// Close intervals whose end has passed, even without traffic
    pub fn tick(&mut self, now: Instant) {
        if self.is_measuring(now) && self.finished.is_none() {
            self.roll(now);
        }
    }

    fn roll(&mut self, now: Instant) {
        while now >= self.interval_start + self.width {
            let end = self.interval_start + self.width;
            self.push_interval(end);
            self.interval_start = end;
        }
    }

    fn push_interval(&mut self, end: Instant) {
        let stat = IntervalStat {
            start_time: self.offset(self.interval_start),
            end_time: self.offset(end),
            bytes_transferred: self.interval_bytes,
            packets: (self.protocol == Protocol::Udp).then_some(self.interval_packets),
        };
        tracing::debug!(
            "iperf3: interval {:.2}-{:.2} sec {} bytes",
            stat.start_time,
            stat.end_time,
            stat.bytes_transferred
        );
        self.intervals.push(stat);
        self.interval_bytes = 0;
        self.interval_packets = 0;
    }

    fn offset(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.measure_from).as_secs_f64()
    }

    pub fn intervals(&self) -> &[IntervalStat] {
        &self.intervals
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Flush the running interval and aggregate. Later calls return the same result.
    pub fn finish(&mut self, now: Instant, complete: bool) -> FinalResult {
        if let Some(done) = &self.finished {
            return done.clone();
        }
        if self.is_measuring(now) {
            self.roll(now);
            if now > self.interval_start || self.interval_bytes > 0 {
                self.push_interval(now.max(self.interval_start));
            }
        }

        let udp = self.protocol == Protocol::Udp;
        let receiving_udp = udp && !self.sending;
        let result = FinalResult {
            total_bytes: self.total_bytes,
            elapsed_seconds: self.offset(now),
            packets: udp.then_some(self.total_packets),
            lost_packets: receiving_udp.then_some(self.lost_packets),
            out_of_order: receiving_udp.then_some(self.out_of_order),
            complete,
            mismatch: None,
        };
        self.finished = Some(result.clone());
        result
    }

    pub fn take_intervals(&mut self) -> Vec<IntervalStat> {
        std::mem::take(&mut self.intervals)
    }
}

/// The wire result message describing a local result
pub fn results_message(result: &FinalResult) -> ResultsMessage {
    ResultsMessage {
        bytes: Some(result.total_bytes),
        seconds: Some(result.elapsed_seconds),
        packets: result.packets,
        cpu_util_total: 0.0,
        cpu_util_user: 0.0,
        cpu_util_system: 0.0,
        sender_has_retransmits: 0,
        congestion_used: None,
        streams: vec![StreamResults {
            id: 1,
            bytes: result.total_bytes,
            retransmits: 0,
            jitter: 0.0,
            errors: result.lost_packets.unwrap_or(0),
            packets: result.packets.unwrap_or(0),
            start_time: 0.0,
            end_time: result.elapsed_seconds,
        }],
    }
}

/// Everything a finished (or aborted) test produced
#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub session_id: Uuid,
    pub cookie: String,
    pub started_at: DateTime<Utc>,
    pub role: Role,
    pub parameters: TestParameters,
    pub intervals: Vec<IntervalStat>,
    pub result: FinalResult,
    pub peer: Option<PeerResult>,
}

impl TestReport {
    /// Combine local measurements with the peer's message, reconciling the two
    pub fn assemble(
        session: &Session,
        parameters: TestParameters,
        intervals: Vec<IntervalStat>,
        mut result: FinalResult,
        peer: Option<&ResultsMessage>,
        tolerance_ratio: f64,
    ) -> Self {
        let peer = peer.map(PeerResult::from);
        let sending = parameters.direction.is_sender(session.role);
        if let Some(peer) = &peer {
            result.mismatch = reconcile(&result, sending, peer, &parameters, tolerance_ratio);
            if let Some(mismatch) = &result.mismatch {
                tracing::warn!("iperf3: session {}: {}", session.id, mismatch);
            }
        }
        Self {
            session_id: session.id,
            cookie: session
                .cookie()
                .map(|c| c.to_string())
                .unwrap_or_default(),
            started_at: session.started_at,
            role: session.role,
            parameters,
            intervals,
            result,
            peer,
        }
    }

    /// Whether this endpoint wrote the payload
    pub fn is_sender(&self) -> bool {
        self.parameters.direction.is_sender(self.role)
    }

    /// Human-readable summary in the style of iperf3's console output
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

/// One summary row
fn write_row(
    f: &mut fmt::Formatter<'_>,
    start: f64,
    end: f64,
    bytes: u64,
    packets: Option<u64>,
    lost: Option<u64>,
    tag: &str,
) -> fmt::Result {
    write!(
        f,
        " {:5.2}-{:<5.2}  sec {}Bytes {}bits/sec",
        start,
        end,
        format_size(bytes as f64, 1024.0),
        format_size(rate(bytes, end - start), 1000.0)
    )?;
    match (packets, lost) {
        (Some(packets), Some(lost)) => {
            let total = packets + lost;
            let percent = if total == 0 {
                0.0
            } else {
                100.0 * lost as f64 / total as f64
            };
            write!(f, "  {}/{} ({:.1}%)", lost, total, percent)?;
        }
        (Some(packets), None) => write!(f, "  {}", packets)?,
        _ => {}
    }
    writeln!(f, "{}", tag)
}

fn fixed_width(val: f64, mult: &str) -> String {
    if val < 10.0 {
        format!("{:5.2} {}", val, mult)
    } else if val < 100.0 {
        format!("{:5.1} {}", val, mult)
    } else {
        format!("{:5.0} {}", val, mult)
    }
}

/// Scale `val` into a fixed-width figure with a K/M/G suffix
pub fn format_size(mut val: f64, div: f64) -> String {
    for mult in ["", "K", "M"] {
        if val < 1000.0 {
            return fixed_width(val, mult);
        }
        val /= div;
    }
    fixed_width(val, "G")
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let udp = self.parameters.protocol == Protocol::Udp;
        let sending = self.is_sender();
        let extra = match (udp, sending) {
            (true, true) => "         Total Datagrams",
            (true, false) => "         Lost/Total Datagrams",
            _ => "",
        };
        writeln!(f, "Interval           Transfer     Bitrate{}", extra)?;
        for interval in &self.intervals {
            write_row(
                f,
                interval.start_time,
                interval.end_time,
                interval.bytes_transferred,
                interval.packets,
                None,
                "",
            )?;
        }
        writeln!(f, "{}", "- ".repeat(30))?;

        let result = &self.result;
        let local_tag = if sending { "  sender" } else { "  receiver" };
        write_row(
            f,
            0.0,
            result.elapsed_seconds,
            result.total_bytes,
            result.packets,
            result.lost_packets,
            local_tag,
        )?;

        if let Some(peer) = &self.peer {
            if let Some(bytes) = peer.bytes {
                let peer_tag = if sending { "  receiver" } else { "  sender" };
                let lost = if sending { peer.lost_packets.or(Some(0)) } else { None };
                write_row(
                    f,
                    0.0,
                    peer.seconds.unwrap_or(result.elapsed_seconds),
                    bytes,
                    peer.packets.filter(|_| udp),
                    lost.filter(|_| udp),
                    peer_tag,
                )?;
            }
        }

        if let Some(mismatch) = &result.mismatch {
            writeln!(f, "warning: result mismatch: {}", mismatch)?;
        }
        if !result.complete {
            writeln!(f, "warning: test did not complete; figures are best effort")?;
        }
        Ok(())
    }
}
