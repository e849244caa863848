//! Interval and session results, and the sampler that derives them from
//! live stream counters.

use crate::protocol::SessionTotals;
use crate::stream::StreamCounters;
use crate::transport::{Protocol, StreamProbe};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn bits_per_second(bytes: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        bytes as f64 * 8.0 / seconds
    } else {
        0.0
    }
}

fn delta(current: Option<u64>, previous: Option<u64>) -> Option<u64> {
    current.map(|c| c.saturating_sub(previous.unwrap_or(0)))
}

fn sum_some<I: Iterator<Item = Option<u64>>>(values: I) -> Option<u64> {
    values.fold(None, |acc, v| match (acc, v) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    })
}

fn mean_some<I: Iterator<Item = Option<f64>>>(values: I) -> Option<f64> {
    let (sum, n) = values
        .flatten()
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn loss_percent(lost: u64, received: u64) -> f64 {
    let expected = lost + received;
    if expected == 0 {
        0.0
    } else {
        lost as f64 * 100.0 / expected as f64
    }
}

/// Transport counters for one stream as reported by the protocol.
///
/// Counts are cumulative since the stream opened; `rtt_ms`, `jitter_ms` and
/// `snd_cwnd` are current values. `None` means the transport does not track
/// the figure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    pub rtt_ms: Option<f64>,
    pub retransmits: Option<u64>,
    pub packets: Option<u64>,
    pub lost: Option<u64>,
    pub jitter_ms: Option<f64>,
    pub out_of_order: Option<u64>,
    pub fec_recovered: Option<u64>,
    pub snd_cwnd: Option<u64>,
}

/// One stream's figures over one interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalResult {
    pub stream_id: usize,
    /// Seconds since the run started.
    pub start: f64,
    pub end: f64,
    pub bytes: u64,
    pub bits_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retransmits: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_packets: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lost_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fec_recovered: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snd_cwnd: Option<u64>,
}

impl IntervalResult {
    pub fn new(stream_id: usize, start: f64, end: f64, bytes: u64) -> Self {
        Self {
            stream_id,
            start,
            end,
            bytes,
            bits_per_second: bits_per_second(bytes, end - start),
            rtt_ms: None,
            retransmits: None,
            packets: None,
            lost_packets: None,
            lost_percent: None,
            jitter_ms: None,
            fec_recovered: None,
            snd_cwnd: None,
        }
    }

    /// Fills the transport figures from two cumulative readings taken at the
    /// interval's edges.
    pub fn apply_transport(&mut self, current: &TransportStats, previous: &TransportStats) {
        self.rtt_ms = current.rtt_ms;
        self.jitter_ms = current.jitter_ms;
        self.snd_cwnd = current.snd_cwnd;
        self.retransmits = delta(current.retransmits, previous.retransmits);
        self.packets = delta(current.packets, previous.packets);
        self.lost_packets = delta(current.lost, previous.lost);
        self.fec_recovered = delta(current.fec_recovered, previous.fec_recovered);
        if let (Some(lost), Some(packets)) = (self.lost_packets, self.packets) {
            self.lost_percent = Some(loss_percent(lost, packets));
        }
    }

    /// Aggregate over streams covering the same interval.
    pub fn sum(streams: &[IntervalResult], start: f64, end: f64) -> Self {
        let bytes = streams.iter().map(|s| s.bytes).sum();
        let mut sum = Self::new(0, start, end, bytes);
        sum.rtt_ms = mean_some(streams.iter().map(|s| s.rtt_ms));
        sum.jitter_ms = mean_some(streams.iter().map(|s| s.jitter_ms));
        sum.retransmits = sum_some(streams.iter().map(|s| s.retransmits));
        sum.packets = sum_some(streams.iter().map(|s| s.packets));
        sum.lost_packets = sum_some(streams.iter().map(|s| s.lost_packets));
        sum.fec_recovered = sum_some(streams.iter().map(|s| s.fec_recovered));
        sum.snd_cwnd = sum_some(streams.iter().map(|s| s.snd_cwnd));
        if let (Some(lost), Some(packets)) = (sum.lost_packets, sum.packets) {
            sum.lost_percent = Some(loss_percent(lost, packets));
        }
        sum
    }
}

/// Everything reported at one reporting tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalReport {
    pub start: f64,
    pub end: f64,
    pub streams: Vec<IntervalResult>,
    pub sum: IntervalResult,
}

impl IntervalReport {
    pub fn new(streams: Vec<IntervalResult>) -> Self {
        let start = streams.iter().map(|s| s.start).fold(f64::INFINITY, f64::min);
        let end = streams.iter().map(|s| s.end).fold(0.0, f64::max);
        let start = if start.is_finite() { start } else { end };
        let sum = IntervalResult::sum(&streams, start, end);
        Self {
            start,
            end,
            streams,
            sum,
        }
    }
}

/// Final totals of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub stream_id: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub blocks_sent: u64,
    pub blocks_received: u64,
    pub bits_per_second: f64,
    pub transport: TransportStats,
}

impl StreamSummary {
    pub fn bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

/// Outcome of one completed session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub protocol: String,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub blocks_sent: u64,
    pub blocks_received: u64,
    /// Bits per second over `duration`; zero for an empty run.
    pub bandwidth: f64,
    /// Mean smoothed RTT across streams, in milliseconds.
    pub rtt: Option<f64>,
    /// Percentage of datagrams lost, where the transport can tell.
    pub packet_loss: Option<f64>,
    pub retransmits: u64,
    pub fec_recovered: u64,
    pub intervals: Vec<IntervalReport>,
    pub streams: Vec<StreamSummary>,
    /// Totals the peer reported in its `Results` frame.
    pub remote: Option<SessionTotals>,
}

impl TestResult {
    pub fn new(
        protocol: &str,
        started_at: DateTime<Utc>,
        duration: Duration,
        streams: Vec<StreamSummary>,
        intervals: Vec<IntervalReport>,
    ) -> Self {
        let bytes_sent = streams.iter().map(|s| s.bytes_sent).sum();
        let bytes_received = streams.iter().map(|s| s.bytes_received).sum();
        let total_bytes = streams.iter().map(StreamSummary::bytes).sum();
        let lost = sum_some(streams.iter().map(|s| s.transport.lost));
        let packets = sum_some(streams.iter().map(|s| s.transport.packets));

        Self {
            protocol: protocol.to_string(),
            started_at,
            duration,
            bytes_sent,
            bytes_received,
            total_bytes,
            blocks_sent: streams.iter().map(|s| s.blocks_sent).sum(),
            blocks_received: streams.iter().map(|s| s.blocks_received).sum(),
            bandwidth: bits_per_second(total_bytes, duration.as_secs_f64()),
            rtt: mean_some(streams.iter().map(|s| s.transport.rtt_ms)),
            packet_loss: match (lost, packets) {
                (Some(l), Some(p)) => Some(loss_percent(l, p)),
                _ => None,
            },
            retransmits: sum_some(streams.iter().map(|s| s.transport.retransmits)).unwrap_or(0),
            fec_recovered: sum_some(streams.iter().map(|s| s.transport.fec_recovered))
                .unwrap_or(0),
            intervals,
            streams,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Option<SessionTotals>) -> Self {
        self.remote = remote;
        self
    }

    pub fn mbps(&self) -> f64 {
        self.bandwidth / 1_000_000.0
    }

    /// The totals this endpoint reports to its peer.
    pub fn totals(&self) -> SessionTotals {
        SessionTotals {
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            blocks_sent: self.blocks_sent,
            blocks_received: self.blocks_received,
            retransmits: self.retransmits,
            duration_ms: self.duration.as_millis() as u64,
        }
    }
}

/// Read-only handle on one stream for the sampler.
pub(crate) struct Meter {
    pub id: usize,
    pub counters: Arc<StreamCounters>,
    pub probe: StreamProbe,
}

#[derive(Debug, Clone, Copy, Default)]
struct Mark {
    at: f64,
    bytes: u64,
    transport: TransportStats,
}

#[derive(Default)]
struct SamplerState {
    sample_marks: Vec<Mark>,
    report_marks: Vec<Mark>,
    history: Vec<IntervalReport>,
}

/// Turns stream counters into interval results.
///
/// The stats tick and the report tick each measure from their own previous
/// call, so both sequences are contiguous and time-ordered. Probes are only
/// valid while the engine keeps the streams open; the engine stops both
/// tickers before closing them.
pub(crate) struct Sampler {
    protocol: Protocol,
    started: Instant,
    meters: Vec<Meter>,
    state: Mutex<SamplerState>,
}

impl Sampler {
    pub fn new(protocol: Protocol, meters: Vec<Meter>) -> Self {
        let baseline: Vec<Mark> = meters
            .iter()
            .map(|m| Mark {
                at: 0.0,
                bytes: m.counters.snapshot().bytes(),
                transport: protocol.stats_callback(&m.probe),
            })
            .collect();
        Self {
            protocol,
            started: Instant::now(),
            meters,
            state: Mutex::new(SamplerState {
                sample_marks: baseline.clone(),
                report_marks: baseline,
                history: Vec::new(),
            }),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn advance(&self, marks: &mut [Mark], now: f64) -> Vec<IntervalResult> {
        self.meters
            .iter()
            .zip(marks.iter_mut())
            .map(|(meter, mark)| {
                let bytes = meter.counters.snapshot().bytes();
                let transport = self.protocol.stats_callback(&meter.probe);
                let mut result =
                    IntervalResult::new(meter.id, mark.at, now, bytes.saturating_sub(mark.bytes));
                result.apply_transport(&transport, &mark.transport);
                *mark = Mark {
                    at: now,
                    bytes,
                    transport,
                };
                result
            })
            .collect()
    }

    /// Per-stream figures since the previous sample.
    pub fn sample(&self) -> Vec<IntervalResult> {
        let now = self.elapsed().as_secs_f64();
        let mut state = self.state.lock();
        self.advance(&mut state.sample_marks, now)
    }

    /// Interval report since the previous report, recorded in the history.
    pub fn report(&self) -> IntervalReport {
        let now = self.elapsed().as_secs_f64();
        let mut state = self.state.lock();
        let mut marks = std::mem::take(&mut state.report_marks);
        let streams = self.advance(&mut marks, now);
        state.report_marks = marks;
        let report = IntervalReport::new(streams);
        state.history.push(report.clone());
        report
    }

    /// Reports the last partial interval, if anything happened in it.
    pub fn close(&self) -> Option<IntervalReport> {
        if self.meters.is_empty() {
            return None;
        }
        let now = self.elapsed().as_secs_f64();
        let pending = {
            let state = self.state.lock();
            state.report_marks.iter().zip(&self.meters).any(|(mark, meter)| {
                meter.counters.snapshot().bytes() > mark.bytes || now - mark.at >= 0.05
            })
        };
        pending.then(|| self.report())
    }

    /// Every report produced so far, oldest first.
    pub fn history(&self) -> Vec<IntervalReport> {
        self.state.lock().history.clone()
    }

    pub fn summaries(&self, duration: Duration) -> Vec<StreamSummary> {
        self.meters
            .iter()
            .map(|meter| {
                let c = meter.counters.snapshot();
                StreamSummary {
                    stream_id: meter.id,
                    bytes_sent: c.bytes_sent,
                    bytes_received: c.bytes_received,
                    blocks_sent: c.blocks_sent,
                    blocks_received: c.blocks_received,
                    bits_per_second: bits_per_second(c.bytes(), duration.as_secs_f64()),
                    transport: self.protocol.stats_callback(&meter.probe),
                }
            })
            .collect()
    }
}
