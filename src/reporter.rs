//! Events emitted by the engine, and the iperf3-style text lines the binary
//! prints for them.

use crate::error::ErrorKind;
use crate::measurements::{IntervalReport, IntervalResult, TestResult};

/// Notification from a running engine.
///
/// # Examples
///
/// ```
/// use riperf::reporter::TestEvent;
///
/// let on_event = |event: TestEvent| match event {
///     TestEvent::Connected { test_num } => println!("session {}", test_num),
///     TestEvent::Interval(report) => println!("{:.1} Mbit/s", report.sum.bits_per_second / 1e6),
///     TestEvent::Completed(result) => println!("{:.1} Mbit/s total", result.mbps()),
///     TestEvent::Error { kind, message } => eprintln!("{:?}: {}", kind, message),
///     TestEvent::Sample(_) => {}
/// };
/// on_event(TestEvent::Connected { test_num: 1 });
/// ```
#[derive(Debug, Clone)]
pub enum TestEvent {
    /// Parameters were exchanged and the data streams are about to open.
    /// `test_num` counts sessions on this engine, starting at 1.
    Connected { test_num: usize },
    /// One stats tick: figures for every stream since the previous tick.
    Sample(Vec<IntervalResult>),
    /// One reporting tick: per-stream results plus their sum.
    Interval(IntervalReport),
    Completed(TestResult),
    /// A session failed. Emitted once per failure.
    Error { kind: ErrorKind, message: String },
}

/// Receiver of [`TestEvent`]s.
///
/// Called from the engine's ticker tasks as well as from the caller's task,
/// so implementations must be cheap and thread-safe. Closures implement it
/// directly:
///
/// ```
/// use riperf::reporter::{EventCallback, TestEvent};
///
/// struct Quiet;
///
/// impl EventCallback for Quiet {
///     fn on_event(&self, _event: TestEvent) {}
/// }
///
/// fn takes_callback(_cb: impl EventCallback) {}
/// takes_callback(Quiet);
/// takes_callback(|event: TestEvent| println!("{:?}", event));
/// ```
pub trait EventCallback: Send + Sync {
    fn on_event(&self, event: TestEvent);
}

impl<F> EventCallback for F
where
    F: Fn(TestEvent) + Send + Sync,
{
    fn on_event(&self, event: TestEvent) {
        self(event)
    }
}

fn transfer(bytes: u64) -> (f64, &'static str) {
    if bytes >= 1_000_000_000 {
        (bytes as f64 / 1_000_000_000.0, "GBytes")
    } else if bytes >= 1_000_000 {
        (bytes as f64 / 1_000_000.0, "MBytes")
    } else {
        (bytes as f64 / 1_000.0, "KBytes")
    }
}

fn bitrate(bits_per_second: f64) -> (f64, &'static str) {
    if bits_per_second >= 1_000_000_000.0 {
        (bits_per_second / 1_000_000_000.0, "Gbits/sec")
    } else {
        (bits_per_second / 1_000_000.0, "Mbits/sec")
    }
}

fn label(stream_id: usize) -> String {
    if stream_id == 0 {
        "SUM".to_string()
    } else {
        stream_id.to_string()
    }
}

/// One interval line, with loss columns for datagram transports and
/// retransmit/cwnd columns where TCP_INFO was available.
pub fn format_interval_line(result: &IntervalResult) -> String {
    let (amount, amount_unit) = transfer(result.bytes);
    let (rate, rate_unit) = bitrate(result.bits_per_second);
    let head = format!(
        "[{:>3}]   {:4.2}-{:4.2}  sec  {:6.2} {:>7}  {:6.1} {:>10}",
        label(result.stream_id),
        result.start,
        result.end,
        amount,
        amount_unit,
        rate,
        rate_unit
    );

    if let Some(jitter) = result.jitter_ms {
        format!(
            "{}  {:6.3} ms  {}/{} ({:.2}%)",
            head,
            jitter,
            result.lost_packets.unwrap_or(0),
            result.packets.unwrap_or(0) + result.lost_packets.unwrap_or(0),
            result.lost_percent.unwrap_or(0.0)
        )
    } else if let (Some(retr), Some(cwnd)) = (result.retransmits, result.snd_cwnd) {
        format!("{}  {:4}  {:5} KBytes", head, retr, cwnd / 1024)
    } else if let Some(retr) = result.retransmits {
        match result.fec_recovered {
            Some(fec) if fec > 0 => format!("{}  {:4}  fec {}", head, retr, fec),
            _ => format!("{}  {:4}", head, retr),
        }
    } else {
        head
    }
}

/// The lines printed for one reporting tick; the sum line only with several
/// streams.
pub fn format_interval(report: &IntervalReport) -> Vec<String> {
    let mut lines: Vec<String> = report.streams.iter().map(format_interval_line).collect();
    if report.streams.len() > 1 {
        lines.push(format_interval_line(&report.sum));
    }
    lines
}

/// Closing summary of a session.
pub fn format_summary(result: &TestResult) -> String {
    let seconds = result.duration.as_secs_f64();
    let (amount, amount_unit) = transfer(result.total_bytes);
    let (rate, rate_unit) = bitrate(result.bandwidth);
    let mut out = String::new();
    out.push_str("- - - - - - - - - - - - - - - - - - - - - - - - -\n");
    out.push_str(&format!(
        "[SUM]   0.00-{:4.2}  sec  {:6.2} {:>7}  {:6.1} {:>10}  {}",
        seconds, amount, amount_unit, rate, rate_unit, result.protocol
    ));
    if result.retransmits > 0 {
        out.push_str(&format!("  retr {}", result.retransmits));
    }
    if let Some(loss) = result.packet_loss {
        out.push_str(&format!("  loss {:.2}%", loss));
    }
    if let Some(rtt) = result.rtt {
        out.push_str(&format!("  rtt {:.2} ms", rtt));
    }
    if result.fec_recovered > 0 {
        out.push_str(&format!("  fec {}", result.fec_recovered));
    }
    if let Some(remote) = &result.remote {
        let (peer, peer_unit) = transfer(remote.bytes_sent + remote.bytes_received);
        out.push_str(&format!("\n[SUM]   peer total  {:6.2} {:>7}", peer, peer_unit));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_closure_is_a_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = move |event: TestEvent| {
            if let TestEvent::Connected { test_num } = event {
                sink.lock().push(test_num);
            }
        };
        callback.on_event(TestEvent::Connected { test_num: 1 });
        callback.on_event(TestEvent::Connected { test_num: 2 });
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_tcp_line() {
        let mut result = IntervalResult::new(5, 0.0, 1.0, 12_500_000);
        result.retransmits = Some(3);
        result.snd_cwnd = Some(64 * 1024);
        let line = format_interval_line(&result);
        assert!(line.starts_with("[  5]   0.00-1.00  sec"));
        assert!(line.contains("12.50  MBytes"));
        assert!(line.contains("100.0  Mbits/sec"));
        assert!(line.ends_with("   3     64 KBytes"));
    }

    #[test]
    fn test_udp_line_shows_loss() {
        let mut result = IntervalResult::new(7, 1.0, 2.0, 1_460_000);
        result.jitter_ms = Some(0.25);
        result.packets = Some(990);
        result.lost_packets = Some(10);
        result.lost_percent = Some(1.0);
        let line = format_interval_line(&result);
        assert!(line.contains("0.250 ms"));
        assert!(line.contains("10/1000 (1.00%)"));
    }

    #[test]
    fn test_sum_line_only_for_parallel() {
        let one = IntervalReport::new(vec![IntervalResult::new(5, 0.0, 1.0, 10)]);
        assert_eq!(format_interval(&one).len(), 1);
        let two = IntervalReport::new(vec![
            IntervalResult::new(5, 0.0, 1.0, 10),
            IntervalResult::new(7, 0.0, 1.0, 10),
        ]);
        let lines = format_interval(&two);
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("[SUM]"));
    }
}
