//! Datagram formats used by the UDP transports.
//!
//! Data datagrams carry a 20-byte header ahead of the payload:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬──────────────┐
//! │ Magic "RPF3" │  Sequence    │  Timestamp   │   Payload    │
//! │   (4 bytes)  │  (8 bytes)   │  (8 bytes)   │  (variable)  │
//! └──────────────┴──────────────┴──────────────┴──────────────┘
//! ```
//!
//! Sequence and timestamp (microseconds since the UNIX epoch) are big-endian.
//! The receiver derives loss from sequence gaps and jitter from transit-time
//! differences, following RFC 3550:
//!
//! ```text
//! J(i) = J(i-1) + (|D(i-1,i)| - J(i-1)) / 16
//! ```
//!
//! Stream setup over a bound datagram socket uses two small control datagrams:
//! a hello (`"RPFH" | cookie | stream id`) from the client and an answer
//! (`"RPFA" | stream id | port`) from the server naming the port of the socket
//! dedicated to that stream.

use crate::protocol::COOKIE_LEN;
use std::time::{SystemTime, UNIX_EPOCH};

const DATA_MAGIC: [u8; 4] = *b"RPF3";
const HELLO_MAGIC: [u8; 4] = *b"RPFH";
const ANSWER_MAGIC: [u8; 4] = *b"RPFA";

/// Size of a hello datagram.
pub const HELLO_LEN: usize = 4 + COOKIE_LEN + 4;
/// Size of an answer datagram.
pub const ANSWER_LEN: usize = 4 + 4 + 2;

/// Current wall-clock time in microseconds since the UNIX epoch.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Header at the start of every UDP data datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPacketHeader {
    pub sequence: u64,
    pub timestamp_us: u64,
}

impl UdpPacketHeader {
    pub const SIZE: usize = 20;

    pub fn new(sequence: u64, timestamp_us: u64) -> Self {
        Self {
            sequence,
            timestamp_us,
        }
    }

    /// Writes the header into the front of `buf`, which must hold at least
    /// [`Self::SIZE`] bytes.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&DATA_MAGIC);
        buf[4..12].copy_from_slice(&self.sequence.to_be_bytes());
        buf[12..20].copy_from_slice(&self.timestamp_us.to_be_bytes());
    }

    /// Parses a header, returning `None` for short or foreign datagrams.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE || buf[0..4] != DATA_MAGIC {
            return None;
        }
        let sequence = u64::from_be_bytes(buf[4..12].try_into().ok()?);
        let timestamp_us = u64::from_be_bytes(buf[12..20].try_into().ok()?);
        Some(Self {
            sequence,
            timestamp_us,
        })
    }
}

/// Builds the hello a client stream sends to the server's bound socket.
pub fn encode_hello(cookie: &str, stream_id: u32) -> Option<[u8; HELLO_LEN]> {
    if cookie.len() != COOKIE_LEN {
        return None;
    }
    let mut buf = [0u8; HELLO_LEN];
    buf[0..4].copy_from_slice(&HELLO_MAGIC);
    buf[4..4 + COOKIE_LEN].copy_from_slice(cookie.as_bytes());
    buf[4 + COOKIE_LEN..].copy_from_slice(&stream_id.to_be_bytes());
    Some(buf)
}

/// Parses a hello into its cookie and stream id.
pub fn decode_hello(buf: &[u8]) -> Option<(&str, u32)> {
    if buf.len() != HELLO_LEN || buf[0..4] != HELLO_MAGIC {
        return None;
    }
    let cookie = std::str::from_utf8(&buf[4..4 + COOKIE_LEN]).ok()?;
    let stream_id = u32::from_be_bytes(buf[4 + COOKIE_LEN..].try_into().ok()?);
    Some((cookie, stream_id))
}

pub fn encode_answer(stream_id: u32, port: u16) -> [u8; ANSWER_LEN] {
    let mut buf = [0u8; ANSWER_LEN];
    buf[0..4].copy_from_slice(&ANSWER_MAGIC);
    buf[4..8].copy_from_slice(&stream_id.to_be_bytes());
    buf[8..10].copy_from_slice(&port.to_be_bytes());
    buf
}

/// Parses an answer into its stream id and the dedicated port.
pub fn decode_answer(buf: &[u8]) -> Option<(u32, u16)> {
    if buf.len() != ANSWER_LEN || buf[0..4] != ANSWER_MAGIC {
        return None;
    }
    let stream_id = u32::from_be_bytes(buf[4..8].try_into().ok()?);
    let port = u16::from_be_bytes(buf[8..10].try_into().ok()?);
    Some((stream_id, port))
}

/// Receive-side accounting for one UDP stream.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    highest: Option<u64>,
    received: u64,
    out_of_order: u64,
    jitter_us: f64,
    last_transit_us: Option<i64>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one datagram sent at `sent_us` and received at `arrival_us`.
    pub fn record(&mut self, header: &UdpPacketHeader, arrival_us: u64) {
        self.received += 1;
        match self.highest {
            Some(highest) if header.sequence <= highest => self.out_of_order += 1,
            _ => self.highest = Some(header.sequence),
        }

        let transit = arrival_us as i64 - header.timestamp_us as i64;
        if let Some(last) = self.last_transit_us {
            let d = (transit - last).abs() as f64;
            self.jitter_us += (d - self.jitter_us) / 16.0;
        }
        self.last_transit_us = Some(transit);
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    /// Datagrams the sender emitted up to the highest sequence seen.
    pub fn expected(&self) -> u64 {
        self.highest.map(|h| h + 1).unwrap_or(0)
    }

    pub fn lost(&self) -> u64 {
        self.expected().saturating_sub(self.received)
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_us / 1000.0
    }
}
