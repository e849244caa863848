//! Segment codec for the reliable-UDP transport.
//!
//! ```text
//! 0       4     5       7       11      15      19      23
//! ┌───────┬─────┬───────┬───────┬───────┬───────┬───────┬──────────┐
//! │ conv  │ cmd │  wnd  │  ts   │  sn   │  una  │  len  │ payload  │
//! └───────┴─────┴───────┴───────┴───────┴───────┴───────┴──────────┘
//! ```
//!
//! All integers are little-endian. Several segments may share a datagram.

use std::fmt;

pub const HEADER_LEN: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Payload-carrying segment.
    Push = 81,
    /// Acknowledgement of one sequence number.
    Ack = 82,
    /// Window probe: the sender asks for the receiver's window.
    WindowAsk = 83,
    /// Window report answering a probe.
    WindowTell = 84,
}

impl Command {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            81 => Some(Command::Push),
            82 => Some(Command::Ack),
            83 => Some(Command::WindowAsk),
            84 => Some(Command::WindowTell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub conv: u32,
    pub cmd: Command,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { needed: usize, available: usize },
    UnknownCommand(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { needed, available } => {
                write!(f, "truncated segment: need {} bytes, have {}", needed, available)
            }
            DecodeError::UnknownCommand(cmd) => write!(f, "unknown segment command {}", cmd),
        }
    }
}

impl std::error::Error for DecodeError {}

impl SegmentHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.conv.to_le_bytes());
        out.push(self.cmd as u8);
        out.extend_from_slice(&self.wnd.to_le_bytes());
        out.extend_from_slice(&self.ts.to_le_bytes());
        out.extend_from_slice(&self.sn.to_le_bytes());
        out.extend_from_slice(&self.una.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }
        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let cmd = Command::from_u8(buf[4]).ok_or(DecodeError::UnknownCommand(buf[4]))?;
        Ok(Self {
            conv: u32_at(0),
            cmd,
            wnd: u16::from_le_bytes([buf[5], buf[6]]),
            ts: u32_at(7),
            sn: u32_at(11),
            una: u32_at(15),
            len: u32_at(19),
        })
    }
}

/// Splits a datagram into its segments.
pub fn segments(datagram: &[u8]) -> Segments<'_> {
    Segments { rest: datagram }
}

pub struct Segments<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Segments<'a> {
    type Item = Result<(SegmentHeader, &'a [u8]), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let header = match SegmentHeader::decode(self.rest) {
            Ok(h) => h,
            Err(e) => {
                self.rest = &[];
                return Some(Err(e));
            }
        };
        let end = HEADER_LEN + header.len as usize;
        if self.rest.len() < end {
            let available = self.rest.len();
            self.rest = &[];
            return Some(Err(DecodeError::Truncated {
                needed: end,
                available,
            }));
        }
        let payload = &self.rest[HEADER_LEN..end];
        self.rest = &self.rest[end..];
        Some(Ok((header, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(cmd: Command, sn: u32, len: u32) -> SegmentHeader {
        SegmentHeader {
            conv: 0xdead_beef,
            cmd,
            wnd: 128,
            ts: 1000,
            sn,
            una: 3,
            len,
        }
    }

    #[test]
    fn test_header_is_fixed_size() {
        let mut out = Vec::new();
        header(Command::Ack, 1, 0).encode(&mut out);
        assert_eq!(out.len(), HEADER_LEN);
        assert_eq!(SegmentHeader::decode(&out).unwrap(), header(Command::Ack, 1, 0));
    }

    #[test]
    fn test_iterates_packed_segments() {
        let mut dgram = Vec::new();
        header(Command::Push, 7, 3).encode(&mut dgram);
        dgram.extend_from_slice(b"abc");
        header(Command::Ack, 2, 0).encode(&mut dgram);

        let parsed: Vec<_> = segments(&dgram).collect::<Result<_, _>>().unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0.sn, 7);
        assert_eq!(parsed[0].1, b"abc");
        assert_eq!(parsed[1].0.cmd, Command::Ack);
    }

    #[test]
    fn test_rejects_garbage() {
        let mut dgram = Vec::new();
        header(Command::Push, 1, 10).encode(&mut dgram);
        dgram.extend_from_slice(b"short");
        assert!(matches!(
            segments(&dgram).next(),
            Some(Err(DecodeError::Truncated { .. }))
        ));

        let mut dgram = vec![0u8; HEADER_LEN];
        dgram[4] = 99;
        assert_eq!(
            SegmentHeader::decode(&dgram),
            Err(DecodeError::UnknownCommand(99))
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..200)) {
                for item in segments(&bytes) {
                    let _ = item;
                }
            }

            #[test]
            fn payloads_survive_packing(payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..64), 1..8)
            ) {
                let mut dgram = Vec::new();
                for (i, p) in payloads.iter().enumerate() {
                    header(Command::Push, i as u32, p.len() as u32).encode(&mut dgram);
                    dgram.extend_from_slice(p);
                }
                let parsed: Vec<_> = segments(&dgram).collect::<Result<_, _>>().unwrap();
                prop_assert_eq!(parsed.len(), payloads.len());
                for ((h, body), p) in parsed.iter().zip(&payloads) {
                    prop_assert_eq!(*body, p.as_slice());
                    prop_assert_eq!(h.len as usize, p.len());
                }
            }
        }
    }
}
