//! Reed-Solomon forward error correction between the ARQ and the socket.
//!
//! Outgoing datagrams are numbered and grouped `data_shards` at a time; each
//! full group is followed by `parity_shards` parity packets. The receiver
//! delivers data packets immediately and reconstructs missing ones once any
//! `data_shards` packets of a group have arrived.
//!
//! ```text
//! ┌──────────┬──────────┬────────────────────────────────────┐
//! │ seq (u32)│ kind(u16)│ data: size (u16) | payload         │
//! │          │          │ parity: Reed-Solomon shard         │
//! └──────────┴──────────┴────────────────────────────────────┘
//! ```

use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::BTreeMap;
use thiserror::Error;

const HEADER_LEN: usize = 6;
const SIZE_LEN: usize = 2;
const KIND_DATA: u16 = 0xf1;
const KIND_PARITY: u16 = 0xf2;
const MAX_PENDING_GROUPS: usize = 256;

/// Bytes FEC adds in front of every ARQ datagram.
pub const FEC_OVERHEAD: usize = HEADER_LEN + SIZE_LEN;

#[derive(Debug, Error)]
pub enum FecError {
    #[error("invalid shard configuration {data}+{parity}: {reason}")]
    Config {
        data: usize,
        parity: usize,
        reason: String,
    },
    #[error("malformed FEC packet: {0}")]
    Malformed(&'static str),
    #[error("reed-solomon failure: {0}")]
    Codec(String),
}

fn codec(data_shards: usize, parity_shards: usize) -> Result<ReedSolomon, FecError> {
    ReedSolomon::new(data_shards, parity_shards).map_err(|e| FecError::Config {
        data: data_shards,
        parity: parity_shards,
        reason: format!("{:?}", e),
    })
}

/// Highest sequence number (exclusive) that keeps groups aligned across wrap.
fn seq_limit(total: usize) -> u32 {
    (u32::MAX / total as u32) * total as u32
}

fn packet(seq: u32, kind: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(body);
    out
}

fn payload_of(body: &[u8]) -> Result<&[u8], FecError> {
    if body.len() < SIZE_LEN {
        return Err(FecError::Malformed("data shard shorter than its size field"));
    }
    let size = u16::from_le_bytes([body[0], body[1]]) as usize;
    if size < SIZE_LEN || size > body.len() {
        return Err(FecError::Malformed("data shard size out of range"));
    }
    Ok(&body[SIZE_LEN..size])
}

pub struct FecEncoder {
    rs: ReedSolomon,
    data_shards: usize,
    parity_shards: usize,
    next_seq: u32,
    limit: u32,
    group: Vec<Vec<u8>>,
}

impl FecEncoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, FecError> {
        Ok(Self {
            rs: codec(data_shards, parity_shards)?,
            data_shards,
            parity_shards,
            next_seq: 0,
            limit: seq_limit(data_shards + parity_shards),
            group: Vec::with_capacity(data_shards),
        })
    }

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = (self.next_seq + 1) % self.limit;
        seq
    }

    /// Wraps one datagram, returning it plus any parity packets it completed.
    pub fn encode(&mut self, payload: &[u8]) -> Result<Vec<Vec<u8>>, FecError> {
        let size = payload.len() + SIZE_LEN;
        if size > u16::MAX as usize {
            return Err(FecError::Malformed("datagram too large for FEC framing"));
        }
        let mut body = Vec::with_capacity(size);
        body.extend_from_slice(&(size as u16).to_le_bytes());
        body.extend_from_slice(payload);

        let mut out = vec![packet(self.take_seq(), KIND_DATA, &body)];
        self.group.push(body);
        if self.group.len() < self.data_shards {
            return Ok(out);
        }

        let shard_len = self.group.iter().map(Vec::len).max().unwrap_or(0);
        let mut shards: Vec<Vec<u8>> = self
            .group
            .drain(..)
            .map(|mut b| {
                b.resize(shard_len, 0);
                b
            })
            .collect();
        shards.extend((0..self.parity_shards).map(|_| vec![0u8; shard_len]));
        self.rs
            .encode(&mut shards)
            .map_err(|e| FecError::Codec(format!("{:?}", e)))?;

        for parity in &shards[self.data_shards..] {
            let seq = self.take_seq();
            out.push(packet(seq, KIND_PARITY, parity));
        }
        Ok(out)
    }
}

struct Group {
    shards: Vec<Option<Vec<u8>>>,
    received: usize,
    complete: bool,
}

pub struct FecDecoder {
    rs: ReedSolomon,
    data_shards: usize,
    total: usize,
    groups: BTreeMap<u32, Group>,
    recovered: u64,
}

impl FecDecoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, FecError> {
        Ok(Self {
            rs: codec(data_shards, parity_shards)?,
            data_shards,
            total: data_shards + parity_shards,
            groups: BTreeMap::new(),
            recovered: 0,
        })
    }

    /// Datagrams rebuilt from parity so far.
    pub fn recovered(&self) -> u64 {
        self.recovered
    }

    /// Unwraps one packet. Returns the ARQ datagrams it yields: the packet's
    /// own payload for data packets, plus anything reconstructed.
    pub fn decode(&mut self, raw: &[u8]) -> Result<Vec<Vec<u8>>, FecError> {
        if raw.len() < HEADER_LEN {
            return Err(FecError::Malformed("packet shorter than FEC header"));
        }
        let seq = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let kind = u16::from_le_bytes([raw[4], raw[5]]);
        let body = &raw[HEADER_LEN..];

        let mut out = Vec::new();
        match kind {
            KIND_DATA => out.push(payload_of(body)?.to_vec()),
            KIND_PARITY => {}
            _ => return Err(FecError::Malformed("unknown packet kind")),
        }

        let group_id = seq / self.total as u32;
        let index = (seq % self.total as u32) as usize;
        if (kind == KIND_DATA) != (index < self.data_shards) {
            return Err(FecError::Malformed("packet kind does not match its position"));
        }

        let total = self.total;
        let group = self.groups.entry(group_id).or_insert_with(|| Group {
            shards: vec![None; total],
            received: 0,
            complete: false,
        });
        if group.complete || group.shards[index].is_some() {
            return Ok(out);
        }
        group.shards[index] = Some(body.to_vec());
        group.received += 1;

        if group.received >= self.data_shards {
            let missing: Vec<usize> = (0..self.data_shards)
                .filter(|i| group.shards[*i].is_none())
                .collect();
            if !missing.is_empty() {
                let shard_len = group.shards.iter().flatten().map(Vec::len).max().unwrap_or(0);
                for shard in group.shards.iter_mut().flatten() {
                    shard.resize(shard_len, 0);
                }
                self.rs
                    .reconstruct_data(&mut group.shards)
                    .map_err(|e| FecError::Codec(format!("{:?}", e)))?;
                for i in missing {
                    if let Some(body) = &group.shards[i] {
                        out.push(payload_of(body)?.to_vec());
                        self.recovered += 1;
                    }
                }
            }
            group.complete = true;
            group.shards = Vec::new();
        }

        while self.groups.len() > MAX_PENDING_GROUPS {
            self.groups.pop_first();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagrams(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i as u8; 100 + i * 13]).collect()
    }

    fn encode_all(enc: &mut FecEncoder, input: &[Vec<u8>]) -> Vec<Vec<u8>> {
        input.iter().flat_map(|d| enc.encode(d).unwrap()).collect()
    }

    #[test]
    fn test_parity_follows_full_group() {
        let mut enc = FecEncoder::new(4, 2).unwrap();
        assert_eq!(enc.encode(b"a").unwrap().len(), 1);
        assert_eq!(enc.encode(b"b").unwrap().len(), 1);
        assert_eq!(enc.encode(b"c").unwrap().len(), 1);
        assert_eq!(enc.encode(b"d").unwrap().len(), 3);
    }

    #[test]
    fn test_lossless_passthrough_recovers_nothing() {
        let input = datagrams(12);
        let mut enc = FecEncoder::new(4, 2).unwrap();
        let mut dec = FecDecoder::new(4, 2).unwrap();
        let mut output = Vec::new();
        for p in encode_all(&mut enc, &input) {
            output.extend(dec.decode(&p).unwrap());
        }
        assert_eq!(output, input);
        assert_eq!(dec.recovered(), 0);
    }

    #[test]
    fn test_reconstructs_lost_data() {
        let input = datagrams(8);
        let mut enc = FecEncoder::new(4, 2).unwrap();
        let mut dec = FecDecoder::new(4, 2).unwrap();
        let packets = encode_all(&mut enc, &input);
        assert_eq!(packets.len(), 12);

        let mut output = Vec::new();
        for (i, p) in packets.iter().enumerate() {
            // lose data 1 of group 0, data 0 and 3 of group 1
            if i == 1 || i == 6 || i == 9 {
                continue;
            }
            output.extend(dec.decode(p).unwrap());
        }
        assert_eq!(dec.recovered(), 3);
        let mut sorted = output.clone();
        sorted.sort();
        let mut expected = input.clone();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn test_too_much_loss_is_not_fatal() {
        let input = datagrams(4);
        let mut enc = FecEncoder::new(4, 2).unwrap();
        let mut dec = FecDecoder::new(4, 2).unwrap();
        let packets = encode_all(&mut enc, &input);
        let mut output = Vec::new();
        for p in packets.iter().skip(3) {
            output.extend(dec.decode(p).unwrap());
        }
        assert_eq!(output, vec![input[3].clone()]);
        assert_eq!(dec.recovered(), 0);
    }

    #[test]
    fn test_rejects_malformed() {
        let mut dec = FecDecoder::new(4, 2).unwrap();
        assert!(dec.decode(&[1, 2, 3]).is_err());
        assert!(dec.decode(&packet(0, 0x99, b"xx")).is_err());
        assert!(dec.decode(&packet(5, KIND_DATA, &[4, 0, 1, 2])).is_err());
        assert!(FecEncoder::new(0, 2).is_err());
    }

    #[test]
    fn test_sequence_limit_aligns_groups() {
        assert_eq!(seq_limit(6) % 6, 0);
        assert!(seq_limit(6) > u32::MAX - 6);
    }
}
