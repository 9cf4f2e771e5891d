//! Packet framing: a 20-byte header followed by 0..1024 payload bytes, all
//! multi-byte fields big-endian, integrity-protected by a truncated
//! cryptographic digest over the header (sans digest field) plus payload.

use sha2::{Digest, Sha256};

use crate::config::Limits;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u8 {
        const DATA = 0x01;
        const ACK = 0x02;
        const SYN = 0x04;
        const FIN = 0x08;
        const RST = 0x10;
    }
}

/// A decoded packet header plus its payload slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: Flags,
    pub seq: u32,
    pub ack: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(flags: Flags, seq: u32, ack: u32, payload: Vec<u8>) -> Self {
        Packet {
            flags,
            seq,
            ack,
            payload,
        }
    }

    /// Encodes this packet into a framed datagram: header + payload.
    pub fn encode(&self) -> Vec<u8> {
        let checksum = digest(self.flags, self.seq, self.ack, self.payload.len() as u32, &self.payload);

        let mut out = Vec::with_capacity(Limits::HEADER_SIZE + self.payload.len());
        out.push(Limits::VERSION);
        out.push(self.flags.bits());
        out.extend_from_slice(&0u16.to_be_bytes()); // connection hint, reserved
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decodes a datagram into a packet, verifying its integrity digest.
    ///
    /// Returns `None` for malformed packets (fewer than [`Limits::HEADER_SIZE`]
    /// bytes) or packets whose digest does not match, matching the wire
    /// contract's "silently discarded" rule — callers distinguish the two
    /// failure modes via the counters they bump before calling this.
    pub fn decode(datagram: &[u8]) -> Option<Packet> {
        if datagram.len() < Limits::HEADER_SIZE {
            return None;
        }

        let header = &datagram[..Limits::HEADER_SIZE];
        let payload = &datagram[Limits::HEADER_SIZE..];

        let version = header[0];
        if version != Limits::VERSION {
            return None;
        }

        let flags = Flags::from_bits_truncate(header[1]);
        let seq = u32::from_be_bytes(header[4..8].try_into().unwrap());
        let ack = u32::from_be_bytes(header[8..12].try_into().unwrap());
        let length = u32::from_be_bytes(header[12..16].try_into().unwrap());
        let received = u32::from_be_bytes(header[16..20].try_into().unwrap());

        if length as usize != payload.len() {
            return None;
        }

        let expected = digest(flags, seq, ack, length, payload);
        if expected != received {
            return None;
        }

        Some(Packet::new(flags, seq, ack, payload.to_vec()))
    }
}

/// First 32 bits of a SHA-256 digest over the 16 header bytes preceding the
/// digest field, concatenated with the payload.
fn digest(flags: Flags, seq: u32, ack: u32, length: u32, payload: &[u8]) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update([Limits::VERSION, flags.bits()]);
    hasher.update(0u16.to_be_bytes());
    hasher.update(seq.to_be_bytes());
    hasher.update(ack.to_be_bytes());
    hasher.update(length.to_be_bytes());
    hasher.update(payload);
    let out = hasher.finalize();
    u32::from_be_bytes(out[..4].try_into().unwrap())
}
