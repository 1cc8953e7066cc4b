//! Ferry wire format — the fixed 60-byte packet header and its codec.
//!
//! Every packet on the stream is a header followed by one chunk of an
//! exchange's payload. All header fields are ASCII decimal, left-zero-padded
//! to their width. The header's own packet-length field is the only framing:
//! there is no delimiter and no out-of-band length.
//!
//! ```text
//!  0..18   key                 exchange identity
//! 18..20   payload kind        00 = structured data, 01 = file stream
//! 20..28   chunk count         total chunks in the exchange
//! 28..36   chunk index         zero-based position of this chunk
//! 36..44   packet length       header + chunk payload, in bytes
//! 44..60   total length        payload bytes across all chunks
//! 60..     chunk payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::const_assert_eq;

use crate::key::{Key, KeyError, KEY_LEN};

// ── Layout ───────────────────────────────────────────────────────────────────

const KIND_WIDTH: usize = 2;
const CHUNK_COUNT_WIDTH: usize = 8;
const CHUNK_INDEX_WIDTH: usize = 8;
const PACKET_LEN_WIDTH: usize = 8;
const TOTAL_LEN_WIDTH: usize = 16;

const KIND_AT: usize = KEY_LEN;
const CHUNK_COUNT_AT: usize = KIND_AT + KIND_WIDTH;
const CHUNK_INDEX_AT: usize = CHUNK_COUNT_AT + CHUNK_COUNT_WIDTH;
const PACKET_LEN_AT: usize = CHUNK_INDEX_AT + CHUNK_INDEX_WIDTH;
const TOTAL_LEN_AT: usize = PACKET_LEN_AT + PACKET_LEN_WIDTH;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 60;

// If this fails, the wire format has silently changed.
const_assert_eq!(TOTAL_LEN_AT + TOTAL_LEN_WIDTH, HEADER_LEN);

// ── Constants ─────────────────────────────────────────────────────────────────

/// Ceiling for a whole packet, header included. Applied uniformly to every
/// exchange on every connection.
pub const MAX_PACKET_SIZE: usize = 12 * 1024;

/// Largest chunk payload that fits in one packet.
pub const MAX_CHUNK_PAYLOAD: usize = MAX_PACKET_SIZE - HEADER_LEN;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 12123;

/// Number of chunks needed for a payload of `total` bytes.
/// An empty payload still occupies one (empty) chunk.
pub fn chunk_count_for(total: u64) -> u64 {
    let per_chunk = MAX_CHUNK_PAYLOAD as u64;
    total.div_ceil(per_chunk).max(1)
}

// ── Payload kind ──────────────────────────────────────────────────────────────

/// How the receiver accumulates an exchange's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadKind {
    /// Buffered in memory; an envelope or a reply body.
    Data = 0,
    /// Streamed to a staging file as it arrives.
    File = 1,
}

impl TryFrom<u64> for PayloadKind {
    type Error = WireError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PayloadKind::Data),
            1 => Ok(PayloadKind::File),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

// ── Packet header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub key: Key,
    pub kind: PayloadKind,
    pub chunk_count: u64,
    pub chunk_index: u64,
    /// Length of the whole packet, header included.
    pub packet_len: u64,
    pub total_len: u64,
}

impl PacketHeader {
    /// Header for one chunk of `payload_len` bytes.
    pub fn for_chunk(
        key: Key,
        kind: PayloadKind,
        chunk_count: u64,
        chunk_index: u64,
        payload_len: usize,
        total_len: u64,
    ) -> Self {
        Self {
            key,
            kind,
            chunk_count,
            chunk_index,
            packet_len: (HEADER_LEN + payload_len) as u64,
            total_len,
        }
    }

    /// Bytes of chunk payload following the header.
    pub fn payload_len(&self) -> usize {
        (self.packet_len as usize).saturating_sub(HEADER_LEN)
    }

    pub fn is_last_chunk(&self) -> bool {
        self.chunk_index + 1 == self.chunk_count
    }

    /// Append the 60 header bytes to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        check_width("chunk_count", self.chunk_count, CHUNK_COUNT_WIDTH)?;
        check_width("chunk_index", self.chunk_index, CHUNK_INDEX_WIDTH)?;
        check_width("packet_len", self.packet_len, PACKET_LEN_WIDTH)?;
        check_width("total_len", self.total_len, TOTAL_LEN_WIDTH)?;

        buf.reserve(HEADER_LEN);
        buf.put_slice(self.key.as_bytes());
        put_decimal(buf, self.kind as u64, KIND_WIDTH);
        put_decimal(buf, self.chunk_count, CHUNK_COUNT_WIDTH);
        put_decimal(buf, self.chunk_index, CHUNK_INDEX_WIDTH);
        put_decimal(buf, self.packet_len, PACKET_LEN_WIDTH);
        put_decimal(buf, self.total_len, TOTAL_LEN_WIDTH);
        Ok(())
    }

    /// Decode the header at the front of `buf`. Only the first
    /// [`HEADER_LEN`] bytes are inspected.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::Incomplete(buf.len()));
        }
        let key = Key::from_wire(&buf[..KEY_LEN])?;
        let kind = PayloadKind::try_from(parse_field(buf, "kind", KIND_AT, KIND_WIDTH)?)?;
        let chunk_count = parse_field(buf, "chunk_count", CHUNK_COUNT_AT, CHUNK_COUNT_WIDTH)?;
        let chunk_index = parse_field(buf, "chunk_index", CHUNK_INDEX_AT, CHUNK_INDEX_WIDTH)?;
        let packet_len = parse_field(buf, "packet_len", PACKET_LEN_AT, PACKET_LEN_WIDTH)?;
        let total_len = parse_field(buf, "total_len", TOTAL_LEN_AT, TOTAL_LEN_WIDTH)?;

        if packet_len == 0 {
            return Err(WireError::ZeroLength);
        }

        Ok(Self {
            key,
            kind,
            chunk_count,
            chunk_index,
            packet_len,
            total_len,
        })
    }
}

/// Header plus payload, ready for the transport.
pub fn encode_packet(header: &PacketHeader, payload: &[u8]) -> Result<Bytes, WireError> {
    if header.payload_len() != payload.len() || header.packet_len < HEADER_LEN as u64 {
        return Err(WireError::LengthMismatch {
            declared: header.packet_len,
            actual: (HEADER_LEN + payload.len()) as u64,
        });
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header.encode(&mut buf)?;
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Read only the packet-length field, for framing.
///
/// `Ok(None)` means fewer than [`HEADER_LEN`] bytes are buffered. Any error
/// means the length cannot be trusted to demarcate packets; see
/// [`WireError::is_desync`].
pub fn peek_packet_len(buf: &[u8]) -> Result<Option<usize>, WireError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = parse_field(buf, "packet_len", PACKET_LEN_AT, PACKET_LEN_WIDTH)?;
    match len {
        0 => Err(WireError::ZeroLength),
        n if n < HEADER_LEN as u64 => Err(WireError::PacketTooShort(n)),
        n if n > MAX_PACKET_SIZE as u64 => Err(WireError::PacketTooLong(n)),
        n => Ok(Some(n as usize)),
    }
}

// ── Field helpers ─────────────────────────────────────────────────────────────

fn max_for(width: usize) -> u64 {
    10u64.pow(width as u32) - 1
}

fn check_width(field: &'static str, value: u64, width: usize) -> Result<(), WireError> {
    if value > max_for(width) {
        return Err(WireError::FieldOverflow { field, value });
    }
    Ok(())
}

fn put_decimal(buf: &mut BytesMut, mut value: u64, width: usize) {
    let start = buf.len();
    buf.resize(start + width, b'0');
    for slot in buf[start..].iter_mut().rev() {
        *slot = b'0' + (value % 10) as u8;
        value /= 10;
    }
}

fn parse_field(buf: &[u8], field: &'static str, at: usize, width: usize) -> Result<u64, WireError> {
    buf[at..at + width].iter().try_fold(0u64, |acc, &b| {
        if b.is_ascii_digit() {
            Ok(acc * 10 + u64::from(b - b'0'))
        } else {
            Err(WireError::BadField(field))
        }
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("incomplete header: {0} of {HEADER_LEN} bytes buffered")]
    Incomplete(usize),

    #[error("declared packet length is zero")]
    ZeroLength,

    #[error("declared packet length {0} is shorter than the header")]
    PacketTooShort(u64),

    #[error("declared packet length {0} exceeds the {MAX_PACKET_SIZE}-byte packet ceiling")]
    PacketTooLong(u64),

    #[error("header field {0} is not a decimal number")]
    BadField(&'static str),

    #[error("unknown payload kind {0}")]
    UnknownKind(u64),

    #[error("{field} value {value} does not fit its header field")]
    FieldOverflow { field: &'static str, value: u64 },

    #[error("packet length {declared} does not match header + payload ({actual})")]
    LengthMismatch { declared: u64, actual: u64 },

    #[error("bad key: {0}")]
    BadKey(#[from] KeyError),
}

impl WireError {
    /// True when the stream can no longer be framed and everything buffered
    /// must be discarded.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            WireError::ZeroLength
                | WireError::PacketTooShort(_)
                | WireError::PacketTooLong(_)
                | WireError::BadField("packet_len")
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
