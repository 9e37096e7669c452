use std::cmp::Ordering;

use sha2::{Digest, Sha256};

use super::codec::{ByteReader, encode_varint};
use super::error::{Nip77Error, Result};

/// Negentropy Protocol Version 1
pub const PROTOCOL_VERSION_1: u8 = 0x61;

/// Special infinity timestamp value
pub const TIMESTAMP_INFINITY: u64 = u64::MAX;

pub const ID_SIZE: usize = 32;
pub const FINGERPRINT_SIZE: usize = 16;

/// A 256-bit event ID
pub type EventId = [u8; ID_SIZE];

/// A (timestamp, id) pair in a storage vector. Ordered by timestamp, then id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Item {
    pub timestamp: u64,
    pub id: EventId,
}

impl Item {
    pub fn new(timestamp: u64, id: EventId) -> Self {
        Self { timestamp, id }
    }

    /// Compare against a bound whose id prefix is zero-padded to full length.
    pub fn cmp_bound(&self, bound: &Bound) -> Ordering {
        self.timestamp.cmp(&bound.timestamp).then_with(|| {
            let len = bound.id_prefix.len().min(ID_SIZE);
            let mut padded = [0u8; ID_SIZE];
            padded[..len].copy_from_slice(&bound.id_prefix[..len]);
            self.id.cmp(&padded)
        })
    }
}

/// A timestamp and ID prefix bound for ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    /// The timestamp (u64::MAX for infinity)
    pub timestamp: u64,
    /// The ID prefix (0-32 bytes)
    pub id_prefix: Vec<u8>,
}

impl Bound {
    pub fn new(timestamp: u64, id_prefix: Vec<u8>) -> Result<Self> {
        if id_prefix.len() > ID_SIZE {
            return Err(Nip77Error::InvalidBound(format!(
                "ID prefix too long: {} bytes (max {ID_SIZE})",
                id_prefix.len()
            )));
        }
        Ok(Self {
            timestamp,
            id_prefix,
        })
    }

    pub fn from_timestamp(timestamp: u64) -> Self {
        Self {
            timestamp,
            id_prefix: Vec::new(),
        }
    }

    pub fn zero() -> Self {
        Self::from_timestamp(0)
    }

    pub fn infinity() -> Self {
        Self::from_timestamp(TIMESTAMP_INFINITY)
    }

    /// Shortest bound that sorts above `prev` and at or below `curr`.
    pub fn minimal(prev: &Item, curr: &Item) -> Self {
        if curr.timestamp != prev.timestamp {
            return Self::from_timestamp(curr.timestamp);
        }
        let shared = prev
            .id
            .iter()
            .zip(curr.id.iter())
            .take_while(|(a, b)| a == b)
            .count();
        Self {
            timestamp: curr.timestamp,
            id_prefix: curr.id[..(shared + 1).min(ID_SIZE)].to_vec(),
        }
    }
}

/// Range mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    Skip = 0,
    Fingerprint = 1,
    IdList = 2,
}

impl TryFrom<u64> for RangeMode {
    type Error = Nip77Error;

    fn try_from(value: u64) -> Result<Self> {
        match value {
            0 => Ok(Self::Skip),
            1 => Ok(Self::Fingerprint),
            2 => Ok(Self::IdList),
            _ => Err(Nip77Error::InvalidMode(value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangePayload {
    Skip,
    Fingerprint([u8; FINGERPRINT_SIZE]),
    IdList(Vec<EventId>),
}

impl RangePayload {
    pub fn mode(&self) -> RangeMode {
        match self {
            Self::Skip => RangeMode::Skip,
            Self::Fingerprint(_) => RangeMode::Fingerprint,
            Self::IdList(_) => RangeMode::IdList,
        }
    }
}

/// A range ends at `upper_bound` (exclusive) and starts where the previous one ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub upper_bound: Bound,
    pub payload: RangePayload,
}

impl Range {
    pub fn skip(upper_bound: Bound) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::Skip,
        }
    }

    pub fn fingerprint(upper_bound: Bound, fingerprint: [u8; FINGERPRINT_SIZE]) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::Fingerprint(fingerprint),
        }
    }

    pub fn id_list(upper_bound: Bound, ids: Vec<EventId>) -> Self {
        Self {
            upper_bound,
            payload: RangePayload::IdList(ids),
        }
    }
}

/// Appends ranges to an outgoing message, delta-encoding timestamps.
#[derive(Debug, Clone)]
pub(crate) struct MessageWriter {
    buf: Vec<u8>,
    last_timestamp: u64,
}

/// Position a writer can be rolled back to.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Checkpoint {
    len: usize,
    last_timestamp: u64,
}

impl MessageWriter {
    pub(crate) fn new(version: u8) -> Self {
        Self {
            buf: vec![version],
            last_timestamp: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            len: self.buf.len(),
            last_timestamp: self.last_timestamp,
        }
    }

    pub(crate) fn rollback(&mut self, checkpoint: Checkpoint) {
        self.buf.truncate(checkpoint.len);
        self.last_timestamp = checkpoint.last_timestamp;
    }

    fn write_timestamp(&mut self, timestamp: u64) {
        let encoded = if timestamp == TIMESTAMP_INFINITY {
            0
        } else {
            timestamp.saturating_sub(self.last_timestamp) + 1
        };
        self.last_timestamp = timestamp;
        self.buf.extend(encode_varint(encoded));
    }

    pub(crate) fn write_bound(&mut self, bound: &Bound) {
        self.write_timestamp(bound.timestamp);
        self.buf.extend(encode_varint(bound.id_prefix.len() as u64));
        self.buf.extend_from_slice(&bound.id_prefix);
    }

    pub(crate) fn write_range(&mut self, range: &Range) {
        self.write_bound(&range.upper_bound);
        self.buf.extend(encode_varint(range.payload.mode() as u64));
        match &range.payload {
            RangePayload::Skip => {}
            RangePayload::Fingerprint(fp) => self.buf.extend_from_slice(fp),
            RangePayload::IdList(ids) => {
                self.buf.extend(encode_varint(ids.len() as u64));
                for id in ids {
                    self.buf.extend_from_slice(id);
                }
            }
        }
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads ranges from an incoming message, undoing timestamp deltas.
#[derive(Debug)]
struct RangeReader<'a> {
    reader: ByteReader<'a>,
    last_timestamp: u64,
}

impl RangeReader<'_> {
    fn read_timestamp(&mut self) -> Result<u64> {
        let encoded = self.reader.read_varint()?;
        let timestamp = if encoded == 0 || self.last_timestamp == TIMESTAMP_INFINITY {
            TIMESTAMP_INFINITY
        } else {
            self.last_timestamp.saturating_add(encoded - 1)
        };
        self.last_timestamp = timestamp;
        Ok(timestamp)
    }

    fn read_range(&mut self) -> Result<Range> {
        let timestamp = self.read_timestamp()?;
        let prefix_len = self.reader.read_varint()?;
        if prefix_len > ID_SIZE as u64 {
            return Err(Nip77Error::InvalidBound(format!(
                "ID prefix length too long: {prefix_len}"
            )));
        }
        let id_prefix = self.reader.read_bytes(prefix_len as usize)?.to_vec();
        let upper_bound = Bound {
            timestamp,
            id_prefix,
        };

        let payload = match RangeMode::try_from(self.reader.read_varint()?)? {
            RangeMode::Skip => RangePayload::Skip,
            RangeMode::Fingerprint => RangePayload::Fingerprint(self.reader.read_array()?),
            RangeMode::IdList => {
                let count = self.reader.read_varint()?;
                let mut ids = Vec::new();
                for _ in 0..count {
                    ids.push(self.reader.read_array()?);
                }
                RangePayload::IdList(ids)
            }
        };
        Ok(Range {
            upper_bound,
            payload,
        })
    }
}

/// A decoded negentropy message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegentropyMessage {
    pub version: u8,
    pub ranges: Vec<Range>,
}

impl NegentropyMessage {
    pub fn new(ranges: Vec<Range>) -> Self {
        Self {
            version: PROTOCOL_VERSION_1,
            ranges,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = MessageWriter::new(self.version);
        for range in &self.ranges {
            writer.write_range(range);
        }
        writer.into_bytes()
    }

    pub fn encode_hex(&self) -> String {
        hex::encode(self.encode())
    }

    /// Decode a message. Versions in `0x60..=0x6f` other than v1 are reported
    /// as unsupported so a responder can answer with its own version.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let version = reader.read_byte().map_err(|_| Nip77Error::EmptyMessage)?;
        if !(0x60..=0x6f).contains(&version) {
            return Err(Nip77Error::InvalidProtocolVersion(version));
        }
        if version != PROTOCOL_VERSION_1 {
            return Err(Nip77Error::UnsupportedProtocolVersion(version));
        }

        let mut ranges = RangeReader {
            reader,
            last_timestamp: 0,
        };
        let mut out = Vec::new();
        while !ranges.reader.is_empty() {
            out.push(ranges.read_range()?);
        }
        Ok(Self {
            version,
            ranges: out,
        })
    }

    pub fn decode_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str).map_err(|e| Nip77Error::InvalidHex(e.to_string()))?;
        Self::decode(&bytes)
    }
}

/// Fingerprint of a set of ids.
///
/// Sum of the ids as 256-bit little-endian integers mod 2^256, followed by
/// the element count as a varint, hashed with SHA-256 and cut to 16 bytes.
pub fn calculate_fingerprint<'a>(
    ids: impl IntoIterator<Item = &'a EventId>,
) -> [u8; FINGERPRINT_SIZE] {
    let mut sum = [0u8; ID_SIZE];
    let mut count: u64 = 0;

    for id in ids {
        let mut carry = 0u16;
        for (acc, byte) in sum.iter_mut().zip(id.iter()) {
            let s = u16::from(*acc) + u16::from(*byte) + carry;
            *acc = s as u8;
            carry = s >> 8;
        }
        count += 1;
    }

    let mut hasher = Sha256::new();
    hasher.update(sum);
    hasher.update(encode_varint(count));
    let hash = hasher.finalize();

    let mut fingerprint = [0u8; FINGERPRINT_SIZE];
    fingerprint.copy_from_slice(&hash[..FINGERPRINT_SIZE]);
    fingerprint
}
