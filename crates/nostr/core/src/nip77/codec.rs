use super::error::{Nip77Error, Result};

/// Encode a varint.
///
/// Varints are base-128 digits, most significant digit first, with bit 7 set
/// on every byte except the last.
pub fn encode_varint(mut value: u64) -> Vec<u8> {
    let mut digits = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        digits.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    digits.reverse();
    digits
}

/// Decode a varint from the start of `data`.
///
/// Returns (value, bytes_consumed).
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize)> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 10 || value > (u64::MAX >> 7) {
            return Err(Nip77Error::VarintDecode("varint overflow".to_string()));
        }
        value = (value << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Nip77Error::VarintDecode(if data.is_empty() {
        "empty data".to_string()
    } else {
        "incomplete varint".to_string()
    }))
}

/// Cursor over an incoming message.
#[derive(Debug)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn read_byte(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Nip77Error::InvalidRange("unexpected end of message".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn read_varint(&mut self) -> Result<u64> {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        let (value, len) = decode_varint(rest)?;
        self.pos += len;
        Ok(value)
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                Nip77Error::InvalidRange(format!("need {len} bytes at offset {}", self.pos))
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }
}
