//! Bit-level helpers shared by the software decoder cores.
//!
//! Only the handful of syntax elements needed to find sequence headers and
//! picture boundaries are ever read; nothing here reconstructs pictures.

use std::ops::Range;

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitstreamError {
    #[error("bitstream overread")]
    Overread,
    #[error("exp-golomb code longer than 31 bits")]
    CodeTooLong,
    #[error("unexpected marker or sync code")]
    BadMarker,
    #[error("{0} out of range")]
    OutOfRange(&'static str),
}

pub type BitResult<T> = std::result::Result<T, BitstreamError>;

pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    pub fn read_bits(&mut self, count: usize) -> BitResult<u32> {
        debug_assert!(count <= 32);
        let mut value = 0u32;
        for _ in 0..count {
            let byte_pos = self.bit_pos / 8;
            if byte_pos >= self.data.len() {
                return Err(BitstreamError::Overread);
            }
            let bit_offset = 7 - (self.bit_pos % 8);
            let bit = (self.data[byte_pos] >> bit_offset) & 1;
            value = (value << 1) | (bit as u32);
            self.bit_pos += 1;
        }
        Ok(value)
    }

    pub fn read_flag(&mut self) -> BitResult<bool> {
        Ok(self.read_bits(1)? == 1)
    }

    pub fn skip_bits(&mut self, count: usize) -> BitResult<()> {
        if self.bit_pos + count > self.data.len() * 8 {
            return Err(BitstreamError::Overread);
        }
        self.bit_pos += count;
        Ok(())
    }

    pub fn read_ue(&mut self) -> BitResult<u32> {
        let mut zeros = 0;
        while self.read_bits(1)? == 0 {
            zeros += 1;
            if zeros > 31 {
                return Err(BitstreamError::CodeTooLong);
            }
        }
        if zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(zeros)?;
        Ok(((1u64 << zeros) - 1 + suffix as u64) as u32)
    }

    pub fn read_se(&mut self) -> BitResult<i32> {
        let ue = self.read_ue()? as i64;
        let value = if ue % 2 == 0 { -(ue / 2) } else { (ue + 1) / 2 };
        Ok(value as i32)
    }
}

/// MSB-first bit writer used to build synthetic headers.
#[derive(Debug, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    current: u8,
    filled: u8,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bits(&mut self, value: u64, count: usize) {
        for shift in (0..count).rev() {
            let bit = ((value >> shift) & 1) as u8;
            self.current = (self.current << 1) | bit;
            self.filled += 1;
            if self.filled == 8 {
                self.data.push(self.current);
                self.current = 0;
                self.filled = 0;
            }
        }
    }

    pub fn write_flag(&mut self, flag: bool) {
        self.write_bits(flag as u64, 1);
    }

    pub fn write_ue(&mut self, value: u32) {
        let coded = value as u64 + 1;
        let len = 64 - coded.leading_zeros() as usize;
        self.write_bits(0, len - 1);
        self.write_bits(coded, len);
    }

    pub fn write_se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            (-(value as i64) as u32) * 2
        };
        self.write_ue(mapped);
    }

    /// Stop bit plus zero padding to the next byte boundary.
    pub fn write_trailing_bits(&mut self) {
        self.write_bits(1, 1);
        self.align();
    }

    /// Zero padding to the next byte boundary.
    pub fn align(&mut self) {
        while self.filled != 0 {
            self.write_bits(0, 1);
        }
    }

    pub fn into_bytes(mut self) -> Vec<u8> {
        self.align();
        self.data
    }
}

/// Strips `00 00 03` emulation prevention bytes.
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if i + 2 < data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 3 {
            out.push(0);
            out.push(0);
            i += 3;
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

/// Inserts emulation prevention bytes so the payload never contains a start code.
pub fn add_emulation_prevention(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64);
    let mut zeros = 0;
    for &byte in rbsp {
        if zeros >= 2 && byte <= 3 {
            out.push(3);
            zeros = 0;
        }
        out.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// Offset and length of the first Annex B start code at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                return Some((i, 3));
            }
            if data[i + 2] == 0 && i + 3 < data.len() && data[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

/// The unit at the head of an Annex B buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnexBUnit {
    /// A NAL unit; `payload` starts at the NAL header, `len` includes the
    /// leading start code.
    Nal { payload: Range<usize>, len: usize },
    /// Bytes before the first start code.
    Garbage { len: usize },
}

impl AnnexBUnit {
    pub fn len(&self) -> usize {
        match self {
            AnnexBUnit::Nal { len, .. } | AnnexBUnit::Garbage { len } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn next_annex_b_unit(data: &[u8]) -> AnnexBUnit {
    match find_start_code(data, 0) {
        Some((0, code_len)) => {
            let end = find_start_code(data, code_len)
                .map(|(pos, _)| pos)
                .unwrap_or(data.len());
            AnnexBUnit::Nal {
                payload: code_len..end,
                len: end,
            }
        }
        Some((pos, _)) => AnnexBUnit::Garbage { len: pos },
        None => AnnexBUnit::Garbage { len: data.len() },
    }
}

/// All NAL payloads of an Annex B buffer, start codes stripped.
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let unit = next_annex_b_unit(&data[offset..]);
        if let AnnexBUnit::Nal { payload, .. } = &unit
            && !payload.is_empty()
        {
            units.push(&data[offset + payload.start..offset + payload.end]);
        }
        offset += unit.len();
    }
    units
}
