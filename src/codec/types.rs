//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Binary primitives for the handshake and payload schemas.
//!
//! The wire format uses Avro binary encoding for its structured values:
//! zigzag variable-length longs, length-prefixed bytes and strings,
//! 16-byte fixeds for protocol fingerprints, block-encoded maps, union
//! branch indices, and enum indices. Only the shapes the transport
//! actually exchanges are implemented here; there is no general schema
//! machinery.
//!
//! Writers append to any [`BufMut`]; reads go through [`Reader`], a
//! cursor over a byte slice that reports truncation instead of
//! panicking, so partially-received payloads surface as errors.

use crate::error::WireError;
use bytes::{BufMut, Bytes};
use std::collections::HashMap;

/// Number of bytes in a protocol fingerprint.
pub const FINGERPRINT_SIZE: usize = 16;

/// Writes a long as a zigzag-encoded varint.
pub fn write_long(buf: &mut impl BufMut, value: i64) {
    let mut n = ((value << 1) ^ (value >> 63)) as u64;
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            buf.put_u8(byte);
            break;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Writes a length-prefixed byte string.
pub fn write_bytes(buf: &mut impl BufMut, value: &[u8]) {
    write_long(buf, value.len() as i64);
    buf.put_slice(value);
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_string(buf: &mut impl BufMut, value: &str) {
    write_bytes(buf, value.as_bytes());
}

/// Writes a 16-byte fixed.
pub fn write_fixed16(buf: &mut impl BufMut, value: &[u8; FINGERPRINT_SIZE]) {
    buf.put_slice(value);
}

/// Writes the branch index of a two-branch `[null, T]` union.
///
/// Branch 0 is null, branch 1 carries a value; the caller writes the
/// value itself after a `true` branch.
pub fn write_union_branch(buf: &mut impl BufMut, present: bool) {
    write_long(buf, i64::from(present));
}

/// Writes an enum symbol index.
pub fn write_enum(buf: &mut impl BufMut, index: i64) {
    write_long(buf, index);
}

/// Writes a `map<bytes>` as a single block followed by the terminator.
///
/// An empty map is a bare terminator byte.
pub fn write_map_bytes(buf: &mut impl BufMut, map: &HashMap<String, Bytes>) {
    if !map.is_empty() {
        write_long(buf, map.len() as i64);
        for (key, value) in map {
            write_string(buf, key);
            write_bytes(buf, value);
        }
    }
    write_long(buf, 0);
}

/// Writes a `map<string>` as a single block followed by the terminator.
pub fn write_map_string(buf: &mut impl BufMut, map: &HashMap<String, String>) {
    if !map.is_empty() {
        write_long(buf, map.len() as i64);
        for (key, value) in map {
            write_string(buf, key);
            write_string(buf, value);
        }
    }
    write_long(buf, 0);
}

/// Cursor over a byte slice, decoding the primitives written above.
///
/// Every read reports [`WireError::Truncated`] with the label of the
/// value being decoded when the slice runs out.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over the whole slice.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The unread tail of the slice.
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    /// Returns `true` if every byte has been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Reads a zigzag-encoded varint long.
    pub fn read_long(&mut self, what: &'static str) -> Result<i64, WireError> {
        let mut n: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(WireError::Truncated { what })?;
            self.pos += 1;
            n |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 63 {
                return Err(WireError::Truncated { what });
            }
        }
        Ok(((n >> 1) as i64) ^ -((n & 1) as i64))
    }

    /// Reads a length-prefixed byte string.
    pub fn read_bytes(&mut self, what: &'static str) -> Result<&'a [u8], WireError> {
        let len = self.read_long(what)?;
        if len < 0 {
            return Err(WireError::NegativeLength { len, what });
        }
        let len = len as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(WireError::Truncated { what })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn read_string(&mut self, what: &'static str) -> Result<&'a str, WireError> {
        let bytes = self.read_bytes(what)?;
        std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    /// Reads a 16-byte fixed.
    pub fn read_fixed16(&mut self, what: &'static str) -> Result<[u8; FINGERPRINT_SIZE], WireError> {
        let end = self.pos + FINGERPRINT_SIZE;
        if end > self.buf.len() {
            return Err(WireError::Truncated { what });
        }
        let mut out = [0u8; FINGERPRINT_SIZE];
        out.copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    /// Reads a `[null, T]` union branch index.
    pub fn read_union_branch(&mut self, what: &'static str) -> Result<bool, WireError> {
        match self.read_long(what)? {
            0 => Ok(false),
            1 => Ok(true),
            index => Err(WireError::InvalidUnionBranch { index }),
        }
    }

    /// Reads an enum symbol index, checked against the symbol count.
    pub fn read_enum(&mut self, symbols: i64, what: &'static str) -> Result<i64, WireError> {
        let index = self.read_long(what)?;
        if index < 0 || index >= symbols {
            return Err(WireError::InvalidEnumIndex { index });
        }
        Ok(index)
    }

    /// Reads a block-encoded `map<bytes>`.
    ///
    /// Negative block counts (count plus byte size, as writers are
    /// allowed to emit) are handled by skipping the size long.
    pub fn read_map_bytes(
        &mut self,
        what: &'static str,
    ) -> Result<HashMap<String, Bytes>, WireError> {
        let mut map = HashMap::new();
        loop {
            let mut count = self.read_long(what)?;
            if count == 0 {
                return Ok(map);
            }
            if count < 0 {
                count = -count;
                let _block_size = self.read_long(what)?;
            }
            for _ in 0..count {
                let key = self.read_string(what)?.to_owned();
                let value = Bytes::copy_from_slice(self.read_bytes(what)?);
                map.insert(key, value);
            }
        }
    }

    /// Reads a block-encoded `map<string>`.
    pub fn read_map_string(
        &mut self,
        what: &'static str,
    ) -> Result<HashMap<String, String>, WireError> {
        let mut map = HashMap::new();
        loop {
            let mut count = self.read_long(what)?;
            if count == 0 {
                return Ok(map);
            }
            if count < 0 {
                count = -count;
                let _block_size = self.read_long(what)?;
            }
            for _ in 0..count {
                let key = self.read_string(what)?.to_owned();
                let value = self.read_string(what)?.to_owned();
                map.insert(key, value);
            }
        }
    }
}
