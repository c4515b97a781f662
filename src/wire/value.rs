//! Bounded msgpack value decoding.
//!
//! This module parses untrusted input. Every collection header is checked
//! against hard caps *before* the corresponding allocation, so a crafted
//! body can never make the daemon reserve memory it has not already read
//! off the wire:
//!
//! - nesting depth (arrays/maps) is capped,
//! - per-collection element counts are capped,
//! - string and binary lengths are capped.
//!
//! Decoded trees are standard [`rmpv::Value`]s; encoding goes through
//! `rmpv::encode`. Extension types and the reserved marker are rejected —
//! no client of this protocol produces them.

use rmpv::Value;
use thiserror::Error;

/// Caps applied while decoding one frame body.
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    /// Maximum array/map nesting depth.
    pub max_depth: usize,
    /// Maximum elements per array, pairs per map.
    pub max_collection_len: usize,
    /// Maximum string/binary payload in bytes.
    pub max_string_bytes: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_depth: 20,
            max_collection_len: 256,
            max_string_bytes: 4096,
        }
    }
}

/// Decode failures. All variants are recoverable at the session level:
/// the frame was well-delimited, only its content is unusable.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("body ended mid-value")]
    Truncated,

    #[error("nesting deeper than {max} levels")]
    DepthExceeded { max: usize },

    #[error("collection of {len} elements exceeds cap of {max}")]
    CollectionTooLong { len: usize, max: usize },

    #[error("string of {len} bytes exceeds cap of {max}")]
    StringTooLong { len: usize, max: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unsupported msgpack type marker 0x{marker:02x}")]
    UnsupportedType { marker: u8 },
}

/// Cursor-style decoder over one frame body.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    limits: DecodeLimits,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], limits: DecodeLimits) -> Self {
        Self {
            buf,
            pos: 0,
            limits,
        }
    }

    /// Whether the body has been fully consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Decode the next value in the body.
    pub fn read_value(&mut self) -> Result<Value, DecodeError> {
        self.value_at_depth(0)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32_be(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_be(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }

    fn str_value(&mut self, len: usize) -> Result<Value, DecodeError> {
        if len > self.limits.max_string_bytes {
            return Err(DecodeError::StringTooLong {
                len,
                max: self.limits.max_string_bytes,
            });
        }
        let raw = self.take(len)?;
        let text = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
        Ok(Value::from(text))
    }

    fn bin_value(&mut self, len: usize) -> Result<Value, DecodeError> {
        if len > self.limits.max_string_bytes {
            return Err(DecodeError::StringTooLong {
                len,
                max: self.limits.max_string_bytes,
            });
        }
        Ok(Value::Binary(self.take(len)?.to_vec()))
    }

    fn array_value(&mut self, len: usize, depth: usize) -> Result<Value, DecodeError> {
        self.check_collection(len, depth)?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(self.value_at_depth(depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn map_value(&mut self, len: usize, depth: usize) -> Result<Value, DecodeError> {
        self.check_collection(len, depth)?;
        let mut pairs = Vec::with_capacity(len);
        for _ in 0..len {
            let key = self.value_at_depth(depth + 1)?;
            let value = self.value_at_depth(depth + 1)?;
            pairs.push((key, value));
        }
        Ok(Value::Map(pairs))
    }

    fn check_collection(&self, len: usize, depth: usize) -> Result<(), DecodeError> {
        if depth + 1 > self.limits.max_depth {
            return Err(DecodeError::DepthExceeded {
                max: self.limits.max_depth,
            });
        }
        if len > self.limits.max_collection_len {
            return Err(DecodeError::CollectionTooLong {
                len,
                max: self.limits.max_collection_len,
            });
        }
        Ok(())
    }

    fn value_at_depth(&mut self, depth: usize) -> Result<Value, DecodeError> {
        let marker = self.byte()?;
        match marker {
            // positive fixint
            0x00..=0x7f => Ok(Value::from(marker as u64)),
            // fixmap
            0x80..=0x8f => self.map_value((marker & 0x0f) as usize, depth),
            // fixarray
            0x90..=0x9f => self.array_value((marker & 0x0f) as usize, depth),
            // fixstr
            0xa0..=0xbf => self.str_value((marker & 0x1f) as usize),
            0xc0 => Ok(Value::Nil),
            0xc2 => Ok(Value::from(false)),
            0xc3 => Ok(Value::from(true)),
            0xc4 => {
                let len = self.byte()? as usize;
                self.bin_value(len)
            }
            0xc5 => {
                let len = self.u16_be()? as usize;
                self.bin_value(len)
            }
            0xc6 => {
                let len = self.u32_be()? as usize;
                self.bin_value(len)
            }
            0xca => {
                let bits = self.u32_be()?;
                Ok(Value::F32(f32::from_bits(bits)))
            }
            0xcb => {
                let bits = self.u64_be()?;
                Ok(Value::F64(f64::from_bits(bits)))
            }
            0xcc => Ok(Value::from(self.byte()? as u64)),
            0xcd => Ok(Value::from(self.u16_be()? as u64)),
            0xce => Ok(Value::from(self.u32_be()? as u64)),
            0xcf => Ok(Value::from(self.u64_be()?)),
            0xd0 => Ok(Value::from(self.byte()? as i8 as i64)),
            0xd1 => Ok(Value::from(self.u16_be()? as i16 as i64)),
            0xd2 => Ok(Value::from(self.u32_be()? as i32 as i64)),
            0xd3 => Ok(Value::from(self.u64_be()? as i64)),
            0xd9 => {
                let len = self.byte()? as usize;
                self.str_value(len)
            }
            0xda => {
                let len = self.u16_be()? as usize;
                self.str_value(len)
            }
            0xdb => {
                let len = self.u32_be()? as usize;
                self.str_value(len)
            }
            0xdc => {
                let len = self.u16_be()? as usize;
                self.array_value(len, depth)
            }
            0xdd => {
                let len = self.u32_be()? as usize;
                self.array_value(len, depth)
            }
            0xde => {
                let len = self.u16_be()? as usize;
                self.map_value(len, depth)
            }
            0xdf => {
                let len = self.u32_be()? as usize;
                self.map_value(len, depth)
            }
            // negative fixint
            0xe0..=0xff => Ok(Value::from(marker as i8 as i64)),
            // ext family and the reserved 0xc1 marker
            _ => Err(DecodeError::UnsupportedType { marker }),
        }
    }
}

/// Encode one value, appending to `out`.
///
/// Encoding into a `Vec` cannot fail for the value shapes this crate
/// produces; an error here means a bug, and is surfaced as such.
pub fn encode_into(out: &mut Vec<u8>, value: &Value) {
    // Writing to a Vec never returns an I/O error.
    let _ = rmpv::encode::write_value(out, value);
}

/// Look up a string key in a msgpack map value.
pub fn map_get<'v>(value: &'v Value, key: &str) -> Option<&'v Value> {
    value.as_map().and_then(|pairs| {
        pairs
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    })
}

/// String field helper for command payload maps.
pub fn map_get_str<'v>(value: &'v Value, key: &str) -> Option<&'v str> {
    map_get(value, key).and_then(Value::as_str)
}

/// Unsigned field helper for command payload maps.
pub fn map_get_u64(value: &Value, key: &str) -> Option<u64> {
    map_get(value, key).and_then(Value::as_u64)
}

/// Bool field helper for command payload maps.
pub fn map_get_bool(value: &Value, key: &str) -> Option<bool> {
    map_get(value, key).and_then(Value::as_bool)
}
