//! FastCGI name/value pair encoding, used by Params and GetValues records.
//!
//! Each length is one byte when below 128, otherwise four bytes big-endian
//! with bit 31 set. Workers decode the same format, so this must stay
//! bit-exact.

use crate::error::{Error, Result};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

const LONG_FORM_FLAG: u32 = 0x8000_0000;
const MAX_PAIR_LEN: usize = 0x7fff_ffff;

fn put_len(buf: &mut BytesMut, len: usize) {
    debug_assert!(len <= MAX_PAIR_LEN, "name/value length {len} exceeds 31 bits");
    if len < 128 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32((len as u32) | LONG_FORM_FLAG);
    }
}

/// Append one encoded pair to `buf`.
pub fn encode_pair(buf: &mut BytesMut, name: &[u8], value: &[u8]) {
    put_len(buf, name.len());
    put_len(buf, value.len());
    buf.extend_from_slice(name);
    buf.extend_from_slice(value);
}

/// Encode every pair yielded by `pairs` back to back.
pub fn encode_pairs<'a, I, K, V>(pairs: I) -> BytesMut
where
    I: IntoIterator<Item = (&'a K, &'a V)>,
    K: AsRef<[u8]> + ?Sized + 'a,
    V: AsRef<[u8]> + ?Sized + 'a,
{
    let mut buf = BytesMut::new();
    for (name, value) in pairs {
        encode_pair(&mut buf, name.as_ref(), value.as_ref());
    }
    buf
}

/// Lazily decode the pairs in `data`.
pub fn decode_pairs(data: &[u8]) -> Pairs<'_> {
    Pairs {
        rest: data,
        failed: false,
    }
}

/// Decode into a map of strings; later duplicates win.
pub fn decode_pairs_to_map(data: &[u8]) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for pair in decode_pairs(data) {
        let (name, value) = pair?;
        let name = std::str::from_utf8(name)
            .map_err(|_| Error::decode("name/value name is not valid UTF-8"))?;
        let value = std::str::from_utf8(value)
            .map_err(|_| Error::decode("name/value value is not valid UTF-8"))?;
        map.insert(name.to_string(), value.to_string());
    }
    Ok(map)
}

/// Iterator over encoded pairs. Yields at most one error, then stops.
#[derive(Debug, Clone)]
pub struct Pairs<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> Pairs<'a> {
    fn take_len(&mut self) -> Result<usize> {
        let Some(&first) = self.rest.first() else {
            return Err(Error::decode("name/value length missing"));
        };
        if first < 128 {
            self.rest = &self.rest[1..];
            return Ok(first as usize);
        }
        if self.rest.len() < 4 {
            return Err(Error::decode("truncated 4-byte name/value length"));
        }
        let raw = u32::from_be_bytes([self.rest[0], self.rest[1], self.rest[2], self.rest[3]]);
        self.rest = &self.rest[4..];
        Ok((raw & !LONG_FORM_FLAG) as usize)
    }

    fn take_pair(&mut self) -> Result<(&'a [u8], &'a [u8])> {
        let name_len = self.take_len()?;
        let value_len = self.take_len()?;
        let needed = name_len
            .checked_add(value_len)
            .ok_or_else(|| Error::decode("name/value lengths overflow"))?;
        if self.rest.len() < needed {
            return Err(Error::decode(format!(
                "truncated name/value pair: need {} bytes, have {}",
                needed,
                self.rest.len()
            )));
        }
        let (name, tail) = self.rest.split_at(name_len);
        let (value, tail) = tail.split_at(value_len);
        self.rest = tail;
        Ok((name, value))
    }
}

impl<'a> Iterator for Pairs<'a> {
    type Item = Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        let pair = self.take_pair();
        if pair.is_err() {
            self.failed = true;
        }
        Some(pair)
    }
}
