//! # Bencode Decoding
//!
//! This module implements a decoder for bencode, the encoding used by
//! BitTorrent metainfo files and tracker responses.
//!
//! ## Format
//!
//! Bencode has four value kinds, each self-delimiting:
//!
//! | Prefix | Form           | Value                         |
//! |--------|----------------|-------------------------------|
//! | `i`    | `i<digits>e`   | signed integer                |
//! | digit  | `<len>:<bytes>`| byte-string of exactly `len`  |
//! | `l`    | `l<value>*e`   | list                          |
//! | `d`    | `d(<k><v>)*e`  | dictionary with string keys   |
//!
//! Byte-strings are raw bytes, not text: the `pieces` value of a metainfo
//! file is binary SHA-1 material and must round-trip exactly.
//!
//! ## Info slice capture
//!
//! The swarm identifier (info-hash) is the SHA-1 of the bencoded `info`
//! dictionary *as it appears in the source file*. Re-encoding the parsed
//! structure only matches when the source was canonically encoded, so
//! [`decode_with_info`] records the exact byte range of the `info` value
//! while scanning and returns the verbatim slice alongside its digest.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};
use thiserror::Error;

/// Decoding failures, one variant per malformation kind.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unterminated {0}")]
    Unterminated(&'static str),

    #[error("missing ':' after string length")]
    MissingColon,

    #[error("expected digit, found byte {0:#04x}")]
    ExpectedDigit(u8),

    #[error("string length exceeds remaining input")]
    StringOutOfBounds,

    #[error("dictionary key is not a byte-string")]
    KeyNotString,

    #[error("invalid integer body")]
    InvalidInteger,

    #[error("trailing data after top-level value")]
    TrailingData,

    #[error("top-level value must be a dictionary")]
    TopLevelNotDict,
}

/// A decoded bencode value.
///
/// Dictionary keys are byte-strings and kept in their natural (lexicographic)
/// order; a well-formed encoder emits them sorted, but consumers treat the
/// mapping as unordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Look up a dictionary entry by key. Returns `None` for non-dicts.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(d) => d.get(key),
            _ => None,
        }
    }
}

/// The verbatim `info` value of a metainfo dictionary and its SHA-1.
#[derive(Debug, Clone)]
pub struct RawInfo {
    /// Exact source bytes of the bencoded `info` value.
    pub bytes: Vec<u8>,
    /// SHA-1 over `bytes`: the swarm identifier.
    pub hash: [u8; 20],
}

/// Decode a complete bencoded value.
///
/// The whole input must be consumed; trailing bytes are an error.
///
/// Integer parsing is lenient about leading zeros and `-0`, which strict
/// bencode forbids but encoders in the wild produce.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let mut decoder = Decoder::new(data);
    let value = decoder.parse_value()?;
    decoder.finish()?;
    Ok(value)
}

/// Decode a metainfo file: a top-level dictionary, additionally reporting
/// the verbatim `info` slice and its SHA-1 when that key is present.
pub fn decode_with_info(data: &[u8]) -> Result<(Value, Option<RawInfo>), BencodeError> {
    let mut decoder = Decoder::new(data);

    if decoder.peek()? != b'd' {
        return Err(BencodeError::TopLevelNotDict);
    }
    decoder.pos += 1;

    let mut dict = BTreeMap::new();
    let mut raw_info: Option<RawInfo> = None;

    loop {
        match decoder.peek() {
            Ok(b'e') => break,
            Ok(_) => {}
            Err(_) => return Err(BencodeError::Unterminated("dictionary")),
        }

        let key = match decoder.parse_value()? {
            Value::Bytes(key) => key,
            _ => return Err(BencodeError::KeyNotString),
        };

        let start = decoder.pos;
        let value = decoder.parse_value()?;
        if key == b"info" {
            let bytes = decoder.data[start..decoder.pos].to_vec();
            let hash = Sha1::digest(&bytes).into();
            raw_info = Some(RawInfo { bytes, hash });
        }
        dict.insert(key, value);
    }
    decoder.pos += 1;
    decoder.finish()?;

    Ok((Value::Dict(dict), raw_info))
}

/// Recursive-descent parser over a byte buffer with a shared cursor.
struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Decoder<'a> {
        Decoder { data, pos: 0 }
    }

    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEnd)
    }

    fn finish(&self) -> Result<(), BencodeError> {
        if self.pos != self.data.len() {
            return Err(BencodeError::TrailingData);
        }
        Ok(())
    }

    fn parse_value(&mut self) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_bytes()?)),
            other => Err(BencodeError::ExpectedDigit(other)),
        }
    }

    fn parse_int(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek().map_err(|_| BencodeError::Unterminated("integer"))? != b'e' {
            self.pos += 1;
        }
        let body = &self.data[start..self.pos];
        self.pos += 1;

        let n = std::str::from_utf8(body)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or(BencodeError::InvalidInteger)?;
        Ok(Value::Int(n))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        if self.peek()? != b':' {
            return Err(BencodeError::MissingColon);
        }
        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::StringOutOfBounds)?;
        self.pos += 1;

        if len > self.data.len() - self.pos {
            return Err(BencodeError::StringOutOfBounds);
        }
        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut list = Vec::new();
        loop {
            match self.peek() {
                Ok(b'e') => break,
                Ok(_) => list.push(self.parse_value()?),
                Err(_) => return Err(BencodeError::Unterminated("list")),
            }
        }
        self.pos += 1;
        Ok(Value::List(list))
    }

    fn parse_dict(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut dict = BTreeMap::new();
        loop {
            match self.peek() {
                Ok(b'e') => break,
                Ok(_) => {}
                Err(_) => return Err(BencodeError::Unterminated("dictionary")),
            }
            let key = match self.parse_value()? {
                Value::Bytes(key) => key,
                _ => return Err(BencodeError::KeyNotString),
            };
            let value = self.parse_value()?;
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(dict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    #[test]
    fn decode_string() {
        assert_eq!(decode(b"4:spam").unwrap(), bytes("spam"));
        assert_eq!(decode(b"0:").unwrap(), bytes(""));
    }

    #[test]
    fn decode_integers() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    }

    #[test]
    fn decode_lenient_integers() {
        // Strict bencode forbids these; wild encoders emit them.
        assert_eq!(decode(b"i042e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i-0e").unwrap(), Value::Int(0));
    }

    #[test]
    fn decode_invalid_integers() {
        assert_eq!(decode(b"ie").unwrap_err(), BencodeError::InvalidInteger);
        assert_eq!(decode(b"i-e").unwrap_err(), BencodeError::InvalidInteger);
        assert_eq!(decode(b"i4x2e").unwrap_err(), BencodeError::InvalidInteger);
    }

    #[test]
    fn decode_list() {
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            Value::List(vec![bytes("spam"), Value::Int(42)])
        );
    }

    #[test]
    fn decode_dict() {
        let value = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        match &value {
            Value::Dict(d) => assert_eq!(d.len(), 2),
            other => panic!("expected dict, got {:?}", other),
        }
        assert_eq!(value.get(b"cow"), Some(&bytes("moo")));
        assert_eq!(value.get(b"spam"), Some(&bytes("eggs")));
    }

    #[test]
    fn decode_truncated_inputs() {
        assert_eq!(
            decode(b"i42").unwrap_err(),
            BencodeError::Unterminated("integer")
        );
        assert_eq!(decode(b"4:spa").unwrap_err(), BencodeError::StringOutOfBounds);
        // Cut after a key: the missing value is the unexpected end.
        assert_eq!(decode(b"d3:cow").unwrap_err(), BencodeError::UnexpectedEnd);
        assert_eq!(
            decode(b"d3:cow3:moo").unwrap_err(),
            BencodeError::Unterminated("dictionary")
        );
        assert_eq!(decode(b"l").unwrap_err(), BencodeError::Unterminated("list"));
    }

    #[test]
    fn decode_non_digit_length() {
        assert_eq!(
            decode(b"a:xx").unwrap_err(),
            BencodeError::ExpectedDigit(b'a')
        );
    }

    #[test]
    fn decode_rejects_trailing_data() {
        assert_eq!(decode(b"i42ei43e").unwrap_err(), BencodeError::TrailingData);
    }

    #[test]
    fn decode_rejects_non_string_key() {
        assert_eq!(
            decode(b"di1e3:mooe").unwrap_err(),
            BencodeError::KeyNotString
        );
    }

    #[test]
    fn with_info_requires_dict() {
        assert_eq!(
            decode_with_info(b"i42e").unwrap_err(),
            BencodeError::TopLevelNotDict
        );
    }

    #[test]
    fn with_info_captures_verbatim_slice() {
        // Keys deliberately out of lexicographic order: the captured slice
        // and its digest must come from the source bytes, not a re-encode.
        let data = b"d4:infod6:pieces20:aaaaaaaaaaaaaaaaaaaa1:zi1ee8:announce3:urle";
        let (value, raw) = decode_with_info(data).unwrap();
        let raw = raw.unwrap();

        let expected = &b"d6:pieces20:aaaaaaaaaaaaaaaaaaaa1:zi1ee"[..];
        assert_eq!(raw.bytes, expected);
        let digest: [u8; 20] = Sha1::digest(expected).into();
        assert_eq!(raw.hash, digest);

        assert_eq!(value.get(b"announce"), Some(&bytes("url")));
        assert!(value.get(b"info").is_some());
    }

    #[test]
    fn with_info_absent_key() {
        let (value, raw) = decode_with_info(b"d3:cow3:mooe").unwrap();
        assert!(raw.is_none());
        assert_eq!(value.get(b"cow"), Some(&bytes("moo")));
    }
}
