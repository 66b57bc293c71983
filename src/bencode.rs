//! Byte-exact bencode decoding and encoding.
//!
//! Metainfo files are handled as raw bytes end to end: the decoder rejects
//! every syntax violation the format defines and the encoder reproduces the
//! canonical byte sequence, so `encode(decode(x)) == x` holds for any valid
//! input. This is what keeps the info-hash stable across a decode/re-encode
//! round trip.

use std::collections::BTreeMap;

use crate::error::bencode::{BencodeError, Result};

/// A decoded bencode value.
///
/// Dictionaries are keyed by raw byte strings and kept sorted, which is also
/// the order the encoder must emit them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
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

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(d) => d.get(key),
            _ => None,
        }
    }

    /// Inserts a key into this value if it is a dictionary, replacing any
    /// previous entry.
    pub fn insert(&mut self, key: impl Into<Vec<u8>>, value: Value) {
        if let Value::Dict(d) = self {
            d.insert(key.into(), value);
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }
}

/// Decodes a complete bencoded buffer.
///
/// The whole input must be consumed by the top-level value, otherwise the
/// data after the valid prefix is reported as trailing.
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let mut parser = Parser { bytes, pos: 0 };
    let value = parser.parse_value()?;
    if parser.pos != bytes.len() {
        return Err(BencodeError::TrailingData(parser.pos));
    }
    Ok(value)
}

/// Encodes a value back into its canonical byte form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(entries) => {
            // BTreeMap iterates keys in ascending byte order, which is the
            // canonical dictionary order on the wire.
            out.push(b'd');
            for (key, item) in entries {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(self.pos))
    }

    fn bump(&mut self) -> Result<u8> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_bytes()?)),
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                offset: self.pos,
            }),
        }
    }

    fn parse_integer(&mut self) -> Result<Value> {
        let start = self.pos;
        self.bump()?; // 'i'

        let negative = self.peek()? == b'-';
        if negative {
            self.bump()?;
        }

        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.bytes[digits_start..self.pos];

        if self.bump()? != b'e' {
            return Err(BencodeError::InvalidInteger(start));
        }
        if digits.is_empty() {
            return Err(BencodeError::InvalidInteger(start));
        }
        // no leading zeros except the value 0 itself, and -0 is illegal
        if digits[0] == b'0' && (negative || digits.len() > 1) {
            return Err(BencodeError::InvalidInteger(start));
        }

        let mut n: i64 = 0;
        for &d in digits {
            n = n
                .checked_mul(10)
                .and_then(|n| {
                    if negative {
                        n.checked_sub(i64::from(d - b'0'))
                    } else {
                        n.checked_add(i64::from(d - b'0'))
                    }
                })
                .ok_or(BencodeError::IntegerOverflow(start))?;
        }
        Ok(Value::Integer(n))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;

        let digits_start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        let digits = &self.bytes[digits_start..self.pos];

        if digits.is_empty() || (digits[0] == b'0' && digits.len() > 1) {
            return Err(BencodeError::InvalidLength(start));
        }
        if self.bump()? != b':' {
            return Err(BencodeError::InvalidLength(start));
        }

        let mut len: usize = 0;
        for &d in digits {
            len = len
                .checked_mul(10)
                .and_then(|l| l.checked_add(usize::from(d - b'0')))
                .ok_or(BencodeError::InvalidLength(start))?;
        }

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(BencodeError::UnexpectedEof(self.bytes.len()))?;
        let bytes = self.bytes[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value> {
        self.bump()?; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.pos += 1; // 'e'
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self) -> Result<Value> {
        self.bump()?; // 'd'
        let mut entries = BTreeMap::new();
        while self.peek()? != b'e' {
            // dict keys are always byte strings
            let offset = self.pos;
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::UnexpectedByte {
                    byte: self.bytes[offset],
                    offset,
                });
            }
            let key = self.parse_bytes()?;
            let value = self.parse_value()?;
            entries.insert(key, value);
        }
        self.pos += 1; // 'e'
        Ok(Value::Dict(entries))
    }
}
