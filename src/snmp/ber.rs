//! BER encoding for the subset of ASN.1 that SNMP uses.

use bytes::BufMut;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod tag {
    pub const INTEGER: u8 = 0x02;
    pub const OCTET_STRING: u8 = 0x04;
    pub const NULL: u8 = 0x05;
    pub const OBJECT_ID: u8 = 0x06;
    pub const SEQUENCE: u8 = 0x30;

    pub const IP_ADDRESS: u8 = 0x40;
    pub const COUNTER32: u8 = 0x41;
    pub const GAUGE32: u8 = 0x42;
    pub const TIMETICKS: u8 = 0x43;
    pub const COUNTER64: u8 = 0x46;

    pub const NO_SUCH_OBJECT: u8 = 0x80;
    pub const NO_SUCH_INSTANCE: u8 = 0x81;
    pub const END_OF_MIB_VIEW: u8 = 0x82;

    pub const GET_REQUEST: u8 = 0xa0;
    pub const GET_NEXT_REQUEST: u8 = 0xa1;
    pub const RESPONSE: u8 = 0xa2;
    pub const SET_REQUEST: u8 = 0xa3;
    pub const REPORT: u8 = 0xa8;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BerError {
    #[error("unexpected end of data")]
    Truncated,
    #[error("expected tag {expected:#04x}, found {found:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("unsupported length encoding")]
    BadLength,
    #[error("integer does not fit in 64 bits")]
    IntegerOverflow,
    #[error("invalid object identifier {0:?}")]
    InvalidOid(String),
    #[error("unsupported {0}")]
    Unsupported(String),
}

// ============================================================================
// Object Identifier
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Oid(Vec<u32>);

impl Oid {
    pub fn from_slice(arcs: &[u32]) -> Self {
        Self(arcs.to_vec())
    }

    pub fn arcs(&self) -> &[u32] {
        &self.0
    }

    fn encode_content(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let (first, rest) = match self.0.as_slice() {
            [a, b, rest @ ..] => (u64::from(*a) * 40 + u64::from(*b), rest),
            [a] => (u64::from(*a) * 40, &[][..]),
            [] => (0, &[][..]),
        };
        put_base128(&mut out, first);
        for arc in rest {
            put_base128(&mut out, u64::from(*arc));
        }
        out
    }

    fn decode_content(content: &[u8]) -> Result<Self, BerError> {
        let mut arcs = Vec::new();
        let mut value: u64 = 0;
        for (i, &byte) in content.iter().enumerate() {
            value = (value << 7) | u64::from(byte & 0x7f);
            if value > u64::from(u32::MAX) + 80 {
                return Err(BerError::InvalidOid(hex::encode(content)));
            }
            if byte & 0x80 != 0 {
                if i + 1 == content.len() {
                    return Err(BerError::Truncated);
                }
                continue;
            }
            if arcs.is_empty() {
                let (a, b) = match value {
                    0..=39 => (0, value),
                    40..=79 => (1, value - 40),
                    _ => (2, value - 80),
                };
                arcs.push(a as u32);
                arcs.push(u32::try_from(b).map_err(|_| BerError::InvalidOid(hex::encode(content)))?);
            } else {
                arcs.push(u32::try_from(value).map_err(|_| BerError::InvalidOid(hex::encode(content)))?);
            }
            value = 0;
        }
        Ok(Self(arcs))
    }
}

impl FromStr for Oid {
    type Err = BerError;

    fn from_str(s: &str) -> Result<Self, BerError> {
        let arcs = s
            .trim_start_matches('.')
            .split('.')
            .map(|arc| arc.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| BerError::InvalidOid(s.to_string()))?;
        if arcs.len() < 2 || arcs[0] > 2 {
            return Err(BerError::InvalidOid(s.to_string()));
        }
        Ok(Self(arcs))
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for arc in &self.0 {
            write!(f, ".{arc}")?;
        }
        Ok(())
    }
}

fn put_base128(out: &mut Vec<u8>, mut value: u64) {
    let mut tmp = [0u8; 10];
    let mut i = tmp.len() - 1;
    tmp[i] = (value & 0x7f) as u8;
    value >>= 7;
    while value > 0 {
        i -= 1;
        tmp[i] = (value & 0x7f) as u8 | 0x80;
        value >>= 7;
    }
    out.extend_from_slice(&tmp[i..]);
}

// ============================================================================
// Values
// ============================================================================

/// A varbind value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    OctetString(Vec<u8>),
    Null,
    ObjectId(Oid),
    IpAddress([u8; 4]),
    Counter32(u32),
    Gauge32(u32),
    TimeTicks(u32),
    Counter64(u64),
    NoSuchObject,
    NoSuchInstance,
    EndOfMibView,
    Other { tag: u8, data: Vec<u8> },
}

impl Value {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Integer(v) => integer(*v),
            Value::OctetString(b) => octet_string(b),
            Value::Null => tlv(tag::NULL, &[]),
            Value::ObjectId(oid) => object_id(oid),
            Value::IpAddress(ip) => tlv(tag::IP_ADDRESS, ip),
            Value::Counter32(v) => tlv(tag::COUNTER32, &unsigned_content(u64::from(*v))),
            Value::Gauge32(v) => tlv(tag::GAUGE32, &unsigned_content(u64::from(*v))),
            Value::TimeTicks(v) => tlv(tag::TIMETICKS, &unsigned_content(u64::from(*v))),
            Value::Counter64(v) => tlv(tag::COUNTER64, &unsigned_content(*v)),
            Value::NoSuchObject => tlv(tag::NO_SUCH_OBJECT, &[]),
            Value::NoSuchInstance => tlv(tag::NO_SUCH_INSTANCE, &[]),
            Value::EndOfMibView => tlv(tag::END_OF_MIB_VIEW, &[]),
            Value::Other { tag, data } => tlv(*tag, data),
        }
    }

    fn decode(tag: u8, content: &[u8]) -> Result<Self, BerError> {
        Ok(match tag {
            tag::INTEGER => Value::Integer(decode_integer(content)?),
            tag::OCTET_STRING => Value::OctetString(content.to_vec()),
            tag::NULL => Value::Null,
            tag::OBJECT_ID => Value::ObjectId(Oid::decode_content(content)?),
            tag::IP_ADDRESS => {
                let ip: [u8; 4] = content.try_into().map_err(|_| BerError::BadLength)?;
                Value::IpAddress(ip)
            }
            tag::COUNTER32 => Value::Counter32(decode_u32(content)?),
            tag::GAUGE32 => Value::Gauge32(decode_u32(content)?),
            tag::TIMETICKS => Value::TimeTicks(decode_u32(content)?),
            tag::COUNTER64 => Value::Counter64(decode_unsigned(content)?),
            tag::NO_SUCH_OBJECT => Value::NoSuchObject,
            tag::NO_SUCH_INSTANCE => Value::NoSuchInstance,
            tag::END_OF_MIB_VIEW => Value::EndOfMibView,
            other => Value::Other {
                tag: other,
                data: content.to_vec(),
            },
        })
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Size of the tag and length octets for `content_len` bytes of content.
pub fn header_len(content_len: usize) -> usize {
    if content_len < 0x80 {
        2
    } else {
        let bytes = (usize::BITS - content_len.leading_zeros()).div_ceil(8) as usize;
        2 + bytes
    }
}

pub fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header_len(content.len()) + content.len());
    out.put_u8(tag);
    let len = content.len();
    if len < 0x80 {
        out.put_u8(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.put_u8(0x80 | (bytes.len() - skip) as u8);
        out.put_slice(&bytes[skip..]);
    }
    out.put_slice(content);
    out
}

pub fn integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    tlv(tag::INTEGER, &bytes[start..])
}

pub fn octet_string(bytes: &[u8]) -> Vec<u8> {
    tlv(tag::OCTET_STRING, bytes)
}

pub fn object_id(oid: &Oid) -> Vec<u8> {
    tlv(tag::OBJECT_ID, &oid.encode_content())
}

pub fn sequence(content: &[u8]) -> Vec<u8> {
    tlv(tag::SEQUENCE, content)
}

fn unsigned_content(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes
        .iter()
        .take_while(|&&b| b == 0)
        .count()
        .min(bytes.len() - 1);
    let mut out = Vec::with_capacity(9);
    if bytes[skip] & 0x80 != 0 {
        out.push(0);
    }
    out.extend_from_slice(&bytes[skip..]);
    out
}

// ============================================================================
// Decoding
// ============================================================================

fn decode_integer(content: &[u8]) -> Result<i64, BerError> {
    let (&first, _) = content.split_first().ok_or(BerError::Truncated)?;
    if content.len() > 8 {
        return Err(BerError::IntegerOverflow);
    }
    let mut value: i64 = if first & 0x80 != 0 { -1 } else { 0 };
    for &byte in content {
        value = (value << 8) | i64::from(byte);
    }
    Ok(value)
}

fn decode_unsigned(content: &[u8]) -> Result<u64, BerError> {
    let content = match content {
        [0, rest @ ..] if !rest.is_empty() => rest,
        _ => content,
    };
    if content.is_empty() {
        return Err(BerError::Truncated);
    }
    if content.len() > 8 {
        return Err(BerError::IntegerOverflow);
    }
    Ok(content
        .iter()
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte)))
}

fn decode_u32(content: &[u8]) -> Result<u32, BerError> {
    u32::try_from(decode_unsigned(content)?).map_err(|_| BerError::IntegerOverflow)
}

/// Cursor over a run of BER elements.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The bytes not consumed yet.
    pub fn remaining(&self) -> &'a [u8] {
        self.data
    }

    pub fn peek_tag(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Reads one element and returns its tag and content.
    pub fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), BerError> {
        let (&tag, rest) = self.data.split_first().ok_or(BerError::Truncated)?;
        let (&first, mut rest) = rest.split_first().ok_or(BerError::Truncated)?;
        let len = if first & 0x80 == 0 {
            usize::from(first)
        } else {
            let count = usize::from(first & 0x7f);
            if count == 0 || count > 4 {
                return Err(BerError::BadLength);
            }
            if rest.len() < count {
                return Err(BerError::Truncated);
            }
            let len = rest[..count]
                .iter()
                .fold(0usize, |acc, &byte| (acc << 8) | usize::from(byte));
            rest = &rest[count..];
            len
        };
        if rest.len() < len {
            return Err(BerError::Truncated);
        }
        let (content, tail) = rest.split_at(len);
        self.data = tail;
        Ok((tag, content))
    }

    pub fn expect(&mut self, expected: u8) -> Result<&'a [u8], BerError> {
        let (found, content) = self.read_tlv()?;
        if found != expected {
            return Err(BerError::UnexpectedTag { expected, found });
        }
        Ok(content)
    }

    pub fn read_integer(&mut self) -> Result<i64, BerError> {
        decode_integer(self.expect(tag::INTEGER)?)
    }

    pub fn read_octets(&mut self) -> Result<&'a [u8], BerError> {
        self.expect(tag::OCTET_STRING)
    }

    pub fn read_oid(&mut self) -> Result<Oid, BerError> {
        Oid::decode_content(self.expect(tag::OBJECT_ID)?)
    }

    pub fn read_sequence(&mut self) -> Result<Reader<'a>, BerError> {
        Ok(Reader::new(self.expect(tag::SEQUENCE)?))
    }

    pub fn read_value(&mut self) -> Result<Value, BerError> {
        let (tag, content) = self.read_tlv()?;
        Value::decode(tag, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_uses_minimal_twos_complement() {
        assert_eq!(integer(0), vec![0x02, 0x01, 0x00]);
        assert_eq!(integer(127), vec![0x02, 0x01, 0x7f]);
        assert_eq!(integer(128), vec![0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer(256), vec![0x02, 0x02, 0x01, 0x00]);
        assert_eq!(integer(-1), vec![0x02, 0x01, 0xff]);
        assert_eq!(integer(-129), vec![0x02, 0x02, 0xff, 0x7f]);

        for v in [0, 1, -1, 18, 65507, -129, i64::from(i32::MAX), i64::MIN] {
            let encoded = integer(v);
            assert_eq!(Reader::new(&encoded).read_integer().unwrap(), v);
        }
    }

    #[test]
    fn long_form_length() {
        let content = vec![0xaa; 200];
        let encoded = octet_string(&content);
        assert_eq!(&encoded[..3], &[0x04, 0x81, 0xc8]);
        assert_eq!(header_len(200), 3);
        assert_eq!(header_len(300), 4);
        assert_eq!(Reader::new(&encoded).read_octets().unwrap(), &content[..]);
    }

    #[test]
    fn oid_encoding_matches_wire_format() {
        let oid: Oid = ".1.3.6.1.4.1.1991".parse().unwrap();
        assert_eq!(
            object_id(&oid),
            vec![0x06, 0x07, 0x2b, 0x06, 0x01, 0x04, 0x01, 0x8f, 0x47]
        );
        assert_eq!(oid.to_string(), ".1.3.6.1.4.1.1991");
        assert_eq!(Reader::new(&object_id(&oid)).read_oid().unwrap(), oid);
        assert_eq!("1.3.6".parse::<Oid>().unwrap().arcs(), &[1, 3, 6]);
        assert!("1.x.3".parse::<Oid>().is_err());
        assert!("7.1".parse::<Oid>().is_err());
    }

    #[test]
    fn decodes_application_types() {
        let mut encoded = Vec::new();
        encoded.extend(Value::Counter32(u32::MAX).encode());
        encoded.extend(Value::TimeTicks(12345).encode());
        encoded.extend(Value::IpAddress([10, 0, 0, 1]).encode());
        encoded.extend(Value::Counter64(u64::MAX).encode());
        encoded.extend(Value::NoSuchInstance.encode());

        let mut reader = Reader::new(&encoded);
        assert_eq!(reader.read_value().unwrap(), Value::Counter32(u32::MAX));
        assert_eq!(reader.read_value().unwrap(), Value::TimeTicks(12345));
        assert_eq!(reader.read_value().unwrap(), Value::IpAddress([10, 0, 0, 1]));
        assert_eq!(reader.read_value().unwrap(), Value::Counter64(u64::MAX));
        assert_eq!(reader.read_value().unwrap(), Value::NoSuchInstance);
        assert!(reader.is_empty());
    }

    #[test]
    fn rejects_truncated_input() {
        assert_eq!(Reader::new(&[0x04, 0x05, 0x01]).read_octets(), Err(BerError::Truncated));
        assert_eq!(Reader::new(&[0x02]).read_integer(), Err(BerError::Truncated));
        assert_eq!(
            Reader::new(&[0x04, 0x00]).read_integer(),
            Err(BerError::UnexpectedTag {
                expected: tag::INTEGER,
                found: tag::OCTET_STRING
            })
        );
    }
}
