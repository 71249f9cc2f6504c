//! TFTP packet codec (RFC 1350, option extension per RFC 2347).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// RFC 1350 default block size.
pub const DEFAULT_BLOCK_SIZE: usize = 512;
/// RFC 2348 block size bounds.
pub const MIN_BLOCK_SIZE: usize = 8;
pub const MAX_BLOCK_SIZE: usize = 65464;
/// Largest DATA packet: max block plus the 4 byte header.
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    Truncated(usize),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),
    #[error("string field is not NUL terminated")]
    Unterminated,
    #[error("string field is not valid UTF-8")]
    InvalidText,
    #[error("unsupported transfer mode {0:?}")]
    UnsupportedMode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl TryFrom<u16> for Opcode {
    type Error = PacketError;

    fn try_from(value: u16) -> Result<Self, PacketError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            other => Err(PacketError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
    OptionNegotiation = 8,
}

impl ErrorCode {
    fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiation,
            _ => ErrorCode::NotDefined,
        }
    }
}

/// Transfer mode. `mail` is obsolete and rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Netascii,
    Octet,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Netascii => "netascii",
            Mode::Octet => "octet",
        }
    }

    fn parse(s: &str) -> Result<Self, PacketError> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(Mode::Netascii),
            "octet" => Ok(Mode::Octet),
            _ => Err(PacketError::UnsupportedMode(s.to_string())),
        }
    }
}

/// Body of a read or write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub mode: Mode,
    /// Requested options, names lowercased
    pub options: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq(Request),
    Wrq(Request),
    Data { block: u16, payload: Bytes },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    Oack { options: Vec<(String, String)> },
}

impl Packet {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Rrq(_) => Opcode::Rrq,
            Packet::Wrq(_) => Opcode::Wrq,
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack { .. } => Opcode::Oack,
        }
    }

    pub fn parse(packet: &[u8]) -> Result<Self, PacketError> {
        let mut buf = packet;
        if buf.len() < 2 {
            return Err(PacketError::Truncated(packet.len()));
        }
        let opcode = Opcode::try_from(buf.get_u16())?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let filename = read_string(&mut buf)?;
                let mode = Mode::parse(&read_string(&mut buf)?)?;
                let options = read_options(&mut buf)?;
                let request = Request {
                    filename,
                    mode,
                    options,
                };
                Ok(if opcode == Opcode::Rrq {
                    Packet::Rrq(request)
                } else {
                    Packet::Wrq(request)
                })
            }
            Opcode::Data => {
                if buf.len() < 2 {
                    return Err(PacketError::Truncated(packet.len()));
                }
                let block = buf.get_u16();
                Ok(Packet::Data {
                    block,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            Opcode::Ack => {
                if buf.len() < 2 {
                    return Err(PacketError::Truncated(packet.len()));
                }
                Ok(Packet::Ack {
                    block: buf.get_u16(),
                })
            }
            Opcode::Error => {
                if buf.len() < 2 {
                    return Err(PacketError::Truncated(packet.len()));
                }
                let code = ErrorCode::from_u16(buf.get_u16());
                // Some clients omit the trailing NUL.
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                let message = String::from_utf8_lossy(&buf[..end]).into_owned();
                Ok(Packet::Error { code, message })
            }
            Opcode::Oack => Ok(Packet::Oack {
                options: read_options(&mut buf)?,
            }),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(32);
        out.put_u16(self.opcode() as u16);
        match self {
            Packet::Rrq(request) | Packet::Wrq(request) => {
                put_string(&mut out, &request.filename);
                put_string(&mut out, request.mode.as_str());
                put_options(&mut out, &request.options);
            }
            Packet::Data { block, payload } => {
                out.put_u16(*block);
                out.put_slice(payload);
            }
            Packet::Ack { block } => out.put_u16(*block),
            Packet::Error { code, message } => {
                out.put_u16(*code as u16);
                put_string(&mut out, message);
            }
            Packet::Oack { options } => put_options(&mut out, options),
        }
        out.freeze()
    }
}

fn read_string(buf: &mut &[u8]) -> Result<String, PacketError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::Unterminated)?;
    let text = std::str::from_utf8(&buf[..end])
        .map_err(|_| PacketError::InvalidText)?
        .to_string();
    buf.advance(end + 1);
    Ok(text)
}

fn read_options(buf: &mut &[u8]) -> Result<Vec<(String, String)>, PacketError> {
    let mut options = Vec::new();
    while buf.has_remaining() {
        let name = read_string(buf)?.to_ascii_lowercase();
        let value = read_string(buf)?;
        options.push((name, value));
    }
    Ok(options)
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn put_options(out: &mut BytesMut, options: &[(String, String)]) {
    for (name, value) in options {
        put_string(out, name);
        put_string(out, value);
    }
}
