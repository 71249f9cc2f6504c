//! SNMPv3 message framing (RFC 3412) with USM security parameters.

use super::ber::{self, tag, BerError, Oid, Reader, Value};

pub const SNMP_VERSION_3: i64 = 3;
pub const USM_SECURITY_MODEL: i64 = 3;
pub const MAX_MESSAGE_SIZE: i64 = 65507;

pub mod flags {
    pub const AUTH: u8 = 0x01;
    pub const PRIV: u8 = 0x02;
    pub const REPORTABLE: u8 = 0x04;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarBind {
    pub oid: Oid,
    pub value: Value,
}

impl VarBind {
    pub fn new(oid: Oid, value: Value) -> Self {
        Self { oid, value }
    }

    pub fn null(oid: Oid) -> Self {
        Self::new(oid, Value::Null)
    }

    fn encode(&self) -> Vec<u8> {
        let mut content = ber::object_id(&self.oid);
        content.extend(self.value.encode());
        ber::sequence(&content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub tag: u8,
    pub request_id: i64,
    pub error_status: i64,
    pub error_index: i64,
    pub varbinds: Vec<VarBind>,
}

impl Pdu {
    pub fn request(tag: u8, request_id: i64, varbinds: Vec<VarBind>) -> Self {
        Self {
            tag,
            request_id,
            error_status: 0,
            error_index: 0,
            varbinds,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut list = Vec::new();
        for varbind in &self.varbinds {
            list.extend(varbind.encode());
        }
        let mut content = ber::integer(self.request_id);
        content.extend(ber::integer(self.error_status));
        content.extend(ber::integer(self.error_index));
        content.extend(ber::sequence(&list));
        ber::tlv(self.tag, &content)
    }

    fn decode(reader: &mut Reader<'_>) -> Result<Self, BerError> {
        let (pdu_tag, content) = reader.read_tlv()?;
        if !(tag::GET_REQUEST..=tag::REPORT).contains(&pdu_tag) {
            return Err(BerError::UnexpectedTag {
                expected: tag::RESPONSE,
                found: pdu_tag,
            });
        }
        let mut body = Reader::new(content);
        let request_id = body.read_integer()?;
        let error_status = body.read_integer()?;
        let error_index = body.read_integer()?;
        let mut list = body.read_sequence()?;
        let mut varbinds = Vec::new();
        while !list.is_empty() {
            let mut item = list.read_sequence()?;
            let oid = item.read_oid()?;
            let value = item.read_value()?;
            varbinds.push(VarBind { oid, value });
        }
        Ok(Self {
            tag: pdu_tag,
            request_id,
            error_status,
            error_index,
            varbinds,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedPdu {
    pub context_engine_id: Vec<u8>,
    pub context_name: Vec<u8>,
    pub pdu: Pdu,
}

impl ScopedPdu {
    pub fn encode(&self) -> Vec<u8> {
        let mut content = ber::octet_string(&self.context_engine_id);
        content.extend(ber::octet_string(&self.context_name));
        content.extend(self.pdu.encode());
        ber::sequence(&content)
    }

    /// Decodes a scoped PDU. Trailing bytes are ignored, which covers the
    /// cipher padding some agents leave after decryption.
    pub fn decode(data: &[u8]) -> Result<Self, BerError> {
        let mut seq = Reader::new(data).read_sequence()?;
        let context_engine_id = seq.read_octets()?.to_vec();
        let context_name = seq.read_octets()?.to_vec();
        let pdu = Pdu::decode(&mut seq)?;
        Ok(Self {
            context_engine_id,
            context_name,
            pdu,
        })
    }
}

/// `UsmSecurityParameters` from RFC 3414.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityParams {
    pub engine_id: Vec<u8>,
    pub engine_boots: i64,
    pub engine_time: i64,
    pub user_name: Vec<u8>,
    pub auth_params: Vec<u8>,
    pub priv_params: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgData {
    Plain(ScopedPdu),
    Encrypted(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_id: i64,
    pub max_size: i64,
    pub flags: u8,
    pub security: SecurityParams,
    pub data: MsgData,
}

/// A decoded message plus where its authentication parameters sit in the
/// raw datagram, so the digest can be checked over the original bytes.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub message: Message,
    pub auth_offset: usize,
}

impl Message {
    /// Encodes the message and returns the offset of the authentication
    /// parameter bytes within the output.
    pub fn encode(&self) -> (Vec<u8>, usize) {
        let version = ber::integer(SNMP_VERSION_3);

        let mut header = ber::integer(self.msg_id);
        header.extend(ber::integer(self.max_size));
        header.extend(ber::octet_string(&[self.flags]));
        header.extend(ber::integer(USM_SECURITY_MODEL));
        let header = ber::sequence(&header);

        let sec = &self.security;
        let mut prefix = ber::octet_string(&sec.engine_id);
        prefix.extend(ber::integer(sec.engine_boots));
        prefix.extend(ber::integer(sec.engine_time));
        prefix.extend(ber::octet_string(&sec.user_name));
        let mut sec_content = prefix.clone();
        sec_content.extend(ber::octet_string(&sec.auth_params));
        sec_content.extend(ber::octet_string(&sec.priv_params));
        let sec_seq = ber::sequence(&sec_content);
        let sec_octets = ber::octet_string(&sec_seq);

        let data = match &self.data {
            MsgData::Plain(scoped) => scoped.encode(),
            MsgData::Encrypted(bytes) => ber::octet_string(bytes),
        };

        let mut body = version;
        body.extend(header);
        let sec_start = body.len();
        body.extend(sec_octets);
        body.extend(data);

        let auth_offset = ber::header_len(body.len())
            + sec_start
            + ber::header_len(sec_seq.len())
            + ber::header_len(sec_content.len())
            + prefix.len()
            + ber::header_len(sec.auth_params.len());
        (ber::sequence(&body), auth_offset)
    }

    pub fn decode(data: &[u8]) -> Result<Decoded, BerError> {
        let mut msg = Reader::new(data).read_sequence()?;
        let version = msg.read_integer()?;
        if version != SNMP_VERSION_3 {
            return Err(BerError::Unsupported(format!("SNMP version {version}")));
        }

        let mut header = msg.read_sequence()?;
        let msg_id = header.read_integer()?;
        let max_size = header.read_integer()?;
        let flags = header.read_octets()?.first().copied().unwrap_or(0);
        let model = header.read_integer()?;
        if model != USM_SECURITY_MODEL {
            return Err(BerError::Unsupported(format!("security model {model}")));
        }

        let mut sec = Reader::new(msg.read_octets()?).read_sequence()?;
        let engine_id = sec.read_octets()?.to_vec();
        let engine_boots = sec.read_integer()?;
        let engine_time = sec.read_integer()?;
        let user_name = sec.read_octets()?.to_vec();
        let auth = sec.read_octets()?;
        let auth_offset = auth.as_ptr() as usize - data.as_ptr() as usize;
        let auth_params = auth.to_vec();
        let priv_params = sec.read_octets()?.to_vec();

        let payload = match msg.peek_tag() {
            Some(tag::OCTET_STRING) => MsgData::Encrypted(msg.read_octets()?.to_vec()),
            _ => MsgData::Plain(ScopedPdu::decode(msg.remaining())?),
        };

        Ok(Decoded {
            message: Message {
                msg_id,
                max_size,
                flags,
                security: SecurityParams {
                    engine_id,
                    engine_boots,
                    engine_time,
                    user_name,
                    auth_params,
                    priv_params,
                },
                data: payload,
            },
            auth_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(data: MsgData) -> Message {
        Message {
            msg_id: 4242,
            max_size: MAX_MESSAGE_SIZE,
            flags: flags::AUTH | flags::PRIV | flags::REPORTABLE,
            security: SecurityParams {
                engine_id: vec![0x80, 0x00, 0x1f, 0x88, 0x04],
                engine_boots: 3,
                engine_time: 1200,
                user_name: b"harvester".to_vec(),
                auth_params: vec![0; 12],
                priv_params: vec![1, 2, 3, 4, 5, 6, 7, 8],
            },
            data,
        }
    }

    #[test]
    fn auth_offset_points_at_placeholder() {
        let message = sample(MsgData::Encrypted(vec![0xee; 300]));
        let (bytes, offset) = message.encode();
        assert_eq!(&bytes[offset..offset + 12], &[0u8; 12]);

        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.auth_offset, offset);
        assert_eq!(decoded.message, message);
    }

    #[test]
    fn plain_scoped_pdu_survives_decode() {
        let oid: Oid = ".1.3.6.1.4.1.1991.1.1.2.1.9.0".parse().unwrap();
        let pdu = Pdu {
            tag: tag::RESPONSE,
            request_id: 77,
            error_status: 0,
            error_index: 0,
            varbinds: vec![VarBind::new(oid, Value::Integer(18))],
        };
        let message = sample(MsgData::Plain(ScopedPdu {
            context_engine_id: vec![0x80],
            context_name: Vec::new(),
            pdu,
        }));
        let (bytes, _) = message.encode();
        assert_eq!(Message::decode(&bytes).unwrap().message, message);
    }

    #[test]
    fn scoped_pdu_ignores_trailing_padding() {
        let scoped = ScopedPdu {
            context_engine_id: vec![1],
            context_name: Vec::new(),
            pdu: Pdu::request(tag::GET_REQUEST, 9, Vec::new()),
        };
        let mut bytes = scoped.encode();
        bytes.extend([0u8; 5]);
        assert_eq!(ScopedPdu::decode(&bytes).unwrap(), scoped);
    }

    #[test]
    fn rejects_other_versions() {
        let mut body = ber::integer(1);
        body.extend(ber::octet_string(b"public"));
        let bytes = ber::sequence(&body);
        assert!(matches!(
            Message::decode(&bytes),
            Err(BerError::Unsupported(_))
        ));
    }
}
