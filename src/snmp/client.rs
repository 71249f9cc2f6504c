//! SNMPv3 authPriv client session over UDP.

use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use super::ber::{tag, BerError, Oid};
use super::message::{
    flags, Decoded, Message, MsgData, Pdu, ScopedPdu, SecurityParams, VarBind, MAX_MESSAGE_SIZE,
};
use super::usm::{AuthProtocol, LocalKeys, MasterKeys, PrivProtocol, UsmError, AUTH_PARAMS_LEN};
use crate::traits::SessionError;

/// `usmStats` subtree; reports carry one of its counters.
const USM_STATS: [u32; 9] = [1, 3, 6, 1, 6, 3, 15, 1, 1];

/// Connection settings shared by every session of a harvest.
#[derive(Debug, Clone)]
pub struct SnmpSettings {
    pub port: u16,
    pub username: String,
    pub auth_passphrase: String,
    pub priv_passphrase: String,
    pub auth_protocol: AuthProtocol,
    pub priv_protocol: PrivProtocol,
    pub timeout: Duration,
    /// Resends after the first attempt.
    pub retries: u32,
    /// Most OIDs sent in one get request.
    pub max_oids: usize,
}

impl Default for SnmpSettings {
    fn default() -> Self {
        Self {
            port: 161,
            username: String::new(),
            auth_passphrase: String::new(),
            priv_passphrase: String::new(),
            auth_protocol: AuthProtocol::Sha,
            priv_protocol: PrivProtocol::Aes,
            timeout: Duration::from_secs(5),
            retries: 2,
            max_oids: 60,
        }
    }
}

impl From<BerError> for SessionError {
    fn from(e: BerError) -> Self {
        SessionError::Decode(e.to_string())
    }
}

impl From<UsmError> for SessionError {
    fn from(e: UsmError) -> Self {
        SessionError::Authentication(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UsmReport {
    UnsupportedSecLevel,
    NotInTimeWindow,
    UnknownUserName,
    UnknownEngineId,
    WrongDigest,
    DecryptionError,
}

impl UsmReport {
    fn from_oid(oid: &Oid) -> Option<Self> {
        match oid.arcs() {
            [prefix @ .., counter, 0] if prefix == &USM_STATS[..] => match counter {
                1 => Some(Self::UnsupportedSecLevel),
                2 => Some(Self::NotInTimeWindow),
                3 => Some(Self::UnknownUserName),
                4 => Some(Self::UnknownEngineId),
                5 => Some(Self::WrongDigest),
                6 => Some(Self::DecryptionError),
                _ => None,
            },
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Self::UnsupportedSecLevel => "unsupported security level",
            Self::NotInTimeWindow => "not in time window",
            Self::UnknownUserName => "unknown user name",
            Self::UnknownEngineId => "unknown engine id",
            Self::WrongDigest => "wrong digest",
            Self::DecryptionError => "decryption error",
        }
    }
}

#[derive(Debug, Clone)]
struct Engine {
    id: Vec<u8>,
    boots: u32,
    time: u32,
    synced_at: Instant,
}

impl Engine {
    fn from_params(params: &SecurityParams) -> Self {
        Self {
            id: params.engine_id.clone(),
            boots: clamp(params.engine_boots),
            time: clamp(params.engine_time),
            synced_at: Instant::now(),
        }
    }

    /// The agent's clock as we estimate it now.
    fn time(&self) -> u32 {
        let elapsed = u32::try_from(self.synced_at.elapsed().as_secs()).unwrap_or(u32::MAX);
        self.time.saturating_add(elapsed)
    }
}

fn clamp(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// An authenticated, encrypted session with one agent.
pub struct SnmpSession {
    socket: UdpSocket,
    local: IpAddr,
    settings: Arc<SnmpSettings>,
    keys: LocalKeys,
    engine: Engine,
    msg_id: i64,
    request_id: i64,
    salt: u64,
}

impl SnmpSession {
    /// Resolves `host`, discovers the agent's engine and localizes keys.
    pub async fn open(
        host: &str,
        settings: Arc<SnmpSettings>,
        master: &MasterKeys,
    ) -> Result<Self, SessionError> {
        let (msg_id, request_id, salt) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(1..i64::from(i32::MAX)),
                rng.gen_range(1..i64::from(i32::MAX)),
                rng.gen::<u64>(),
            )
        };

        let target = lookup_host((host, settings.port))
            .await
            .map_err(|e| SessionError::Resolve(format!("{host}: {e}")))?
            .next()
            .ok_or_else(|| SessionError::Resolve(host.to_string()))?;
        let bind = match target {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        let local = socket.local_addr()?.ip();

        let engine = discover(&socket, &settings, msg_id, request_id).await?;
        let keys = master.localize(&engine.id)?;
        debug!(
            %target,
            engine_id = %hex::encode(&engine.id),
            boots = engine.boots,
            time = engine.time,
            "Discovered SNMP engine"
        );

        Ok(Self {
            socket,
            local,
            settings,
            keys,
            engine,
            msg_id,
            request_id,
            salt,
        })
    }

    /// Local address of the socket, as routed toward the agent.
    pub fn local_ip(&self) -> IpAddr {
        self.local
    }

    pub fn engine_id(&self) -> &[u8] {
        &self.engine.id
    }

    /// Reads `oids`, splitting into requests of at most `max_oids` each.
    pub async fn get(&mut self, oids: &[Oid]) -> Result<Vec<VarBind>, SessionError> {
        let mut out = Vec::with_capacity(oids.len());
        for chunk in oids.chunks(self.settings.max_oids.max(1)) {
            let varbinds: Vec<_> = chunk.iter().cloned().map(VarBind::null).collect();
            let pdu = self.request(tag::GET_REQUEST, &varbinds).await?;
            check_error_status(&pdu)?;
            out.extend(pdu.varbinds);
        }
        Ok(out)
    }

    /// Writes all `varbinds` in a single request.
    pub async fn set(&mut self, varbinds: &[VarBind]) -> Result<Vec<VarBind>, SessionError> {
        let pdu = self.request(tag::SET_REQUEST, varbinds).await?;
        check_error_status(&pdu)?;
        Ok(pdu.varbinds)
    }

    async fn request(&mut self, pdu_tag: u8, varbinds: &[VarBind]) -> Result<Pdu, SessionError> {
        let mut resynced = false;
        loop {
            let request_id = self.next_request_id();
            let msg_id = self.next_msg_id();
            let bytes = self.seal(msg_id, Pdu::request(pdu_tag, request_id, varbinds.to_vec()))?;
            let (decoded, raw) = exchange(&self.socket, &self.settings, &bytes, msg_id).await?;
            let pdu = self.open_reply(decoded, raw)?;

            if pdu.tag == tag::REPORT {
                let first = pdu.varbinds.first();
                match first.and_then(|vb| UsmReport::from_oid(&vb.oid)) {
                    Some(UsmReport::NotInTimeWindow) if !resynced => {
                        debug!("SNMP engine clock out of window, retrying");
                        resynced = true;
                        continue;
                    }
                    Some(
                        report @ (UsmReport::UnknownUserName
                        | UsmReport::WrongDigest
                        | UsmReport::DecryptionError
                        | UsmReport::UnsupportedSecLevel),
                    ) => return Err(SessionError::Authentication(report.describe().to_string())),
                    Some(report) => return Err(SessionError::Report(report.describe().to_string())),
                    None => {
                        return Err(SessionError::Report(
                            first.map_or_else(|| "without varbinds".to_string(), |vb| vb.oid.to_string()),
                        ))
                    }
                }
            }

            if pdu.request_id != request_id {
                return Err(SessionError::Decode(format!(
                    "response request-id {} does not match {}",
                    pdu.request_id, request_id
                )));
            }
            return Ok(pdu);
        }
    }

    fn seal(&mut self, msg_id: i64, pdu: Pdu) -> Result<Vec<u8>, SessionError> {
        let boots = self.engine.boots;
        let time = self.engine.time();
        let mut payload = ScopedPdu {
            context_engine_id: self.engine.id.clone(),
            context_name: Vec::new(),
            pdu,
        }
        .encode();
        let salt = self.next_salt();
        let priv_params = self.keys.encrypt(boots, time, salt, &mut payload)?;

        let message = Message {
            msg_id,
            max_size: MAX_MESSAGE_SIZE,
            flags: flags::AUTH | flags::PRIV | flags::REPORTABLE,
            security: SecurityParams {
                engine_id: self.engine.id.clone(),
                engine_boots: i64::from(boots),
                engine_time: i64::from(time),
                user_name: self.settings.username.as_bytes().to_vec(),
                auth_params: vec![0; AUTH_PARAMS_LEN],
                priv_params: priv_params.to_vec(),
            },
            data: MsgData::Encrypted(payload),
        };
        let (mut bytes, offset) = message.encode();
        let digest = self.keys.sign(&bytes)?;
        bytes[offset..offset + AUTH_PARAMS_LEN].copy_from_slice(&digest);
        Ok(bytes)
    }

    /// Authenticates and decrypts a reply. Authenticated replies also carry
    /// the agent's current clock, which we adopt.
    fn open_reply(&mut self, decoded: Decoded, mut raw: Vec<u8>) -> Result<Pdu, SessionError> {
        let Decoded {
            message,
            auth_offset,
        } = decoded;
        let security = &message.security;
        let authenticated = message.flags & flags::AUTH != 0;

        if authenticated {
            if security.engine_id != self.engine.id {
                return Err(SessionError::Authentication(
                    "reply from a different engine".to_string(),
                ));
            }
            let end = auth_offset + security.auth_params.len();
            raw[auth_offset..end].fill(0);
            self.keys.verify(&raw, &security.auth_params)?;
            self.engine = Engine::from_params(security);
        }

        let scoped = match message.data {
            MsgData::Plain(scoped) => scoped,
            MsgData::Encrypted(mut data) => {
                if !authenticated {
                    return Err(SessionError::Authentication(
                        "encrypted reply without authentication".to_string(),
                    ));
                }
                self.keys.decrypt(
                    clamp(security.engine_boots),
                    clamp(security.engine_time),
                    &security.priv_params,
                    &mut data,
                )?;
                ScopedPdu::decode(&data)?
            }
        };

        if !authenticated && scoped.pdu.tag != tag::REPORT {
            return Err(SessionError::Authentication(
                "unauthenticated response".to_string(),
            ));
        }
        Ok(scoped.pdu)
    }

    fn next_msg_id(&mut self) -> i64 {
        self.msg_id = self.msg_id % i64::from(i32::MAX) + 1;
        self.msg_id
    }

    fn next_request_id(&mut self) -> i64 {
        self.request_id = self.request_id % i64::from(i32::MAX) + 1;
        self.request_id
    }

    fn next_salt(&mut self) -> u64 {
        self.salt = self.salt.wrapping_add(1);
        self.salt
    }
}

fn check_error_status(pdu: &Pdu) -> Result<(), SessionError> {
    if pdu.error_status != 0 {
        return Err(SessionError::ErrorStatus {
            status: pdu.error_status,
            index: pdu.error_index,
        });
    }
    Ok(())
}

/// Learns the agent's engine id, boots and time from an unauthenticated
/// probe (RFC 3414 section 4).
async fn discover(
    socket: &UdpSocket,
    settings: &SnmpSettings,
    msg_id: i64,
    request_id: i64,
) -> Result<Engine, SessionError> {
    let probe = Message {
        msg_id,
        max_size: MAX_MESSAGE_SIZE,
        flags: flags::REPORTABLE,
        security: SecurityParams::default(),
        data: MsgData::Plain(ScopedPdu {
            context_engine_id: Vec::new(),
            context_name: Vec::new(),
            pdu: Pdu::request(tag::GET_REQUEST, request_id, Vec::new()),
        }),
    };
    let (bytes, _) = probe.encode();
    let (decoded, _) = exchange(socket, settings, &bytes, msg_id).await?;

    let engine = Engine::from_params(&decoded.message.security);
    if engine.id.is_empty() {
        return Err(SessionError::Decode(
            "agent did not report an engine id".to_string(),
        ));
    }
    Ok(engine)
}

/// Sends `request` and waits for the reply carrying `msg_id`, resending on
/// timeout. Datagrams for other message ids are dropped.
async fn exchange(
    socket: &UdpSocket,
    settings: &SnmpSettings,
    request: &[u8],
    msg_id: i64,
) -> Result<(Decoded, Vec<u8>), SessionError> {
    let attempts = settings.retries + 1;
    let mut buf = vec![0u8; 65536];
    for attempt in 1..=attempts {
        socket.send(request).await?;
        let deadline = Instant::now() + settings.timeout;
        loop {
            let len = match timeout_at(deadline, socket.recv(&mut buf)).await {
                Ok(result) => result?,
                Err(_) => break,
            };
            let raw = buf[..len].to_vec();
            match Message::decode(&raw) {
                Ok(decoded) if decoded.message.msg_id == msg_id => return Ok((decoded, raw)),
                Ok(decoded) => trace!(
                    expected = msg_id,
                    received = decoded.message.msg_id,
                    "Ignoring stale SNMP reply"
                ),
                Err(e) => debug!(error = %e, "Ignoring undecodable SNMP datagram"),
            }
        }
        debug!(attempt, attempts, "SNMP request timed out");
    }
    Err(SessionError::Timeout { attempts })
}
