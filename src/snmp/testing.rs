//! In-process SNMPv3 agent for tests. Speaks authPriv with a single user
//! and answers from a value table.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::UdpSocket;

use super::ber::{tag, Oid, Value};
use super::message::{
    flags, Decoded, Message, MsgData, Pdu, ScopedPdu, SecurityParams, VarBind, MAX_MESSAGE_SIZE,
};
use super::usm::{AuthProtocol, LocalKeys, MasterKeys, AUTH_PARAMS_LEN};

const NOT_IN_TIME_WINDOW: u32 = 2;
const UNKNOWN_ENGINE_ID: u32 = 4;
const WRONG_DIGEST: u32 = 5;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub username: String,
    pub auth_passphrase: String,
    pub priv_passphrase: String,
    pub auth_protocol: AuthProtocol,
    pub engine_id: Vec<u8>,
    pub boots: i64,
    pub time: i64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            username: "harvester".to_string(),
            auth_passphrase: "authpassphrase".to_string(),
            priv_passphrase: "privpassphrase".to_string(),
            auth_protocol: AuthProtocol::Sha,
            engine_id: vec![0x80, 0x00, 0x07, 0xc7, 0x03, 0x00, 0xe0, 0x52, 0x11, 0x22, 0x33],
            boots: 4,
            time: 4242,
        }
    }
}

#[derive(Default)]
struct AgentState {
    values: HashMap<Oid, Value>,
    scripts: HashMap<Oid, VecDeque<Value>>,
    sets: Vec<Vec<VarBind>>,
    requests: usize,
    set_error: i64,
    time_window_rejections: usize,
}

pub struct FakeAgent {
    addr: SocketAddr,
    config: Arc<AgentConfig>,
    state: Arc<Mutex<AgentState>>,
}

impl FakeAgent {
    pub async fn start(config: AgentConfig) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let keys = MasterKeys::derive(
            config.auth_protocol,
            &config.auth_passphrase,
            &config.priv_passphrase,
        )
        .unwrap()
        .localize(&config.engine_id)
        .unwrap();
        let config = Arc::new(config);
        let state = Arc::new(Mutex::new(AgentState::default()));
        tokio::spawn(serve(socket, keys, config.clone(), state.clone()));
        Self {
            addr,
            config,
            state,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn set_value(&self, oid: Oid, value: Value) {
        lock(&self.state).values.insert(oid, value);
    }

    /// Successive gets of `oid` return `values` in order; the last one sticks.
    pub fn script(&self, oid: Oid, values: Vec<Value>) {
        lock(&self.state).scripts.insert(oid, values.into());
    }

    /// Varbind lists of every accepted set.
    pub fn sets(&self) -> Vec<Vec<VarBind>> {
        lock(&self.state).sets.clone()
    }

    /// Authenticated requests answered with a response PDU.
    pub fn requests(&self) -> usize {
        lock(&self.state).requests
    }

    pub fn fail_sets(&self, status: i64) {
        lock(&self.state).set_error = status;
    }

    /// Answers the next `count` authenticated requests with a
    /// not-in-time-window report.
    pub fn reject_time_window(&self, count: usize) {
        lock(&self.state).time_window_rejections = count;
    }
}

fn lock(state: &Mutex<AgentState>) -> MutexGuard<'_, AgentState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn serve(
    socket: UdpSocket,
    keys: LocalKeys,
    config: Arc<AgentConfig>,
    state: Arc<Mutex<AgentState>>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let raw = buf[..len].to_vec();
        let Ok(decoded) = Message::decode(&raw) else {
            continue;
        };
        if let Some(reply) = handle(&keys, &config, &state, decoded, raw) {
            let _ = socket.send_to(&reply, peer).await;
        }
    }
}

fn handle(
    keys: &LocalKeys,
    config: &AgentConfig,
    state: &Mutex<AgentState>,
    decoded: Decoded,
    mut raw: Vec<u8>,
) -> Option<Vec<u8>> {
    let Decoded {
        message,
        auth_offset,
    } = decoded;
    let msg_id = message.msg_id;

    if message.flags & flags::AUTH == 0 {
        let request_id = match &message.data {
            MsgData::Plain(scoped) => scoped.pdu.request_id,
            MsgData::Encrypted(_) => 0,
        };
        return Some(report(config, None, msg_id, request_id, UNKNOWN_ENGINE_ID));
    }

    let security = &message.security;
    let end = auth_offset + security.auth_params.len();
    raw[auth_offset..end].fill(0);
    if security.user_name != config.username.as_bytes()
        || keys.verify(&raw, &security.auth_params).is_err()
    {
        return Some(report(config, None, msg_id, 0, WRONG_DIGEST));
    }

    let MsgData::Encrypted(mut data) = message.data else {
        return None;
    };
    keys.decrypt(
        security.engine_boots as u32,
        security.engine_time as u32,
        &security.priv_params,
        &mut data,
    )
    .ok()?;
    let request = ScopedPdu::decode(&data).ok()?.pdu;

    let mut guard = lock(state);
    let state = &mut *guard;
    if state.time_window_rejections > 0 {
        state.time_window_rejections -= 1;
        return Some(report(
            config,
            Some(keys),
            msg_id,
            request.request_id,
            NOT_IN_TIME_WINDOW,
        ));
    }
    state.requests += 1;

    let mut response = Pdu::request(tag::RESPONSE, request.request_id, Vec::new());
    match request.tag {
        tag::SET_REQUEST => {
            if state.set_error != 0 {
                response.error_status = state.set_error;
                response.error_index = 1;
            } else {
                state.sets.push(request.varbinds.clone());
                for varbind in &request.varbinds {
                    state
                        .values
                        .insert(varbind.oid.clone(), varbind.value.clone());
                }
            }
            response.varbinds = request.varbinds;
        }
        _ => {
            for varbind in request.varbinds {
                let scripted = state.scripts.get_mut(&varbind.oid).and_then(|queue| {
                    if queue.len() > 1 {
                        queue.pop_front()
                    } else {
                        queue.front().cloned()
                    }
                });
                let value = scripted
                    .or_else(|| state.values.get(&varbind.oid).cloned())
                    .unwrap_or(Value::NoSuchInstance);
                response.varbinds.push(VarBind::new(varbind.oid, value));
            }
        }
    }
    drop(guard);

    Some(encrypted(config, keys, msg_id, response))
}

fn security(config: &AgentConfig, authenticated: bool) -> SecurityParams {
    SecurityParams {
        engine_id: config.engine_id.clone(),
        engine_boots: config.boots,
        engine_time: config.time,
        user_name: config.username.as_bytes().to_vec(),
        auth_params: if authenticated {
            vec![0; AUTH_PARAMS_LEN]
        } else {
            Vec::new()
        },
        priv_params: Vec::new(),
    }
}

fn sign(keys: Option<&LocalKeys>, message: &Message) -> Vec<u8> {
    let (mut bytes, offset) = message.encode();
    if let Some(keys) = keys {
        let digest = keys.sign(&bytes).unwrap();
        bytes[offset..offset + AUTH_PARAMS_LEN].copy_from_slice(&digest);
    }
    bytes
}

fn report(
    config: &AgentConfig,
    keys: Option<&LocalKeys>,
    msg_id: i64,
    request_id: i64,
    counter: u32,
) -> Vec<u8> {
    let oid = Oid::from_slice(&[1, 3, 6, 1, 6, 3, 15, 1, 1, counter, 0]);
    let pdu = Pdu::request(
        tag::REPORT,
        request_id,
        vec![VarBind::new(oid, Value::Counter32(1))],
    );
    let message = Message {
        msg_id,
        max_size: MAX_MESSAGE_SIZE,
        flags: if keys.is_some() { flags::AUTH } else { 0 },
        security: security(config, keys.is_some()),
        data: MsgData::Plain(ScopedPdu {
            context_engine_id: config.engine_id.clone(),
            context_name: Vec::new(),
            pdu,
        }),
    };
    sign(keys, &message)
}

fn encrypted(config: &AgentConfig, keys: &LocalKeys, msg_id: i64, pdu: Pdu) -> Vec<u8> {
    let mut payload = ScopedPdu {
        context_engine_id: config.engine_id.clone(),
        context_name: Vec::new(),
        pdu,
    }
    .encode();
    let salt = keys
        .encrypt(
            config.boots as u32,
            config.time as u32,
            rand::random(),
            &mut payload,
        )
        .unwrap();
    let mut security = security(config, true);
    security.priv_params = salt.to_vec();
    let message = Message {
        msg_id,
        max_size: MAX_MESSAGE_SIZE,
        flags: flags::AUTH | flags::PRIV,
        security,
        data: MsgData::Encrypted(payload),
    };
    sign(Some(keys), &message)
}
