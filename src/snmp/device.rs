//! Foundry/Brocade config-upload binding over SNMPv3.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

use super::ber::{Oid, Value};
use super::client::{SnmpSession, SnmpSettings};
use super::message::VarBind;
use super::usm::{MasterKeys, UsmError};
use crate::harvest::trigger::TriggerCommand;
use crate::model::Device;
use crate::traits::{DeviceConnector, SessionError, TriggerSession};

const AGENT_GLOBAL: [u32; 11] = [1, 3, 6, 1, 4, 1, 1991, 1, 1, 2, 1];

/// `snAgGblPassword`: confirmation secret for write operations.
pub const GLOBAL_PASSWORD: u32 = 15;
/// `snAgCfgLoadAddrType`
pub const LOAD_ADDR_TYPE: u32 = 65;
/// `snAgCfgLoadAddr`
pub const LOAD_ADDR: u32 = 66;
/// `snAgCfgFname`
pub const CFG_FILENAME: u32 = 8;
/// `snAgCfgLoad`: action on set, progress on get.
pub const CFG_LOAD: u32 = 9;

/// `sysUpTime.0`: read once per session to prove the credentials.
const SYS_UP_TIME: [u32; 9] = [1, 3, 6, 1, 2, 1, 1, 3, 0];

/// Scalar under the agent global group, e.g. `agent_oid(CFG_LOAD)`.
pub fn agent_oid(leaf: u32) -> Oid {
    let mut arcs = AGENT_GLOBAL.to_vec();
    arcs.extend([leaf, 0]);
    Oid::from_slice(&arcs)
}

/// Opens SNMPv3 sessions to devices by name.
pub struct SnmpConnector {
    settings: Arc<SnmpSettings>,
    master: MasterKeys,
}

impl SnmpConnector {
    /// Derives the master keys once for every session this connector opens.
    pub fn new(settings: SnmpSettings) -> Result<Self, UsmError> {
        let master = MasterKeys::derive(
            settings.auth_protocol,
            &settings.auth_passphrase,
            &settings.priv_passphrase,
        )?;
        Ok(Self {
            settings: Arc::new(settings),
            master,
        })
    }

    pub fn settings(&self) -> &SnmpSettings {
        &self.settings
    }
}

#[async_trait]
impl DeviceConnector for SnmpConnector {
    type Session = SnmpSession;

    /// Discovery alone is unauthenticated, so the session is only handed
    /// out after one authenticated GET has come back.
    async fn connect(&self, device: &Device) -> Result<SnmpSession, SessionError> {
        let mut session =
            SnmpSession::open(device.name(), self.settings.clone(), &self.master).await?;
        session.get(&[Oid::from_slice(&SYS_UP_TIME)]).await?;
        debug!(device = %device, "SNMP credentials accepted");
        Ok(session)
    }
}

#[async_trait]
impl TriggerSession for SnmpSession {
    fn local_addr(&self) -> IpAddr {
        self.local_ip()
    }

    async fn send_trigger(&mut self, command: &TriggerCommand) -> Result<(), SessionError> {
        let varbinds = vec![
            VarBind::new(
                agent_oid(GLOBAL_PASSWORD),
                Value::OctetString(command.secret.as_bytes().to_vec()),
            ),
            VarBind::new(
                agent_oid(LOAD_ADDR_TYPE),
                Value::Integer(command.family.code()),
            ),
            VarBind::new(
                agent_oid(LOAD_ADDR),
                Value::OctetString(command.address.clone()),
            ),
            VarBind::new(
                agent_oid(CFG_FILENAME),
                Value::OctetString(command.filename.as_bytes().to_vec()),
            ),
            VarBind::new(agent_oid(CFG_LOAD), Value::Integer(command.action)),
        ];
        self.set(&varbinds).await?;
        debug!(filename = %command.filename, "Upload command accepted");
        Ok(())
    }

    async fn load_status(&mut self) -> Result<Option<i64>, SessionError> {
        let load = agent_oid(CFG_LOAD);
        let varbinds = self.get(std::slice::from_ref(&load)).await?;
        Ok(varbinds
            .into_iter()
            .find(|vb| vb.oid == load)
            .and_then(|vb| match vb.value {
                Value::Integer(code) => Some(code),
                _ => None,
            }))
    }
}
