use crate::harvest::trigger::TriggerCommand;
use crate::model::Device;
use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no response after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("malformed message: {0}")]
    Decode(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("agent returned error-status {status} at index {index}")]
    ErrorStatus { status: i64, index: i64 },
    #[error("agent sent report {0}")]
    Report(String),
}

/// Opens control sessions to devices (SNMPv3 in production, mocks in tests).
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    type Session: TriggerSession;

    /// Opens an authenticated session to `device`.
    async fn connect(&self, device: &Device) -> Result<Self::Session, SessionError>;
}

/// One open control session to a device.
#[async_trait]
pub trait TriggerSession: Send {
    /// Local address the session uses to reach the device. The device pushes
    /// its file back to this address.
    fn local_addr(&self) -> IpAddr;

    /// Sends the five-field trigger command in one atomic set.
    async fn send_trigger(&mut self, command: &TriggerCommand) -> Result<(), SessionError>;

    /// Reads the load status. `Ok(None)` means the value was absent or not an
    /// integer.
    async fn load_status(&mut self) -> Result<Option<i64>, SessionError>;
}
