//! Per-device trigger state machine.
//!
//! A trigger walks one device through
//! `Connecting → Commanding → Polling → {Succeeded | Failed}`:
//! open a session, make sure a TFTP listener exists on the local address the
//! session uses, tell the device to upload its running config there, then
//! poll the load status until the device reports a terminal value.
//!
//! The state machine never touches the buffer store. The pushed file arrives
//! asynchronously through the listener.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::model::Device;
use crate::tftp::ListenerRegistry;
use crate::traits::{DeviceConnector, SessionError, TriggerSession};

/// Load action asking the device to upload its running config to a TFTP
/// server.
pub const CFG_LOAD_RUNNING_CONFIG_UPLOAD: i64 = 22;

// ============================================================================
// Trigger Command
// ============================================================================

/// Address family tag of the receiver address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4 = 1,
    Ipv6 = 2,
}

impl AddressFamily {
    pub fn code(self) -> i64 {
        self as i64
    }
}

/// The five values written to a device in one set request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerCommand {
    /// Confirmation secret expected by the agent
    pub secret: String,

    pub family: AddressFamily,

    /// Raw receiver address, 4 or 16 bytes depending on `family`
    pub address: Vec<u8>,

    /// Filename the device uploads as
    pub filename: String,

    pub action: i64,
}

impl TriggerCommand {
    /// Builds the upload command for a receiver listening on `receiver`.
    ///
    /// IPv4-mapped IPv6 addresses are sent as plain IPv4.
    pub fn upload(secret: impl Into<String>, receiver: IpAddr, filename: impl Into<String>) -> Self {
        let (family, address) = match receiver {
            IpAddr::V4(v4) => (AddressFamily::Ipv4, v4.octets().to_vec()),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => (AddressFamily::Ipv4, v4.octets().to_vec()),
                None => (AddressFamily::Ipv6, v6.octets().to_vec()),
            },
        };
        Self {
            secret: secret.into(),
            family,
            address,
            filename: filename.into(),
            action: CFG_LOAD_RUNNING_CONFIG_UPLOAD,
        }
    }
}

// ============================================================================
// Load Status
// ============================================================================

/// Load status values reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Normal = 1,
    FlashPrepareReadFailure = 2,
    FlashReadError = 3,
    FlashPrepareWriteFailure = 4,
    FlashWriteError = 5,
    TftpTimeoutError = 6,
    TftpOutOfBufferSpace = 7,
    TftpBusy = 8,
    TftpRemoteOtherErrors = 9,
    TftpRemoteNoFile = 10,
    TftpRemoteBadAccess = 11,
    TftpRemoteDiskFull = 12,
    TftpRemoteBadOperation = 13,
    TftpRemoteBadId = 14,
    TftpRemoteFileExists = 15,
    TftpRemoteNoUser = 16,
    OperationError = 17,
    Loading = 18,
}

impl LoadStatus {
    const ALL: [LoadStatus; 18] = [
        LoadStatus::Normal,
        LoadStatus::FlashPrepareReadFailure,
        LoadStatus::FlashReadError,
        LoadStatus::FlashPrepareWriteFailure,
        LoadStatus::FlashWriteError,
        LoadStatus::TftpTimeoutError,
        LoadStatus::TftpOutOfBufferSpace,
        LoadStatus::TftpBusy,
        LoadStatus::TftpRemoteOtherErrors,
        LoadStatus::TftpRemoteNoFile,
        LoadStatus::TftpRemoteBadAccess,
        LoadStatus::TftpRemoteDiskFull,
        LoadStatus::TftpRemoteBadOperation,
        LoadStatus::TftpRemoteBadId,
        LoadStatus::TftpRemoteFileExists,
        LoadStatus::TftpRemoteNoUser,
        LoadStatus::OperationError,
        LoadStatus::Loading,
    ];

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    fn description(self) -> &'static str {
        match self {
            LoadStatus::Normal => "normal",
            LoadStatus::FlashPrepareReadFailure => "flash prepare read failure",
            LoadStatus::FlashReadError => "flash read error",
            LoadStatus::FlashPrepareWriteFailure => "flash prepare write failure",
            LoadStatus::FlashWriteError => "flash write error",
            LoadStatus::TftpTimeoutError => "tftp timeout",
            LoadStatus::TftpOutOfBufferSpace => "tftp out of buffer space",
            LoadStatus::TftpBusy => "tftp busy",
            LoadStatus::TftpRemoteOtherErrors => "tftp remote error",
            LoadStatus::TftpRemoteNoFile => "tftp remote no file",
            LoadStatus::TftpRemoteBadAccess => "tftp remote bad access",
            LoadStatus::TftpRemoteDiskFull => "tftp remote disk full",
            LoadStatus::TftpRemoteBadOperation => "tftp remote bad operation",
            LoadStatus::TftpRemoteBadId => "tftp remote bad id",
            LoadStatus::TftpRemoteFileExists => "tftp remote file exists",
            LoadStatus::TftpRemoteNoUser => "tftp remote no user",
            LoadStatus::OperationError => "operation error",
            LoadStatus::Loading => "loading",
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.description())
    }
}

/// Non-terminal or successful poll result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Done,
    Loading,
}

/// Classifies one polled status value.
///
/// Every defined failure code becomes [`TriggerError::DeviceStatus`]; an
/// absent or undefined value becomes [`TriggerError::StatusNotReturned`].
pub fn classify(code: Option<i64>) -> Result<Progress, TriggerError> {
    match code.and_then(LoadStatus::from_code) {
        Some(LoadStatus::Normal) => Ok(Progress::Done),
        Some(LoadStatus::Loading) => Ok(Progress::Loading),
        Some(status) => Err(TriggerError::DeviceStatus(status)),
        None => Err(TriggerError::StatusNotReturned),
    }
}

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    Connecting,
    Commanding,
    Polling,
    Succeeded,
    Failed,
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerState::Connecting => "connecting",
            TriggerState::Commanding => "commanding",
            TriggerState::Polling => "polling",
            TriggerState::Succeeded => "succeeded",
            TriggerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a trigger ended in `Failed`.
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("connection error: {0}")]
    Connect(#[source] SessionError),

    #[error("command rejected: {0}")]
    CommandRejected(#[source] SessionError),

    #[error("status check error: {0}")]
    StatusCheck(#[source] SessionError),

    #[error("status not returned")]
    StatusNotReturned,

    #[error("device reported status {0}")]
    DeviceStatus(LoadStatus),

    #[error("still loading after {polls} status checks")]
    PollLimit { polls: u32 },
}

#[derive(Debug, Clone)]
pub struct TriggerSettings {
    /// Delay before each status check (default: 1 second)
    pub poll_interval: Duration,

    /// Upper bound on status checks; `None` polls until a terminal status
    pub max_polls: Option<u32>,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_polls: Some(600),
        }
    }
}

/// Drives the trigger state machine for single devices.
///
/// Shared by all dispatch workers; holds no per-device state.
pub struct Trigger<C: DeviceConnector> {
    connector: Arc<C>,
    listeners: Arc<ListenerRegistry>,
    secret: Arc<str>,
    settings: TriggerSettings,
}

impl<C: DeviceConnector> Trigger<C> {
    pub fn new(
        connector: Arc<C>,
        listeners: Arc<ListenerRegistry>,
        secret: Arc<str>,
        settings: TriggerSettings,
    ) -> Self {
        Self {
            connector,
            listeners,
            secret,
            settings,
        }
    }

    /// Runs the state machine to a terminal state.
    ///
    /// `Ok(())` means the device reported a completed upload. It does not
    /// mean the file has reached the buffer store yet.
    #[instrument(skip(self, device), fields(device = %device))]
    pub async fn run(&self, device: &Device) -> Result<(), TriggerError> {
        let result = self.drive(device).await;
        let state = if result.is_ok() {
            TriggerState::Succeeded
        } else {
            TriggerState::Failed
        };
        debug!(%state, "Trigger finished");
        result
    }

    async fn drive(&self, device: &Device) -> Result<(), TriggerError> {
        debug!(state = %TriggerState::Connecting, "Trigger state");
        let mut session = self
            .connector
            .connect(device)
            .await
            .map_err(TriggerError::Connect)?;

        let local = session.local_addr();
        self.listeners.ensure_listener(local);

        debug!(state = %TriggerState::Commanding, receiver = %local, "Trigger state");
        let command = TriggerCommand::upload(&*self.secret, local, device.identifier());
        session
            .send_trigger(&command)
            .await
            .map_err(TriggerError::CommandRejected)?;

        debug!(state = %TriggerState::Polling, "Trigger state");
        let mut polls = 0u32;
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            polls += 1;

            let code = session
                .load_status()
                .await
                .map_err(TriggerError::StatusCheck)?;
            match classify(code)? {
                Progress::Done => return Ok(()),
                Progress::Loading => {
                    if let Some(max) = self.settings.max_polls {
                        if polls >= max {
                            return Err(TriggerError::PollLimit { polls });
                        }
                    }
                }
            }
        }
    }
}
