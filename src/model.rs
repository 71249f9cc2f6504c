use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Computes the transfer identifier for a device name.
///
/// Devices cap the TFTP filename length, so the hostname itself is never
/// sent. The lowercase hex MD5 of the name is used both as the filename in
/// the trigger command and as the key in the buffer store.
pub fn identifier(name: &str) -> String {
    hex::encode(Md5::digest(name.as_bytes()))
}

/// A network device addressed by hostname or IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Device(String);

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn identifier(&self) -> String {
        identifier(&self.0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Device {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Device {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Statistics about one harvest cycle.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct HarvestStats {
    /// Devices submitted to the dispatcher
    pub devices: usize,

    /// Devices whose trigger reached `Succeeded`
    pub succeeded: usize,

    /// Devices whose trigger reached `Failed`
    pub failed: usize,

    /// Files present in the final snapshot
    pub files_received: usize,

    /// Wall time of the whole cycle (milliseconds)
    pub duration_ms: u64,
}

/// Frozen result of one harvest cycle.
///
/// `files` is a copy of the buffer store taken after every listener was
/// asked to stop. Transfers that finish later never show up here.
#[derive(Debug, Default, Clone)]
pub struct HarvestResult {
    /// Received payloads keyed by [`identifier`]
    pub files: HashMap<String, Vec<u8>>,

    pub stats: HarvestStats,
}

impl HarvestResult {
    /// Returns the payload received for `device`, if any.
    pub fn get(&self, device: &Device) -> Option<&[u8]> {
        self.files.get(&device.identifier()).map(Vec::as_slice)
    }

    /// Maps payloads back to device names.
    ///
    /// Devices without a received file are left out; a missing file is not
    /// an error.
    pub fn reassociate(&self, devices: &[Device]) -> BTreeMap<String, Vec<u8>> {
        devices
            .iter()
            .filter_map(|d| self.get(d).map(|buf| (d.name().to_string(), buf.to_vec())))
            .collect()
    }

    /// Devices from `devices` that have no received file.
    pub fn missing<'a>(&self, devices: &'a [Device]) -> Vec<&'a Device> {
        devices.iter().filter(|d| self.get(d).is_none()).collect()
    }
}
