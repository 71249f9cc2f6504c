//! SNMPv3 control channel: BER codec, USM security, the client session and
//! the device binding that carries the upload trigger.

pub mod ber;
pub mod client;
pub mod device;
pub mod message;
pub mod usm;

#[cfg(test)]
pub(crate) mod testing;

pub use ber::{BerError, Oid, Value};
pub use client::{SnmpSession, SnmpSettings};
pub use device::SnmpConnector;
pub use message::VarBind;
pub use usm::{AuthProtocol, PrivProtocol, UsmError};
