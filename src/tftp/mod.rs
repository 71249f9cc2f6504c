//! TFTP receive side: packet codec, per-address listeners and the registry
//! that provisions them on demand.

pub mod listener;
pub mod packet;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use listener::{Listener, ListenerError, ListenerSettings, TransferError};
pub use packet::{ErrorCode, Mode, Packet, PacketError, Request};
pub use registry::ListenerRegistry;
