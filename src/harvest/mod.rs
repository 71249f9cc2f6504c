//! Harvest module - per-device trigger state machine and the coordinator
//! that runs one cycle over all devices.
//!
//! - **Trigger**: [`Trigger`] drives one device from connect to a terminal
//!   load status
//! - **Coordinator**: [`HarvestCoordinator`] wires dispatcher, listeners and
//!   buffer store together for a cycle

pub mod coordinator;
pub mod trigger;

pub use coordinator::{HarvestCoordinator, HarvestSettings};
pub use trigger::{
    classify, AddressFamily, LoadStatus, Progress, Trigger, TriggerCommand, TriggerError,
    TriggerSettings, TriggerState,
};
