pub mod config;
pub mod executor;
pub mod harvest;
pub mod model;
pub mod persist;
pub mod snmp;
pub mod store;
pub mod tftp;
pub mod traits;

// Re-export common types for convenience
pub use executor::*;
pub use model::*;
pub use traits::*;
