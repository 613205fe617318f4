pub mod gate;
pub mod types;

pub use gate::{HostPermissionGate, PermissionGate};
pub use types::Capability;
