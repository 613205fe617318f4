use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domains::permission::types::Capability;

/// Answers whether the OS currently grants a capability
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn is_granted(&self, capability: &Capability) -> bool;

    /// First capability in `required` that is not granted
    async fn first_missing(&self, required: &[Capability]) -> Option<Capability> {
        for capability in required {
            if !self.is_granted(capability).await {
                return Some(capability.clone());
            }
        }
        None
    }
}

/// Grant table pushed by the host app whenever the OS reports a change.
/// Capabilities never reported read as not granted.
#[derive(Default)]
pub struct HostPermissionGate {
    grants: RwLock<HashMap<Capability, bool>>,
}

impl HostPermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_status(&self, capability: Capability, granted: bool) {
        log::debug!("Permission {} is now {}", capability, if granted { "granted" } else { "denied" });
        self.grants.write().await.insert(capability, granted);
    }
}

#[async_trait]
impl PermissionGate for HostPermissionGate {
    async fn is_granted(&self, capability: &Capability) -> bool {
        self.grants.read().await.get(capability).copied().unwrap_or(false)
    }
}
