use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::domains::permission::Capability;
use crate::domains::settings::{MetricSetting, MetricState};
use crate::domains::sync::types::SyncKey;
use crate::errors::{DomainError, ServiceResult, ValidationError};

/// Side effects run when a metric is switched on, off, or re-pointed
#[async_trait]
pub trait ActivationHandler: Send + Sync {
    /// Arm workers for a freshly enabled metric
    async fn activate(&self, metric: &MetricDefinition, setting: &MetricSetting) -> ServiceResult<()>;

    /// Disarm workers of a metric that is no longer enabled
    async fn deactivate(&self, metric: &MetricDefinition) -> ServiceResult<()>;

    /// Run one immediate sync pass after a source change
    async fn resync(&self, metric: &MetricDefinition, setting: &MetricSetting) -> ServiceResult<()>;
}

/// Registry entry describing one metric
#[derive(Clone)]
pub struct MetricDefinition {
    pub name: String,
    /// Capabilities checked, in order, before enabling
    pub permissions: Vec<Capability>,
    /// Metrics that must all be enabled for this one to be enabled
    pub depends_on: BTreeSet<String>,
    pub sync_keys: Vec<SyncKey>,
    /// Switching to one of these sources triggers a one-off resync
    pub resync_sources: BTreeSet<String>,
    pub handler: Option<Arc<dyn ActivationHandler>>,
}

impl MetricDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            permissions: Vec::new(),
            depends_on: BTreeSet::new(),
            sync_keys: Vec::new(),
            resync_sources: BTreeSet::new(),
            handler: None,
        }
    }

    pub fn requires(mut self, capability: Capability) -> Self {
        self.permissions.push(capability);
        self
    }

    pub fn depends_on(mut self, metric: &str) -> Self {
        self.depends_on.insert(metric.to_string());
        self
    }

    pub fn syncs(mut self, key: SyncKey) -> Self {
        self.sync_keys.push(key);
        self
    }

    pub fn resync_on(mut self, source: &str) -> Self {
        self.resync_sources.insert(source.to_string());
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn ActivationHandler>) -> Self {
        self.handler = Some(handler);
        self
    }
}

impl fmt::Debug for MetricDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricDefinition")
            .field("name", &self.name)
            .field("permissions", &self.permissions)
            .field("depends_on", &self.depends_on)
            .field("sync_keys", &self.sync_keys)
            .field("resync_sources", &self.resync_sources)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Outcome of a toggle or source change, reported to the host UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ToggleResult {
    Success {
        setting: MetricSetting,
        /// Derived metrics switched off as a consequence
        #[serde(default)]
        cascaded: Vec<String>,
    },
    NeedsPermission {
        capability: Capability,
    },
    MissingDependencies {
        metrics: Vec<String>,
    },
    Error {
        message: String,
    },
}

impl ToggleResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ToggleResult::Success { .. })
    }
}

/// Who caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    User,
    Automatic,
}

impl TransitionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionCause::User => "user",
            TransitionCause::Automatic => "automatic",
        }
    }
}

impl FromStr for TransitionCause {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(TransitionCause::User),
            "automatic" => Ok(TransitionCause::Automatic),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid TransitionCause string: {}",
                s
            )))),
        }
    }
}

impl FromStr for MetricState {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disabled" => Ok(MetricState::Disabled),
            "permission_pending" => Ok(MetricState::PermissionPending),
            "enabled" => Ok(MetricState::Enabled),
            _ => Err(DomainError::Validation(ValidationError::custom(&format!(
                "Invalid MetricState string: {}",
                s
            )))),
        }
    }
}

/// One persisted state change of a metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricTransition {
    pub metric: String,
    pub from: MetricState,
    pub to: MetricState,
    pub cause: TransitionCause,
    pub detail: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl MetricTransition {
    pub fn user(metric: &str, from: MetricState, to: MetricState, now: DateTime<Utc>) -> Self {
        Self {
            metric: metric.to_string(),
            from,
            to,
            cause: TransitionCause::User,
            detail: None,
            occurred_at: now,
        }
    }

    pub fn automatic(metric: &str, detail: &str, now: DateTime<Utc>) -> Self {
        Self {
            metric: metric.to_string(),
            from: MetricState::Enabled,
            to: MetricState::Disabled,
            cause: TransitionCause::Automatic,
            detail: Some(detail.to_string()),
            occurred_at: now,
        }
    }
}
