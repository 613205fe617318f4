use chrono::Utc;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domains::metrics::registry::MetricRegistry;
use crate::domains::metrics::repository::TransitionRepository;
use crate::domains::metrics::types::{MetricDefinition, MetricTransition, ToggleResult};
use crate::domains::permission::PermissionGate;
use crate::domains::settings::{MetricSetting, MetricSettingsStore, MetricState};
use crate::errors::{ServiceError, ServiceResult};

/// Toggles parked at a permission prompt, with the source they asked for
type PendingToggles = HashMap<String, Option<String>>;

/// Governs enable, disable and source changes of metrics. All operations are
/// serialized so cascades never interleave with another toggle.
pub struct MetricToggleCoordinator {
    registry: Arc<MetricRegistry>,
    settings: Arc<dyn MetricSettingsStore>,
    permissions: Arc<dyn PermissionGate>,
    transitions: Arc<dyn TransitionRepository>,
    pending: Mutex<PendingToggles>,
}

impl MetricToggleCoordinator {
    pub fn new(
        registry: Arc<MetricRegistry>,
        settings: Arc<dyn MetricSettingsStore>,
        permissions: Arc<dyn PermissionGate>,
        transitions: Arc<dyn TransitionRepository>,
    ) -> Self {
        Self {
            registry,
            settings,
            permissions,
            transitions,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    fn definition(&self, metric: &str) -> Result<&MetricDefinition, ToggleResult> {
        self.registry.get(metric).ok_or_else(|| ToggleResult::Error {
            message: ServiceError::UnknownMetric(metric.to_string()).to_string(),
        })
    }

    async fn log_transition(&self, transition: MetricTransition) {
        if let Err(e) = self.transitions.record(&transition).await {
            warn!("Failed to record transition of {}: {}", transition.metric, e);
        }
    }

    pub async fn toggle_on(&self, metric: &str, preferred_source: Option<String>) -> ToggleResult {
        let mut pending = self.pending.lock().await;
        self.toggle_on_locked(&mut pending, metric, preferred_source).await
    }

    async fn toggle_on_locked(
        &self,
        pending: &mut PendingToggles,
        metric: &str,
        preferred_source: Option<String>,
    ) -> ToggleResult {
        let definition = match self.definition(metric) {
            Ok(d) => d,
            Err(result) => return result,
        };
        let settings = match self.settings.get_all().await {
            Ok(s) => s,
            Err(e) => return ToggleResult::Error { message: e.to_string() },
        };
        let current = settings
            .get(metric)
            .cloned()
            .unwrap_or_else(|| MetricSetting::disabled(metric));

        let unmet = self.registry.unmet_dependencies(metric, &settings);
        if !unmet.is_empty() {
            debug!("{} cannot be enabled; prerequisites off: {:?}", metric, unmet);
            return ToggleResult::MissingDependencies { metrics: unmet };
        }

        if let Some(capability) = self.permissions.first_missing(&definition.permissions).await {
            info!("{} waiting for permission {}", metric, capability);
            let was_pending = pending.insert(metric.to_string(), preferred_source).is_some();
            if !was_pending && !current.enabled {
                self.log_transition(MetricTransition::user(
                    metric,
                    MetricState::Disabled,
                    MetricState::PermissionPending,
                    Utc::now(),
                ))
                .await;
            }
            return ToggleResult::NeedsPermission { capability };
        }
        let was_pending = pending.remove(metric).is_some();

        let now = Utc::now();
        let mut updated = current.with_enabled(true, now);
        if preferred_source.is_some() {
            updated.preferred_source = preferred_source;
        }
        if let Err(e) = updated.validate() {
            return ToggleResult::Error { message: e.to_string() };
        }
        if let Err(e) = self.settings.put(&updated).await {
            error!("Failed to persist {} as enabled: {}", metric, e);
            return ToggleResult::Error { message: e.to_string() };
        }

        if let Some(handler) = &definition.handler {
            if let Err(e) = handler.activate(definition, &updated).await {
                error!("Activation of {} failed, reverting: {}", metric, e);
                if let Err(revert) = self.settings.put(&current).await {
                    error!("Failed to revert {} after activation failure: {}", metric, revert);
                }
                return ToggleResult::Error { message: e.to_string() };
            }
        }

        if !current.enabled {
            let from = if was_pending { MetricState::PermissionPending } else { MetricState::Disabled };
            self.log_transition(MetricTransition::user(metric, from, MetricState::Enabled, now)).await;
        }
        info!("{} enabled", metric);
        ToggleResult::Success { setting: updated, cascaded: Vec::new() }
    }

    pub async fn toggle_off(&self, metric: &str) -> ToggleResult {
        let mut pending = self.pending.lock().await;
        let definition = match self.definition(metric) {
            Ok(d) => d,
            Err(result) => return result,
        };
        let settings = match self.settings.get_all().await {
            Ok(s) => s,
            Err(e) => return ToggleResult::Error { message: e.to_string() },
        };
        let was_pending = pending.remove(metric).is_some();
        let now = Utc::now();

        let current = settings
            .get(metric)
            .cloned()
            .unwrap_or_else(|| MetricSetting::disabled(metric));
        let updated = current.with_enabled(false, now);

        let cascaded: Vec<MetricSetting> = self
            .registry
            .transitive_dependents(metric)
            .into_iter()
            .filter_map(|name| settings.get(&name).filter(|s| s.enabled).cloned())
            .map(|s| s.with_enabled(false, now))
            .collect();

        let mut writes = Vec::with_capacity(cascaded.len() + 1);
        writes.push(updated.clone());
        writes.extend(cascaded.iter().cloned());
        if let Err(e) = self.settings.put_many(&writes).await {
            error!("Failed to persist {} as disabled: {}", metric, e);
            return ToggleResult::Error { message: e.to_string() };
        }

        self.deactivate(definition).await;
        if current.enabled || was_pending {
            let from = if current.enabled { MetricState::Enabled } else { MetricState::PermissionPending };
            self.log_transition(MetricTransition::user(metric, from, MetricState::Disabled, now)).await;
        }

        let mut cascaded_names = Vec::with_capacity(cascaded.len());
        for setting in &cascaded {
            info!("{} disabled automatically: prerequisite {} disabled", setting.metric, metric);
            if let Some(dependent) = self.registry.get(&setting.metric) {
                self.deactivate(dependent).await;
            }
            self.log_transition(MetricTransition::automatic(
                &setting.metric,
                &format!("prerequisite {} disabled", metric),
                now,
            ))
            .await;
            cascaded_names.push(setting.metric.clone());
        }

        info!("{} disabled", metric);
        ToggleResult::Success { setting: updated, cascaded: cascaded_names }
    }

    async fn deactivate(&self, definition: &MetricDefinition) {
        if let Some(handler) = &definition.handler {
            if let Err(e) = handler.deactivate(definition).await {
                warn!("Deactivation of {} failed: {}", definition.name, e);
            }
        }
    }

    /// Point a metric at another source without touching its enabled flag.
    /// `current_enabled` is the caller's view; the stored flag wins.
    pub async fn change_source(
        &self,
        metric: &str,
        new_source: Option<String>,
        current_enabled: bool,
    ) -> ToggleResult {
        let _pending = self.pending.lock().await;
        let definition = match self.definition(metric) {
            Ok(d) => d,
            Err(result) => return result,
        };
        let current = match self.settings.get(metric).await {
            Ok(s) => s,
            Err(e) => return ToggleResult::Error { message: e.to_string() },
        };
        if current.enabled != current_enabled {
            warn!(
                "Source change for {} assumed enabled={}, stored value is {}",
                metric, current_enabled, current.enabled
            );
        }

        let changed = current.preferred_source != new_source;
        let mut updated = current.clone();
        updated.preferred_source = new_source;
        updated.updated_at = Some(Utc::now());
        if let Err(e) = updated.validate() {
            return ToggleResult::Error { message: e.to_string() };
        }
        if let Err(e) = self.settings.put(&updated).await {
            error!("Failed to persist source change for {}: {}", metric, e);
            return ToggleResult::Error { message: e.to_string() };
        }

        let needs_resync = updated.enabled
            && changed
            && updated
                .preferred_source
                .as_ref()
                .map_or(false, |s| definition.resync_sources.contains(s));
        if needs_resync {
            if let Some(handler) = &definition.handler {
                info!("{} switched to {:?}; running one resync", metric, updated.preferred_source);
                if let Err(e) = handler.resync(definition, &updated).await {
                    warn!("Resync of {} after source change failed: {}", metric, e);
                }
            }
        }

        ToggleResult::Success { setting: updated, cascaded: Vec::new() }
    }

    /// Host callback after a permission prompt
    pub async fn on_permission_result(&self, metric: &str, granted: bool) -> ToggleResult {
        let mut pending = self.pending.lock().await;
        let Some(preferred_source) = pending.get(metric).cloned() else {
            return ToggleResult::Error { message: format!("No toggle of {} is waiting for permission", metric) };
        };

        if granted {
            return self.toggle_on_locked(&mut pending, metric, preferred_source).await;
        }

        pending.remove(metric);
        self.log_transition(MetricTransition::user(
            metric,
            MetricState::PermissionPending,
            MetricState::Disabled,
            Utc::now(),
        ))
        .await;

        let required = self.registry.get(metric).map(|d| d.permissions.clone()).unwrap_or_default();
        match self.permissions.first_missing(&required).await.or_else(|| required.first().cloned()) {
            Some(capability) => ToggleResult::NeedsPermission { capability },
            None => ToggleResult::Error { message: format!("Permission for {} denied", metric) },
        }
    }

    /// Force off every enabled metric whose prerequisites are not all enabled.
    /// Returns the metrics that were switched off.
    pub async fn reconcile(&self) -> ServiceResult<Vec<String>> {
        let _pending = self.pending.lock().await;
        let stored = self.settings.get_all().await?;
        let mut working = stored.clone();
        let mut disabled: Vec<String> = Vec::new();
        let now = Utc::now();

        loop {
            let mut changed = false;
            for definition in self.registry.definitions() {
                let enabled = working.get(&definition.name).map_or(false, |s| s.enabled);
                if !enabled || self.registry.unmet_dependencies(&definition.name, &working).is_empty() {
                    continue;
                }
                if let Some(setting) = working.get_mut(&definition.name) {
                    *setting = setting.with_enabled(false, now);
                    disabled.push(definition.name.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        if disabled.is_empty() {
            return Ok(disabled);
        }
        disabled.sort();
        let writes: Vec<MetricSetting> = disabled.iter().filter_map(|m| working.get(m).cloned()).collect();
        self.settings.put_many(&writes).await?;

        for metric in &disabled {
            let unmet = self.registry.unmet_dependencies(metric, &working);
            info!("{} disabled automatically: unmet dependencies {:?}", metric, unmet);
            if let Some(definition) = self.registry.get(metric) {
                self.deactivate(definition).await;
            }
            self.log_transition(MetricTransition::automatic(
                metric,
                &format!("unmet dependencies: {}", unmet.join(",")),
                now,
            ))
            .await;
        }
        Ok(disabled)
    }

    pub async fn metric_state(&self, metric: &str) -> ServiceResult<MetricState> {
        if self.pending.lock().await.contains_key(metric) {
            return Ok(MetricState::PermissionPending);
        }
        let setting = self.settings.get(metric).await?;
        Ok(if setting.enabled { MetricState::Enabled } else { MetricState::Disabled })
    }

    /// Current setting of every registered metric, defaults included
    pub async fn settings_snapshot(&self) -> ServiceResult<HashMap<String, MetricSetting>> {
        let mut snapshot = self.settings.get_all().await?;
        for name in self.registry.names() {
            snapshot
                .entry(name.clone())
                .or_insert_with(|| MetricSetting::disabled(&name));
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::metrics::repository::SqliteTransitionRepository;
    use crate::domains::metrics::types::TransitionCause;
    use crate::domains::permission::{Capability, HostPermissionGate};
    use crate::test_support::{memory_pool, InMemorySettingsStore, RecordingHandler};

    struct Fixture {
        coordinator: MetricToggleCoordinator,
        settings: Arc<InMemorySettingsStore>,
        gate: Arc<HostPermissionGate>,
        handler: Arc<RecordingHandler>,
        transitions: Arc<SqliteTransitionRepository>,
    }

    async fn fixture() -> Fixture {
        let handler = Arc::new(RecordingHandler::new());
        let mut registry = MetricRegistry::new();
        registry.register(MetricDefinition::new("a").with_handler(handler.clone())).unwrap();
        registry.register(MetricDefinition::new("b").with_handler(handler.clone())).unwrap();
        registry
            .register(
                MetricDefinition::new("d")
                    .depends_on("a")
                    .depends_on("b")
                    .with_handler(handler.clone()),
            )
            .unwrap();
        registry
            .register(
                MetricDefinition::new("gps")
                    .requires(Capability::Location)
                    .requires(Capability::BackgroundLocation)
                    .with_handler(handler.clone()),
            )
            .unwrap();
        registry
            .register(
                MetricDefinition::new("steps")
                    .resync_on("fitbit")
                    .with_handler(handler.clone()),
            )
            .unwrap();
        registry.validate().unwrap();

        let settings = Arc::new(InMemorySettingsStore::new());
        let gate = Arc::new(HostPermissionGate::new());
        let transitions = Arc::new(SqliteTransitionRepository::new(memory_pool().await));
        let coordinator = MetricToggleCoordinator::new(
            Arc::new(registry),
            settings.clone(),
            gate.clone(),
            transitions.clone(),
        );
        Fixture { coordinator, settings, gate, handler, transitions }
    }

    async fn enabled(f: &Fixture, metric: &str) -> bool {
        f.settings.get(metric).await.unwrap().enabled
    }

    #[tokio::test]
    async fn test_disabling_prerequisite_cascades_to_derived_metric() {
        let f = fixture().await;
        for metric in ["a", "b", "d"] {
            assert!(f.coordinator.toggle_on(metric, None).await.is_success());
        }

        let result = f.coordinator.toggle_off("a").await;
        match result {
            ToggleResult::Success { setting, cascaded } => {
                assert!(!setting.enabled);
                assert_eq!(cascaded, vec!["d".to_string()]);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!enabled(&f, "a").await);
        assert!(enabled(&f, "b").await);
        assert!(!enabled(&f, "d").await);
        assert_eq!(f.handler.deactivated(), vec!["a", "d"]);

        let log = f.transitions.find_by_metric("d", 1).await.unwrap();
        assert_eq!(log[0].cause, TransitionCause::Automatic);
    }

    #[tokio::test]
    async fn test_derived_metric_needs_prerequisites() {
        let f = fixture().await;
        f.coordinator.toggle_on("a", None).await;

        let result = f.coordinator.toggle_on("d", None).await;
        assert_eq!(result, ToggleResult::MissingDependencies { metrics: vec!["b".to_string()] });
        assert!(!enabled(&f, "d").await);
    }

    #[tokio::test]
    async fn test_missing_permission_leaves_metric_disabled() {
        let f = fixture().await;
        f.gate.set_status(Capability::Location, true).await;

        let result = f.coordinator.toggle_on("gps", Some("device".into())).await;
        assert_eq!(result, ToggleResult::NeedsPermission { capability: Capability::BackgroundLocation });
        assert!(!enabled(&f, "gps").await);
        assert!(f.handler.activated().is_empty());
        assert_eq!(f.coordinator.metric_state("gps").await.unwrap(), MetricState::PermissionPending);

        f.gate.set_status(Capability::BackgroundLocation, true).await;
        let result = f.coordinator.on_permission_result("gps", true).await;
        assert!(result.is_success());
        let setting = f.settings.get("gps").await.unwrap();
        assert!(setting.enabled);
        assert_eq!(setting.preferred_source.as_deref(), Some("device"));
        assert_eq!(f.coordinator.metric_state("gps").await.unwrap(), MetricState::Enabled);
    }

    #[tokio::test]
    async fn test_denied_permission_returns_to_disabled() {
        let f = fixture().await;
        f.coordinator.toggle_on("gps", None).await;

        let result = f.coordinator.on_permission_result("gps", false).await;
        assert_eq!(result, ToggleResult::NeedsPermission { capability: Capability::Location });
        assert_eq!(f.coordinator.metric_state("gps").await.unwrap(), MetricState::Disabled);
        assert!(matches!(
            f.coordinator.on_permission_result("gps", true).await,
            ToggleResult::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_source_change_triggers_exactly_one_resync() {
        let f = fixture().await;
        f.coordinator.toggle_on("steps", Some("health_connect".into())).await;

        let result = f.coordinator.change_source("steps", Some("fitbit".into()), true).await;
        assert!(result.is_success());
        assert_eq!(f.handler.resyncs(), 1);
        assert!(enabled(&f, "steps").await);

        // Same source again, then a source that does not need a resync
        f.coordinator.change_source("steps", Some("fitbit".into()), true).await;
        f.coordinator.change_source("steps", Some("health_connect".into()), true).await;
        assert_eq!(f.handler.resyncs(), 1);
    }

    #[tokio::test]
    async fn test_source_change_on_disabled_metric_does_not_enable_it() {
        let f = fixture().await;
        let result = f.coordinator.change_source("steps", Some("fitbit".into()), false).await;
        assert!(result.is_success());
        assert_eq!(f.handler.resyncs(), 0);
        let setting = f.settings.get("steps").await.unwrap();
        assert!(!setting.enabled);
        assert_eq!(setting.preferred_source.as_deref(), Some("fitbit"));
    }

    #[tokio::test]
    async fn test_disallowed_source_is_rejected_without_write() {
        let f = fixture().await;
        let mut steps = MetricSetting::disabled("steps");
        steps.allowed_sources = ["health_connect".to_string()].into_iter().collect();
        f.settings.put(&steps).await.unwrap();

        let result = f.coordinator.change_source("steps", Some("fitbit".into()), false).await;
        assert!(matches!(result, ToggleResult::Error { .. }));
        assert_eq!(f.settings.get("steps").await.unwrap(), steps);
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces_as_error() {
        let f = fixture().await;
        f.settings.set_failing(true);

        let result = f.coordinator.toggle_on("a", None).await;
        assert!(matches!(result, ToggleResult::Error { .. }));
        f.settings.set_failing(false);
        assert!(!enabled(&f, "a").await);
        assert!(f.handler.activated().is_empty());
    }

    #[tokio::test]
    async fn test_activation_failure_reverts_setting() {
        let f = fixture().await;
        f.handler.fail_activation(true);

        let result = f.coordinator.toggle_on("a", None).await;
        assert!(matches!(result, ToggleResult::Error { .. }));
        assert!(!enabled(&f, "a").await);
    }

    #[tokio::test]
    async fn test_reconcile_disables_metrics_with_broken_dependencies() {
        let f = fixture().await;
        // A remote edit left d enabled while b is off
        let mut a = MetricSetting::disabled("a");
        a.enabled = true;
        let mut d = MetricSetting::disabled("d");
        d.enabled = true;
        f.settings.put_many(&[a, d]).await.unwrap();

        assert_eq!(f.coordinator.reconcile().await.unwrap(), vec!["d".to_string()]);
        assert!(!enabled(&f, "d").await);
        assert!(enabled(&f, "a").await);
        assert!(f.coordinator.reconcile().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_metric_is_an_error() {
        let f = fixture().await;
        assert!(matches!(f.coordinator.toggle_on("nope", None).await, ToggleResult::Error { .. }));
        assert!(matches!(f.coordinator.toggle_off("nope").await, ToggleResult::Error { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_includes_unconfigured_metrics() {
        let f = fixture().await;
        f.coordinator.toggle_on("a", None).await;
        let snapshot = f.coordinator.settings_snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 5);
        assert!(snapshot["a"].enabled);
        assert!(!snapshot["gps"].enabled);
    }
}
