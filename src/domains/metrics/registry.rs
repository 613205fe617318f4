use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::domains::metrics::types::MetricDefinition;
use crate::domains::settings::MetricSetting;
use crate::domains::sync::types::SyncKey;
use crate::errors::ValidationError;

/// Metric name to definition. Adding a metric is a registration, not code.
#[derive(Clone, Default)]
pub struct MetricRegistry {
    metrics: HashMap<String, MetricDefinition>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: MetricDefinition) -> Result<(), ValidationError> {
        if definition.name.trim().is_empty() {
            return Err(ValidationError::required("metric.name"));
        }
        if definition.depends_on.contains(&definition.name) {
            return Err(ValidationError::invalid_value(
                "depends_on",
                &format!("{} cannot depend on itself", definition.name),
            ));
        }
        log::debug!("Registering metric {}", definition.name);
        self.metrics.insert(definition.name.clone(), definition);
        Ok(())
    }

    /// Check that every dependency names a registered metric and that the
    /// dependency graph has no cycles.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for definition in self.metrics.values() {
            for dep in &definition.depends_on {
                if !self.metrics.contains_key(dep) {
                    return Err(ValidationError::invalid_value(
                        "depends_on",
                        &format!("{} depends on unknown metric {}", definition.name, dep),
                    ));
                }
            }
        }
        for name in self.metrics.keys() {
            if self.transitive_dependents(name).contains(name) {
                return Err(ValidationError::invalid_value(
                    "depends_on",
                    &format!("dependency cycle through {}", name),
                ));
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&MetricDefinition> {
        self.metrics.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> impl Iterator<Item = &MetricDefinition> {
        self.metrics.values()
    }

    /// Metrics that list `metric` as a direct prerequisite
    pub fn dependents_of(&self, metric: &str) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .metrics
            .values()
            .filter(|d| d.depends_on.contains(metric))
            .map(|d| d.name.clone())
            .collect();
        dependents.sort();
        dependents
    }

    /// Every metric that directly or indirectly depends on `metric`
    pub fn transitive_dependents(&self, metric: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = self.dependents_of(metric).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents_of(&next));
            }
        }
        seen
    }

    /// Prerequisites of `metric` that are not enabled in `settings`
    pub fn unmet_dependencies(&self, metric: &str, settings: &HashMap<String, MetricSetting>) -> Vec<String> {
        self.get(metric)
            .map(|d| {
                d.depends_on
                    .iter()
                    .filter(|dep| !settings.get(*dep).map_or(false, |s| s.enabled))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Metrics whose sync workers read from `key`
    pub fn metrics_for_key(&self, key: &SyncKey) -> Vec<String> {
        let mut names: Vec<String> = self
            .metrics
            .values()
            .filter(|d| d.sync_keys.contains(key))
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names
    }

    /// A key is live while any metric reading it is enabled
    pub fn key_enabled(&self, key: &SyncKey, settings: &HashMap<String, MetricSetting>) -> bool {
        self.metrics_for_key(key)
            .iter()
            .any(|m| settings.get(m).map_or(false, |s| s.enabled))
    }

    pub fn all_sync_keys(&self) -> Vec<SyncKey> {
        let keys: BTreeSet<SyncKey> = self
            .metrics
            .values()
            .flat_map(|d| d.sync_keys.iter().cloned())
            .collect();
        keys.into_iter().collect()
    }
}
