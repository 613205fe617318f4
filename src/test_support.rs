//! In-process fakes shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::db_migration::run_migrations;
use crate::domains::metrics::{ActivationHandler, MetricDefinition};
use crate::domains::provider::HealthProvider;
use crate::domains::remote::{RemoteFilter, RemoteStore};
use crate::domains::scheduler::{
    BackgroundTask, ExistingTaskPolicy, TaskOutcome, TaskRequest, TaskScheduler, TaskState,
};
use crate::domains::settings::{MetricSetting, MetricSettingsStore};
use crate::domains::sync::types::{BackfillWindow, ChangesPage, ProviderRecord};
use crate::errors::{
    DomainError, DomainResult, ProviderError, ProviderResult, RemoteError, RemoteResult, ServiceError,
    ServiceResult,
};

/// Single-connection in-memory database with migrations applied
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

pub async fn file_pool(url: &str) -> SqlitePool {
    let options = SqliteConnectOptions::from_str(url).unwrap().create_if_missing(true);
    let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await.unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

pub fn record_at(id: &str, at: DateTime<Utc>) -> ProviderRecord {
    ProviderRecord {
        record_id: id.to_string(),
        record_type: "steps".to_string(),
        source: None,
        start_time: at,
        end_time: None,
        logical_date: None,
        value: json!({ "count": 1 }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// Scripted provider. Polls consume the queued responses in order; once the
/// queue is drained a poll returns an empty final page for the same token.
pub struct FakeProvider {
    id: String,
    records: Vec<ProviderRecord>,
    responses: Mutex<VecDeque<ProviderResult<ChangesPage>>>,
    polled: Mutex<Vec<String>>,
    tokens_issued: AtomicUsize,
    permission_revoked: AtomicBool,
}

impl FakeProvider {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            records: Vec::new(),
            responses: Mutex::new(VecDeque::new()),
            polled: Mutex::new(Vec::new()),
            tokens_issued: AtomicUsize::new(0),
            permission_revoked: AtomicBool::new(false),
        }
    }

    pub fn with_records(mut self, records: Vec<ProviderRecord>) -> Self {
        self.records = records;
        self
    }

    pub fn push_page(&self, page: ChangesPage) {
        lock(&self.responses).push_back(Ok(page));
    }

    pub fn push_error(&self, error: ProviderError) {
        lock(&self.responses).push_back(Err(error));
    }

    pub fn set_permission_revoked(&self, revoked: bool) {
        self.permission_revoked.store(revoked, Ordering::SeqCst);
    }

    pub fn polled_tokens(&self) -> Vec<String> {
        lock(&self.polled).clone()
    }

    fn check_permission(&self) -> ProviderResult<()> {
        if self.permission_revoked.load(Ordering::SeqCst) {
            return Err(ProviderError::PermissionRevoked("health data read".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthProvider for FakeProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    async fn read_backfill(&self, _record_type: &str, _window: &BackfillWindow) -> ProviderResult<Vec<ProviderRecord>> {
        self.check_permission()?;
        Ok(self.records.clone())
    }

    async fn get_resumption_token(&self, _record_type: &str) -> ProviderResult<String> {
        self.check_permission()?;
        let n = self.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("token-{}", n))
    }

    async fn poll_changes(&self, token: &str) -> ProviderResult<ChangesPage> {
        self.check_permission()?;
        lock(&self.polled).push(token.to_string());
        match lock(&self.responses).pop_front() {
            Some(response) => response,
            None => Ok(ChangesPage {
                changes: Vec::new(),
                next_token: token.to_string(),
                has_more: false,
                token_expired: false,
            }),
        }
    }
}

/// Remote store holding rows in memory, merged on the conflict key
#[derive(Default)]
pub struct FakeRemoteStore {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    failing_records: Mutex<Vec<String>>,
    transport_down: AtomicBool,
}

impl FakeRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        lock(&self.tables).get(table).cloned().unwrap_or_default()
    }

    /// Upserts carrying this provider record id are rejected
    pub fn fail_record(&self, provider_record_id: &str) {
        lock(&self.failing_records).push(provider_record_id.to_string());
    }

    pub fn set_transport_down(&self, down: bool) {
        self.transport_down.store(down, Ordering::SeqCst);
    }

    fn check_transport(&self) -> RemoteResult<()> {
        if self.transport_down.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FakeRemoteStore {
    async fn upsert(&self, table: &str, rows: &[Value], conflict_key: &[&str]) -> RemoteResult<()> {
        self.check_transport()?;
        let failing = lock(&self.failing_records).clone();
        if let Some(row) = rows
            .iter()
            .find(|row| row["provider_record_id"].as_str().map_or(false, |id| failing.iter().any(|f| f == id)))
        {
            return Err(RemoteError::Rejected {
                status: 400,
                message: format!("rejected row {}", row["provider_record_id"]),
            });
        }

        let mut tables = lock(&self.tables);
        let existing = tables.entry(table.to_string()).or_default();
        for row in rows {
            let same_key = |other: &Value| conflict_key.iter().all(|column| other[*column] == row[*column]);
            match existing.iter_mut().find(|other| same_key(other)) {
                Some(slot) => *slot = row.clone(),
                None => existing.push(row.clone()),
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &RemoteFilter) -> RemoteResult<usize> {
        self.check_transport()?;
        let mut tables = lock(&self.tables);
        let Some(existing) = tables.get_mut(table) else {
            return Ok(0);
        };
        let before = existing.len();
        existing.retain(|row| !filter.matches(row));
        Ok(before - existing.len())
    }

    async fn read(&self, table: &str, filter: &RemoteFilter) -> RemoteResult<Vec<Value>> {
        self.check_transport()?;
        Ok(self.rows(table).into_iter().filter(|row| filter.matches(row)).collect())
    }
}

/// Task table standing in for the platform scheduler
#[derive(Default)]
pub struct FakeTaskScheduler {
    tasks: Mutex<HashMap<String, TaskRequest>>,
    enqueues: Mutex<HashMap<String, usize>>,
}

impl FakeTaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a task present without counting an enqueue
    pub fn insert_enqueued(&self, name: &str) {
        lock(&self.tasks).insert(name.to_string(), TaskRequest::one_shot(name, std::time::Duration::ZERO, NoopTask::arc()));
    }

    /// Simulate the platform silently dropping a task
    pub fn drop_task(&self, name: &str) {
        lock(&self.tasks).remove(name);
    }

    pub fn enqueue_count(&self, name: &str) -> usize {
        lock(&self.enqueues).get(name).copied().unwrap_or(0)
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.tasks).keys().cloned().collect();
        names.sort();
        names
    }

    /// Run the body of a scheduled task once, as the platform would
    pub async fn run(&self, name: &str) -> Option<TaskOutcome> {
        let task = lock(&self.tasks).get(name).map(|request| request.task.clone())?;
        Some(task.run().await)
    }
}

#[async_trait]
impl TaskScheduler for FakeTaskScheduler {
    async fn task_state(&self, name: &str) -> TaskState {
        if lock(&self.tasks).contains_key(name) {
            TaskState::Enqueued
        } else {
            TaskState::Absent
        }
    }

    async fn ensure_scheduled(&self, request: TaskRequest, policy: ExistingTaskPolicy) -> ServiceResult<bool> {
        let mut tasks = lock(&self.tasks);
        if policy == ExistingTaskPolicy::Keep && tasks.contains_key(&request.name) {
            return Ok(false);
        }
        *lock(&self.enqueues).entry(request.name.clone()).or_insert(0) += 1;
        tasks.insert(request.name.clone(), request);
        Ok(true)
    }

    async fn cancel(&self, name: &str) -> bool {
        lock(&self.tasks).remove(name).is_some()
    }
}

/// Settings store kept in memory; `set_failing` makes every call fail
#[derive(Default)]
pub struct InMemorySettingsStore {
    settings: Mutex<HashMap<String, MetricSetting>>,
    failing: AtomicBool,
}

impl InMemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> DomainResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DomainError::Remote(RemoteError::Transport("settings store offline".to_string())));
        }
        Ok(())
    }
}

#[async_trait]
impl MetricSettingsStore for InMemorySettingsStore {
    async fn get(&self, metric: &str) -> DomainResult<MetricSetting> {
        self.check()?;
        Ok(lock(&self.settings)
            .get(metric)
            .cloned()
            .unwrap_or_else(|| MetricSetting::disabled(metric)))
    }

    async fn get_all(&self) -> DomainResult<HashMap<String, MetricSetting>> {
        self.check()?;
        Ok(lock(&self.settings).clone())
    }

    async fn put(&self, setting: &MetricSetting) -> DomainResult<()> {
        self.put_many(std::slice::from_ref(setting)).await
    }

    async fn put_many(&self, settings: &[MetricSetting]) -> DomainResult<()> {
        self.check()?;
        for setting in settings {
            setting.validate()?;
        }
        let mut stored = lock(&self.settings);
        for setting in settings {
            stored.insert(setting.metric.clone(), setting.clone());
        }
        Ok(())
    }
}

pub struct NoopTask;

impl NoopTask {
    pub fn arc() -> Arc<dyn BackgroundTask> {
        Arc::new(NoopTask)
    }
}

#[async_trait]
impl BackgroundTask for NoopTask {
    async fn run(&self) -> TaskOutcome {
        TaskOutcome::Success
    }
}

/// Activation handler that records every call
#[derive(Default)]
pub struct RecordingHandler {
    activated: Mutex<Vec<String>>,
    deactivated: Mutex<Vec<String>>,
    resyncs: AtomicUsize,
    fail_activation: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activated(&self) -> Vec<String> {
        lock(&self.activated).clone()
    }

    pub fn deactivated(&self) -> Vec<String> {
        lock(&self.deactivated).clone()
    }

    pub fn resyncs(&self) -> usize {
        self.resyncs.load(Ordering::SeqCst)
    }

    pub fn fail_activation(&self, fail: bool) {
        self.fail_activation.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ActivationHandler for RecordingHandler {
    async fn activate(&self, metric: &MetricDefinition, _setting: &MetricSetting) -> ServiceResult<()> {
        if self.fail_activation.load(Ordering::SeqCst) {
            return Err(ServiceError::Scheduler(format!("could not arm {}", metric.name)));
        }
        lock(&self.activated).push(metric.name.clone());
        Ok(())
    }

    async fn deactivate(&self, metric: &MetricDefinition) -> ServiceResult<()> {
        lock(&self.deactivated).push(metric.name.clone());
        Ok(())
    }

    async fn resync(&self, _metric: &MetricDefinition, _setting: &MetricSetting) -> ServiceResult<()> {
        self.resyncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
