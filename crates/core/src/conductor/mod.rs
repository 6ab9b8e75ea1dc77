//! The conductor: mounts plugins, resolves topics and runs sequences.
//!
//! Every `play()` becomes one tokio task that owns its execution record and
//! its baton. Plays that share a plugin, sequence and correlation id are
//! queued and run one after another; everything else runs concurrently.

mod execution;
mod single_flight;

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::Serialize;
use serde_json::Value;
use tokio::{runtime::Handle, sync::broadcast, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use execution::{ExecutionOutcome, MovementReport, MovementStatus};

use self::{execution::Execution, single_flight::SingleFlight};
use crate::{
    baton::{Baton, BatonHandle},
    catalog::{MountStatus, PluginBundle, SequenceCatalog},
    config::ConductorConfig,
    context::Collaborators,
    events::{ConductorEvent, EventBus},
    handlers::HandlerRegistry,
    record::{ExecutionKey, ExecutionRecord, RecordRegistry},
    router::{Route, RouteDispatchSummary, Subscription, TopicRouter},
    sequence::SequenceDef,
    timeline::{TokioTurnScheduler, TurnScheduler},
    ConductorError, Result,
};

/// Invoked once an execution ends: the final baton on success, the error
/// otherwise. Also invoked with the rejection when `play()` fails up front.
pub type PlayCallback = Box<dyn FnOnce(Result<Value>) + Send + 'static>;

/// Optional arguments of [`Conductor::play`].
#[derive(Default)]
pub struct PlayOptions {
    /// Scope of mutual exclusion. A fresh id is generated when absent.
    pub correlation_id: Option<String>,
    pub callback: Option<PlayCallback>,
}

impl PlayOptions {
    pub fn correlated(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            callback: None,
        }
    }

    pub fn with_callback<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for PlayOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlayOptions")
            .field("correlation_id", &self.correlation_id)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Handle to a started execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: Uuid,
    key: ExecutionKey,
    cancel: CancellationToken,
    task: JoinHandle<ExecutionOutcome>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn key(&self) -> &ExecutionKey {
        &self.key
    }

    pub fn correlation_id(&self) -> &str {
        &self.key.correlation_id
    }

    /// Requests cooperative cancellation. The handler that is currently
    /// running finishes; no further beat starts.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the terminal outcome.
    pub async fn wait(self) -> Result<ExecutionOutcome> {
        self.task
            .await
            .map_err(|err| ConductorError::msg(format!("execution task failed: {err}")))
    }
}

#[derive(Debug, Default)]
struct StatisticsCounters {
    sequences_started: AtomicU64,
    sequences_succeeded: AtomicU64,
    sequences_failed: AtomicU64,
    sequences_cancelled: AtomicU64,
    queued_cancelled: AtomicU64,
    beats_executed: AtomicU64,
    handler_errors: AtomicU64,
}

impl StatisticsCounters {
    fn sequence_started(&self) {
        self.sequences_started.fetch_add(1, Ordering::Relaxed);
    }

    fn sequence_succeeded(&self) {
        self.sequences_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    fn sequence_failed(&self) {
        self.sequences_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn sequence_cancelled(&self) {
        self.sequences_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn queued_cancelled(&self) {
        self.queued_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn beat_executed(&self) {
        self.beats_executed.fetch_add(1, Ordering::Relaxed);
    }

    fn handler_failed(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the conductor's counters.
///
/// Once every execution has ended, `sequences_started` equals the sum of
/// succeeded, failed and cancelled. Executions cancelled while still queued
/// never start and are counted in `queued_cancelled` only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConductorStatistics {
    pub sequences_started: u64,
    pub sequences_succeeded: u64,
    pub sequences_failed: u64,
    pub sequences_cancelled: u64,
    pub queued_cancelled: u64,
    pub beats_executed: u64,
    pub handler_errors: u64,
    pub unrouted_topics: u64,
}

struct ConductorInner {
    config: ConductorConfig,
    catalog: SequenceCatalog,
    router: TopicRouter,
    records: RecordRegistry,
    events: EventBus,
    collaborators: Collaborators,
    scheduler: Arc<dyn TurnScheduler>,
    flights: SingleFlight,
    stats: StatisticsCounters,
}

/// Builder for [`Conductor`].
pub struct ConductorBuilder {
    config: ConductorConfig,
    collaborators: Collaborators,
    scheduler: Arc<dyn TurnScheduler>,
}

impl ConductorBuilder {
    pub fn collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn TurnScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn build(self) -> Conductor {
        let events = EventBus::new(self.config.event_capacity);
        Conductor {
            inner: Arc::new(ConductorInner {
                config: self.config,
                catalog: SequenceCatalog::new(),
                router: TopicRouter::new(),
                records: RecordRegistry::new(),
                events,
                collaborators: self.collaborators,
                scheduler: self.scheduler,
                flights: SingleFlight::default(),
                stats: StatisticsCounters::default(),
            }),
        }
    }
}

/// Cheap to clone; clones share the same catalog, router and executions.
#[derive(Clone)]
pub struct Conductor {
    inner: Arc<ConductorInner>,
}

impl Default for Conductor {
    fn default() -> Self {
        Self::new(ConductorConfig::default())
    }
}

impl Conductor {
    pub fn new(config: ConductorConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: ConductorConfig) -> ConductorBuilder {
        ConductorBuilder {
            config,
            collaborators: Collaborators::default(),
            scheduler: Arc::new(TokioTurnScheduler::new()),
        }
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &SequenceCatalog {
        &self.inner.catalog
    }

    pub fn router(&self) -> &TopicRouter {
        &self.inner.router
    }

    pub fn mount(
        &self,
        sequence: SequenceDef,
        handlers: &HandlerRegistry,
        plugin_id: &str,
    ) -> Result<MountStatus> {
        self.inner.catalog.mount(sequence, handlers, plugin_id)
    }

    /// Mounts a plugin's sequences and registers the topics its manifest
    /// declares.
    pub fn mount_plugin(&self, bundle: &PluginBundle) -> Result<Vec<MountStatus>> {
        let statuses = self.inner.catalog.mount_plugin(bundle)?;
        for (topic, sequence_id) in &bundle.manifest.topics {
            self.inner
                .router
                .add_route(topic.clone(), Route::new(bundle.id(), sequence_id.clone()))?;
        }
        Ok(statuses)
    }

    /// Removes the plugin's sequences. Routes stay registered so that a later
    /// mount of the same plugin is reachable again; plays issued meanwhile
    /// fail with `SequenceNotFound`.
    pub fn unmount(&self, plugin_id: &str) -> usize {
        self.inner.catalog.unmount(plugin_id)
    }

    /// Starts `sequence_id` of `plugin_id` with `payload` as the initial
    /// baton. Fails immediately, without creating an execution, when the
    /// sequence is not mounted or no tokio runtime is running.
    pub fn play(
        &self,
        plugin_id: &str,
        sequence_id: &str,
        payload: Value,
        options: PlayOptions,
    ) -> Result<ExecutionHandle> {
        let PlayOptions {
            correlation_id,
            callback,
        } = options;

        let admitted = self
            .inner
            .catalog
            .get(plugin_id, sequence_id)
            .and_then(|sequence| {
                let runtime = Handle::try_current().map_err(|_| {
                    ConductorError::msg("play requires a running tokio runtime")
                })?;
                Ok((sequence, runtime))
            });
        let (sequence, runtime) = match admitted {
            Ok(admitted) => admitted,
            Err(err) => {
                tracing::warn!(plugin_id, sequence_id, error = %err, "play rejected");
                if let Some(callback) = callback {
                    callback(Err(err.clone()));
                }
                return Err(err);
            }
        };

        let key = ExecutionKey {
            plugin_id: plugin_id.to_string(),
            sequence_id: sequence_id.to_string(),
            correlation_id: correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        };
        let execution_id = Uuid::new_v4();
        self.inner
            .records
            .insert(ExecutionRecord::new(execution_id, key.clone()))?;

        let (permit, predecessor) = self.inner.flights.enqueue(&key);
        let cancel = CancellationToken::new();
        let baton = BatonHandle::new(Baton::from_value(payload));
        let execution = Execution::new(
            self.clone(),
            sequence,
            baton,
            cancel.clone(),
            execution_id,
            key.clone(),
            callback,
        );
        let task = runtime.spawn(execution.run(predecessor, permit));

        Ok(ExecutionHandle {
            execution_id,
            key,
            cancel,
            task,
        })
    }

    pub fn publish(&self, topic: &str, payload: Value) -> RouteDispatchSummary {
        self.inner.router.publish(topic, &payload, self)
    }

    pub fn publish_correlated(
        &self,
        topic: &str,
        payload: Value,
        correlation_id: &str,
    ) -> RouteDispatchSummary {
        self.inner
            .router
            .publish_correlated(topic, &payload, correlation_id, self)
    }

    pub fn subscribe<F>(&self, topic: impl Into<String>, listener: F) -> Result<Subscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(topic, listener)
    }

    pub fn resolve_interaction(&self, topic: &str) -> Result<Route> {
        self.inner.router.resolve_interaction(topic)
    }

    /// Subscribes to lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ConductorEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ConductorEvent) {
        self.inner.events.emit(event);
    }

    /// Executions that have not reached a terminal state yet.
    pub fn active_executions(&self) -> Vec<ExecutionRecord> {
        self.inner.records.snapshot()
    }

    pub fn statistics(&self) -> ConductorStatistics {
        let stats = &self.inner.stats;
        ConductorStatistics {
            sequences_started: stats.sequences_started.load(Ordering::Relaxed),
            sequences_succeeded: stats.sequences_succeeded.load(Ordering::Relaxed),
            sequences_failed: stats.sequences_failed.load(Ordering::Relaxed),
            sequences_cancelled: stats.sequences_cancelled.load(Ordering::Relaxed),
            queued_cancelled: stats.queued_cancelled.load(Ordering::Relaxed),
            beats_executed: stats.beats_executed.load(Ordering::Relaxed),
            handler_errors: stats.handler_errors.load(Ordering::Relaxed),
            unrouted_topics: self.inner.router.total_unrouted(),
        }
    }
}

impl fmt::Debug for Conductor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conductor")
            .field("config", &self.inner.config)
            .field("sequences", &self.inner.catalog.len())
            .field("active", &self.inner.records.len())
            .field("queued_keys", &self.inner.flights.queued_keys())
            .finish()
    }
}
