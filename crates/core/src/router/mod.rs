//! Topic routing: maps external event names to plugin sequences and to
//! direct listeners.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    catalog::SequenceCatalog,
    conductor::{Conductor, ExecutionHandle, ExecutionOutcome, PlayOptions},
    events::ConductorEvent,
    ConductorError, Result,
};

/// Target of a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub plugin_id: String,
    pub sequence_id: String,
}

impl Route {
    pub fn new(plugin_id: impl Into<String>, sequence_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            sequence_id: sequence_id.into(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.plugin_id, self.sequence_id)
    }
}

/// Interchange format for a routing table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionManifest {
    #[serde(default)]
    pub routes: BTreeMap<String, Vec<Route>>,
}

impl InteractionManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Distinct topics whose unrouted publishes are counted individually. Topics
/// beyond this only add to the global counter.
const MAX_TRACKED_UNROUTED: usize = 256;

#[derive(Default)]
struct RouterState {
    routes: HashMap<String, Vec<Route>>,
    listeners: HashMap<String, Vec<(u64, Listener)>>,
    unrouted: HashMap<String, u64>,
}

impl RouterState {
    fn record_unrouted(&mut self, topic: &str) {
        if let Some(count) = self.unrouted.get_mut(topic) {
            *count += 1;
        } else if self.unrouted.len() < MAX_TRACKED_UNROUTED {
            self.unrouted.insert(topic.to_string(), 1);
        }
    }
}

/// Handle returned by [`TopicRouter::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    id: u64,
    state: Weak<Mutex<RouterState>>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Removes the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let Ok(mut state) = state.lock() else {
            return false;
        };
        let Some(listeners) = state.listeners.get_mut(&self.topic) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != self.id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            state.listeners.remove(&self.topic);
        }
        removed
    }
}

/// A route whose `play()` could not be started.
#[derive(Debug, Clone)]
pub struct RouteFailure {
    pub route: Route,
    pub error: ConductorError,
}

/// What a single `publish()` did.
#[derive(Debug)]
pub struct RouteDispatchSummary {
    pub topic: String,
    pub routes_matched: usize,
    pub listeners_notified: usize,
    pub executions: Vec<ExecutionHandle>,
    pub failures: Vec<RouteFailure>,
}

impl RouteDispatchSummary {
    pub fn is_unrouted(&self) -> bool {
        self.routes_matched == 0
    }

    /// Waits for every started execution, in route order.
    pub async fn wait_all(self) -> Vec<Result<ExecutionOutcome>> {
        let mut outcomes = Vec::with_capacity(self.executions.len());
        for execution in self.executions {
            outcomes.push(execution.wait().await);
        }
        outcomes
    }
}

/// Routing table plus direct listeners.
pub struct TopicRouter {
    state: Arc<Mutex<RouterState>>,
    next_listener: AtomicU64,
    total_unrouted: AtomicU64,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRouter {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RouterState::default())),
            next_listener: AtomicU64::new(1),
            total_unrouted: AtomicU64::new(0),
        }
    }

    /// Adds a route for `topic`. Adding the same route twice has no effect.
    pub fn add_route(&self, topic: impl Into<String>, route: Route) -> Result<()> {
        let mut state = self.lock()?;
        let routes = state.routes.entry(topic.into()).or_default();
        if !routes.contains(&route) {
            routes.push(route);
        }
        Ok(())
    }

    pub fn load_manifest(&self, manifest: &InteractionManifest) -> Result<usize> {
        let mut added = 0;
        for (topic, routes) in &manifest.routes {
            for route in routes {
                self.add_route(topic.clone(), route.clone())?;
                added += 1;
            }
        }
        Ok(added)
    }

    /// Drops every route that targets `plugin_id`.
    pub fn remove_routes_for_plugin(&self, plugin_id: &str) -> usize {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        let mut removed = 0;
        state.routes.retain(|_, routes| {
            let before = routes.len();
            routes.retain(|route| route.plugin_id != plugin_id);
            removed += before - routes.len();
            !routes.is_empty()
        });
        removed
    }

    pub fn routes(&self, topic: &str) -> Vec<Route> {
        self.lock()
            .ok()
            .and_then(|state| state.routes.get(topic).cloned())
            .unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .lock()
            .map(|state| state.routes.keys().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Current routing table as a manifest.
    pub fn manifest(&self) -> InteractionManifest {
        let routes = self
            .lock()
            .map(|state| {
                state
                    .routes
                    .iter()
                    .map(|(topic, routes)| (topic.clone(), routes.clone()))
                    .collect()
            })
            .unwrap_or_default();
        InteractionManifest { routes }
    }

    /// Pure lookup of the first route registered for `topic`.
    pub fn resolve_interaction(&self, topic: &str) -> Result<Route> {
        self.lock()?
            .routes
            .get(topic)
            .and_then(|routes| routes.first().cloned())
            .ok_or_else(|| ConductorError::UnknownTopic(topic.to_string()))
    }

    /// Routes whose target sequence is not mounted in `catalog`.
    pub fn validate_against(&self, catalog: &SequenceCatalog) -> Vec<(String, Route)> {
        let mut unresolved: Vec<(String, Route)> = self
            .lock()
            .map(|state| {
                state
                    .routes
                    .iter()
                    .flat_map(|(topic, routes)| {
                        routes
                            .iter()
                            .filter(|route| !catalog.contains(&route.plugin_id, &route.sequence_id))
                            .map(move |route| (topic.clone(), route.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        unresolved.sort_by(|a, b| a.0.cmp(&b.0));
        unresolved
    }

    /// Registers a direct listener for `topic`. Listeners run synchronously
    /// inside `publish()` and never start a sequence.
    pub fn subscribe<F>(&self, topic: impl Into<String>, listener: F) -> Result<Subscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let topic = topic.into();
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.lock()?
            .listeners
            .entry(topic.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        Ok(Subscription {
            topic,
            id,
            state: Arc::downgrade(&self.state),
        })
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.lock()
            .map(|state| state.listeners.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// How often `topic` was published without any route. Only the first
    /// distinct unrouted topics are tracked; later ones report zero here and
    /// count towards [`TopicRouter::total_unrouted`] only.
    pub fn unrouted_count(&self, topic: &str) -> u64 {
        self.lock()
            .map(|state| state.unrouted.get(topic).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn total_unrouted(&self) -> u64 {
        self.total_unrouted.load(Ordering::Relaxed)
    }

    /// Notifies listeners and starts one independent execution per route.
    /// Each route receives its own copy of `payload`. Failures to start a
    /// route are collected in the summary rather than returned.
    pub fn publish(
        &self,
        topic: &str,
        payload: &Value,
        conductor: &Conductor,
    ) -> RouteDispatchSummary {
        self.dispatch(topic, payload, None, conductor)
    }

    /// Like [`TopicRouter::publish`] but every started execution uses
    /// `correlation_id`, so it queues behind other plays sharing it.
    pub fn publish_correlated(
        &self,
        topic: &str,
        payload: &Value,
        correlation_id: &str,
        conductor: &Conductor,
    ) -> RouteDispatchSummary {
        self.dispatch(topic, payload, Some(correlation_id), conductor)
    }

    fn dispatch(
        &self,
        topic: &str,
        payload: &Value,
        correlation_id: Option<&str>,
        conductor: &Conductor,
    ) -> RouteDispatchSummary {
        let (routes, listeners) = match self.lock() {
            Ok(mut state) => {
                let routes = state.routes.get(topic).cloned().unwrap_or_default();
                let listeners: Vec<Listener> = state
                    .listeners
                    .get(topic)
                    .map(|entries| entries.iter().map(|(_, l)| l.clone()).collect())
                    .unwrap_or_default();
                if routes.is_empty() {
                    state.record_unrouted(topic);
                }
                (routes, listeners)
            }
            Err(err) => {
                tracing::error!(topic, error = %err, "topic router unavailable");
                (Vec::new(), Vec::new())
            }
        };

        let mut listeners_notified = 0;
        for listener in &listeners {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(payload))) {
                Ok(()) => listeners_notified += 1,
                Err(_) => tracing::warn!(topic, "topic listener panicked"),
            }
        }

        if routes.is_empty() {
            self.total_unrouted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(topic, listeners = listeners_notified, "topic has no routes");
            conductor.emit(ConductorEvent::TopicUnrouted {
                topic: topic.to_string(),
            });
        }

        let mut executions = Vec::with_capacity(routes.len());
        let mut failures = Vec::new();
        for route in &routes {
            let options = match correlation_id {
                Some(id) => PlayOptions::correlated(id),
                None => PlayOptions::default(),
            };
            match conductor.play(&route.plugin_id, &route.sequence_id, payload.clone(), options) {
                Ok(handle) => executions.push(handle),
                Err(error) => {
                    tracing::warn!(topic, route = %route, error = %error, "route could not be played");
                    failures.push(RouteFailure {
                        route: route.clone(),
                        error,
                    });
                }
            }
        }

        RouteDispatchSummary {
            topic: topic.to_string(),
            routes_matched: routes.len(),
            listeners_notified,
            executions,
            failures,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, RouterState>> {
        self.state
            .lock()
            .map_err(|_| ConductorError::msg("topic router has been poisoned"))
    }
}

impl fmt::Debug for TopicRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicRouter")
            .field("topics", &self.topics())
            .field("total_unrouted", &self.total_unrouted())
            .finish()
    }
}
