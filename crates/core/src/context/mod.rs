//! Per-beat execution context and the external collaborators handlers may use.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::{
    baton::BatonHandle,
    sequence::{BeatKind, BeatTiming},
    Conductor, ConductorError, Result,
};

/// Shared UI surface that stage-crew handlers may mutate directly.
pub trait UiSurface: Send + Sync {
    fn set_property(&self, target: &str, property: &str, value: &str) -> Result<()>;
    fn property(&self, target: &str, property: &str) -> Option<String>;
}

/// Persistent key/value storage available to io handlers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn put(&self, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<bool>;
}

/// In-memory [`UiSurface`] keyed by `(target, property)`.
#[derive(Debug, Default)]
pub struct MemorySurface {
    properties: Mutex<HashMap<(String, String), String>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UiSurface for MemorySurface {
    fn set_property(&self, target: &str, property: &str, value: &str) -> Result<()> {
        let mut properties = self
            .properties
            .lock()
            .map_err(|_| ConductorError::msg("ui surface has been poisoned"))?;
        properties.insert((target.to_string(), property.to_string()), value.to_string());
        Ok(())
    }

    fn property(&self, target: &str, property: &str) -> Option<String> {
        let properties = self.properties.lock().ok()?;
        properties
            .get(&(target.to_string(), property.to_string()))
            .cloned()
    }
}

/// In-memory [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }
}

/// External resources injected into the conductor and handed to handlers.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub ui: Option<Arc<dyn UiSurface>>,
    pub store: Option<Arc<dyn KeyValueStore>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ui(mut self, ui: Arc<dyn UiSurface>) -> Self {
        self.ui = Some(ui);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("ui", &self.ui.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// Identity of the beat a context was built for.
#[derive(Debug, Clone, Default)]
pub struct BeatInfo {
    pub plugin_id: String,
    pub sequence_id: String,
    pub sequence_name: String,
    pub movement: String,
    pub beat: u32,
    pub event: String,
    pub handler: String,
    pub kind: BeatKind,
    pub timing: BeatTiming,
    pub correlation_id: String,
    pub execution_id: String,
}

/// Logger pre-tagged with the fields of one beat.
#[derive(Debug, Clone)]
pub struct BeatLogger {
    info: Arc<BeatInfo>,
}

macro_rules! beat_event {
    ($level:ident, $info:ident, $message:expr) => {
        tracing::$level!(
            plugin_id = %$info.plugin_id,
            sequence = %$info.sequence_name,
            movement = %$info.movement,
            beat = $info.beat,
            event = %$info.event,
            handler = %$info.handler,
            correlation_id = %$info.correlation_id,
            "{}",
            $message
        )
    };
}

impl BeatLogger {
    pub fn debug(&self, message: &str) {
        let info = &self.info;
        beat_event!(debug, info, message);
    }

    pub fn info(&self, message: &str) {
        let info = &self.info;
        beat_event!(info, info, message);
    }

    pub fn warn(&self, message: &str) {
        let info = &self.info;
        beat_event!(warn, info, message);
    }

    pub fn error(&self, message: &str) {
        let info = &self.info;
        beat_event!(error, info, message);
    }
}

/// Everything a handler can see besides the baton itself.
///
/// Collaborators are gated by beat kind: the UI surface is only handed to
/// stage-crew beats, the store only to io beats, and the conductor handle to
/// both. Pure beats see none of them.
#[derive(Clone)]
pub struct BeatContext {
    info: Arc<BeatInfo>,
    payload: BatonHandle,
    configuration: Arc<Map<String, Value>>,
    collaborators: Collaborators,
    conductor: Option<Conductor>,
    cancel: CancellationToken,
}

impl BeatContext {
    pub(crate) fn new(
        info: BeatInfo,
        payload: BatonHandle,
        configuration: Arc<Map<String, Value>>,
        collaborators: Collaborators,
        conductor: Option<Conductor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            info: Arc::new(info),
            payload,
            configuration,
            collaborators,
            conductor,
            cancel,
        }
    }

    /// Context that is not attached to any conductor. Useful for exercising
    /// handlers on their own.
    pub fn standalone(payload: BatonHandle) -> Self {
        Self::new(
            BeatInfo::default(),
            payload,
            Arc::new(Map::new()),
            Collaborators::default(),
            None,
            CancellationToken::new(),
        )
    }

    /// Same as [`BeatContext::standalone`] but for a beat of the given kind
    /// with the given collaborators.
    pub fn standalone_with(payload: BatonHandle, kind: BeatKind, collaborators: Collaborators) -> Self {
        let info = BeatInfo {
            kind,
            ..BeatInfo::default()
        };
        Self::new(
            info,
            payload,
            Arc::new(Map::new()),
            collaborators,
            None,
            CancellationToken::new(),
        )
    }

    pub fn info(&self) -> &BeatInfo {
        &self.info
    }

    pub fn plugin_id(&self) -> &str {
        &self.info.plugin_id
    }

    pub fn sequence_id(&self) -> &str {
        &self.info.sequence_id
    }

    pub fn correlation_id(&self) -> &str {
        &self.info.correlation_id
    }

    pub fn kind(&self) -> BeatKind {
        self.info.kind
    }

    /// The execution's baton.
    pub fn payload(&self) -> &BatonHandle {
        &self.payload
    }

    /// The owning sequence's `configuration` block.
    pub fn configuration(&self) -> &Map<String, Value> {
        &self.configuration
    }

    pub fn logger(&self) -> BeatLogger {
        BeatLogger {
            info: self.info.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn ui(&self) -> Option<&Arc<dyn UiSurface>> {
        match self.info.kind {
            BeatKind::StageCrew => self.collaborators.ui.as_ref(),
            _ => None,
        }
    }

    pub fn store(&self) -> Option<&Arc<dyn KeyValueStore>> {
        match self.info.kind {
            BeatKind::Io => self.collaborators.store.as_ref(),
            _ => None,
        }
    }

    /// Handle for nested `play`/`publish` calls.
    pub fn conductor(&self) -> Option<&Conductor> {
        match self.info.kind {
            BeatKind::Pure => None,
            BeatKind::Io | BeatKind::StageCrew => self.conductor.as_ref(),
        }
    }
}

impl fmt::Debug for BeatContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeatContext")
            .field("info", &self.info)
            .field("collaborators", &self.collaborators)
            .field("attached", &self.conductor.is_some())
            .finish()
    }
}
