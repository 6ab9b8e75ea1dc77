//! The data baton threaded through a sequence execution.
//!
//! Values are stored behind `Arc` so a snapshot only copies the top-level
//! map. Diffs compare containers by reference and primitives by value, which
//! keeps snapshots cheap while still catching every top-level write.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{ConductorError, Result};

/// Mutable key/value payload owned by a single execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Baton {
    fields: BTreeMap<String, Arc<Value>>,
}

impl Baton {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a baton from a JSON payload. Objects contribute their fields,
    /// any other non-null value is stored under `value`.
    pub fn from_value(payload: Value) -> Self {
        match payload {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Self::new(),
            other => {
                let mut baton = Self::new();
                baton.set("value", other);
                baton
            }
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            fields: map
                .into_iter()
                .map(|(key, value)| (key, Arc::new(value)))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).map(Arc::as_ref)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Writes a field, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), Arc::new(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields
            .remove(key)
            .map(|value| Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Replays the top-level edits that turned `base` into `edited` onto this
    /// baton. Keys `edited` still shares with `base` are left alone, so writes
    /// made to this baton meanwhile survive.
    pub(crate) fn apply_edits(&mut self, base: &Baton, edited: Baton) {
        for key in base.fields.keys() {
            if !edited.fields.contains_key(key) {
                self.fields.remove(key);
            }
        }
        for (key, value) in edited.fields {
            let untouched = base
                .fields
                .get(&key)
                .is_some_and(|previous| Arc::ptr_eq(previous, &value));
            if !untouched {
                self.fields.insert(key, value);
            }
        }
    }

    /// Materialises the baton as a JSON object.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.fields
                .iter()
                .map(|(key, value)| (key.clone(), value.as_ref().clone()))
                .collect(),
        )
    }
}

/// Shallow copy of the baton: top-level entries only, nested values shared.
pub fn snapshot(baton: &Baton) -> Baton {
    baton.clone()
}

/// Top-level changes between two baton states.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatonDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl BatonDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Classifies every top-level key of `prev`/`next` as added, removed or
/// updated. Nested values are not compared structurally.
pub fn diff(prev: &Baton, next: &Baton) -> BatonDiff {
    let mut result = BatonDiff::default();

    for (key, after) in &next.fields {
        match prev.fields.get(key) {
            None => result.added.push(key.clone()),
            Some(before) if changed(before, after) => result.updated.push(key.clone()),
            Some(_) => {}
        }
    }

    for key in prev.fields.keys() {
        if !next.fields.contains_key(key) {
            result.removed.push(key.clone());
        }
    }

    result
}

fn changed(before: &Arc<Value>, after: &Arc<Value>) -> bool {
    if Arc::ptr_eq(before, after) {
        return false;
    }
    match (before.as_ref(), after.as_ref()) {
        (Value::Object(_) | Value::Array(_), _) | (_, Value::Object(_) | Value::Array(_)) => true,
        (left, right) => left != right,
    }
}

/// Identifies where a diff was taken.
#[derive(Debug, Clone, Default)]
pub struct DiffContext {
    pub plugin_id: String,
    pub sequence: String,
    pub movement: String,
    pub event: String,
    pub beat: u32,
    pub handler: String,
    pub correlation_id: String,
}

/// Emits a single structured line describing the change between two baton
/// states. Formatting problems are swallowed.
pub fn log_diff(context: &DiffContext, prev: &Baton, next: &Baton) -> BatonDiff {
    let changes = diff(prev, next);

    if changes.is_empty() {
        tracing::debug!(
            plugin_id = %context.plugin_id,
            sequence = %context.sequence,
            movement = %context.movement,
            event = %context.event,
            beat = context.beat,
            handler = %context.handler,
            correlation_id = %context.correlation_id,
            "baton: no changes"
        );
    } else {
        let summary = serde_json::to_string(&changes).unwrap_or_default();
        tracing::debug!(
            plugin_id = %context.plugin_id,
            sequence = %context.sequence,
            movement = %context.movement,
            event = %context.event,
            beat = context.beat,
            handler = %context.handler,
            correlation_id = %context.correlation_id,
            added = changes.added.len(),
            removed = changes.removed.len(),
            updated = changes.updated.len(),
            changes = %summary,
            "baton changed"
        );
    }

    changes
}

/// Shared handle to the baton of one execution. The handle identity is stable
/// for the whole execution; handlers mutate through it, never replace it.
#[derive(Clone, Default)]
pub struct BatonHandle {
    shared: Arc<Mutex<Baton>>,
}

impl BatonHandle {
    pub fn new(baton: Baton) -> Self {
        Self {
            shared: Arc::new(Mutex::new(baton)),
        }
    }

    /// Runs `f` with shared access to the baton.
    pub fn read<R>(&self, f: impl FnOnce(&Baton) -> R) -> Result<R> {
        let baton = self.lock()?;
        Ok(f(&baton))
    }

    /// Runs `f` with exclusive access to the baton.
    pub fn write<R>(&self, f: impl FnOnce(&mut Baton) -> R) -> Result<R> {
        let mut baton = self.lock()?;
        Ok(f(&mut baton))
    }

    pub fn snapshot(&self) -> Result<Baton> {
        self.read(snapshot)
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.read(|baton| baton.get(key).cloned())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        self.write(|baton| baton.set(key, value))
    }

    pub fn to_value(&self) -> Result<Value> {
        self.read(Baton::to_value)
    }

    pub fn same_baton(&self, other: &BatonHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Baton>> {
        self.shared
            .lock()
            .map_err(|_| ConductorError::msg("baton has been poisoned"))
    }
}

impl fmt::Debug for BatonHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatonHandle").finish()
    }
}
