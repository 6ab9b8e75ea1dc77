//! Mounted sequences, keyed by plugin and sequence id.
//!
//! Mounting resolves every beat's handler against the mounting plugin's own
//! [`HandlerRegistry`] and stores the result as an immutable
//! [`MountedSequence`]. Executions hold an `Arc` to the mounted sequence, so
//! unmounting a plugin never disturbs a play that is already running.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    handlers::{Handler, HandlerRegistry},
    sequence::{Beat, Movement, SequenceDef},
    ConductorError, Result,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceKey {
    pub plugin_id: String,
    pub sequence_id: String,
}

impl SequenceKey {
    pub fn new(plugin_id: impl Into<String>, sequence_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            sequence_id: sequence_id.into(),
        }
    }
}

impl fmt::Display for SequenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.plugin_id, self.sequence_id)
    }
}

/// A beat together with the handler it resolved to at mount time.
#[derive(Debug, Clone)]
pub struct ResolvedBeat {
    pub beat: Beat,
    pub handler: Handler,
}

/// A movement whose beats are stored in execution order.
#[derive(Debug, Clone)]
pub struct ResolvedMovement {
    pub id: String,
    pub name: String,
    pub abort_on_prior_failure: bool,
    pub beats: Vec<ResolvedBeat>,
}

/// Immutable, ready-to-run sequence.
#[derive(Debug)]
pub struct MountedSequence {
    pub plugin_id: String,
    pub definition: SequenceDef,
    pub movements: Vec<ResolvedMovement>,
    pub configuration: Arc<Map<String, Value>>,
    fingerprint: String,
}

impl MountedSequence {
    pub fn key(&self) -> SequenceKey {
        SequenceKey::new(&self.plugin_id, &self.definition.id)
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    fn prepare(sequence: SequenceDef, handlers: &HandlerRegistry, plugin_id: &str) -> Result<Self> {
        sequence.validate()?;
        let fingerprint = sequence.to_json()?;

        let movements = sequence
            .movements
            .iter()
            .map(|movement| resolve_movement(movement, handlers, plugin_id, &sequence.id))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            plugin_id: plugin_id.to_string(),
            configuration: Arc::new(sequence.configuration.clone()),
            definition: sequence,
            movements,
            fingerprint,
        })
    }
}

fn resolve_movement(
    movement: &Movement,
    handlers: &HandlerRegistry,
    plugin_id: &str,
    sequence_id: &str,
) -> Result<ResolvedMovement> {
    let beats = movement
        .ordered_beats()
        .into_iter()
        .map(|beat| {
            let handler = handlers.resolve(&beat.handler.name).ok_or_else(|| {
                ConductorError::MissingHandler {
                    plugin_id: plugin_id.to_string(),
                    sequence_id: sequence_id.to_string(),
                    handler: beat.handler.name.clone(),
                }
            })?;
            Ok(ResolvedBeat {
                beat: beat.clone(),
                handler,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ResolvedMovement {
        id: movement.id.clone(),
        name: movement.name.clone(),
        abort_on_prior_failure: movement.abort_on_prior_failure,
        beats,
    })
}

/// Outcome of a successful mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Mounted,
    /// An identical definition was already mounted; nothing changed.
    Unchanged,
}

/// Declarative part of a plugin: its sequences and the topics that trigger them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    #[serde(default)]
    pub sequences: Vec<SequenceDef>,
    /// Topic name to sequence id.
    #[serde(default)]
    pub topics: BTreeMap<String, String>,
}

impl PluginManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A plugin ready to mount: manifest plus handler implementations.
#[derive(Debug, Clone)]
pub struct PluginBundle {
    pub manifest: PluginManifest,
    pub handlers: HandlerRegistry,
}

impl PluginBundle {
    pub fn new(manifest: PluginManifest, handlers: HandlerRegistry) -> Self {
        Self { manifest, handlers }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }
}

/// Registry of mounted sequences. Read-mostly; safe to share across
/// executions.
#[derive(Debug, Default)]
pub struct SequenceCatalog {
    sequences: RwLock<HashMap<SequenceKey, Arc<MountedSequence>>>,
}

impl SequenceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sequence` for `plugin_id`. Re-mounting a byte-identical
    /// definition is a no-op; any other definition under the same key is a
    /// conflict. Nothing is registered when the call fails.
    pub fn mount(
        &self,
        sequence: SequenceDef,
        handlers: &HandlerRegistry,
        plugin_id: &str,
    ) -> Result<MountStatus> {
        let prepared = MountedSequence::prepare(sequence, handlers, plugin_id)?;
        let mut sequences = self.write()?;
        let status = check_conflict(&sequences, &prepared)?;
        if status == MountStatus::Mounted {
            tracing::info!(
                plugin_id,
                sequence = %prepared.definition.id,
                movements = prepared.movements.len(),
                "mounted sequence"
            );
            sequences.insert(prepared.key(), Arc::new(prepared));
        }
        Ok(status)
    }

    /// Mounts every sequence of a plugin, or none of them.
    pub fn mount_plugin(&self, bundle: &PluginBundle) -> Result<Vec<MountStatus>> {
        let plugin_id = bundle.id();
        let mut seen = HashSet::new();
        let mut prepared = Vec::with_capacity(bundle.manifest.sequences.len());
        for sequence in &bundle.manifest.sequences {
            if !seen.insert(sequence.id.as_str()) {
                return Err(ConductorError::InvalidSequence(format!(
                    "plugin `{plugin_id}` declares sequence `{}` twice",
                    sequence.id
                )));
            }
            prepared.push(MountedSequence::prepare(
                sequence.clone(),
                &bundle.handlers,
                plugin_id,
            )?);
        }

        let mut sequences = self.write()?;
        let statuses = prepared
            .iter()
            .map(|sequence| check_conflict(&sequences, sequence))
            .collect::<Result<Vec<_>>>()?;

        for (sequence, status) in prepared.into_iter().zip(&statuses) {
            if *status == MountStatus::Mounted {
                sequences.insert(sequence.key(), Arc::new(sequence));
            }
        }

        tracing::info!(
            plugin_id,
            sequences = statuses.len(),
            "mounted plugin"
        );
        Ok(statuses)
    }

    /// Removes every sequence owned by `plugin_id` and returns how many were
    /// removed.
    pub fn unmount(&self, plugin_id: &str) -> usize {
        let Ok(mut sequences) = self.write() else {
            return 0;
        };
        let before = sequences.len();
        sequences.retain(|key, _| key.plugin_id != plugin_id);
        let removed = before - sequences.len();
        if removed > 0 {
            tracing::info!(plugin_id, removed, "unmounted plugin");
        }
        removed
    }

    pub fn get(&self, plugin_id: &str, sequence_id: &str) -> Result<Arc<MountedSequence>> {
        self.read()?
            .get(&SequenceKey::new(plugin_id, sequence_id))
            .cloned()
            .ok_or_else(|| ConductorError::sequence_not_found(plugin_id, sequence_id))
    }

    pub fn contains(&self, plugin_id: &str, sequence_id: &str) -> bool {
        self.read()
            .map(|sequences| sequences.contains_key(&SequenceKey::new(plugin_id, sequence_id)))
            .unwrap_or(false)
    }

    /// Sequence ids mounted for `plugin_id`, sorted.
    pub fn sequences_for(&self, plugin_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .map(|sequences| {
                sequences
                    .keys()
                    .filter(|key| key.plugin_id == plugin_id)
                    .map(|key| key.sequence_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn plugin_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .read()
            .map(|sequences| sequences.keys().map(|key| key.plugin_id.clone()).collect())
            .unwrap_or_default();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().map(|sequences| sequences.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<SequenceKey, Arc<MountedSequence>>>> {
        self.sequences
            .read()
            .map_err(|_| ConductorError::msg("sequence catalog has been poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<SequenceKey, Arc<MountedSequence>>>> {
        self.sequences
            .write()
            .map_err(|_| ConductorError::msg("sequence catalog has been poisoned"))
    }
}

fn check_conflict(
    sequences: &HashMap<SequenceKey, Arc<MountedSequence>>,
    candidate: &MountedSequence,
) -> Result<MountStatus> {
    match sequences.get(&candidate.key()) {
        None => Ok(MountStatus::Mounted),
        Some(existing) if existing.fingerprint == candidate.fingerprint => {
            Ok(MountStatus::Unchanged)
        }
        Some(_) => Err(ConductorError::DuplicateSequence {
            plugin_id: candidate.plugin_id.clone(),
            sequence_id: candidate.definition.id.clone(),
        }),
    }
}
