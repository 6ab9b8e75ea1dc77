//! Declarative sequence definitions shipped by plugins.
//!
//! A sequence is plain data: movements in declaration order, each holding a
//! set of beats keyed by beat number. The JSON form uses camelCase field names
//! and round-trips through [`SequenceDef::to_json`] / [`SequenceDef::from_json`]
//! unchanged.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ConductorError, Result};

/// How the conductor schedules a beat relative to the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeatTiming {
    /// Run in-line before advancing.
    #[default]
    Immediate,
    /// Wait for the handler, and every deferred beat before it, to finish.
    Synchronized,
    /// Run after the current turn; joined before the movement completes.
    Delayed,
}

/// What a beat's handler is allowed to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BeatKind {
    /// Only transforms the baton.
    #[default]
    Pure,
    /// Performs asynchronous I/O through the injected store.
    Io,
    /// May mutate external resources such as the UI surface.
    StageCrew,
}

/// Reference from a beat to a handler provided by the mounting plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "HandlerRefRepr", into = "HandlerRefRepr")]
pub struct HandlerRef {
    pub name: String,
    /// Module path the handler came from; informational only.
    pub source: Option<String>,
}

impl HandlerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum HandlerRefRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
}

impl From<HandlerRefRepr> for HandlerRef {
    fn from(repr: HandlerRefRepr) -> Self {
        match repr {
            HandlerRefRepr::Name(name) => Self { name, source: None },
            HandlerRefRepr::Full { name, source } => Self { name, source },
        }
    }
}

impl From<HandlerRef> for HandlerRefRepr {
    fn from(handler: HandlerRef) -> Self {
        match handler.source {
            None => HandlerRefRepr::Name(handler.name),
            source => HandlerRefRepr::Full {
                name: handler.name,
                source,
            },
        }
    }
}

/// Smallest schedulable unit of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beat {
    pub beat: u32,
    pub event: String,
    pub handler: HandlerRef,
    #[serde(default)]
    pub timing: BeatTiming,
    #[serde(default)]
    pub kind: BeatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Beat {
    pub fn new(beat: u32, event: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            beat,
            event: event.into(),
            handler: HandlerRef::new(handler),
            timing: BeatTiming::default(),
            kind: BeatKind::default(),
            description: None,
        }
    }

    pub fn timing(mut self, timing: BeatTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn kind(mut self, kind: BeatKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Ordered group of beats; an independent failure domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movement {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub beats: Vec<Beat>,
    /// Skip this movement when any earlier movement failed.
    #[serde(default, skip_serializing_if = "is_false")]
    pub abort_on_prior_failure: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Movement {
    pub fn new(name: impl Into<String>, beats: Vec<Beat>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            beats,
            abort_on_prior_failure: false,
        }
    }

    /// Beats in ascending beat-number order, independent of declaration order.
    pub fn ordered_beats(&self) -> Vec<&Beat> {
        let mut beats: Vec<&Beat> = self.beats.iter().collect();
        beats.sort_by_key(|beat| beat.beat);
        beats
    }
}

/// Declarative workflow made of movements. Immutable once mounted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceDef {
    pub id: String,
    pub name: String,
    pub movements: Vec<Movement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_signature: Option<String>,
    /// Plugin-specific options handed to every handler through its context.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub configuration: Map<String, Value>,
}

impl SequenceDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, movements: Vec<Movement>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            movements,
            category: None,
            description: None,
            key: None,
            tempo: None,
            time_signature: None,
            configuration: Map::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Checks structural invariants: non-empty ids and unique beat numbers
    /// within every movement.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ConductorError::InvalidSequence(
                "sequence id must not be empty".to_string(),
            ));
        }

        for movement in &self.movements {
            let mut seen = HashSet::new();
            for beat in &movement.beats {
                if !seen.insert(beat.beat) {
                    return Err(ConductorError::InvalidSequence(format!(
                        "beat {} appears twice in movement `{}` of sequence `{}`",
                        beat.beat, movement.name, self.id
                    )));
                }
                if beat.handler.name.is_empty() {
                    return Err(ConductorError::InvalidSequence(format!(
                        "beat {} of movement `{}` in sequence `{}` has no handler",
                        beat.beat, movement.name, self.id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Every distinct handler name referenced by the sequence, in first-use order.
    pub fn handler_names(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.movements
            .iter()
            .flat_map(|movement| movement.beats.iter())
            .map(|beat| beat.handler.name.as_str())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    pub fn beat_count(&self) -> usize {
        self.movements.iter().map(|movement| movement.beats.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn theme_sequence_json() -> Value {
        json!({
            "id": "theme-symphony",
            "name": "Theme Symphony",
            "category": "system",
            "key": "C Major",
            "tempo": 120,
            "timeSignature": "4/4",
            "configuration": { "persist": true },
            "movements": [{
                "id": "theme-transition",
                "name": "Theme Transition",
                "beats": [
                    { "beat": 2, "event": "theme:apply", "handler": "applyTheme", "timing": "synchronized", "kind": "stage-crew" },
                    { "beat": 1, "event": "theme:validate", "handler": { "name": "validateTheme", "source": "handlers/validate" } }
                ]
            }]
        })
    }

    #[test]
    fn parses_wire_format() {
        let sequence = SequenceDef::from_value(theme_sequence_json()).unwrap();

        assert_eq!(sequence.time_signature.as_deref(), Some("4/4"));
        let beats = &sequence.movements[0].beats;
        assert_eq!(beats[0].timing, BeatTiming::Synchronized);
        assert_eq!(beats[0].kind, BeatKind::StageCrew);
        assert_eq!(beats[1].timing, BeatTiming::Immediate);
        assert_eq!(beats[1].kind, BeatKind::Pure);
        assert_eq!(beats[1].handler.source.as_deref(), Some("handlers/validate"));
    }

    #[test]
    fn serialization_round_trips() {
        let sequence = SequenceDef::from_value(theme_sequence_json()).unwrap();
        let json = sequence.to_json().unwrap();
        let reparsed = SequenceDef::from_json(&json).unwrap();

        assert_eq!(sequence, reparsed);
        assert_eq!(json, reparsed.to_json().unwrap());
    }

    #[test]
    fn orders_beats_by_number() {
        let sequence = SequenceDef::from_value(theme_sequence_json()).unwrap();
        let order: Vec<u32> = sequence.movements[0]
            .ordered_beats()
            .iter()
            .map(|beat| beat.beat)
            .collect();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn rejects_duplicate_beat_numbers() {
        let sequence = SequenceDef::new(
            "dup",
            "Duplicate",
            vec![Movement::new(
                "main",
                vec![Beat::new(1, "a", "first"), Beat::new(1, "b", "second")],
            )],
        );

        let err = sequence.validate().unwrap_err();
        assert!(format!("{err}").contains("beat 1 appears twice"));
    }

    #[test]
    fn lists_unique_handler_names() {
        let sequence = SequenceDef::new(
            "s",
            "S",
            vec![
                Movement::new("one", vec![Beat::new(1, "a", "h1"), Beat::new(2, "b", "h2")]),
                Movement::new("two", vec![Beat::new(1, "c", "h1")]),
            ],
        );
        assert_eq!(sequence.handler_names(), vec!["h1", "h2"]);
        assert_eq!(sequence.beat_count(), 3);
    }
}
