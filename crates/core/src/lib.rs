//! Core library for the musical conductor.
//!
//! Plugins describe their behaviour as sequences of movements and beats. The
//! crate mounts those sequences, routes topics to them and executes them
//! against a per-execution baton, with single-flight protection per
//! correlation id. Each module owns one subsystem (catalog, routing,
//! execution, records, events) so the application crate only wires them up.

pub mod baton;
pub mod catalog;
pub mod conductor;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod handlers;
pub mod record;
pub mod router;
pub mod sequence;
pub mod timeline;

pub use baton::{Baton, BatonDiff, BatonHandle};
pub use catalog::{MountStatus, PluginBundle, PluginManifest, SequenceCatalog};
pub use conductor::{
    Conductor, ConductorBuilder, ConductorStatistics, ExecutionHandle, ExecutionOutcome,
    MovementReport, MovementStatus, PlayCallback, PlayOptions,
};
pub use config::{AppConfig, ConductorConfig, DemoConfig, FailurePolicy};
pub use context::{
    BeatContext, BeatInfo, BeatLogger, Collaborators, KeyValueStore, MemoryStore, MemorySurface,
    UiSurface,
};
pub use error::{ConductorError, HandlerError, Result};
pub use events::{ConductorEvent, EventBus};
pub use handlers::{Handler, HandlerRegistry, HandlerResult};
pub use record::{ExecutionKey, ExecutionRecord, ExecutionState, RecordRegistry};
pub use router::{InteractionManifest, Route, RouteDispatchSummary, Subscription, TopicRouter};
pub use sequence::{Beat, BeatKind, BeatTiming, HandlerRef, Movement, SequenceDef};
pub use timeline::{Deferred, TokioTurnScheduler, TurnScheduler};
