use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ConductorError, Result};

/// Lifecycle of one `play()` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Legal edges: `Pending -> Running`, `Running -> Succeeded | Failed`, and
    /// `Pending -> Failed` for executions cancelled while queued.
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Single-flight key. Two plays with the same key never interleave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionKey {
    pub plugin_id: String,
    pub sequence_id: String,
    pub correlation_id: String,
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}#{}",
            self.plugin_id, self.sequence_id, self.correlation_id
        )
    }
}

/// Diagnostic view of an in-flight execution.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub key: ExecutionKey,
    pub state: ExecutionState,
    pub movement_index: usize,
    pub beat_index: usize,
    pub failure_reason: Option<String>,
    pub started_at: Instant,
}

impl ExecutionRecord {
    pub fn new(execution_id: Uuid, key: ExecutionKey) -> Self {
        Self {
            execution_id,
            key,
            state: ExecutionState::Pending,
            movement_index: 0,
            beat_index: 0,
            failure_reason: None,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn transition_to(&mut self, next: ExecutionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ConductorError::msg(format!(
                "execution {} cannot move from {} to {}",
                self.key, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }
}

/// Registry of executions that have not reached a terminal state yet.
#[derive(Debug, Clone, Default)]
pub struct RecordRegistry {
    records: Arc<Mutex<HashMap<Uuid, ExecutionRecord>>>,
}

impl RecordRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ExecutionRecord) -> Result<()> {
        self.lock()?.insert(record.execution_id, record);
        Ok(())
    }

    /// Applies a state transition to a tracked record.
    pub fn transition(&self, execution_id: Uuid, next: ExecutionState) -> Result<()> {
        let mut records = self.lock()?;
        match records.get_mut(&execution_id) {
            Some(record) => record.transition_to(next),
            None => Err(ConductorError::msg(format!(
                "execution {execution_id} is not tracked"
            ))),
        }
    }

    pub fn set_position(&self, execution_id: Uuid, movement_index: usize, beat_index: usize) {
        if let Ok(mut records) = self.lock() {
            if let Some(record) = records.get_mut(&execution_id) {
                record.movement_index = movement_index;
                record.beat_index = beat_index;
            }
        }
    }

    /// Moves the record to its terminal state and stops tracking it.
    pub fn finish(
        &self,
        execution_id: Uuid,
        state: ExecutionState,
        reason: Option<String>,
    ) -> Result<ExecutionRecord> {
        let mut records = self.lock()?;
        let mut record = records.remove(&execution_id).ok_or_else(|| {
            ConductorError::msg(format!("execution {execution_id} is not tracked"))
        })?;
        record.transition_to(state)?;
        record.failure_reason = reason;
        Ok(record)
    }

    pub fn get(&self, execution_id: Uuid) -> Option<ExecutionRecord> {
        self.lock().ok()?.get(&execution_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .lock()
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by_key(|record| record.started_at);
        records
    }

    pub fn len(&self) -> usize {
        self.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, ExecutionRecord>>> {
        self.records
            .lock()
            .map_err(|_| ConductorError::msg("execution records have been poisoned"))
    }
}
