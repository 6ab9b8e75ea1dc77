//! The beat loop of a single execution.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{single_flight::FlightPermit, Conductor, PlayCallback};
use crate::{
    baton::{self, BatonHandle, DiffContext},
    catalog::{MountedSequence, ResolvedBeat, ResolvedMovement},
    config::FailurePolicy,
    context::{BeatContext, BeatInfo},
    events::ConductorEvent,
    handlers::{Handler, HandlerResult},
    record::{ExecutionKey, ExecutionState},
    sequence::BeatTiming,
    timeline::Deferred,
    ConductorError, Result,
};

/// How a movement ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementStatus {
    Completed,
    Failed,
    /// Not attempted because an earlier movement failed.
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct MovementReport {
    pub name: String,
    pub status: MovementStatus,
    pub beats_run: usize,
    pub beats_skipped: usize,
    pub error: Option<ConductorError>,
}

/// Terminal result of one execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: Uuid,
    pub key: ExecutionKey,
    pub state: ExecutionState,
    /// Final baton contents.
    pub baton: Value,
    pub movements: Vec<MovementReport>,
    /// First failure, or the cancellation.
    pub error: Option<ConductorError>,
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.state == ExecutionState::Succeeded
    }

    pub fn is_cancelled(&self) -> bool {
        self.error.as_ref().is_some_and(ConductorError::is_cancelled)
    }

    /// The final baton on success, the recorded error otherwise.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.baton),
        }
    }
}

/// Everything a beat needs, cheap to clone into deferred work.
#[derive(Clone)]
struct BeatRunner {
    conductor: Conductor,
    sequence: Arc<MountedSequence>,
    baton: BatonHandle,
    cancel: CancellationToken,
    execution_id: Uuid,
    key: ExecutionKey,
}

struct PendingBeat {
    beat: u32,
    deferred: Deferred,
    result: oneshot::Receiver<Result<Vec<String>>>,
}

pub(crate) struct Execution {
    runner: BeatRunner,
    callback: Option<PlayCallback>,
    started: Instant,
    /// Set once the execution leaves the queue and starts its beats.
    running: bool,
}

impl Execution {
    pub(crate) fn new(
        conductor: Conductor,
        sequence: Arc<MountedSequence>,
        baton: BatonHandle,
        cancel: CancellationToken,
        execution_id: Uuid,
        key: ExecutionKey,
        callback: Option<PlayCallback>,
    ) -> Self {
        Self {
            runner: BeatRunner {
                conductor,
                sequence,
                baton,
                cancel,
                execution_id,
                key,
            },
            callback,
            started: Instant::now(),
            running: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        predecessor: Option<oneshot::Receiver<()>>,
        permit: FlightPermit,
    ) -> ExecutionOutcome {
        if let Some(mut predecessor) = predecessor {
            tracing::debug!(key = %self.runner.key, "queued behind running execution");
            let cancelled = tokio::select! {
                biased;
                _ = self.runner.cancel.cancelled() => true,
                _ = &mut predecessor => false,
            };
            if cancelled {
                let outcome = self.finish(Vec::new(), ExecutionState::Failed, Some(self.cancelled_error()));
                // Our successor must still wait for the execution ahead of us.
                let _ = predecessor.await;
                drop(permit);
                return outcome;
            }
        }

        let outcome = self.perform().await;
        drop(permit);
        outcome
    }

    async fn perform(&mut self) -> ExecutionOutcome {
        let runner = self.runner.clone();
        let inner = &runner.conductor.inner;

        if let Err(err) = inner.records.transition(runner.execution_id, ExecutionState::Running) {
            tracing::warn!(key = %runner.key, error = %err, "execution record unavailable");
        }
        inner.stats.sequence_started();
        self.running = true;
        tracing::info!(
            plugin_id = %runner.key.plugin_id,
            sequence = %runner.sequence.name(),
            correlation_id = %runner.key.correlation_id,
            execution_id = %runner.execution_id,
            "sequence started"
        );
        runner.conductor.emit(ConductorEvent::SequenceStarted {
            execution_id: runner.execution_id,
            plugin_id: runner.key.plugin_id.clone(),
            sequence_id: runner.key.sequence_id.clone(),
            sequence_name: runner.sequence.name().to_string(),
            correlation_id: runner.key.correlation_id.clone(),
        });

        let policy = inner.config.failure_policy;
        let mut reports = Vec::with_capacity(runner.sequence.movements.len());
        let mut first_error: Option<ConductorError> = None;
        let mut cancelled = false;

        for (index, movement) in runner.sequence.movements.iter().enumerate() {
            if runner.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let abort = first_error.is_some()
                && (policy == FailurePolicy::AbortSequence || movement.abort_on_prior_failure);
            if abort {
                tracing::debug!(movement = %movement.name, "skipping movement after prior failure");
                reports.push(MovementReport {
                    name: movement.name.clone(),
                    status: MovementStatus::Skipped,
                    beats_run: 0,
                    beats_skipped: movement.beats.len(),
                    error: None,
                });
                continue;
            }

            let report = runner.run_movement(index, movement).await;
            match report.status {
                MovementStatus::Failed => {
                    if first_error.is_none() {
                        first_error = report.error.clone();
                    }
                }
                MovementStatus::Cancelled => cancelled = true,
                MovementStatus::Completed | MovementStatus::Skipped => {}
            }
            reports.push(report);
            if cancelled {
                break;
            }
        }

        if cancelled {
            let error = self.cancelled_error();
            self.finish(reports, ExecutionState::Failed, Some(error))
        } else if let Some(error) = first_error {
            self.finish(reports, ExecutionState::Failed, Some(error))
        } else {
            self.finish(reports, ExecutionState::Succeeded, None)
        }
    }

    fn cancelled_error(&self) -> ConductorError {
        ConductorError::Cancelled {
            correlation_id: self.runner.key.correlation_id.clone(),
        }
    }

    /// Moves the record to its terminal state, reports the outcome and runs
    /// the callback.
    fn finish(
        &mut self,
        movements: Vec<MovementReport>,
        state: ExecutionState,
        error: Option<ConductorError>,
    ) -> ExecutionOutcome {
        let runner = &self.runner;
        let inner = &runner.conductor.inner;
        let duration = self.started.elapsed();
        let baton = runner.baton.to_value().unwrap_or(Value::Null);

        let reason = error.as_ref().map(ToString::to_string);
        if let Err(err) = inner.records.finish(runner.execution_id, state, reason) {
            tracing::warn!(key = %runner.key, error = %err, "execution record unavailable");
        }

        let event = match &error {
            None => {
                inner.stats.sequence_succeeded();
                tracing::info!(
                    plugin_id = %runner.key.plugin_id,
                    sequence = %runner.sequence.name(),
                    correlation_id = %runner.key.correlation_id,
                    duration_ms = duration.as_millis() as u64,
                    "sequence completed"
                );
                ConductorEvent::SequenceCompleted {
                    execution_id: runner.execution_id,
                    plugin_id: runner.key.plugin_id.clone(),
                    sequence_id: runner.key.sequence_id.clone(),
                    correlation_id: runner.key.correlation_id.clone(),
                    duration_ms: duration.as_millis() as u64,
                }
            }
            Some(err) if err.is_cancelled() => {
                if self.running {
                    inner.stats.sequence_cancelled();
                } else {
                    inner.stats.queued_cancelled();
                }
                tracing::info!(
                    plugin_id = %runner.key.plugin_id,
                    sequence = %runner.sequence.name(),
                    correlation_id = %runner.key.correlation_id,
                    "sequence cancelled"
                );
                ConductorEvent::SequenceCancelled {
                    execution_id: runner.execution_id,
                    plugin_id: runner.key.plugin_id.clone(),
                    sequence_id: runner.key.sequence_id.clone(),
                    correlation_id: runner.key.correlation_id.clone(),
                }
            }
            Some(err) => {
                inner.stats.sequence_failed();
                tracing::warn!(
                    plugin_id = %runner.key.plugin_id,
                    sequence = %runner.sequence.name(),
                    correlation_id = %runner.key.correlation_id,
                    error = %err,
                    "sequence failed"
                );
                ConductorEvent::SequenceFailed {
                    execution_id: runner.execution_id,
                    plugin_id: runner.key.plugin_id.clone(),
                    sequence_id: runner.key.sequence_id.clone(),
                    correlation_id: runner.key.correlation_id.clone(),
                    error: err.to_string(),
                }
            }
        };
        runner.conductor.emit(event);

        let outcome = ExecutionOutcome {
            execution_id: runner.execution_id,
            key: runner.key.clone(),
            state,
            baton,
            movements,
            error,
            duration,
        };

        if let Some(callback) = self.callback.take() {
            let result = outcome.clone().into_result();
            if panic::catch_unwind(AssertUnwindSafe(move || callback(result))).is_err() {
                tracing::warn!(key = %runner.key, "play callback panicked");
            }
        }

        outcome
    }
}

impl BeatRunner {
    async fn run_movement(&self, index: usize, movement: &ResolvedMovement) -> MovementReport {
        let mut pending: Vec<PendingBeat> = Vec::new();
        let mut failure: Option<ConductorError> = None;
        let mut beats_run = 0;
        let mut beats_skipped = 0;
        let mut cancelled = false;

        for (beat_index, resolved) in movement.beats.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                beats_skipped = movement.beats.len() - beat_index;
                break;
            }
            self.conductor
                .inner
                .records
                .set_position(self.execution_id, index, beat_index);

            let result = match resolved.beat.timing {
                BeatTiming::Immediate => self.run_beat(index, beat_index).await.map(|_| ()),
                BeatTiming::Synchronized => match join_pending(&mut pending).await {
                    Ok(()) => self.run_beat(index, beat_index).await.map(|_| ()),
                    Err(err) => Err(err),
                },
                BeatTiming::Delayed => {
                    pending.push(self.schedule_beat(index, beat_index));
                    Ok(())
                }
            };
            beats_run += 1;

            if let Err(err) = result {
                failure = Some(err);
                beats_skipped = movement.beats.len() - beat_index - 1;
                break;
            }
        }

        // Deferred beats always finish before the movement does.
        if let Err(err) = join_pending(&mut pending).await {
            failure.get_or_insert(err);
        }

        let status = if let Some(err) = &failure {
            tracing::error!(
                plugin_id = %self.key.plugin_id,
                sequence = %self.sequence.name(),
                movement = %movement.name,
                correlation_id = %self.key.correlation_id,
                skipped = beats_skipped,
                error = %err,
                "movement failed"
            );
            self.conductor.emit(ConductorEvent::MovementFailed {
                execution_id: self.execution_id,
                sequence_id: self.key.sequence_id.clone(),
                movement: movement.name.clone(),
                skipped_beats: beats_skipped,
            });
            MovementStatus::Failed
        } else if cancelled {
            MovementStatus::Cancelled
        } else {
            MovementStatus::Completed
        };

        MovementReport {
            name: movement.name.clone(),
            status,
            beats_run,
            beats_skipped,
            error: failure,
        }
    }

    fn schedule_beat(&self, movement: usize, beat: usize) -> PendingBeat {
        let runner = self.clone();
        let (tx, rx) = oneshot::channel();
        let number = self.resolved(movement, beat).beat.beat;
        let deferred = self
            .conductor
            .inner
            .scheduler
            .schedule_after_current_turn(Box::pin(async move {
                let result = runner.run_beat(movement, beat).await;
                let _ = tx.send(result);
            }));
        PendingBeat {
            beat: number,
            deferred,
            result: rx,
        }
    }

    fn resolved(&self, movement: usize, beat: usize) -> &ResolvedBeat {
        &self.sequence.movements[movement].beats[beat]
    }

    /// Runs one beat: snapshot, invoke, snapshot, diff. Returns the changed
    /// top-level keys.
    async fn run_beat(&self, movement_index: usize, beat_index: usize) -> Result<Vec<String>> {
        let movement = &self.sequence.movements[movement_index];
        let resolved = &movement.beats[beat_index];
        let beat = &resolved.beat;
        let inner = &self.conductor.inner;

        let diff_context = DiffContext {
            plugin_id: self.key.plugin_id.clone(),
            sequence: self.sequence.name().to_string(),
            movement: movement.name.clone(),
            event: beat.event.clone(),
            beat: beat.beat,
            handler: beat.handler.name.clone(),
            correlation_id: self.key.correlation_id.clone(),
        };

        self.conductor.emit(ConductorEvent::BeatStarted {
            execution_id: self.execution_id,
            sequence_id: self.key.sequence_id.clone(),
            movement: movement.name.clone(),
            beat: beat.beat,
            event: beat.event.clone(),
            handler: beat.handler.name.clone(),
        });

        let before = self.baton.snapshot();
        let result = invoke_guarded(&resolved.handler, &self.baton, self.context(movement, resolved)).await;
        let after = self.baton.snapshot();
        inner.stats.beat_executed();

        let changed = match (&before, &after) {
            (Ok(before), Ok(after)) if inner.config.log_baton_diffs => {
                let changes = baton::log_diff(&diff_context, before, after);
                [changes.added, changes.removed, changes.updated].concat()
            }
            (Ok(before), Ok(after)) => {
                let changes = baton::diff(before, after);
                [changes.added, changes.removed, changes.updated].concat()
            }
            _ => Vec::new(),
        };

        match result {
            Ok(()) => {
                self.conductor.emit(ConductorEvent::BeatCompleted {
                    execution_id: self.execution_id,
                    sequence_id: self.key.sequence_id.clone(),
                    movement: movement.name.clone(),
                    beat: beat.beat,
                    event: beat.event.clone(),
                    changed_keys: changed.clone(),
                });
                Ok(changed)
            }
            Err(source) => {
                inner.stats.handler_failed();
                let error = ConductorError::HandlerExecution {
                    sequence: self.sequence.name().to_string(),
                    movement: movement.name.clone(),
                    beat: beat.beat,
                    event: beat.event.clone(),
                    handler: beat.handler.name.clone(),
                    correlation_id: self.key.correlation_id.clone(),
                    source: Arc::from(source),
                };
                tracing::error!(
                    plugin_id = %self.key.plugin_id,
                    sequence = %self.sequence.name(),
                    movement = %movement.name,
                    beat = beat.beat,
                    event = %beat.event,
                    handler = %beat.handler.name,
                    correlation_id = %self.key.correlation_id,
                    error = %error,
                    "beat handler failed"
                );
                self.conductor.emit(ConductorEvent::BeatFailed {
                    execution_id: self.execution_id,
                    sequence_id: self.key.sequence_id.clone(),
                    movement: movement.name.clone(),
                    beat: beat.beat,
                    event: beat.event.clone(),
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    fn context(&self, movement: &ResolvedMovement, resolved: &ResolvedBeat) -> BeatContext {
        let beat = &resolved.beat;
        let info = BeatInfo {
            plugin_id: self.key.plugin_id.clone(),
            sequence_id: self.key.sequence_id.clone(),
            sequence_name: self.sequence.name().to_string(),
            movement: movement.name.clone(),
            beat: beat.beat,
            event: beat.event.clone(),
            handler: beat.handler.name.clone(),
            kind: beat.kind,
            timing: beat.timing,
            correlation_id: self.key.correlation_id.clone(),
            execution_id: self.execution_id.to_string(),
        };
        BeatContext::new(
            info,
            self.baton.clone(),
            self.sequence.configuration.clone(),
            self.conductor.inner.collaborators.clone(),
            Some(self.conductor.clone()),
            self.cancel.clone(),
        )
    }
}

/// Waits for every deferred beat and returns the first failure.
async fn join_pending(pending: &mut Vec<PendingBeat>) -> Result<()> {
    let mut first_error = None;
    for beat in pending.drain(..) {
        let completed = beat.deferred.join().await;
        let outcome = match beat.result.await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(ConductorError::msg(format!(
                "delayed beat {} was dropped before it completed",
                beat.beat
            ))),
        };
        if !completed {
            tracing::warn!(beat = beat.beat, "deferred work did not signal completion");
        }
        if let Err(err) = outcome {
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Invokes a handler, turning panics into handler errors.
async fn invoke_guarded(handler: &Handler, baton: &BatonHandle, context: BeatContext) -> HandlerResult {
    let future = match panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(baton, context))) {
        Ok(future) => future,
        Err(payload) => return Err(panic_message(payload).into()),
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(panic_message(payload).into()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {detail}")
}
