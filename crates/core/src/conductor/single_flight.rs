//! Per-key FIFO queue of executions.
//!
//! Every `play()` takes a ticket synchronously. Its execution waits for the
//! completion signal of the previous ticket holder for the same key, so
//! executions sharing a key run strictly one after another in call order.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio::sync::oneshot;

use crate::record::ExecutionKey;

struct Tail {
    ticket: u64,
    done: oneshot::Receiver<()>,
}

#[derive(Default)]
struct Queues {
    tails: HashMap<ExecutionKey, Tail>,
}

#[derive(Clone, Default)]
pub(crate) struct SingleFlight {
    queues: Arc<Mutex<Queues>>,
    next_ticket: Arc<AtomicU64>,
}

impl SingleFlight {
    /// Joins the queue for `key`. Returns the permit to hold while running
    /// and, when another execution is ahead, the signal to wait for.
    pub(crate) fn enqueue(&self, key: &ExecutionKey) -> (FlightPermit, Option<oneshot::Receiver<()>>) {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let predecessor = match self.queues.lock() {
            Ok(mut queues) => queues
                .tails
                .insert(key.clone(), Tail { ticket, done: rx })
                .map(|tail| tail.done),
            Err(_) => None,
        };

        let permit = FlightPermit {
            key: key.clone(),
            ticket,
            done: Some(tx),
            queues: self.queues.clone(),
        };
        (permit, predecessor)
    }

    pub(crate) fn queued_keys(&self) -> usize {
        self.queues.lock().map(|queues| queues.tails.len()).unwrap_or(0)
    }
}

/// Held by a running execution. Dropping it lets the next execution with the
/// same key proceed.
pub(crate) struct FlightPermit {
    key: ExecutionKey,
    ticket: u64,
    done: Option<oneshot::Sender<()>>,
    queues: Arc<Mutex<Queues>>,
}

impl Drop for FlightPermit {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        if let Ok(mut queues) = self.queues.lock() {
            let last = queues
                .tails
                .get(&self.key)
                .is_some_and(|tail| tail.ticket == self.ticket);
            if last {
                queues.tails.remove(&self.key);
            }
        }
    }
}
