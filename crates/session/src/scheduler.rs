//! Debounced, generation-tagged execution.
//!
//! Every `schedule` call bumps the generation and restarts a single debounce
//! timer. When the timer fires, the job runs as a separate task so a later
//! `schedule` or `clear` never aborts a call already in flight; its result
//! is instead compared against the current generation on arrival and
//! dropped if superseded.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use drilldown_core::DrilldownResult;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::state_machine::{ExecutionStateMachine, ExecutionStatus};

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot<O> {
    pub status: ExecutionStatus,
    pub generation: u64,
    /// Generation that produced `output` or `error`.
    pub completed_generation: Option<u64>,
    pub output: Option<O>,
    pub error: Option<String>,
}

struct SchedulerState<O> {
    machine: ExecutionStateMachine,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    completed_generation: Option<u64>,
    output: Option<O>,
    error: Option<String>,
}

impl<O> SchedulerState<O> {
    fn move_to(&mut self, to: ExecutionStatus) {
        if let Err(e) = self.machine.transition(to) {
            warn!(error = %e, "Forcing execution status");
            self.machine.state = to;
        }
    }
}

struct Inner<O> {
    state: Mutex<SchedulerState<O>>,
    status_tx: watch::Sender<ExecutionStatus>,
}

impl<O> Inner<O> {
    /// Callers hold the state lock so the channel never disagrees with the
    /// state machine.
    fn publish(&self, status: ExecutionStatus) {
        self.status_tx.send_replace(status);
    }
}

pub struct ExecutionScheduler<O> {
    debounce: Duration,
    inner: Arc<Inner<O>>,
}

impl<O> Clone for ExecutionScheduler<O> {
    fn clone(&self) -> Self {
        Self {
            debounce: self.debounce,
            inner: self.inner.clone(),
        }
    }
}

impl<O> std::fmt::Debug for ExecutionScheduler<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ExecutionScheduler")
            .field("debounce", &self.debounce)
            .field("status", &state.machine.state)
            .field("generation", &state.generation)
            .finish()
    }
}

impl<O> ExecutionScheduler<O>
where
    O: Clone + Send + 'static,
{
    pub fn new(debounce: Duration) -> Self {
        let (status_tx, _) = watch::channel(ExecutionStatus::Idle);
        Self {
            debounce,
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState {
                    machine: ExecutionStateMachine::new(),
                    generation: 0,
                    timer: None,
                    completed_generation: None,
                    output: None,
                    error: None,
                }),
                status_tx,
            }),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// Restarts the debounce window with `job` as the pending execution and
    /// returns the generation it will run under. Must be called inside a
    /// tokio runtime.
    pub fn schedule<F, Fut>(&self, job: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = DrilldownResult<O>> + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        let generation = state.generation;
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }
        state.move_to(ExecutionStatus::Debouncing);

        let inner = self.inner.clone();
        let debounce = self.debounce;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            {
                let mut state = inner.state.lock();
                if state.generation != generation {
                    return;
                }
                state.timer = None;
                let next = if state.output.is_some() {
                    ExecutionStatus::Refreshing
                } else {
                    ExecutionStatus::Loading
                };
                state.move_to(next);
                inner.publish(next);
            }
            debug!(generation, "Debounce elapsed, executing");
            metrics::counter!("drilldown.executions").increment(1);

            let inner = inner.clone();
            tokio::spawn(async move {
                let result = job().await;
                complete(&inner, generation, result);
            });
        }));
        self.inner.publish(ExecutionStatus::Debouncing);
        generation
    }

    /// Cancels any pending timer, invalidates in-flight work and resets to
    /// idle with no output.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.output = None;
        state.error = None;
        state.completed_generation = None;
        state.machine.reset();
        self.inner.publish(ExecutionStatus::Idle);
    }

    pub fn status(&self) -> ExecutionStatus {
        self.inner.state.lock().machine.state
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    pub fn output(&self) -> Option<O> {
        self.inner.state.lock().output.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }

    pub fn snapshot(&self) -> ExecutionSnapshot<O> {
        let state = self.inner.state.lock();
        ExecutionSnapshot {
            status: state.machine.state,
            generation: state.generation,
            completed_generation: state.completed_generation,
            output: state.output.clone(),
            error: state.error.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ExecutionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Waits until nothing is pending or in flight and returns the snapshot.
    pub async fn settled(&self) -> ExecutionSnapshot<O> {
        let mut rx = self.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|s| s.is_settled()).await;
        self.snapshot()
    }
}

fn complete<O>(inner: &Inner<O>, generation: u64, result: DrilldownResult<O>) {
    let mut state = inner.state.lock();
    if state.generation != generation {
        drop(state);
        metrics::counter!("drilldown.stale_results").increment(1);
        debug!(generation, "Dropping stale result");
        return;
    }
    let status = match result {
        Ok(output) => {
            state.output = Some(output);
            state.error = None;
            ExecutionStatus::Success
        }
        Err(e) => {
            warn!(generation, error = %e, "Execution failed");
            state.error = Some(e.to_string());
            ExecutionStatus::Error
        }
    };
    state.completed_generation = Some(generation);
    state.move_to(status);
    inner.publish(status);
}
