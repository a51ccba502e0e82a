//! Worker pools: N concurrent tasks per pipeline stage, bound to either the
//! frontier (poll with idle backoff) or an inter-stage queue (timed pop).
//!
//! Processing errors are caught here and converted into frontier state
//! transitions; a single item's failure never terminates a worker.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

use crate::backoff::IdleBackoff;
use crate::config::PoolConfig;
use crate::frontier::{DispatchGate, Frontier, WorkItem};
use crate::politeness::PolitenessGovernor;
use crate::queue::{PopOutcome, StageQueue};

/// Classified processing failure, raised by a stage's `process`.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Retryable condition (network timeout, rate-limited response). The
    /// item returns to Pending with decayed priority.
    #[error("transient: {0}")]
    Transient(String),

    /// Condition that will never succeed (not found, forbidden). The item
    /// is terminally failed.
    #[error("permanent: {0}")]
    Permanent(String),
}

/// New frontier work derived during processing.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub payload: String,
    pub priority: f64,
}

impl NewItem {
    pub fn new(payload: impl Into<String>, priority: f64) -> Self {
        Self {
            payload: payload.into(),
            priority,
        }
    }
}

/// Successful processing result: items fed back to the frontier plus
/// messages routed to named downstream outputs.
#[derive(Debug)]
pub struct StageOutput<M> {
    pub discovered: Vec<NewItem>,
    pub routed: Vec<(String, M)>,
}

impl<M> Default for StageOutput<M> {
    fn default() -> Self {
        Self {
            discovered: Vec::new(),
            routed: Vec::new(),
        }
    }
}

impl<M> StageOutput<M> {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn discover(mut self, item: NewItem) -> Self {
        self.discovered.push(item);
        self
    }

    pub fn route(mut self, output: impl Into<String>, msg: M) -> Self {
        self.routed.push((output.into(), msg));
        self
    }
}

/// Processing step for the frontier-bound (stage 1) pool.
#[async_trait]
pub trait FrontierProcessor<M: Send>: Send + Sync {
    async fn process(&self, item: WorkItem) -> Result<StageOutput<M>, ProcessError>;
}

/// Processing step for queue-bound (downstream) pools.
#[async_trait]
pub trait QueueProcessor<M: Send>: Send + Sync {
    async fn process(&self, msg: M) -> Result<StageOutput<M>, ProcessError>;
}

/// Named downstream queues for one stage.
pub struct Outputs<M> {
    queues: HashMap<String, StageQueue<M>>,
    /// Messages dropped because the target queue was closed or unknown.
    dropped: Arc<crate::metrics::Counter>,
}

impl<M> Clone for Outputs<M> {
    fn clone(&self) -> Self {
        Self {
            queues: self.queues.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<M: Send + 'static> Outputs<M> {
    pub fn new(queues: HashMap<String, StageQueue<M>>) -> Self {
        Self {
            queues,
            dropped: Arc::new(crate::metrics::Counter::new()),
        }
    }

    pub fn none() -> Self {
        Self::new(HashMap::new())
    }

    pub async fn send(&self, output: &str, msg: M) {
        match self.queues.get(output) {
            Some(queue) => {
                if !queue.push(msg).await {
                    self.dropped.inc();
                    tracing::warn!(output, "dropped message for closed queue");
                }
            }
            None => {
                self.dropped.inc();
                tracing::error!(output, "no queue wired for output");
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.get()
    }
}

/// Gate wiring the politeness governor into `Frontier::next_where`: the
/// eligibility check and the dispatch accounting both run under the frontier
/// lock, so no two workers can slip through one budget window.
struct PoliteGate<'a> {
    governor: &'a PolitenessGovernor,
    target_fn: &'a (dyn Fn(&str) -> String + Send + Sync),
}

impl DispatchGate for PoliteGate<'_> {
    fn eligible(&self, payload: &str) -> bool {
        self.governor.may_dispatch(&(self.target_fn)(payload))
    }

    fn committed(&self, payload: &str) {
        self.governor.record_dispatch(&(self.target_fn)(payload));
    }
}

/// Handle over one stage's spawned workers.
pub struct WorkerPool {
    name: String,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn workers that poll the frontier with politeness filtering and
    /// idle backoff. They stop only on the shutdown signal, never on an
    /// empty frontier.
    pub fn spawn_frontier_stage<M: Send + 'static>(
        name: &str,
        config: PoolConfig,
        frontier: Arc<Frontier>,
        governor: Arc<PolitenessGovernor>,
        target_fn: Arc<dyn Fn(&str) -> String + Send + Sync>,
        processor: Arc<dyn FrontierProcessor<M>>,
        outputs: Outputs<M>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut tasks = JoinSet::new();

        for worker_id in 0..config.workers.max(1) {
            let config = config.clone();
            let frontier = Arc::clone(&frontier);
            let governor = Arc::clone(&governor);
            let target_fn = Arc::clone(&target_fn);
            let processor = Arc::clone(&processor);
            let outputs = outputs.clone();
            let shutdown = shutdown.clone();
            let stage = name.to_string();

            tasks.spawn(async move {
                frontier_worker_loop(
                    stage, worker_id, config, frontier, governor, target_fn, processor, outputs,
                    shutdown,
                )
                .await;
            });
        }

        Self {
            name: name.to_string(),
            tasks,
        }
    }

    /// Spawn workers bound to an inter-stage queue. They exit when the
    /// queue is closed and drained, or on the shutdown signal.
    pub fn spawn_queue_stage<M: Send + 'static>(
        name: &str,
        config: PoolConfig,
        input: StageQueue<M>,
        frontier: Arc<Frontier>,
        processor: Arc<dyn QueueProcessor<M>>,
        outputs: Outputs<M>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut tasks = JoinSet::new();

        for worker_id in 0..config.workers.max(1) {
            let config = config.clone();
            let input = input.clone();
            let frontier = Arc::clone(&frontier);
            let processor = Arc::clone(&processor);
            let outputs = outputs.clone();
            let shutdown = shutdown.clone();
            let stage = name.to_string();

            tasks.spawn(async move {
                queue_worker_loop(
                    stage, worker_id, config, input, frontier, processor, outputs, shutdown,
                )
                .await;
            });
        }

        Self {
            name: name.to_string(),
            tasks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for every worker in this pool to stop.
    pub async fn join(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    tracing::error!(pool = %self.name, error = %e, "worker task join error");
                }
            }
        }
    }

    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
    }
}

/// Run one `process` call in its own task so a panic unwinds that task
/// only; the worker maps it to a transient failure and keeps looping. A
/// call exceeding `limit` is aborted and also treated as transient.
async fn run_process<M: Send + 'static>(
    limit: std::time::Duration,
    fut: impl std::future::Future<Output = Result<StageOutput<M>, ProcessError>> + Send + 'static,
) -> Result<StageOutput<M>, ProcessError> {
    let mut handle = tokio::spawn(fut);
    match timeout(limit, &mut handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(ProcessError::Transient(format!("process panicked: {}", e))),
        Err(_) => {
            handle.abort();
            Err(ProcessError::Transient("process timeout".to_string()))
        }
    }
}

/// Sleep out one idle-backoff step, waking early on the shutdown signal.
async fn idle_pause(idle: &mut IdleBackoff, shutdown: &mut watch::Receiver<bool>) {
    let delay = idle.next_delay();
    tokio::select! {
        _ = sleep(delay) => {}
        _ = shutdown.changed() => {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn frontier_worker_loop<M: Send + 'static>(
    stage: String,
    worker_id: usize,
    config: PoolConfig,
    frontier: Arc<Frontier>,
    governor: Arc<PolitenessGovernor>,
    target_fn: Arc<dyn Fn(&str) -> String + Send + Sync>,
    processor: Arc<dyn FrontierProcessor<M>>,
    outputs: Outputs<M>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut idle = IdleBackoff::new(config.idle_backoff_base, config.idle_backoff_max);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let gate = PoliteGate {
            governor: &governor,
            target_fn: target_fn.as_ref(),
        };

        match frontier.next_where(&gate) {
            Ok(Some(item)) => {
                idle.reset();
                let key = item.key.clone();
                let target = (target_fn)(&item.payload);

                let outcome = run_process(config.process_timeout, {
                    let processor = Arc::clone(&processor);
                    async move { processor.process(item).await }
                })
                .await;

                match outcome {
                    Ok(output) => {
                        route_output(&frontier, &outputs, output).await;
                        if let Err(e) = frontier.complete(&key) {
                            tracing::error!(stage = %stage, key, error = %e, "storage error on complete");
                        }
                    }
                    Err(ProcessError::Transient(reason)) => {
                        tracing::warn!(stage = %stage, key, reason, "transient failure");
                        if let Err(e) = frontier.fail(&key, true) {
                            tracing::error!(stage = %stage, key, error = %e, "storage error on fail");
                        }
                    }
                    Err(ProcessError::Permanent(reason)) => {
                        tracing::warn!(stage = %stage, key, reason, "permanent failure");
                        if let Err(e) = frontier.fail(&key, false) {
                            tracing::error!(stage = %stage, key, error = %e, "storage error on fail");
                        }
                    }
                }

                governor.record_completion(&target);
            }
            Ok(None) => {
                // Nothing pending or eligible; back off and recheck.
                idle_pause(&mut idle, &mut shutdown).await;
            }
            Err(e) => {
                tracing::error!(stage = %stage, worker_id, error = %e, "storage error on next, backing off");
                idle_pause(&mut idle, &mut shutdown).await;
            }
        }
    }

    tracing::debug!(stage = %stage, worker_id, "frontier worker stopped");
}

#[allow(clippy::too_many_arguments)]
async fn queue_worker_loop<M: Send + 'static>(
    stage: String,
    worker_id: usize,
    config: PoolConfig,
    input: StageQueue<M>,
    frontier: Arc<Frontier>,
    processor: Arc<dyn QueueProcessor<M>>,
    outputs: Outputs<M>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match input.pop_timeout(config.queue_poll).await {
            PopOutcome::Item(msg) => {
                let outcome = run_process(config.process_timeout, {
                    let processor = Arc::clone(&processor);
                    async move { processor.process(msg).await }
                })
                .await;

                match outcome {
                    Ok(output) => route_output(&frontier, &outputs, output).await,
                    Err(e) => {
                        // Queue messages carry no durable claim to retry;
                        // log and move on.
                        tracing::warn!(stage = %stage, error = %e, "queue item processing failed");
                    }
                }
            }
            PopOutcome::Empty => continue,
            PopOutcome::Closed => {
                tracing::debug!(stage = %stage, worker_id, "input closed and drained");
                break;
            }
        }
    }

    tracing::debug!(stage = %stage, worker_id, "queue worker stopped");
}

async fn route_output<M: Send + 'static>(
    frontier: &Frontier,
    outputs: &Outputs<M>,
    output: StageOutput<M>,
) {
    for item in output.discovered {
        match frontier.admit(&item.payload, item.priority) {
            Ok(_) => {}
            Err(e) => {
                tracing::error!(payload = %item.payload, error = %e, "storage error on admit");
            }
        }
    }
    for (name, msg) in output.routed {
        outputs.send(&name, msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_panicking_process_maps_to_transient() {
        let result: Result<StageOutput<String>, ProcessError> =
            run_process(Duration::from_secs(5), async { panic!("simulated bug") }).await;
        assert!(matches!(result, Err(ProcessError::Transient(_))));
    }

    #[tokio::test]
    async fn test_slow_process_times_out_as_transient() {
        let result: Result<StageOutput<String>, ProcessError> =
            run_process(Duration::from_millis(20), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(StageOutput::empty())
            })
            .await;
        assert!(matches!(result, Err(ProcessError::Transient(_))));
    }

    #[tokio::test]
    async fn test_idle_pause_wakes_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let mut idle = IdleBackoff::new(Duration::from_secs(5), Duration::from_secs(5));

        tx.send(true).unwrap();
        let start = Instant::now();
        idle_pause(&mut idle, &mut rx).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
