//! Wires stages into a directed chain of queues between worker pools and
//! owns drain-aware shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::config::{CrawlConfig, Defaults, PoolConfig};
use crate::frontier::{reaper_task, Frontier};
use crate::politeness::PolitenessGovernor;
use crate::queue::StageQueue;
use crate::worker::{FrontierProcessor, Outputs, QueueProcessor, WorkerPool};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    NoStages,

    #[error("first stage '{0}' must be frontier-bound")]
    FirstStageNotFrontier(String),

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("stage '{stage}' routes to unknown output '{output}'")]
    UnknownOutput { stage: String, output: String },
}

enum StageKind<M> {
    Frontier(Arc<dyn FrontierProcessor<M>>),
    Queue(Arc<dyn QueueProcessor<M>>),
}

struct StageDef<M> {
    name: String,
    workers: usize,
    kind: StageKind<M>,
    outputs: Vec<String>,
}

/// Ordered stage declarations, validated at `build`.
pub struct PipelineBuilder<M> {
    stages: Vec<StageDef<M>>,
    pool_config: PoolConfig,
}

impl<M: Send + 'static> Default for PipelineBuilder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + 'static> PipelineBuilder<M> {
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            pool_config: PoolConfig::default(),
        }
    }

    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Declare the frontier-bound first stage.
    pub fn frontier_stage(
        mut self,
        name: &str,
        workers: usize,
        processor: Arc<dyn FrontierProcessor<M>>,
        outputs: &[&str],
    ) -> Self {
        self.stages.push(StageDef {
            name: name.to_string(),
            workers,
            kind: StageKind::Frontier(processor),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    /// Declare a downstream stage fed by the queue named after it.
    pub fn stage(
        mut self,
        name: &str,
        workers: usize,
        processor: Arc<dyn QueueProcessor<M>>,
        outputs: &[&str],
    ) -> Self {
        self.stages.push(StageDef {
            name: name.to_string(),
            workers,
            kind: StageKind::Queue(processor),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn build(
        self,
        frontier: Arc<Frontier>,
        governor: Arc<PolitenessGovernor>,
        target_fn: Arc<dyn Fn(&str) -> String + Send + Sync>,
        crawl: &CrawlConfig,
    ) -> Result<Pipeline<M>, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }
        if !matches!(self.stages[0].kind, StageKind::Frontier(_)) {
            return Err(PipelineError::FirstStageNotFrontier(
                self.stages[0].name.clone(),
            ));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(PipelineError::DuplicateStage(stage.name.clone()));
            }
        }

        // Each queue-bound stage gets one input queue, keyed by its name.
        let mut queues: HashMap<String, StageQueue<M>> = HashMap::new();
        for stage in self.stages.iter().skip(1) {
            queues.insert(stage.name.clone(), StageQueue::bounded(crawl.queue_capacity));
        }

        for stage in &self.stages {
            for output in &stage.outputs {
                if !queues.contains_key(output) {
                    return Err(PipelineError::UnknownOutput {
                        stage: stage.name.clone(),
                        output: output.clone(),
                    });
                }
            }
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Pipeline {
            frontier,
            governor,
            target_fn,
            pool_config: self.pool_config,
            stages: self.stages,
            queues,
            pools: Vec::new(),
            outputs: Vec::new(),
            reaper: None,
            shutdown_tx,
        })
    }
}

/// Outcome of `shutdown`: what finished, what was abandoned. Returned to the
/// caller so an operator can assess run health without reading logs.
#[derive(Debug, Clone)]
pub struct DrainReport {
    pub done: usize,
    pub failed: usize,
    pub pending: usize,
    pub in_flight: usize,
    /// Messages still sitting in each inter-stage queue at the deadline.
    pub undrained: HashMap<String, usize>,
    /// Messages a stage discarded at push time because the target queue was
    /// already closed or unwired, keyed by the producing stage.
    pub dropped: HashMap<String, u64>,
    /// True when everything drained within the grace period.
    pub clean: bool,
}

impl std::fmt::Display for DrainReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stuck: usize = self.undrained.values().sum();
        let dropped: u64 = self.dropped.values().sum();
        write!(
            f,
            "Drain: {} done, {} failed, {} pending, {} in-flight, {} queued, {} dropped ({})",
            self.done,
            self.failed,
            self.pending,
            self.in_flight,
            stuck,
            dropped,
            if self.clean { "clean" } else { "timed out" }
        )
    }
}

pub struct Pipeline<M> {
    frontier: Arc<Frontier>,
    governor: Arc<PolitenessGovernor>,
    target_fn: Arc<dyn Fn(&str) -> String + Send + Sync>,
    pool_config: PoolConfig,
    stages: Vec<StageDef<M>>,
    queues: HashMap<String, StageQueue<M>>,
    pools: Vec<WorkerPool>,
    /// Per-stage output handles, kept so the drain report can read each
    /// stage's dropped-message counter.
    outputs: Vec<(String, Outputs<M>)>,
    reaper: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<M: Send + 'static> Pipeline<M> {
    pub fn frontier(&self) -> Arc<Frontier> {
        Arc::clone(&self.frontier)
    }

    /// Spawn one worker pool per stage plus the lease reaper.
    pub fn start(&mut self) {
        if !self.pools.is_empty() {
            tracing::warn!("pipeline already started");
            return;
        }

        for stage in &self.stages {
            let mut config = self.pool_config.clone();
            if stage.workers > 0 {
                config.workers = stage.workers;
            }

            let outputs = Outputs::new(
                stage
                    .outputs
                    .iter()
                    .filter_map(|name| {
                        self.queues.get(name).map(|q| (name.clone(), q.clone()))
                    })
                    .collect(),
            );
            self.outputs.push((stage.name.clone(), outputs.clone()));

            let pool = match &stage.kind {
                StageKind::Frontier(processor) => WorkerPool::spawn_frontier_stage(
                    &stage.name,
                    config,
                    Arc::clone(&self.frontier),
                    Arc::clone(&self.governor),
                    Arc::clone(&self.target_fn),
                    Arc::clone(processor),
                    outputs,
                    self.shutdown_tx.subscribe(),
                ),
                StageKind::Queue(processor) => {
                    let input = self
                        .queues
                        .get(&stage.name)
                        .cloned()
                        .unwrap_or_else(|| StageQueue::bounded(1));
                    WorkerPool::spawn_queue_stage(
                        &stage.name,
                        config,
                        input,
                        Arc::clone(&self.frontier),
                        Arc::clone(processor),
                        outputs,
                        self.shutdown_tx.subscribe(),
                    )
                }
            };

            tracing::info!(stage = %pool.name(), "worker pool started");
            self.pools.push(pool);
        }

        self.reaper = Some(tokio::spawn(reaper_task(
            Arc::clone(&self.frontier),
            Duration::from_secs(Defaults::REAPER_INTERVAL_SECS),
            self.shutdown_tx.subscribe(),
        )));
    }

    /// Drain-aware shutdown: close admissions, let in-flight work finish
    /// within `grace`, then stop workers and report what was left.
    pub async fn shutdown(mut self, grace: Duration) -> DrainReport {
        self.frontier.close_admissions();
        tracing::info!(grace_secs = grace.as_secs_f64(), "shutdown: draining");

        let deadline = Instant::now() + grace;
        let poll = Duration::from_millis(Defaults::DRAIN_POLL_MS);
        let mut clean = false;

        loop {
            let queues_empty = self.queues.values().all(|q| q.is_empty());
            if self.frontier.is_drained() && queues_empty {
                clean = true;
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(poll).await;
        }

        // Stop the workers and close the queues; anything still queued is
        // counted, not silently dropped.
        let _ = self.shutdown_tx.send(true);
        for queue in self.queues.values() {
            queue.close();
        }

        let join_grace = Duration::from_secs(5);
        for pool in &mut self.pools {
            if tokio::time::timeout(join_grace, pool.join()).await.is_err() {
                tracing::warn!(stage = %pool.name(), "pool did not stop in time, aborting");
                pool.abort_all();
            }
        }
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }

        let mut undrained = HashMap::new();
        for (name, queue) in &self.queues {
            let left = queue.drain_remaining().await;
            if left > 0 {
                undrained.insert(name.clone(), left);
            }
        }

        let mut dropped = HashMap::new();
        for (name, outputs) in &self.outputs {
            let count = outputs.dropped_count();
            if count > 0 {
                dropped.insert(name.clone(), count);
            }
        }

        let counts = self.frontier.counts();
        let report = DrainReport {
            done: counts.done,
            failed: counts.failed,
            pending: counts.pending,
            in_flight: counts.in_flight,
            undrained,
            dropped,
            clean: clean && counts.in_flight == 0,
        };

        tracing::info!(%report, metrics = %self.frontier.metrics().snapshot(), "shutdown complete");
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrontierConfig;
    use crate::fingerprint::{host_target, UrlFingerprint};
    use crate::store::RecordStore;
    use crate::worker::{ProcessError, StageOutput};
    use crate::{config::PolitenessConfig, frontier::WorkItem};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Noop;

    #[async_trait]
    impl FrontierProcessor<String> for Noop {
        async fn process(&self, _item: WorkItem) -> Result<StageOutput<String>, ProcessError> {
            Ok(StageOutput::empty())
        }
    }

    #[async_trait]
    impl QueueProcessor<String> for Noop {
        async fn process(&self, _msg: String) -> Result<StageOutput<String>, ProcessError> {
            Ok(StageOutput::empty())
        }
    }

    fn fixtures(dir: &TempDir) -> (Arc<Frontier>, Arc<PolitenessGovernor>) {
        let store = Arc::new(RecordStore::open(dir.path()).unwrap());
        let frontier = Arc::new(
            Frontier::open(store, Arc::new(UrlFingerprint), FrontierConfig::default()).unwrap(),
        );
        let governor = Arc::new(PolitenessGovernor::new(PolitenessConfig::default()));
        (frontier, governor)
    }

    #[test]
    fn test_builder_rejects_empty() {
        let dir = TempDir::new().unwrap();
        let (frontier, governor) = fixtures(&dir);

        let result = PipelineBuilder::<String>::new().build(
            frontier,
            governor,
            Arc::new(host_target),
            &CrawlConfig::default(),
        );
        assert!(matches!(result, Err(PipelineError::NoStages)));
    }

    #[test]
    fn test_builder_rejects_queue_first() {
        let dir = TempDir::new().unwrap();
        let (frontier, governor) = fixtures(&dir);

        let result = PipelineBuilder::<String>::new()
            .stage("parse", 1, Arc::new(Noop), &[])
            .build(
                frontier,
                governor,
                Arc::new(host_target),
                &CrawlConfig::default(),
            );
        assert!(matches!(
            result,
            Err(PipelineError::FirstStageNotFrontier(_))
        ));
    }

    #[test]
    fn test_builder_rejects_unknown_output() {
        let dir = TempDir::new().unwrap();
        let (frontier, governor) = fixtures(&dir);

        let result = PipelineBuilder::<String>::new()
            .frontier_stage("fetch", 1, Arc::new(Noop), &["missing"])
            .build(
                frontier,
                governor,
                Arc::new(host_target),
                &CrawlConfig::default(),
            );
        assert!(matches!(result, Err(PipelineError::UnknownOutput { .. })));
    }

    #[test]
    fn test_builder_wires_chain() {
        let dir = TempDir::new().unwrap();
        let (frontier, governor) = fixtures(&dir);

        let pipeline = PipelineBuilder::<String>::new()
            .frontier_stage("fetch", 2, Arc::new(Noop), &["parse"])
            .stage("parse", 1, Arc::new(Noop), &["persist"])
            .stage("persist", 1, Arc::new(Noop), &[])
            .build(
                frontier,
                governor,
                Arc::new(host_target),
                &CrawlConfig::default(),
            )
            .unwrap();

        assert_eq!(pipeline.queues.len(), 2);
        assert!(pipeline.queues.contains_key("parse"));
        assert!(pipeline.queues.contains_key("persist"));
    }
}
