pub mod backoff;
pub mod config;
pub mod fingerprint;
pub mod frontier;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod politeness;
pub mod queue;
pub mod store;
pub mod worker;

// Re-export main types for library usage
pub use config::{CrawlConfig, FrontierConfig, PolitenessConfig, PoolConfig};
pub use fingerprint::{Fingerprint, UrlFingerprint};
pub use frontier::{DispatchGate, Frontier, FrontierStats, WorkItem};
pub use pipeline::{DrainReport, Pipeline, PipelineBuilder, PipelineError};
pub use politeness::PolitenessGovernor;
pub use queue::StageQueue;
pub use store::{FrontierRecord, ItemState, RecordStore, StateCounts, StoreError};
pub use worker::{
    FrontierProcessor, NewItem, Outputs, ProcessError, QueueProcessor, StageOutput, WorkerPool,
};
