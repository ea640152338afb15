pub mod adapter;
pub mod batch;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod metrics;
mod retry;
pub mod stream;

pub use adapter::{
    ArenaAdapter, BatchAdapter, LogStatusCallback, PollPage, PollRequest, RecordSink,
    StatusCallback, StreamAdapter, StreamConnection, StreamEvent,
};
pub use batch::{BatchCollector, CollectionJob, JobReport, JobStatus};
pub use dedup::{content_hash, normalize, Admission, Deduplicator};
pub use engine::Engine;
pub use error::CollectError;
pub use metrics::{ArenaMetrics, MetricsSnapshot};
pub use stream::{SessionState, StreamingSupervisor};
