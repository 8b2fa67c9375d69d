//! Persistence, job queue, cache and outbound HTTP for gpuwatch.

pub mod browserless;
pub mod cache;
pub mod http;
pub mod memory;
pub mod pg;
pub mod pg_queue;
pub mod queue;
pub mod store;

pub use browserless::{BrowserlessClient, BrowserlessError};
pub use cache::{CacheBackend, CacheError, MemoryCache, RedisCache};
pub use http::{FetchError, HttpClientConfig, HttpFetcher};
pub use memory::MemoryStore;
pub use pg::PgStore;
pub use pg_queue::PgJobQueue;
pub use queue::{
    wait_for_job, BackoffPolicy, ClaimedJob, EnqueueOptions, JobQueue, JobRecord, JobState,
    MemoryJobQueue, QueueError,
};
pub use store::{
    CatalogStore, PipelineStore, ReadStore, ReconcileTx, StoreError, SubscriptionOutcome,
};

pub const CRATE_NAME: &str = "gpuwatch-storage";
