pub mod error_codes;
pub mod executor;
pub mod handlers;
pub mod model;
pub mod pg_store;
pub mod queue;
pub mod retry;
pub mod store;

pub use error_codes::{ErrorCode, JobError};
pub use executor::{ExecError, Executor, ExecutorConfig};
pub use handlers::{boxed, parse_payload, HandlerOptions, HandlerRegistry, HandlerResult};
pub use model::{Job, JobResult, JobStatus, NewJob};
pub use pg_store::PgStore;
pub use queue::{EnqueueError, QueueConfig, ResultLookup, WorkQueue};
pub use retry::RetryConfig;
pub use store::{JobStore, MemoryStore, StoreError};
