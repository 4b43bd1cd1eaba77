//! A Tokio-based bounded worker pool.
//!
//! A fixed number of workers pull jobs from one shared, bounded queue and
//! run a caller-supplied async handler for each. Completed jobs can be
//! tallied per worker, and closing the pool waits until every queued job
//! has run and every background task has stopped.

mod config;
mod counter;
mod error;
mod pool;
mod queue;
mod shutdown;
mod worker;

pub use config::PoolConfig;
pub use counter::WorkerCounts;
pub use error::PoolError;
pub use pool::WorkerPool;
pub use queue::JobSender;
pub use worker::WorkerId;
