pub mod pool;

pub use pool::{PoolStats, WorkerPool};
