/// 有界队列 + 固定工作线程的转换线程池
pub mod pool;

pub use pool::{Job, PoolError, WorkerPool};
