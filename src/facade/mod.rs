//! The two database façades built on top of the serialized queue (C5):
//! `DatabaseQueue` (C6), a single queue handling both reads and writes, and
//! `DatabasePool` (C7), a writer queue plus a semaphore-gated pool of reader
//! queues with WAL snapshot isolation.

mod database_pool;
mod database_queue;

pub use database_pool::DatabasePool;
pub use database_queue::DatabaseQueue;
