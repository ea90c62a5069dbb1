//! `DatabaseQueue` (C6): every read and write goes through the same
//! serialized queue. No reader/writer split, no WAL requirement — the
//! simplest façade, suited to small local databases where a dedicated
//! reader pool would be pure overhead.

use crate::config::Config;
use crate::connection::Connection;
use crate::error::Result;
use crate::queue::SerializedQueue;

pub struct DatabaseQueue {
    queue: SerializedQueue,
}

impl DatabaseQueue {
    pub fn open(path: impl Into<String>, config: Config) -> Result<Self> {
        Ok(Self {
            queue: SerializedQueue::open(path.into(), config)?,
        })
    }

    pub fn open_in_memory(config: Config) -> Result<Self> {
        Ok(Self {
            queue: SerializedQueue::open_in_memory(config)?,
        })
    }

    /// Runs `f` against the connection and blocks until it completes.
    /// Reads and writes are identical here: the single queue already
    /// serializes everything, so there is no isolation to add on top.
    pub fn write<T: Send + 'static>(&self, f: impl FnOnce(&Connection) -> Result<T> + Send + 'static) -> Result<T> {
        self.queue.run_sync(f)?
    }

    pub fn read<T: Send + 'static>(&self, f: impl FnOnce(&Connection) -> Result<T> + Send + 'static) -> Result<T> {
        self.queue.run_sync(f)?
    }

    /// Schedules `f` without waiting for it; errors from `f` are silently
    /// dropped, matching the writer's async entry point in the pool façade.
    pub fn write_async(&self, f: impl FnOnce(&Connection) + Send + 'static) -> Result<()> {
        self.queue.run_async(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::StatementArguments;

    #[test]
    fn write_then_read_back() {
        let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
        db.write(|conn| {
            conn.execute(
                "CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT)",
                StatementArguments::none(),
            )
        })
        .unwrap();
        db.write(|conn| conn.execute("INSERT INTO t(name) VALUES ('Arthur')", StatementArguments::none()))
            .unwrap();

        let name = db
            .read(|conn| {
                let stmt = match conn.compile("SELECT name FROM t")? {
                    crate::statement::CompiledStatement::Select(s) => s,
                    _ => unreachable!(),
                };
                Ok(conn
                    .fetch_one(&stmt, &StatementArguments::none())?
                    .and_then(|r| r.get_named("name").and_then(|v| v.as_str().map(str::to_string))))
            })
            .unwrap();
        assert_eq!(name.as_deref(), Some("Arthur"));
    }
}
