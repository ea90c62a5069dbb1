//! `DatabasePool` (C7): one writer queue plus a bounded, semaphore-gated
//! pool of reader queues sharing the same WAL file, so readers never block
//! behind the writer and the writer never blocks behind a reader.
//!
//! Grounded on the reader/writer split in `ouisync`'s `db::Pool` (separate
//! connection pools for reads vs. the single writer, gated by a semaphore)
//! — adapted here from sqlx pools to `rusqlite` connections each pinned to
//! their own worker thread (C5), with the semaphore driven by a dedicated
//! current-thread Tokio runtime the pool owns for its own lifetime so the
//! embedding application never needs to run inside one itself.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::instrument;

use crate::config::{BusyMode, Config, TransactionKind};
use crate::connection::Connection;
use crate::error::{DatabaseError, Error, Result};
use crate::observation::TransactionObserver;
use crate::queue::SerializedQueue;
use crate::statement::StatementArguments;

struct Inner {
    writer: SerializedQueue,
    readers: Vec<SerializedQueue>,
    free_readers: Mutex<VecDeque<usize>>,
    reader_semaphore: Arc<Semaphore>,
    runtime: Runtime,
    reader_count: usize,
}

/// A cheap-to-clone handle to a pool: writer + readers live behind one
/// `Arc`, so a `DatabasePool` can be captured by the `'static` closures the
/// serialized worker and the fetched-records controller hand around.
#[derive(Clone)]
pub struct DatabasePool(Arc<Inner>);

impl DatabasePool {
    /// Opens `path` in WAL mode with `synchronous = NORMAL` (the standard
    /// pairing for a bounded reader pool: durability on `PRAGMA wal_checkpoint`
    /// boundaries, not on every commit) and spins up one writer plus
    /// `reader_count` reader queues.
    #[instrument(skip(config))]
    pub fn open(path: impl Into<String>, config: Config, reader_count: usize) -> Result<Self> {
        let path = path.into();
        assert!(reader_count > 0, "a pool needs at least one reader");

        let writer = SerializedQueue::open(path.clone(), config.clone())?;
        writer.run_sync(|conn| {
            conn.execute("PRAGMA journal_mode = WAL", StatementArguments::none())?;
            conn.execute("PRAGMA synchronous = NORMAL", StatementArguments::none())
        })??;

        let mut reader_config = config.clone();
        reader_config.read_only = true;
        // A reader blocking on a busy WAL read should retry briefly rather
        // than surface SQLITE_BUSY immediately, unless the caller already
        // configured something more specific.
        if matches!(reader_config.busy_mode, BusyMode::ImmediateError) {
            reader_config.busy_mode = BusyMode::Timeout(std::time::Duration::from_secs(5));
        }

        let mut readers = Vec::with_capacity(reader_count);
        for i in 0..reader_count {
            let mut this_reader_config = reader_config.clone();
            this_reader_config.label = reader_config
                .label
                .clone()
                .map(|l| format!("{l}-reader-{i}"))
                .or_else(|| Some(format!("reader-{i}")));
            readers.push(SerializedQueue::open(path.clone(), this_reader_config)?);
        }

        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|err| Error::Database(DatabaseError::new(-1, Some(err.to_string()))))?;

        Ok(Self(Arc::new(Inner {
            writer,
            readers,
            free_readers: Mutex::new((0..reader_count).collect()),
            reader_semaphore: Arc::new(Semaphore::new(reader_count)),
            runtime,
            reader_count,
        })))
    }

    pub fn reader_count(&self) -> usize {
        self.0.reader_count
    }

    fn acquire_reader(&self) -> Result<PooledReader> {
        let permit = self
            .0
            .runtime
            .block_on(self.0.reader_semaphore.clone().acquire_owned())
            .map_err(|err| Error::Database(DatabaseError::new(-1, Some(err.to_string()))))?;
        let index = self
            .0
            .free_readers
            .lock()
            .pop_front()
            .expect("a semaphore permit implies a free reader slot");
        Ok(PooledReader {
            pool: self.clone(),
            index,
            _permit: permit,
        })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn write<T: Send + 'static>(&self, f: impl FnOnce(&Connection) -> Result<T> + Send + 'static) -> Result<T> {
        self.0.writer.run_sync(f)?
    }

    pub fn write_async(&self, f: impl FnOnce(&Connection) + Send + 'static) -> Result<()> {
        self.0.writer.run_async(f)
    }

    pub(crate) fn add_writer_observer(&self, observer: Arc<dyn TransactionObserver>) -> Result<()> {
        self.0.writer.run_sync(move |conn| {
            conn.add_observer(&observer);
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Acquires a reader and runs `f` inside its own `DEFERRED` transaction,
    /// so multiple statements in `f` see one consistent snapshot.
    pub fn read<T: Send + 'static>(&self, f: impl FnOnce(&Connection) -> Result<T> + Send + 'static) -> Result<T> {
        let reader = self.acquire_reader()?;
        let index = reader.index;
        self.0.readers[index].run_sync(move |conn| {
            let _reader = reader;
            conn.in_transaction(TransactionKind::Deferred, || f(conn))
        })?
    }

    /// Same as `read`, but without wrapping a transaction around `f` —
    /// isolation is only what a single statement gets for free.
    pub fn read_nonisolated<T: Send + 'static>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T> + Send + 'static,
    ) -> Result<T> {
        let reader = self.acquire_reader()?;
        let index = reader.index;
        self.0.readers[index].run_sync(move |conn| {
            let _reader = reader;
            f(conn)
        })?
    }

    /// The read-from-write handoff: acquires a reader, begins a `DEFERRED`
    /// transaction on it (which, against a WAL writer that is mid-commit,
    /// captures the snapshot as of just before that commit or just after,
    /// but never a torn view), and signals the caller — who is typically
    /// the writer itself, reacting to its own `did_commit` — the instant
    /// that snapshot is captured. `f` then runs to completion on the reader
    /// while the writer is free to continue; its result reaches `on_complete`
    /// asynchronously, also on the reader's worker thread.
    pub fn read_from_write<T: Send + 'static>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T> + Send + 'static,
        on_complete: impl FnOnce(Result<T>) + Send + 'static,
    ) -> Result<()> {
        let reader = self.acquire_reader()?;
        let index = reader.index;
        let (isolated_tx, isolated_rx) = std::sync::mpsc::channel::<Result<()>>();

        self.0.readers[index].run_async(move |conn| {
            let _reader = reader;
            match conn.begin(TransactionKind::Deferred) {
                Ok(()) => {
                    let _ = isolated_tx.send(Ok(()));
                }
                Err(err) => {
                    let _ = isolated_tx.send(Err(err));
                    return;
                }
            }
            let result = f(conn);
            let _ = conn.commit();
            on_complete(result);
        })?;

        isolated_rx
            .recv()
            .map_err(|_| Error::Database(DatabaseError::new(-1, Some("reader worker is gone".to_string()))))?
    }

    // ------------------------------------------------------------------
    // Functions, collations, memory pressure
    // ------------------------------------------------------------------

    /// Registers a scalar function on the writer and every reader, present
    /// and future statements alike (the pool's readers are fixed at open
    /// time, so "future" here just means every reader in this pool).
    pub fn create_scalar_function<F>(&self, name: &str, arg_count: i32, deterministic: bool, function: F) -> Result<()>
    where
        F: Fn(&rusqlite::functions::Context<'_>) -> rusqlite::Result<crate::value::DatabaseValue>
            + Send
            + Sync
            + Clone
            + 'static,
    {
        let name = name.to_string();
        {
            let name = name.clone();
            let function = function.clone();
            self.0
                .writer
                .run_sync(move |conn| conn.create_scalar_function(&name, arg_count, deterministic, function))??;
        }
        for reader in &self.0.readers {
            let name = name.clone();
            let function = function.clone();
            reader.run_sync(move |conn| conn.create_scalar_function(&name, arg_count, deterministic, function))??;
        }
        Ok(())
    }

    pub fn create_collation<F>(&self, name: &str, compare: F) -> Result<()>
    where
        F: Fn(&str, &str) -> std::cmp::Ordering + Send + Sync + Clone + 'static,
    {
        let name = name.to_string();
        {
            let name = name.clone();
            let compare = compare.clone();
            self.0.writer.run_sync(move |conn| conn.create_collation(&name, compare))??;
        }
        for reader in &self.0.readers {
            let name = name.clone();
            let compare = compare.clone();
            reader.run_sync(move |conn| conn.create_collation(&name, compare))??;
        }
        Ok(())
    }

    /// Releases cached pages/statements on the writer and every reader.
    pub fn release_memory(&self) -> Result<()> {
        self.0.writer.run_sync(|conn| conn.release_memory())??;
        for reader in &self.0.readers {
            reader.run_sync(|conn| conn.release_memory())??;
        }
        Ok(())
    }
}

/// A reader checked out of the pool's free list. Returns its slot and
/// semaphore permit to the pool when dropped.
struct PooledReader {
    pool: DatabasePool,
    index: usize,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PooledReader {
    fn drop(&mut self) {
        self.pool.0.free_readers.lock().push_back(self.index);
    }
}
