//! The serialized worker (C5): a plain OS thread with a FIFO channel of
//! boxed jobs — no
//! channel-based actor framework, just `std::thread` + `std::sync::mpsc`.
//!
//! `Worker<T>` is generic over whatever value the thread owns for its
//! whole lifetime: the façades (C6/C7) instantiate it over `Connection`
//! (that's `SerializedQueue`, below); the fetched-records controller (C12)
//! instantiates it over `()` purely for FIFO ordering of its own
//! recompute/dispatch step.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{DatabaseError, Error, Result};

type Job<T> = Box<dyn FnOnce(&T) + Send>;

fn worker_gone() -> Error {
    Error::Database(DatabaseError::new(-1, Some("worker thread is no longer running".to_string())))
}

/// A dedicated thread plus the value it owns, driven by a FIFO job queue.
pub(crate) struct Worker<T> {
    sender: mpsc::Sender<Job<T>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: 'static> Worker<T> {
    /// Spawns the worker thread, runs `init` on it to produce the owned
    /// value, and blocks the caller until `init` has either succeeded or
    /// failed — so a bad `Connection::open` surfaces synchronously to
    /// whoever constructed the queue instead of silently killing the
    /// thread later.
    pub fn spawn(label: Option<String>, init: impl FnOnce() -> Result<T> + Send + 'static) -> Result<Self> {
        let (job_tx, job_rx) = mpsc::channel::<Job<T>>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();

        let mut builder = thread::Builder::new();
        if let Some(label) = &label {
            builder = builder.name(label.clone());
        }
        let handle = builder
            .spawn(move || {
                let value = match init() {
                    Ok(value) => value,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                for job in job_rx {
                    job(&value);
                }
            })
            .map_err(|err| Error::Database(DatabaseError::new(-1, Some(err.to_string()))))?;

        ready_rx.recv().map_err(|_| worker_gone())??;
        Ok(Self {
            sender: job_tx,
            handle: Some(handle),
        })
    }

    /// Runs `f` on the worker and blocks the caller until it returns.
    pub fn run_sync<R: Send + 'static>(&self, f: impl FnOnce(&T) -> R + Send + 'static) -> Result<R> {
        let (result_tx, result_rx) = mpsc::channel::<R>();
        self.sender
            .send(Box::new(move |value: &T| {
                let _ = result_tx.send(f(value));
            }))
            .map_err(|_| worker_gone())?;
        result_rx.recv().map_err(|_| worker_gone())
    }

    /// Schedules `f` to run on the worker without waiting for it.
    pub fn run_async(&self, f: impl FnOnce(&T) + Send + 'static) -> Result<()> {
        self.sender.send(Box::new(f)).map_err(|_| worker_gone())
    }
}

impl<T> Drop for Worker<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Dropping `sender` first closes the channel, so the worker's
            // `for job in job_rx` loop ends and the thread returns on its own.
            let _ = handle.join();
        }
    }
}

/// `Worker<Connection>` — one `sqlite3` handle pinned to one worker thread
/// for its entire lifetime.
pub(crate) struct SerializedQueue {
    worker: Worker<Connection>,
}

impl SerializedQueue {
    pub fn open(path: String, config: Config) -> Result<Self> {
        let label = config.label.clone();
        let worker = Worker::spawn(label, move || Connection::open(&path, config))?;
        Ok(Self { worker })
    }

    pub fn open_in_memory(config: Config) -> Result<Self> {
        let label = config.label.clone();
        let worker = Worker::spawn(label, move || Connection::open_in_memory(config))?;
        Ok(Self { worker })
    }

    pub fn run_sync<R: Send + 'static>(&self, f: impl FnOnce(&Connection) -> R + Send + 'static) -> Result<R> {
        self.worker.run_sync(f)
    }

    pub fn run_async(&self, f: impl FnOnce(&Connection) + Send + 'static) -> Result<()> {
        self.worker.run_async(f)
    }
}
