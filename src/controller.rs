//! Fetched-records controller (C12): tracks a request's result set across
//! commits, recomputing it via `read_from_write` (C7) and reporting the
//! minimal diff — insertions, deletions, moves and updates — to a delegate.
//!
//! The diff itself is the classic two steps: a Wagner-Fischer edit script
//! over row equality, then a "standardize" pass that fuses an insertion and
//! a deletion sharing the same record identity into a single update (same
//! index) or move (different index) event, carrying the old value of every
//! column that actually changed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, instrument};

use crate::connection::Connection;
use crate::error::Result;
use crate::facade::DatabasePool;
use crate::observation::{ChangeEvent, TransactionObserver};
use crate::query::{generate, Query};
use crate::queue::SerializedQueue;
use crate::row::Row;
use crate::statement::{CompiledStatement, StatementArguments};
use crate::value::DatabaseValue;

/// Where a controller's rows come from: either raw SQL with arguments, or a
/// query-builder `Query` (C8), re-rendered fresh on every recompute since it
/// may run against a different connection than the one that built it.
#[derive(Clone)]
pub enum FetchSource {
    Sql(String, StatementArguments),
    Query(Query),
}

fn fetch(source: &FetchSource, conn: &Connection) -> Result<(Vec<Row>, Vec<String>)> {
    let (select, args) = match source {
        FetchSource::Sql(sql, args) => {
            let select = match conn.compile(sql)? {
                CompiledStatement::Select(s) => s,
                CompiledStatement::Update(_) => {
                    return Err(crate::error::DatabaseError::new(
                        -1,
                        Some("fetched-records source must be a SELECT".to_string()),
                    )
                    .into())
                }
            };
            (select, args.clone())
        }
        FetchSource::Query(query) => {
            let generated = generate(query, conn)?;
            let select = match conn.compile(&generated.sql)? {
                CompiledStatement::Select(s) => s,
                CompiledStatement::Update(_) => unreachable!("query-builder output is always a SELECT"),
            };
            (select, StatementArguments::Positional(generated.bindings))
        }
    };
    let rows = conn.fetch_all(&select, &args)?;
    Ok((rows, select.metadata.observed_tables))
}

/// One diff event between the previous and current result set. Indices
/// always refer to the *new* array except `Deletion`, which refers to the
/// old one (there is no new position for a deleted row).
#[derive(Debug, Clone)]
pub enum RecordChange {
    Insertion { index: usize },
    Deletion { index: usize },
    Move { from: usize, to: usize, changes: BTreeMap<String, DatabaseValue> },
    Update { index: usize, changes: BTreeMap<String, DatabaseValue> },
}

/// Implemented by whatever wants to react to a controller's recomputed
/// result set. All methods are optional; `did_change_record` fires once per
/// `RecordChange`, bracketed by one `will_change`/`did_change` pair.
pub trait ControllerDelegate: Send + Sync {
    fn will_change(&self) {}
    #[allow(unused_variables)]
    fn did_change_record(&self, record: &Row, change: &RecordChange) {}
    fn did_change(&self) {}
}

enum RawOp {
    Delete(usize),
    Insert(usize),
}

/// Minimum-edit-distance script transforming `old` into `new`, using row
/// equality as the identity test — standard Wagner-Fischer dynamic
/// programming, O(old.len() * new.len()).
fn edit_script(old: &[Row], new: &[Row]) -> Vec<RawOp> {
    let n = old.len();
    let m = new.len();
    let mut dp = vec![vec![0usize; m + 1]; n + 1];
    for (i, row) in dp.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=m {
        dp[0][j] = j;
    }
    for i in 1..=n {
        for j in 1..=m {
            dp[i][j] = if old[i - 1] == new[j - 1] {
                dp[i - 1][j - 1]
            } else {
                1 + dp[i - 1][j].min(dp[i][j - 1])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j) = (n, m);
    while i > 0 || j > 0 {
        if i > 0 && j > 0 && old[i - 1] == new[j - 1] {
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || dp[i][j - 1] <= dp[i - 1][j]) {
            ops.push(RawOp::Insert(j - 1));
            j -= 1;
        } else {
            ops.push(RawOp::Delete(i - 1));
            i -= 1;
        }
    }
    ops.reverse();
    ops
}

fn field_changes(old: &Row, new: &Row) -> BTreeMap<String, DatabaseValue> {
    let mut changes = BTreeMap::new();
    for (name, old_value) in old.iter() {
        if let Some(new_value) = new.get_named(name) {
            if new_value != old_value {
                changes.insert(name.to_string(), old_value.clone());
            }
        }
    }
    changes
}

/// Fuses insert/delete pairs that share the same record identity into
/// update/move events, leaving everything else as a plain insertion or
/// deletion. Order: unmatched deletions, then unmatched insertions, then
/// fused update/move events — matching the order a UI diff normally wants
/// to apply them in (remove stale rows, add new ones, then adjust survivors).
fn standardize(
    ops: Vec<RawOp>,
    old: &[Row],
    new: &[Row],
    same_record: &(dyn Fn(&Row, &Row) -> bool + Send + Sync),
) -> Vec<RecordChange> {
    let mut deletions = Vec::new();
    let mut insertions = Vec::new();
    for op in ops {
        match op {
            RawOp::Delete(i) => deletions.push(i),
            RawOp::Insert(j) => insertions.push(j),
        }
    }

    let mut matched_del = vec![false; deletions.len()];
    let mut matched_ins = vec![false; insertions.len()];
    let mut fused = Vec::new();
    for (di, &oi) in deletions.iter().enumerate() {
        for (ii, &nj) in insertions.iter().enumerate() {
            if matched_ins[ii] {
                continue;
            }
            if same_record(&old[oi], &new[nj]) {
                matched_del[di] = true;
                matched_ins[ii] = true;
                fused.push((oi, nj));
                break;
            }
        }
    }

    let mut events = Vec::new();
    for (di, &oi) in deletions.iter().enumerate() {
        if !matched_del[di] {
            events.push(RecordChange::Deletion { index: oi });
        }
    }
    for (ii, &nj) in insertions.iter().enumerate() {
        if !matched_ins[ii] {
            events.push(RecordChange::Insertion { index: nj });
        }
    }
    for (oi, nj) in fused {
        let changes = field_changes(&old[oi], &new[nj]);
        if oi == nj {
            events.push(RecordChange::Update { index: nj, changes });
        } else {
            events.push(RecordChange::Move { from: oi, to: nj, changes });
        }
    }
    events
}

struct Shared {
    pool: DatabasePool,
    source: FetchSource,
    same_record: Box<dyn Fn(&Row, &Row) -> bool + Send + Sync>,
    items: Mutex<Vec<Row>>,
    observed_tables: Mutex<Vec<String>>,
    delegate: Mutex<Option<Arc<dyn ControllerDelegate>>>,
    // The controller's own serial queue (C5, instantiated over `()`):
    // guarantees one commit's recompute-and-dispatch fully finishes before
    // the next one starts, even though the actual re-fetch runs on a
    // reader's worker thread via `read_from_write`.
    dispatch: SerializedQueue,
    // Kept alive only so the writer's `Weak` back-reference to it stays
    // resolvable for as long as the controller exists; the writer never
    // holds a strong reference to this bridge.
    observer: Mutex<Option<Arc<dyn TransactionObserver>>>,
}

impl Shared {
    fn apply_diff(self: &Arc<Self>, new_items: Vec<Row>, observed_tables: Vec<String>) {
        *self.observed_tables.lock().unwrap() = observed_tables;
        let old_items = self.items.lock().unwrap().clone();
        let ops = edit_script(&old_items, &new_items);
        let changes = standardize(ops, &old_items, &new_items, self.same_record.as_ref());
        *self.items.lock().unwrap() = new_items.clone();

        if changes.is_empty() {
            return;
        }
        debug!(count = changes.len(), "fetched-records controller dispatching changes");
        let delegate = self.delegate.lock().unwrap().clone();
        let Some(delegate) = delegate else { return };
        delegate.will_change();
        for change in &changes {
            let record = match change {
                RecordChange::Insertion { index } => &new_items[*index],
                RecordChange::Deletion { index } => &old_items[*index],
                RecordChange::Update { index, .. } => &new_items[*index],
                RecordChange::Move { to, .. } => &new_items[*to],
            };
            delegate.did_change_record(record, change);
        }
        delegate.did_change();
    }

    fn schedule_recompute(shared: Arc<Shared>) {
        let dispatch = &shared.dispatch;
        let for_job = shared.clone();
        let _ = dispatch.run_async(move |_| {
            let shared_for_complete = for_job.clone();
            let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
            let source = for_job.source.clone();
            let scheduled = for_job.pool.read_from_write(
                move |conn| fetch(&source, conn),
                move |result| {
                    if let Ok((new_items, observed_tables)) = result {
                        shared_for_complete.apply_diff(new_items, observed_tables);
                    }
                    let _ = done_tx.send(());
                },
            );
            // Block this dispatch-queue job until the reader has actually
            // finished diffing and dispatching, so the *next* commit's
            // recompute — queued right behind this one — cannot start
            // first and deliver its changes out of commit order.
            if scheduled.is_ok() {
                let _ = done_rx.recv();
            }
        });
    }
}

struct ObserverBridge {
    shared: Weak<Shared>,
    needs_compute: AtomicBool,
}

impl TransactionObserver for ObserverBridge {
    fn observes(&self, event: &ChangeEvent) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared
                .observed_tables
                .lock()
                .unwrap()
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&event.table_name)),
            None => false,
        }
    }

    fn did_change(&self, _event: &ChangeEvent) {
        self.needs_compute.store(true, Ordering::SeqCst);
    }

    fn did_commit(&self) {
        if !self.needs_compute.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            Shared::schedule_recompute(shared);
        }
    }

    fn did_rollback(&self) {
        self.needs_compute.store(false, Ordering::SeqCst);
    }
}

/// Watches a request's result set for as long as it's kept alive, pushing
/// diffs to its delegate after every commit that touches an observed table.
pub struct FetchedRecordsController {
    shared: Arc<Shared>,
}

impl FetchedRecordsController {
    /// Builds a controller with a caller-supplied record-identity test. Two
    /// rows are the "same record" (for move/update fusion) exactly when
    /// `same_record` returns true.
    pub fn new(
        pool: DatabasePool,
        source: FetchSource,
        same_record: impl Fn(&Row, &Row) -> bool + Send + Sync + 'static,
    ) -> Result<Self> {
        let dispatch = SerializedQueue::open_in_memory(crate::config::Config::default())?;
        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                source,
                same_record: Box::new(same_record),
                items: Mutex::new(Vec::new()),
                observed_tables: Mutex::new(Vec::new()),
                delegate: Mutex::new(None),
                dispatch,
                observer: Mutex::new(None),
            }),
        })
    }

    /// Convenience constructor that derives `same_record` from `table`'s
    /// primary key. A table with no primary key can never identify a
    /// record across a recompute, so every insert/delete pair is reported
    /// as a plain insertion and deletion — never fused into a move/update.
    pub fn with_primary_key(pool: DatabasePool, table: &str, source: FetchSource) -> Result<Self> {
        let table_owned = table.to_string();
        let pk = pool.write(move |conn| conn.primary_key(&table_owned).map(|pk| (*pk).clone()))?;
        let pk_columns: Vec<String> = pk.columns().into_iter().map(String::from).collect();
        Self::new(pool, source, move |a: &Row, b: &Row| {
            if pk_columns.is_empty() {
                return false;
            }
            pk_columns.iter().all(|c| a.get_named(c) == b.get_named(c))
        })
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn ControllerDelegate>>) {
        *self.shared.delegate.lock().unwrap() = delegate;
    }

    /// Runs the initial fetch and starts observing the writer for changes
    /// to any table the fetch touched.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<()> {
        let source = self.shared.source.clone();
        let (items, observed_tables) = self.shared.pool.write(move |conn| fetch(&source, conn))?;
        *self.shared.items.lock().unwrap() = items;
        *self.shared.observed_tables.lock().unwrap() = observed_tables;

        let bridge: Arc<dyn TransactionObserver> = Arc::new(ObserverBridge {
            shared: Arc::downgrade(&self.shared),
            needs_compute: AtomicBool::new(false),
        });
        self.shared.pool.add_writer_observer(bridge.clone())?;
        *self.shared.observer.lock().unwrap() = Some(bridge);
        Ok(())
    }

    pub fn items(&self) -> Vec<Row> {
        self.shared.items.lock().unwrap().clone()
    }
}
