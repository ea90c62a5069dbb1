//! End-to-end scenarios and invariants against the public façades.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use sqlite_kit::query::{Expr, Ordering as QueryOrdering, Query};
use sqlite_kit::{
    ChangeEvent, Config, ControllerDelegate, DatabasePool, DatabaseQueue, DatabaseValue, ExecutionOutcome,
    FetchSource, FetchedRecordsController, RecordChange, Row, TransactionObserver,
};
use tempfile::NamedTempFile;

fn temp_path() -> String {
    NamedTempFile::new().unwrap().path().to_string_lossy().into_owned()
}

fn exec(queue: &DatabaseQueue, sql: &'static str) -> ExecutionOutcome {
    queue
        .write(move |conn| conn.execute(sql, sqlite_kit::StatementArguments::none()))
        .unwrap()
}

// ============================================================================
// S1 — rowid alias detection and NotFound on a missing key
// ============================================================================

#[test]
fn s1_rowid_alias_and_not_found_on_update() {
    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE persons(id INTEGER PRIMARY KEY, name TEXT)");
    let outcome = db
        .write(|conn| conn.execute("INSERT INTO persons(name) VALUES ('Arthur')", sqlite_kit::StatementArguments::none()))
        .unwrap();
    assert_eq!(outcome.last_inserted_row_id, Some(1));

    let pk = db.write(|conn| conn.primary_key("persons")).unwrap();
    assert_eq!(*pk, sqlite_kit::PrimaryKey::Rowid("id".to_string()));

    let updated = db
        .write(|conn| {
            conn.execute(
                "UPDATE persons SET name = 'Art' WHERE id = 1",
                sqlite_kit::StatementArguments::none(),
            )
        })
        .unwrap();
    assert_eq!(updated.changed_row_count, 1);

    let missed = db
        .write(|conn| {
            conn.execute(
                "UPDATE persons SET name = 'X' WHERE id = 999",
                sqlite_kit::StatementArguments::none(),
            )
        })
        .unwrap();
    assert_eq!(missed.changed_row_count, 0);
}

// ============================================================================
// S2 — query builder emits exactly the expected SQL and ordering
// ============================================================================

#[test]
fn s2_query_builder_emits_exact_sql_and_ordering_by_id() {
    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE readers(id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INT)");
    db.write(|conn| {
        conn.execute(
            "INSERT INTO readers(name, age) VALUES ('Arthur', 42), ('Barbara', 36)",
            sqlite_kit::StatementArguments::none(),
        )
    })
    .unwrap();

    let query = Query::table("readers");
    let rows = db
        .write(move |conn| {
            let generated = sqlite_kit::query::generate(&query, conn)?;
            assert_eq!(generated.sql, "SELECT * FROM \"readers\"");
            let select = match conn.compile(&generated.sql)? {
                sqlite_kit::CompiledStatement::Select(s) => s,
                _ => unreachable!(),
            };
            conn.fetch_all(&select, &sqlite_kit::StatementArguments::none())
        })
        .unwrap();

    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get_named("name").and_then(|v| v.as_str()), Some("Arthur"));
    assert_eq!(rows[1].get_named("name").and_then(|v| v.as_str()), Some("Barbara"));
}

// ============================================================================
// S3 — a foreign key violation surfaces as a DatabaseError with context
// ============================================================================

#[test]
fn s3_foreign_key_violation_reports_code_and_arguments() {
    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE masters(id INTEGER PRIMARY KEY)");
    exec(
        &db,
        "CREATE TABLE pets(id INTEGER PRIMARY KEY, masterId INTEGER NOT NULL REFERENCES masters(id), name TEXT)",
    );

    let err = db
        .write(|conn| {
            conn.execute(
                "INSERT INTO pets(masterId, name) VALUES (1, 'Bobby')",
                sqlite_kit::StatementArguments::none(),
            )
        })
        .unwrap_err();

    match err {
        sqlite_kit::Error::Database(db_err) => {
            // SQLITE_CONSTRAINT_FOREIGNKEY: the base SQLITE_CONSTRAINT (19)
            // code refined with the foreign-key-specific extended code.
            assert_eq!(db_err.code, 787);
            assert!(db_err.message.as_deref().unwrap_or("").contains("FOREIGN KEY constraint failed"));
        }
        other => panic!("expected a DatabaseError, got {other:?}"),
    }
}

// ============================================================================
// S4 — NUMERIC affinity coercion is SQLite's own, not reimplemented
// ============================================================================

#[test]
fn s4_numeric_affinity_coercion_matches_sqlite() {
    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE readings(v NUMERIC)");

    for (literal, expected) in [
        ("'3.0e+5'", DatabaseValue::Int64(300_000)),
        ("'1.0e+20'", DatabaseValue::Double(1e20)),
        ("'foo'", DatabaseValue::Text("foo".to_string())),
    ] {
        let sql = format!("INSERT INTO readings(v) VALUES ({literal})");
        db.write(move |conn| conn.execute(&sql, sqlite_kit::StatementArguments::none())).unwrap();
    }

    let rows = db
        .write(|conn| {
            let stmt = match conn.compile("SELECT v FROM readings ORDER BY rowid")? {
                sqlite_kit::CompiledStatement::Select(s) => s,
                _ => unreachable!(),
            };
            conn.fetch_all(&stmt, &sqlite_kit::StatementArguments::none())
        })
        .unwrap();

    assert_eq!(rows[0].get_named("v"), Some(&DatabaseValue::Int64(300_000)));
    assert_eq!(rows[1].get_named("v"), Some(&DatabaseValue::Double(1e20)));
    assert_eq!(rows[2].get_named("v"), Some(&DatabaseValue::Text("foo".to_string())));
}

// ============================================================================
// S5 — a pool reader holds a stable snapshot across a concurrent writer commit
// ============================================================================

#[test]
fn s5_reader_snapshot_is_stable_across_a_concurrent_write() {
    let pool = DatabasePool::open(temp_path(), Config::default(), 2).unwrap();
    pool.write(|conn| conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)", sqlite_kit::StatementArguments::none()))
        .unwrap();
    pool.write(|conn| conn.execute("INSERT INTO t(id) VALUES (1)", sqlite_kit::StatementArguments::none()))
        .unwrap();

    let entered = Arc::new(Barrier::new(2));
    let may_finish = Arc::new(Barrier::new(2));

    let pool_a = pool.clone();
    let entered_a = entered.clone();
    let may_finish_a = may_finish.clone();
    let reader = std::thread::spawn(move || {
        pool_a
            .read(move |conn| {
                let count_before = count(conn);
                entered_a.wait();
                may_finish_a.wait();
                let count_after = count(conn);
                Ok((count_before, count_after))
            })
            .unwrap()
    });

    entered.wait();
    pool.write(|conn| conn.execute("INSERT INTO t(id) VALUES (2)", sqlite_kit::StatementArguments::none()))
        .unwrap();
    may_finish.wait();

    let (before, after) = reader.join().unwrap();
    assert_eq!(before, 1);
    assert_eq!(after, 1, "a snapshot read must not observe a write that committed during it");

    let fresh = pool.read(|conn| Ok(count(conn))).unwrap();
    assert_eq!(fresh, 2);
}

fn count(conn: &sqlite_kit::Connection) -> i64 {
    let stmt = match conn.compile("SELECT COUNT(*) AS c FROM t").unwrap() {
        sqlite_kit::CompiledStatement::Select(s) => s,
        _ => unreachable!(),
    };
    conn.fetch_one(&stmt, &sqlite_kit::StatementArguments::none())
        .unwrap()
        .and_then(|r| r.get_named("c").and_then(|v| v.as_i64()))
        .unwrap()
}

// ============================================================================
// S6 — a rename that keeps ordering position reports as a move with old value
// ============================================================================

struct CollectingDelegate {
    barrier: Arc<Barrier>,
    changes: Mutex<Vec<(String, RecordChange)>>,
}

impl ControllerDelegate for CollectingDelegate {
    fn did_change_record(&self, record: &Row, change: &RecordChange) {
        let name = record.get_named("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
        self.changes.lock().unwrap().push((name, change.clone()));
    }
    fn did_change(&self) {
        self.barrier.wait();
    }
}

#[test]
fn s6_rename_keeping_relative_order_reports_as_a_move() {
    let pool = DatabasePool::open(temp_path(), Config::default(), 2).unwrap();
    pool.write(|conn| {
        conn.execute(
            "CREATE TABLE persons(id INTEGER PRIMARY KEY, name TEXT)",
            sqlite_kit::StatementArguments::none(),
        )
    })
    .unwrap();
    pool.write(|conn| {
        conn.execute(
            "INSERT INTO persons(id, name) VALUES (1, 'Arthur'), (2, 'Barbara')",
            sqlite_kit::StatementArguments::none(),
        )
    })
    .unwrap();

    let controller = FetchedRecordsController::with_primary_key(
        pool.clone(),
        "persons",
        FetchSource::Query(Query::table("persons").order(vec![QueryOrdering::Asc(Expr::column("name"))])),
    )
    .unwrap();
    controller.start().unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let delegate = Arc::new(CollectingDelegate {
        barrier: barrier.clone(),
        changes: Mutex::new(Vec::new()),
    });
    controller.set_delegate(Some(delegate.clone()));

    pool.write(|conn| {
        conn.execute(
            "UPDATE persons SET name = 'Alan' WHERE id = 2",
            sqlite_kit::StatementArguments::none(),
        )
    })
    .unwrap();
    barrier.wait();

    let changes = delegate.changes.lock().unwrap();
    assert_eq!(changes.len(), 1);
    assert!(matches!(changes[0].1, RecordChange::Move { from: 1, to: 0, .. }));
    if let RecordChange::Move { changes: field_changes, .. } = &changes[0].1 {
        assert_eq!(field_changes.get("name"), Some(&DatabaseValue::Text("Barbara".to_string())));
    }
}

// ============================================================================
// Invariant 1 — a write is visible to a read on the same façade thread
// ============================================================================

#[test]
fn invariant1_write_then_read_on_the_same_queue_sees_the_write() {
    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE t(id INTEGER PRIMARY KEY)");
    db.write(|conn| conn.execute("INSERT INTO t(id) VALUES (1)", sqlite_kit::StatementArguments::none()))
        .unwrap();
    let seen = db.read(|conn| Ok(count(conn))).unwrap();
    assert_eq!(seen, 1);
}

// ============================================================================
// Invariant 3 — update(pk=pk) with no other column change still reports a change
// ============================================================================

#[test]
fn invariant3_update_with_only_pk_columns_still_reports_one_changed_row() {
    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE persons(id INTEGER PRIMARY KEY, name TEXT)");
    db.write(|conn| conn.execute("INSERT INTO persons(id, name) VALUES (1, 'Arthur')", sqlite_kit::StatementArguments::none()))
        .unwrap();

    let outcome = db
        .write(|conn| conn.execute("UPDATE persons SET id = id WHERE id = 1", sqlite_kit::StatementArguments::none()))
        .unwrap();
    assert_eq!(outcome.changed_row_count, 1);
}

// ============================================================================
// Invariant 4 — commit order is preserved through a controller's dispatch
// ============================================================================

#[test]
fn invariant4_controller_sees_every_commit_exactly_once_in_order() {
    let pool = DatabasePool::open(temp_path(), Config::default(), 2).unwrap();
    pool.write(|conn| {
        conn.execute(
            "CREATE TABLE counters(id INTEGER PRIMARY KEY, value INTEGER)",
            sqlite_kit::StatementArguments::none(),
        )
    })
    .unwrap();
    pool.write(|conn| {
        conn.execute(
            "INSERT INTO counters(id, value) VALUES (1, 0)",
            sqlite_kit::StatementArguments::none(),
        )
    })
    .unwrap();

    let controller = FetchedRecordsController::with_primary_key(
        pool.clone(),
        "counters",
        FetchSource::Sql("SELECT * FROM counters".to_string(), sqlite_kit::StatementArguments::none()),
    )
    .unwrap();
    controller.start().unwrap();

    const COMMITS: usize = 5;
    let seen = Arc::new(AtomicUsize::new(0));
    struct Counting {
        seen: Arc<AtomicUsize>,
        barrier: Arc<Barrier>,
    }
    impl ControllerDelegate for Counting {
        fn did_change(&self) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.barrier.wait();
        }
    }
    let barrier = Arc::new(Barrier::new(2));
    controller.set_delegate(Some(Arc::new(Counting {
        seen: seen.clone(),
        barrier: barrier.clone(),
    })));

    for i in 1..=COMMITS {
        pool.write(move |conn| {
            conn.execute(
                "UPDATE counters SET value = value + 1 WHERE id = 1",
                sqlite_kit::StatementArguments::none(),
            )
        })
        .unwrap();
        barrier.wait();
        assert_eq!(seen.load(Ordering::SeqCst), i);
    }

    let final_value = controller.items()[0].get_named("value").and_then(|v| v.as_i64());
    assert_eq!(final_value, Some(COMMITS as i64));
}

// ============================================================================
// Invariant 6 — fetchCount matches fetchAll().len for the same request
// ============================================================================

#[test]
fn invariant6_fetch_count_matches_fetch_all_length() {
    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE t(id INTEGER PRIMARY KEY, group_id INTEGER)");
    db.write(|conn| {
        conn.execute(
            "INSERT INTO t(group_id) VALUES (1), (1), (2), (2), (2)",
            sqlite_kit::StatementArguments::none(),
        )
    })
    .unwrap();

    let query = Query::table("t").filter(Expr::column("group_id").eq(Expr::value(2i64)));
    let query_for_count = query.clone();

    let all_len = db
        .write(move |conn| {
            let generated = sqlite_kit::query::generate(&query, conn)?;
            let select = match conn.compile(&generated.sql)? {
                sqlite_kit::CompiledStatement::Select(s) => s,
                _ => unreachable!(),
            };
            conn.fetch_all(&select, &sqlite_kit::StatementArguments::positional(generated.bindings))
        })
        .unwrap()
        .len();

    let count = db
        .write(move |conn| {
            let generated = sqlite_kit::query::generate_count(&query_for_count, conn)?;
            let select = match conn.compile(&generated.sql)? {
                sqlite_kit::CompiledStatement::Select(s) => s,
                _ => unreachable!(),
            };
            conn.fetch_one(&select, &sqlite_kit::StatementArguments::positional(generated.bindings))
        })
        .unwrap()
        .and_then(|r| r.get_named("COUNT(*)").and_then(|v| v.as_i64()).or_else(|| r.get(0).and_then(|v| v.as_i64())))
        .unwrap();

    assert_eq!(count as usize, all_len);
}

// ============================================================================
// Invariant 7 — a migration identifier runs at most once
// ============================================================================

#[test]
fn invariant7_migration_runs_exactly_once_across_repeated_calls() {
    use sqlite_kit::{ForeignKeyCheckMode, Migrator};

    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    let run_count = Arc::new(AtomicUsize::new(0));

    db.write({
        let run_count = run_count.clone();
        move |conn| {
            let mut migrator = Migrator::default();
            migrator
                .register("create_persons", ForeignKeyCheckMode::Standard, {
                    let run_count = run_count.clone();
                    move |conn| {
                        run_count.fetch_add(1, Ordering::SeqCst);
                        conn.execute(
                            "CREATE TABLE persons(id INTEGER PRIMARY KEY)",
                            sqlite_kit::StatementArguments::none(),
                        )
                        .map(|_| ())
                    }
                })
                .unwrap();
            migrator.migrate(conn)
        }
    })
    .unwrap();

    // A second migrator instance with the same identifier, against the
    // same already-migrated database, must not re-run the migration.
    db.write({
        let run_count = run_count.clone();
        move |conn| {
            let mut migrator = Migrator::default();
            migrator
                .register("create_persons", ForeignKeyCheckMode::Standard, {
                    let run_count = run_count.clone();
                    move |_conn| {
                        run_count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap();
            migrator.migrate(conn)
        }
    })
    .unwrap();

    assert_eq!(run_count.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Invariant 8 — reverse().reverse() round-trips to the original ordering
// ============================================================================

#[test]
fn invariant8_double_reverse_round_trips_to_the_original_sql() {
    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE t(id INTEGER PRIMARY KEY, name TEXT)");

    let original = Query::table("t").order(vec![QueryOrdering::Asc(Expr::column("name"))]);
    let twice_reversed = original.clone().reverse().reverse();

    let (sql_a, sql_b) = db
        .write(move |conn| {
            let a = sqlite_kit::query::generate(&original, conn)?.sql;
            let b = sqlite_kit::query::generate(&twice_reversed, conn)?.sql;
            Ok((a, b))
        })
        .unwrap();

    assert_eq!(sql_a, sql_b);
}

// ============================================================================
// Commit veto — an observer vetoing `will_commit` surfaces `CommitVetoed`
// ============================================================================

struct VetoingObserver;
impl TransactionObserver for VetoingObserver {
    fn will_commit(&self) -> Result<(), sqlite_kit::Error> {
        Err(sqlite_kit::Error::NotFound)
    }
}

#[test]
fn observer_veto_rolls_back_and_surfaces_commit_vetoed() {
    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE t(id INTEGER PRIMARY KEY)");

    let observer: Arc<dyn TransactionObserver> = Arc::new(VetoingObserver);
    db.write(move |conn| {
        conn.add_observer(&observer);
        Ok(())
    })
    .unwrap();

    let result: sqlite_kit::Result<()> = db.write(|conn| {
        conn.begin(sqlite_kit::TransactionKind::Immediate)?;
        conn.execute("INSERT INTO t(id) VALUES (1)", sqlite_kit::StatementArguments::none())?;
        conn.commit()
    });

    assert!(matches!(result, Err(sqlite_kit::Error::CommitVetoed(_))));

    let remaining = db.read(|conn| Ok(count(conn))).unwrap();
    assert_eq!(remaining, 0);
}

// ============================================================================
// Observer sees a row change event with the expected shape
// ============================================================================

#[test]
fn row_change_event_carries_kind_table_and_rowid() {
    struct Capture(Mutex<Option<ChangeEvent>>);
    impl TransactionObserver for Capture {
        fn did_change(&self, event: &ChangeEvent) {
            *self.0.lock().unwrap() = Some(event.clone());
        }
    }

    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE t(id INTEGER PRIMARY KEY)");

    let capture = Arc::new(Capture(Mutex::new(None)));
    let observer: Arc<dyn TransactionObserver> = capture.clone();
    db.write(move |conn| {
        conn.add_observer(&observer);
        Ok(())
    })
    .unwrap();

    db.write(|conn| conn.execute("INSERT INTO t(id) VALUES (7)", sqlite_kit::StatementArguments::none()))
        .unwrap();

    let event = capture.0.lock().unwrap().clone().unwrap();
    assert_eq!(event.table_name, "t");
    assert_eq!(event.row_id, 7);
}

// ============================================================================
// Invariant 2 — two queries inside one pool `read` see identical snapshots
// ============================================================================

#[test]
fn invariant2_two_queries_in_one_read_see_the_same_snapshot() {
    let pool = DatabasePool::open(temp_path(), Config::default(), 2).unwrap();
    pool.write(|conn| conn.execute("CREATE TABLE t(id INTEGER PRIMARY KEY)", sqlite_kit::StatementArguments::none()))
        .unwrap();
    pool.write(|conn| conn.execute("INSERT INTO t(id) VALUES (1)", sqlite_kit::StatementArguments::none()))
        .unwrap();

    let entered = Arc::new(Barrier::new(2));
    let may_finish = Arc::new(Barrier::new(2));

    let pool_a = pool.clone();
    let entered_a = entered.clone();
    let may_finish_a = may_finish.clone();
    let reader = std::thread::spawn(move || {
        pool_a
            .read(move |conn| {
                let first = count(conn);
                entered_a.wait();
                may_finish_a.wait();
                let second = count(conn);
                Ok((first, second))
            })
            .unwrap()
    });

    entered.wait();
    pool.write(|conn| conn.execute("INSERT INTO t(id) VALUES (2)", sqlite_kit::StatementArguments::none()))
        .unwrap();
    may_finish.wait();

    let (first, second) = reader.join().unwrap();
    assert_eq!(first, second, "no phantom rows between two queries in the same read");
}

// ============================================================================
// Invariant 5 — decode(encode(v)) == v for every supported scalar
// ============================================================================

#[test]
fn invariant5_scalar_round_trip_through_every_storage_class() {
    let db = DatabaseQueue::open_in_memory(Config::default()).unwrap();
    exec(&db, "CREATE TABLE t(id INTEGER PRIMARY KEY, i INTEGER, r REAL, t TEXT, b BLOB)");

    let values = vec![
        DatabaseValue::Null,
        DatabaseValue::Int64(i64::MIN),
        DatabaseValue::Int64(i64::MAX),
        DatabaseValue::Double(-1.5e300),
        DatabaseValue::Text(String::new()),
        DatabaseValue::Text("hello world".to_string()),
        DatabaseValue::Blob(vec![]),
        DatabaseValue::Blob(vec![0, 1, 2, 255]),
    ];

    for (idx, value) in values.into_iter().enumerate() {
        let value = value.clone();
        let column = match value {
            DatabaseValue::Null => "i",
            DatabaseValue::Int64(_) => "i",
            DatabaseValue::Double(_) => "r",
            DatabaseValue::Text(_) => "t",
            DatabaseValue::Blob(_) => "b",
        };
        let sql = format!("INSERT INTO t(id, {column}) VALUES (?, ?)");
        let value_for_write = value.clone();
        db.write(move |conn| {
            conn.execute(
                &sql,
                sqlite_kit::StatementArguments::positional([DatabaseValue::Int64(idx as i64), value_for_write]),
            )
        })
        .unwrap();

        let select = format!("SELECT {column} AS v FROM t WHERE id = {idx}");
        let decoded = db
            .read(move |conn| {
                let stmt = match conn.compile(&select)? {
                    sqlite_kit::CompiledStatement::Select(s) => s,
                    _ => unreachable!(),
                };
                let rows = conn.fetch_all(&stmt, &sqlite_kit::StatementArguments::none())?;
                Ok(rows[0].get_named("v").cloned().unwrap())
            })
            .unwrap();

        assert_eq!(decoded, value, "round-trip mismatch for value #{idx}");
    }
}
