use codspeed_criterion_compat::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use rusqlite::Connection;
use sqlcarve::{AnalysisOptions, Carver, Database};
use tempfile::NamedTempFile;

/// A database with a third of its rows deleted in place.
fn build_db() -> NamedTempFile {
    let file = NamedTempFile::new().expect("create temp db file");
    let conn = Connection::open(file.path()).expect("open temp sqlite db");
    conn.execute_batch(
        "PRAGMA journal_mode=DELETE; PRAGMA synchronous=OFF; PRAGMA secure_delete=OFF;
         CREATE TABLE messages (id INTEGER PRIMARY KEY, sender TEXT, body TEXT, sent INTEGER);",
    )
    .expect("create schema");
    let tx = conn.unchecked_transaction().expect("begin");
    for i in 0..10_000i64 {
        tx.execute(
            "INSERT INTO messages (sender, body, sent) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                format!("sender {}", i % 17),
                format!("message body {i}"),
                1_700_000_000 + i
            ],
        )
        .expect("insert message");
    }
    tx.commit().expect("commit");
    conn.execute("DELETE FROM messages WHERE id % 3 = 0", []).expect("delete messages");
    file
}

fn bench_carve_regions_hot(c: &mut Criterion) {
    let file = build_db();
    let db = Database::open(file.path()).expect("open database");
    let regions = db.regions();
    let carver = Carver::new(db.options().carve.clone(), db.catalog(), db.header().encoding);
    c.bench_function("carve_regions_hot", |b| {
        b.iter(|| black_box(carver.carve_all(db.pager(), regions).len()));
    });
}

fn bench_full_analysis_cold(c: &mut Criterion) {
    let file = build_db();
    let runs = [("full_analysis_sequential", false), ("full_analysis_parallel", true)];
    for (name, parallel) in runs {
        c.bench_function(name, |b| {
            b.iter_batched(
                || {
                    Database::open(file.path())
                        .expect("open database")
                        .with_options(AnalysisOptions::default().parallel(parallel))
                },
                |db| black_box(db.statistics().global.carved_records),
                BatchSize::PerIteration,
            );
        });
    }
}

criterion_group!(benches, bench_carve_regions_hot, bench_full_analysis_cold);
criterion_main!(benches);
