//! Integration tests for publication/replication-slot lifecycle management
//! against a real PostgreSQL instance (`wal_level=logical`).
//!
//! The wire-level decode path (`Consumer::decode`) is exercised with
//! synthetic `pgoutput` messages in `src/replication.rs`'s own unit tests;
//! these tests cover the DDL this module issues before a Consumer can
//! attach to a slot.

mod common;

use common::TestDb;
use pg_docsync::catalog::QualifiedTable;
use pg_docsync::replication::{drop_replication_slot, ensure_publication, ensure_replication_slot};

#[tokio::test]
#[ignore] // requires Docker + wal_level=logical
async fn test_ensure_publication_is_idempotent() {
    let db = TestDb::with_scenario_schema().await;
    let tables = vec![QualifiedTable::parse("public.book"), QualifiedTable::parse("public.publisher")];

    ensure_publication(&db.client, "pg_docsync_pub_shop_books", &tables).await.unwrap();
    // Second call must not error even though CREATE PUBLICATION has no
    // IF NOT EXISTS form.
    ensure_publication(&db.client, "pg_docsync_pub_shop_books", &tables).await.unwrap();

    let row = db
        .client
        .query_one(
            "SELECT count(*) FROM pg_publication WHERE pubname = $1",
            &[&"pg_docsync_pub_shop_books"],
        )
        .await
        .unwrap();
    let count: i64 = row.get(0);
    assert_eq!(count, 1);
}

#[tokio::test]
#[ignore]
async fn test_ensure_replication_slot_creates_once_and_reuses() {
    let db = TestDb::with_scenario_schema().await;
    let lsn1 = ensure_replication_slot(&db.client, "pg_docsync_shop_books").await.unwrap();
    let lsn2 = ensure_replication_slot(&db.client, "pg_docsync_shop_books").await.unwrap();
    assert_eq!(lsn1, lsn2);

    let row = db
        .client
        .query_one(
            "SELECT count(*) FROM pg_replication_slots WHERE slot_name = $1",
            &[&"pg_docsync_shop_books"],
        )
        .await
        .unwrap();
    let count: i64 = row.get(0);
    assert_eq!(count, 1);

    drop_replication_slot(&db.client, "pg_docsync_shop_books").await.unwrap();
    let row = db
        .client
        .query_one(
            "SELECT count(*) FROM pg_replication_slots WHERE slot_name = $1",
            &[&"pg_docsync_shop_books"],
        )
        .await
        .unwrap();
    let count: i64 = row.get(0);
    assert_eq!(count, 0);
}

#[tokio::test]
#[ignore]
async fn test_drop_replication_slot_on_absent_slot_is_a_no_op() {
    let db = TestDb::with_scenario_schema().await;
    // Must not error even though the slot was never created.
    drop_replication_slot(&db.client, "pg_docsync_never_created").await.unwrap();
}
