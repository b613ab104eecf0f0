//! Checkpoint Store — durable last-confirmed log position per (database,
//! index) (spec.md §4.3, §6 "Persisted state").
//!
//! Grounded on `pg_trickle::version::Frontier`'s created/advanced/reset
//! lifecycle: where a `Frontier` tracks one LSN per upstream source table
//! for a single stream table, a [`CheckpointRecord`] tracks a single
//! transaction id for a whole index, plus the run-generation counter that
//! distinguishes one full resync's checkpoints from the next. Persisted in
//! whatever table the caller points [`CheckpointStore`] at — the crate
//! makes no assumption about which database holds the bookkeeping schema,
//! only that it is reachable over the same kind of `tokio_postgres::Client`
//! as everything else in this crate.

use tokio_postgres::Client;

use crate::error::PgDocSyncError;

/// A single (database, index)'s durable checkpoint (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub database: String,
    pub index: String,
    pub slot_name: String,
    /// Transaction id beyond which the sink has not yet confirmed writes.
    /// `None` before the first full resync completes.
    pub checkpoint_xid: Option<u32>,
    /// Monotonically increases across full resyncs (spec.md §6).
    pub run_generation: i64,
}

impl CheckpointRecord {
    pub fn new_for_index(database: impl Into<String>, index: impl Into<String>, slot_name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            index: index.into(),
            slot_name: slot_name.into(),
            checkpoint_xid: None,
            run_generation: 0,
        }
    }
}

/// Single-writer-per-index durable store for [`CheckpointRecord`]s
/// (spec.md §5 "Shared resources").
///
/// Backed by a table in `schema`, created on first use. Callers are
/// expected to construct one `CheckpointStore` per (database, index) pair
/// and never share it across concurrent writers — the Document Builder's
/// checkpoint advance (spec.md §4.5) is the only writer.
pub struct CheckpointStore<'a> {
    client: &'a Client,
    schema: String,
}

impl<'a> CheckpointStore<'a> {
    pub fn new(client: &'a Client, schema: impl Into<String>) -> Self {
        Self {
            client,
            schema: schema.into(),
        }
    }

    fn table(&self) -> String {
        format!("{}.checkpoints", quote_ident(&self.schema))
    }

    /// Create the bookkeeping table if it does not already exist.
    pub async fn ensure_schema(&self) -> Result<(), PgDocSyncError> {
        let ddl = format!(
            "CREATE SCHEMA IF NOT EXISTS {schema}; \
             CREATE TABLE IF NOT EXISTS {table} ( \
                database text NOT NULL, \
                index_name text NOT NULL, \
                slot_name text NOT NULL, \
                checkpoint_xid bigint, \
                run_generation bigint NOT NULL DEFAULT 0, \
                updated_at timestamptz NOT NULL DEFAULT now(), \
                PRIMARY KEY (database, index_name) \
             )",
            schema = quote_ident(&self.schema),
            table = self.table(),
        );
        self.client
            .batch_execute(&ddl)
            .await
            .map_err(|e| PgDocSyncError::TransientDbError(e.to_string()))?;
        Ok(())
    }

    /// Load the checkpoint for `(database, index)`, if one has ever been
    /// recorded.
    pub async fn load(
        &self,
        database: &str,
        index: &str,
    ) -> Result<Option<CheckpointRecord>, PgDocSyncError> {
        let row = self
            .client
            .query_opt(
                &format!(
                    "SELECT slot_name, checkpoint_xid, run_generation FROM {} \
                     WHERE database = $1 AND index_name = $2",
                    self.table()
                ),
                &[&database, &index],
            )
            .await
            .map_err(|e| PgDocSyncError::TransientDbError(e.to_string()))?;

        Ok(row.map(|row| CheckpointRecord {
            database: database.to_string(),
            index: index.to_string(),
            slot_name: row.get(0),
            checkpoint_xid: row.get::<_, Option<i64>>(1).map(|x| x as u32),
            run_generation: row.get(2),
        }))
    }

    /// Record the checkpoint produced by a completed full resync: sets
    /// `checkpoint_xid` to the transaction id observed at snapshot start
    /// and bumps `run_generation` (spec.md §5 "Snapshot vs stream").
    pub async fn record_snapshot_start(
        &self,
        database: &str,
        index: &str,
        slot_name: &str,
        snapshot_xid: u32,
    ) -> Result<i64, PgDocSyncError> {
        let row = self
            .client
            .query_one(
                &format!(
                    "INSERT INTO {table} (database, index_name, slot_name, checkpoint_xid, run_generation, updated_at) \
                     VALUES ($1, $2, $3, $4, 1, now()) \
                     ON CONFLICT (database, index_name) DO UPDATE SET \
                        slot_name = EXCLUDED.slot_name, \
                        checkpoint_xid = EXCLUDED.checkpoint_xid, \
                        run_generation = {table}.run_generation + 1, \
                        updated_at = now() \
                     RETURNING run_generation",
                    table = self.table(),
                ),
                &[&database, &index, &slot_name, &(snapshot_xid as i64)],
            )
            .await
            .map_err(|e| PgDocSyncError::TransientDbError(e.to_string()))?;
        Ok(row.get(0))
    }

    /// Advance the checkpoint after a batch's sink writes are confirmed
    /// (spec.md §4.5 "the checkpoint is advanced ... only after confirmed
    /// write"). Monotonic: a `new_xid` behind the stored value is ignored,
    /// since checkpoints must never move backward.
    pub async fn advance(
        &self,
        database: &str,
        index: &str,
        new_xid: u32,
    ) -> Result<(), PgDocSyncError> {
        self.client
            .execute(
                &format!(
                    "UPDATE {table} SET checkpoint_xid = $3, updated_at = now() \
                     WHERE database = $1 AND index_name = $2 \
                       AND (checkpoint_xid IS NULL OR checkpoint_xid < $3)",
                    table = self.table(),
                ),
                &[&database, &index, &(new_xid as i64)],
            )
            .await
            .map_err(|e| PgDocSyncError::TransientDbError(e.to_string()))?;
        Ok(())
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_for_index_starts_at_generation_zero() {
        let rec = CheckpointRecord::new_for_index("shop", "products", "pg_docsync_shop_products");
        assert_eq!(rec.run_generation, 0);
        assert_eq!(rec.checkpoint_xid, None);
        assert_eq!(rec.slot_name, "pg_docsync_shop_products");
    }

    #[test]
    fn test_quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("pg_docsync"), "\"pg_docsync\"");
        assert_eq!(quote_ident("weird\"schema"), "\"weird\"\"schema\"");
    }
}
