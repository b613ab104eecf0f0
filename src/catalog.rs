//! Catalog layer — live Postgres metadata discovery.
//!
//! Where `pg_trickle::catalog` wraps `pgstream.pgs_stream_tables` et al.
//! via SPI, this module has no metadata tables of its own — the
//! [`Catalog`] it provides reads directly from `information_schema` and
//! `pg_catalog` on the source database, over a `tokio_postgres::Client`,
//! to discover columns, primary keys, and foreign-key paths for the
//! Schema Tree Compiler (§4.1) and the Change Router (§4.4).

use tokio_postgres::Client;

use crate::error::PgDocSyncError;

/// A schema-qualified table name, e.g. `public.book`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedTable {
    pub schema: String,
    pub table: String,
}

impl QualifiedTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parse `"schema.table"` or a bare `"table"` (defaulting to `public`).
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((schema, table)) => Self::new(schema, table),
            None => Self::new("public", qualified),
        }
    }
}

impl std::fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Column metadata as discovered from `information_schema.columns`.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub ordinal_position: i32,
}

/// A single foreign-key edge discovered between two tables, column-level.
#[derive(Debug, Clone)]
pub struct ForeignKeyEdge {
    /// The table holding the FK columns (the "many" side, conventionally
    /// the child).
    pub referencing: QualifiedTable,
    pub referencing_columns: Vec<String>,
    /// The table the FK points at (conventionally the parent).
    pub referenced: QualifiedTable,
    pub referenced_columns: Vec<String>,
}

/// Read-only async handle onto the source database's catalog.
pub struct Catalog<'a> {
    client: &'a Client,
}

impl<'a> Catalog<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// All columns of `table`, in catalog (ordinal) order.
    pub async fn columns(&self, table: &QualifiedTable) -> Result<Vec<ColumnInfo>, PgDocSyncError> {
        let rows = self
            .client
            .query(
                "SELECT column_name, ordinal_position \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&table.schema, &table.table],
            )
            .await
            .map_err(|e| PgDocSyncError::CatalogError(e.to_string()))?;

        if rows.is_empty() {
            return Err(PgDocSyncError::CatalogError(format!(
                "table not found: {table}"
            )));
        }

        Ok(rows
            .into_iter()
            .map(|row| ColumnInfo {
                name: row.get(0),
                ordinal_position: row.get(1),
            })
            .collect())
    }

    /// The primary key column(s) of `table`, in catalog order. Empty if
    /// the table has no primary key.
    pub async fn primary_key(&self, table: &QualifiedTable) -> Result<Vec<String>, PgDocSyncError> {
        let rows = self
            .client
            .query(
                "SELECT a.attname \
                 FROM pg_index i \
                 JOIN pg_class c ON c.oid = i.indrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN unnest(i.indkey) WITH ORDINALITY AS k(attnum, ord) ON true \
                 JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = k.attnum \
                 WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary \
                 ORDER BY k.ord",
                &[&table.schema, &table.table],
            )
            .await
            .map_err(|e| PgDocSyncError::CatalogError(e.to_string()))?;

        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// All foreign keys where `table` is either side, in either direction.
    /// Used to discover direct parent/child FK paths (spec.md §3
    /// invariant: "at least one foreign-key path ... either direct FK in
    /// either direction").
    pub async fn foreign_keys_touching(
        &self,
        table: &QualifiedTable,
    ) -> Result<Vec<ForeignKeyEdge>, PgDocSyncError> {
        let rows = self
            .client
            .query(
                "SELECT \
                    rn.nspname, rc.relname, \
                    ARRAY(SELECT a.attname FROM unnest(con.conkey) WITH ORDINALITY ck(attnum, ord) \
                          JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = ck.attnum \
                          ORDER BY ck.ord), \
                    fn.nspname, fc.relname, \
                    ARRAY(SELECT a.attname FROM unnest(con.confkey) WITH ORDINALITY ck(attnum, ord) \
                          JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = ck.attnum \
                          ORDER BY ck.ord) \
                 FROM pg_constraint con \
                 JOIN pg_class rc ON rc.oid = con.conrelid \
                 JOIN pg_namespace rn ON rn.oid = rc.relnamespace \
                 JOIN pg_class fc ON fc.oid = con.confrelid \
                 JOIN pg_namespace fn ON fn.oid = fc.relnamespace \
                 WHERE con.contype = 'f' \
                   AND ((rn.nspname = $1 AND rc.relname = $2) \
                     OR (fn.nspname = $1 AND fc.relname = $2))",
                &[&table.schema, &table.table],
            )
            .await
            .map_err(|e| PgDocSyncError::CatalogError(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| ForeignKeyEdge {
                referencing: QualifiedTable::new(row.get::<_, String>(0), row.get::<_, String>(1)),
                referencing_columns: row.get(2),
                referenced: QualifiedTable::new(row.get::<_, String>(3), row.get::<_, String>(4)),
                referenced_columns: row.get(5),
            })
            .collect())
    }

    /// Whether `table` exists in the catalog at all.
    pub async fn table_exists(&self, table: &QualifiedTable) -> Result<bool, PgDocSyncError> {
        let row = self
            .client
            .query_opt(
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2",
                &[&table.schema, &table.table],
            )
            .await
            .map_err(|e| PgDocSyncError::CatalogError(e.to_string()))?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_table_parse_schema_qualified() {
        let t = QualifiedTable::parse("public.book");
        assert_eq!(t.schema, "public");
        assert_eq!(t.table, "book");
    }

    #[test]
    fn test_qualified_table_parse_bare_defaults_to_public() {
        let t = QualifiedTable::parse("book");
        assert_eq!(t.schema, "public");
        assert_eq!(t.table, "book");
    }

    #[test]
    fn test_qualified_table_display() {
        let t = QualifiedTable::new("public", "book");
        assert_eq!(t.to_string(), "public.book");
    }
}
