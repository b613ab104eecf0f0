//! Schema Tree Compiler — validates a [`SchemaNodeSpec`] tree against a
//! live catalog and produces an immutable [`CompiledNode`] tree.
//!
//! Grounded on `pg_trickle::dag`'s cycle-detection approach (Kahn's
//! algorithm over the stream-table dependency DAG) adapted to schema
//! trees: the dependency graph here is "child node depends on parent
//! node's FK path", and a cycle is a through-table chain (or an FK path)
//! that revisits a table already on it — the catalog's own FK graph may
//! legitimately contain cycles (mutual FKs); only the *compiled tree's*
//! join path must be acyclic.

use std::collections::HashSet;

use crate::catalog::{Catalog, ForeignKeyEdge, QualifiedTable};
use crate::error::PgDocSyncError;
use crate::schema::{
    CompiledNode, CompiledRelationship, ExplicitForeignKey, JoinHop, RelationshipSpec,
    SchemaNodeSpec, Variant,
};

/// Compile a raw schema tree into a validated, catalog-resolved tree.
///
/// `root` must not itself carry a `relationship` (it is the tree's root);
/// every descendant must.
pub async fn compile_tree(
    catalog: &Catalog<'_>,
    root: &SchemaNodeSpec,
) -> Result<CompiledNode, PgDocSyncError> {
    let compiled_root = compile_node(catalog, root, None).await?;
    Ok(compiled_root)
}

async fn compile_node(
    catalog: &Catalog<'_>,
    spec: &SchemaNodeSpec,
    parent: Option<&QualifiedTable>,
) -> Result<CompiledNode, PgDocSyncError> {
    let table = QualifiedTable::parse(&spec.table);

    if !catalog.table_exists(&table).await? {
        return Err(PgDocSyncError::CatalogError(format!(
            "table not found: {table}"
        )));
    }

    let catalog_columns = catalog.columns(&table).await?;
    let primary_key = catalog.primary_key(&table).await?;

    // spec.md §4.1: empty/omitted `columns` projects every catalog column
    // (including FK columns) in catalog order; explicit `columns` is used
    // verbatim and FK columns are never silently added (§9 Open Question).
    let columns = if spec.columns.is_empty() {
        catalog_columns.iter().map(|c| c.name.clone()).collect()
    } else {
        spec.columns.clone()
    };

    let relationship = match parent {
        None => {
            // Root: relationship must be absent; nothing to validate.
            None
        }
        Some(parent_table) => {
            let raw = spec.relationship.as_ref().ok_or_else(|| {
                PgDocSyncError::RelationshipError(table.to_string())
            })?;
            let obj = raw.as_object().ok_or_else(|| {
                PgDocSyncError::RelationshipAttributeError(
                    "relationship must be an object".to_string(),
                )
            })?;
            let rel_spec = RelationshipSpec::from_raw(obj)?;

            if rel_spec.variant == Variant::Scalar && columns.len() != 1 {
                return Err(PgDocSyncError::ScalarColumnCountError(
                    table.to_string(),
                    columns.len(),
                ));
            }

            let join_path = resolve_join_path(
                catalog,
                parent_table,
                &table,
                &rel_spec.through_tables,
                rel_spec.foreign_key.as_ref(),
            )
            .await?;

            check_no_repeated_hop(parent_table, &table, &rel_spec.through_tables)?;

            Some(CompiledRelationship {
                variant: rel_spec.variant,
                cardinality: rel_spec.cardinality,
                join_path,
                through_tables: rel_spec.through_tables,
            })
        }
    };

    let mut children = Vec::with_capacity(spec.children.len());
    for child_spec in &spec.children {
        let child = Box::pin(compile_node(catalog, child_spec, Some(&table))).await?;
        children.push(child);
    }

    Ok(CompiledNode {
        table: table.to_string(),
        columns,
        primary_key,
        label: spec.effective_label().to_string(),
        transform: spec.transform.clone(),
        relationship,
        children,
    })
}

/// Reject a through-table chain that revisits the parent or child table,
/// or any table twice — spec.md §9's "no cycles are legal".
fn check_no_repeated_hop(
    parent: &QualifiedTable,
    child: &QualifiedTable,
    through_tables: &[String],
) -> Result<(), PgDocSyncError> {
    let mut seen: HashSet<String> = HashSet::new();
    seen.insert(parent.to_string());
    for hop in through_tables {
        let hop_table = QualifiedTable::parse(hop).to_string();
        if !seen.insert(hop_table.clone()) || hop_table == child.to_string() {
            return Err(PgDocSyncError::CycleDetected(vec![
                parent.to_string(),
                hop_table,
                child.to_string(),
            ]));
        }
    }
    Ok(())
}

/// Resolve the full parent-to-child join path, following an explicit
/// `through_tables` chain when given, otherwise looking for a direct FK (in
/// either direction) between the two tables. The returned path's last hop
/// always targets `child`; any earlier hops target the through-tables in
/// order.
async fn resolve_join_path(
    catalog: &Catalog<'_>,
    parent: &QualifiedTable,
    child: &QualifiedTable,
    through_tables: &[String],
    explicit: Option<&ExplicitForeignKey>,
) -> Result<Vec<JoinHop>, PgDocSyncError> {
    if let Some(fk) = explicit {
        return Ok(vec![JoinHop {
            table: child.to_string(),
            prev_columns: fk.parent.clone(),
            this_columns: fk.child.clone(),
        }]);
    }

    if through_tables.is_empty() {
        let fk = direct_foreign_key(catalog, parent, child).await?;
        return Ok(vec![JoinHop {
            table: child.to_string(),
            prev_columns: fk.parent,
            this_columns: fk.child,
        }]);
    }

    let mut path = Vec::with_capacity(through_tables.len() + 1);
    let mut hop_from = parent.clone();
    for hop in through_tables {
        let hop_table = QualifiedTable::parse(hop);
        let fk = direct_foreign_key(catalog, &hop_from, &hop_table)
            .await
            .map_err(|_| PgDocSyncError::ForeignKeyError {
                parent: parent.to_string(),
                child: child.to_string(),
            })?;
        path.push(JoinHop {
            table: hop_table.to_string(),
            prev_columns: fk.parent,
            this_columns: fk.child,
        });
        hop_from = hop_table;
    }
    let fk = direct_foreign_key(catalog, &hop_from, child)
        .await
        .map_err(|_| PgDocSyncError::ForeignKeyError {
            parent: parent.to_string(),
            child: child.to_string(),
        })?;
    path.push(JoinHop {
        table: child.to_string(),
        prev_columns: fk.parent,
        this_columns: fk.child,
    });
    Ok(path)
}

/// Find a direct FK edge between two tables, in either direction.
async fn direct_foreign_key(
    catalog: &Catalog<'_>,
    a: &QualifiedTable,
    b: &QualifiedTable,
) -> Result<ExplicitForeignKey, PgDocSyncError> {
    let edges = catalog.foreign_keys_touching(a).await?;
    find_edge_between(&edges, a, b).ok_or_else(|| PgDocSyncError::ForeignKeyError {
        parent: a.to_string(),
        child: b.to_string(),
    })
}

fn find_edge_between(
    edges: &[ForeignKeyEdge],
    a: &QualifiedTable,
    b: &QualifiedTable,
) -> Option<ExplicitForeignKey> {
    for edge in edges {
        if &edge.referencing == a && &edge.referenced == b {
            // `a` holds the FK columns, pointing at `b`.
            return Some(ExplicitForeignKey {
                parent: edge.referencing_columns.clone(),
                child: edge.referenced_columns.clone(),
            });
        }
        if &edge.referencing == b && &edge.referenced == a {
            // `b` holds the FK columns, pointing at `a`.
            return Some(ExplicitForeignKey {
                parent: edge.referenced_columns.clone(),
                child: edge.referencing_columns.clone(),
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ForeignKeyEdge;

    #[test]
    fn test_find_edge_between_direct_direction() {
        let book = QualifiedTable::new("public", "book");
        let publisher = QualifiedTable::new("public", "publisher");
        let edges = vec![ForeignKeyEdge {
            referencing: book.clone(),
            referencing_columns: vec!["publisher_id".into()],
            referenced: publisher.clone(),
            referenced_columns: vec!["id".into()],
        }];
        let fk = find_edge_between(&edges, &book, &publisher).unwrap();
        assert_eq!(fk.parent, vec!["publisher_id".to_string()]);
        assert_eq!(fk.child, vec!["id".to_string()]);
    }

    #[test]
    fn test_find_edge_between_reverse_direction() {
        let book = QualifiedTable::new("public", "book");
        let publisher = QualifiedTable::new("public", "publisher");
        let edges = vec![ForeignKeyEdge {
            referencing: book.clone(),
            referencing_columns: vec!["publisher_id".into()],
            referenced: publisher.clone(),
            referenced_columns: vec!["id".into()],
        }];
        // Query initiated from publisher's perspective: `b` (book) holds
        // the FK, so `parent` is `a`'s (publisher's) referenced columns
        // and `child` is `b`'s (book's) referencing columns.
        let fk = find_edge_between(&edges, &publisher, &book).unwrap();
        assert_eq!(fk.parent, vec!["id".to_string()]);
        assert_eq!(fk.child, vec!["publisher_id".to_string()]);
    }

    #[test]
    fn test_find_edge_between_missing() {
        let book = QualifiedTable::new("public", "book");
        let city = QualifiedTable::new("public", "city");
        assert!(find_edge_between(&[], &book, &city).is_none());
    }

    #[test]
    fn test_check_no_repeated_hop_rejects_revisit() {
        let parent = QualifiedTable::new("public", "a");
        let child = QualifiedTable::new("public", "c");
        let err = check_no_repeated_hop(&parent, &child, &["public.a".to_string()]).unwrap_err();
        assert!(matches!(err, PgDocSyncError::CycleDetected(_)));
    }

    #[test]
    fn test_check_no_repeated_hop_allows_distinct_chain() {
        let parent = QualifiedTable::new("public", "a");
        let child = QualifiedTable::new("public", "c");
        assert!(check_no_repeated_hop(&parent, &child, &["public.b".to_string()]).is_ok());
    }

}
