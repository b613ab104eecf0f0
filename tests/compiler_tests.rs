//! Integration tests for catalog discovery and schema tree compilation
//! against a real PostgreSQL instance.

mod common;

use common::TestDb;
use pg_docsync::catalog::{Catalog, QualifiedTable};
use pg_docsync::compiler::compile_tree;
use pg_docsync::error::PgDocSyncError;
use pg_docsync::schema::{SchemaNodeSpec, Transform};
use serde_json::json;

fn node(table: &str, children: Vec<SchemaNodeSpec>) -> SchemaNodeSpec {
    SchemaNodeSpec {
        table: table.to_string(),
        columns: vec![],
        label: None,
        transform: Transform::default(),
        relationship: None,
        children,
    }
}

fn rel_child(
    table: &str,
    relationship: serde_json::Value,
    columns: Vec<&str>,
    label: Option<&str>,
    children: Vec<SchemaNodeSpec>,
) -> SchemaNodeSpec {
    SchemaNodeSpec {
        table: table.to_string(),
        columns: columns.into_iter().map(str::to_string).collect(),
        label: label.map(str::to_string),
        transform: Transform::default(),
        relationship: Some(relationship),
        children,
    }
}

#[tokio::test]
#[ignore] // requires Docker
async fn test_catalog_discovers_columns_and_primary_key() {
    let db = TestDb::with_scenario_schema().await;
    let catalog = Catalog::new(&db.client);

    let table = QualifiedTable::new("public", "book");
    let columns = catalog.columns(&table).await.unwrap();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "title", "publisher_id"]);

    let pk = catalog.primary_key(&table).await.unwrap();
    assert_eq!(pk, vec!["id".to_string()]);
}

#[tokio::test]
#[ignore]
async fn test_catalog_table_exists() {
    let db = TestDb::with_scenario_schema().await;
    let catalog = Catalog::new(&db.client);
    assert!(catalog
        .table_exists(&QualifiedTable::new("public", "book"))
        .await
        .unwrap());
    assert!(!catalog
        .table_exists(&QualifiedTable::new("public", "no_such_table"))
        .await
        .unwrap());
}

#[tokio::test]
#[ignore]
async fn test_catalog_finds_direct_foreign_key_either_direction() {
    let db = TestDb::with_scenario_schema().await;
    let catalog = Catalog::new(&db.client);
    let edges = catalog
        .foreign_keys_touching(&QualifiedTable::new("public", "publisher"))
        .await
        .unwrap();
    assert!(edges.iter().any(|e| e.referencing.table == "book" && e.referenced.table == "publisher"));
}

#[tokio::test]
#[ignore]
async fn test_compile_tree_resolves_direct_fk_one_to_one() {
    let db = TestDb::with_scenario_schema().await;
    let catalog = Catalog::new(&db.client);

    let publisher = rel_child(
        "public.publisher",
        json!({"variant": "object", "type": "one_to_one"}),
        vec![],
        None,
        vec![],
    );
    let root = node("public.book", vec![publisher]);

    let compiled = compile_tree(&catalog, &root).await.unwrap();
    assert_eq!(compiled.table, "public.book");
    assert_eq!(compiled.primary_key, vec!["id".to_string()]);
    assert_eq!(compiled.children.len(), 1);
    let publisher_node = &compiled.children[0];
    assert_eq!(publisher_node.primary_key, vec!["id".to_string()]);
    let rel = publisher_node.relationship.as_ref().unwrap();
    assert_eq!(rel.join_path.len(), 1);
    assert_eq!(rel.join_path[0].prev_columns, vec!["publisher_id".to_string()]);
    assert_eq!(rel.join_path[0].this_columns, vec!["id".to_string()]);
}

#[tokio::test]
#[ignore]
async fn test_compile_tree_resolves_through_table_many_to_many() {
    let db = TestDb::with_scenario_schema().await;
    let catalog = Catalog::new(&db.client);

    let tag = rel_child(
        "public.tag",
        json!({
            "variant": "object",
            "type": "one_to_many",
            "through_tables": ["public.book_tag"],
        }),
        vec![],
        None,
        vec![],
    );
    let root = node("public.book", vec![tag]);

    let compiled = compile_tree(&catalog, &root).await.unwrap();
    let tag_node = &compiled.children[0];
    let rel = tag_node.relationship.as_ref().unwrap();
    assert_eq!(rel.join_path.len(), 2);
    assert_eq!(rel.join_path[0].table, "public.book_tag");
    assert_eq!(rel.join_path[1].table, "public.tag");
}

#[tokio::test]
#[ignore]
async fn test_compile_tree_label_rename_and_transform() {
    let db = TestDb::with_scenario_schema().await;
    let catalog = Catalog::new(&db.client);

    let publisher = rel_child(
        "public.publisher",
        json!({"variant": "scalar", "type": "one_to_one"}),
        vec!["name"],
        Some("publisher_name"),
        vec![],
    );
    let root = node("public.book", vec![publisher]);

    let compiled = compile_tree(&catalog, &root).await.unwrap();
    assert_eq!(compiled.children[0].label, "publisher_name");
}

#[tokio::test]
#[ignore]
async fn test_compile_tree_scalar_relationship_rejects_multiple_columns() {
    let db = TestDb::with_scenario_schema().await;
    let catalog = Catalog::new(&db.client);

    let publisher = rel_child(
        "public.publisher",
        json!({"variant": "scalar", "type": "one_to_one"}),
        vec!["name", "id"],
        None,
        vec![],
    );
    let root = node("public.book", vec![publisher]);

    let err = compile_tree(&catalog, &root).await.unwrap_err();
    assert!(matches!(err, PgDocSyncError::ScalarColumnCountError(_, 2)));
}

#[tokio::test]
#[ignore]
async fn test_compile_tree_missing_foreign_key_path_reports_both_tables() {
    let db = TestDb::with_scenario_schema().await;
    let catalog = Catalog::new(&db.client);

    let city = rel_child(
        "public.city",
        json!({"variant": "object", "type": "one_to_one"}),
        vec![],
        None,
        vec![],
    );
    let root = node("public.book", vec![city]);

    let err = compile_tree(&catalog, &root).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "No foreign key relationship between \"public.book\" and \"public.city\""
    );
}

#[tokio::test]
#[ignore]
async fn test_compile_tree_missing_relationship_on_child_is_rejected() {
    let db = TestDb::with_scenario_schema().await;
    let catalog = Catalog::new(&db.client);

    let publisher = SchemaNodeSpec {
        table: "public.publisher".to_string(),
        columns: vec![],
        label: None,
        transform: Transform::default(),
        relationship: None, // missing
        children: vec![],
    };
    let root = node("public.book", vec![publisher]);

    let err = compile_tree(&catalog, &root).await.unwrap_err();
    assert!(matches!(err, PgDocSyncError::RelationshipError(_)));
}

#[tokio::test]
#[ignore]
async fn test_compile_tree_unknown_table_is_catalog_error() {
    let db = TestDb::with_scenario_schema().await;
    let catalog = Catalog::new(&db.client);
    let root = node("public.does_not_exist", vec![]);
    let err = compile_tree(&catalog, &root).await.unwrap_err();
    assert!(matches!(err, PgDocSyncError::CatalogError(_)));
}
