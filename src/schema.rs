//! Schema tree types — the user-declared document projection.
//!
//! [`SchemaNodeSpec`] is the "dynamically typed config blob" a caller
//! deserializes from whatever format their wrapper loads (JSON, YAML,
//! TOML — all out of scope here). [`compiler::compile_tree`] validates it
//! against a live catalog and produces an immutable [`CompiledNode`] tree.
//!
//! The enum/struct style here (plain enums with `as_str`/`from_str`,
//! derive-heavy value types) follows `pg_trickle::dag`'s `NodeId` /
//! `RefreshMode` / `DtStatus` conventions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::PgDocSyncError;

/// The shape of a child's contribution to the parent document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Embed the child as a record (object or array of objects).
    Object,
    /// Embed a single projected column's value (or array of values).
    Scalar,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Object => "object",
            Variant::Scalar => "scalar",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PgDocSyncError> {
        match s {
            "object" => Ok(Variant::Object),
            "scalar" => Ok(Variant::Scalar),
            other => Err(PgDocSyncError::RelationshipVariantError(other.to_string())),
        }
    }
}

/// Cardinality from parent toward child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
}

impl Cardinality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::OneToOne => "one_to_one",
            Cardinality::OneToMany => "one_to_many",
        }
    }

    pub fn parse(s: &str) -> Result<Self, PgDocSyncError> {
        match s {
            "one_to_one" => Ok(Cardinality::OneToOne),
            "one_to_many" => Ok(Cardinality::OneToMany),
            other => Err(PgDocSyncError::RelationshipTypeError(other.to_string())),
        }
    }

    pub fn is_many(&self) -> bool {
        matches!(self, Cardinality::OneToMany)
    }
}

/// Explicit foreign-key column pairing, when the catalog's discovered FK
/// is ambiguous or the user wants to override it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplicitForeignKey {
    pub parent: Vec<String>,
    pub child: Vec<String>,
}

/// Raw `relationship` sub-document, as supplied by the user.
///
/// Deserialized permissively into a map first (see
/// [`RelationshipSpec::from_raw`]) so that unrecognized keys can be
/// reported with [`PgDocSyncError::RelationshipAttributeError`] instead of
/// silently ignored, per spec.md §4.1.
#[derive(Debug, Clone)]
pub struct RelationshipSpec {
    pub variant: Variant,
    pub cardinality: Cardinality,
    pub through_tables: Vec<String>,
    pub foreign_key: Option<ExplicitForeignKey>,
}

const RECOGNIZED_RELATIONSHIP_KEYS: &[&str] =
    &["variant", "type", "through_tables", "foreign_key"];

impl RelationshipSpec {
    /// Parse a relationship sub-document from its raw JSON representation,
    /// rejecting any key outside [`RECOGNIZED_RELATIONSHIP_KEYS`].
    pub fn from_raw(raw: &serde_json::Map<String, serde_json::Value>) -> Result<Self, PgDocSyncError> {
        let unknown: std::collections::BTreeSet<String> = raw
            .keys()
            .filter(|k| !RECOGNIZED_RELATIONSHIP_KEYS.contains(&k.as_str()))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(PgDocSyncError::RelationshipAttributeError(format!(
                "{:?}",
                unknown
            )));
        }

        let variant = match raw.get("variant").and_then(|v| v.as_str()) {
            Some(s) => Variant::parse(s)?,
            None => {
                return Err(PgDocSyncError::RelationshipAttributeError(
                    "missing \"variant\"".to_string(),
                ))
            }
        };
        let cardinality = match raw.get("type").and_then(|v| v.as_str()) {
            Some(s) => Cardinality::parse(s)?,
            None => {
                return Err(PgDocSyncError::RelationshipAttributeError(
                    "missing \"type\"".to_string(),
                ))
            }
        };
        let through_tables = raw
            .get("through_tables")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let foreign_key = match raw.get("foreign_key") {
            Some(v) => Some(serde_json::from_value(v.clone()).map_err(|e| {
                PgDocSyncError::RelationshipAttributeError(format!("invalid foreign_key: {e}"))
            })?),
            None => None,
        };

        Ok(RelationshipSpec {
            variant,
            cardinality,
            through_tables,
            foreign_key,
        })
    }
}

/// Field transforms applied to a node's projected columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transform {
    /// `from -> to` column rename map, applied after projection and
    /// before embedding into the parent.
    #[serde(default)]
    pub rename: HashMap<String, String>,
}

/// The raw, user-supplied schema tree node, as deserialized from a schema
/// document (spec.md §6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaNodeSpec {
    pub table: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub transform: Transform,
    /// Raw relationship document; parsed by the compiler via
    /// [`RelationshipSpec::from_raw`] so unknown keys produce the typed
    /// `RelationshipAttributeError`, not a generic deserialize failure.
    #[serde(default)]
    pub relationship: Option<serde_json::Value>,
    #[serde(default)]
    pub children: Vec<SchemaNodeSpec>,
}

impl SchemaNodeSpec {
    /// The effective label: `label` if present and non-null, else `table`.
    pub fn effective_label(&self) -> &str {
        match &self.label {
            Some(l) if !l.is_empty() => l,
            _ => &self.table,
        }
    }
}

/// A validated, catalog-resolved schema tree node. Immutable for the
/// lifetime of the index's run (spec.md §3 "Lifecycle").
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub table: String,
    /// Resolved projected columns, in catalog order. Never empty.
    pub columns: Vec<String>,
    /// The table's primary key column(s), in catalog order.
    pub primary_key: Vec<String>,
    pub label: String,
    pub transform: Transform,
    /// `None` only for the root node.
    pub relationship: Option<CompiledRelationship>,
    pub children: Vec<CompiledNode>,
}

/// One join step in a parent-to-child path: join the previous table
/// (the relationship's parent, or the prior hop) to `table` on the given
/// column pairs.
#[derive(Debug, Clone)]
pub struct JoinHop {
    /// Schema-qualified table joined at this hop.
    pub table: String,
    /// Columns on the *previous* table in the chain.
    pub prev_columns: Vec<String>,
    /// Columns on `table` matching `prev_columns` positionally.
    pub this_columns: Vec<String>,
}

/// A validated relationship from a node to its parent.
#[derive(Debug, Clone)]
pub struct CompiledRelationship {
    pub variant: Variant,
    pub cardinality: Cardinality,
    /// The full parent-to-child join path. The last hop's `table` is
    /// always the child node's own table; any earlier hops are
    /// through-tables, in parent-to-child order. A direct FK (no
    /// through-tables) has exactly one hop.
    pub join_path: Vec<JoinHop>,
    /// Through-table chain, parent-to-child order. Empty for a direct FK.
    pub through_tables: Vec<String>,
}

impl CompiledNode {
    /// Depth-first iterator over this node and every descendant.
    pub fn iter(&self) -> CompiledNodeIter<'_> {
        CompiledNodeIter { stack: vec![self] }
    }
}

pub struct CompiledNodeIter<'a> {
    stack: Vec<&'a CompiledNode>,
}

impl<'a> Iterator for CompiledNodeIter<'a> {
    type Item = &'a CompiledNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        for child in node.children.iter().rev() {
            self.stack.push(child);
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_parse() {
        assert_eq!(Variant::parse("object").unwrap(), Variant::Object);
        assert_eq!(Variant::parse("scalar").unwrap(), Variant::Scalar);
        assert!(Variant::parse("abcdefg").is_err());
    }

    #[test]
    fn test_cardinality_parse() {
        assert_eq!(
            Cardinality::parse("one_to_one").unwrap(),
            Cardinality::OneToOne
        );
        assert!(Cardinality::parse("qwerty").is_err());
    }

    #[test]
    fn test_effective_label_falls_back_to_table() {
        let node = SchemaNodeSpec {
            table: "publisher".into(),
            columns: vec![],
            label: None,
            transform: Transform::default(),
            relationship: None,
            children: vec![],
        };
        assert_eq!(node.effective_label(), "publisher");

        let node_null_label = SchemaNodeSpec {
            label: Some(String::new()),
            ..node.clone()
        };
        assert_eq!(node_null_label.effective_label(), "publisher");
    }

    #[test]
    fn test_relationship_unknown_attribute_rejected() {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(
            r#"{"foo": "object", "type": "one_to_one"}"#,
        )
        .unwrap();
        let err = RelationshipSpec::from_raw(&raw).unwrap_err();
        match err {
            PgDocSyncError::RelationshipAttributeError(msg) => assert!(msg.contains("foo")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_relationship_invalid_variant_rejected() {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(
            r#"{"variant": "abcdefg", "type": "one_to_one"}"#,
        )
        .unwrap();
        let err = RelationshipSpec::from_raw(&raw).unwrap_err();
        assert!(matches!(err, PgDocSyncError::RelationshipVariantError(_)));
    }

    #[test]
    fn test_relationship_invalid_type_rejected() {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(
            r#"{"variant": "object", "type": "qwerty"}"#,
        )
        .unwrap();
        let err = RelationshipSpec::from_raw(&raw).unwrap_err();
        assert!(matches!(err, PgDocSyncError::RelationshipTypeError(_)));
    }
}
