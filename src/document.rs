//! Assembled-document helpers — `_id` rendering.
//!
//! The Planner (§4.2) emits one row per root primary key, with the document
//! body (including its `_meta` block, built entirely by the Planner's own
//! `jsonb_build_object`/`jsonb_agg` SQL) already assembled; this module
//! turns that row's primary-key value(s) into the sink's document id
//! (spec.md §5 "Document shape").

use serde_json::Value;

/// Key under which descendant primary keys are nested in an assembled
/// document.
pub const META_KEY: &str = "_meta";

/// ASCII unit separator used to join composite primary-key components into
/// a single `_id` string (spec.md §9 Open Question: composite keys render
/// as their components joined by `\x1f`, never `-` or `,`, since either can
/// legitimately appear inside a key component's own text representation).
pub const ID_SEPARATOR: char = '\x1f';

/// Render a (possibly composite) primary key as the sink document id.
///
/// A single-column key renders as that column's value, stringified. A
/// multi-column key renders as each column's stringified value joined by
/// [`ID_SEPARATOR`], in the primary key's catalog-declared column order.
pub fn render_id(values: &[Value]) -> String {
    values
        .iter()
        .map(stringify_pk_component)
        .collect::<Vec<_>>()
        .join(&ID_SEPARATOR.to_string())
}

/// Stringify a single primary-key component for inclusion in a rendered
/// `_id`. Strings are used verbatim (no quoting); every other JSON scalar
/// uses its canonical `serde_json` text form. A primary key column is never
/// itself an object or array, so those arms exist only to stay total.
fn stringify_pk_component(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// An assembled document ready for the Index Sink: the rendered `_id` and
/// the full JSON body (including `_meta`).
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledDocument {
    pub id: String,
    pub body: Value,
}

impl AssembledDocument {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_id_single_column() {
        assert_eq!(render_id(&[json!(42)]), "42");
        assert_eq!(render_id(&[json!("abc")]), "abc");
    }

    #[test]
    fn test_render_id_composite_uses_unit_separator() {
        let id = render_id(&[json!("us"), json!("CA"), json!(94107)]);
        assert_eq!(id, "us\u{1f}CA\u{1f}94107");
    }
}
