//! Query Planner — compiles a [`CompiledNode`] tree into the SQL the
//! Document Builder runs to assemble documents (spec.md §4.2).
//!
//! Grounded on `pg_trickle::dvm::diff`'s SQL-building helpers
//! (`quote_ident`, `col_list`, its `DiffContext` accumulate-then-render
//! style) retargeted from delta-CTE text to `jsonb_build_object` /
//! `jsonb_agg` document assembly. Like `diff.rs`, this module only ever
//! produces SQL *text* — it never talks to the database itself; the
//! Document Builder (§4.5) is the one that runs the queries this module
//! returns.

use std::fmt::Write as _;

use crate::schema::{Cardinality, CompiledNode, CompiledRelationship, JoinHop, Variant};

/// Quote a Postgres identifier, doubling embedded `"`.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a schema-qualified table name (`schema.table`) as two quoted
/// identifiers joined by `.`.
fn quote_qualified(qualified: &str) -> String {
    match qualified.split_once('.') {
        Some((schema, table)) => format!("{}.{}", quote_ident(schema), quote_ident(table)),
        None => quote_ident(qualified),
    }
}

/// `a.col1 = b.col1 AND a.col2 = b.col2 ...` for equal-length column lists.
fn cols_eq(alias_a: &str, cols_a: &[String], alias_b: &str, cols_b: &[String]) -> String {
    cols_a
        .iter()
        .zip(cols_b.iter())
        .map(|(a, b)| format!("{}.{} = {}.{}", alias_a, quote_ident(a), alias_b, quote_ident(b)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `alias.col1, alias.col2, ...`
fn prefixed_col_list(alias: &str, cols: &[String]) -> String {
    cols.iter()
        .map(|c| format!("{}.{}", alias, quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `to_jsonb(alias.col1), to_jsonb(alias.col2), ...` — used for primary-key
/// column lists a caller reads back through `tokio-postgres`'s `serde_json`
/// bridge. Only TEXT-like columns round-trip through `FromSql<String>`;
/// wrapping every column in `to_jsonb` first lets an integer, `uuid`, or
/// composite-typed primary key decode the same way a text one does.
fn prefixed_jsonb_col_list(alias: &str, cols: &[String]) -> String {
    cols.iter()
        .map(|c| format!("to_jsonb({}.{})", alias, quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Monotonic alias generator so nested/sibling subqueries never collide.
struct AliasGen {
    next: u32,
}

impl AliasGen {
    fn new() -> Self {
        Self { next: 0 }
    }

    fn next(&mut self) -> String {
        let alias = format!("t{}", self.next);
        self.next += 1;
        alias
    }
}

/// `FROM`+`JOIN` text and a correlation `WHERE` fragment tying the chain's
/// first table back to `parent_alias`.
struct JoinChain {
    from_and_joins: String,
    /// `NULL`-safe equality tying the chain's nearest table to
    /// `parent_alias`; empty if `join_path` is empty (same table).
    correlation: String,
    /// Alias of the chain's final (innermost/target) table.
    target_alias: String,
}

/// Build the `FROM`/`JOIN` text for a parent-to-target join path, with the
/// final table aliased `target_alias` and a correlation condition against
/// `parent_alias` (which is *not* part of this chain's `FROM` — it's the
/// enclosing query's row).
fn build_join_chain(
    join_path: &[JoinHop],
    parent_alias: &str,
    aliases: &mut AliasGen,
) -> JoinChain {
    let n = join_path.len();
    // alias[0] = parent_alias (outer, not in FROM); alias[n] = target.
    let mut table_aliases: Vec<String> = vec![parent_alias.to_string()];
    for _ in 1..n {
        table_aliases.push(aliases.next());
    }
    let target_alias = aliases.next();
    table_aliases.push(target_alias.clone());

    let last_table = &join_path[n - 1].table;
    let mut from_and_joins = format!("{} AS {}", quote_qualified(last_table), target_alias);
    let mut correlation = String::new();

    for k in (1..=n).rev() {
        let hop = &join_path[k - 1];
        let cond = cols_eq(
            &table_aliases[k],
            &hop.this_columns,
            &table_aliases[k - 1],
            &hop.prev_columns,
        );
        if k - 1 == 0 {
            correlation = cond;
        } else {
            let tbl = &join_path[k - 2].table;
            let _ = write!(
                from_and_joins,
                " JOIN {} AS {} ON {}",
                quote_qualified(tbl),
                table_aliases[k - 1],
                cond
            );
        }
    }

    JoinChain {
        from_and_joins,
        correlation,
        target_alias,
    }
}

/// `FROM root_table AS root_alias JOIN hop0.table AS alias0 ON ... JOIN
/// hopN.table AS aliasN ON ...`, walking `path` forward starting at
/// `root_alias` (already part of the enclosing `FROM`, unlike
/// [`build_join_chain`]'s externally-correlated subqueries). Returns the
/// `FROM`/`JOIN` text and the final table's alias — `root_alias` itself
/// when `path` is empty.
fn build_forward_chain(
    root_table: &str,
    root_alias: &str,
    path: &[JoinHop],
    aliases: &mut AliasGen,
) -> (String, String) {
    let mut from = format!("{} AS {}", quote_qualified(root_table), root_alias);
    let mut prev_alias = root_alias.to_string();
    let mut target_alias = root_alias.to_string();
    for hop in path {
        let alias = aliases.next();
        let _ = write!(
            from,
            " JOIN {} AS {} ON {}",
            quote_qualified(&hop.table),
            alias,
            cols_eq(&alias, &hop.this_columns, &prev_alias, &hop.prev_columns)
        );
        prev_alias = alias.clone();
        target_alias = alias;
    }
    (from, target_alias)
}

/// Find `table` anywhere in the schema tree rooted at `node` (the root
/// itself, or any descendant), returning the matching node and the
/// flattened root-to-node join path (empty if `table` is the root).
fn find_node_and_path<'n>(node: &'n CompiledNode, table: &str) -> Option<(&'n CompiledNode, Vec<JoinHop>)> {
    if node.table == table {
        return Some((node, vec![]));
    }
    for child in &node.children {
        if let Some((found, mut path)) = find_node_and_path(child, table) {
            let rel = child.relationship.as_ref()?;
            let mut prefix = rel.join_path.clone();
            prefix.append(&mut path);
            return Some((found, prefix));
        }
    }
    None
}

/// A fully planned document-assembly query.
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    /// Full snapshot: every root row, no filter.
    pub full_snapshot_sql: String,
    /// Restricted to a caller-supplied set of rendered root keys, passed as
    /// `$1::jsonb` — a JSON array of (possibly composite, as a nested
    /// array) primary-key values. Used by the Document Builder to rebuild
    /// just the roots a change affected (spec.md §4.5).
    pub root_keys_sql: String,
    /// The root table's primary-key column names, in catalog order —
    /// callers need these to encode the `$1` parameter and to render the
    /// resulting row's `_id`.
    pub root_primary_key: Vec<String>,
}

/// The filter-by-descendant-key query (spec.md §4.2's third planner
/// variant): given `$1::jsonb`, a JSON array of (possibly composite) key
/// tuples for [`key_columns`](Self::key_columns) at the end of a join path
/// from the root, returns the matching rows' root primary keys. Consumed
/// by the Change Router's inverse-join resolution (spec.md §4.4) instead
/// of the Router building this join itself.
#[derive(Debug, Clone)]
pub struct DescendantKeyQuery {
    pub sql: String,
    pub key_columns: Vec<String>,
}

/// Compile a [`CompiledNode`] root into its document-assembly queries.
pub struct Planner<'n> {
    root: &'n CompiledNode,
}

impl<'n> Planner<'n> {
    pub fn new(root: &'n CompiledNode) -> Self {
        Self { root }
    }

    pub fn plan(&self) -> PlannedQuery {
        let mut aliases = AliasGen::new();
        let root_alias = aliases.next();

        let select_list = self.build_select_list(self.root, &root_alias, &mut aliases);
        let root_table = quote_qualified(&self.root.table);
        let root_pk_cols = prefixed_jsonb_col_list(&root_alias, &self.root.primary_key);

        let full_snapshot_sql = format!(
            "SELECT {root_pk_cols} AS root_pk, {select_list} AS document \
             FROM {root_table} AS {root_alias}",
        );

        let root_keys_sql = format!(
            "SELECT {root_pk_cols} AS root_pk, {select_list} AS document \
             FROM {root_table} AS {root_alias} \
             JOIN (SELECT elem FROM jsonb_array_elements($1::jsonb) AS elem) AS root_keys \
               ON {key_match}",
            key_match = composite_key_text_match(&root_alias, &self.root.primary_key),
        );

        PlannedQuery {
            full_snapshot_sql,
            root_keys_sql,
            root_primary_key: self.root.primary_key.clone(),
        }
    }

    /// The filter-by-descendant-key query for `table`, wherever it sits in
    /// the schema tree (the root itself, or any descendant node), keyed on
    /// that table's own catalog primary key (spec.md §4.2, §4.4). `None`
    /// if `table` isn't part of this tree.
    pub fn descendant_key_sql(&self, table: &str) -> Option<DescendantKeyQuery> {
        let (node, path) = find_node_and_path(self.root, table)?;
        Some(self.key_filter_sql(&path, &node.primary_key))
    }

    /// Build the filter-by-descendant-key query for an arbitrary join
    /// path from the root, matching `key_columns` on the path's final
    /// table (the root itself when `path` is empty) against a caller-
    /// supplied `$1::jsonb` array of key tuples. The lower-level primitive
    /// behind [`descendant_key_sql`](Self::descendant_key_sql), exposed
    /// directly for callers — the Change Router's foreign-key-repoint
    /// handling (spec.md §4.4) — that need to filter on a path prefix's
    /// key columns rather than a whole node's own declared primary key.
    pub fn key_filter_sql(&self, path: &[JoinHop], key_columns: &[String]) -> DescendantKeyQuery {
        let mut aliases = AliasGen::new();
        let root_alias = aliases.next();
        let root_pk_cols = prefixed_jsonb_col_list(&root_alias, &self.root.primary_key);
        let (from_and_joins, target_alias) =
            build_forward_chain(&self.root.table, &root_alias, path, &mut aliases);

        let sql = format!(
            "SELECT {root_pk_cols} FROM {from_and_joins} \
             JOIN (SELECT elem FROM jsonb_array_elements($1::jsonb) AS elem) AS root_keys \
               ON {key_match}",
            key_match = composite_key_text_match(&target_alias, key_columns),
        );

        DescendantKeyQuery {
            sql,
            key_columns: key_columns.to_vec(),
        }
    }

    /// Every current root primary key, unfiltered — the fallback for a
    /// truncated descendant, which leaves no per-row image to filter by
    /// (spec.md §4.3, §8).
    pub fn all_root_keys_sql(&self) -> String {
        let mut aliases = AliasGen::new();
        let root_alias = aliases.next();
        format!(
            "SELECT {cols} FROM {table} AS {root_alias}",
            cols = prefixed_jsonb_col_list(&root_alias, &self.root.primary_key),
            table = quote_qualified(&self.root.table),
        )
    }

    /// Build the `jsonb_build_object(...)` expression for `node`, aliased
    /// `alias` in the enclosing query, including every descendant's
    /// nested subquery and the node's own `_meta` block when it is the
    /// root.
    fn build_select_list(&self, node: &CompiledNode, alias: &str, aliases: &mut AliasGen) -> String {
        let mut args = Vec::with_capacity(node.columns.len() * 2 + node.children.len() * 2 + 2);
        for col in &node.columns {
            let key = node
                .transform
                .rename
                .get(col)
                .cloned()
                .unwrap_or_else(|| col.clone());
            args.push(sql_string_literal(&key));
            args.push(format!("{}.{}", alias, quote_ident(col)));
        }

        for child in &node.children {
            let rel = child
                .relationship
                .as_ref()
                .expect("non-root node always carries a relationship");
            let key = rel_key(child);
            let subquery = self.build_child_subquery(child, rel, alias, aliases);
            args.push(sql_string_literal(&key));
            args.push(subquery);
        }

        if node_is_root(node) {
            let meta_expr = self.build_meta_expr(node, alias, aliases);
            args.push(sql_string_literal(crate::document::META_KEY));
            args.push(meta_expr);
        }

        format!("jsonb_build_object({})", args.join(", "))
    }

    /// Build the correlated subquery that produces `child`'s contribution
    /// to its parent's `jsonb_build_object` call.
    fn build_child_subquery(
        &self,
        child: &CompiledNode,
        rel: &CompiledRelationship,
        parent_alias: &str,
        aliases: &mut AliasGen,
    ) -> String {
        let chain = build_join_chain(&rel.join_path, parent_alias, aliases);
        let child_alias = chain.target_alias.clone();
        let order_by = prefixed_col_list(&child_alias, &child.primary_key);

        match (rel.variant, rel.cardinality) {
            (Variant::Object, Cardinality::OneToOne) => {
                let inner = self.build_select_list(child, &child_alias, aliases);
                format!(
                    "(SELECT {inner} FROM {from} WHERE {corr} LIMIT 1)",
                    from = chain.from_and_joins,
                    corr = chain.correlation,
                )
            }
            (Variant::Object, Cardinality::OneToMany) => {
                let inner = self.build_select_list(child, &child_alias, aliases);
                format!(
                    "(SELECT coalesce(jsonb_agg({inner} ORDER BY {order_by}), '[]'::jsonb) \
                     FROM {from} WHERE {corr})",
                    from = chain.from_and_joins,
                    corr = chain.correlation,
                )
            }
            (Variant::Scalar, Cardinality::OneToOne) => {
                // Validated by the compiler to carry exactly one column.
                let col = &child.columns[0];
                format!(
                    "(SELECT {child_alias}.{col} FROM {from} WHERE {corr} LIMIT 1)",
                    col = quote_ident(col),
                    from = chain.from_and_joins,
                    corr = chain.correlation,
                )
            }
            (Variant::Scalar, Cardinality::OneToMany) => {
                let col = &child.columns[0];
                format!(
                    "(SELECT coalesce(jsonb_agg({child_alias}.{col} ORDER BY {order_by}), '[]'::jsonb) \
                     FROM {from} WHERE {corr})",
                    col = quote_ident(col),
                    from = chain.from_and_joins,
                    corr = chain.correlation,
                )
            }
        }
    }

    /// Build the root's `_meta` object: one entry per *transitive*
    /// descendant table, each a `{"<pk name>": [...]}` array of that
    /// table's contributing primary keys, correlated back to the root row.
    fn build_meta_expr(&self, root: &CompiledNode, root_alias: &str, aliases: &mut AliasGen) -> String {
        let mut entries = Vec::new();
        self.collect_meta_entries(root, root_alias, &[], aliases, &mut entries);
        if entries.is_empty() {
            return "'{}'::jsonb".to_string();
        }
        let args: Vec<String> = entries
            .into_iter()
            .flat_map(|(table, expr)| vec![sql_string_literal(&table), expr])
            .collect();
        format!("jsonb_build_object({})", args.join(", "))
    }

    /// Recurse into `node`'s children, concatenating `prefix_path`
    /// (root-to-`node`, empty when `node` is the root itself) with each
    /// child relationship's own path so every meta entry is correlated
    /// directly to `root_alias` by one flattened join chain.
    fn collect_meta_entries(
        &self,
        node: &CompiledNode,
        root_alias: &str,
        prefix_path: &[JoinHop],
        aliases: &mut AliasGen,
        out: &mut Vec<(String, String)>,
    ) {
        for child in &node.children {
            let rel = child
                .relationship
                .as_ref()
                .expect("non-root node always carries a relationship");
            let mut full_path = prefix_path.to_vec();
            full_path.extend(rel.join_path.iter().cloned());

            let chain = build_join_chain(&full_path, root_alias, aliases);
            let child_alias = chain.target_alias.clone();
            let pk_expr = if child.primary_key.len() == 1 {
                format!("to_jsonb({}.{})", child_alias, quote_ident(&child.primary_key[0]))
            } else {
                format!(
                    "to_jsonb(ARRAY[{}]::text[])",
                    child
                        .primary_key
                        .iter()
                        .map(|c| format!("{}.{}::text", child_alias, quote_ident(c)))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            };
            let pk_key = sql_string_literal(&meta_pk_key(&child.primary_key));
            let expr = format!(
                "jsonb_build_object({pk_key}, \
                 (SELECT coalesce(jsonb_agg(DISTINCT {pk_expr}), '[]'::jsonb) \
                  FROM {from} WHERE {corr}))",
                from = chain.from_and_joins,
                corr = chain.correlation,
            );
            out.push((child.table.clone(), expr));

            self.collect_meta_entries(child, root_alias, &full_path, aliases, out);
        }
    }
}

/// The JSON-doc key a child node contributes under: its rename (if any),
/// else its `label`.
fn rel_key(child: &CompiledNode) -> String {
    child.label.clone()
}

fn node_is_root(node: &CompiledNode) -> bool {
    node.relationship.is_none()
}

/// The `_meta.<table>` sub-key for a primary key: its column name, or each
/// component's name joined by `_` for a composite key — see
/// `crate::document`'s identical policy (spec.md §9 Open Question).
fn meta_pk_key(pk: &[String]) -> String {
    if pk.is_empty() {
        "pk".to_string()
    } else {
        pk.join("_")
    }
}

/// A single-quoted SQL string literal, with embedded quotes doubled.
fn sql_string_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// `alias.pk1::text = elem->>0 AND alias.pk2::text = elem->>1 ...`, used to
/// match a row's (possibly composite) primary key against a `jsonb` array
/// element carrying the same components in catalog order. Comparing as
/// text sidesteps needing the columns' concrete Postgres types here.
fn composite_key_text_match(alias: &str, pk: &[String]) -> String {
    pk.iter()
        .enumerate()
        .map(|(i, col)| format!("{}.{}::text = (root_keys.elem->>{})", alias, quote_ident(col), i))
        .collect::<Vec<_>>()
        .join(" AND ")
}
