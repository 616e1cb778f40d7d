//! Catalog introspection.
//!
//! Reads the structure of a live database from the PostgreSQL system catalogs
//! into a [`CatalogSnapshot`]. Definitions are captured with the server's own
//! `pg_get_*def` functions so that two snapshots taken from the same server
//! version compare textually.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tokio_postgres::Client;
use tracing::debug;

use crate::connection::quote_identifier;
use crate::error::{MigrateResult, MigrationError};

/// A schema-qualified object name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    /// Schema name.
    pub schema: String,
    /// Object name.
    pub name: String,
}

impl QualifiedName {
    /// Create a new qualified name.
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            quote_identifier(&self.schema),
            quote_identifier(&self.name)
        )
    }
}

/// An installed extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    /// Schema the extension objects live in.
    pub schema: String,
    /// Installed version.
    pub version: String,
}

/// A standalone or serial sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    /// Value type, e.g. `bigint`.
    pub data_type: String,
    /// Start value.
    pub start: i64,
    /// Increment.
    pub increment: i64,
    /// Minimum value.
    pub min: i64,
    /// Maximum value.
    pub max: i64,
    /// Cache size.
    pub cache: i64,
    /// Whether the sequence wraps around.
    pub cycle: bool,
    /// Column owning the sequence.
    pub owned_by: Option<(QualifiedName, String)>,
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Formatted type including modifiers.
    pub data_type: String,
    /// `NOT NULL` flag.
    pub not_null: bool,
    /// Default expression.
    pub default: Option<String>,
    /// Identity kind: `a` (always) or `d` (by default).
    pub identity: Option<char>,
    /// Stored generation expression.
    pub generated: Option<String>,
    /// Non-default collation.
    pub collation: Option<String>,
}

/// Constraint kind, as stored in `pg_constraint.contype`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConstraintKind {
    /// Primary key.
    PrimaryKey,
    /// Unique.
    Unique,
    /// Check.
    Check,
    /// Exclusion.
    Exclusion,
    /// Foreign key.
    ForeignKey,
}

impl ConstraintKind {
    fn from_code(code: &str) -> Option<Self> {
        match code {
            "p" => Some(Self::PrimaryKey),
            "u" => Some(Self::Unique),
            "c" => Some(Self::Check),
            "x" => Some(Self::Exclusion),
            "f" => Some(Self::ForeignKey),
            _ => None,
        }
    }
}

/// A table constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    /// Kind.
    pub kind: ConstraintKind,
    /// Definition from `pg_get_constraintdef`.
    pub definition: String,
}

/// A table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    /// Columns in attribute order.
    pub columns: Vec<Column>,
    /// Constraints keyed by name.
    pub constraints: BTreeMap<String, Constraint>,
    /// `PARTITION BY` clause for partitioned tables.
    pub partition_key: Option<String>,
    /// Parent table and bound for partitions.
    pub partition_of: Option<(QualifiedName, String)>,
}

impl Table {
    /// Look up a column.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// An index not backing a constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    /// Indexed table.
    pub table: QualifiedName,
    /// Definition from `pg_get_indexdef`.
    pub definition: String,
}

/// A view or materialized view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    /// Whether this is a materialized view.
    pub materialized: bool,
    /// Query from `pg_get_viewdef`.
    pub definition: String,
    /// Creation order.
    pub order: i64,
}

/// A function or procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Name.
    pub name: QualifiedName,
    /// Identity argument list.
    pub identity_args: String,
    /// Whether this is a procedure.
    pub procedure: bool,
    /// Full `CREATE OR REPLACE` statement.
    pub definition: String,
    /// Creation order.
    pub order: i64,
}

impl Function {
    /// `"schema"."name"(args)` signature.
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.identity_args)
    }
}

/// A trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    /// Table the trigger is on.
    pub table: QualifiedName,
    /// Trigger name.
    pub name: String,
    /// Definition from `pg_get_triggerdef`.
    pub definition: String,
}

/// Structure of one database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    /// User schemas.
    pub schemas: BTreeSet<String>,
    /// Extensions keyed by name.
    pub extensions: BTreeMap<String, Extension>,
    /// Enum labels in sort order.
    pub enums: BTreeMap<QualifiedName, Vec<String>>,
    /// Sequences not backing identity columns.
    pub sequences: BTreeMap<QualifiedName, Sequence>,
    /// Tables.
    pub tables: BTreeMap<QualifiedName, Table>,
    /// Indexes.
    pub indexes: BTreeMap<QualifiedName, Index>,
    /// Views and materialized views.
    pub views: BTreeMap<QualifiedName, View>,
    /// Functions keyed by signature.
    pub functions: BTreeMap<String, Function>,
    /// Triggers keyed by table and name.
    pub triggers: BTreeMap<(QualifiedName, String), Trigger>,
}

/// Filter shared by every query: user schemas, optionally restricted by `$1`.
const SCHEMA_FILTER: &str = "n.nspname NOT IN ('pg_catalog', 'information_schema') \
     AND n.nspname NOT LIKE 'pg\\_%' \
     AND (cardinality($1::text[]) = 0 OR n.nspname = ANY($1::text[]))";

fn not_extension_member(catalog: &str, oid: &str) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM pg_depend e WHERE e.classid = '{}'::regclass \
         AND e.objid = {} AND e.deptype = 'e')",
        catalog, oid
    )
}

fn schemas_sql() -> String {
    format!(
        "SELECT n.nspname::text FROM pg_namespace n WHERE {} AND {}",
        SCHEMA_FILTER,
        not_extension_member("pg_namespace", "n.oid")
    )
}

const EXTENSIONS_SQL: &str = "SELECT e.extname::text, n.nspname::text, e.extversion::text \
     FROM pg_extension e JOIN pg_namespace n ON n.oid = e.extnamespace \
     WHERE e.extname <> 'plpgsql' \
       AND (cardinality($1::text[]) = 0 OR n.nspname = ANY($1::text[]))";

fn enums_sql() -> String {
    format!(
        "SELECT n.nspname::text, t.typname::text, \
                array_agg(e.enumlabel::text ORDER BY e.enumsortorder) \
         FROM pg_type t \
         JOIN pg_namespace n ON n.oid = t.typnamespace \
         JOIN pg_enum e ON e.enumtypid = t.oid \
         WHERE {} AND {} \
         GROUP BY n.nspname, t.typname",
        SCHEMA_FILTER,
        not_extension_member("pg_type", "t.oid")
    )
}

fn sequences_sql() -> String {
    format!(
        "SELECT n.nspname::text, c.relname::text, format_type(s.seqtypid, NULL), \
                s.seqstart, s.seqincrement, s.seqmin, s.seqmax, s.seqcache, s.seqcycle, \
                dn.nspname::text, dc.relname::text, a.attname::text \
         FROM pg_sequence s \
         JOIN pg_class c ON c.oid = s.seqrelid \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         LEFT JOIN pg_depend d ON d.classid = 'pg_class'::regclass AND d.objid = c.oid \
              AND d.refclassid = 'pg_class'::regclass AND d.deptype = 'a' \
         LEFT JOIN pg_class dc ON dc.oid = d.refobjid \
         LEFT JOIN pg_namespace dn ON dn.oid = dc.relnamespace \
         LEFT JOIN pg_attribute a ON a.attrelid = d.refobjid AND a.attnum = d.refobjsubid \
         WHERE {} AND {} \
           AND NOT EXISTS (SELECT 1 FROM pg_depend i WHERE i.classid = 'pg_class'::regclass \
                           AND i.objid = c.oid AND i.deptype = 'i')",
        SCHEMA_FILTER,
        not_extension_member("pg_class", "c.oid")
    )
}

fn tables_sql() -> String {
    format!(
        "SELECT n.nspname::text, c.relname::text, \
                CASE WHEN c.relkind = 'p' THEN pg_get_partkeydef(c.oid) END, \
                pn.nspname::text, pc.relname::text, \
                CASE WHEN c.relispartition THEN pg_get_expr(c.relpartbound, c.oid) END \
         FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         LEFT JOIN pg_inherits i ON i.inhrelid = c.oid AND c.relispartition \
         LEFT JOIN pg_class pc ON pc.oid = i.inhparent \
         LEFT JOIN pg_namespace pn ON pn.oid = pc.relnamespace \
         WHERE c.relkind IN ('r', 'p') AND c.relpersistence <> 't' AND {} AND {}",
        SCHEMA_FILTER,
        not_extension_member("pg_class", "c.oid")
    )
}

fn columns_sql() -> String {
    format!(
        "SELECT n.nspname::text, c.relname::text, a.attname::text, \
                format_type(a.atttypid, a.atttypmod), a.attnotnull, \
                pg_get_expr(ad.adbin, ad.adrelid), a.attidentity::text, a.attgenerated::text, \
                CASE WHEN a.attcollation <> t.typcollation THEN co.collname::text END \
         FROM pg_attribute a \
         JOIN pg_class c ON c.oid = a.attrelid \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         JOIN pg_type t ON t.oid = a.atttypid \
         LEFT JOIN pg_attrdef ad ON ad.adrelid = a.attrelid AND ad.adnum = a.attnum \
         LEFT JOIN pg_collation co ON co.oid = a.attcollation \
         WHERE a.attnum > 0 AND NOT a.attisdropped AND c.relkind IN ('r', 'p') AND {} \
         ORDER BY n.nspname, c.relname, a.attnum",
        SCHEMA_FILTER
    )
}

fn constraints_sql() -> String {
    format!(
        "SELECT n.nspname::text, c.relname::text, con.conname::text, con.contype::text, \
                pg_get_constraintdef(con.oid) \
         FROM pg_constraint con \
         JOIN pg_class c ON c.oid = con.conrelid \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE con.contype IN ('p', 'u', 'c', 'x', 'f') AND con.conislocal \
           AND c.relkind IN ('r', 'p') AND {}",
        SCHEMA_FILTER
    )
}

fn indexes_sql() -> String {
    format!(
        "SELECT n.nspname::text, ic.relname::text, tn.nspname::text, tc.relname::text, \
                pg_get_indexdef(i.indexrelid) \
         FROM pg_index i \
         JOIN pg_class ic ON ic.oid = i.indexrelid \
         JOIN pg_namespace n ON n.oid = ic.relnamespace \
         JOIN pg_class tc ON tc.oid = i.indrelid \
         JOIN pg_namespace tn ON tn.oid = tc.relnamespace \
         WHERE tc.relkind IN ('r', 'p', 'm') AND {} AND {} \
           AND NOT EXISTS (SELECT 1 FROM pg_constraint con WHERE con.conindid = i.indexrelid \
                           AND con.contype IN ('p', 'u', 'x')) \
           AND NOT EXISTS (SELECT 1 FROM pg_inherits inh WHERE inh.inhrelid = i.indexrelid)",
        SCHEMA_FILTER,
        not_extension_member("pg_class", "tc.oid")
    )
}

fn views_sql() -> String {
    format!(
        "SELECT n.nspname::text, c.relname::text, c.relkind = 'm', \
                pg_get_viewdef(c.oid, true), c.oid::bigint \
         FROM pg_class c \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE c.relkind IN ('v', 'm') AND {} AND {}",
        SCHEMA_FILTER,
        not_extension_member("pg_class", "c.oid")
    )
}

fn functions_sql() -> String {
    format!(
        "SELECT n.nspname::text, p.proname::text, pg_get_function_identity_arguments(p.oid), \
                p.prokind = 'p', pg_get_functiondef(p.oid), p.oid::bigint \
         FROM pg_proc p \
         JOIN pg_namespace n ON n.oid = p.pronamespace \
         WHERE p.prokind IN ('f', 'p') AND {} AND {}",
        SCHEMA_FILTER,
        not_extension_member("pg_proc", "p.oid")
    )
}

fn triggers_sql() -> String {
    format!(
        "SELECT n.nspname::text, c.relname::text, t.tgname::text, pg_get_triggerdef(t.oid, true) \
         FROM pg_trigger t \
         JOIN pg_class c ON c.oid = t.tgrelid \
         JOIN pg_namespace n ON n.oid = c.relnamespace \
         WHERE NOT t.tgisinternal AND t.tgparentid = 0 AND {}",
        SCHEMA_FILTER
    )
}

fn single_char(value: Option<String>) -> Option<char> {
    value.and_then(|v| v.chars().next())
}

impl CatalogSnapshot {
    /// Introspect the database behind `client`.
    ///
    /// `schemas` restricts the snapshot; empty means every user schema.
    pub async fn load(client: &Client, schemas: &[String]) -> MigrateResult<Self> {
        let filter: Vec<String> = schemas.to_vec();
        let params: [&(dyn tokio_postgres::types::ToSql + Sync); 1] = [&filter];
        let mut snapshot = Self::default();

        for row in client.query(&schemas_sql(), &params).await? {
            snapshot.schemas.insert(row.get(0));
        }

        for row in client.query(EXTENSIONS_SQL, &params).await? {
            snapshot.extensions.insert(
                row.get(0),
                Extension {
                    schema: row.get(1),
                    version: row.get(2),
                },
            );
        }

        for row in client.query(&enums_sql(), &params).await? {
            let name = QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1));
            snapshot.enums.insert(name, row.get(2));
        }

        for row in client.query(&sequences_sql(), &params).await? {
            let owner_schema: Option<String> = row.get(9);
            let owner_table: Option<String> = row.get(10);
            let owner_column: Option<String> = row.get(11);
            let owned_by = match (owner_schema, owner_table, owner_column) {
                (Some(schema), Some(table), Some(column)) => {
                    Some((QualifiedName::new(schema, table), column))
                }
                _ => None,
            };
            snapshot.sequences.insert(
                QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1)),
                Sequence {
                    data_type: row.get(2),
                    start: row.get(3),
                    increment: row.get(4),
                    min: row.get(5),
                    max: row.get(6),
                    cache: row.get(7),
                    cycle: row.get(8),
                    owned_by,
                },
            );
        }

        for row in client.query(&tables_sql(), &params).await? {
            let parent_schema: Option<String> = row.get(3);
            let parent_table: Option<String> = row.get(4);
            let bound: Option<String> = row.get(5);
            let partition_of = match (parent_schema, parent_table, bound) {
                (Some(schema), Some(table), Some(bound)) => {
                    Some((QualifiedName::new(schema, table), bound))
                }
                _ => None,
            };
            snapshot.tables.insert(
                QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1)),
                Table {
                    partition_key: row.get(2),
                    partition_of,
                    ..Default::default()
                },
            );
        }

        for row in client.query(&columns_sql(), &params).await? {
            let key = QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1));
            let Some(table) = snapshot.tables.get_mut(&key) else {
                continue;
            };
            let generated = single_char(row.get(7)).filter(|c| *c == 's');
            let expression: Option<String> = row.get(5);
            table.columns.push(Column {
                name: row.get(2),
                data_type: row.get(3),
                not_null: row.get(4),
                default: if generated.is_some() {
                    None
                } else {
                    expression.clone()
                },
                identity: single_char(row.get(6)),
                generated: generated.and(expression),
                collation: row.get(8),
            });
        }

        for row in client.query(&constraints_sql(), &params).await? {
            let key = QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1));
            let code: String = row.get(3);
            let kind = ConstraintKind::from_code(&code).ok_or_else(|| {
                MigrationError::diff(format!("unexpected constraint type '{}'", code))
            })?;
            if let Some(table) = snapshot.tables.get_mut(&key) {
                table.constraints.insert(
                    row.get(2),
                    Constraint {
                        kind,
                        definition: row.get(4),
                    },
                );
            }
        }

        for row in client.query(&indexes_sql(), &params).await? {
            snapshot.indexes.insert(
                QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1)),
                Index {
                    table: QualifiedName::new(row.get::<_, String>(2), row.get::<_, String>(3)),
                    definition: row.get(4),
                },
            );
        }

        for row in client.query(&views_sql(), &params).await? {
            snapshot.views.insert(
                QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1)),
                View {
                    materialized: row.get(2),
                    definition: row.get(3),
                    order: row.get(4),
                },
            );
        }

        for row in client.query(&functions_sql(), &params).await? {
            let function = Function {
                name: QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1)),
                identity_args: row.get(2),
                procedure: row.get(3),
                definition: row.get(4),
                order: row.get(5),
            };
            snapshot.functions.insert(function.signature(), function);
        }

        for row in client.query(&triggers_sql(), &params).await? {
            let table = QualifiedName::new(row.get::<_, String>(0), row.get::<_, String>(1));
            let name: String = row.get(2);
            snapshot.triggers.insert(
                (table.clone(), name.clone()),
                Trigger {
                    table,
                    name,
                    definition: row.get(3),
                },
            );
        }

        debug!(
            tables = snapshot.tables.len(),
            indexes = snapshot.indexes.len(),
            views = snapshot.views.len(),
            functions = snapshot.functions.len(),
            "Introspected catalog"
        );
        Ok(snapshot)
    }

    /// Check if the snapshot holds no user objects besides empty schemas.
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
            && self.enums.is_empty()
            && self.sequences.is_empty()
            && self.tables.is_empty()
            && self.indexes.is_empty()
            && self.views.is_empty()
            && self.functions.is_empty()
            && self.triggers.is_empty()
    }
}
