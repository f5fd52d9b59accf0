//! Change capture triggers.
//!
//! For every replicated table the generator emits:
//!
//! - a guard rejecting updates to the primary key,
//! - a row in the trigger settings table (the per-table on/off flag),
//! - AFTER INSERT/UPDATE/DELETE triggers writing `json_object` rows into the
//!   oplog with a `NULL` timestamp, gated by that flag.
//!
//! Trigger bodies reference internal tables unqualified; SQLite does not
//! allow schema-qualified names inside a trigger body.

use std::sync::Arc;

use crate::adapter::{DatabaseAdapter, Statement};
use crate::config::InternalTables;
use crate::error::{Result, SyncError};
use crate::types::{
    ForeignKey, MigrationColumn, MigrationTable, Relation, RelationColumn, SqlValue, TableType,
};

pub trait TriggerGenerator: Send + Sync {
    /// Statements (re)creating the capture triggers for `table`.
    fn generate_triggers_for_table(&self, table: &MigrationTable) -> Result<Vec<Statement>>;
}

#[derive(Debug, Clone, Default)]
pub struct SqliteTriggerGenerator {
    tables: InternalTables,
}

impl SqliteTriggerGenerator {
    pub fn new(tables: InternalTables) -> Self {
        Self { tables }
    }

    fn drop_if_exists(name: &str) -> Statement {
        Statement::new(format!("DROP TRIGGER IF EXISTS {name};"))
    }

    /// Column reference inside `json_object`. Floats are cast to text so
    /// non-finite values survive JSON; blobs are hex encoded.
    fn json_value(row: &str, column: &MigrationColumn) -> String {
        let pg = column.pg_type.to_ascii_uppercase();
        let sqlite = column.sqlite_type.to_ascii_uppercase();
        if pg == "BYTEA" || sqlite == "BLOB" {
            format!("CASE WHEN {row}.\"{c}\" IS NOT NULL THEN hex({row}.\"{c}\") ELSE NULL END", c = column.name)
        } else if matches!(pg.as_str(), "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE PRECISION") || sqlite == "REAL" {
            format!("cast({row}.\"{c}\" as TEXT)", c = column.name)
        } else {
            format!("{row}.\"{}\"", column.name)
        }
    }

    fn json_object(row: &str, columns: &[&MigrationColumn]) -> String {
        let pairs: Vec<String> = columns
            .iter()
            .map(|c| format!("'{}', {}", c.name, Self::json_value(row, c)))
            .collect();
        format!("json_object({})", pairs.join(", "))
    }
}

impl TriggerGenerator for SqliteTriggerGenerator {
    fn generate_triggers_for_table(&self, table: &MigrationTable) -> Result<Vec<Statement>> {
        let ns = &self.tables.namespace;
        let name = &table.name;

        let pk = match table.pks.as_slice() {
            [single] => single,
            [] => {
                return Err(SyncError::Config(format!(
                    "table {name} has no primary key and cannot be replicated"
                )))
            }
            _ => {
                return Err(SyncError::Config(format!(
                    "table {name} has a compound primary key, which is not supported"
                )))
            }
        };
        if let Some(fk) = table.fks.iter().find(|fk| fk.fk_cols.len() != 1 || fk.pk_cols.len() != 1) {
            return Err(SyncError::Config(format!(
                "table {name} has a compound foreign key to {}, which is not supported",
                fk.pk_table
            )));
        }

        let mut columns: Vec<&MigrationColumn> = table.columns.iter().collect();
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        let pk_col = columns
            .iter()
            .find(|c| &c.name == pk)
            .copied()
            .ok_or_else(|| SyncError::Config(format!("primary key column {pk} missing from table {name}")))?;

        let oplog = &self.tables.oplog;
        let settings = &self.tables.triggers;
        let target = format!("\"{ns}\".\"{name}\"");
        let guard = format!("update_ensure_{ns}_{name}_primarykey");

        let mut stmts = vec![
            Self::drop_if_exists(&guard),
            Statement::new(format!(
                "CREATE TRIGGER {guard} BEFORE UPDATE ON {target} BEGIN \
                   SELECT CASE WHEN old.\"{pk}\" != new.\"{pk}\" THEN \
                     RAISE (ABORT, 'cannot change the value of column {pk} as it belongs to the primary key') \
                   END; \
                 END;"
            )),
            Statement::with_args(
                format!(
                    "INSERT OR IGNORE INTO {} (namespace, tablename, flag) VALUES (?, ?, 1)",
                    self.tables.triggers_table()
                ),
                vec![SqlValue::Text(ns.clone()), SqlValue::Text(name.clone())],
            ),
        ];

        for op in ["INSERT", "UPDATE", "DELETE"] {
            let trigger = format!("{}_{ns}_{name}_into_oplog", op.to_ascii_lowercase());
            let (new_row, old_row, pk_row) = match op {
                "INSERT" => (Self::json_object("new", &columns), "NULL".to_string(), "new"),
                "UPDATE" => (
                    Self::json_object("new", &columns),
                    Self::json_object("old", &columns),
                    "new",
                ),
                _ => ("NULL".to_string(), Self::json_object("old", &columns), "old"),
            };
            let primary_key = Self::json_object(pk_row, &[pk_col]);

            stmts.push(Self::drop_if_exists(&trigger));
            stmts.push(Statement::new(format!(
                "CREATE TRIGGER {trigger} AFTER {op} ON {target} \
                 WHEN 1 = (SELECT flag FROM {settings} WHERE namespace = '{ns}' AND tablename = '{name}') \
                 BEGIN \
                   INSERT INTO {oplog} (namespace, tablename, optype, primaryKey, newRow, oldRow, timestamp) \
                   VALUES ('{ns}', '{name}', '{op}', {primary_key}, {new_row}, {old_row}, NULL); \
                 END;"
            )));
        }

        Ok(stmts)
    }
}

/// Statements setting the capture flag for `tables`.
pub fn set_triggers_flag(internal: &InternalTables, tables: &[String], enabled: bool) -> Vec<Statement> {
    tables
        .iter()
        .map(|t| {
            Statement::with_args(
                format!(
                    "UPDATE {} SET flag = ? WHERE namespace = ? AND tablename = ?",
                    internal.triggers_table()
                ),
                vec![
                    SqlValue::Integer(i64::from(enabled)),
                    SqlValue::Text(internal.namespace.clone()),
                    SqlValue::Text(t.clone()),
                ],
            )
        })
        .collect()
}

// =============================================================================
// Local schema introspection
// =============================================================================

fn text(row: &crate::types::Record, col: &str) -> String {
    match row.get(col) {
        Some(SqlValue::Text(s)) => s.clone(),
        _ => String::new(),
    }
}

fn int(row: &crate::types::Record, col: &str) -> i64 {
    match row.get(col) {
        Some(SqlValue::Integer(i)) => *i,
        _ => 0,
    }
}

/// User tables in the database, internal tables excluded.
pub async fn list_user_tables(adapter: &dyn DatabaseAdapter, internal: &InternalTables) -> Result<Vec<String>> {
    let rows = adapter
        .query(Statement::new(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        ))
        .await?;
    Ok(rows
        .iter()
        .map(|r| text(r, "name"))
        .filter(|name| !internal.is_internal(name))
        .collect())
}

/// Read a table's shape from `pragma_table_info` and `pragma_foreign_key_list`.
pub async fn introspect_table(adapter: &dyn DatabaseAdapter, table: &str) -> Result<MigrationTable> {
    let cols = adapter
        .query(Statement::with_args(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?) ORDER BY cid",
            vec![SqlValue::Text(table.to_string())],
        ))
        .await?;
    if cols.is_empty() {
        return Err(SyncError::Config(format!("table {table} does not exist")));
    }

    let mut pks: Vec<(i64, String)> = cols
        .iter()
        .filter(|c| int(c, "pk") > 0)
        .map(|c| (int(c, "pk"), text(c, "name")))
        .collect();
    pks.sort();

    let fk_rows = adapter
        .query(Statement::with_args(
            "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?) ORDER BY id, seq",
            vec![SqlValue::Text(table.to_string())],
        ))
        .await?;
    let mut fks: Vec<(i64, ForeignKey)> = Vec::new();
    for row in &fk_rows {
        let id = int(row, "id");
        match fks.iter_mut().find(|(fid, _)| *fid == id) {
            Some((_, fk)) => {
                fk.fk_cols.push(text(row, "from"));
                fk.pk_cols.push(text(row, "to"));
            }
            None => fks.push((
                id,
                ForeignKey {
                    fk_cols: vec![text(row, "from")],
                    pk_table: text(row, "table"),
                    pk_cols: vec![text(row, "to")],
                },
            )),
        }
    }

    Ok(MigrationTable {
        name: table.to_string(),
        columns: cols
            .iter()
            .map(|c| {
                let ty = text(c, "type").to_ascii_uppercase();
                MigrationColumn {
                    name: text(c, "name"),
                    sqlite_type: ty.clone(),
                    pg_type: ty,
                }
            })
            .collect(),
        fks: fks.into_iter().map(|(_, fk)| fk).collect(),
        pks: pks.into_iter().map(|(_, name)| name).collect(),
    })
}

/// Relation descriptor for a local table, with the given id.
pub async fn infer_relation(
    adapter: &dyn DatabaseAdapter,
    namespace: &str,
    table: &str,
    id: u32,
) -> Result<Relation> {
    let cols = adapter
        .query(Statement::with_args(
            "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?) ORDER BY cid",
            vec![SqlValue::Text(table.to_string())],
        ))
        .await?;

    Ok(Relation {
        id,
        schema: namespace.to_string(),
        table: table.to_string(),
        table_type: TableType::Table,
        columns: cols
            .iter()
            .map(|c| RelationColumn {
                name: text(c, "name"),
                type_name: text(c, "type").to_ascii_uppercase(),
                is_nullable: int(c, "notnull") == 0,
                primary_key: u32::try_from(int(c, "pk")).ok().filter(|p| *p > 0),
            })
            .collect(),
    })
}

/// Install capture triggers on an existing local table.
pub async fn electrify_table(
    adapter: &Arc<dyn DatabaseAdapter>,
    generator: &dyn TriggerGenerator,
    table: &str,
) -> Result<()> {
    let shape = introspect_table(adapter.as_ref(), table).await?;
    let stmts = generator.generate_triggers_for_table(&shape)?;
    adapter.run_in_transaction(stmts).await?;
    Ok(())
}
