//! Conflict resolution between pending local changes and incoming changes.
//!
//! Columns are resolved last-writer-wins by timestamp, ties broken by the
//! lexicographically greater origin. Row existence is resolved on tags: a
//! delete only clears the tags it has observed, so a concurrent insert or
//! update elsewhere keeps the row alive.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::oplog::{
    generate_tag, local_operations_to_table_changes, remote_operations_to_table_changes,
    ChangesOpType, OplogColumnChanges, OplogEntry, OplogEntryChanges, PendingChanges,
    ShadowEntryChanges,
};
use crate::types::{Record, Tag};

/// Merge incoming entries with the local pending oplog.
///
/// Returns the incoming changes, grouped per table and key, rewritten so
/// that applying them leaves the row in the state the server converges to.
pub fn merge_entries(
    local_origin: &str,
    local: &[OplogEntry],
    incoming_origin: &str,
    incoming: &[OplogEntry],
) -> Result<PendingChanges> {
    let local_table_changes =
        local_operations_to_table_changes(local, |ts| generate_tag(local_origin, ts))?;
    let mut incoming_table_changes = remote_operations_to_table_changes(incoming)?;

    for (table, incoming_rows) in incoming_table_changes.iter_mut() {
        let Some(local_rows) = local_table_changes.get(table) else {
            continue;
        };

        for (primary_key, incoming_changes) in incoming_rows.iter_mut() {
            let Some((_, local_changes)) = local_rows.get(primary_key) else {
                continue;
            };

            let changes = if incoming_changes.optype == ChangesOpType::Gone {
                local_changes.changes.clone()
            } else {
                merge_changes_last_write_wins(
                    local_origin,
                    &local_changes.changes,
                    incoming_origin,
                    &incoming_changes.changes,
                    &mut incoming_changes.full_row,
                )
            };

            let tags = merge_op_tags(local_changes, incoming_changes);
            incoming_changes.optype = if tags.is_empty() {
                ChangesOpType::Delete
            } else {
                ChangesOpType::Upsert
            };
            incoming_changes.changes = changes;
            incoming_changes.tags = tags;
        }
    }

    Ok(incoming_table_changes)
}

/// Resolve two column change sets, later timestamp wins.
///
/// `full_row` is updated with every winning value, so columns only changed
/// in `first` also land in the row written back.
pub fn merge_changes_last_write_wins(
    first_origin: &str,
    first: &OplogColumnChanges,
    second_origin: &str,
    second: &OplogColumnChanges,
    full_row: &mut Record,
) -> OplogColumnChanges {
    let keys: BTreeSet<&String> = first.keys().chain(second.keys()).collect();
    let mut merged = OplogColumnChanges::new();

    for key in keys {
        let winner = match (first.get(key), second.get(key)) {
            (None, None) => continue,
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (Some(a), Some(b)) => {
                if a.timestamp == b.timestamp {
                    // Same origin and same millisecond keeps `first`.
                    if first_origin >= second_origin {
                        a
                    } else {
                        b
                    }
                } else if a.timestamp > b.timestamp {
                    a
                } else {
                    b
                }
            }
        };

        full_row.insert(key.clone(), winner.value.clone());
        merged.insert(key.clone(), winner.clone());
    }

    merged
}

/// Tags left on a row after a local and a remote operation.
///
/// `GONE` always empties the set.
pub fn merge_op_tags(local: &OplogEntryChanges, remote: &ShadowEntryChanges) -> Vec<Tag> {
    if remote.optype == ChangesOpType::Gone {
        return Vec::new();
    }
    calculate_tags(local.tag.as_ref(), &remote.tags, &local.clear_tags)
}

fn calculate_tags(tag: Option<&Tag>, tags: &[Tag], clear: &[Tag]) -> Vec<Tag> {
    let surviving = tags.iter().filter(|t| !clear.contains(t)).cloned();
    match tag {
        None => surviving.collect(),
        Some(tag) => {
            let mut out = vec![tag.clone()];
            out.extend(surviving.filter(|t| t != tag));
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::tests::entry;
    use crate::oplog::{OpType, OplogColumnChange};
    use crate::types::SqlValue;

    fn col(value: &str, ts: i64) -> OplogColumnChange {
        OplogColumnChange {
            value: SqlValue::Text(value.into()),
            timestamp: ts,
        }
    }

    #[test]
    fn test_lww_one_side_only() {
        let mut first = OplogColumnChanges::new();
        first.insert("a".into(), col("local", 10));
        let mut second = OplogColumnChanges::new();
        second.insert("b".into(), col("remote", 5));
        let mut row = Record::new();

        let merged = merge_changes_last_write_wins("l", &first, "r", &second, &mut row);
        assert_eq!(merged["a"].value, SqlValue::Text("local".into()));
        assert_eq!(merged["b"].value, SqlValue::Text("remote".into()));
        assert_eq!(row["a"], SqlValue::Text("local".into()));
        assert_eq!(row["b"], SqlValue::Text("remote".into()));
    }

    #[test]
    fn test_lww_later_timestamp_wins() {
        let mut first = OplogColumnChanges::new();
        first.insert("v".into(), col("local", 10));
        let mut second = OplogColumnChanges::new();
        second.insert("v".into(), col("remote", 20));
        let mut row = Record::new();

        let merged = merge_changes_last_write_wins("z", &first, "a", &second, &mut row);
        assert_eq!(merged["v"].value, SqlValue::Text("remote".into()));
        assert_eq!(row["v"], SqlValue::Text("remote".into()));
    }

    #[test]
    fn test_lww_tie_breaks_on_origin() {
        let mut first = OplogColumnChanges::new();
        first.insert("v".into(), col("from-b", 10));
        let mut second = OplogColumnChanges::new();
        second.insert("v".into(), col("from-a", 10));

        for _ in 0..3 {
            let mut row = Record::new();
            let merged = merge_changes_last_write_wins("b", &first, "a", &second, &mut row);
            assert_eq!(merged["v"].value, SqlValue::Text("from-b".into()));

            let mut row = Record::new();
            let merged = merge_changes_last_write_wins("a", &second, "b", &first, &mut row);
            assert_eq!(merged["v"].value, SqlValue::Text("from-b".into()));
        }
    }

    #[test]
    fn test_lww_same_origin_same_millis() {
        let mut first = OplogColumnChanges::new();
        first.insert("v".into(), col("first", 10));
        let mut second = OplogColumnChanges::new();
        second.insert("v".into(), col("second", 10));
        let mut row = Record::new();
        let merged = merge_changes_last_write_wins("o", &first, "o", &second, &mut row);
        assert_eq!(merged["v"].value, SqlValue::Text("first".into()));
    }

    #[test]
    fn test_calculate_tags() {
        let tag = "local@3".to_string();
        let remote = vec!["r@1".to_string(), "r@2".to_string()];
        let clear = vec!["r@1".to_string()];

        assert_eq!(calculate_tags(None, &remote, &clear), vec!["r@2".to_string()]);
        assert_eq!(
            calculate_tags(Some(&tag), &remote, &clear),
            vec!["local@3".to_string(), "r@2".to_string()]
        );
        assert!(calculate_tags(None, &remote, &remote).is_empty());
    }

    #[test]
    fn test_merge_remote_update_wins_over_older_local() {
        // Local insert at T1, remote update at a later time.
        let local = vec![entry(
            1,
            OpType::Insert,
            1000,
            r#"{"id":1}"#,
            Some(r#"{"id":1,"value":"local"}"#),
            None,
            "[]",
        )];
        let incoming = vec![entry(
            -1,
            OpType::Update,
            2000,
            r#"{"id":1}"#,
            Some(r#"{"id":1,"value":"remote"}"#),
            Some(r#"{"id":1,"value":"local"}"#),
            r#"["remote@2000"]"#,
        )];

        let merged = merge_entries("local", &local, "remote", &incoming).unwrap();
        let row = &merged[r#""main"."items""#][r#"{"id":1}"#];
        assert_eq!(row.optype, ChangesOpType::Upsert);
        assert_eq!(row.full_row["value"], SqlValue::Text("remote".into()));
        assert!(row.tags.contains(&"remote@2000".to_string()));
    }

    #[test]
    fn test_merge_remote_delete_does_not_remove_concurrent_local_update() {
        // The remote delete clears only the tag it has seen.
        let local = vec![entry(
            1,
            OpType::Update,
            3000,
            r#"{"id":1}"#,
            Some(r#"{"id":1,"value":"local"}"#),
            Some(r#"{"id":1,"value":"old"}"#),
            r#"["remote@1000"]"#,
        )];
        let incoming = vec![entry(
            -1,
            OpType::Delete,
            2000,
            r#"{"id":1}"#,
            None,
            Some(r#"{"id":1,"value":"old"}"#),
            r#"["remote@1000"]"#,
        )];

        let merged = merge_entries("local", &local, "remote", &incoming).unwrap();
        let row = &merged[r#""main"."items""#][r#"{"id":1}"#];
        assert_eq!(row.optype, ChangesOpType::Upsert);
        assert_eq!(row.tags, vec!["local@3000".to_string()]);
        assert_eq!(row.full_row["value"], SqlValue::Text("local".into()));
    }

    #[test]
    fn test_merge_gone_empties_tags_keeps_local_changes() {
        let local = vec![entry(
            1,
            OpType::Update,
            3000,
            r#"{"id":1}"#,
            Some(r#"{"id":1,"value":"local"}"#),
            Some(r#"{"id":1,"value":"old"}"#),
            "[]",
        )];
        let incoming = vec![entry(-1, OpType::Gone, 4000, r#"{"id":1}"#, None, None, "[]")];

        let merged = merge_entries("local", &local, "remote", &incoming).unwrap();
        let row = &merged[r#""main"."items""#][r#"{"id":1}"#];
        assert_eq!(row.optype, ChangesOpType::Delete);
        assert!(row.tags.is_empty());
        assert_eq!(row.changes["value"].value, SqlValue::Text("local".into()));
    }

    #[test]
    fn test_merge_untouched_rows_pass_through() {
        let local = vec![entry(
            1,
            OpType::Insert,
            1000,
            r#"{"id":1}"#,
            Some(r#"{"id":1,"value":"mine"}"#),
            None,
            "[]",
        )];
        let incoming = vec![entry(
            -1,
            OpType::Insert,
            500,
            r#"{"id":2}"#,
            Some(r#"{"id":2,"value":"theirs"}"#),
            None,
            r#"["remote@500"]"#,
        )];

        let merged = merge_entries("local", &local, "remote", &incoming).unwrap();
        let rows = &merged[r#""main"."items""#];
        assert_eq!(rows.len(), 1);
        let row = &rows[r#"{"id":2}"#];
        assert_eq!(row.full_row["value"], SqlValue::Text("theirs".into()));
        assert_eq!(row.tags, vec!["remote@500".to_string()]);
    }
}
