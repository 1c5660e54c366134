//! Splayed tables and the partitioned database layout.
//!
//! ```text
//! <db_root>/
//!   sym                  symbol directory file
//!   <partition>/         digits and dots only, no leading dot, no ".."
//!     <table>/
//!       <col>            one file per column (single-column format)
//!       .d               schema: I64 vector of column-name symbol ids
//! ```
//!
//! Opening a partitioned table walks the partition directories in
//! lexicographic order, maps every column, then builds one parted column
//! per schema column plus the virtual partition-key map (parsed partition
//! names + per-partition row counts).

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::io::col::{col_load, col_save};
use crate::sym;
use crate::types::TypeTag;
use crate::value::Value;

/// Name of the distinguished partition-key column.
pub const PART_COL: &str = "part";

/// Partition directory names: digits and dots only, no leading dot, no
/// path separators, never `..`.
fn valid_partition_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name != ".."
        && name.bytes().all(|b| b.is_ascii_digit() || b == b'.')
}

/// Save a table as a splayed directory: one column file per column plus
/// the `.d` schema vector.
pub fn table_save(table: &Value, dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|e| Error::io("mkdir", dir, e))?;
    let schema = table.schema()?.materialize()?;
    col_save(&schema, dir.join(".d"))?;
    for c in 0..table.ncols() {
        let name = sym::str_of(table.col_name(c)?)?;
        let col = table.col_by_idx(c)?;
        col_save(&col, dir.join(&name))?;
    }
    log::debug!("splayed {} columns into {}", table.ncols(), dir.display());
    Ok(())
}

/// Load a splayed table directory. Column blocks come back mapped
/// (`mmod = Mmap`); the table owns the mappings through its columns.
pub fn table_load(dir: impl AsRef<Path>) -> Result<Value> {
    let dir = dir.as_ref();
    let schema = col_load(dir.join(".d"))?;
    if schema.vec_tag_or_base()? != TypeTag::I64 {
        return Err(Error::Schema(format!(
            "{}: .d is not an I64 schema vector",
            dir.display()
        )));
    }
    let mut table = Value::table()?;
    for i in 0..schema.len() {
        let id = schema.get_i64(i)?;
        let name = sym::str_of(id)?;
        let col = col_load(dir.join(&name))?;
        table.add_col(id, col)?;
    }
    Ok(table)
}

/// Write one partition of a partitioned database, refreshing the shared
/// symbol directory at the root.
pub fn part_save(
    db_root: impl AsRef<Path>,
    partition: &str,
    table_name: &str,
    table: &Value,
) -> Result<()> {
    let db_root = db_root.as_ref();
    if !valid_partition_name(partition) {
        return Err(Error::Schema(format!(
            "invalid partition name {partition:?}"
        )));
    }
    table_save(table, db_root.join(partition).join(table_name))?;
    sym::save(db_root.join("sym"))
}

/// Open `<db_root>/<table_name>` across all partitions as a parted table.
pub fn part_open(db_root: impl AsRef<Path>, table_name: &str) -> Result<Value> {
    let db_root = db_root.as_ref();
    let sym_path = db_root.join("sym");
    if sym_path.exists() {
        sym::load(&sym_path)?;
    }

    let mut partitions: Vec<(String, PathBuf)> = Vec::new();
    let entries = fs::read_dir(db_root).map_err(|e| Error::io("read_dir", db_root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("read_dir", db_root, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !valid_partition_name(&name) {
            continue;
        }
        let table_dir = entry.path().join(table_name);
        if table_dir.is_dir() {
            partitions.push((name, table_dir));
        }
    }
    if partitions.is_empty() {
        return Err(Error::Schema(format!(
            "no partitions of {table_name} under {}",
            db_root.display()
        )));
    }
    partitions.sort_by(|a, b| a.0.cmp(&b.0));
    log::debug!(
        "opening {table_name}: {} partitions under {}",
        partitions.len(),
        db_root.display()
    );

    let tables: Vec<Value> = partitions
        .iter()
        .map(|(_, dir)| table_load(dir))
        .collect::<Result<_>>()?;

    // The partition-key map: parsed names plus per-partition row counts.
    let numeric = partitions
        .iter()
        .all(|(n, _)| n.bytes().all(|b| b.is_ascii_digit() || b == b'.'));
    let keys = if numeric {
        let parsed: Vec<i64> = partitions
            .iter()
            .map(|(n, _)| {
                let digits: String = n.chars().filter(char::is_ascii_digit).collect();
                digits.parse::<i64>().unwrap_or(0)
            })
            .collect();
        Value::i64_vec(&parsed)?
    } else {
        let ids: Vec<i64> = partitions
            .iter()
            .map(|(n, _)| sym::intern_str(n))
            .collect::<Result<_>>()?;
        Value::sym_vec_from(&ids)?
    };
    let counts: Vec<i64> = tables.iter().map(Value::nrows).collect();
    let map = Value::partition_map(keys, Value::i64_vec(&counts)?)?;

    let first = &tables[0];
    let mut out = Value::table()?;
    out.add_col(sym::intern_str(PART_COL)?, map)?;
    for c in 0..first.ncols() {
        let name_id = first.col_name(c)?;
        let mut segments = Vec::with_capacity(tables.len());
        let mut base: Option<TypeTag> = None;
        for t in &tables {
            let col = t.col_by_name(name_id).ok_or_else(|| {
                Error::Schema(format!(
                    "column {} missing from a partition of {table_name}",
                    sym::str_of(name_id).unwrap_or_default()
                ))
            })?;
            let tag = col.vec_tag_or_base()?;
            match base {
                None => base = Some(tag),
                Some(b) if b != tag => {
                    return Err(Error::Schema(format!(
                        "column {} changes type across partitions",
                        sym::str_of(name_id).unwrap_or_default()
                    )));
                }
                _ => {}
            }
            segments.push(col);
        }
        out.add_col(name_id, Value::parted(base.unwrap(), segments)?)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_names_are_validated() {
        assert!(valid_partition_name("20240101"));
        assert!(valid_partition_name("2024.01.01"));
        assert!(!valid_partition_name(".hidden"));
        assert!(!valid_partition_name(".."));
        assert!(!valid_partition_name("2024-01-01"));
        assert!(!valid_partition_name("a/b"));
        assert!(!valid_partition_name(""));
    }

    #[test]
    fn splayed_round_trip() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let t = Value::table_from(
            &["id", "qty"],
            vec![Value::i64_vec(&[1, 2, 3])?, Value::f64_vec(&[0.5, 1.5, 2.5])?],
        )?;
        table_save(&t, dir.path().join("trades"))?;
        let back = table_load(dir.path().join("trades"))?;
        assert_eq!(back.ncols(), 2);
        assert_eq!(back.nrows(), 3);
        assert_eq!(back.col("qty").unwrap().get_f64(1)?, 1.5);
        Ok(())
    }

    #[test]
    fn parted_open_concatenates_partitions() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let p0 = Value::table_from(&["v"], vec![Value::i64_vec(&[10, 20, 30])?])?;
        let p1 = Value::table_from(&["v"], vec![Value::i64_vec(&[40, 50])?])?;
        part_save(dir.path(), "20240101", "t", &p0)?;
        part_save(dir.path(), "20240102", "t", &p1)?;
        let t = part_open(dir.path(), "t")?;
        assert_eq!(t.nrows(), 5);
        let v = t.col("v").unwrap();
        assert!(v.is_parted());
        assert_eq!(v.nsegments(), 2);
        assert_eq!(v.parted_nrows(), 5);
        let map = t.col(PART_COL).unwrap();
        assert!(map.is_partition_map());
        let counts = map.partition_map_counts()?;
        assert_eq!(counts.get_i64(0)?, 3);
        assert_eq!(counts.get_i64(1)?, 2);
        Ok(())
    }
}
