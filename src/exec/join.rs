//! JOIN: hash equi-join over key tuples.
//!
//! The smaller side is materialized into a hash table and the larger side
//! streams through it. NULL keys never match (but outer variants still
//! emit their rows with the other side nulled). Output columns are the
//! left table's columns followed by the right table's non-key columns;
//! a right column whose name collides with a left one gains an `_r`
//! suffix.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::exec::group::{key_at, KeyVal};
use crate::exec::{dense_column, Executor};
use crate::graph::{ExtData, OpId};
use crate::sym;
use crate::types::{JoinType, TypeTag};
use crate::value::Value;

impl Executor<'_> {
    pub(super) fn exec_join(&mut self, id: OpId, in0: OpId, in1: OpId) -> Result<Value> {
        let Some(ExtData::Join {
            left_keys,
            right_keys,
            ty,
        }) = self.g.ext_of(id).cloned()
        else {
            return Err(Error::Corrupt("join node without key data".into()));
        };
        let left = self.eval(in0)?;
        let right = self.eval(in1)?;
        if !left.is_table() || !right.is_table() {
            return Err(Error::Type("join inputs must be tables".into()));
        }
        let lk = self.key_columns(&left, &left_keys)?;
        let rk = self.key_columns(&right, &right_keys)?;
        let rk_names: Vec<i64> = right_keys
            .iter()
            .filter_map(|&k| match self.g.ext_of(k) {
                Some(ExtData::Name(n)) => Some(*n),
                _ => None,
            })
            .collect();
        join_tables(&left, &lk, &right, &rk, &rk_names, ty)
    }

    /// Resolve a join key node against a specific table: named nodes
    /// (scan/alias) read that table's column; anything else evaluates as a
    /// plain expression.
    fn key_columns(&mut self, table: &Value, keys: &[OpId]) -> Result<Vec<Value>> {
        let mut out = Vec::with_capacity(keys.len());
        for &k in keys {
            let col = match self.g.ext_of(k) {
                Some(ExtData::Name(name_id)) => table.col_by_name(*name_id).ok_or_else(|| {
                    Error::Schema(format!(
                        "join key {} missing from table",
                        sym::str_of(*name_id).unwrap_or_default()
                    ))
                })?,
                _ => self.eval(k)?,
            };
            out.push(dense_column(&col)?)
        }
        Ok(out)
    }
}

fn key_tuple(cols: &[Value], row: i64) -> Result<Option<Vec<KeyVal>>> {
    let mut out = Vec::with_capacity(cols.len());
    for c in cols {
        match key_at(c, row)? {
            KeyVal::Null => return Ok(None), // null keys never match
            k => out.push(k),
        }
    }
    Ok(Some(out))
}

pub(crate) fn join_tables(
    left: &Value,
    left_keys: &[Value],
    right: &Value,
    right_keys: &[Value],
    right_key_names: &[i64],
    ty: JoinType,
) -> Result<Value> {
    let (ln, rn) = (left.nrows(), right.nrows());

    // Build on the smaller side, probe with the larger.
    let build_left = ln < rn;
    let (build_keys, probe_keys, build_n, probe_n) = if build_left {
        (left_keys, right_keys, ln, rn)
    } else {
        (right_keys, left_keys, rn, ln)
    };

    let mut table: HashMap<Vec<KeyVal>, Vec<i64>> = HashMap::new();
    for row in 0..build_n {
        if let Some(key) = key_tuple(build_keys, row)? {
            table.entry(key).or_default().push(row);
        }
    }

    // Emit (left row, right row) pairs in probe order.
    let mut pairs: Vec<(Option<i64>, Option<i64>)> = Vec::new();
    let mut build_matched = vec![false; build_n as usize];
    for row in 0..probe_n {
        let hits = match key_tuple(probe_keys, row)? {
            Some(key) => table.get(&key),
            None => None,
        };
        match hits {
            Some(rows) => {
                for &b in rows {
                    build_matched[b as usize] = true;
                    pairs.push(if build_left {
                        (Some(b), Some(row))
                    } else {
                        (Some(row), Some(b))
                    });
                }
            }
            None => pairs.push(if build_left {
                (None, Some(row))
            } else {
                (Some(row), None)
            }),
        }
    }

    // Post-process per join type. `pairs` currently holds inner matches
    // plus probe-side misses as half-null rows.
    let keep_probe_misses = match (ty, build_left) {
        (JoinType::Inner | JoinType::Semi | JoinType::Anti, _) => false,
        (JoinType::Left, false) | (JoinType::Full, false) => true,
        (JoinType::Right, true) | (JoinType::Full, true) => true,
        _ => false,
    };
    let mut rows: Vec<(Option<i64>, Option<i64>)> = pairs
        .into_iter()
        .filter(|(l, r)| keep_probe_misses || (l.is_some() && r.is_some()))
        .collect();

    // Build-side misses for the outer variants that need them.
    let want_build_misses = match (ty, build_left) {
        (JoinType::Left, true) | (JoinType::Full, true) => true,
        (JoinType::Right, false) | (JoinType::Full, false) => true,
        _ => false,
    };
    if want_build_misses {
        for (b, hit) in build_matched.iter().enumerate() {
            if !hit {
                rows.push(if build_left {
                    (Some(b as i64), None)
                } else {
                    (None, Some(b as i64))
                });
            }
        }
    }

    match ty {
        JoinType::Semi | JoinType::Anti => {
            // Left rows with (semi) or without (anti) at least one match.
            let mut matched = vec![false; ln as usize];
            for (l, r) in &rows {
                if let (Some(l), Some(_)) = (l, r) {
                    matched[*l as usize] = true;
                }
            }
            let keep: Vec<i64> = (0..ln)
                .filter(|&i| matched[i as usize] == (ty == JoinType::Semi))
                .collect();
            crate::exec::filter::apply_selection(left, &keep)
        }
        _ => {
            let left_rows: Vec<Option<i64>> = rows.iter().map(|(l, _)| *l).collect();
            let right_rows: Vec<Option<i64>> = rows.iter().map(|(_, r)| *r).collect();
            let mut out = Value::table()?;
            let mut names = Vec::new();
            for c in 0..left.ncols() {
                let name_id = left.col_name(c)?;
                names.push(name_id);
                let col = left.col_by_idx(c)?;
                out.add_col(name_id, gather_opt(&col, &left_rows)?)?;
            }
            for c in 0..right.ncols() {
                let name_id = right.col_name(c)?;
                if right_key_names.contains(&name_id) {
                    continue;
                }
                let final_id = if names.contains(&name_id) {
                    let renamed = format!("{}_r", sym::str_of(name_id)?);
                    sym::intern_str(&renamed)?
                } else {
                    name_id
                };
                let col = right.col_by_idx(c)?;
                out.add_col(final_id, gather_opt(&col, &right_rows)?)?;
            }
            Ok(out)
        }
    }
}

/// Gather with optional rows; `None` lands as a null.
fn gather_opt(col: &Value, rows: &[Option<i64>]) -> Result<Value> {
    let src = dense_column(col)?;
    let tag = src.vec_tag_or_base()?;
    let mut out = if tag == TypeTag::Sym {
        Value::sym_vec(src.elem_width(), rows.len() as i64)?
    } else {
        Value::vec(tag, rows.len() as i64)?
    };
    for &r in rows {
        match r {
            None => out.push_null()?,
            Some(r) => {
                if src.is_null_at(r)? {
                    out.push_null()?;
                } else {
                    match tag {
                        TypeTag::F64 => out.push_f64(src.get_f64(r)?)?,
                        TypeTag::List | TypeTag::Str => out.push_child(src.get_child(r)?)?,
                        _ => out.push_i64(src.get_i64(r)?)?,
                    }
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Result<(Value, Value)> {
        let left = Value::table_from(
            &["id", "qty"],
            vec![Value::i64_vec(&[1, 2, 3])?, Value::i64_vec(&[10, 20, 30])?],
        )?;
        let right = Value::table_from(
            &["id", "price"],
            vec![Value::i64_vec(&[2, 3, 4])?, Value::f64_vec(&[2.5, 3.5, 4.5])?],
        )?;
        Ok((left, right))
    }

    fn keys(t: &Value, name: &str) -> Vec<Value> {
        vec![t.col(name).unwrap()]
    }

    #[test]
    fn inner_join_matches_keys() -> Result<()> {
        let (l, r) = tables()?;
        let out = join_tables(&l, &keys(&l, "id"), &r, &keys(&r, "id"), &[sym::intern_str("id")?], JoinType::Inner)?;
        assert_eq!(out.nrows(), 2);
        assert_eq!(out.ncols(), 3); // id, qty, price
        let ids = out.col("id").unwrap();
        let mut seen: Vec<i64> = (0..2).map(|i| ids.get_i64(i).unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 3]);
        Ok(())
    }

    #[test]
    fn left_join_keeps_unmatched_left_rows() -> Result<()> {
        let (l, r) = tables()?;
        let out = join_tables(&l, &keys(&l, "id"), &r, &keys(&r, "id"), &[sym::intern_str("id")?], JoinType::Left)?;
        assert_eq!(out.nrows(), 3);
        let ids = out.col("id").unwrap();
        let price = out.col("price").unwrap();
        let mut with_null = 0;
        for i in 0..3 {
            if price.is_null_at(i)? {
                with_null += 1;
                assert_eq!(ids.get_i64(i)?, 1);
            }
        }
        assert_eq!(with_null, 1);
        Ok(())
    }

    #[test]
    fn full_join_covers_both_sides() -> Result<()> {
        let (l, r) = tables()?;
        let out = join_tables(&l, &keys(&l, "id"), &r, &keys(&r, "id"), &[sym::intern_str("id")?], JoinType::Full)?;
        assert_eq!(out.nrows(), 4); // 2 matches + unmatched 1 and 4
        Ok(())
    }

    #[test]
    fn semi_and_anti_partition_the_left() -> Result<()> {
        let (l, r) = tables()?;
        let semi = join_tables(&l, &keys(&l, "id"), &r, &keys(&r, "id"), &[sym::intern_str("id")?], JoinType::Semi)?;
        let anti = join_tables(&l, &keys(&l, "id"), &r, &keys(&r, "id"), &[sym::intern_str("id")?], JoinType::Anti)?;
        assert_eq!(semi.nrows(), 2);
        assert_eq!(anti.nrows(), 1);
        assert_eq!(anti.col("id").unwrap().get_i64(0)?, 1);
        assert_eq!(semi.ncols(), l.ncols());
        Ok(())
    }

    #[test]
    fn null_keys_never_match() -> Result<()> {
        let mut lk = Value::i64_vec(&[1, 2])?;
        lk.set_null(0, true)?;
        let l = Value::table_from(&["k"], vec![lk])?;
        let mut rk = Value::i64_vec(&[1, 2])?;
        rk.set_null(0, true)?;
        let r = Value::table_from(&["k"], vec![rk])?;
        let out = join_tables(
            &l,
            &keys(&l, "k"),
            &r,
            &keys(&r, "k"),
            &[sym::intern_str("k")?],
            JoinType::Inner,
        )?;
        assert_eq!(out.nrows(), 1);
        Ok(())
    }
}
