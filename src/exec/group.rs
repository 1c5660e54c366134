//! GROUP and DISTINCT: hash aggregation.
//!
//! The aggregate table is open-addressed with linear probing: a slot array
//! of group indices plus a dense group list, so probing never chases
//! pointers. Below the parallel threshold one table is built serially.
//! Above it the work runs in two phases: every task builds a local table
//! over its morsel range, then a second dispatch merges the locals
//! partitioned by key hash, one partition per task, and the dispatcher
//! concatenates the partition outputs. Output row order is unspecified.

use std::cell::UnsafeCell;

use ordered_float::OrderedFloat;

use crate::error::{Error, Result};
use crate::exec::reduce::{finalize, Partial};
use crate::exec::{dense_column, gather, Executor};
use crate::graph::{ExtData, OpId, Opcode};
use crate::sym;
use crate::task::{self, TASK_GRAIN, div_ceil_i64};
use crate::types::{AggOp, TypeTag, PARALLEL_THRESHOLD};
use crate::value::Value;

/// Hash partitions used by the parallel merge phase.
const MERGE_PARTITIONS: i64 = 16;

/// One group-key component. Floats go through `OrderedFloat` so NaN keys
/// group together; nulls form their own group.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) enum KeyVal {
    Null,
    Int(i64),
    Float(OrderedFloat<f64>),
}

pub(crate) fn key_at(col: &Value, row: i64) -> Result<KeyVal> {
    if col.is_null_at(row)? {
        return Ok(KeyVal::Null);
    }
    Ok(match col.vec_tag_or_base()? {
        TypeTag::F64 => KeyVal::Float(OrderedFloat(col.get_f64(row)?)),
        _ => KeyVal::Int(col.get_i64(row)?),
    })
}

pub(crate) fn hash_key(key: &[KeyVal]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = std::hash::DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

/// Open-addressed, linear-probing aggregate table.
struct AggTable {
    /// Slot -> group index, `-1` empty. Power-of-two sized.
    slots: Vec<i32>,
    groups: Vec<Group>,
    n_aggs: usize,
    distinct_aggs: Vec<bool>,
}

struct Group {
    key: Vec<KeyVal>,
    hash: u64,
    first_row: i64,
    states: Vec<Partial>,
}

impl AggTable {
    fn new(n_aggs: usize, distinct_aggs: Vec<bool>) -> AggTable {
        AggTable {
            slots: vec![-1; 64],
            groups: Vec::new(),
            n_aggs,
            distinct_aggs,
        }
    }

    fn group_mut(&mut self, key: &[KeyVal], hash: u64, first_row: i64) -> usize {
        if (self.groups.len() + 1) * 4 > self.slots.len() * 3 {
            self.grow();
        }
        let mask = self.slots.len() - 1;
        let mut i = hash as usize & mask;
        loop {
            match self.slots[i] {
                -1 => {
                    let idx = self.groups.len();
                    self.groups.push(Group {
                        key: key.to_vec(),
                        hash,
                        first_row,
                        states: (0..self.n_aggs)
                            .map(|a| Partial::new(self.distinct_aggs[a]))
                            .collect(),
                    });
                    self.slots[i] = idx as i32;
                    return idx;
                }
                g if self.groups[g as usize].hash == hash
                    && self.groups[g as usize].key == key =>
                {
                    return g as usize;
                }
                _ => i = (i + 1) & mask,
            }
        }
    }

    fn grow(&mut self) {
        let new_len = self.slots.len() * 2;
        let mask = new_len - 1;
        let mut slots = vec![-1i32; new_len];
        for (idx, g) in self.groups.iter().enumerate() {
            let mut i = g.hash as usize & mask;
            while slots[i] != -1 {
                i = (i + 1) & mask;
            }
            slots[i] = idx as i32;
        }
        self.slots = slots;
    }

    fn absorb(&mut self, other: AggTable) {
        for g in other.groups {
            let idx = self.group_mut(&g.key, g.hash, g.first_row);
            let keep_first = self.groups[idx].first_row.min(g.first_row);
            self.groups[idx].first_row = keep_first;
            for (mine, theirs) in self.groups[idx].states.iter_mut().zip(g.states) {
                mine.merge(theirs);
            }
        }
    }
}

/// Evaluated inputs of one GROUP node.
struct GroupInputs {
    keys: Vec<Value>,
    aggs: Vec<(AggOp, Value, bool)>, // (op, dense column, float class)
    nrows: i64,
}

impl Executor<'_> {
    pub(super) fn exec_group(&mut self, id: OpId) -> Result<Value> {
        let Some(ExtData::Group { keys, aggs }) = self.g.ext_of(id).cloned() else {
            return Err(Error::Corrupt("group node without key data".into()));
        };
        let inputs = self.group_inputs(&keys, &aggs)?;
        let table = if inputs.nrows >= PARALLEL_THRESHOLD {
            build_parallel(&inputs)?
        } else {
            build_serial(&inputs, 0, inputs.nrows)?
        };
        self.emit(&keys, &aggs, inputs, table)
    }

    fn group_inputs(&mut self, keys: &[OpId], aggs: &[(AggOp, OpId)]) -> Result<GroupInputs> {
        // Length-1 columns (constants) broadcast; everything else must
        // agree on the row count.
        let mut nrows = 1i64;
        let mut note = |n: i64| -> Result<()> {
            if n != 1 && nrows != 1 && n != nrows {
                return Err(Error::LengthMismatch { left: nrows, right: n });
            }
            nrows = nrows.max(n);
            Ok(())
        };
        let mut key_cols = Vec::with_capacity(keys.len());
        for &k in keys {
            let v = dense_for_group(self.eval(k)?)?;
            note(v.header().len())?;
            key_cols.push(v);
        }
        let mut agg_cols = Vec::with_capacity(aggs.len());
        for &(op, a) in aggs {
            let v = dense_for_group(self.eval(a)?)?;
            note(v.header().len())?;
            let float = v.vec_tag_or_base()? == TypeTag::F64;
            agg_cols.push((op, v, float));
        }
        Ok(GroupInputs {
            keys: key_cols,
            aggs: agg_cols,
            nrows,
        })
    }

    fn emit(
        &mut self,
        key_ids: &[OpId],
        agg_ids: &[(AggOp, OpId)],
        inputs: GroupInputs,
        table: AggTable,
    ) -> Result<Value> {
        let first_rows: Vec<i64> = table.groups.iter().map(|g| g.first_row).collect();
        let mut out = Value::table()?;
        for (i, (&kid, col)) in key_ids.iter().zip(&inputs.keys).enumerate() {
            let name_id = self.column_name(kid, i)?;
            // Broadcast (length-1) keys read row 0 for every group.
            let rows: Vec<i64> = if col.header().len() == 1 {
                vec![0; first_rows.len()]
            } else {
                first_rows.clone()
            };
            out.add_col(name_id, gather(col, &rows)?)?;
        }
        for (i, ((op, aid), (agg_op, col, float))) in
            agg_ids.iter().zip(inputs.aggs).enumerate()
        {
            debug_assert_eq!(*op, agg_op);
            let tag = col.vec_tag_or_base()?;
            let opcode = agg_opcode(*op);
            let float_out = agg_out_is_float(*op, float);
            let n_groups = table.groups.len() as i64;
            // min/max/first/last keep the input's type; the rest widen.
            let mut vals = if float_out {
                Value::vec(TypeTag::F64, n_groups)?
            } else {
                let out_tag = match op {
                    AggOp::Min | AggOp::Max | AggOp::First | AggOp::Last => tag,
                    _ => TypeTag::I64,
                };
                if out_tag == TypeTag::Sym {
                    Value::sym_vec(8, n_groups)?
                } else {
                    Value::vec(out_tag, n_groups)?
                }
            };
            for g in &table.groups {
                let atom = finalize(opcode, g.states[i].clone(), tag, float)?;
                if float_out {
                    vals.push_f64(atom.as_f64()?)?;
                } else {
                    vals.push_i64(atom.as_i64()?)?;
                }
            }
            let input_name = sym::str_of(self.column_name(*aid, i)?)?;
            let name = format!("{}_{}", agg_name(*op), input_name);
            out.add_col(sym::intern_str(&name)?, vals)?;
        }
        Ok(out)
    }
}

fn dense_for_group(v: Value) -> Result<Value> {
    if v.is_atom() {
        // Scalars broadcast later; keep them as one-row columns.
        return match v.atom_tag()? {
            TypeTag::F64 => Value::f64_vec(&[f64::from_bits(v.header().atom_bits())]),
            _ => Value::i64_vec(&[v.as_i64()?]),
        };
    }
    dense_column(&v)
}

fn key_tuple(keys: &[Value], row: i64) -> Result<Vec<KeyVal>> {
    keys.iter()
        .map(|k| {
            let n = k.header().len();
            key_at(k, if n == 1 { 0 } else { row })
        })
        .collect()
}

fn build_serial(inputs: &GroupInputs, start: i64, end: i64) -> Result<AggTable> {
    let distinct_aggs: Vec<bool> = inputs
        .aggs
        .iter()
        .map(|(op, ..)| *op == AggOp::CountDistinct)
        .collect();
    let mut table = AggTable::new(inputs.aggs.len(), distinct_aggs);
    for row in start..end {
        let key = key_tuple(&inputs.keys, row)?;
        let hash = hash_key(&key);
        let idx = table.group_mut(&key, hash, row);
        for (a, (_, col, float)) in inputs.aggs.iter().enumerate() {
            if col.is_null_at(if col.header().len() == 1 { 0 } else { row })? {
                continue;
            }
            let r = if col.header().len() == 1 { 0 } else { row };
            if *float {
                let v = col.get_f64(r)?;
                table.groups[idx].states[a].add(row, v as i64, v);
            } else {
                let v = col.get_i64(r)?;
                table.groups[idx].states[a].add(row, v, v as f64);
            }
        }
    }
    Ok(table)
}

struct ParCtx<'a> {
    inputs: &'a GroupInputs,
    locals: Vec<UnsafeCell<Option<AggTable>>>,
    merged: Vec<UnsafeCell<Option<AggTable>>>,
    error: crate::exec::kernels::ErrSlot,
}

unsafe impl Sync for ParCtx<'_> {}

fn build_local(ctx: &ParCtx<'_>, start: i64, end: i64) {
    let slot = (start / TASK_GRAIN) as usize;
    let slot = slot.min(ctx.locals.len() - 1);
    match build_serial(ctx.inputs, start, end) {
        Ok(t) => unsafe { *ctx.locals[slot].get() = Some(t) },
        Err(e) => ctx.error.set(e.code() as u8),
    }
}

/// Phase-2 task: merge one hash partition's groups from every local table
/// into a partition-private result. Locals are only read here; several
/// partition tasks walk them concurrently.
fn merge_partition(ctx: &ParCtx<'_>, part: i64, _end: i64) {
    let distinct_aggs: Vec<bool> = ctx
        .inputs
        .aggs
        .iter()
        .map(|(op, ..)| *op == AggOp::CountDistinct)
        .collect();
    let mut acc = AggTable::new(ctx.inputs.aggs.len(), distinct_aggs);
    for cell in &ctx.locals {
        let Some(local) = (unsafe { &*cell.get() }) else {
            continue;
        };
        for g in &local.groups {
            if (g.hash % MERGE_PARTITIONS as u64) as i64 != part {
                continue;
            }
            let idx = acc.group_mut(&g.key, g.hash, g.first_row);
            acc.groups[idx].first_row = acc.groups[idx].first_row.min(g.first_row);
            for (mine, theirs) in acc.groups[idx].states.iter_mut().zip(&g.states) {
                mine.merge(theirs.clone());
            }
        }
    }
    unsafe { *ctx.merged[part as usize].get() = Some(acc) };
}

fn build_parallel(inputs: &GroupInputs) -> Result<AggTable> {
    let n_tasks = (div_ceil_i64(inputs.nrows, TASK_GRAIN) as usize).max(1);
    let ctx = ParCtx {
        inputs,
        locals: (0..n_tasks).map(|_| UnsafeCell::new(None)).collect(),
        merged: (0..MERGE_PARTITIONS as usize)
            .map(|_| UnsafeCell::new(None))
            .collect(),
        error: crate::exec::kernels::ErrSlot::new(),
    };
    // Phase 1: each task aggregates its morsel range locally.
    task::dispatch_range(&ctx, inputs.nrows, build_local)?;
    if let Some(code) = ctx.error.take() {
        return Err(Error::Domain(format!("group phase 1 failed (kind {code})")));
    }
    // Phase 2: one task per hash partition merges that partition's groups
    // from every local table.
    task::dispatch_partitions(&ctx, MERGE_PARTITIONS, merge_partition)?;

    let distinct_aggs: Vec<bool> = inputs
        .aggs
        .iter()
        .map(|(op, ..)| *op == AggOp::CountDistinct)
        .collect();
    let mut out = AggTable::new(inputs.aggs.len(), distinct_aggs);
    for cell in ctx.merged {
        if let Some(t) = cell.into_inner() {
            out.absorb(t);
        }
    }
    Ok(out)
}

pub(crate) fn agg_opcode(op: AggOp) -> Opcode {
    match op {
        AggOp::Sum => Opcode::Sum,
        AggOp::Prod => Opcode::Prod,
        AggOp::Min => Opcode::Min,
        AggOp::Max => Opcode::Max,
        AggOp::Count => Opcode::Count,
        AggOp::Avg => Opcode::Avg,
        AggOp::First => Opcode::First,
        AggOp::Last => Opcode::Last,
        AggOp::CountDistinct => Opcode::CountDistinct,
        AggOp::Stddev => Opcode::Stddev,
        AggOp::StddevPop => Opcode::StddevPop,
        AggOp::Var => Opcode::Var,
        AggOp::VarPop => Opcode::VarPop,
    }
}

pub(crate) fn agg_name(op: AggOp) -> &'static str {
    match op {
        AggOp::Sum => "sum",
        AggOp::Prod => "prod",
        AggOp::Min => "min",
        AggOp::Max => "max",
        AggOp::Count => "count",
        AggOp::Avg => "avg",
        AggOp::First => "first",
        AggOp::Last => "last",
        AggOp::CountDistinct => "count_distinct",
        AggOp::Stddev => "stddev",
        AggOp::StddevPop => "stddev_pop",
        AggOp::Var => "var",
        AggOp::VarPop => "var_pop",
    }
}

pub(crate) fn agg_out_is_float(op: AggOp, input_float: bool) -> bool {
    match op {
        AggOp::Avg | AggOp::Stddev | AggOp::StddevPop | AggOp::Var | AggOp::VarPop => true,
        AggOp::Count | AggOp::CountDistinct => false,
        _ => input_float,
    }
}
