//! Operator DAG construction.
//!
//! A graph is a flat, growable array of operator nodes addressed by
//! [`OpId`] — indices, not pointers, so the array can reallocate without a
//! fix-up pass. A node carries `{opcode, arity, inputs[2], out_type,
//! est_rows, flags}`. Operators that need more than two operands, carry a
//! literal, or have structural parameters (group keys, sort descriptors,
//! join keys, window frames) keep those in an ext entry: a side table slot
//! keyed by the node's index, with first-class variants instead of packed
//! byte tails.
//!
//! Source builders stamp a definite output type at construction; binary
//! builders compute theirs by numeric promotion, overridden where semantics
//! fix the output (division → F64, comparisons → BOOL, string ops → SYM).

use bitflags::bitflags;
use num_enum::TryFromPrimitive;

use crate::error::{Error, Result};
use crate::sym;
use crate::types::{
    promote, AggOp, DateField, FrameBound, FrameType, JoinType, TypeTag, WindowFunc,
};
use crate::value::Value;

/// Index of a node within its graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct OpId(pub(crate) u32);

impl OpId {
    pub(crate) const NONE: OpId = OpId(u32::MAX);

    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Operator catalog. The numbering is stable: it participates in plan
/// dumps and must not be reshuffled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u16)]
pub enum Opcode {
    Scan = 1,
    Const = 2,

    Neg = 10,
    Abs = 11,
    Not = 12,
    Sqrt = 13,
    Log = 14,
    Exp = 15,
    Ceil = 16,
    Floor = 17,
    IsNull = 18,
    Cast = 19,

    Add = 20,
    Sub = 21,
    Mul = 22,
    Div = 23,
    Mod = 24,
    Eq = 25,
    Ne = 26,
    Lt = 27,
    Le = 28,
    Gt = 29,
    Ge = 30,
    And = 31,
    Or = 32,
    Min2 = 33,
    Max2 = 34,
    If = 35,
    Like = 36,
    Upper = 37,
    Lower = 38,
    StrLen = 39,
    Substr = 40,
    Replace = 41,
    Trim = 42,
    Concat = 43,
    Extract = 45,
    DateTrunc = 46,

    Sum = 50,
    Prod = 51,
    Min = 52,
    Max = 53,
    Count = 54,
    Avg = 55,
    First = 56,
    Last = 57,
    CountDistinct = 58,
    Stddev = 59,

    Filter = 60,
    Sort = 61,
    Group = 62,
    Join = 63,
    WindowJoin = 64,
    Project = 65,
    Select = 66,
    Head = 67,
    Tail = 68,

    Alias = 70,
    Materialize = 71,
    Window = 72,
    StddevPop = 73,
    Var = 74,
    VarPop = 75,
    ILike = 76,
    Distinct = 77,
}

impl Opcode {
    /// Element-wise operators the fusion pass may fold into a consumer.
    pub(crate) fn fuseable(self) -> bool {
        matches!(
            self,
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge
        )
    }

    pub(crate) fn is_comparison(self) -> bool {
        matches!(
            self,
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge
        )
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct OpFlags: u8 {
        /// Consumed by a fused parent; not evaluated standalone.
        const FUSED = 0x01;
        /// Unreachable from the optimized root.
        const DEAD = 0x02;
    }
}

/// One operator node. Two input slots; everything else is ext data.
#[derive(Debug, Clone)]
pub(crate) struct OpNode {
    pub opcode: Opcode,
    pub arity: u8,
    pub flags: OpFlags,
    /// Signed output tag: negative atom, positive vector, 0 = not yet
    /// inferred.
    pub out_type: i8,
    pub est_rows: u32,
    pub inputs: [OpId; 2],
}

/// Window frame descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub ty: FrameType,
    pub start: FrameBound,
    pub end: FrameBound,
}

impl Default for Frame {
    fn default() -> Self {
        Frame {
            ty: FrameType::Rows,
            start: FrameBound::UnboundedPreceding,
            end: FrameBound::CurrentRow,
        }
    }
}

/// Structural / literal payload attached to a node.
#[derive(Debug, Clone)]
pub(crate) enum ExtData {
    /// Literal payload of a CONST node.
    Const(Value),
    /// Target type of CAST.
    Cast(TypeTag),
    /// Third operand of IF / SUBSTR / REPLACE.
    Ternary(OpId),
    /// Operands of variadic CONCAT, in order.
    Concat(Vec<OpId>),
    /// Field of EXTRACT / DATE_TRUNC.
    DateField(DateField),
    /// Column name id of SCAN / ALIAS.
    Name(i64),
    Group {
        keys: Vec<OpId>,
        aggs: Vec<(AggOp, OpId)>,
    },
    Sort {
        keys: Vec<OpId>,
        desc: Vec<bool>,
        nulls_first: Vec<bool>,
    },
    Join {
        left_keys: Vec<OpId>,
        right_keys: Vec<OpId>,
        ty: JoinType,
    },
    Window {
        part: Vec<OpId>,
        order: Vec<OpId>,
        order_desc: Vec<bool>,
        funcs: Vec<(WindowFunc, Option<OpId>)>,
        frame: Frame,
    },
    AsOf {
        time: OpId,
        sym: OpId,
        lo: i64,
        hi: i64,
        aggs: Vec<(AggOp, OpId)>,
    },
    /// Column expressions of PROJECT / SELECT.
    Cols(Vec<OpId>),
    /// Row count of HEAD / TAIL.
    Count(i64),
}

/// An operator DAG, optionally bound to a source table for SCAN.
pub struct Graph {
    pub(crate) nodes: Vec<OpNode>,
    pub(crate) ext: Vec<Option<ExtData>>,
    pub(crate) table: Option<Value>,
}

impl Graph {
    /// Graph bound to `table`; SCAN resolves column names against it.
    pub fn new(table: &Value) -> Result<Graph> {
        if !table.is_table() {
            return Err(Error::Type(format!("tag {} is not a table", table.tag())));
        }
        Ok(Graph {
            nodes: Vec::new(),
            ext: Vec::new(),
            table: Some(table.clone()),
        })
    }

    /// Unbound graph (constants and const-tables only).
    pub fn unbound() -> Graph {
        Graph {
            nodes: Vec::new(),
            ext: Vec::new(),
            table: None,
        }
    }

    pub(crate) fn node(&self, id: OpId) -> &OpNode {
        &self.nodes[id.idx()]
    }

    pub(crate) fn node_mut(&mut self, id: OpId) -> &mut OpNode {
        &mut self.nodes[id.idx()]
    }

    pub(crate) fn ext_of(&self, id: OpId) -> Option<&ExtData> {
        self.ext[id.idx()].as_ref()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    fn push(&mut self, node: OpNode, ext: Option<ExtData>) -> OpId {
        let id = OpId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.ext.push(ext);
        id
    }

    fn push_simple(
        &mut self,
        opcode: Opcode,
        inputs: [OpId; 2],
        arity: u8,
        out_type: i8,
        est_rows: u32,
    ) -> OpId {
        self.push(
            OpNode {
                opcode,
                arity,
                flags: OpFlags::empty(),
                out_type,
                est_rows,
                inputs,
            },
            None,
        )
    }

    // ----- sources -----

    /// Scan a bound-table column by name.
    pub fn scan(&mut self, col_name: &str) -> Result<OpId> {
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| Error::Rank("scan on an unbound graph".into()))?;
        let name_id = sym::find(col_name.as_bytes())
            .ok_or_else(|| Error::Schema(format!("no such column {col_name:?}")))?;
        let col = table
            .col_by_name(name_id)
            .ok_or_else(|| Error::Schema(format!("no such column {col_name:?}")))?;
        let out_type = if col.is_parted() {
            crate::types::parted_base(col.tag())
        } else if col.is_partition_map() {
            col.partition_map_keys()?.tag()
        } else {
            col.tag()
        };
        let rows = crate::table::col_nrows(&col).min(u32::MAX as i64) as u32;
        Ok(self.push(
            OpNode {
                opcode: Opcode::Scan,
                arity: 0,
                flags: OpFlags::empty(),
                out_type,
                est_rows: rows,
                inputs: [OpId::NONE; 2],
            },
            Some(ExtData::Name(name_id)),
        ))
    }

    fn const_node(&mut self, v: Value) -> OpId {
        let out_type = v.tag();
        let rows = if v.is_atom() { 1 } else { v.len().min(u32::MAX as i64) as u32 };
        self.push(
            OpNode {
                opcode: Opcode::Const,
                arity: 0,
                flags: OpFlags::empty(),
                out_type,
                est_rows: rows,
                inputs: [OpId::NONE; 2],
            },
            Some(ExtData::Const(v)),
        )
    }

    pub fn const_bool(&mut self, v: bool) -> Result<OpId> {
        Ok(self.const_node(Value::bool_atom(v)?))
    }

    pub fn const_i64(&mut self, v: i64) -> Result<OpId> {
        Ok(self.const_node(Value::i64_atom(v)?))
    }

    pub fn const_f64(&mut self, v: f64) -> Result<OpId> {
        Ok(self.const_node(Value::f64_atom(v)?))
    }

    /// String constant, interned: the node yields a SYM atom.
    pub fn const_str(&mut self, s: &str) -> Result<OpId> {
        Ok(self.const_node(Value::sym_atom(sym::intern_str(s)?)?))
    }

    /// Constant atom of any scalar type (dates, timestamps, GUIDs and the
    /// narrow integer kinds included).
    pub fn const_atom(&mut self, v: Value) -> Result<OpId> {
        if !v.is_atom() {
            return Err(Error::Type(format!("tag {} is not an atom", v.tag())));
        }
        Ok(self.const_node(v))
    }

    pub fn const_vec(&mut self, v: Value) -> Result<OpId> {
        if !v.header().is_vec() {
            return Err(Error::Type(format!("tag {} is not a vector", v.tag())));
        }
        Ok(self.const_node(v))
    }

    pub fn const_table(&mut self, v: Value) -> Result<OpId> {
        if !v.is_table() {
            return Err(Error::Type(format!("tag {} is not a table", v.tag())));
        }
        Ok(self.const_node(v))
    }

    // ----- element-wise -----

    fn numeric_base(&self, id: OpId) -> Result<TypeTag> {
        let t = self.node(id).out_type;
        TypeTag::try_from(t.abs())
            .map_err(|_| Error::Type(format!("node {} has no element type", id.0)))
    }

    /// Vector-ness of the result: atom only when every input is an atom.
    fn out_sign(&self, ids: &[OpId]) -> i8 {
        if ids.iter().all(|&i| self.node(i).out_type < 0) {
            -1
        } else {
            1
        }
    }

    fn est_rows_of(&self, ids: &[OpId]) -> u32 {
        ids.iter().map(|&i| self.node(i).est_rows).max().unwrap_or(0)
    }

    fn unary(&mut self, opcode: Opcode, a: OpId, out_base: TypeTag) -> OpId {
        let out = out_base as i8 * self.out_sign(&[a]);
        let rows = self.est_rows_of(&[a]);
        self.push_simple(opcode, [a, OpId::NONE], 1, out, rows)
    }

    fn binary(&mut self, opcode: Opcode, a: OpId, b: OpId, out_base: TypeTag) -> OpId {
        let out = out_base as i8 * self.out_sign(&[a, b]);
        let rows = self.est_rows_of(&[a, b]);
        self.push_simple(opcode, [a, b], 2, out, rows)
    }

    pub fn neg(&mut self, a: OpId) -> Result<OpId> {
        let t = self.numeric_base(a)?;
        Ok(self.unary(Opcode::Neg, a, t))
    }

    pub fn abs(&mut self, a: OpId) -> Result<OpId> {
        let t = self.numeric_base(a)?;
        Ok(self.unary(Opcode::Abs, a, t))
    }

    pub fn not(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::Not, a, TypeTag::Bool))
    }

    pub fn sqrt(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::Sqrt, a, TypeTag::F64))
    }

    pub fn log(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::Log, a, TypeTag::F64))
    }

    pub fn exp(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::Exp, a, TypeTag::F64))
    }

    pub fn ceil(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::Ceil, a, TypeTag::F64))
    }

    pub fn floor(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::Floor, a, TypeTag::F64))
    }

    pub fn is_null(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::IsNull, a, TypeTag::Bool))
    }

    pub fn cast(&mut self, a: OpId, target: TypeTag) -> Result<OpId> {
        let out = target as i8 * self.out_sign(&[a]);
        let rows = self.est_rows_of(&[a]);
        let id = self.push(
            OpNode {
                opcode: Opcode::Cast,
                arity: 1,
                flags: OpFlags::empty(),
                out_type: out,
                est_rows: rows,
                inputs: [a, OpId::NONE],
            },
            Some(ExtData::Cast(target)),
        );
        Ok(id)
    }

    fn arith(&mut self, opcode: Opcode, a: OpId, b: OpId) -> Result<OpId> {
        let t = promote(self.numeric_base(a)?, self.numeric_base(b)?)?;
        Ok(self.binary(opcode, a, b, t))
    }

    pub fn add(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.arith(Opcode::Add, a, b)
    }

    pub fn sub(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.arith(Opcode::Sub, a, b)
    }

    pub fn mul(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.arith(Opcode::Mul, a, b)
    }

    /// Division always promotes to F64.
    pub fn div(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        promote(self.numeric_base(a)?, self.numeric_base(b)?)?;
        Ok(self.binary(Opcode::Div, a, b, TypeTag::F64))
    }

    pub fn modulo(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.arith(Opcode::Mod, a, b)
    }

    fn comparison(&mut self, opcode: Opcode, a: OpId, b: OpId) -> Result<OpId> {
        // Comparisons accept any matching class (numeric promotion or
        // sym/sym) and always produce BOOL.
        let (ta, tb) = (self.numeric_base(a)?, self.numeric_base(b)?);
        if promote(ta, tb).is_err() && ta != tb {
            return Err(Error::Type(format!("cannot compare {ta:?} with {tb:?}")));
        }
        Ok(self.binary(opcode, a, b, TypeTag::Bool))
    }

    pub fn eq(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.comparison(Opcode::Eq, a, b)
    }

    pub fn ne(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.comparison(Opcode::Ne, a, b)
    }

    pub fn lt(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.comparison(Opcode::Lt, a, b)
    }

    pub fn le(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.comparison(Opcode::Le, a, b)
    }

    pub fn gt(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.comparison(Opcode::Gt, a, b)
    }

    pub fn ge(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.comparison(Opcode::Ge, a, b)
    }

    pub fn and(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        Ok(self.binary(Opcode::And, a, b, TypeTag::Bool))
    }

    pub fn or(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        Ok(self.binary(Opcode::Or, a, b, TypeTag::Bool))
    }

    pub fn min2(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.arith(Opcode::Min2, a, b)
    }

    pub fn max2(&mut self, a: OpId, b: OpId) -> Result<OpId> {
        self.arith(Opcode::Max2, a, b)
    }

    /// Element-wise conditional; the third operand rides in the ext slot.
    pub fn if_(&mut self, cond: OpId, then_v: OpId, else_v: OpId) -> Result<OpId> {
        let t = promote(self.numeric_base(then_v)?, self.numeric_base(else_v)?)
            .or_else(|_| self.numeric_base(then_v))?;
        let out = t as i8 * self.out_sign(&[cond, then_v, else_v]);
        let rows = self.est_rows_of(&[cond, then_v, else_v]);
        Ok(self.push(
            OpNode {
                opcode: Opcode::If,
                arity: 3,
                flags: OpFlags::empty(),
                out_type: out,
                est_rows: rows,
                inputs: [cond, then_v],
            },
            Some(ExtData::Ternary(else_v)),
        ))
    }

    // ----- strings -----

    pub fn like(&mut self, input: OpId, pattern: OpId) -> Result<OpId> {
        Ok(self.binary(Opcode::Like, input, pattern, TypeTag::Bool))
    }

    pub fn ilike(&mut self, input: OpId, pattern: OpId) -> Result<OpId> {
        Ok(self.binary(Opcode::ILike, input, pattern, TypeTag::Bool))
    }

    pub fn upper(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::Upper, a, TypeTag::Sym))
    }

    pub fn lower(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::Lower, a, TypeTag::Sym))
    }

    pub fn strlen(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::StrLen, a, TypeTag::I64))
    }

    pub fn trim(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.unary(Opcode::Trim, a, TypeTag::Sym))
    }

    pub fn substr(&mut self, s: OpId, start: OpId, len: OpId) -> Result<OpId> {
        let out = TypeTag::Sym as i8 * self.out_sign(&[s]);
        let rows = self.est_rows_of(&[s]);
        Ok(self.push(
            OpNode {
                opcode: Opcode::Substr,
                arity: 3,
                flags: OpFlags::empty(),
                out_type: out,
                est_rows: rows,
                inputs: [s, start],
            },
            Some(ExtData::Ternary(len)),
        ))
    }

    pub fn replace(&mut self, s: OpId, from: OpId, to: OpId) -> Result<OpId> {
        let out = TypeTag::Sym as i8 * self.out_sign(&[s]);
        let rows = self.est_rows_of(&[s]);
        Ok(self.push(
            OpNode {
                opcode: Opcode::Replace,
                arity: 3,
                flags: OpFlags::empty(),
                out_type: out,
                est_rows: rows,
                inputs: [s, from],
            },
            Some(ExtData::Ternary(to)),
        ))
    }

    /// Variadic string concatenation; all operand ids ride in the ext slot.
    pub fn concat(&mut self, args: &[OpId]) -> Result<OpId> {
        if args.is_empty() {
            return Err(Error::Rank("concat needs at least one operand".into()));
        }
        let out = TypeTag::Sym as i8 * self.out_sign(args);
        let rows = self.est_rows_of(args);
        Ok(self.push(
            OpNode {
                opcode: Opcode::Concat,
                arity: args.len().min(u8::MAX as usize) as u8,
                flags: OpFlags::empty(),
                out_type: out,
                est_rows: rows,
                inputs: [args[0], *args.get(1).unwrap_or(&OpId::NONE)],
            },
            Some(ExtData::Concat(args.to_vec())),
        ))
    }

    // ----- dates -----

    pub fn extract(&mut self, a: OpId, field: DateField) -> Result<OpId> {
        let rows = self.est_rows_of(&[a]);
        let out = TypeTag::I64 as i8 * self.out_sign(&[a]);
        Ok(self.push(
            OpNode {
                opcode: Opcode::Extract,
                arity: 1,
                flags: OpFlags::empty(),
                out_type: out,
                est_rows: rows,
                inputs: [a, OpId::NONE],
            },
            Some(ExtData::DateField(field)),
        ))
    }

    pub fn date_trunc(&mut self, a: OpId, field: DateField) -> Result<OpId> {
        let t = self.numeric_base(a)?;
        let rows = self.est_rows_of(&[a]);
        let out = t as i8 * self.out_sign(&[a]);
        Ok(self.push(
            OpNode {
                opcode: Opcode::DateTrunc,
                arity: 1,
                flags: OpFlags::empty(),
                out_type: out,
                est_rows: rows,
                inputs: [a, OpId::NONE],
            },
            Some(ExtData::DateField(field)),
        ))
    }

    // ----- reductions -----

    fn reduction(&mut self, opcode: Opcode, a: OpId, out_base: TypeTag) -> OpId {
        self.push_simple(opcode, [a, OpId::NONE], 1, -(out_base as i8), 1)
    }

    pub fn sum(&mut self, a: OpId) -> Result<OpId> {
        let t = self.numeric_base(a)?;
        let out = if t == TypeTag::F64 { TypeTag::F64 } else { TypeTag::I64 };
        Ok(self.reduction(Opcode::Sum, a, out))
    }

    pub fn prod(&mut self, a: OpId) -> Result<OpId> {
        let t = self.numeric_base(a)?;
        let out = if t == TypeTag::F64 { TypeTag::F64 } else { TypeTag::I64 };
        Ok(self.reduction(Opcode::Prod, a, out))
    }

    pub fn min(&mut self, a: OpId) -> Result<OpId> {
        let t = self.numeric_base(a)?;
        Ok(self.reduction(Opcode::Min, a, t))
    }

    pub fn max(&mut self, a: OpId) -> Result<OpId> {
        let t = self.numeric_base(a)?;
        Ok(self.reduction(Opcode::Max, a, t))
    }

    pub fn count(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.reduction(Opcode::Count, a, TypeTag::I64))
    }

    pub fn avg(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.reduction(Opcode::Avg, a, TypeTag::F64))
    }

    pub fn first(&mut self, a: OpId) -> Result<OpId> {
        let t = self.numeric_base(a)?;
        Ok(self.reduction(Opcode::First, a, t))
    }

    pub fn last(&mut self, a: OpId) -> Result<OpId> {
        let t = self.numeric_base(a)?;
        Ok(self.reduction(Opcode::Last, a, t))
    }

    pub fn count_distinct(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.reduction(Opcode::CountDistinct, a, TypeTag::I64))
    }

    pub fn stddev(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.reduction(Opcode::Stddev, a, TypeTag::F64))
    }

    pub fn stddev_pop(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.reduction(Opcode::StddevPop, a, TypeTag::F64))
    }

    pub fn var(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.reduction(Opcode::Var, a, TypeTag::F64))
    }

    pub fn var_pop(&mut self, a: OpId) -> Result<OpId> {
        Ok(self.reduction(Opcode::VarPop, a, TypeTag::F64))
    }

    // ----- structural -----

    pub fn filter(&mut self, input: OpId, predicate: OpId) -> Result<OpId> {
        let out = self.node(input).out_type;
        let rows = self.node(input).est_rows / 2;
        Ok(self.push_simple(Opcode::Filter, [input, predicate], 2, out, rows))
    }

    pub fn group(&mut self, keys: &[OpId], aggs: &[(AggOp, OpId)]) -> Result<OpId> {
        if keys.is_empty() {
            return Err(Error::Rank("group needs at least one key".into()));
        }
        let rows = self.est_rows_of(keys) / 4;
        Ok(self.push(
            OpNode {
                opcode: Opcode::Group,
                arity: 0,
                flags: OpFlags::empty(),
                out_type: TypeTag::Table as i8,
                est_rows: rows.max(1),
                inputs: [OpId::NONE; 2],
            },
            Some(ExtData::Group {
                keys: keys.to_vec(),
                aggs: aggs.to_vec(),
            }),
        ))
    }

    /// Distinct rows of the key expressions: a GROUP with no aggregates.
    pub fn distinct(&mut self, keys: &[OpId]) -> Result<OpId> {
        if keys.is_empty() {
            return Err(Error::Rank("distinct needs at least one key".into()));
        }
        let rows = self.est_rows_of(keys) / 4;
        Ok(self.push(
            OpNode {
                opcode: Opcode::Distinct,
                arity: 0,
                flags: OpFlags::empty(),
                out_type: TypeTag::Table as i8,
                est_rows: rows.max(1),
                inputs: [OpId::NONE; 2],
            },
            Some(ExtData::Group {
                keys: keys.to_vec(),
                aggs: Vec::new(),
            }),
        ))
    }

    pub fn sort(
        &mut self,
        table: OpId,
        keys: &[OpId],
        desc: &[bool],
        nulls_first: &[bool],
    ) -> Result<OpId> {
        if keys.is_empty() || keys.len() != desc.len() || keys.len() != nulls_first.len() {
            return Err(Error::Rank(format!(
                "sort wants matching key/desc/nulls arrays, got {}/{}/{}",
                keys.len(),
                desc.len(),
                nulls_first.len()
            )));
        }
        let rows = self.node(table).est_rows;
        Ok(self.push(
            OpNode {
                opcode: Opcode::Sort,
                arity: 1,
                flags: OpFlags::empty(),
                out_type: TypeTag::Table as i8,
                est_rows: rows,
                inputs: [table, OpId::NONE],
            },
            Some(ExtData::Sort {
                keys: keys.to_vec(),
                desc: desc.to_vec(),
                nulls_first: nulls_first.to_vec(),
            }),
        ))
    }

    pub fn join(
        &mut self,
        left: OpId,
        left_keys: &[OpId],
        right: OpId,
        right_keys: &[OpId],
        ty: JoinType,
    ) -> Result<OpId> {
        if left_keys.is_empty() || left_keys.len() != right_keys.len() {
            return Err(Error::Rank(format!(
                "join wants matching key lists, got {}/{}",
                left_keys.len(),
                right_keys.len()
            )));
        }
        let rows = self.node(left).est_rows.max(self.node(right).est_rows);
        Ok(self.push(
            OpNode {
                opcode: Opcode::Join,
                arity: 2,
                flags: OpFlags::empty(),
                out_type: TypeTag::Table as i8,
                est_rows: rows,
                inputs: [left, right],
            },
            Some(ExtData::Join {
                left_keys: left_keys.to_vec(),
                right_keys: right_keys.to_vec(),
                ty,
            }),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn window(
        &mut self,
        table: OpId,
        part: &[OpId],
        order: &[OpId],
        order_desc: &[bool],
        funcs: &[(WindowFunc, Option<OpId>)],
        frame: Frame,
    ) -> Result<OpId> {
        if order.len() != order_desc.len() {
            return Err(Error::Rank(format!(
                "window wants matching order/desc arrays, got {}/{}",
                order.len(),
                order_desc.len()
            )));
        }
        for (f, input) in funcs {
            if f.needs_input() && input.is_none() {
                return Err(Error::Rank(format!("window function {f:?} needs an input")));
            }
        }
        let rows = self.node(table).est_rows;
        Ok(self.push(
            OpNode {
                opcode: Opcode::Window,
                arity: 1,
                flags: OpFlags::empty(),
                out_type: TypeTag::Table as i8,
                est_rows: rows,
                inputs: [table, OpId::NONE],
            },
            Some(ExtData::Window {
                part: part.to_vec(),
                order: order.to_vec(),
                order_desc: order_desc.to_vec(),
                funcs: funcs.to_vec(),
                frame,
            }),
        ))
    }

    /// As-of window join: symbol equality plus a time key constrained to
    /// `[lo, hi]` around each left row's time.
    #[allow(clippy::too_many_arguments)]
    pub fn window_join(
        &mut self,
        left: OpId,
        right: OpId,
        time_key: OpId,
        sym_key: OpId,
        lo: i64,
        hi: i64,
        aggs: &[(AggOp, OpId)],
    ) -> Result<OpId> {
        let rows = self.node(left).est_rows;
        Ok(self.push(
            OpNode {
                opcode: Opcode::WindowJoin,
                arity: 2,
                flags: OpFlags::empty(),
                out_type: TypeTag::Table as i8,
                est_rows: rows,
                inputs: [left, right],
            },
            Some(ExtData::AsOf {
                time: time_key,
                sym: sym_key,
                lo,
                hi,
                aggs: aggs.to_vec(),
            }),
        ))
    }

    pub fn project(&mut self, input: OpId, cols: &[OpId]) -> Result<OpId> {
        self.projection(Opcode::Project, input, cols)
    }

    pub fn select(&mut self, input: OpId, cols: &[OpId]) -> Result<OpId> {
        self.projection(Opcode::Select, input, cols)
    }

    fn projection(&mut self, opcode: Opcode, input: OpId, cols: &[OpId]) -> Result<OpId> {
        if cols.is_empty() {
            return Err(Error::Rank("projection needs at least one column".into()));
        }
        let rows = self.node(input).est_rows;
        Ok(self.push(
            OpNode {
                opcode,
                arity: 1,
                flags: OpFlags::empty(),
                out_type: TypeTag::Table as i8,
                est_rows: rows,
                inputs: [input, OpId::NONE],
            },
            Some(ExtData::Cols(cols.to_vec())),
        ))
    }

    pub fn head(&mut self, input: OpId, n: i64) -> Result<OpId> {
        self.head_tail(Opcode::Head, input, n)
    }

    pub fn tail(&mut self, input: OpId, n: i64) -> Result<OpId> {
        self.head_tail(Opcode::Tail, input, n)
    }

    fn head_tail(&mut self, opcode: Opcode, input: OpId, n: i64) -> Result<OpId> {
        if n < 0 {
            return Err(Error::Range(format!("negative row count {n}")));
        }
        let out = self.node(input).out_type;
        let rows = (self.node(input).est_rows as i64).min(n) as u32;
        Ok(self.push(
            OpNode {
                opcode,
                arity: 1,
                flags: OpFlags::empty(),
                out_type: out,
                est_rows: rows,
                inputs: [input, OpId::NONE],
            },
            Some(ExtData::Count(n)),
        ))
    }

    /// A pure column reference by name, resolved against an operator's own
    /// table at execution time (join keys and as-of aggregate inputs reach
    /// into the right-hand table, which the bound table may not contain).
    pub fn col_ref(&mut self, name: &str) -> Result<OpId> {
        let name_id = sym::intern_str(name)?;
        Ok(self.push(
            OpNode {
                opcode: Opcode::Alias,
                arity: 0,
                flags: OpFlags::empty(),
                out_type: 0,
                est_rows: 0,
                inputs: [OpId::NONE; 2],
            },
            Some(ExtData::Name(name_id)),
        ))
    }

    /// Name a column expression for PROJECT / SELECT output.
    pub fn alias(&mut self, input: OpId, name: &str) -> Result<OpId> {
        let name_id = sym::intern_str(name)?;
        let out = self.node(input).out_type;
        let rows = self.node(input).est_rows;
        Ok(self.push(
            OpNode {
                opcode: Opcode::Alias,
                arity: 1,
                flags: OpFlags::empty(),
                out_type: out,
                est_rows: rows,
                inputs: [input, OpId::NONE],
            },
            Some(ExtData::Name(name_id)),
        ))
    }

    pub fn materialize(&mut self, input: OpId) -> Result<OpId> {
        let out = self.node(input).out_type;
        let rows = self.node(input).est_rows;
        Ok(self.push_simple(Opcode::Materialize, [input, OpId::NONE], 1, out, rows))
    }

    // ----- entry points -----

    /// Run the optimizer passes; returns the (possibly rewritten) root.
    pub fn optimize(&mut self, root: OpId) -> Result<OpId> {
        crate::optimizer::optimize(self, root)
    }

    /// Evaluate the graph rooted at `root` into a concrete value.
    pub fn execute(&mut self, root: OpId) -> Result<Value> {
        crate::exec::execute(self, root)
    }

    /// Human-readable plan dump.
    pub fn explain(&self, root: OpId) -> String {
        let mut out = String::new();
        use std::fmt::Write as _;
        let _ = writeln!(out, "plan (root {}):", root.0);
        for (i, n) in self.nodes.iter().enumerate() {
            let mut line = format!(
                "  [{i:>3}] {:?} out={} rows~{}",
                n.opcode, n.out_type, n.est_rows
            );
            if n.inputs[0] != OpId::NONE {
                line.push_str(&format!(" in0={}", n.inputs[0].0));
            }
            if n.inputs[1] != OpId::NONE {
                line.push_str(&format!(" in1={}", n.inputs[1].0));
            }
            if n.flags.contains(OpFlags::FUSED) {
                line.push_str(" [fused]");
            }
            if n.flags.contains(OpFlags::DEAD) {
                line.push_str(" [dead]");
            }
            let _ = writeln!(out, "{line}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Result<Value> {
        Value::table_from(
            &["id", "v"],
            vec![
                Value::i64_vec(&[1, 2, 3])?,
                Value::f64_vec(&[1.5, 2.5, 3.5])?,
            ],
        )
    }

    #[test]
    fn builders_stamp_output_types() -> Result<()> {
        let t = sample_table()?;
        let mut g = Graph::new(&t)?;
        let id = g.scan("id")?;
        let v = g.scan("v")?;
        assert_eq!(g.node(id).out_type, TypeTag::I64 as i8);
        let s = g.add(id, id)?;
        assert_eq!(g.node(s).out_type, TypeTag::I64 as i8);
        let d = g.div(id, id)?;
        assert_eq!(g.node(d).out_type, TypeTag::F64 as i8);
        let c = g.lt(id, v)?;
        assert_eq!(g.node(c).out_type, TypeTag::Bool as i8);
        Ok(())
    }

    #[test]
    fn atoms_stay_atoms_through_const_math() -> Result<()> {
        let mut g = Graph::unbound();
        let a = g.const_i64(2)?;
        let b = g.const_f64(3.0)?;
        let s = g.add(a, b)?;
        assert_eq!(g.node(s).out_type, -(TypeTag::F64 as i8));
        Ok(())
    }

    #[test]
    fn scan_unknown_column_fails() -> Result<()> {
        let t = sample_table()?;
        let mut g = Graph::new(&t)?;
        assert!(matches!(g.scan("nope"), Err(Error::Schema(_))));
        Ok(())
    }

    #[test]
    fn ternary_and_variadic_ride_ext_slots() -> Result<()> {
        let t = sample_table()?;
        let mut g = Graph::new(&t)?;
        let id = g.scan("id")?;
        let c1 = g.const_i64(0)?;
        let c2 = g.const_i64(9)?;
        let cond = g.gt(id, c1)?;
        let iff = g.if_(cond, id, c2)?;
        assert!(matches!(g.ext_of(iff), Some(ExtData::Ternary(_))));
        Ok(())
    }
}
